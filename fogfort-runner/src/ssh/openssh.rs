//! OpenSSH transport
//!
//! Drives the system `ssh` client. `connect` authenticates once and leaves a
//! multiplexing master running on a private control socket. Every `exec`
//! rides that socket, and `close` asks the master to exit. The private key
//! and the socket live in a temporary directory that is removed with the
//! session.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use super::{ShellChannel, ShellSession, ShellTransport, SshTarget, TransportError};
use crate::config::RunnerConfig;
use crate::log_store::ExecutionLog;

/// Grace period on top of `ConnectTimeout` before the handshake is abandoned
const CONNECT_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Default, Clone, Copy)]
pub struct OpenSshTransport;

impl OpenSshTransport {
    pub fn new() -> Self {
        Self
    }
}

/// Options shared by the master connection
fn connection_args(target: &SshTarget, key_path: &Path, config: &RunnerConfig) -> Vec<String> {
    vec![
        "-p".to_string(),
        target.port.to_string(),
        "-o".to_string(),
        "BatchMode=yes".to_string(),
        "-o".to_string(),
        "StrictHostKeyChecking=no".to_string(),
        "-o".to_string(),
        "UserKnownHostsFile=/dev/null".to_string(),
        "-o".to_string(),
        format!("ConnectTimeout={}", config.connect_timeout.as_secs().max(1)),
        "-o".to_string(),
        "ServerAliveInterval=15".to_string(),
        "-o".to_string(),
        "IdentitiesOnly=yes".to_string(),
        "-i".to_string(),
        key_path.to_string_lossy().into_owned(),
    ]
}

/// Options that route a command through an existing master
fn multiplexed_args(control_path: &Path, port: u16) -> Vec<String> {
    vec![
        "-S".to_string(),
        control_path.to_string_lossy().into_owned(),
        "-o".to_string(),
        "ControlMaster=no".to_string(),
        "-o".to_string(),
        "BatchMode=yes".to_string(),
        "-p".to_string(),
        port.to_string(),
    ]
}

async fn write_private_key(path: &Path, key: &str) -> std::io::Result<()> {
    let mut contents = key.to_string();
    if !contents.ends_with('\n') {
        contents.push('\n');
    }
    tokio::fs::write(path, contents).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    }

    Ok(())
}

#[async_trait]
impl ShellTransport for OpenSshTransport {
    async fn connect(
        &self,
        target: &SshTarget,
        config: &RunnerConfig,
    ) -> Result<Box<dyn ShellSession>, TransportError> {
        let workdir = tempfile::Builder::new().prefix("fogfort-ssh-").tempdir()?;
        let key_path = workdir.path().join("id_key");
        let control_path = workdir.path().join("control.sock");
        let stderr_path = workdir.path().join("connect.err");

        write_private_key(&key_path, &target.private_key).await?;

        // The backgrounded master keeps its stderr; a pipe would never reach EOF.
        let stderr_file = std::fs::File::create(&stderr_path)?;

        let mut cmd = Command::new(&config.ssh_binary);
        cmd.arg("-f")
            .arg("-N")
            .args(["-o", "ControlMaster=yes", "-o", "ControlPersist=yes"])
            .arg("-o")
            .arg(format!("ControlPath={}", control_path.display()))
            .args(connection_args(target, &key_path, config))
            .arg(target.destination())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(stderr_file))
            .kill_on_drop(true);

        tracing::debug!("Opening ssh master connection to {}", target.destination());

        let status = tokio::time::timeout(config.connect_timeout + CONNECT_GRACE, cmd.status())
            .await
            .map_err(|_| {
                TransportError::Connect(format!("handshake with {} timed out", target.host))
            })??;

        if !status.success() {
            let detail = tokio::fs::read_to_string(&stderr_path)
                .await
                .unwrap_or_default();
            return Err(TransportError::Connect(format!(
                "ssh to {} exited with {}: {}",
                target.destination(),
                status,
                detail.trim()
            )));
        }

        Ok(Box::new(OpenSshSession {
            ssh_binary: config.ssh_binary.clone(),
            control_path,
            destination: target.destination(),
            port: target.port,
            workdir: Some(workdir),
        }))
    }
}

struct OpenSshSession {
    ssh_binary: PathBuf,
    control_path: PathBuf,
    destination: String,
    port: u16,
    /// `None` once closed
    workdir: Option<TempDir>,
}

impl OpenSshSession {
    fn exit_master_args(&self) -> Vec<String> {
        let mut args = multiplexed_args(&self.control_path, self.port);
        args.extend(["-O".to_string(), "exit".to_string(), self.destination.clone()]);
        args
    }
}

#[async_trait]
impl ShellSession for OpenSshSession {
    async fn exec(
        &mut self,
        command: &str,
        log: ExecutionLog,
    ) -> Result<Box<dyn ShellChannel>, TransportError> {
        if self.workdir.is_none() {
            return Err(TransportError::Exec("session already closed".to_string()));
        }

        let mut child = Command::new(&self.ssh_binary)
            .args(multiplexed_args(&self.control_path, self.port))
            .arg(&self.destination)
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TransportError::Exec(e.to_string()))?;

        let mut pumps = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            pumps.push(pump_lines(stdout, log.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(pump_lines(stderr, log));
        }

        Ok(Box::new(OpenSshChannel { child, pumps }))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        let Some(workdir) = self.workdir.take() else {
            return Ok(());
        };

        let status = Command::new(&self.ssh_binary)
            .args(self.exit_master_args())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;

        drop(workdir);

        match status {
            Ok(s) if s.success() => Ok(()),
            Ok(s) => Err(TransportError::Connect(format!(
                "ssh master for {} did not exit cleanly: {}",
                self.destination, s
            ))),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for OpenSshSession {
    fn drop(&mut self) {
        if self.workdir.is_some() {
            let _ = std::process::Command::new(&self.ssh_binary)
                .args(self.exit_master_args())
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn();
        }
    }
}

/// Copies whole lines so stdout and stderr never interleave mid-line
fn pump_lines<R>(reader: R, log: ExecutionLog) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut line = Vec::new();
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    if !line.ends_with(b"\n") {
                        line.push(b'\n');
                    }
                    log.append_raw(&line).await;
                }
                Err(e) => {
                    log.warn(format!("Output stream error: {}", e)).await;
                    break;
                }
            }
        }
    })
}

struct OpenSshChannel {
    child: Child,
    pumps: Vec<JoinHandle<()>>,
}

#[async_trait]
impl ShellChannel for OpenSshChannel {
    async fn try_exit_status(&mut self) -> Result<Option<i32>, TransportError> {
        match self.child.try_wait()? {
            Some(status) => {
                // Drain remaining output before the caller reads the log
                for pump in self.pumps.drain(..) {
                    let _ = pump.await;
                }
                Ok(Some(status.code().unwrap_or(-1)))
            }
            None => Ok(None),
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.child.try_wait()?.is_none() {
            self.child.kill().await?;
        }
        for pump in self.pumps.drain(..) {
            pump.abort();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> SshTarget {
        SshTarget {
            host: "10.0.0.5".to_string(),
            port: 2222,
            username: "ubuntu".to_string(),
            private_key: "KEY".to_string(),
        }
    }

    #[test]
    fn test_connection_args() {
        let config = RunnerConfig::default();
        let args = connection_args(&target(), Path::new("/tmp/k"), &config);
        assert!(args.windows(2).any(|w| w == ["-p", "2222"]));
        assert!(args.windows(2).any(|w| w == ["-i", "/tmp/k"]));
        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(args.contains(&"ConnectTimeout=30".to_string()));
    }

    #[test]
    fn test_multiplexed_args_use_control_socket() {
        let args = multiplexed_args(Path::new("/tmp/s.sock"), 22);
        assert!(args.windows(2).any(|w| w == ["-S", "/tmp/s.sock"]));
        assert!(args.contains(&"ControlMaster=no".to_string()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_private_key_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key");
        write_private_key(&path, "secret").await.unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "secret\n");
    }

    #[tokio::test]
    async fn test_pump_lines_appends_each_line() {
        use crate::log_store::{LogStore, MemoryLogStore};
        use std::sync::Arc;

        let store = Arc::new(MemoryLogStore::new());
        let log = ExecutionLog::new(store.clone(), "p.log");
        let input: &[u8] = b"one\ntwo";
        pump_lines(input, log).await.unwrap();

        let content = store.read("p.log").await.unwrap().unwrap();
        assert_eq!(content, b"one\ntwo\n");
    }
}
