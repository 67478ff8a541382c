//! Secure shell transport
//!
//! The runner talks to nodes through three small traits so that the
//! polling and retry logic can be exercised without a real network.

pub mod openssh;

use async_trait::async_trait;
use fogfort_core::domain::node::SshConnectionParameters;
use thiserror::Error;

use crate::config::RunnerConfig;
use crate::log_store::ExecutionLog;

pub use openssh::OpenSshTransport;

/// Missing or invalid connection parameters. Never retried.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("no connection parameters available for node")]
    Missing,

    #[error("connection parameter '{0}' is required")]
    MissingField(&'static str),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("command failed to start: {0}")]
    Exec(String),

    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Validated connection target
#[derive(Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub private_key: String,
}

impl SshTarget {
    /// Checks that address, username and key are all present
    pub fn from_params(params: Option<&SshConnectionParameters>) -> Result<Self, ConnectionError> {
        let params = params.ok_or(ConnectionError::Missing)?;

        let host = non_blank(params.ip_address.as_deref()).ok_or(ConnectionError::MissingField("ip_address"))?;
        let username =
            non_blank(params.username.as_deref()).ok_or(ConnectionError::MissingField("username"))?;
        let private_key = non_blank(params.private_key.as_deref())
            .ok_or(ConnectionError::MissingField("private_key"))?;

        Ok(Self {
            host: host.to_string(),
            port: params.port_or_default(),
            username: username.to_string(),
            private_key: private_key.to_string(),
        })
    }

    /// `user@host` form used on the command line
    pub fn destination(&self) -> String {
        format!("{}@{}", self.username, self.host)
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

impl std::fmt::Debug for SshTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshTarget")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Opens sessions to nodes
#[async_trait]
pub trait ShellTransport: Send + Sync {
    async fn connect(
        &self,
        target: &SshTarget,
        config: &RunnerConfig,
    ) -> Result<Box<dyn ShellSession>, TransportError>;
}

/// An authenticated session able to run commands
#[async_trait]
pub trait ShellSession: Send {
    /// Starts `command`, streaming stdout and stderr into `log`
    async fn exec(
        &mut self,
        command: &str,
        log: ExecutionLog,
    ) -> Result<Box<dyn ShellChannel>, TransportError>;

    /// Tears the session down; called exactly once
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// A running command
#[async_trait]
pub trait ShellChannel: Send {
    /// Non-blocking completion check. `Ok(None)` while still running.
    async fn try_exit_status(&mut self) -> Result<Option<i32>, TransportError>;

    /// Releases the channel, terminating the command if it still runs
    async fn close(&mut self) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> SshConnectionParameters {
        SshConnectionParameters {
            ip_address: Some("10.0.0.5".to_string()),
            port: None,
            username: Some("ubuntu".to_string()),
            private_key: Some("-----BEGIN KEY-----".to_string()),
        }
    }

    #[test]
    fn test_target_from_complete_params() {
        let target = SshTarget::from_params(Some(&params())).unwrap();
        assert_eq!(target.port, 22);
        assert_eq!(target.destination(), "ubuntu@10.0.0.5");
    }

    #[test]
    fn test_target_requires_every_field() {
        assert_eq!(SshTarget::from_params(None), Err(ConnectionError::Missing));

        let mut p = params();
        p.ip_address = None;
        assert_eq!(
            SshTarget::from_params(Some(&p)),
            Err(ConnectionError::MissingField("ip_address"))
        );

        let mut p = params();
        p.username = Some("  ".to_string());
        assert_eq!(
            SshTarget::from_params(Some(&p)),
            Err(ConnectionError::MissingField("username"))
        );

        let mut p = params();
        p.private_key = None;
        assert_eq!(
            SshTarget::from_params(Some(&p)),
            Err(ConnectionError::MissingField("private_key"))
        );
    }

    #[test]
    fn test_target_debug_hides_key() {
        let target = SshTarget::from_params(Some(&params())).unwrap();
        assert!(!format!("{:?}", target).contains("BEGIN KEY"));
    }
}
