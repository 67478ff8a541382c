//! Remote command runner
//!
//! Runs one command on one node and always hands back a finished
//! [`TaskExecution`]. Every failure (bad parameters, unreachable host,
//! non-zero exit, timeout) becomes `success == false` plus an explanation in
//! the execution log; nothing is returned as an error.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use fogfort_core::domain::job::TaskExecution;
use fogfort_core::domain::node::SshConnectionParameters;
use tokio::time::Instant;

use crate::config::RunnerConfig;
use crate::log_store::{ExecutionLog, LogStore};
use crate::ssh::{ShellSession, ShellTransport, SshTarget, TransportError};

/// Executes commands on remote nodes
#[async_trait]
pub trait ScriptRunner: Send + Sync {
    /// Runs `command` and returns `execution` terminated with the outcome.
    ///
    /// Output goes to the log named by `execution.log_id()`. With no
    /// `timeout` the command is awaited indefinitely.
    async fn run(
        &self,
        command: &str,
        params: Option<&SshConnectionParameters>,
        execution: TaskExecution,
        timeout: Option<Duration>,
    ) -> TaskExecution;

    /// Store the execution logs are written to
    fn log_store(&self) -> Arc<dyn LogStore>;
}

/// [`ScriptRunner`] over a [`ShellTransport`]
pub struct CommandRunner {
    transport: Arc<dyn ShellTransport>,
    logs: Arc<dyn LogStore>,
    config: RunnerConfig,
}

impl CommandRunner {
    pub fn new(
        transport: Arc<dyn ShellTransport>,
        logs: Arc<dyn LogStore>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            transport,
            logs,
            config,
        }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    async fn run_on_target(
        &self,
        target: &SshTarget,
        command: &str,
        log: &ExecutionLog,
        timeout: Option<Duration>,
    ) -> bool {
        let mut session = match self.connect_with_retry(target, log).await {
            Ok(session) => session,
            Err(e) => {
                log.error(format!("Could not connect to {}: {}", target.host, e))
                    .await;
                return false;
            }
        };

        let success = self
            .exec_and_wait(session.as_mut(), command, log, timeout)
            .await;

        if let Err(e) = session.close().await {
            log.warn(format!("Failed to close session: {}", e)).await;
        }

        success
    }

    async fn connect_with_retry(
        &self,
        target: &SshTarget,
        log: &ExecutionLog,
    ) -> Result<Box<dyn ShellSession>, TransportError> {
        let attempts = self.config.connect_retries.max(1);
        let mut attempt = 1;

        loop {
            log.info(format!(
                "Connecting to {}:{} as {} (attempt {}/{})",
                target.host, target.port, target.username, attempt, attempts
            ))
            .await;

            match self.transport.connect(target, &self.config).await {
                Ok(session) => {
                    log.info("Connected").await;
                    return Ok(session);
                }
                Err(e) if attempt < attempts => {
                    log.warn(format!(
                        "Connection attempt {} failed: {}; retrying in {}s",
                        attempt,
                        e,
                        self.config.connect_backoff.as_secs()
                    ))
                    .await;
                    tokio::time::sleep(self.config.connect_backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Starts the command and polls it to completion or timeout.
    /// The channel is released on every path.
    async fn exec_and_wait(
        &self,
        session: &mut dyn ShellSession,
        command: &str,
        log: &ExecutionLog,
        timeout: Option<Duration>,
    ) -> bool {
        // The command text may carry secrets and marker templates; keep it out
        // of the execution log.
        tracing::debug!(log_id = %log.log_id(), "Executing command:\n{}", command);

        let mut channel = match session.exec(command, log.clone()).await {
            Ok(channel) => channel,
            Err(e) => {
                log.error(format!("Failed to start command: {}", e)).await;
                return false;
            }
        };

        let started = Instant::now();
        let exit_code = loop {
            match channel.try_exit_status().await {
                Ok(Some(code)) => break Some(code),
                Ok(None) => {}
                Err(e) => {
                    log.error(format!("Error while waiting for command: {}", e))
                        .await;
                    break None;
                }
            }

            let pause = match timeout {
                Some(limit) => {
                    let elapsed = started.elapsed();
                    if elapsed >= limit {
                        log.error(format!(
                            "Script execution timed out after {}ms",
                            limit.as_millis()
                        ))
                        .await;
                        break None;
                    }
                    self.config.poll_interval.min(limit - elapsed)
                }
                None => self.config.poll_interval,
            };

            tokio::time::sleep(pause).await;
        };

        if let Err(e) = channel.close().await {
            log.warn(format!("Failed to close channel: {}", e)).await;
        }

        match exit_code {
            Some(code) => {
                log.info(format!("Command exited with status {}", code)).await;
                code == 0
            }
            None => false,
        }
    }
}

#[async_trait]
impl ScriptRunner for CommandRunner {
    async fn run(
        &self,
        command: &str,
        params: Option<&SshConnectionParameters>,
        mut execution: TaskExecution,
        timeout: Option<Duration>,
    ) -> TaskExecution {
        execution.mark_started(Utc::now());
        let log = ExecutionLog::new(Arc::clone(&self.logs), execution.log_id());

        let success = match SshTarget::from_params(params) {
            Ok(target) => self.run_on_target(&target, command, &log, timeout).await,
            Err(e) => {
                log.error(format!("Invalid connection parameters: {}", e))
                    .await;
                false
            }
        };

        execution.finish(success, Utc::now());
        execution
    }

    fn log_store(&self) -> Arc<dyn LogStore> {
        Arc::clone(&self.logs)
    }
}
