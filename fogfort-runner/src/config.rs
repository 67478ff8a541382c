//! Runner configuration
//!
//! Connection retry, polling and transport settings for remote commands.

use std::path::PathBuf;
use std::time::Duration;

/// Remote command runner configuration
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// How often a running command is checked for completion
    pub poll_interval: Duration,

    /// Connection attempts before a run is declared failed
    pub connect_retries: u32,

    /// Pause between two connection attempts
    pub connect_backoff: Duration,

    /// Handshake timeout of a single connection attempt
    pub connect_timeout: Duration,

    /// Path of the OpenSSH client binary
    pub ssh_binary: PathBuf,
}

impl RunnerConfig {
    /// Creates a configuration with defaults
    pub fn new() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            connect_retries: 3,
            connect_backoff: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(30),
            ssh_binary: PathBuf::from("ssh"),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_connect_retries(mut self, retries: u32, backoff: Duration) -> Self {
        self.connect_retries = retries;
        self.connect_backoff = backoff;
        self
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.poll_interval.is_zero() {
            anyhow::bail!("poll_interval must be greater than 0");
        }

        if self.connect_retries == 0 {
            anyhow::bail!("connect_retries must be at least 1");
        }

        if self.connect_timeout.is_zero() {
            anyhow::bail!("connect_timeout must be greater than 0");
        }

        if self.ssh_binary.as_os_str().is_empty() {
            anyhow::bail!("ssh_binary cannot be empty");
        }

        Ok(())
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self::new()
    }
}
