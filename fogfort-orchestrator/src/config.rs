//! Orchestrator configuration
//!
//! Defines the configurable parameters of the orchestrator process: storage,
//! HTTP binding, provisioning inventory, bootstrap scripts, and the settings
//! handed down to the remote command runner.

use fogfort_runner::RunnerConfig;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::service::deploy::{DeploySettings, WorkerFailurePolicy};

/// Orchestrator configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection string; `None` keeps the ledger in memory
    pub database_url: Option<String>,

    /// Address the HTTP API listens on
    pub bind_addr: String,

    /// Directory of the per-execution log files
    pub log_dir: PathBuf,

    /// JSON host inventory for the `inventory` provider
    pub inventory_path: Option<PathBuf>,

    /// Directory overriding the built-in bootstrap scripts
    pub script_dir: Option<PathBuf>,

    /// Upper bound on concurrently running node pipelines
    pub max_parallel_pipelines: usize,

    /// Per-script timeout; `None` waits indefinitely
    pub script_timeout: Option<Duration>,

    pub poll_interval: Duration,

    pub connect_retries: u32,

    pub connect_backoff: Duration,

    pub worker_failure_policy: WorkerFailurePolicy,
}

impl Config {
    /// Creates a new configuration with defaults
    pub fn new() -> Self {
        Self {
            database_url: None,
            bind_addr: "0.0.0.0:8080".to_string(),
            log_dir: PathBuf::from("./logs"),
            inventory_path: None,
            script_dir: None,
            max_parallel_pipelines: 8,
            script_timeout: None,
            poll_interval: Duration::from_millis(2000),
            connect_retries: 3,
            connect_backoff: Duration::from_secs(5),
            worker_failure_policy: WorkerFailurePolicy::BestEffort,
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Expected environment variables (all optional):
    /// - DATABASE_URL
    /// - ORCHESTRATOR_BIND_ADDR (default: 0.0.0.0:8080)
    /// - FOGFORT_LOG_DIR (default: ./logs)
    /// - FOGFORT_INVENTORY
    /// - FOGFORT_SCRIPT_DIR
    /// - FOGFORT_MAX_PARALLEL_PIPELINES (default: 8)
    /// - FOGFORT_SCRIPT_TIMEOUT (seconds, default: none)
    /// - FOGFORT_POLL_INTERVAL (milliseconds, default: 2000)
    /// - FOGFORT_CONNECT_RETRIES (default: 3)
    /// - FOGFORT_CONNECT_BACKOFF (seconds, default: 5)
    /// - FOGFORT_WORKER_FAILURE_POLICY (best-effort | strict, default: best-effort)
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a configuration from any key lookup, starting from the defaults
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::new();
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        config.database_url = var("DATABASE_URL");
        if let Some(addr) = var("ORCHESTRATOR_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Some(dir) = var("FOGFORT_LOG_DIR") {
            config.log_dir = PathBuf::from(dir);
        }
        config.inventory_path = var("FOGFORT_INVENTORY").map(PathBuf::from);
        config.script_dir = var("FOGFORT_SCRIPT_DIR").map(PathBuf::from);

        let number = |key: &str| var(key).map(|raw| (key.to_string(), raw));

        if let Some(n) = parse_number::<usize>(number("FOGFORT_MAX_PARALLEL_PIPELINES"))? {
            config.max_parallel_pipelines = n;
        }
        config.script_timeout =
            parse_number::<u64>(number("FOGFORT_SCRIPT_TIMEOUT"))?.map(Duration::from_secs);
        if let Some(ms) = parse_number::<u64>(number("FOGFORT_POLL_INTERVAL"))? {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(n) = parse_number::<u32>(number("FOGFORT_CONNECT_RETRIES"))? {
            config.connect_retries = n;
        }
        if let Some(secs) = parse_number::<u64>(number("FOGFORT_CONNECT_BACKOFF"))? {
            config.connect_backoff = Duration::from_secs(secs);
        }
        if let Some(policy) = var("FOGFORT_WORKER_FAILURE_POLICY") {
            config.worker_failure_policy = WorkerFailurePolicy::parse(&policy).ok_or_else(|| {
                anyhow::anyhow!(
                    "FOGFORT_WORKER_FAILURE_POLICY must be 'best-effort' or 'strict', got '{}'",
                    policy
                )
            })?;
        }

        Ok(config)
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.bind_addr.is_empty() {
            anyhow::bail!("bind_addr cannot be empty");
        }

        if self.max_parallel_pipelines == 0 {
            anyhow::bail!("max_parallel_pipelines must be greater than 0");
        }

        if self.script_timeout.is_some_and(|t| t.is_zero()) {
            anyhow::bail!("script_timeout must be greater than 0 when set");
        }

        self.runner_config().validate()
    }

    /// Settings handed to the remote command runner
    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig::new()
            .with_poll_interval(self.poll_interval)
            .with_connect_retries(self.connect_retries, self.connect_backoff)
    }

    /// Settings handed to the deployment orchestrator
    pub fn deploy_settings(&self) -> DeploySettings {
        DeploySettings {
            max_parallel_pipelines: self.max_parallel_pipelines,
            script_timeout: self.script_timeout,
            worker_failure_policy: self.worker_failure_policy,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_number<T: FromStr>(entry: Option<(String, String)>) -> anyhow::Result<Option<T>> {
    let Some((key, raw)) = entry else {
        return Ok(None);
    };
    raw.trim()
        .parse::<T>()
        .map(Some)
        .map_err(|_| anyhow::anyhow!("{} must be a non-negative integer, got '{}'", key, raw))
}
