//! Fogfort Runner
//!
//! Remote command execution for cluster bootstrap.
//!
//! This crate contains:
//! - `runner`: Runs a command on a node and reports a `TaskExecution` outcome
//! - `ssh`: The secure shell transport seam and its OpenSSH implementation
//! - `log_store`: Append-only per-execution logs
//! - `markers`: Extraction of `!!NEB_SCRIPT_RESULT_<KEY>:<VALUE>!!` results from logs

pub mod config;
pub mod log_store;
pub mod markers;
pub mod runner;
pub mod ssh;

pub use config::RunnerConfig;
pub use log_store::{ExecutionLog, FileLogStore, LogStore, LogStoreError, MemoryLogStore};
pub use runner::{CommandRunner, ScriptRunner};
