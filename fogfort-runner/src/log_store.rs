//! Execution log storage
//!
//! Every task execution owns an append-only log addressed by its log id.
//! The runner streams command output into it and the result marker
//! protocol reads it back.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};

#[derive(Debug, Error)]
pub enum LogStoreError {
    #[error("invalid log id: {0:?}")]
    InvalidLogId(String),

    #[error("log I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Append-only byte sink keyed by log id
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Appends bytes, creating the log on first write
    async fn append(&self, log_id: &str, bytes: &[u8]) -> Result<(), LogStoreError>;

    /// Reads a whole log. `Ok(None)` when it was never written.
    async fn read(&self, log_id: &str) -> Result<Option<Vec<u8>>, LogStoreError>;
}

/// Log ids become file names, so they are restricted to a safe alphabet.
fn validate_log_id(log_id: &str) -> Result<(), LogStoreError> {
    let valid = !log_id.is_empty()
        && !log_id.starts_with('.')
        && log_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));

    if valid {
        Ok(())
    } else {
        Err(LogStoreError::InvalidLogId(log_id.to_string()))
    }
}

// =============================================================================
// File-backed store
// =============================================================================

/// Stores each log as a file under a base directory
#[derive(Debug)]
pub struct FileLogStore {
    base_dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileLogStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn path_for(&self, log_id: &str) -> Result<PathBuf, LogStoreError> {
        validate_log_id(log_id)?;
        Ok(self.base_dir.join(log_id))
    }
}

#[async_trait]
impl LogStore for FileLogStore {
    async fn append(&self, log_id: &str, bytes: &[u8]) -> Result<(), LogStoreError> {
        let path = self.path_for(log_id)?;

        // stdout and stderr pumps write concurrently
        let _guard = self.write_lock.lock().await;
        tokio::fs::create_dir_all(&self.base_dir).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        Ok(())
    }

    async fn read(&self, log_id: &str) -> Result<Option<Vec<u8>>, LogStoreError> {
        let path = self.path_for(log_id)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

// =============================================================================
// In-memory store
// =============================================================================

/// Keeps logs in memory; used when no log directory is configured and in tests
#[derive(Debug, Default)]
pub struct MemoryLogStore {
    logs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn append(&self, log_id: &str, bytes: &[u8]) -> Result<(), LogStoreError> {
        validate_log_id(log_id)?;
        let mut logs = self.logs.write().await;
        logs.entry(log_id.to_string())
            .or_default()
            .extend_from_slice(bytes);
        Ok(())
    }

    async fn read(&self, log_id: &str) -> Result<Option<Vec<u8>>, LogStoreError> {
        validate_log_id(log_id)?;
        let logs = self.logs.read().await;
        Ok(logs.get(log_id).cloned())
    }
}

// =============================================================================
// Execution log handle
// =============================================================================

#[derive(Debug, Clone, Copy)]
enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    fn as_str(self) -> &'static str {
        match self {
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
        }
    }
}

/// Writer for one execution's log
///
/// Diagnostic lines are timestamped and mirrored to `tracing`. Raw command
/// output is appended untouched. Write failures are reported through
/// `tracing` and never abort the caller.
#[derive(Clone)]
pub struct ExecutionLog {
    store: Arc<dyn LogStore>,
    log_id: String,
}

impl ExecutionLog {
    pub fn new(store: Arc<dyn LogStore>, log_id: impl Into<String>) -> Self {
        Self {
            store,
            log_id: log_id.into(),
        }
    }

    pub fn log_id(&self) -> &str {
        &self.log_id
    }

    pub async fn debug(&self, message: impl AsRef<str>) {
        self.line(Level::Debug, message.as_ref()).await;
    }

    pub async fn info(&self, message: impl AsRef<str>) {
        self.line(Level::Info, message.as_ref()).await;
    }

    pub async fn warn(&self, message: impl AsRef<str>) {
        self.line(Level::Warn, message.as_ref()).await;
    }

    pub async fn error(&self, message: impl AsRef<str>) {
        self.line(Level::Error, message.as_ref()).await;
    }

    /// Appends command output as-is
    pub async fn append_raw(&self, bytes: &[u8]) {
        if let Err(e) = self.store.append(&self.log_id, bytes).await {
            tracing::warn!("Failed to append to execution log {}: {}", self.log_id, e);
        }
    }

    async fn line(&self, level: Level, message: &str) {
        match level {
            Level::Debug => tracing::debug!(log_id = %self.log_id, "{}", message),
            Level::Info => tracing::info!(log_id = %self.log_id, "{}", message),
            Level::Warn => tracing::warn!(log_id = %self.log_id, "{}", message),
            Level::Error => tracing::error!(log_id = %self.log_id, "{}", message),
        }

        let line = format!(
            "{} [{}] {}\n",
            Utc::now().to_rfc3339(),
            level.as_str(),
            message
        );
        self.append_raw(line.as_bytes()).await;
    }
}

impl std::fmt::Debug for ExecutionLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionLog")
            .field("log_id", &self.log_id)
            .finish()
    }
}
