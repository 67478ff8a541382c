//! Repository Module
//!
//! Data access layer for the PostgreSQL ledger.
//! Each repository handles statements for one table and works on a
//! connection borrowed from the caller's transaction.

pub mod cluster;
pub mod job;
pub mod node;
pub mod task;

// Re-export for convenience
pub use cluster as cluster_repository;
pub use job as job_repository;
pub use node as node_repository;
pub use task as task_repository;

/// Wraps a JSON column that no longer deserializes into the expected type
pub(crate) fn decode_error(err: serde_json::Error) -> sqlx::Error {
    sqlx::Error::Decode(Box::new(err))
}
