//! Service Module
//!
//! Business logic layer for the orchestrator.
//! Services sit between the API and the ledger; `deploy` holds the
//! workflows that touch nodes.

pub mod cluster;
pub mod deploy;
pub mod job;
pub mod scripts;

#[cfg(test)]
pub(crate) mod testing;

// Re-export for convenience
pub use cluster as cluster_service;
pub use deploy as deploy_service;
pub use job as job_service;
