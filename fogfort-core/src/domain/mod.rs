//! Core domain types
//!
//! These types represent the fundamental business entities and are shared
//! between the orchestrator (which persists them) and the runner (which
//! records remote execution attempts into them).

pub mod cluster;
pub mod job;
pub mod node;
