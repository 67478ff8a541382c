//! Fogfort Core
//!
//! Core types for the Fogfort cluster provisioning system.
//!
//! This crate contains:
//! - Domain types: Clusters, nodes, and the job/task ledger records
//! - DTOs: Request and response shapes exchanged with the orchestrator API

pub mod domain;
pub mod dto;
