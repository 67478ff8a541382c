//! Data Transfer Objects
//!
//! Request and response bodies exchanged with the orchestrator API.
//! DTOs carry only what a caller supplies or needs back, never internal ids
//! the caller cannot know yet.

pub mod cluster;
pub mod job;
