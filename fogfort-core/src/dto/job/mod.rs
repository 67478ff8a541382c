//! Job DTOs

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Returned by operations that start a background job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobLaunched {
    pub job_id: Uuid,
}
