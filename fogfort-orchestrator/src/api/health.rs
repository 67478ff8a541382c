//! Health Check API Handler
//!
//! Liveness plus the number of jobs still running.

use axum::{Json, extract::State};
use serde::Serialize;

use crate::api::AppState;
use crate::api::error::ApiResult;

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub active_jobs: usize,
}

/// GET /health
/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> ApiResult<Json<HealthStatus>> {
    let active_jobs = state.jobs.active_job_count().await?;
    Ok(Json(HealthStatus {
        status: "OK",
        active_jobs,
    }))
}
