//! Job API Handlers
//!
//! HTTP endpoints for inspecting jobs and execution logs.

use axum::{
    Json,
    extract::{Path, State},
    http::header,
    response::IntoResponse,
};
use fogfort_core::domain::job::Job;
use uuid::Uuid;

use crate::api::AppState;
use crate::api::error::ApiResult;

/// GET /job/list
/// List all jobs, newest first
pub async fn list_jobs(State(state): State<AppState>) -> ApiResult<Json<Vec<Job>>> {
    tracing::debug!("Listing all jobs");

    let jobs = state.jobs.list_jobs().await?;
    Ok(Json(jobs))
}

/// GET /job/{id}
/// Get job details with tasks and executions
pub async fn get_job(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<Job>> {
    tracing::debug!("Getting job: {}", id);

    let job = state.jobs.get_job(id).await?;
    Ok(Json(job))
}

/// GET /job/task/{task_id}/execution/{index}/log
/// Raw output of one task execution
pub async fn get_execution_log(
    State(state): State<AppState>,
    Path((task_id, index)): Path<(Uuid, usize)>,
) -> ApiResult<impl IntoResponse> {
    tracing::debug!("Getting log of execution {} of task {}", index, task_id);

    let bytes = state.jobs.read_execution_log(task_id, index).await?;
    let text = String::from_utf8_lossy(&bytes).into_owned();

    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], text))
}
