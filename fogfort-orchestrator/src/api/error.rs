//! API Error Handling
//!
//! Unified error types and conversion for API responses.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::ledger::LedgerError;
use crate::service::cluster::ClusterError;
use crate::service::job::JobError;

/// API error type
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    LedgerError(LedgerError),
    InternalError(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::LedgerError(err) => {
                tracing::error!("Ledger error: {:?}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
            ApiError::InternalError(msg) => {
                tracing::error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::NotFound { entity, id } => {
                ApiError::NotFound(format!("{} {} not found", entity, id))
            }
            LedgerError::Conflict(msg) => ApiError::Conflict(msg),
            err @ LedgerError::InvalidTransition { .. } => ApiError::Conflict(err.to_string()),
            other => ApiError::LedgerError(other),
        }
    }
}

impl From<ClusterError> for ApiError {
    fn from(err: ClusterError) -> Self {
        match err {
            ClusterError::NotFound(msg) => ApiError::NotFound(msg),
            ClusterError::Validation(msg) => ApiError::BadRequest(msg),
            ClusterError::Conflict(msg) => ApiError::Conflict(msg),
            ClusterError::Ledger(err) => err.into(),
        }
    }
}

impl From<JobError> for ApiError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::NotFound(id) => ApiError::NotFound(format!("Job {} not found", id)),
            JobError::TaskNotFound(id) => ApiError::NotFound(format!("Task {} not found", id)),
            JobError::ExecutionNotFound { task_id, index } => ApiError::NotFound(format!(
                "Execution {} of task {} not found",
                index, task_id
            )),
            JobError::LogUnavailable(msg) => ApiError::InternalError(msg),
            JobError::Ledger(err) => err.into(),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        let cases = [
            (ApiError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (ApiError::BadRequest("x".into()), StatusCode::BAD_REQUEST),
            (ApiError::Conflict("x".into()), StatusCode::CONFLICT),
            (
                ApiError::InternalError("x".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(err.into_response().status(), status);
        }
    }

    #[test]
    fn test_cluster_errors_map_to_http() {
        let err: ApiError = ClusterError::Validation("bad name".into()).into();
        assert!(matches!(err, ApiError::BadRequest(m) if m == "bad name"));

        let err: ApiError = ClusterError::Ledger(LedgerError::Conflict("taken".into())).into();
        assert!(matches!(err, ApiError::Conflict(m) if m == "taken"));
    }
}
