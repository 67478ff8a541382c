//! API Module
//!
//! HTTP API layer for the orchestrator.
//! Each submodule handles endpoints for a specific domain.

pub mod cluster;
pub mod error;
pub mod health;
pub mod job;

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::service::cluster::ClusterService;
use crate::service::job::JobService;

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub clusters: Arc<ClusterService>,
    pub jobs: Arc<JobService>,
}

/// Create the main API router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health::health_check))
        // Cluster endpoints
        .route("/cluster", post(cluster::define_cluster))
        .route("/cluster/list", get(cluster::list_clusters))
        .route(
            "/cluster/{name}",
            get(cluster::get_cluster).delete(cluster::delete_cluster),
        )
        .route("/cluster/{name}/deploy", post(cluster::deploy_cluster))
        .route("/cluster/{name}/scale-out", post(cluster::scale_out))
        .route("/cluster/{name}/scale-in", post(cluster::scale_in))
        // Job endpoints
        .route("/job/list", get(job::list_jobs))
        .route("/job/{id}", get(job::get_job))
        .route(
            "/job/task/{task_id}/execution/{index}/log",
            get(job::get_execution_log),
        )
        // Add state and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
