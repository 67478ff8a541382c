//! Cluster API Handlers
//!
//! HTTP endpoints for cluster definitions and the jobs acting on them.
//! Clusters are always returned without private keys.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use fogfort_core::domain::cluster::Cluster;
use fogfort_core::dto::cluster::{ClusterDefinition, ScaleInRequest, ScaleOutRequest};
use fogfort_core::dto::job::JobLaunched;

use crate::api::AppState;
use crate::api::error::ApiResult;

// =============================================================================
// Definition Endpoints
// =============================================================================

/// POST /cluster
/// Define a new cluster
pub async fn define_cluster(
    State(state): State<AppState>,
    Json(def): Json<ClusterDefinition>,
) -> ApiResult<(StatusCode, Json<Cluster>)> {
    tracing::info!("Defining cluster: {}", def.name);

    let cluster = state.clusters.define_cluster(def).await?;

    Ok((StatusCode::CREATED, Json(cluster.without_secrets())))
}

/// GET /cluster/list
/// List all clusters
pub async fn list_clusters(State(state): State<AppState>) -> ApiResult<Json<Vec<Cluster>>> {
    tracing::debug!("Listing clusters");

    let clusters = state.clusters.list_clusters().await?;

    Ok(Json(clusters.iter().map(Cluster::without_secrets).collect()))
}

/// GET /cluster/{name}
/// Get a cluster with its nodes
pub async fn get_cluster(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<Cluster>> {
    tracing::debug!("Getting cluster: {}", name);

    let cluster = state.clusters.get_cluster(&name).await?;

    Ok(Json(cluster.without_secrets()))
}

// =============================================================================
// Job-launching Endpoints
// =============================================================================

/// POST /cluster/{name}/deploy
/// Start deploying a defined cluster
pub async fn deploy_cluster(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<(StatusCode, Json<JobLaunched>)> {
    tracing::info!("Deploying cluster: {}", name);

    let job_id = state.clusters.deploy_cluster(&name).await?;

    Ok((StatusCode::ACCEPTED, Json(JobLaunched { job_id })))
}

/// POST /cluster/{name}/scale-out
/// Add worker nodes to a running cluster
pub async fn scale_out(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<ScaleOutRequest>,
) -> ApiResult<(StatusCode, Json<JobLaunched>)> {
    tracing::info!("Scaling out cluster {} by {} node(s)", name, req.nodes.len());

    let job_id = state.clusters.scale_out(&name, req).await?;

    Ok((StatusCode::ACCEPTED, Json(JobLaunched { job_id })))
}

/// POST /cluster/{name}/scale-in
/// Remove worker nodes from a running cluster
pub async fn scale_in(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<ScaleInRequest>,
) -> ApiResult<(StatusCode, Json<JobLaunched>)> {
    tracing::info!("Scaling in cluster {}: {:?}", name, req.node_names);

    let job_id = state.clusters.scale_in(&name, req).await?;

    Ok((StatusCode::ACCEPTED, Json(JobLaunched { job_id })))
}

/// DELETE /cluster/{name}
/// Release all nodes and delete the cluster
pub async fn delete_cluster(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<(StatusCode, Json<JobLaunched>)> {
    tracing::info!("Deleting cluster: {}", name);

    let job_id = state.clusters.delete_cluster(&name).await?;

    Ok((StatusCode::ACCEPTED, Json(JobLaunched { job_id })))
}
