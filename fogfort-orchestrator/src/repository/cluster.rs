//! Cluster Repository
//!
//! Handles database operations on the `clusters` table. Nodes are loaded
//! separately through the node repository.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use fogfort_core::domain::cluster::{Cluster, ClusterStatus};
use sqlx::PgConnection;
use uuid::Uuid;

/// Insert a cluster row (without nodes)
pub async fn insert(conn: &mut PgConnection, cluster: &Cluster) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO clusters (id, name, master_node_name, status, env_vars, created_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(cluster.id)
    .bind(&cluster.name)
    .bind(&cluster.master_node_name)
    .bind(status_to_string(cluster.status))
    .bind(serde_json::to_value(&cluster.env_vars).map_err(super::decode_error)?)
    .bind(cluster.created_at)
    .execute(conn)
    .await?;

    Ok(())
}

/// Find a cluster by ID; `nodes` is left empty
pub async fn find_by_id(conn: &mut PgConnection, id: Uuid) -> Result<Option<Cluster>, sqlx::Error> {
    let row = sqlx::query_as::<_, ClusterRow>(
        r#"
        SELECT id, name, master_node_name, status, env_vars, created_at
        FROM clusters
        WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(conn)
    .await?;

    Ok(row.map(|r| r.into()))
}

/// Find a cluster by name; `nodes` is left empty
pub async fn find_by_name(
    conn: &mut PgConnection,
    name: &str,
) -> Result<Option<Cluster>, sqlx::Error> {
    let row = sqlx::query_as::<_, ClusterRow>(
        r#"
        SELECT id, name, master_node_name, status, env_vars, created_at
        FROM clusters
        WHERE name = $1
        "#,
    )
    .bind(name)
    .fetch_optional(conn)
    .await?;

    Ok(row.map(|r| r.into()))
}

/// List all clusters, oldest first; `nodes` is left empty
pub async fn list_all(conn: &mut PgConnection) -> Result<Vec<Cluster>, sqlx::Error> {
    let rows = sqlx::query_as::<_, ClusterRow>(
        r#"
        SELECT id, name, master_node_name, status, env_vars, created_at
        FROM clusters
        ORDER BY created_at ASC
        "#,
    )
    .fetch_all(conn)
    .await?;

    Ok(rows.into_iter().map(|r| r.into()).collect())
}

/// Lock a cluster row and return its status
pub async fn status_for_update(
    conn: &mut PgConnection,
    id: Uuid,
) -> Result<Option<ClusterStatus>, sqlx::Error> {
    let status: Option<String> =
        sqlx::query_scalar("SELECT status FROM clusters WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(conn)
            .await?;

    Ok(status.map(|s| string_to_status(&s)))
}

/// Update cluster status
pub async fn update_status(
    conn: &mut PgConnection,
    id: Uuid,
    status: ClusterStatus,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("UPDATE clusters SET status = $1 WHERE id = $2")
        .bind(status_to_string(status))
        .bind(id)
        .execute(conn)
        .await?;

    Ok(result.rows_affected() > 0)
}

/// Delete a cluster; nodes cascade, jobs keep a NULL reference
pub async fn delete(conn: &mut PgConnection, id: Uuid) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM clusters WHERE id = $1")
        .bind(id)
        .execute(conn)
        .await?;

    Ok(result.rows_affected() > 0)
}

// =============================================================================
// Helper Functions
// =============================================================================

fn status_to_string(status: ClusterStatus) -> &'static str {
    status.as_str()
}

fn string_to_status(s: &str) -> ClusterStatus {
    ClusterStatus::parse(s).unwrap_or(ClusterStatus::Failed)
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct ClusterRow {
    id: Uuid,
    name: String,
    master_node_name: String,
    status: String,
    env_vars: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl From<ClusterRow> for Cluster {
    fn from(row: ClusterRow) -> Self {
        let env_vars: HashMap<String, String> =
            serde_json::from_value(row.env_vars).unwrap_or_default();

        Cluster {
            id: row.id,
            name: row.name,
            master_node_name: row.master_node_name,
            nodes: Vec::new(),
            status: string_to_status(&row.status),
            env_vars,
            created_at: row.created_at,
        }
    }
}
