//! Node Repository
//!
//! Handles database operations on the `nodes` table.

use fogfort_core::domain::node::{Node, NodeCandidate, NodeStatus, SshConnectionParameters};
use sqlx::PgConnection;
use uuid::Uuid;

use super::decode_error;

/// Insert a node of a cluster at the given position
pub async fn insert(
    conn: &mut PgConnection,
    cluster_id: Uuid,
    position: i32,
    node: &Node,
) -> Result<(), sqlx::Error> {
    let ssh = node
        .ssh_connection_parameters
        .as_ref()
        .map(serde_json::to_value)
        .transpose()
        .map_err(decode_error)?;

    sqlx::query(
        r#"
        INSERT INTO nodes (id, cluster_id, position, name, provider_id, node_candidate,
                           ssh_connection_parameters, node_url, status)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(node.id)
    .bind(cluster_id)
    .bind(position)
    .bind(&node.name)
    .bind(&node.provider_id)
    .bind(serde_json::to_value(&node.node_candidate).map_err(decode_error)?)
    .bind(ssh)
    .bind(&node.node_url)
    .bind(status_to_string(node.status))
    .execute(conn)
    .await?;

    Ok(())
}

/// Position after the last node of a cluster
pub async fn next_position(conn: &mut PgConnection, cluster_id: Uuid) -> Result<i32, sqlx::Error> {
    sqlx::query_scalar("SELECT COALESCE(MAX(position), -1) + 1 FROM nodes WHERE cluster_id = $1")
        .bind(cluster_id)
        .fetch_one(conn)
        .await
}

/// All nodes of a cluster, in definition order
pub async fn find_by_cluster(
    conn: &mut PgConnection,
    cluster_id: Uuid,
) -> Result<Vec<Node>, sqlx::Error> {
    let rows = sqlx::query_as::<_, NodeRow>(
        r#"
        SELECT id, cluster_id, name, provider_id, node_candidate,
               ssh_connection_parameters, node_url, status
        FROM nodes
        WHERE cluster_id = $1
        ORDER BY position ASC
        "#,
    )
    .bind(cluster_id)
    .fetch_all(conn)
    .await?;

    rows.into_iter().map(Node::try_from).collect()
}

/// Find a node by ID together with its cluster ID
pub async fn find_by_id(
    conn: &mut PgConnection,
    id: Uuid,
) -> Result<Option<(Uuid, Node)>, sqlx::Error> {
    let row = sqlx::query_as::<_, NodeRow>(
        r#"
        SELECT id, cluster_id, name, provider_id, node_candidate,
               ssh_connection_parameters, node_url, status
        FROM nodes
        WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(conn)
    .await?;

    row.map(|r| {
        let cluster_id = r.cluster_id;
        Node::try_from(r).map(|node| (cluster_id, node))
    })
    .transpose()
}

/// Which of `names` exist in any cluster
pub async fn find_existing_names(
    conn: &mut PgConnection,
    names: &[String],
) -> Result<Vec<String>, sqlx::Error> {
    sqlx::query_scalar("SELECT name FROM nodes WHERE name = ANY($1) ORDER BY name")
        .bind(names)
        .fetch_all(conn)
        .await
}

/// Persist provisioning fields and status
pub async fn update(conn: &mut PgConnection, node: &Node) -> Result<bool, sqlx::Error> {
    let ssh = node
        .ssh_connection_parameters
        .as_ref()
        .map(serde_json::to_value)
        .transpose()
        .map_err(decode_error)?;

    let result = sqlx::query(
        r#"
        UPDATE nodes
        SET provider_id = $1, ssh_connection_parameters = $2, node_url = $3, status = $4
        WHERE id = $5
        "#,
    )
    .bind(&node.provider_id)
    .bind(ssh)
    .bind(&node.node_url)
    .bind(status_to_string(node.status))
    .bind(node.id)
    .execute(conn)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Delete a node by ID
pub async fn delete(conn: &mut PgConnection, id: Uuid) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM nodes WHERE id = $1")
        .bind(id)
        .execute(conn)
        .await?;

    Ok(result.rows_affected() > 0)
}

// =============================================================================
// Helper Functions
// =============================================================================

fn status_to_string(status: NodeStatus) -> &'static str {
    status.as_str()
}

fn string_to_status(s: &str) -> NodeStatus {
    NodeStatus::parse(s).unwrap_or(NodeStatus::Failed)
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct NodeRow {
    id: Uuid,
    cluster_id: Uuid,
    name: String,
    provider_id: Option<String>,
    node_candidate: serde_json::Value,
    ssh_connection_parameters: Option<serde_json::Value>,
    node_url: Option<String>,
    status: String,
}

impl TryFrom<NodeRow> for Node {
    type Error = sqlx::Error;

    fn try_from(row: NodeRow) -> Result<Self, Self::Error> {
        let node_candidate: NodeCandidate =
            serde_json::from_value(row.node_candidate).map_err(decode_error)?;
        let ssh_connection_parameters: Option<SshConnectionParameters> = row
            .ssh_connection_parameters
            .map(serde_json::from_value)
            .transpose()
            .map_err(decode_error)?;

        Ok(Node {
            id: row.id,
            provider_id: row.provider_id,
            name: row.name,
            node_candidate,
            ssh_connection_parameters,
            node_url: row.node_url,
            status: string_to_status(&row.status),
        })
    }
}
