//! Job Repository
//!
//! Handles database operations on the `jobs` table. Tasks are loaded
//! through the task repository.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use fogfort_core::domain::job::{Job, JobStatus, JobType};
use sqlx::PgConnection;
use uuid::Uuid;

use super::decode_error;

/// Insert a job row (without tasks)
pub async fn insert(conn: &mut PgConnection, job: &Job) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO jobs (id, job_type, status, created_at, updated_at, ended_at,
                          cluster_id, variables)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(job.id)
    .bind(job.job_type.as_str())
    .bind(status_to_string(job.status))
    .bind(job.created_at)
    .bind(job.updated_at)
    .bind(job.ended_at)
    .bind(job.cluster_id)
    .bind(serde_json::to_value(&job.variables).map_err(decode_error)?)
    .execute(conn)
    .await?;

    Ok(())
}

/// Find a job by ID; `tasks` is left empty
pub async fn find_by_id(conn: &mut PgConnection, id: Uuid) -> Result<Option<Job>, sqlx::Error> {
    let row = sqlx::query_as::<_, JobRow>(
        r#"
        SELECT id, job_type, status, created_at, updated_at, ended_at, cluster_id, variables
        FROM jobs
        WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(conn)
    .await?;

    Ok(row.map(|r| r.into()))
}

/// List all jobs, newest first; `tasks` is left empty
pub async fn list_all(conn: &mut PgConnection) -> Result<Vec<Job>, sqlx::Error> {
    let rows = sqlx::query_as::<_, JobRow>(
        r#"
        SELECT id, job_type, status, created_at, updated_at, ended_at, cluster_id, variables
        FROM jobs
        ORDER BY created_at DESC
        "#,
    )
    .fetch_all(conn)
    .await?;

    Ok(rows.into_iter().map(|r| r.into()).collect())
}

/// Lock a job row and return its status
pub async fn status_for_update(
    conn: &mut PgConnection,
    id: Uuid,
) -> Result<Option<JobStatus>, sqlx::Error> {
    let status: Option<String> =
        sqlx::query_scalar("SELECT status FROM jobs WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(conn)
            .await?;

    Ok(status.map(|s| string_to_status(&s)))
}

/// Update job status; `ended_at` is set once when a terminal status is reached
pub async fn update_status(
    conn: &mut PgConnection,
    id: Uuid,
    status: JobStatus,
) -> Result<(), sqlx::Error> {
    let now = Utc::now();

    sqlx::query(
        r#"
        UPDATE jobs
        SET status = $1,
            updated_at = $2,
            ended_at = CASE WHEN $3 THEN COALESCE(ended_at, $2) ELSE ended_at END
        WHERE id = $4
        "#,
    )
    .bind(status_to_string(status))
    .bind(now)
    .bind(status.is_terminal())
    .bind(id)
    .execute(conn)
    .await?;

    Ok(())
}

/// Set a single entry of the job's variable map
pub async fn set_variable(
    conn: &mut PgConnection,
    id: Uuid,
    key: &str,
    value: &str,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE jobs
        SET variables = variables || jsonb_build_object($1::text, $2::text),
            updated_at = $3
        WHERE id = $4
        "#,
    )
    .bind(key)
    .bind(value)
    .bind(Utc::now())
    .bind(id)
    .execute(conn)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Touch `updated_at`, e.g. after a task was appended
pub async fn touch(conn: &mut PgConnection, id: Uuid) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("UPDATE jobs SET updated_at = $1 WHERE id = $2")
        .bind(Utc::now())
        .bind(id)
        .execute(conn)
        .await?;

    Ok(result.rows_affected() > 0)
}

/// Count jobs whose status is one of `statuses`
pub async fn count_by_status(
    conn: &mut PgConnection,
    statuses: &[JobStatus],
) -> Result<i64, sqlx::Error> {
    let statuses: Vec<&str> = statuses.iter().map(|s| status_to_string(*s)).collect();

    sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE status = ANY($1)")
        .bind(statuses)
        .fetch_one(conn)
        .await
}

// =============================================================================
// Helper Functions
// =============================================================================

fn status_to_string(status: JobStatus) -> &'static str {
    status.as_str()
}

fn string_to_status(s: &str) -> JobStatus {
    JobStatus::parse(s)
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    job_type: String,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    cluster_id: Option<Uuid>,
    variables: serde_json::Value,
}

impl From<JobRow> for Job {
    fn from(row: JobRow) -> Self {
        let variables: HashMap<String, String> =
            serde_json::from_value(row.variables).unwrap_or_default();

        Job {
            id: row.id,
            job_type: JobType::parse(&row.job_type),
            status: string_to_status(&row.status),
            created_at: row.created_at,
            updated_at: row.updated_at,
            ended_at: row.ended_at,
            cluster_id: row.cluster_id,
            variables,
            tasks: Vec::new(),
        }
    }
}
