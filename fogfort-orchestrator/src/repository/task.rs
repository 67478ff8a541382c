//! Task Repository
//!
//! Handles database operations on the `tasks` and `task_executions` tables.
//! Executions are addressed by `(task_id, idx)` where `idx` is the position
//! in the task's retry history.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use fogfort_core::domain::job::{JobStatus, Task, TaskExecution};
use sqlx::PgConnection;
use uuid::Uuid;

/// Insert a task together with its executions
pub async fn insert(conn: &mut PgConnection, task: &Task) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO tasks (id, job_id, target_node_id, description, max_retries,
                           current_retry, status, created_at, updated_at, ended_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(task.id)
    .bind(task.job_id)
    .bind(task.target_node_id)
    .bind(&task.description)
    .bind(task.max_retries as i32)
    .bind(task.current_retry as i32)
    .bind(status_to_string(task.status))
    .bind(task.created_at)
    .bind(task.updated_at)
    .bind(task.ended_at)
    .execute(&mut *conn)
    .await?;

    for (idx, execution) in task.executions.iter().enumerate() {
        insert_execution(&mut *conn, task.id, idx as i32, execution).await?;
    }

    Ok(())
}

async fn insert_execution(
    conn: &mut PgConnection,
    task_id: Uuid,
    idx: i32,
    execution: &TaskExecution,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO task_executions (task_id, idx, start_at, end_at, log_id, success)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(task_id)
    .bind(idx)
    .bind(execution.start())
    .bind(execution.end())
    .bind(execution.log_id())
    .bind(execution.success())
    .execute(conn)
    .await?;

    Ok(())
}

/// Find a task by ID with its executions
pub async fn find_by_id(conn: &mut PgConnection, id: Uuid) -> Result<Option<Task>, sqlx::Error> {
    let row = sqlx::query_as::<_, TaskRow>(
        r#"
        SELECT id, job_id, target_node_id, description, max_retries, current_retry,
               status, created_at, updated_at, ended_at
        FROM tasks
        WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let mut executions = find_executions(&mut *conn, &[id]).await?;
    let mut task: Task = row.into();
    task.executions = executions.remove(&id).unwrap_or_default();
    Ok(Some(task))
}

/// All tasks of a job in creation order, with executions
pub async fn find_by_job(conn: &mut PgConnection, job_id: Uuid) -> Result<Vec<Task>, sqlx::Error> {
    let rows = sqlx::query_as::<_, TaskRow>(
        r#"
        SELECT id, job_id, target_node_id, description, max_retries, current_retry,
               status, created_at, updated_at, ended_at
        FROM tasks
        WHERE job_id = $1
        ORDER BY created_at ASC, id ASC
        "#,
    )
    .bind(job_id)
    .fetch_all(&mut *conn)
    .await?;

    let ids: Vec<Uuid> = rows.iter().map(|r| r.id).collect();
    let mut executions = find_executions(&mut *conn, &ids).await?;

    Ok(rows
        .into_iter()
        .map(|row| {
            let id = row.id;
            let mut task: Task = row.into();
            task.executions = executions.remove(&id).unwrap_or_default();
            task
        })
        .collect())
}

async fn find_executions(
    conn: &mut PgConnection,
    task_ids: &[Uuid],
) -> Result<HashMap<Uuid, Vec<TaskExecution>>, sqlx::Error> {
    let rows = sqlx::query_as::<_, ExecutionRow>(
        r#"
        SELECT task_id, idx, start_at, end_at, log_id, success
        FROM task_executions
        WHERE task_id = ANY($1)
        ORDER BY task_id, idx ASC
        "#,
    )
    .bind(task_ids)
    .fetch_all(conn)
    .await?;

    let mut by_task: HashMap<Uuid, Vec<TaskExecution>> = HashMap::new();
    for row in rows {
        by_task.entry(row.task_id).or_default().push(row.into());
    }
    Ok(by_task)
}

/// Lock a task row and return its status
pub async fn status_for_update(
    conn: &mut PgConnection,
    id: Uuid,
) -> Result<Option<JobStatus>, sqlx::Error> {
    let status: Option<String> =
        sqlx::query_scalar("SELECT status FROM tasks WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(conn)
            .await?;

    Ok(status.map(|s| string_to_status(&s)))
}

/// Update task status and timestamps
pub async fn update_status(
    conn: &mut PgConnection,
    id: Uuid,
    status: JobStatus,
    ended_at: Option<DateTime<Utc>>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE tasks
        SET status = $1, updated_at = $2, ended_at = COALESCE($3, ended_at)
        WHERE id = $4
        "#,
    )
    .bind(status_to_string(status))
    .bind(ended_at.unwrap_or_else(Utc::now))
    .bind(ended_at)
    .bind(id)
    .execute(conn)
    .await?;

    Ok(())
}

/// Lock and load one execution
pub async fn find_execution_for_update(
    conn: &mut PgConnection,
    task_id: Uuid,
    idx: i32,
) -> Result<Option<TaskExecution>, sqlx::Error> {
    let row = sqlx::query_as::<_, ExecutionRow>(
        r#"
        SELECT task_id, idx, start_at, end_at, log_id, success
        FROM task_executions
        WHERE task_id = $1 AND idx = $2
        FOR UPDATE
        "#,
    )
    .bind(task_id)
    .bind(idx)
    .fetch_optional(conn)
    .await?;

    Ok(row.map(|r| r.into()))
}

/// Overwrite one execution with an already merged value
pub async fn update_execution(
    conn: &mut PgConnection,
    task_id: Uuid,
    idx: i32,
    execution: &TaskExecution,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE task_executions
        SET start_at = $1, end_at = $2, log_id = $3, success = $4
        WHERE task_id = $5 AND idx = $6
        "#,
    )
    .bind(execution.start())
    .bind(execution.end())
    .bind(execution.log_id())
    .bind(execution.success())
    .bind(task_id)
    .bind(idx)
    .execute(conn)
    .await?;

    Ok(())
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
struct TaskRow {
    id: Uuid,
    job_id: Uuid,
    target_node_id: Option<Uuid>,
    description: String,
    max_retries: i32,
    current_retry: i32,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
}

impl From<TaskRow> for Task {
    fn from(row: TaskRow) -> Self {
        Task {
            id: row.id,
            job_id: row.job_id,
            target_node_id: row.target_node_id,
            description: row.description,
            max_retries: row.max_retries.max(0) as u32,
            current_retry: row.current_retry.max(0) as u32,
            status: string_to_status(&row.status),
            created_at: row.created_at,
            updated_at: row.updated_at,
            ended_at: row.ended_at,
            executions: Vec::new(),
        }
    }
}

#[derive(sqlx::FromRow)]
struct ExecutionRow {
    task_id: Uuid,
    #[allow(dead_code)]
    idx: i32,
    start_at: Option<DateTime<Utc>>,
    end_at: Option<DateTime<Utc>>,
    log_id: String,
    success: bool,
}

impl From<ExecutionRow> for TaskExecution {
    fn from(row: ExecutionRow) -> Self {
        TaskExecution::from_parts(row.start_at, row.end_at, row.log_id, row.success)
    }
}
