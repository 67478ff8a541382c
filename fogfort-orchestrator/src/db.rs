use sqlx::{PgPool, postgres::PgPoolOptions};
use std::time::Duration;

pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    // Create clusters table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS clusters (
            id UUID PRIMARY KEY,
            name VARCHAR(255) NOT NULL UNIQUE,
            master_node_name VARCHAR(255) NOT NULL,
            status VARCHAR(50) NOT NULL,
            env_vars JSONB NOT NULL DEFAULT '{}',
            created_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create nodes table; node names are unique across all clusters
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS nodes (
            id UUID PRIMARY KEY,
            cluster_id UUID NOT NULL REFERENCES clusters(id) ON DELETE CASCADE,
            position INTEGER NOT NULL,
            name VARCHAR(255) NOT NULL UNIQUE,
            provider_id VARCHAR(255),
            node_candidate JSONB NOT NULL,
            ssh_connection_parameters JSONB,
            node_url TEXT,
            status VARCHAR(50) NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create jobs table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id UUID PRIMARY KEY,
            job_type VARCHAR(50) NOT NULL,
            status VARCHAR(50) NOT NULL,
            created_at TIMESTAMPTZ NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL,
            ended_at TIMESTAMPTZ,
            cluster_id UUID REFERENCES clusters(id) ON DELETE SET NULL,
            variables JSONB NOT NULL DEFAULT '{}'
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create tasks table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tasks (
            id UUID PRIMARY KEY,
            job_id UUID NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
            target_node_id UUID,
            description TEXT NOT NULL,
            max_retries INTEGER NOT NULL DEFAULT 1,
            current_retry INTEGER NOT NULL DEFAULT 0,
            status VARCHAR(50) NOT NULL,
            created_at TIMESTAMPTZ NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL,
            ended_at TIMESTAMPTZ
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create task executions table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS task_executions (
            task_id UUID NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
            idx INTEGER NOT NULL,
            start_at TIMESTAMPTZ,
            end_at TIMESTAMPTZ,
            log_id VARCHAR(255) NOT NULL,
            success BOOLEAN NOT NULL DEFAULT FALSE,
            PRIMARY KEY (task_id, idx)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes for better query performance
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_nodes_cluster_id ON nodes(cluster_id, position)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_cluster_id ON jobs(cluster_id)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_created_at ON jobs(created_at DESC)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_job_id ON tasks(job_id, created_at)")
        .execute(pool)
        .await?;

    tracing::info!("Database migrations completed successfully");
    Ok(())
}
