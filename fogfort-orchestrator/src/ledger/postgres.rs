//! PostgreSQL ledger
//!
//! Each method runs in its own transaction, committed before it returns.
//! Status changes lock the affected row with `SELECT ... FOR UPDATE` so the
//! transition guard and the write see the same value.

use async_trait::async_trait;
use chrono::Utc;
use fogfort_core::domain::cluster::{Cluster, ClusterStatus};
use fogfort_core::domain::job::{Job, JobStatus, JobType, Task, TaskExecution};
use fogfort_core::domain::node::Node;
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use super::{
    ClusterJobPlan, ClusterJobRequest, Ledger, LedgerError, NodeRef, NodeTaskTicket,
    ProvisioningOutcome, TaskHandle, check_transition, status_for,
};
use crate::repository::{cluster_repository, job_repository, node_repository, task_repository};

/// Ledger stored in PostgreSQL
#[derive(Clone)]
pub struct PostgresLedger {
    pool: PgPool,
}

impl PostgresLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Maps unique-constraint violations (cluster or node names) to `Conflict`
fn unique_violation_as_conflict(err: sqlx::Error, message: impl FnOnce() -> String) -> LedgerError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => LedgerError::Conflict(message()),
        _ => LedgerError::Database(err),
    }
}

async fn load_cluster(
    conn: &mut PgConnection,
    cluster: Option<Cluster>,
) -> Result<Option<Cluster>, LedgerError> {
    let Some(mut cluster) = cluster else {
        return Ok(None);
    };
    cluster.nodes = node_repository::find_by_cluster(conn, cluster.id).await?;
    Ok(Some(cluster))
}

async fn ensure_names_free(conn: &mut PgConnection, nodes: &[Node]) -> Result<(), LedgerError> {
    let mut names: Vec<String> = Vec::with_capacity(nodes.len());
    for node in nodes {
        if names.contains(&node.name) {
            return Err(LedgerError::Conflict(format!(
                "node name '{}' is already in use",
                node.name
            )));
        }
        names.push(node.name.clone());
    }

    let taken = node_repository::find_existing_names(conn, &names).await?;
    if let Some(name) = taken.first() {
        return Err(LedgerError::Conflict(format!(
            "node name '{}' is already in use",
            name
        )));
    }
    Ok(())
}

async fn insert_nodes(
    conn: &mut PgConnection,
    cluster_id: Uuid,
    nodes: &[Node],
) -> Result<(), LedgerError> {
    let mut position = node_repository::next_position(&mut *conn, cluster_id).await?;
    for node in nodes {
        node_repository::insert(&mut *conn, cluster_id, position, node)
            .await
            .map_err(|e| {
                unique_violation_as_conflict(e, || {
                    format!("node name '{}' is already in use", node.name)
                })
            })?;
        position += 1;
    }
    Ok(())
}

async fn insert_task(conn: &mut PgConnection, task: &Task) -> Result<(), LedgerError> {
    if !job_repository::touch(&mut *conn, task.job_id).await? {
        return Err(LedgerError::not_found("job", task.job_id));
    }
    task_repository::insert(conn, task).await?;
    Ok(())
}

/// Merges `outcome` into execution 0 and closes the task
async fn merge_first_execution(
    conn: &mut PgConnection,
    task_id: Uuid,
    outcome: &TaskExecution,
) -> Result<(), LedgerError> {
    let current = task_repository::status_for_update(&mut *conn, task_id)
        .await?
        .ok_or_else(|| LedgerError::not_found("task", task_id))?;

    let mut execution = task_repository::find_execution_for_update(&mut *conn, task_id, 0)
        .await?
        .ok_or_else(|| LedgerError::not_found("task execution", format!("{}/0", task_id)))?;
    execution.update_with(outcome);

    let status = status_for(&execution);
    check_transition("task", task_id, current, status)?;

    task_repository::update_execution(&mut *conn, task_id, 0, &execution).await?;
    task_repository::update_status(conn, task_id, status, execution.end()).await?;
    Ok(())
}

#[async_trait]
impl Ledger for PostgresLedger {
    async fn insert_cluster(&self, cluster: &Cluster) -> Result<(), LedgerError> {
        let mut tx = self.pool.begin().await?;

        if cluster_repository::find_by_name(&mut *tx, &cluster.name)
            .await?
            .is_some()
        {
            return Err(LedgerError::Conflict(format!(
                "cluster '{}' already exists",
                cluster.name
            )));
        }
        ensure_names_free(&mut *tx, &cluster.nodes).await?;

        cluster_repository::insert(&mut *tx, cluster)
            .await
            .map_err(|e| {
                unique_violation_as_conflict(e, || {
                    format!("cluster '{}' already exists", cluster.name)
                })
            })?;
        insert_nodes(&mut *tx, cluster.id, &cluster.nodes).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn find_cluster(&self, id: Uuid) -> Result<Option<Cluster>, LedgerError> {
        let mut tx = self.pool.begin().await?;
        let cluster = cluster_repository::find_by_id(&mut *tx, id).await?;
        let cluster = load_cluster(&mut *tx, cluster).await?;
        tx.commit().await?;
        Ok(cluster)
    }

    async fn find_cluster_by_name(&self, name: &str) -> Result<Option<Cluster>, LedgerError> {
        let mut tx = self.pool.begin().await?;
        let cluster = cluster_repository::find_by_name(&mut *tx, name).await?;
        let cluster = load_cluster(&mut *tx, cluster).await?;
        tx.commit().await?;
        Ok(cluster)
    }

    async fn list_clusters(&self) -> Result<Vec<Cluster>, LedgerError> {
        let mut tx = self.pool.begin().await?;
        let mut clusters = cluster_repository::list_all(&mut *tx).await?;
        for cluster in &mut clusters {
            cluster.nodes = node_repository::find_by_cluster(&mut *tx, cluster.id).await?;
        }
        tx.commit().await?;
        Ok(clusters)
    }

    async fn existing_node_names(&self, names: &[String]) -> Result<Vec<String>, LedgerError> {
        let mut conn = self.pool.acquire().await?;
        Ok(node_repository::find_existing_names(&mut *conn, names).await?)
    }

    async fn set_cluster_status(
        &self,
        id: Uuid,
        status: ClusterStatus,
    ) -> Result<(), LedgerError> {
        let mut tx = self.pool.begin().await?;
        if !cluster_repository::update_status(&mut *tx, id, status).await? {
            return Err(LedgerError::not_found("cluster", id));
        }
        tx.commit().await?;
        Ok(())
    }

    async fn compare_and_set_cluster_status(
        &self,
        id: Uuid,
        from: &[ClusterStatus],
        to: ClusterStatus,
    ) -> Result<bool, LedgerError> {
        let mut tx = self.pool.begin().await?;
        let current = cluster_repository::status_for_update(&mut *tx, id)
            .await?
            .ok_or_else(|| LedgerError::not_found("cluster", id))?;

        if !from.contains(&current) {
            tx.rollback().await?;
            return Ok(false);
        }

        cluster_repository::update_status(&mut *tx, id, to).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn add_nodes(&self, cluster_id: Uuid, nodes: &[Node]) -> Result<(), LedgerError> {
        let mut tx = self.pool.begin().await?;
        if cluster_repository::status_for_update(&mut *tx, cluster_id)
            .await?
            .is_none()
        {
            return Err(LedgerError::not_found("cluster", cluster_id));
        }
        ensure_names_free(&mut *tx, nodes).await?;
        insert_nodes(&mut *tx, cluster_id, nodes).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn remove_node(&self, node_id: Uuid) -> Result<(), LedgerError> {
        let mut tx = self.pool.begin().await?;
        if !node_repository::delete(&mut *tx, node_id).await? {
            return Err(LedgerError::not_found("node", node_id));
        }
        tx.commit().await?;
        Ok(())
    }

    async fn delete_cluster(&self, id: Uuid) -> Result<(), LedgerError> {
        let mut tx = self.pool.begin().await?;
        if !cluster_repository::delete(&mut *tx, id).await? {
            return Err(LedgerError::not_found("cluster", id));
        }
        tx.commit().await?;
        Ok(())
    }

    async fn find_node(&self, id: Uuid) -> Result<Option<Node>, LedgerError> {
        let mut conn = self.pool.acquire().await?;
        Ok(node_repository::find_by_id(&mut *conn, id)
            .await?
            .map(|(_, node)| node))
    }

    async fn create_job(
        &self,
        job_type: JobType,
        status: JobStatus,
        cluster_id: Option<Uuid>,
    ) -> Result<Uuid, LedgerError> {
        let mut tx = self.pool.begin().await?;
        if let Some(cluster_id) = cluster_id {
            if cluster_repository::find_by_id(&mut *tx, cluster_id)
                .await?
                .is_none()
            {
                return Err(LedgerError::not_found("cluster", cluster_id));
            }
        }
        let job = Job::new(job_type, status, cluster_id);
        job_repository::insert(&mut *tx, &job).await?;
        tx.commit().await?;
        Ok(job.id)
    }

    async fn add_task(
        &self,
        job_id: Uuid,
        description: &str,
        target_node_id: Option<Uuid>,
    ) -> Result<TaskHandle, LedgerError> {
        let task = Task::new(job_id, description, target_node_id);
        let mut tx = self.pool.begin().await?;
        insert_task(&mut *tx, &task).await?;
        tx.commit().await?;

        Ok(TaskHandle {
            task_id: task.id,
            execution: task.executions[0].clone(),
        })
    }

    async fn record_execution_result(
        &self,
        task_id: Uuid,
        index: usize,
        outcome: &TaskExecution,
    ) -> Result<(), LedgerError> {
        let idx = i32::try_from(index).map_err(|_| {
            LedgerError::not_found("task execution", format!("{}/{}", task_id, index))
        })?;

        let mut tx = self.pool.begin().await?;
        let mut execution = task_repository::find_execution_for_update(&mut *tx, task_id, idx)
            .await?
            .ok_or_else(|| {
                LedgerError::not_found("task execution", format!("{}/{}", task_id, index))
            })?;
        execution.update_with(outcome);
        task_repository::update_execution(&mut *tx, task_id, idx, &execution).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn set_job_status(&self, job_id: Uuid, status: JobStatus) -> Result<(), LedgerError> {
        let mut tx = self.pool.begin().await?;
        let current = job_repository::status_for_update(&mut *tx, job_id)
            .await?
            .ok_or_else(|| LedgerError::not_found("job", job_id))?;
        check_transition("job", job_id, current, status)?;
        job_repository::update_status(&mut *tx, job_id, status).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn set_task_status(&self, task_id: Uuid, status: JobStatus) -> Result<(), LedgerError> {
        let mut tx = self.pool.begin().await?;
        let current = task_repository::status_for_update(&mut *tx, task_id)
            .await?
            .ok_or_else(|| LedgerError::not_found("task", task_id))?;
        check_transition("task", task_id, current, status)?;
        let ended_at = status.is_terminal().then(Utc::now);
        task_repository::update_status(&mut *tx, task_id, status, ended_at).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn set_job_variable(
        &self,
        job_id: Uuid,
        key: &str,
        value: &str,
    ) -> Result<(), LedgerError> {
        let mut tx = self.pool.begin().await?;
        if !job_repository::set_variable(&mut *tx, job_id, key, value).await? {
            return Err(LedgerError::not_found("job", job_id));
        }
        tx.commit().await?;
        Ok(())
    }

    async fn find_job(&self, id: Uuid) -> Result<Option<Job>, LedgerError> {
        let mut tx = self.pool.begin().await?;
        let Some(mut job) = job_repository::find_by_id(&mut *tx, id).await? else {
            return Ok(None);
        };
        job.tasks = task_repository::find_by_job(&mut *tx, id).await?;
        tx.commit().await?;
        Ok(Some(job))
    }

    async fn list_jobs(&self) -> Result<Vec<Job>, LedgerError> {
        let mut tx = self.pool.begin().await?;
        let mut jobs = job_repository::list_all(&mut *tx).await?;
        for job in &mut jobs {
            job.tasks = task_repository::find_by_job(&mut *tx, job.id).await?;
        }
        tx.commit().await?;
        Ok(jobs)
    }

    async fn find_task(&self, id: Uuid) -> Result<Option<Task>, LedgerError> {
        let mut conn = self.pool.acquire().await?;
        Ok(task_repository::find_by_id(&mut *conn, id).await?)
    }

    async fn count_jobs_by_status(&self, statuses: &[JobStatus]) -> Result<usize, LedgerError> {
        let mut conn = self.pool.acquire().await?;
        let count = job_repository::count_by_status(&mut *conn, statuses).await?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    async fn begin_cluster_job(
        &self,
        request: &ClusterJobRequest,
    ) -> Result<ClusterJobPlan, LedgerError> {
        let mut tx = self.pool.begin().await?;
        let cluster = cluster_repository::find_by_id(&mut *tx, request.cluster_id).await?;
        let cluster = load_cluster(&mut *tx, cluster)
            .await?
            .ok_or_else(|| LedgerError::not_found("cluster", request.cluster_id))?;

        let master = NodeRef::from(cluster.master_node()?);
        let workers = match &request.worker_ids {
            None => cluster.worker_nodes().into_iter().map(NodeRef::from).collect(),
            Some(ids) => ids
                .iter()
                .map(|id| {
                    cluster
                        .nodes
                        .iter()
                        .find(|n| n.id == *id)
                        .map(NodeRef::from)
                        .ok_or_else(|| LedgerError::not_found("node", id))
                })
                .collect::<Result<Vec<_>, _>>()?,
        };

        let job = Job::new(request.job_type, JobStatus::Created, Some(cluster.id));
        job_repository::insert(&mut *tx, &job).await?;
        tx.commit().await?;

        Ok(ClusterJobPlan {
            job_id: job.id,
            cluster_id: cluster.id,
            cluster_name: cluster.name,
            master,
            workers,
            env_vars: cluster.env_vars,
        })
    }

    async fn begin_node_task(
        &self,
        job_id: Uuid,
        node_id: Uuid,
        description: &str,
    ) -> Result<NodeTaskTicket, LedgerError> {
        let mut tx = self.pool.begin().await?;
        let (_, node) = node_repository::find_by_id(&mut *tx, node_id)
            .await?
            .ok_or_else(|| LedgerError::not_found("node", node_id))?;

        let task = Task::new(job_id, description, Some(node_id));
        insert_task(&mut *tx, &task).await?;
        tx.commit().await?;

        Ok(NodeTaskTicket {
            task_id: task.id,
            execution: task.executions[0].clone(),
            node,
        })
    }

    async fn finish_provisioning(
        &self,
        task_id: Uuid,
        node_id: Uuid,
        outcome: &ProvisioningOutcome,
    ) -> Result<(), LedgerError> {
        let mut tx = self.pool.begin().await?;

        let (_, mut node) = node_repository::find_by_id(&mut *tx, node_id)
            .await?
            .ok_or_else(|| LedgerError::not_found("node", node_id))?;
        let moved = match &outcome.details {
            Some(details) => node.mark_created(details.clone()),
            None => node.mark_failed(),
        };
        if !moved {
            return Err(LedgerError::Conflict(format!(
                "node {} already left PENDING (status {})",
                node.name,
                node.status.as_str()
            )));
        }

        merge_first_execution(&mut *tx, task_id, &outcome.execution).await?;
        node_repository::update(&mut *tx, &node).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn finish_task(
        &self,
        task_id: Uuid,
        outcome: &TaskExecution,
    ) -> Result<(), LedgerError> {
        let mut tx = self.pool.begin().await?;
        merge_first_execution(&mut *tx, task_id, outcome).await?;
        tx.commit().await?;
        Ok(())
    }
}
