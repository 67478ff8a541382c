//! Ledger
//!
//! Persistent record of clusters, nodes, jobs, tasks and task executions.
//!
//! Every method is one short atomic unit of work. Callers never hold a
//! ledger transaction (or lock) while talking to a node or a provisioner:
//! remote calls sit between two separate ledger calls. The "unit of work"
//! methods at the bottom of [`Ledger`] bundle the reads and writes the
//! orchestrator needs on either side of such a call and hand back plain
//! request/response structs.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use fogfort_core::domain::cluster::{Cluster, ClusterModelError, ClusterStatus};
use fogfort_core::domain::job::{Job, JobStatus, JobType, Task, TaskExecution};
use fogfort_core::domain::node::{Node, ProvisionedNode};
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

pub use memory::MemoryLedger;
pub use postgres::PostgresLedger;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("{entity} {id} cannot move from {from} to {to}")]
    InvalidTransition {
        entity: &'static str,
        id: Uuid,
        from: String,
        to: String,
    },

    #[error("{0}")]
    Conflict(String),

    #[error(transparent)]
    Model(#[from] ClusterModelError),

    #[error("corrupt ledger record: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl LedgerError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        LedgerError::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

/// Identity of a node captured when a job starts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRef {
    pub id: Uuid,
    pub name: String,
}

impl From<&Node> for NodeRef {
    fn from(node: &Node) -> Self {
        Self {
            id: node.id,
            name: node.name.clone(),
        }
    }
}

/// Request to open a job against a cluster
#[derive(Debug, Clone)]
pub struct ClusterJobRequest {
    pub job_type: JobType,
    pub cluster_id: Uuid,
    /// Workers the job acts on; `None` selects every worker of the cluster
    pub worker_ids: Option<Vec<Uuid>>,
}

/// Snapshot taken in the same unit of work that created the job
#[derive(Debug, Clone)]
pub struct ClusterJobPlan {
    pub job_id: Uuid,
    pub cluster_id: Uuid,
    pub cluster_name: String,
    pub master: NodeRef,
    pub workers: Vec<NodeRef>,
    pub env_vars: HashMap<String, String>,
}

/// A freshly created task plus what is needed to act on its node
#[derive(Debug, Clone)]
pub struct NodeTaskTicket {
    pub task_id: Uuid,
    /// Execution 0 of the task, start already recorded
    pub execution: TaskExecution,
    pub node: Node,
}

/// Handle returned by [`Ledger::add_task`]
#[derive(Debug, Clone)]
pub struct TaskHandle {
    pub task_id: Uuid,
    pub execution: TaskExecution,
}

/// Outcome of a `create_node` call, folded into the ledger afterwards
#[derive(Debug, Clone)]
pub struct ProvisioningOutcome {
    pub execution: TaskExecution,
    /// Present exactly when provisioning succeeded
    pub details: Option<ProvisionedNode>,
}

/// Task status implied by a terminated execution
pub fn status_for(execution: &TaskExecution) -> JobStatus {
    if execution.success() {
        JobStatus::Completed
    } else {
        JobStatus::Failed
    }
}

/// Guards every job and task status change
pub fn check_transition(
    entity: &'static str,
    id: Uuid,
    from: JobStatus,
    to: JobStatus,
) -> Result<(), LedgerError> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(LedgerError::InvalidTransition {
            entity,
            id,
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

/// Storage of the orchestration record
#[async_trait]
pub trait Ledger: Send + Sync {
    // -------------------------------------------------------------------------
    // Clusters and nodes
    // -------------------------------------------------------------------------

    /// Stores a cluster and its nodes. Fails with `Conflict` when the cluster
    /// name or any node name is already taken.
    async fn insert_cluster(&self, cluster: &Cluster) -> Result<(), LedgerError>;

    async fn find_cluster(&self, id: Uuid) -> Result<Option<Cluster>, LedgerError>;

    async fn find_cluster_by_name(&self, name: &str) -> Result<Option<Cluster>, LedgerError>;

    async fn list_clusters(&self) -> Result<Vec<Cluster>, LedgerError>;

    /// Which of `names` are already used by a node of any cluster
    async fn existing_node_names(&self, names: &[String]) -> Result<Vec<String>, LedgerError>;

    async fn set_cluster_status(&self, id: Uuid, status: ClusterStatus)
    -> Result<(), LedgerError>;

    /// Moves the cluster to `to` only if its status is one of `from`.
    /// Returns whether the change was applied.
    async fn compare_and_set_cluster_status(
        &self,
        id: Uuid,
        from: &[ClusterStatus],
        to: ClusterStatus,
    ) -> Result<bool, LedgerError>;

    /// Appends nodes to a cluster, enforcing global node-name uniqueness
    async fn add_nodes(&self, cluster_id: Uuid, nodes: &[Node]) -> Result<(), LedgerError>;

    async fn remove_node(&self, node_id: Uuid) -> Result<(), LedgerError>;

    /// Deletes a cluster and its nodes; jobs keep their history with the
    /// cluster reference cleared
    async fn delete_cluster(&self, id: Uuid) -> Result<(), LedgerError>;

    async fn find_node(&self, id: Uuid) -> Result<Option<Node>, LedgerError>;

    // -------------------------------------------------------------------------
    // Jobs and tasks
    // -------------------------------------------------------------------------

    async fn create_job(
        &self,
        job_type: JobType,
        status: JobStatus,
        cluster_id: Option<Uuid>,
    ) -> Result<Uuid, LedgerError>;

    /// Appends a task with one fresh execution whose start is now
    async fn add_task(
        &self,
        job_id: Uuid,
        description: &str,
        target_node_id: Option<Uuid>,
    ) -> Result<TaskHandle, LedgerError>;

    /// Folds `outcome` into the stored execution via
    /// [`TaskExecution::update_with`]
    async fn record_execution_result(
        &self,
        task_id: Uuid,
        index: usize,
        outcome: &TaskExecution,
    ) -> Result<(), LedgerError>;

    async fn set_job_status(&self, job_id: Uuid, status: JobStatus) -> Result<(), LedgerError>;

    async fn set_task_status(&self, task_id: Uuid, status: JobStatus) -> Result<(), LedgerError>;

    async fn set_job_variable(
        &self,
        job_id: Uuid,
        key: &str,
        value: &str,
    ) -> Result<(), LedgerError>;

    /// A job with its tasks and their executions
    async fn find_job(&self, id: Uuid) -> Result<Option<Job>, LedgerError>;

    /// All jobs, newest first
    async fn list_jobs(&self) -> Result<Vec<Job>, LedgerError>;

    async fn find_task(&self, id: Uuid) -> Result<Option<Task>, LedgerError>;

    async fn count_jobs_by_status(&self, statuses: &[JobStatus]) -> Result<usize, LedgerError>;

    // -------------------------------------------------------------------------
    // Units of work around remote calls
    // -------------------------------------------------------------------------

    /// Creates a job bound to a cluster and snapshots its master and the
    /// selected workers
    async fn begin_cluster_job(
        &self,
        request: &ClusterJobRequest,
    ) -> Result<ClusterJobPlan, LedgerError>;

    /// Creates an in-progress task targeting `node_id` and returns the node
    /// as currently stored
    async fn begin_node_task(
        &self,
        job_id: Uuid,
        node_id: Uuid,
        description: &str,
    ) -> Result<NodeTaskTicket, LedgerError>;

    /// Records a provisioning outcome on the task and moves the node to
    /// CREATED or FAILED
    async fn finish_provisioning(
        &self,
        task_id: Uuid,
        node_id: Uuid,
        outcome: &ProvisioningOutcome,
    ) -> Result<(), LedgerError>;

    /// Records the outcome of execution 0 and closes the task accordingly
    async fn finish_task(&self, task_id: Uuid, outcome: &TaskExecution)
    -> Result<(), LedgerError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_status_for_execution() {
        let mut ok = TaskExecution::new();
        ok.finish(true, Utc::now());
        assert_eq!(status_for(&ok), JobStatus::Completed);

        let mut failed = TaskExecution::new();
        failed.finish(false, Utc::now());
        assert_eq!(status_for(&failed), JobStatus::Failed);
    }

    #[test]
    fn test_not_found_message() {
        let id = Uuid::nil();
        let err = LedgerError::not_found("job", id);
        assert_eq!(err.to_string(), format!("job {} not found", id));
    }
}
