//! In-memory ledger
//!
//! Used when no database is configured and by tests. Each method takes the
//! state lock once and releases it before returning.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use fogfort_core::domain::cluster::{Cluster, ClusterStatus};
use fogfort_core::domain::job::{Job, JobStatus, JobType, Task, TaskExecution};
use fogfort_core::domain::node::Node;
use uuid::Uuid;

use super::{
    ClusterJobPlan, ClusterJobRequest, Ledger, LedgerError, NodeRef, NodeTaskTicket,
    ProvisioningOutcome, TaskHandle, check_transition, status_for,
};

#[derive(Default)]
struct State {
    clusters: HashMap<Uuid, Cluster>,
    jobs: HashMap<Uuid, Job>,
    /// task id -> owning job id
    task_jobs: HashMap<Uuid, Uuid>,
}

impl State {
    fn cluster_mut(&mut self, id: Uuid) -> Result<&mut Cluster, LedgerError> {
        self.clusters
            .get_mut(&id)
            .ok_or_else(|| LedgerError::not_found("cluster", id))
    }

    fn job_mut(&mut self, id: Uuid) -> Result<&mut Job, LedgerError> {
        self.jobs
            .get_mut(&id)
            .ok_or_else(|| LedgerError::not_found("job", id))
    }

    fn node(&self, id: Uuid) -> Option<&Node> {
        self.clusters
            .values()
            .flat_map(|c| c.nodes.iter())
            .find(|n| n.id == id)
    }

    fn node_mut(&mut self, id: Uuid) -> Result<&mut Node, LedgerError> {
        self.clusters
            .values_mut()
            .flat_map(|c| c.nodes.iter_mut())
            .find(|n| n.id == id)
            .ok_or_else(|| LedgerError::not_found("node", id))
    }

    fn node_names(&self) -> HashSet<&str> {
        self.clusters
            .values()
            .flat_map(|c| c.nodes.iter())
            .map(|n| n.name.as_str())
            .collect()
    }

    fn task_mut(&mut self, task_id: Uuid) -> Result<&mut Task, LedgerError> {
        let job_id = *self
            .task_jobs
            .get(&task_id)
            .ok_or_else(|| LedgerError::not_found("task", task_id))?;
        self.jobs
            .get_mut(&job_id)
            .and_then(|job| job.tasks.iter_mut().find(|t| t.id == task_id))
            .ok_or_else(|| LedgerError::not_found("task", task_id))
    }

    /// Rejects names already used anywhere or repeated within `nodes`
    fn check_node_names(&self, nodes: &[Node]) -> Result<(), LedgerError> {
        let taken = self.node_names();
        let mut batch = HashSet::new();
        for node in nodes {
            if taken.contains(node.name.as_str()) || !batch.insert(node.name.as_str()) {
                return Err(LedgerError::Conflict(format!(
                    "node name '{}' is already in use",
                    node.name
                )));
            }
        }
        Ok(())
    }

    fn insert_task(&mut self, task: Task) -> Result<(), LedgerError> {
        let task_id = task.id;
        let job_id = task.job_id;
        let job = self.job_mut(job_id)?;
        job.updated_at = Utc::now();
        job.tasks.push(task);
        self.task_jobs.insert(task_id, job_id);
        Ok(())
    }
}

fn apply_task_status(task: &mut Task, status: JobStatus) -> Result<(), LedgerError> {
    check_transition("task", task.id, task.status, status)?;
    let now = Utc::now();
    task.status = status;
    task.updated_at = now;
    if status.is_terminal() && task.ended_at.is_none() {
        task.ended_at = Some(now);
    }
    Ok(())
}

fn merge_first_execution(task: &mut Task, outcome: &TaskExecution) -> Result<(), LedgerError> {
    let task_id = task.id;
    let execution = task
        .executions
        .first_mut()
        .ok_or_else(|| LedgerError::not_found("task execution", format!("{}/0", task_id)))?;
    execution.update_with(outcome);
    let ended = execution.end();
    let status = status_for(execution);

    check_transition("task", task.id, task.status, status)?;
    task.status = status;
    task.ended_at = ended;
    task.updated_at = ended.unwrap_or_else(Utc::now);
    Ok(())
}

/// Ledger kept in process memory
#[derive(Default)]
pub struct MemoryLedger {
    state: Mutex<State>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, State>, LedgerError> {
        self.state
            .lock()
            .map_err(|_| LedgerError::Corrupt("ledger lock poisoned".to_string()))
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn insert_cluster(&self, cluster: &Cluster) -> Result<(), LedgerError> {
        let mut state = self.state()?;
        if state.clusters.values().any(|c| c.name == cluster.name) {
            return Err(LedgerError::Conflict(format!(
                "cluster '{}' already exists",
                cluster.name
            )));
        }
        state.check_node_names(&cluster.nodes)?;
        state.clusters.insert(cluster.id, cluster.clone());
        Ok(())
    }

    async fn find_cluster(&self, id: Uuid) -> Result<Option<Cluster>, LedgerError> {
        Ok(self.state()?.clusters.get(&id).cloned())
    }

    async fn find_cluster_by_name(&self, name: &str) -> Result<Option<Cluster>, LedgerError> {
        Ok(self
            .state()?
            .clusters
            .values()
            .find(|c| c.name == name)
            .cloned())
    }

    async fn list_clusters(&self) -> Result<Vec<Cluster>, LedgerError> {
        let mut clusters: Vec<Cluster> = self.state()?.clusters.values().cloned().collect();
        clusters.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(clusters)
    }

    async fn existing_node_names(&self, names: &[String]) -> Result<Vec<String>, LedgerError> {
        let state = self.state()?;
        let taken = state.node_names();
        Ok(names
            .iter()
            .filter(|n| taken.contains(n.as_str()))
            .cloned()
            .collect())
    }

    async fn set_cluster_status(
        &self,
        id: Uuid,
        status: ClusterStatus,
    ) -> Result<(), LedgerError> {
        self.state()?.cluster_mut(id)?.status = status;
        Ok(())
    }

    async fn compare_and_set_cluster_status(
        &self,
        id: Uuid,
        from: &[ClusterStatus],
        to: ClusterStatus,
    ) -> Result<bool, LedgerError> {
        let mut state = self.state()?;
        let cluster = state.cluster_mut(id)?;
        if !from.contains(&cluster.status) {
            return Ok(false);
        }
        cluster.status = to;
        Ok(true)
    }

    async fn add_nodes(&self, cluster_id: Uuid, nodes: &[Node]) -> Result<(), LedgerError> {
        let mut state = self.state()?;
        state.check_node_names(nodes)?;
        state
            .cluster_mut(cluster_id)?
            .nodes
            .extend(nodes.iter().cloned());
        Ok(())
    }

    async fn remove_node(&self, node_id: Uuid) -> Result<(), LedgerError> {
        let mut state = self.state()?;
        let cluster = state
            .clusters
            .values_mut()
            .find(|c| c.nodes.iter().any(|n| n.id == node_id))
            .ok_or_else(|| LedgerError::not_found("node", node_id))?;
        cluster.nodes.retain(|n| n.id != node_id);
        Ok(())
    }

    async fn delete_cluster(&self, id: Uuid) -> Result<(), LedgerError> {
        let mut state = self.state()?;
        state
            .clusters
            .remove(&id)
            .ok_or_else(|| LedgerError::not_found("cluster", id))?;
        for job in state.jobs.values_mut() {
            if job.cluster_id == Some(id) {
                job.cluster_id = None;
            }
        }
        Ok(())
    }

    async fn find_node(&self, id: Uuid) -> Result<Option<Node>, LedgerError> {
        Ok(self.state()?.node(id).cloned())
    }

    async fn create_job(
        &self,
        job_type: JobType,
        status: JobStatus,
        cluster_id: Option<Uuid>,
    ) -> Result<Uuid, LedgerError> {
        let mut state = self.state()?;
        if let Some(cluster_id) = cluster_id {
            if !state.clusters.contains_key(&cluster_id) {
                return Err(LedgerError::not_found("cluster", cluster_id));
            }
        }
        let job = Job::new(job_type, status, cluster_id);
        let id = job.id;
        state.jobs.insert(id, job);
        Ok(id)
    }

    async fn add_task(
        &self,
        job_id: Uuid,
        description: &str,
        target_node_id: Option<Uuid>,
    ) -> Result<TaskHandle, LedgerError> {
        let mut state = self.state()?;
        let task = Task::new(job_id, description, target_node_id);
        let handle = TaskHandle {
            task_id: task.id,
            execution: task.executions[0].clone(),
        };
        state.insert_task(task)?;
        Ok(handle)
    }

    async fn record_execution_result(
        &self,
        task_id: Uuid,
        index: usize,
        outcome: &TaskExecution,
    ) -> Result<(), LedgerError> {
        let mut state = self.state()?;
        let task = state.task_mut(task_id)?;
        let execution = task.executions.get_mut(index).ok_or_else(|| {
            LedgerError::not_found("task execution", format!("{}/{}", task_id, index))
        })?;
        execution.update_with(outcome);
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn set_job_status(&self, job_id: Uuid, status: JobStatus) -> Result<(), LedgerError> {
        let mut state = self.state()?;
        let job = state.job_mut(job_id)?;
        check_transition("job", job_id, job.status, status)?;
        let now = Utc::now();
        job.status = status;
        job.updated_at = now;
        if status.is_terminal() && job.ended_at.is_none() {
            job.ended_at = Some(now);
        }
        Ok(())
    }

    async fn set_task_status(&self, task_id: Uuid, status: JobStatus) -> Result<(), LedgerError> {
        let mut state = self.state()?;
        apply_task_status(state.task_mut(task_id)?, status)
    }

    async fn set_job_variable(
        &self,
        job_id: Uuid,
        key: &str,
        value: &str,
    ) -> Result<(), LedgerError> {
        let mut state = self.state()?;
        let job = state.job_mut(job_id)?;
        job.variables.insert(key.to_string(), value.to_string());
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn find_job(&self, id: Uuid) -> Result<Option<Job>, LedgerError> {
        Ok(self.state()?.jobs.get(&id).cloned())
    }

    async fn list_jobs(&self) -> Result<Vec<Job>, LedgerError> {
        let mut jobs: Vec<Job> = self.state()?.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }

    async fn find_task(&self, id: Uuid) -> Result<Option<Task>, LedgerError> {
        let mut state = self.state()?;
        match state.task_mut(id) {
            Ok(task) => Ok(Some(task.clone())),
            Err(LedgerError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn count_jobs_by_status(&self, statuses: &[JobStatus]) -> Result<usize, LedgerError> {
        Ok(self
            .state()?
            .jobs
            .values()
            .filter(|j| statuses.contains(&j.status))
            .count())
    }

    async fn begin_cluster_job(
        &self,
        request: &ClusterJobRequest,
    ) -> Result<ClusterJobPlan, LedgerError> {
        let mut state = self.state()?;
        let cluster = state
            .clusters
            .get(&request.cluster_id)
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
        let cluster_name = cluster.name.clone();
        let env_vars = cluster.env_vars.clone();

        let job = Job::new(request.job_type, JobStatus::Created, Some(request.cluster_id));
        let job_id = job.id;
        state.jobs.insert(job_id, job);

        Ok(ClusterJobPlan {
            job_id,
            cluster_id: request.cluster_id,
            cluster_name,
            master,
            workers,
            env_vars,
        })
    }

    async fn begin_node_task(
        &self,
        job_id: Uuid,
        node_id: Uuid,
        description: &str,
    ) -> Result<NodeTaskTicket, LedgerError> {
        let mut state = self.state()?;
        let node = state
            .node(node_id)
            .cloned()
            .ok_or_else(|| LedgerError::not_found("node", node_id))?;

        let task = Task::new(job_id, description, Some(node_id));
        let ticket = NodeTaskTicket {
            task_id: task.id,
            execution: task.executions[0].clone(),
            node,
        };
        state.insert_task(task)?;
        Ok(ticket)
    }

    async fn finish_provisioning(
        &self,
        task_id: Uuid,
        node_id: Uuid,
        outcome: &ProvisioningOutcome,
    ) -> Result<(), LedgerError> {
        let mut state = self.state()?;

        // Validate the node first so a rejected transition leaves no partial write
        let mut node = state.node_mut(node_id)?.clone();
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

        merge_first_execution(state.task_mut(task_id)?, &outcome.execution)?;
        *state.node_mut(node_id)? = node;
        Ok(())
    }

    async fn finish_task(
        &self,
        task_id: Uuid,
        outcome: &TaskExecution,
    ) -> Result<(), LedgerError> {
        let mut state = self.state()?;
        merge_first_execution(state.task_mut(task_id)?, outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use fogfort_core::domain::node::{
        Cloud, NodeCandidate, NodeStatus, ProvisionedNode, SshConnectionParameters,
    };

    fn node(name: &str) -> Node {
        Node::new(
            name,
            NodeCandidate {
                id: "c1".to_string(),
                cloud: Cloud {
                    cloud_id: "lab".to_string(),
                    provider: "inventory".to_string(),
                },
                hardware: None,
                image: None,
                location: None,
            },
        )
    }

    fn cluster(name: &str, nodes: Vec<Node>) -> Cluster {
        Cluster {
            id: Uuid::new_v4(),
            name: name.to_string(),
            master_node_name: nodes[0].name.clone(),
            nodes,
            status: ClusterStatus::Defined,
            env_vars: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    fn provisioned() -> ProvisionedNode {
        ProvisionedNode {
            provider_id: "host-1".to_string(),
            node_url: None,
            ssh_connection_parameters: SshConnectionParameters {
                ip_address: Some("10.0.0.1".to_string()),
                port: None,
                username: Some("ubuntu".to_string()),
                private_key: Some("KEY".to_string()),
            },
        }
    }

    #[tokio::test]
    async fn test_node_names_are_globally_unique() {
        let ledger = MemoryLedger::new();
        ledger
            .insert_cluster(&cluster("a", vec![node("master-a"), node("shared")]))
            .await
            .unwrap();

        let err = ledger
            .insert_cluster(&cluster("b", vec![node("master-b"), node("shared")]))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Conflict(_)));

        let taken = ledger
            .existing_node_names(&["shared".to_string(), "free".to_string()])
            .await
            .unwrap();
        assert_eq!(taken, vec!["shared".to_string()]);
    }

    #[tokio::test]
    async fn test_cluster_name_is_unique() {
        let ledger = MemoryLedger::new();
        ledger
            .insert_cluster(&cluster("a", vec![node("m1")]))
            .await
            .unwrap();
        let err = ledger
            .insert_cluster(&cluster("a", vec![node("m2")]))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_record_execution_result_merges() {
        let ledger = MemoryLedger::new();
        let job_id = ledger
            .create_job(JobType::Unknown, JobStatus::Created, None)
            .await
            .unwrap();
        let handle = ledger.add_task(job_id, "step", None).await.unwrap();
        let original_start = handle.execution.start().unwrap();

        let mut outcome = TaskExecution::started_at(original_start + Duration::seconds(5));
        outcome.finish(true, original_start + Duration::seconds(9));
        ledger
            .record_execution_result(handle.task_id, 0, &outcome)
            .await
            .unwrap();

        let task = ledger.find_task(handle.task_id).await.unwrap().unwrap();
        let stored = &task.executions[0];
        assert_eq!(stored.start(), Some(original_start));
        assert_eq!(stored.end(), outcome.end());
        assert_eq!(stored.log_id(), outcome.log_id());
        assert!(stored.success());

        assert!(matches!(
            ledger.record_execution_result(handle.task_id, 3, &outcome).await,
            Err(LedgerError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_terminal_job_status_is_final() {
        let ledger = MemoryLedger::new();
        let job_id = ledger
            .create_job(JobType::DeployCluster, JobStatus::Created, None)
            .await
            .unwrap();

        ledger.set_job_status(job_id, JobStatus::InProgress).await.unwrap();
        ledger.set_job_status(job_id, JobStatus::Completed).await.unwrap();
        let err = ledger
            .set_job_status(job_id, JobStatus::Failed)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidTransition { .. }));

        let job = ledger.find_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.ended_at.is_some());
    }

    #[tokio::test]
    async fn test_begin_cluster_job_snapshots_nodes() {
        let ledger = MemoryLedger::new();
        let c = cluster("demo", vec![node("master"), node("w1"), node("w2")]);
        let w2 = c.nodes[2].id;
        ledger.insert_cluster(&c).await.unwrap();

        let plan = ledger
            .begin_cluster_job(&ClusterJobRequest {
                job_type: JobType::DeployCluster,
                cluster_id: c.id,
                worker_ids: None,
            })
            .await
            .unwrap();
        assert_eq!(plan.master.name, "master");
        assert_eq!(plan.workers.len(), 2);

        let plan = ledger
            .begin_cluster_job(&ClusterJobRequest {
                job_type: JobType::ScaleIn,
                cluster_id: c.id,
                worker_ids: Some(vec![w2]),
            })
            .await
            .unwrap();
        assert_eq!(plan.workers, vec![NodeRef { id: w2, name: "w2".to_string() }]);

        let job = ledger.find_job(plan.job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Created);
        assert_eq!(job.cluster_id, Some(c.id));
    }

    #[tokio::test]
    async fn test_finish_provisioning_updates_node_and_task() {
        let ledger = MemoryLedger::new();
        let c = cluster("demo", vec![node("master")]);
        let master_id = c.nodes[0].id;
        ledger.insert_cluster(&c).await.unwrap();
        let job_id = ledger
            .create_job(JobType::DeployCluster, JobStatus::InProgress, Some(c.id))
            .await
            .unwrap();

        let ticket = ledger
            .begin_node_task(job_id, master_id, "Create node: master")
            .await
            .unwrap();
        assert_eq!(ticket.node.status, NodeStatus::Pending);

        let mut execution = ticket.execution.clone();
        execution.finish(true, Utc::now());
        ledger
            .finish_provisioning(
                ticket.task_id,
                master_id,
                &ProvisioningOutcome {
                    execution: execution.clone(),
                    details: Some(provisioned()),
                },
            )
            .await
            .unwrap();

        let node = ledger.find_node(master_id).await.unwrap().unwrap();
        assert_eq!(node.status, NodeStatus::Created);
        assert_eq!(node.provider_id.as_deref(), Some("host-1"));

        let task = ledger.find_task(ticket.task_id).await.unwrap().unwrap();
        assert_eq!(task.status, JobStatus::Completed);
        assert_eq!(task.ended_at, execution.end());

        // A second outcome for the same node is rejected
        let again = ledger
            .begin_node_task(job_id, master_id, "Create node: master")
            .await
            .unwrap();
        let err = ledger
            .finish_provisioning(
                again.task_id,
                master_id,
                &ProvisioningOutcome {
                    execution,
                    details: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Conflict(_)));
        let node = ledger.find_node(master_id).await.unwrap().unwrap();
        assert_eq!(node.status, NodeStatus::Created);
    }

    #[tokio::test]
    async fn test_compare_and_set_cluster_status() {
        let ledger = MemoryLedger::new();
        let c = cluster("demo", vec![node("master")]);
        ledger.insert_cluster(&c).await.unwrap();

        assert!(
            ledger
                .compare_and_set_cluster_status(c.id, &[ClusterStatus::Defined], ClusterStatus::Submitted)
                .await
                .unwrap()
        );
        assert!(
            !ledger
                .compare_and_set_cluster_status(c.id, &[ClusterStatus::Defined], ClusterStatus::Submitted)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_delete_cluster_keeps_job_history() {
        let ledger = MemoryLedger::new();
        let c = cluster("demo", vec![node("master")]);
        ledger.insert_cluster(&c).await.unwrap();
        let job_id = ledger
            .create_job(JobType::TerminateCluster, JobStatus::Created, Some(c.id))
            .await
            .unwrap();

        ledger.delete_cluster(c.id).await.unwrap();

        assert!(ledger.find_cluster(c.id).await.unwrap().is_none());
        let job = ledger.find_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.cluster_id, None);
        assert!(ledger
            .existing_node_names(&["master".to_string()])
            .await
            .unwrap()
            .is_empty());
    }
}
