//! Cluster Service
//!
//! Business logic for cluster definitions and the jobs that change them.
//! Operations that touch nodes return a job id straight away and leave the
//! work to a background [`Orchestrator`] task.

use chrono::Utc;
use fogfort_core::domain::cluster::{Cluster, ClusterStatus};
use fogfort_core::domain::job::JobType;
use fogfort_core::domain::node::{Node, NodeStatus};
use fogfort_core::dto::cluster::{
    ClusterDefinition, ClusterNodeDefinition, ScaleInRequest, ScaleOutRequest,
};
use regex::Regex;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, LazyLock};
use uuid::Uuid;

use super::deploy::{DeploymentKind, Orchestrator, ReleaseKind};
use crate::ledger::{ClusterJobPlan, ClusterJobRequest, Ledger, LedgerError};

static CLUSTER_NAME_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9-]+$").ok());

static NODE_NAME_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9-]*$").ok());

static ENV_VAR_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").ok());

/// Service error type
#[derive(Debug)]
pub enum ClusterError {
    NotFound(String),
    Validation(String),
    Conflict(String),
    Ledger(LedgerError),
}

impl From<LedgerError> for ClusterError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::NotFound { entity, id } => {
                ClusterError::NotFound(format!("{} {} not found", entity, id))
            }
            LedgerError::Conflict(msg) => ClusterError::Conflict(msg),
            other => ClusterError::Ledger(other),
        }
    }
}

impl fmt::Display for ClusterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterError::NotFound(msg)
            | ClusterError::Validation(msg)
            | ClusterError::Conflict(msg) => f.write_str(msg),
            ClusterError::Ledger(err) => write!(f, "{}", err),
        }
    }
}

fn matches(pattern: &LazyLock<Option<Regex>>, value: &str) -> bool {
    pattern.as_ref().is_some_and(|re| re.is_match(value))
}

// =============================================================================
// Validation
// =============================================================================

/// Checks names and candidates of node definitions, including duplicates
/// within the list itself
pub fn validate_node_definitions(nodes: &[ClusterNodeDefinition]) -> Result<(), ClusterError> {
    if nodes.is_empty() {
        return Err(ClusterError::Validation(
            "at least one node is required".to_string(),
        ));
    }

    let mut seen = HashSet::new();
    for node in nodes {
        if !matches(&NODE_NAME_PATTERN, &node.node_name) {
            return Err(ClusterError::Validation(format!(
                "invalid node name '{}': must match ^[a-z][a-z0-9-]*$",
                node.node_name
            )));
        }
        if !seen.insert(node.node_name.as_str()) {
            return Err(ClusterError::Validation(format!(
                "duplicate node name '{}'",
                node.node_name
            )));
        }
        if node.node_candidate.id.trim().is_empty() {
            return Err(ClusterError::Validation(format!(
                "node '{}' has no candidate",
                node.node_name
            )));
        }
        if node.node_candidate.cloud.provider.trim().is_empty() {
            return Err(ClusterError::Validation(format!(
                "candidate of node '{}' names no provider",
                node.node_name
            )));
        }
    }
    Ok(())
}

pub fn validate_definition(def: &ClusterDefinition) -> Result<(), ClusterError> {
    if !matches(&CLUSTER_NAME_PATTERN, &def.name) {
        return Err(ClusterError::Validation(format!(
            "invalid cluster name '{}': must match ^[a-z0-9-]+$",
            def.name
        )));
    }

    validate_node_definitions(&def.nodes)?;

    if !def.nodes.iter().any(|n| n.node_name == def.master_node) {
        return Err(ClusterError::Validation(format!(
            "master node '{}' is not among the cluster nodes",
            def.master_node
        )));
    }

    if let Some(key) = def.env_vars.keys().find(|k| !matches(&ENV_VAR_PATTERN, k)) {
        return Err(ClusterError::Validation(format!(
            "invalid environment variable name '{}'",
            key
        )));
    }

    Ok(())
}

// =============================================================================
// Service
// =============================================================================

pub struct ClusterService {
    ledger: Arc<dyn Ledger>,
    orchestrator: Orchestrator,
}

impl ClusterService {
    pub fn new(ledger: Arc<dyn Ledger>, orchestrator: Orchestrator) -> Self {
        Self {
            ledger,
            orchestrator,
        }
    }

    /// Stores a new cluster with status DEFINED and all nodes PENDING
    pub async fn define_cluster(&self, def: ClusterDefinition) -> Result<Cluster, ClusterError> {
        validate_definition(&def)?;

        if self.ledger.find_cluster_by_name(&def.name).await?.is_some() {
            return Err(ClusterError::Conflict(format!(
                "cluster '{}' already exists",
                def.name
            )));
        }
        self.ensure_names_unused(&def.nodes).await?;

        let cluster = Cluster {
            id: Uuid::new_v4(),
            name: def.name,
            master_node_name: def.master_node,
            nodes: def
                .nodes
                .into_iter()
                .map(|n| Node::new(n.node_name, n.node_candidate))
                .collect(),
            status: ClusterStatus::Defined,
            env_vars: def.env_vars,
            created_at: Utc::now(),
        };
        self.ledger.insert_cluster(&cluster).await?;

        tracing::info!(
            "Cluster defined: {} ({} nodes, master {})",
            cluster.name,
            cluster.nodes.len(),
            cluster.master_node_name
        );
        Ok(cluster)
    }

    pub async fn get_cluster(&self, name: &str) -> Result<Cluster, ClusterError> {
        self.ledger
            .find_cluster_by_name(name)
            .await?
            .ok_or_else(|| ClusterError::NotFound(format!("Cluster {} not found", name)))
    }

    pub async fn list_clusters(&self) -> Result<Vec<Cluster>, ClusterError> {
        Ok(self.ledger.list_clusters().await?)
    }

    /// Starts the deployment of a DEFINED cluster and returns its job id
    pub async fn deploy_cluster(&self, name: &str) -> Result<Uuid, ClusterError> {
        let cluster = self.get_cluster(name).await?;
        cluster
            .master_node()
            .map_err(|e| ClusterError::Validation(e.to_string()))?;

        self.claim(&cluster, &[ClusterStatus::Defined], ClusterStatus::Submitted)
            .await?;

        let plan = self
            .begin_job(&cluster, JobType::DeployCluster, None, ClusterStatus::Defined)
            .await?;
        let job_id = plan.job_id;
        self.orchestrator.spawn_deployment(plan, DeploymentKind::Deploy);

        tracing::info!("Deployment of cluster {} launched as job {}", name, job_id);
        Ok(job_id)
    }

    /// Adds PENDING workers to a RUNNING cluster and starts their pipelines
    pub async fn scale_out(&self, name: &str, req: ScaleOutRequest) -> Result<Uuid, ClusterError> {
        validate_node_definitions(&req.nodes)?;

        let cluster = self.get_cluster(name).await?;
        let master = cluster
            .master_node()
            .map_err(|e| ClusterError::Validation(e.to_string()))?;
        if master.status != NodeStatus::Created {
            return Err(ClusterError::Conflict(format!(
                "master node {} of cluster {} is {}",
                master.name,
                name,
                master.status.as_str()
            )));
        }
        self.ensure_names_unused(&req.nodes).await?;

        self.claim(&cluster, &[ClusterStatus::Running], ClusterStatus::Scaling)
            .await?;

        let nodes: Vec<Node> = req
            .nodes
            .into_iter()
            .map(|n| Node::new(n.node_name, n.node_candidate))
            .collect();
        if let Err(e) = self.ledger.add_nodes(cluster.id, &nodes).await {
            self.restore_status(&cluster, ClusterStatus::Running).await;
            return Err(e.into());
        }

        let ids = nodes.iter().map(|n| n.id).collect();
        let plan = self
            .begin_job(&cluster, JobType::ScaleOut, Some(ids), ClusterStatus::Running)
            .await?;
        let job_id = plan.job_id;
        self.orchestrator.spawn_deployment(plan, DeploymentKind::ScaleOut);

        tracing::info!("Scale-out of cluster {} launched as job {}", name, job_id);
        Ok(job_id)
    }

    /// Releases workers of a RUNNING cluster
    pub async fn scale_in(&self, name: &str, req: ScaleInRequest) -> Result<Uuid, ClusterError> {
        if req.node_names.is_empty() {
            return Err(ClusterError::Validation(
                "at least one node name is required".to_string(),
            ));
        }

        let cluster = self.get_cluster(name).await?;
        let mut ids = Vec::new();
        for node_name in &req.node_names {
            if *node_name == cluster.master_node_name {
                return Err(ClusterError::Validation(format!(
                    "master node {} cannot be removed",
                    node_name
                )));
            }
            let node = cluster.find_node(node_name).ok_or_else(|| {
                ClusterError::NotFound(format!("Node {} not found in cluster {}", node_name, name))
            })?;
            if !ids.contains(&node.id) {
                ids.push(node.id);
            }
        }

        self.claim(&cluster, &[ClusterStatus::Running], ClusterStatus::Scaling)
            .await?;

        let plan = self
            .begin_job(&cluster, JobType::ScaleIn, Some(ids), ClusterStatus::Running)
            .await?;
        let job_id = plan.job_id;
        self.orchestrator.spawn_release(plan, ReleaseKind::ScaleIn);

        tracing::info!("Scale-in of cluster {} launched as job {}", name, job_id);
        Ok(job_id)
    }

    /// Releases every node and deletes the cluster once all are gone
    pub async fn delete_cluster(&self, name: &str) -> Result<Uuid, ClusterError> {
        let cluster = self.get_cluster(name).await?;
        let previous = cluster.status;

        self.claim(
            &cluster,
            &[
                ClusterStatus::Defined,
                ClusterStatus::Running,
                ClusterStatus::Failed,
            ],
            ClusterStatus::Terminating,
        )
        .await?;

        let plan = self
            .begin_job(&cluster, JobType::TerminateCluster, None, previous)
            .await?;
        let job_id = plan.job_id;
        self.orchestrator.spawn_release(plan, ReleaseKind::Terminate);

        tracing::info!("Termination of cluster {} launched as job {}", name, job_id);
        Ok(job_id)
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn ensure_names_unused(&self, nodes: &[ClusterNodeDefinition]) -> Result<(), ClusterError> {
        let names: Vec<String> = nodes.iter().map(|n| n.node_name.clone()).collect();
        let taken = self.ledger.existing_node_names(&names).await?;
        if taken.is_empty() {
            Ok(())
        } else {
            Err(ClusterError::Conflict(format!(
                "node name(s) already in use: {}",
                taken.join(", ")
            )))
        }
    }

    /// Moves the cluster from one of `from` to `to`, or reports who holds it
    async fn claim(
        &self,
        cluster: &Cluster,
        from: &[ClusterStatus],
        to: ClusterStatus,
    ) -> Result<(), ClusterError> {
        if self
            .ledger
            .compare_and_set_cluster_status(cluster.id, from, to)
            .await?
        {
            return Ok(());
        }

        let current = self
            .ledger
            .find_cluster(cluster.id)
            .await?
            .map(|c| c.status)
            .unwrap_or(cluster.status);
        Err(ClusterError::Conflict(format!(
            "cluster {} is {} and cannot become {}",
            cluster.name, current, to
        )))
    }

    /// Opens the job; on failure hands the cluster back in `fallback` status
    async fn begin_job(
        &self,
        cluster: &Cluster,
        job_type: JobType,
        worker_ids: Option<Vec<Uuid>>,
        fallback: ClusterStatus,
    ) -> Result<ClusterJobPlan, ClusterError> {
        let request = ClusterJobRequest {
            job_type,
            cluster_id: cluster.id,
            worker_ids,
        };
        match self.ledger.begin_cluster_job(&request).await {
            Ok(plan) => Ok(plan),
            Err(e) => {
                self.restore_status(cluster, fallback).await;
                Err(e.into())
            }
        }
    }

    async fn restore_status(&self, cluster: &Cluster, status: ClusterStatus) {
        if let Err(e) = self.ledger.set_cluster_status(cluster.id, status).await {
            tracing::error!(
                "Failed to restore cluster {} to {}: {}",
                cluster.name,
                status,
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;
    use crate::service::deploy::WorkerFailurePolicy;
    use crate::service::testing::{FakeProvisioner, FakeRunner, candidate, orchestrator};
    use fogfort_core::domain::job::JobStatus;
    use std::collections::HashMap;
    use std::time::Duration;

    fn node_def(name: &str) -> ClusterNodeDefinition {
        ClusterNodeDefinition {
            node_name: name.to_string(),
            node_candidate: candidate(),
        }
    }

    fn definition(name: &str, master: &str, nodes: &[&str]) -> ClusterDefinition {
        ClusterDefinition {
            name: name.to_string(),
            master_node: master.to_string(),
            nodes: nodes.iter().map(|n| node_def(n)).collect(),
            env_vars: HashMap::from([("REGION".to_string(), "eu".to_string())]),
        }
    }

    fn service(provisioner: FakeProvisioner) -> (Arc<MemoryLedger>, ClusterService) {
        let ledger = Arc::new(MemoryLedger::new());
        let orch = orchestrator(
            ledger.clone(),
            Arc::new(provisioner),
            Arc::new(FakeRunner::new()),
            WorkerFailurePolicy::BestEffort,
        );
        (ledger.clone(), ClusterService::new(ledger, orch))
    }

    async fn wait_for_job(ledger: &MemoryLedger, job_id: Uuid) -> JobStatus {
        for _ in 0..200 {
            let job = ledger.find_job(job_id).await.unwrap().unwrap();
            if job.status.is_terminal() {
                return job.status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} did not finish", job_id);
    }

    #[test]
    fn test_validate_definition_accepts_valid() {
        let def = definition("demo-1", "master", &["master", "worker-1"]);
        assert!(validate_definition(&def).is_ok());
    }

    #[test]
    fn test_validate_definition_rejects_bad_names() {
        let def = definition("Demo_1", "master", &["master"]);
        assert!(matches!(
            validate_definition(&def),
            Err(ClusterError::Validation(_))
        ));

        let def = definition("demo", "master", &["master", "1worker"]);
        assert!(matches!(
            validate_definition(&def),
            Err(ClusterError::Validation(msg)) if msg.contains("1worker")
        ));
    }

    #[test]
    fn test_validate_definition_requires_master_among_nodes() {
        let def = definition("demo", "boss", &["master", "worker-1"]);
        assert!(matches!(
            validate_definition(&def),
            Err(ClusterError::Validation(msg)) if msg.contains("boss")
        ));
    }

    #[test]
    fn test_validate_definition_rejects_duplicates_and_bad_env() {
        let def = definition("demo", "master", &["master", "w1", "w1"]);
        assert!(matches!(
            validate_definition(&def),
            Err(ClusterError::Validation(msg)) if msg.contains("duplicate")
        ));

        let mut def = definition("demo", "master", &["master"]);
        def.env_vars.insert("BAD-NAME".to_string(), "x".to_string());
        assert!(matches!(
            validate_definition(&def),
            Err(ClusterError::Validation(msg)) if msg.contains("BAD-NAME")
        ));
    }

    #[tokio::test]
    async fn test_define_enforces_global_node_names() {
        let (_, svc) = service(FakeProvisioner::new());
        svc.define_cluster(definition("one", "master", &["master", "w1"]))
            .await
            .unwrap();

        let err = svc
            .define_cluster(definition("two", "w1", &["w1"]))
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::Conflict(msg) if msg.contains("w1")));

        let err = svc
            .define_cluster(definition("one", "other", &["other"]))
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_deploy_returns_job_and_runs_in_background() {
        let (ledger, svc) = service(FakeProvisioner::new());
        svc.define_cluster(definition("demo", "master", &["master", "w1"]))
            .await
            .unwrap();

        let job_id = svc.deploy_cluster("demo").await.unwrap();
        assert_eq!(wait_for_job(&ledger, job_id).await, JobStatus::Completed);

        let cluster = svc.get_cluster("demo").await.unwrap();
        assert_eq!(cluster.status, ClusterStatus::Running);
        assert!(cluster.nodes.iter().all(|n| n.status == NodeStatus::Created));

        let err = svc.deploy_cluster("demo").await.unwrap_err();
        assert!(matches!(err, ClusterError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_scale_out_requires_running_cluster() {
        let (_, svc) = service(FakeProvisioner::new());
        svc.define_cluster(definition("demo", "master", &["master"]))
            .await
            .unwrap();

        let err = svc
            .scale_out(
                "demo",
                ScaleOutRequest {
                    nodes: vec![node_def("w9")],
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_scale_out_then_scale_in() {
        let (ledger, svc) = service(FakeProvisioner::new());
        svc.define_cluster(definition("demo", "master", &["master"]))
            .await
            .unwrap();
        let job = svc.deploy_cluster("demo").await.unwrap();
        wait_for_job(&ledger, job).await;

        let job = svc
            .scale_out(
                "demo",
                ScaleOutRequest {
                    nodes: vec![node_def("w1"), node_def("w2")],
                },
            )
            .await
            .unwrap();
        assert_eq!(wait_for_job(&ledger, job).await, JobStatus::Completed);
        let cluster = svc.get_cluster("demo").await.unwrap();
        assert_eq!(cluster.nodes.len(), 3);
        assert_eq!(cluster.status, ClusterStatus::Running);

        let err = svc
            .scale_in(
                "demo",
                ScaleInRequest {
                    node_names: vec!["master".to_string()],
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::Validation(_)));

        let err = svc
            .scale_in(
                "demo",
                ScaleInRequest {
                    node_names: vec!["ghost".to_string()],
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::NotFound(_)));

        let job = svc
            .scale_in(
                "demo",
                ScaleInRequest {
                    node_names: vec!["w2".to_string()],
                },
            )
            .await
            .unwrap();
        assert_eq!(wait_for_job(&ledger, job).await, JobStatus::Completed);
        let cluster = svc.get_cluster("demo").await.unwrap();
        let names: Vec<_> = cluster.nodes.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["master", "w1"]);
    }

    #[tokio::test]
    async fn test_delete_defined_cluster() {
        let (ledger, svc) = service(FakeProvisioner::new());
        svc.define_cluster(definition("demo", "master", &["master", "w1"]))
            .await
            .unwrap();

        let job = svc.delete_cluster("demo").await.unwrap();
        assert_eq!(wait_for_job(&ledger, job).await, JobStatus::Completed);

        let err = svc.get_cluster("demo").await.unwrap_err();
        assert!(matches!(err, ClusterError::NotFound(_)));
    }
}
