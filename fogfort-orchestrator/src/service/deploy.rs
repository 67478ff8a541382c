//! Deployment Service
//!
//! Workflows that act on cluster nodes: deploy, scale-out, scale-in and
//! terminate.
//!
//! Every remote call (provisioner or runner) sits between two ledger calls
//! and never inside one. A deployment runs the master pipeline first, then
//! one pipeline per worker concurrently. Each pipeline reports a
//! [`PipelineOutcome`]; a failed worker pipeline never stops its siblings.

use chrono::Utc;
use fogfort_core::domain::cluster::ClusterStatus;
use fogfort_core::domain::job::{JobStatus, TaskExecution};
use fogfort_core::domain::node::{Node, NodeStatus};
use fogfort_runner::markers::{self, JOIN_TOKEN_KEY};
use fogfort_runner::{ExecutionLog, ScriptRunner};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::job::fail_open_tasks;
use super::scripts::ScriptTemplates;
use crate::ledger::{ClusterJobPlan, Ledger, LedgerError, NodeRef, ProvisioningOutcome};
use crate::provisioner::{ProvisionError, ProvisionerRegistry};

/// Job variable prefix under which each pipeline's outcome is recorded
pub const PIPELINE_VARIABLE_PREFIX: &str = "pipeline.";

/// How failed worker pipelines affect the job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkerFailurePolicy {
    /// The job completes as long as the master pipeline succeeded
    #[default]
    BestEffort,
    /// Any failed worker pipeline fails the job
    Strict,
}

impl WorkerFailurePolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "best-effort" | "best_effort" => Some(WorkerFailurePolicy::BestEffort),
            "strict" => Some(WorkerFailurePolicy::Strict),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkerFailurePolicy::BestEffort => "best-effort",
            WorkerFailurePolicy::Strict => "strict",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeploySettings {
    /// Upper bound on worker pipelines running at once, across all jobs
    pub max_parallel_pipelines: usize,
    /// Per-script timeout; `None` waits indefinitely
    pub script_timeout: Option<Duration>,
    pub worker_failure_policy: WorkerFailurePolicy,
}

impl Default for DeploySettings {
    fn default() -> Self {
        Self {
            max_parallel_pipelines: 8,
            script_timeout: None,
            worker_failure_policy: WorkerFailurePolicy::BestEffort,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Provision,
    JoinToken,
    Bootstrap,
    Release,
}

impl PipelineStage {
    pub fn as_str(self) -> &'static str {
        match self {
            PipelineStage::Provision => "provision",
            PipelineStage::JoinToken => "join-token",
            PipelineStage::Bootstrap => "bootstrap",
            PipelineStage::Release => "release",
        }
    }
}

/// Result of one node's pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    Completed,
    Failed {
        /// `None` when the pipeline died outside any stage
        stage: Option<PipelineStage>,
        reason: String,
    },
}

impl PipelineOutcome {
    fn failed(stage: PipelineStage, err: impl fmt::Display) -> Self {
        PipelineOutcome::Failed {
            stage: Some(stage),
            reason: err.to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, PipelineOutcome::Completed)
    }
}

impl fmt::Display for PipelineOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineOutcome::Completed => f.write_str("COMPLETED"),
            PipelineOutcome::Failed {
                stage: Some(stage),
                reason,
            } => write!(f, "FAILED: {}: {}", stage.as_str(), reason),
            PipelineOutcome::Failed {
                stage: None,
                reason,
            } => write!(f, "FAILED: {}", reason),
        }
    }
}

/// Why a pipeline step stopped
#[derive(Debug, Error)]
enum StepError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error("script '{0}' failed")]
    Script(String),

    #[error("result '{0}' missing from script output")]
    MissingResult(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentKind {
    /// Master pipeline followed by every worker
    Deploy,
    /// Worker pipelines for newly added nodes only
    ScaleOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseKind {
    ScaleIn,
    Terminate,
}

/// Summary of a finished workflow; the ledger holds the same information
#[derive(Debug, Clone)]
pub struct DeploymentReport {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub master: Option<PipelineOutcome>,
    pub nodes: Vec<(String, PipelineOutcome)>,
}

fn ssh_username(node: &Node) -> &str {
    node.ssh_connection_parameters
        .as_ref()
        .and_then(|p| p.username.as_deref())
        .unwrap_or("ubuntu")
}

/// Runs a pipeline on its own task so a panic becomes a failed outcome
async fn isolated<F>(pipeline: F) -> PipelineOutcome
where
    F: Future<Output = PipelineOutcome> + Send + 'static,
{
    match tokio::spawn(pipeline).await {
        Ok(outcome) => outcome,
        Err(e) => PipelineOutcome::Failed {
            stage: None,
            reason: e.to_string(),
        },
    }
}

/// Drives node workflows against the ledger, the provisioners and the runner
#[derive(Clone)]
pub struct Orchestrator {
    ledger: Arc<dyn Ledger>,
    provisioners: Arc<ProvisionerRegistry>,
    runner: Arc<dyn ScriptRunner>,
    scripts: Arc<ScriptTemplates>,
    settings: DeploySettings,
    pipelines: Arc<Semaphore>,
}

impl Orchestrator {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        provisioners: ProvisionerRegistry,
        runner: Arc<dyn ScriptRunner>,
        scripts: ScriptTemplates,
        settings: DeploySettings,
    ) -> Self {
        let permits = settings.max_parallel_pipelines.max(1);
        Self {
            ledger,
            provisioners: Arc::new(provisioners),
            runner,
            scripts: Arc::new(scripts),
            settings,
            pipelines: Arc::new(Semaphore::new(permits)),
        }
    }

    pub fn settings(&self) -> &DeploySettings {
        &self.settings
    }

    /// Runs a deployment in the background
    pub fn spawn_deployment(
        &self,
        plan: ClusterJobPlan,
        kind: DeploymentKind,
    ) -> JoinHandle<DeploymentReport> {
        let orchestrator = self.clone();
        tokio::spawn(async move { orchestrator.run_deployment(plan, kind).await })
    }

    /// Runs a release in the background
    pub fn spawn_release(&self, plan: ClusterJobPlan, kind: ReleaseKind) -> JoinHandle<DeploymentReport> {
        let orchestrator = self.clone();
        tokio::spawn(async move { orchestrator.run_release(plan, kind).await })
    }

    // =========================================================================
    // Deploy and scale-out
    // =========================================================================

    pub async fn run_deployment(&self, plan: ClusterJobPlan, kind: DeploymentKind) -> DeploymentReport {
        let job_id = plan.job_id;
        tracing::info!(
            "Job {} started: {:?} of cluster {} with {} worker(s)",
            job_id,
            kind,
            plan.cluster_name,
            plan.workers.len()
        );

        let mut report = DeploymentReport {
            job_id,
            status: JobStatus::Failed,
            master: None,
            nodes: Vec::new(),
        };

        if let Err(e) = self.ledger.set_job_status(job_id, JobStatus::InProgress).await {
            tracing::error!("Job {} could not be started: {}", job_id, e);
            self.close_deployment(&plan, kind, JobStatus::Failed).await;
            return report;
        }

        if kind == DeploymentKind::Deploy {
            let orchestrator = self.clone();
            let master_plan = plan.clone();
            let outcome =
                isolated(async move { orchestrator.master_pipeline(&master_plan).await }).await;
            self.record_outcome(job_id, &plan.master.name, &outcome).await;

            if !outcome.is_success() {
                tracing::error!(
                    "Master pipeline of cluster {} failed, no worker started: {}",
                    plan.cluster_name,
                    outcome
                );
                report.master = Some(outcome);
                self.close_deployment(&plan, kind, JobStatus::Failed).await;
                return report;
            }
            report.master = Some(outcome);
        }

        let outcomes = self.worker_pipelines(&plan).await;
        for (name, outcome) in &outcomes {
            self.record_outcome(job_id, name, outcome).await;
        }

        let any_failed = outcomes.iter().any(|(_, o)| !o.is_success());
        report.status = match (self.settings.worker_failure_policy, any_failed) {
            (WorkerFailurePolicy::Strict, true) => JobStatus::Failed,
            _ => JobStatus::Completed,
        };
        report.nodes = outcomes;

        self.close_deployment(&plan, kind, report.status).await;
        report
    }

    /// Provisions the master and runs its install script
    async fn master_pipeline(&self, plan: &ClusterJobPlan) -> PipelineOutcome {
        if let Err(e) = self.provision_node(plan.job_id, &plan.master).await {
            return PipelineOutcome::failed(PipelineStage::Provision, e);
        }

        let scripts = &self.scripts;
        let env_vars = &plan.env_vars;
        match self
            .execute_script(plan.job_id, plan.master.id, "Run master install scripts", |node| {
                scripts.master_script(ssh_username(node), env_vars)
            })
            .await
        {
            Ok(_) => PipelineOutcome::Completed,
            Err(e) => PipelineOutcome::failed(PipelineStage::Bootstrap, e),
        }
    }

    /// Starts one pipeline per worker and waits for all of them
    async fn worker_pipelines(&self, plan: &ClusterJobPlan) -> Vec<(String, PipelineOutcome)> {
        let shared = Arc::new(plan.clone());
        let mut handles = Vec::with_capacity(plan.workers.len());

        for worker in plan.workers.iter().cloned() {
            let orchestrator = self.clone();
            let plan = Arc::clone(&shared);
            let name = worker.name.clone();

            let handle = tokio::spawn(async move {
                let _permit = match Arc::clone(&orchestrator.pipelines).acquire_owned().await {
                    Ok(permit) => permit,
                    Err(e) => {
                        return PipelineOutcome::Failed {
                            stage: None,
                            reason: e.to_string(),
                        };
                    }
                };
                orchestrator.worker_pipeline(&plan, &worker).await
            });
            handles.push((name, handle));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for (name, handle) in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!("Worker pipeline of node {} aborted: {}", name, e);
                    PipelineOutcome::Failed {
                        stage: None,
                        reason: e.to_string(),
                    }
                }
            };
            if !outcome.is_success() {
                tracing::warn!("Worker pipeline of node {} failed: {}", name, outcome);
            }
            outcomes.push((name, outcome));
        }
        outcomes
    }

    /// Provisions a worker, fetches a join token from the master and runs
    /// the worker install script
    async fn worker_pipeline(&self, plan: &ClusterJobPlan, worker: &NodeRef) -> PipelineOutcome {
        if let Err(e) = self.provision_node(plan.job_id, worker).await {
            return PipelineOutcome::failed(PipelineStage::Provision, e);
        }

        let token = match self.fetch_join_token(plan, &worker.name).await {
            Ok(token) => token,
            Err(e) => return PipelineOutcome::failed(PipelineStage::JoinToken, e),
        };

        let description = format!("Run worker install scripts on node: {}", worker.name);
        let scripts = &self.scripts;
        let env_vars = &plan.env_vars;
        let token = token.as_str();
        match self
            .execute_script(plan.job_id, worker.id, &description, |node| {
                scripts.worker_script(ssh_username(node), env_vars, token)
            })
            .await
        {
            Ok(_) => PipelineOutcome::Completed,
            Err(e) => PipelineOutcome::failed(PipelineStage::Bootstrap, e),
        }
    }

    /// Runs the join-token script on the master and reads the token from
    /// its output
    async fn fetch_join_token(&self, plan: &ClusterJobPlan, worker_name: &str) -> Result<String, StepError> {
        let description = format!("Create join token for node: {}", worker_name);
        let join_script = self.scripts.join_token_script();
        let execution = self
            .execute_script(plan.job_id, plan.master.id, &description, |_| {
                join_script.to_string()
            })
            .await?;

        let store = self.runner.log_store();
        let results = markers::read_results(store.as_ref(), execution.log_id()).await;
        results
            .get(JOIN_TOKEN_KEY)
            .cloned()
            .ok_or(StepError::MissingResult(JOIN_TOKEN_KEY))
    }

    // =========================================================================
    // Steps shared by all pipelines
    // =========================================================================

    /// Creates the "Create node" task, calls the provisioner and folds the
    /// outcome into the task and the node
    async fn provision_node(&self, job_id: Uuid, node: &NodeRef) -> Result<(), StepError> {
        let ticket = self
            .ledger
            .begin_node_task(job_id, node.id, &format!("Create node: {}", node.name))
            .await?;

        let log = ExecutionLog::new(self.runner.log_store(), ticket.execution.log_id());
        let candidate = &ticket.node.node_candidate;
        log.info(format!(
            "Creating node {} from candidate {} on {}/{}",
            node.name, candidate.id, candidate.cloud.provider, candidate.cloud.cloud_id
        ))
        .await;

        let result = self.provisioners.create_node(candidate, &ticket.node.name).await;

        let mut execution = ticket.execution.clone();
        let (details, failure) = match result {
            Ok(details) => {
                log.info(format!(
                    "Node {} created with provider id {}",
                    node.name, details.provider_id
                ))
                .await;
                execution.finish(true, Utc::now());
                (Some(details), None)
            }
            Err(e) => {
                log.error(format!("Node {} could not be created: {}", node.name, e))
                    .await;
                execution.finish(false, Utc::now());
                (None, Some(e))
            }
        };

        self.ledger
            .finish_provisioning(
                ticket.task_id,
                node.id,
                &ProvisioningOutcome { execution, details },
            )
            .await?;

        match failure {
            None => Ok(()),
            Some(e) => Err(e.into()),
        }
    }

    /// Creates a task on `node_id`, runs the script built from the node's
    /// current record and closes the task with the runner's outcome
    async fn execute_script<F>(
        &self,
        job_id: Uuid,
        node_id: Uuid,
        description: &str,
        build: F,
    ) -> Result<TaskExecution, StepError>
    where
        F: FnOnce(&Node) -> String + Send,
    {
        let ticket = self
            .ledger
            .begin_node_task(job_id, node_id, description)
            .await?;
        tracing::info!("Executing '{}' at node {}", description, ticket.node.name);

        let command = build(&ticket.node);
        let outcome = self
            .runner
            .run(
                &command,
                ticket.node.ssh_connection_parameters.as_ref(),
                ticket.execution.clone(),
                self.settings.script_timeout,
            )
            .await;

        self.ledger.finish_task(ticket.task_id, &outcome).await?;

        if outcome.success() {
            Ok(outcome)
        } else {
            Err(StepError::Script(description.to_string()))
        }
    }

    async fn record_outcome(&self, job_id: Uuid, node_name: &str, outcome: &PipelineOutcome) {
        let key = format!("{}{}", PIPELINE_VARIABLE_PREFIX, node_name);
        if let Err(e) = self
            .ledger
            .set_job_variable(job_id, &key, &outcome.to_string())
            .await
        {
            tracing::warn!("Failed to record {} on job {}: {}", key, job_id, e);
        }
    }

    async fn close_deployment(&self, plan: &ClusterJobPlan, kind: DeploymentKind, status: JobStatus) {
        self.close_open_tasks(plan.job_id).await;
        self.set_job_status(plan.job_id, status).await;

        let cluster_status = match (kind, status) {
            (DeploymentKind::Deploy, JobStatus::Completed) => ClusterStatus::Running,
            (DeploymentKind::Deploy, _) => ClusterStatus::Failed,
            (DeploymentKind::ScaleOut, _) => ClusterStatus::Running,
        };
        self.set_cluster_status(plan.cluster_id, cluster_status).await;
    }

    /// Fails tasks a crashed pipeline left in progress
    async fn close_open_tasks(&self, job_id: Uuid) {
        let job = match self.ledger.find_job(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => return,
            Err(e) => {
                tracing::error!("Failed to read job {}: {}", job_id, e);
                return;
            }
        };
        match fail_open_tasks(self.ledger.as_ref(), &job).await {
            Ok(0) => {}
            Ok(n) => tracing::warn!("Job {}: {} task(s) left open were marked FAILED", job_id, n),
            Err(e) => tracing::error!("Failed to close open tasks of job {}: {}", job_id, e),
        }
    }

    async fn set_job_status(&self, job_id: Uuid, status: JobStatus) {
        match self.ledger.set_job_status(job_id, status).await {
            Ok(()) => tracing::info!("Job {} completed with status: {:?}", job_id, status),
            Err(e) => tracing::error!("Failed to set job {} to {}: {}", job_id, status, e),
        }
    }

    async fn set_cluster_status(&self, cluster_id: Uuid, status: ClusterStatus) {
        if let Err(e) = self.ledger.set_cluster_status(cluster_id, status).await {
            tracing::error!("Failed to set cluster {} to {}: {}", cluster_id, status, e);
        }
    }

    // =========================================================================
    // Scale-in and terminate
    // =========================================================================

    /// Releases nodes one by one. Scale-in releases the plan's workers;
    /// terminate releases every node, master last, and deletes the cluster
    /// once nothing is left.
    pub async fn run_release(&self, plan: ClusterJobPlan, kind: ReleaseKind) -> DeploymentReport {
        let job_id = plan.job_id;
        tracing::info!("Job {} started: {:?} of cluster {}", job_id, kind, plan.cluster_name);

        let mut targets = plan.workers.clone();
        if kind == ReleaseKind::Terminate {
            targets.push(plan.master.clone());
        }

        let mut report = DeploymentReport {
            job_id,
            status: JobStatus::Failed,
            master: None,
            nodes: Vec::new(),
        };

        if let Err(e) = self.ledger.set_job_status(job_id, JobStatus::InProgress).await {
            tracing::error!("Job {} could not be started: {}", job_id, e);
            self.set_job_status(job_id, JobStatus::Failed).await;
            self.set_cluster_status(plan.cluster_id, ClusterStatus::Failed).await;
            return report;
        }

        for node in &targets {
            let orchestrator = self.clone();
            let target = node.clone();
            let outcome =
                isolated(async move { orchestrator.release_node(job_id, &target).await }).await;
            self.record_outcome(job_id, &node.name, &outcome).await;
            if !outcome.is_success() {
                tracing::warn!("Release of node {} failed: {}", node.name, outcome);
            }
            report.nodes.push((node.name.clone(), outcome));
        }

        let all_released = report.nodes.iter().all(|(_, o)| o.is_success());
        report.status = if all_released {
            JobStatus::Completed
        } else {
            JobStatus::Failed
        };
        self.close_open_tasks(job_id).await;
        self.set_job_status(job_id, report.status).await;

        match (kind, all_released) {
            (ReleaseKind::ScaleIn, _) => {
                self.set_cluster_status(plan.cluster_id, ClusterStatus::Running).await;
            }
            (ReleaseKind::Terminate, true) => match self.ledger.delete_cluster(plan.cluster_id).await {
                Ok(()) => tracing::info!("Cluster {} deleted", plan.cluster_name),
                Err(e) => tracing::error!("Failed to delete cluster {}: {}", plan.cluster_name, e),
            },
            (ReleaseKind::Terminate, false) => {
                self.set_cluster_status(plan.cluster_id, ClusterStatus::Failed).await;
            }
        }

        report
    }

    /// One "Delete node" task; only CREATED nodes are sent to the provisioner
    async fn release_node(&self, job_id: Uuid, node: &NodeRef) -> PipelineOutcome {
        let ticket = match self
            .ledger
            .begin_node_task(job_id, node.id, &format!("Delete node: {}", node.name))
            .await
        {
            Ok(ticket) => ticket,
            Err(e) => return PipelineOutcome::failed(PipelineStage::Release, e),
        };

        let log = ExecutionLog::new(self.runner.log_store(), ticket.execution.log_id());
        let result = if ticket.node.status == NodeStatus::Created {
            log.info(format!(
                "Releasing node {} (provider id {})",
                node.name,
                ticket.node.provider_id.as_deref().unwrap_or("-")
            ))
            .await;
            self.provisioners.delete_node(&ticket.node).await
        } else {
            log.info(format!(
                "Node {} is {}, nothing to release",
                node.name,
                ticket.node.status.as_str()
            ))
            .await;
            Ok(())
        };

        let mut execution = ticket.execution.clone();
        let outcome = match result {
            Ok(()) => {
                execution.finish(true, Utc::now());
                PipelineOutcome::Completed
            }
            Err(e) => {
                log.error(format!("Node {} could not be released: {}", node.name, e))
                    .await;
                execution.finish(false, Utc::now());
                PipelineOutcome::failed(PipelineStage::Release, e)
            }
        };

        if let Err(e) = self.ledger.finish_task(ticket.task_id, &execution).await {
            return PipelineOutcome::failed(PipelineStage::Release, e);
        }

        if outcome.is_success() {
            if let Err(e) = self.ledger.remove_node(node.id).await {
                return PipelineOutcome::failed(PipelineStage::Release, e);
            }
        }
        outcome
    }
}
