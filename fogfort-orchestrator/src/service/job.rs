//! Job Service
//!
//! Read access to jobs and their execution logs, plus start-up recovery.

use chrono::Utc;
use fogfort_core::domain::cluster::ClusterStatus;
use fogfort_core::domain::job::{Job, JobStatus, Task};
use fogfort_runner::LogStore;
use std::sync::Arc;
use uuid::Uuid;

use crate::ledger::{Ledger, LedgerError};

/// Service error type
#[derive(Debug)]
pub enum JobError {
    NotFound(Uuid),
    TaskNotFound(Uuid),
    ExecutionNotFound { task_id: Uuid, index: usize },
    LogUnavailable(String),
    Ledger(LedgerError),
}

impl From<LedgerError> for JobError {
    fn from(err: LedgerError) -> Self {
        JobError::Ledger(err)
    }
}

pub struct JobService {
    ledger: Arc<dyn Ledger>,
    logs: Arc<dyn LogStore>,
}

impl JobService {
    pub fn new(ledger: Arc<dyn Ledger>, logs: Arc<dyn LogStore>) -> Self {
        Self { ledger, logs }
    }

    /// Get a job by ID with its tasks and executions
    pub async fn get_job(&self, id: Uuid) -> Result<Job, JobError> {
        self.ledger
            .find_job(id)
            .await?
            .ok_or(JobError::NotFound(id))
    }

    /// List all jobs, newest first
    pub async fn list_jobs(&self) -> Result<Vec<Job>, JobError> {
        Ok(self.ledger.list_jobs().await?)
    }

    pub async fn get_task(&self, task_id: Uuid) -> Result<Task, JobError> {
        self.ledger
            .find_task(task_id)
            .await?
            .ok_or(JobError::TaskNotFound(task_id))
    }

    /// Raw log of one execution; empty when nothing was written yet
    pub async fn read_execution_log(&self, task_id: Uuid, index: usize) -> Result<Vec<u8>, JobError> {
        let task = self.get_task(task_id).await?;
        let execution = task
            .executions
            .get(index)
            .ok_or(JobError::ExecutionNotFound { task_id, index })?;

        match self.logs.read(execution.log_id()).await {
            Ok(bytes) => Ok(bytes.unwrap_or_default()),
            Err(e) => Err(JobError::LogUnavailable(e.to_string())),
        }
    }

    /// Number of jobs still CREATED or IN_PROGRESS
    pub async fn active_job_count(&self) -> Result<usize, JobError> {
        Ok(self
            .ledger
            .count_jobs_by_status(&[JobStatus::Created, JobStatus::InProgress])
            .await?)
    }
}

/// Closes every open task of `job` as FAILED, terminating its open
/// executions first. Returns the number of tasks closed.
pub async fn fail_open_tasks(ledger: &dyn Ledger, job: &Job) -> Result<usize, LedgerError> {
    let now = Utc::now();
    let mut closed = 0;
    for task in job.tasks.iter().filter(|t| !t.status.is_terminal()) {
        for (index, execution) in task.executions.iter().enumerate() {
            if execution.terminated() {
                continue;
            }
            let mut outcome = execution.clone();
            outcome.finish(false, now);
            ledger.record_execution_result(task.id, index, &outcome).await?;
        }
        ledger.set_task_status(task.id, JobStatus::Failed).await?;
        closed += 1;
    }
    Ok(closed)
}

/// Status a cluster falls back to when the job that claimed it can no
/// longer finish; `None` for statuses no job holds
pub fn abandoned_cluster_status(status: ClusterStatus) -> Option<ClusterStatus> {
    match status {
        ClusterStatus::Submitted | ClusterStatus::Terminating => Some(ClusterStatus::Failed),
        ClusterStatus::Scaling => Some(ClusterStatus::Running),
        _ => None,
    }
}

/// Marks jobs and tasks left unfinished by a previous process as FAILED
/// and hands their clusters back.
///
/// Background workflows do not survive a restart, so anything still open
/// at start-up can never finish.
pub async fn fail_interrupted_jobs(ledger: &dyn Ledger) -> Result<usize, LedgerError> {
    let mut failed = 0;
    for job in ledger.list_jobs().await? {
        if job.status.is_terminal() {
            continue;
        }

        fail_open_tasks(ledger, &job).await?;
        ledger
            .set_job_variable(job.id, "interrupted", "orchestrator restarted")
            .await?;
        ledger.set_job_status(job.id, JobStatus::Failed).await?;

        if let Some(cluster_id) = job.cluster_id {
            release_cluster(ledger, cluster_id).await?;
        }

        tracing::warn!("Job {} was interrupted by a restart and is now FAILED", job.id);
        failed += 1;
    }
    Ok(failed)
}

async fn release_cluster(ledger: &dyn Ledger, cluster_id: Uuid) -> Result<(), LedgerError> {
    let Some(cluster) = ledger.find_cluster(cluster_id).await? else {
        return Ok(());
    };
    let Some(to) = abandoned_cluster_status(cluster.status) else {
        return Ok(());
    };

    if ledger
        .compare_and_set_cluster_status(cluster_id, &[cluster.status], to)
        .await?
    {
        tracing::warn!(
            "Cluster {} moved from {} to {} after an interrupted job",
            cluster.name,
            cluster.status,
            to
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;
    use crate::service::testing::insert_cluster;
    use fogfort_core::domain::job::JobType;
    use fogfort_runner::MemoryLogStore;

    #[tokio::test]
    async fn test_read_execution_log() {
        let ledger = Arc::new(MemoryLedger::new());
        let logs = Arc::new(MemoryLogStore::new());
        let svc = JobService::new(ledger.clone(), logs.clone());

        let job_id = ledger
            .create_job(JobType::DeployCluster, JobStatus::Created, None)
            .await
            .unwrap();
        let handle = ledger.add_task(job_id, "Run script", None).await.unwrap();

        assert!(svc.read_execution_log(handle.task_id, 0).await.unwrap().is_empty());

        logs.append(handle.execution.log_id(), b"hello\n").await.unwrap();
        assert_eq!(
            svc.read_execution_log(handle.task_id, 0).await.unwrap(),
            b"hello\n".to_vec()
        );

        assert!(matches!(
            svc.read_execution_log(handle.task_id, 3).await,
            Err(JobError::ExecutionNotFound { index: 3, .. })
        ));
        assert!(matches!(
            svc.read_execution_log(Uuid::new_v4(), 0).await,
            Err(JobError::TaskNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_active_job_count() {
        let ledger = Arc::new(MemoryLedger::new());
        let svc = JobService::new(ledger.clone(), Arc::new(MemoryLogStore::new()));

        let running = ledger
            .create_job(JobType::DeployCluster, JobStatus::InProgress, None)
            .await
            .unwrap();
        ledger
            .create_job(JobType::ScaleOut, JobStatus::Created, None)
            .await
            .unwrap();
        ledger
            .create_job(JobType::ScaleIn, JobStatus::Completed, None)
            .await
            .unwrap();
        assert_eq!(svc.active_job_count().await.unwrap(), 2);

        ledger
            .set_job_status(running, JobStatus::Failed)
            .await
            .unwrap();
        assert_eq!(svc.active_job_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_fail_interrupted_jobs() {
        let ledger = MemoryLedger::new();
        let open = ledger
            .create_job(JobType::DeployCluster, JobStatus::InProgress, None)
            .await
            .unwrap();
        let handle = ledger.add_task(open, "Create node: w1", None).await.unwrap();
        let done = ledger
            .create_job(JobType::ScaleIn, JobStatus::Completed, None)
            .await
            .unwrap();

        assert_eq!(fail_interrupted_jobs(&ledger).await.unwrap(), 1);

        let job = ledger.find_job(open).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.ended_at.is_some_and(|t| t <= Utc::now()));
        assert_eq!(job.variables.get("interrupted").map(String::as_str), Some("orchestrator restarted"));
        let task = ledger.find_task(handle.task_id).await.unwrap().unwrap();
        assert_eq!(task.status, JobStatus::Failed);

        let untouched = ledger.find_job(done).await.unwrap().unwrap();
        assert_eq!(untouched.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_interrupted_jobs_hand_back_their_clusters() {
        let cases = [
            (ClusterStatus::Submitted, ClusterStatus::Failed),
            (ClusterStatus::Scaling, ClusterStatus::Running),
            (ClusterStatus::Terminating, ClusterStatus::Failed),
        ];
        for (claimed, expected) in cases {
            let ledger = MemoryLedger::new();
            let cluster = insert_cluster(&ledger, "demo", &["w1"]).await;
            ledger.set_cluster_status(cluster.id, claimed).await.unwrap();
            let job_id = ledger
                .create_job(JobType::DeployCluster, JobStatus::InProgress, Some(cluster.id))
                .await
                .unwrap();
            let handle = ledger
                .add_task(job_id, "Create node: master", None)
                .await
                .unwrap();

            assert_eq!(fail_interrupted_jobs(&ledger).await.unwrap(), 1);

            let stored = ledger.find_cluster(cluster.id).await.unwrap().unwrap();
            assert_eq!(stored.status, expected, "cluster left {}", claimed);

            let task = ledger.find_task(handle.task_id).await.unwrap().unwrap();
            assert_eq!(task.status, JobStatus::Failed);
            assert!(
                task.executions
                    .iter()
                    .all(|e| e.terminated() && !e.success())
            );
        }
    }

    #[tokio::test]
    async fn test_recovered_cluster_accepts_delete() {
        let ledger = MemoryLedger::new();
        let cluster = insert_cluster(&ledger, "demo", &[]).await;
        ledger
            .set_cluster_status(cluster.id, ClusterStatus::Submitted)
            .await
            .unwrap();
        ledger
            .create_job(JobType::DeployCluster, JobStatus::InProgress, Some(cluster.id))
            .await
            .unwrap();

        fail_interrupted_jobs(&ledger).await.unwrap();

        let claimed = ledger
            .compare_and_set_cluster_status(
                cluster.id,
                &[ClusterStatus::Defined, ClusterStatus::Running, ClusterStatus::Failed],
                ClusterStatus::Terminating,
            )
            .await
            .unwrap();
        assert!(claimed);
    }

    #[test]
    fn test_running_cluster_is_not_abandoned() {
        assert_eq!(abandoned_cluster_status(ClusterStatus::Running), None);
        assert_eq!(abandoned_cluster_status(ClusterStatus::Defined), None);
    }
}
