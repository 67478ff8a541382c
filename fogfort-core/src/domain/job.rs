//! Job domain types
//!
//! A [`Job`] groups the [`Task`]s of one orchestration run. Each task keeps
//! the history of its attempts as [`TaskExecution`] records.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Top-level orchestration record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub job_type: JobType,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub cluster_id: Option<Uuid>,
    pub variables: HashMap<String, String>,
    pub tasks: Vec<Task>,
}

impl Job {
    /// Creates a job with no tasks
    pub fn new(job_type: JobType, status: JobStatus, cluster_id: Option<Uuid>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            job_type,
            status,
            created_at: now,
            updated_at: now,
            ended_at: if status.is_terminal() { Some(now) } else { None },
            cluster_id,
            variables: HashMap::new(),
            tasks: Vec::new(),
        }
    }
}

/// Status shared by jobs and tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Created,
    InProgress,
    Completed,
    Failed,
    Cancelled,
    Unknown,
}

impl JobStatus {
    /// Terminal statuses are never left once reached
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether a record in this status may move to `next`
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        if self == next {
            return true;
        }
        if self.is_terminal() {
            return false;
        }
        !matches!(
            (self, next),
            (JobStatus::InProgress, JobStatus::Created) | (_, JobStatus::Unknown)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Created => "CREATED",
            JobStatus::InProgress => "IN_PROGRESS",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
            JobStatus::Unknown => "UNKNOWN",
        }
    }

    /// Parses the stored representation, falling back to `Unknown`
    pub fn parse(s: &str) -> Self {
        match s {
            "CREATED" => JobStatus::Created,
            "IN_PROGRESS" => JobStatus::InProgress,
            "COMPLETED" => JobStatus::Completed,
            "FAILED" => JobStatus::Failed,
            "CANCELLED" => JobStatus::Cancelled,
            _ => JobStatus::Unknown,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of orchestration operation a job performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    DeployCluster,
    ScaleOut,
    ScaleIn,
    TerminateCluster,
    Unknown,
}

impl JobType {
    pub fn as_str(self) -> &'static str {
        match self {
            JobType::DeployCluster => "DEPLOY_CLUSTER",
            JobType::ScaleOut => "SCALE_OUT",
            JobType::ScaleIn => "SCALE_IN",
            JobType::TerminateCluster => "TERMINATE_CLUSTER",
            JobType::Unknown => "UNKNOWN",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "DEPLOY_CLUSTER" => JobType::DeployCluster,
            "SCALE_OUT" => JobType::ScaleOut,
            "SCALE_IN" => JobType::ScaleIn,
            "TERMINATE_CLUSTER" => JobType::TerminateCluster,
            _ => JobType::Unknown,
        }
    }
}

/// One step of a job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub job_id: Uuid,
    pub target_node_id: Option<Uuid>,
    pub description: String,
    pub max_retries: u32,
    pub current_retry: u32,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub executions: Vec<TaskExecution>,
}

impl Task {
    /// Creates an in-progress task with a single fresh execution
    pub fn new(job_id: Uuid, description: impl Into<String>, target_node_id: Option<Uuid>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            job_id,
            target_node_id,
            description: description.into(),
            max_retries: 1,
            current_retry: 0,
            status: JobStatus::InProgress,
            created_at: now,
            updated_at: now,
            ended_at: None,
            executions: vec![TaskExecution::started_at(now)],
        }
    }
}

/// One attempt at a task
///
/// An execution is terminated once `end` is set. From then on it only
/// changes through [`TaskExecution::update_with`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskExecution {
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    log_id: String,
    success: bool,
}

impl TaskExecution {
    /// Creates an unstarted execution with a fresh log identifier
    pub fn new() -> Self {
        Self {
            start: None,
            end: None,
            log_id: format!("{}.log", Uuid::new_v4()),
            success: false,
        }
    }

    pub fn started_at(start: DateTime<Utc>) -> Self {
        Self {
            start: Some(start),
            ..Self::new()
        }
    }

    /// Rebuilds an execution from its stored fields
    pub fn from_parts(
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        log_id: String,
        success: bool,
    ) -> Self {
        Self {
            start,
            end,
            log_id,
            success,
        }
    }

    pub fn start(&self) -> Option<DateTime<Utc>> {
        self.start
    }

    pub fn end(&self) -> Option<DateTime<Utc>> {
        self.end
    }

    pub fn log_id(&self) -> &str {
        &self.log_id
    }

    pub fn success(&self) -> bool {
        self.success
    }

    pub fn terminated(&self) -> bool {
        self.end.is_some()
    }

    /// Records the moment the attempt actually began.
    ///
    /// Ignored once terminated; an earlier start is never moved later.
    pub fn mark_started(&mut self, at: DateTime<Utc>) {
        if self.terminated() {
            return;
        }
        match self.start {
            Some(start) if start <= at => {}
            _ => self.start = Some(at),
        }
    }

    /// Terminates the execution. Returns false if it was already terminated.
    pub fn finish(&mut self, success: bool, at: DateTime<Utc>) -> bool {
        if self.terminated() {
            return false;
        }
        if self.start.is_none() {
            self.start = Some(at);
        }
        self.end = Some(at);
        self.success = success;
        true
    }

    /// Folds an outcome computed elsewhere into this record.
    ///
    /// The earliest known start wins; end, success and log are taken from `other`.
    pub fn update_with(&mut self, other: &TaskExecution) {
        self.start = match (self.start, other.start) {
            (Some(mine), Some(theirs)) => Some(mine.min(theirs)),
            (mine, theirs) => mine.or(theirs),
        };
        self.end = other.end;
        self.log_id = other.log_id.clone();
        self.success = other.success;
    }
}

impl Default for TaskExecution {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_new_execution_is_not_terminated() {
        let execution = TaskExecution::new();
        assert!(!execution.terminated());
        assert!(!execution.success());
        assert!(execution.log_id().ends_with(".log"));
        assert_ne!(execution.log_id(), TaskExecution::new().log_id());
    }

    #[test]
    fn test_update_with_keeps_earliest_start() {
        let t0 = Utc::now();
        let mut stored = TaskExecution::started_at(t0);

        let mut outcome = TaskExecution::started_at(t0 + Duration::seconds(5));
        outcome.finish(true, t0 + Duration::seconds(10));

        stored.update_with(&outcome);
        assert_eq!(stored.start(), Some(t0));
        assert_eq!(stored.end(), Some(t0 + Duration::seconds(10)));
        assert!(stored.success());
        assert_eq!(stored.log_id(), outcome.log_id());
    }

    #[test]
    fn test_update_with_adopts_earlier_start() {
        let t0 = Utc::now();
        let mut stored = TaskExecution::started_at(t0);
        let mut outcome = TaskExecution::started_at(t0 - Duration::seconds(3));
        outcome.finish(false, t0);

        stored.update_with(&outcome);
        assert_eq!(stored.start(), Some(t0 - Duration::seconds(3)));
        assert!(!stored.success());
    }

    #[test]
    fn test_update_with_fills_missing_start() {
        let t0 = Utc::now();
        let mut stored = TaskExecution::new();
        let mut outcome = TaskExecution::started_at(t0);
        outcome.finish(true, t0);

        stored.update_with(&outcome);
        assert_eq!(stored.start(), Some(t0));
    }

    #[test]
    fn test_update_with_is_idempotent() {
        let t0 = Utc::now();
        let mut stored = TaskExecution::started_at(t0);
        let mut outcome = TaskExecution::started_at(t0 + Duration::seconds(1));
        outcome.finish(true, t0 + Duration::seconds(2));

        stored.update_with(&outcome);
        let once = stored.clone();
        stored.update_with(&outcome);
        assert_eq!(stored, once);
    }

    #[test]
    fn test_finish_only_once() {
        let t0 = Utc::now();
        let mut execution = TaskExecution::started_at(t0);
        assert!(execution.finish(true, t0));
        assert!(!execution.finish(false, t0 + Duration::seconds(1)));
        assert!(execution.success());
        assert_eq!(execution.end(), Some(t0));
    }

    #[test]
    fn test_mark_started_never_moves_later() {
        let t0 = Utc::now();
        let mut execution = TaskExecution::started_at(t0);
        execution.mark_started(t0 + Duration::seconds(30));
        assert_eq!(execution.start(), Some(t0));
        execution.mark_started(t0 - Duration::seconds(30));
        assert_eq!(execution.start(), Some(t0 - Duration::seconds(30)));
    }

    #[test]
    fn test_status_transitions() {
        assert!(JobStatus::Created.can_transition_to(JobStatus::InProgress));
        assert!(JobStatus::InProgress.can_transition_to(JobStatus::Completed));
        assert!(JobStatus::Created.can_transition_to(JobStatus::Failed));
        assert!(!JobStatus::InProgress.can_transition_to(JobStatus::Created));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Failed));
        assert!(!JobStatus::Failed.can_transition_to(JobStatus::InProgress));
        assert!(JobStatus::Failed.can_transition_to(JobStatus::Failed));
    }

    #[test]
    fn test_status_string_round_trip() {
        for status in [
            JobStatus::Created,
            JobStatus::InProgress,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), status);
        }
        assert_eq!(JobStatus::parse("garbage"), JobStatus::Unknown);
        assert_eq!(JobType::parse("scale_out"), JobType::ScaleOut);
    }

    #[test]
    fn test_status_serializes_screaming_case() {
        let json = serde_json::to_string(&JobStatus::InProgress).unwrap();
        assert_eq!(json, "\"IN_PROGRESS\"");
    }
}
