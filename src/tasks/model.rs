//! Task model and lifecycle state machine.

use std::collections::BTreeSet;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoordinationError;

/// Persisted lifecycle status of a task.
///
/// `blocked` is not a status: it is derived on read for queued tasks whose
/// dependencies are not all done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting to be claimed.
    Queued,
    /// Leased to a worker, not yet executing.
    Claimed,
    /// Being executed by the claimant.
    Running,
    /// Completed with approved evidence.
    Done,
    /// Execution failed or evidence was rejected.
    Failed,
}

impl TaskStatus {
    /// Check if this status allows transitioning to another status.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            // Claim
            (Queued, Claimed) |
            // Start, or release/lease expiry
            (Claimed, Running) | (Claimed, Queued) |
            // Finish, or release/lease expiry
            (Running, Done) | (Running, Failed) | (Running, Queued) |
            // Retry
            (Failed, Queued)
        )
    }

    /// Statuses that hold a live claim and its locks.
    pub fn holds_lease(&self) -> bool {
        matches!(self, Self::Claimed | Self::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Claimed => "claimed",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "claimed" => Ok(Self::Claimed),
            "running" => Ok(Self::Running),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// How the task relates to other work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    #[default]
    Single,
    WorkflowStep,
    DagNode,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::WorkflowStep => "workflow_step",
            Self::DagNode => "dag_node",
        }
    }
}

impl FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "single" => Ok(Self::Single),
            "workflow_step" => Ok(Self::WorkflowStep),
            "dag_node" => Ok(Self::DagNode),
            other => Err(format!("unknown task type: {other}")),
        }
    }
}

/// Test outcome summary attached to completion evidence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResults {
    pub passed: u32,
    pub failed: u32,
}

/// Artifacts a worker submits when completing a task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Evidence {
    /// Commit hashes, PR links or patch references.
    pub diff_refs: Vec<String>,
    pub logs: Vec<String>,
    pub test_results: Option<TestResults>,
    /// Branch the change was written to.
    pub target_branch: Option<String>,
    pub notes: Option<String>,
}

impl Evidence {
    pub fn is_empty(&self) -> bool {
        self.diff_refs.is_empty() && self.logs.is_empty() && self.test_results.is_none()
    }
}

/// A unit of work coordinated by the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub task_type: TaskType,
    pub status: TaskStatus,
    /// Higher runs first.
    pub priority: i32,
    /// Tasks that must be done before this one is schedulable.
    pub dependencies: Vec<Uuid>,
    /// Policy scope the task belongs to.
    pub project: Option<String>,
    pub needs_secrets: bool,
    /// Glob patterns locked for the duration of a claim.
    pub lock_paths: Vec<String>,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub claim_ttl_secs: Option<u64>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Decision record of the policy snapshot applied at claim time.
    pub policy_ref: Option<Uuid>,
    pub evidence: Option<Evidence>,
    /// Failures so far.
    pub attempts: u32,
    pub max_retries: u32,
    /// When a failed task becomes eligible for requeue. `None` on a failed
    /// task means the failure is terminal.
    pub retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    /// Derived on read: queued with at least one dependency not done.
    #[serde(default)]
    pub blocked: bool,
}

impl Task {
    /// Build a fresh queued task.
    pub fn from_new(new: NewTask, default_max_retries: u32, now: DateTime<Utc>) -> Self {
        Self {
            id: new.id.unwrap_or_else(Uuid::new_v4),
            title: new.title.trim().to_string(),
            description: new.description,
            task_type: new.task_type,
            status: TaskStatus::Queued,
            priority: new.priority,
            dependencies: new.dependencies.into_iter().collect::<BTreeSet<_>>().into_iter().collect(),
            project: new.project.filter(|p| !p.trim().is_empty()),
            needs_secrets: new.needs_secrets,
            lock_paths: dedup_preserving_order(new.lock_paths),
            claimed_by: None,
            claimed_at: None,
            claim_ttl_secs: None,
            last_heartbeat: None,
            policy_ref: None,
            evidence: None,
            attempts: 0,
            max_retries: new.max_retries.unwrap_or(default_max_retries),
            retry_at: None,
            last_error: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
            blocked: false,
        }
    }

    /// When the current lease lapses, if the task holds one.
    pub fn lease_expires_at(&self) -> Option<DateTime<Utc>> {
        let heartbeat = self.last_heartbeat?;
        let ttl = self.claim_ttl_secs?;
        Some(heartbeat + Duration::seconds(ttl as i64))
    }

    /// A lease has lapsed once `now - last_heartbeat > ttl`.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status.holds_lease()
            && self.lease_expires_at().map(|at| now > at).unwrap_or(true)
    }

    pub fn is_claimed_by(&self, worker_id: &str) -> bool {
        self.status.holds_lease() && self.claimed_by.as_deref() == Some(worker_id)
    }

    /// Apply a status change, rejecting edges the state machine forbids.
    pub fn transition_to(
        &mut self,
        target: TaskStatus,
        now: DateTime<Utc>,
    ) -> Result<(), CoordinationError> {
        if !self.status.can_transition_to(target) {
            return Err(CoordinationError::InvalidTransition {
                id: self.id,
                from: self.status,
                to: target,
            });
        }
        self.status = target;
        self.updated_at = now;
        Ok(())
    }

    /// Drop every claim field. Used on release, lease expiry and finish.
    pub fn clear_claim(&mut self) {
        self.claimed_by = None;
        self.claimed_at = None;
        self.claim_ttl_secs = None;
        self.last_heartbeat = None;
    }
}

fn dedup_preserving_order(items: Vec<String>) -> Vec<String> {
    let mut seen = BTreeSet::new();
    items
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty() && seen.insert(s.clone()))
        .collect()
}

/// Request to create a task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NewTask {
    /// Caller-assigned id, for workflows that wire dependencies up front.
    pub id: Option<Uuid>,
    pub title: String,
    pub description: String,
    pub task_type: TaskType,
    pub priority: i32,
    pub dependencies: Vec<Uuid>,
    pub lock_paths: Vec<String>,
    pub project: Option<String>,
    pub needs_secrets: bool,
    pub max_retries: Option<u32>,
}

impl NewTask {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn depends_on(mut self, id: Uuid) -> Self {
        self.dependencies.push(id);
        self
    }

    pub fn lock_path(mut self, pattern: impl Into<String>) -> Self {
        self.lock_paths.push(pattern.into());
        self
    }

    pub fn in_project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }

    pub fn needing_secrets(mut self) -> Self {
        self.needs_secrets = true;
        self
    }

    pub fn with_max_retries(mut self, n: u32) -> Self {
        self.max_retries = Some(n);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowed_transitions() {
        use TaskStatus::*;
        assert!(Queued.can_transition_to(Claimed));
        assert!(Claimed.can_transition_to(Running));
        assert!(Claimed.can_transition_to(Queued));
        assert!(Running.can_transition_to(Done));
        assert!(Running.can_transition_to(Failed));
        assert!(Running.can_transition_to(Queued));
        assert!(Failed.can_transition_to(Queued));
    }

    #[test]
    fn forbidden_transitions() {
        use TaskStatus::*;
        assert!(!Queued.can_transition_to(Running));
        assert!(!Queued.can_transition_to(Done));
        assert!(!Claimed.can_transition_to(Done));
        assert!(!Claimed.can_transition_to(Failed));
        assert!(!Done.can_transition_to(Queued));
        assert!(!Done.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Running));
    }

    #[test]
    fn transition_to_reports_edge() {
        let mut task = Task::from_new(NewTask::new("t"), 3, Utc::now());
        let err = task.transition_to(TaskStatus::Done, Utc::now()).unwrap_err();
        match err {
            CoordinationError::InvalidTransition { from, to, .. } => {
                assert_eq!(from, TaskStatus::Queued);
                assert_eq!(to, TaskStatus::Done);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(task.status, TaskStatus::Queued);
    }

    #[test]
    fn status_round_trips_through_str() {
        for s in ["queued", "claimed", "running", "done", "failed"] {
            assert_eq!(s.parse::<TaskStatus>().unwrap().to_string(), s);
        }
        assert!("blocked".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn lease_expiry_is_strict() {
        let now = Utc::now();
        let mut task = Task::from_new(NewTask::new("t"), 3, now);
        task.status = TaskStatus::Claimed;
        task.last_heartbeat = Some(now);
        task.claim_ttl_secs = Some(30);

        assert!(!task.lease_expired(now + Duration::seconds(30)));
        assert!(task.lease_expired(now + Duration::seconds(31)));
    }

    #[test]
    fn new_task_normalizes_inputs() {
        let dep = Uuid::new_v4();
        let task = Task::from_new(
            NewTask::new("  build  ")
                .depends_on(dep)
                .depends_on(dep)
                .lock_path("src/**")
                .lock_path(" src/** ")
                .lock_path(""),
            2,
            Utc::now(),
        );
        assert_eq!(task.title, "build");
        assert_eq!(task.dependencies, vec![dep]);
        assert_eq!(task.lock_paths, vec!["src/**".to_string()]);
        assert_eq!(task.max_retries, 2);
    }

    #[test]
    fn empty_evidence() {
        assert!(Evidence::default().is_empty());
        let e = Evidence {
            logs: vec!["ok".into()],
            ..Default::default()
        };
        assert!(!e.is_empty());
    }
}
