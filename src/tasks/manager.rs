//! Task manager: the only writer of tasks, locks and ledger rows.
//!
//! Every mutating operation runs in one store transaction. Policy denials
//! are committed (the BLOCK/REJECT record and any state change it causes)
//! and then returned as errors; every other error rolls the transaction
//! back, so a failed claim leaves no partial lock set behind.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use libsql::Connection;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::audit::recorder;
use crate::audit::{PolicyDecisionRecord, SYSTEM_ACTOR, TransitionCause, TransitionRecord};
use crate::clock::Clock;
use crate::config::{DaemonConfig, LeaseConfig, RetryConfig};
use crate::error::{CoordinationError, DatabaseError};
use crate::locks::manager as locks;
use crate::locks::{LockInfo, PathPattern};
use crate::policy::{PolicyEngine, Verdict, Violation};
use crate::store::artifacts::{self, MemoryItem, NewMemory, TaskRun};
use crate::store::rows::truncate_ts;
use crate::store::tasks as task_rows;
use crate::store::{Store, StoreTx};
use crate::tasks::model::{Evidence, NewTask, Task, TaskStatus};
use crate::tasks::retry::RetryPolicy;
use crate::tasks::scheduler::Scheduler;
use crate::workers::{self, WorkerInstance, WorkerRegistration, WorkersSnapshot, is_valid_identifier};

/// Outer error: roll back. Inner error: a denial whose decision record
/// must still commit.
type Gated<T> = Result<Result<T, CoordinationError>, CoordinationError>;

/// Result of an approved completion.
#[derive(Debug, Clone, Serialize)]
pub struct Completion {
    pub task: Task,
    /// Dependents that became schedulable because of this completion.
    pub unblocked: Vec<Task>,
}

pub struct TaskManager {
    store: Arc<Store>,
    policy: Arc<PolicyEngine>,
    clock: Arc<dyn Clock>,
    scheduler: Scheduler,
    retry: RetryPolicy,
    leases: LeaseConfig,
    default_max_retries: u32,
    fatal: watch::Sender<Option<String>>,
}

impl TaskManager {
    pub fn new(store: Arc<Store>, policy: Arc<PolicyEngine>, clock: Arc<dyn Clock>) -> Self {
        let retry = RetryConfig::default();
        let (fatal, _) = watch::channel(None);
        Self {
            scheduler: Scheduler::new(store.clone()),
            store,
            policy,
            clock,
            retry: RetryPolicy::from_config(&retry),
            leases: LeaseConfig::default(),
            default_max_retries: retry.max_retries,
            fatal,
        }
    }

    pub fn from_config(
        config: &DaemonConfig,
        store: Arc<Store>,
        policy: Arc<PolicyEngine>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::new(store, policy, clock)
            .with_leases(config.leases)
            .with_retry(RetryPolicy::from_config(&config.retry), config.retry.max_retries)
    }

    pub fn with_leases(mut self, leases: LeaseConfig) -> Self {
        self.leases = leases;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy, default_max_retries: u32) -> Self {
        self.retry = retry;
        self.default_max_retries = default_max_retries;
        self
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn policy(&self) -> &Arc<PolicyEngine> {
        &self.policy
    }

    /// Fires once with a reason when the decision ledger can no longer be
    /// written. The daemon shuts down on it.
    pub fn subscribe_fatal(&self) -> watch::Receiver<Option<String>> {
        self.fatal.subscribe()
    }

    /// Current time from the injected clock, at store precision.
    pub fn now(&self) -> DateTime<Utc> {
        truncate_ts(self.clock.now())
    }

    fn lease_ttl(&self, requested: Option<u64>) -> Result<u64, CoordinationError> {
        let max = self.leases.max_ttl.as_secs();
        match requested {
            None | Some(0) => Ok(self.leases.default_ttl.as_secs()),
            Some(secs) if secs > max => Err(CoordinationError::Validation(format!(
                "ttl of {secs}s exceeds the maximum of {max}s"
            ))),
            Some(secs) => Ok(secs),
        }
    }

    async fn finish<T>(&self, tx: StoreTx<'_>, outcome: Gated<T>) -> Result<T, CoordinationError> {
        match outcome {
            Ok(result) => {
                if let Err(e) = tx.commit().await {
                    // Every mutating transaction carries ledger rows.
                    let reason = e.to_string();
                    self.raise_fatal(&reason);
                    return Err(CoordinationError::Audit(reason));
                }
                result
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(error = %rollback, "Rollback failed");
                }
                if let CoordinationError::Audit(reason) = &e {
                    self.raise_fatal(reason);
                }
                Err(e)
            }
        }
    }

    fn raise_fatal(&self, reason: &str) {
        error!(reason, "Decision ledger write failed, shutting down");
        self.fatal.send_replace(Some(reason.to_string()));
    }

    // ── Creation ────────────────────────────────────────────────────

    pub async fn create_task(&self, new: NewTask) -> Result<Task, CoordinationError> {
        self.create_batch(vec![new])
            .await?
            .pop()
            .ok_or_else(|| CoordinationError::Validation("nothing was created".into()))
    }

    /// Create several tasks at once. Dependencies may point at other tasks
    /// in the batch; either every task is persisted or none is.
    pub async fn create_batch(&self, batch: Vec<NewTask>) -> Result<Vec<Task>, CoordinationError> {
        if batch.is_empty() {
            return Err(CoordinationError::Validation("batch is empty".into()));
        }
        let now = self.now();
        let tasks = batch
            .into_iter()
            .map(|new| self.prepare(new, now))
            .collect::<Result<Vec<_>, _>>()?;

        let tx = self.store.begin().await?;
        let outcome = self.create_in(&tx, &tasks, now).await;
        let created = self.finish(tx, outcome.map(Ok)).await?;
        for task in &created {
            info!(task_id = %task.id, title = %task.title, blocked = task.blocked, "Task created");
        }
        Ok(created)
    }

    fn prepare(&self, new: NewTask, now: DateTime<Utc>) -> Result<Task, CoordinationError> {
        if new.title.trim().is_empty() {
            return Err(CoordinationError::Validation("title must not be empty".into()));
        }
        let task = Task::from_new(new, self.default_max_retries, now);
        if let Some(project) = task.project.as_deref() {
            if !is_valid_identifier(project) {
                return Err(CoordinationError::Validation(format!("invalid project name {project:?}")));
            }
        }
        for pattern in &task.lock_paths {
            PathPattern::parse(pattern).map_err(|e| {
                CoordinationError::Validation(format!("lock path {pattern:?}: {e}"))
            })?;
        }
        Ok(task)
    }

    async fn create_in(
        &self,
        conn: &Connection,
        tasks: &[Task],
        now: DateTime<Utc>,
    ) -> Result<Vec<Task>, CoordinationError> {
        for task in tasks {
            if task_rows::get_task(conn, task.id).await?.is_some() {
                return Err(CoordinationError::Validation(format!("task {} already exists", task.id)));
            }
        }
        Scheduler::check_cycles(conn, tasks).await?;

        for task in tasks {
            task_rows::insert_task(conn, task).await?;
            record_transition(conn, task, None, SYSTEM_ACTOR, TransitionCause::Created, None, now).await?;
        }

        // Re-read so `blocked` reflects the stored graph.
        let mut created = Vec::with_capacity(tasks.len());
        for task in tasks {
            created.push(load(conn, task.id).await?);
        }
        Ok(created)
    }

    // ── Reads ───────────────────────────────────────────────────────

    pub async fn get_task(&self, id: Uuid) -> Result<Task, CoordinationError> {
        let conn = self.store.conn().await;
        load(&conn, id).await
    }

    pub async fn list_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<Task>, CoordinationError> {
        let conn = self.store.conn().await;
        Ok(task_rows::list_tasks(&conn, status).await?)
    }

    pub async fn schedulable(&self) -> Result<Vec<Task>, CoordinationError> {
        self.scheduler.schedulable().await
    }

    pub async fn next_task(&self) -> Result<Option<Task>, CoordinationError> {
        self.scheduler.next().await
    }

    pub async fn decisions(&self, task_id: Uuid) -> Result<Vec<PolicyDecisionRecord>, CoordinationError> {
        let conn = self.store.conn().await;
        load(&conn, task_id).await?;
        Ok(recorder::decisions_for_task(&conn, task_id).await?)
    }

    pub async fn recent_decisions(&self, limit: u32) -> Result<Vec<PolicyDecisionRecord>, CoordinationError> {
        let conn = self.store.conn().await;
        Ok(recorder::recent_decisions(&conn, limit).await?)
    }

    pub async fn transitions(&self, task_id: Uuid) -> Result<Vec<TransitionRecord>, CoordinationError> {
        let conn = self.store.conn().await;
        load(&conn, task_id).await?;
        Ok(recorder::transitions_for_task(&conn, task_id).await?)
    }

    pub async fn live_locks(&self) -> Result<Vec<LockInfo>, CoordinationError> {
        let now = self.now();
        let conn = self.store.conn().await;
        Ok(locks::live_locks(&conn, now).await?)
    }

    // ── Claim lifecycle ─────────────────────────────────────────────

    /// Claim a queued task whose dependencies are done. `ttl_secs` of
    /// `None` or 0 means the default lease.
    pub async fn claim(
        &self,
        task_id: Uuid,
        worker_id: &str,
        ttl_secs: Option<u64>,
    ) -> Result<Task, CoordinationError> {
        validate_worker(worker_id)?;
        let ttl = self.lease_ttl(ttl_secs)?;
        let tx = self.store.begin().await?;
        let outcome = self.claim_in(&tx, task_id, worker_id, ttl).await;
        self.finish(tx, outcome).await
    }

    async fn claim_in(&self, conn: &Connection, task_id: Uuid, worker_id: &str, ttl: u64) -> Gated<Task> {
        let now = self.now();
        let mut task = load(conn, task_id).await?;

        if task.status.holds_lease() {
            if task.lease_expired(now) {
                self.expire_lease(conn, &mut task, now).await?;
            } else {
                let holder = task.claimed_by.clone().unwrap_or_default();
                if holder == worker_id {
                    return Err(CoordinationError::TaskNotClaimable {
                        id: task_id,
                        reason: format!("already claimed by {worker_id}"),
                    });
                }
                return Err(CoordinationError::LockConflict {
                    resource: format!("task {task_id}"),
                    holder,
                });
            }
        }

        match task.status {
            TaskStatus::Queued if task.blocked => {
                return Err(CoordinationError::TaskNotClaimable {
                    id: task_id,
                    reason: "dependencies are not done".into(),
                });
            }
            TaskStatus::Queued => {}
            other => {
                return Err(CoordinationError::TaskNotClaimable {
                    id: task_id,
                    reason: format!("task is {other}"),
                });
            }
        }

        let patterns = task
            .lock_paths
            .iter()
            .map(|p| PathPattern::parse(p))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| CoordinationError::Validation(format!("stored lock path: {e}")))?;
        let expires_at = now + chrono::Duration::seconds(ttl as i64);
        locks::acquire_all(conn, task_id, worker_id, &patterns, now, expires_at).await?;

        let verdict = self.policy.evaluate_claim(&task, worker_id);
        let record = record_verdict(conn, task_id, worker_id, &verdict, now).await?;
        if !verdict.permits() {
            locks::release_all(conn, task_id).await?;
            warn!(task_id = %task_id, worker = worker_id, reason = %verdict.reason, "Claim blocked by policy");
            return Ok(Err(denial(&verdict, record.id)));
        }

        task.transition_to(TaskStatus::Claimed, now)?;
        task.claimed_by = Some(worker_id.to_string());
        task.claimed_at = Some(now);
        task.claim_ttl_secs = Some(ttl);
        task.last_heartbeat = Some(now);
        task.policy_ref = Some(record.id);
        task_rows::update_task(conn, &task).await?;
        record_transition(
            conn,
            &task,
            Some(TaskStatus::Queued),
            worker_id,
            TransitionCause::Claimed,
            None,
            now,
        )
        .await?;
        workers::touch(conn, worker_id, now).await?;

        info!(task_id = %task_id, worker = worker_id, ttl_secs = ttl, "Task claimed");
        Ok(Ok(task))
    }

    /// Extend the caller's lease and its locks.
    pub async fn heartbeat(&self, task_id: Uuid, worker_id: &str) -> Result<Task, CoordinationError> {
        let tx = self.store.begin().await?;
        let outcome = self.heartbeat_in(&tx, task_id, worker_id).await;
        self.finish(tx, outcome.map(Ok)).await
    }

    async fn heartbeat_in(
        &self,
        conn: &Connection,
        task_id: Uuid,
        worker_id: &str,
    ) -> Result<Task, CoordinationError> {
        let now = self.now();
        let mut task = load(conn, task_id).await?;
        check_owner(conn, &task, worker_id, now, false).await?;

        let ttl = task
            .claim_ttl_secs
            .unwrap_or(self.leases.default_ttl.as_secs());
        task.last_heartbeat = Some(now);
        task.updated_at = now;
        task_rows::update_task(conn, &task).await?;
        locks::extend(conn, task_id, now + chrono::Duration::seconds(ttl as i64)).await?;
        workers::touch(conn, worker_id, now).await?;

        debug!(task_id = %task_id, worker = worker_id, "Heartbeat");
        Ok(task)
    }

    /// `claimed -> running`.
    pub async fn start(&self, task_id: Uuid, worker_id: &str) -> Result<Task, CoordinationError> {
        let tx = self.store.begin().await?;
        let outcome = self.start_in(&tx, task_id, worker_id).await;
        self.finish(tx, outcome.map(Ok)).await
    }

    async fn start_in(
        &self,
        conn: &Connection,
        task_id: Uuid,
        worker_id: &str,
    ) -> Result<Task, CoordinationError> {
        let now = self.now();
        let mut task = load(conn, task_id).await?;
        check_owner(conn, &task, worker_id, now, false).await?;

        let from = task.status;
        task.transition_to(TaskStatus::Running, now)?;
        task.started_at = Some(now);
        task_rows::update_task(conn, &task).await?;
        record_transition(conn, &task, Some(from), worker_id, TransitionCause::Started, None, now).await?;

        info!(task_id = %task_id, worker = worker_id, "Task started");
        Ok(task)
    }

    /// Give a claim back: `claimed|running -> queued`, locks freed.
    pub async fn release(&self, task_id: Uuid, worker_id: &str) -> Result<Task, CoordinationError> {
        let tx = self.store.begin().await?;
        let outcome = self.release_in(&tx, task_id, worker_id).await;
        self.finish(tx, outcome.map(Ok)).await
    }

    async fn release_in(
        &self,
        conn: &Connection,
        task_id: Uuid,
        worker_id: &str,
    ) -> Result<Task, CoordinationError> {
        let now = self.now();
        let mut task = load(conn, task_id).await?;
        // The holder may give back a lapsed lease the reaper has not seen yet.
        check_owner(conn, &task, worker_id, now, true).await?;

        let from = task.status;
        task.transition_to(TaskStatus::Queued, now)?;
        task.clear_claim();
        locks::release_all(conn, task_id).await?;
        task_rows::update_task(conn, &task).await?;
        record_transition(conn, &task, Some(from), worker_id, TransitionCause::Released, None, now).await?;

        info!(task_id = %task_id, worker = worker_id, "Task released");
        Ok(task)
    }

    /// Submit evidence for a running task. Approved evidence finishes the
    /// task; rejected evidence fails it and schedules a retry if budget
    /// remains.
    pub async fn complete(
        &self,
        task_id: Uuid,
        worker_id: &str,
        evidence: Evidence,
    ) -> Result<Completion, CoordinationError> {
        let tx = self.store.begin().await?;
        let outcome = self.complete_in(&tx, task_id, worker_id, evidence).await;
        self.finish(tx, outcome).await
    }

    async fn complete_in(
        &self,
        conn: &Connection,
        task_id: Uuid,
        worker_id: &str,
        evidence: Evidence,
    ) -> Gated<Completion> {
        let now = self.now();
        let mut task = load(conn, task_id).await?;
        check_owner(conn, &task, worker_id, now, false).await?;
        if task.status != TaskStatus::Running {
            return Err(CoordinationError::InvalidTransition {
                id: task_id,
                from: task.status,
                to: TaskStatus::Done,
            });
        }

        let verdict = self.policy.evaluate_completion(&task, worker_id, &evidence);
        let record = record_verdict(conn, task_id, worker_id, &verdict, now).await?;
        task.evidence = Some(evidence);
        locks::release_all(conn, task_id).await?;

        if verdict.permits() {
            task.transition_to(TaskStatus::Done, now)?;
            task.completed_at = Some(now);
            task.clear_claim();
            task_rows::update_task(conn, &task).await?;
            record_transition(
                conn,
                &task,
                Some(TaskStatus::Running),
                worker_id,
                TransitionCause::Completed,
                None,
                now,
            )
            .await?;
            let unblocked = Scheduler::unblocked_dependents(conn, task_id).await?;
            info!(
                task_id = %task_id,
                worker = worker_id,
                unblocked = unblocked.len(),
                "Task completed"
            );
            return Ok(Ok(Completion { task, unblocked }));
        }

        task.transition_to(TaskStatus::Failed, now)?;
        task.clear_claim();
        self.schedule_retry(&mut task, &verdict.reason, now);
        task_rows::update_task(conn, &task).await?;
        record_transition(
            conn,
            &task,
            Some(TaskStatus::Running),
            worker_id,
            TransitionCause::EvidenceRejected,
            Some(verdict.reason.clone()),
            now,
        )
        .await?;
        warn!(
            task_id = %task_id,
            worker = worker_id,
            reason = %verdict.reason,
            retry_at = ?task.retry_at,
            "Completion rejected"
        );
        Ok(Err(denial(&verdict, record.id)))
    }

    /// Report an execution failure: `running -> failed`.
    pub async fn fail(&self, task_id: Uuid, worker_id: &str, error: &str) -> Result<Task, CoordinationError> {
        let tx = self.store.begin().await?;
        let outcome = self.fail_in(&tx, task_id, worker_id, error).await;
        self.finish(tx, outcome.map(Ok)).await
    }

    async fn fail_in(
        &self,
        conn: &Connection,
        task_id: Uuid,
        worker_id: &str,
        error: &str,
    ) -> Result<Task, CoordinationError> {
        let now = self.now();
        let mut task = load(conn, task_id).await?;
        check_owner(conn, &task, worker_id, now, false).await?;

        let from = task.status;
        task.transition_to(TaskStatus::Failed, now)?;
        task.clear_claim();
        self.schedule_retry(&mut task, error, now);
        locks::release_all(conn, task_id).await?;
        task_rows::update_task(conn, &task).await?;
        record_transition(
            conn,
            &task,
            Some(from),
            worker_id,
            TransitionCause::Failed,
            Some(error.to_string()),
            now,
        )
        .await?;

        warn!(task_id = %task_id, worker = worker_id, error, attempts = task.attempts, "Task failed");
        Ok(task)
    }

    /// Requeue a failed task now, ignoring any backoff, if it has retries left.
    pub async fn retry(&self, task_id: Uuid) -> Result<Task, CoordinationError> {
        let tx = self.store.begin().await?;
        let outcome = self.retry_in(&tx, task_id).await;
        self.finish(tx, outcome.map(Ok)).await
    }

    async fn retry_in(&self, conn: &Connection, task_id: Uuid) -> Result<Task, CoordinationError> {
        let now = self.now();
        let mut task = load(conn, task_id).await?;
        if task.status != TaskStatus::Failed {
            return Err(CoordinationError::InvalidTransition {
                id: task_id,
                from: task.status,
                to: TaskStatus::Queued,
            });
        }
        if task.attempts > task.max_retries {
            return Err(CoordinationError::RetryExhausted {
                id: task_id,
                attempts: task.attempts,
            });
        }
        requeue(conn, &mut task, "manual retry", now).await?;
        Ok(task)
    }

    fn schedule_retry(&self, task: &mut Task, error: &str, now: DateTime<Utc>) {
        task.attempts = task.attempts.saturating_add(1);
        task.last_error = Some(error.to_string());
        task.retry_at = self
            .retry
            .schedule(task.attempts, task.max_retries, now)
            .map(truncate_ts);
    }

    /// Pre-run evaluation for `POST /tasks/{id}/run`.
    pub async fn authorize_run(
        &self,
        task_id: Uuid,
        worker_id: &str,
    ) -> Result<PolicyDecisionRecord, CoordinationError> {
        validate_worker(worker_id)?;
        let tx = self.store.begin().await?;
        let outcome = self.authorize_run_in(&tx, task_id, worker_id).await;
        self.finish(tx, outcome).await
    }

    async fn authorize_run_in(
        &self,
        conn: &Connection,
        task_id: Uuid,
        worker_id: &str,
    ) -> Gated<PolicyDecisionRecord> {
        let now = self.now();
        let task = load(conn, task_id).await?;
        let live_claimant = task.is_claimed_by(worker_id) && !task.lease_expired(now);
        let verdict = self.policy.evaluate_run(&task, worker_id, live_claimant);
        let record = record_verdict(conn, task_id, worker_id, &verdict, now).await?;
        if verdict.permits() {
            Ok(Ok(record))
        } else {
            warn!(task_id = %task_id, worker = worker_id, reason = %verdict.reason, "Run blocked by policy");
            Ok(Err(denial(&verdict, record.id)))
        }
    }

    /// Return a lapsed lease to the queue. Recorded with the expired holder
    /// as actor so its late heartbeat reads as `ClaimExpired`.
    async fn expire_lease(
        &self,
        conn: &Connection,
        task: &mut Task,
        now: DateTime<Utc>,
    ) -> Result<(), CoordinationError> {
        let holder = task
            .claimed_by
            .clone()
            .unwrap_or_else(|| SYSTEM_ACTOR.to_string());
        let last_heartbeat = task.last_heartbeat;
        let from = task.status;

        locks::release_all(conn, task.id).await?;
        task.transition_to(TaskStatus::Queued, now)?;
        task.clear_claim();
        task_rows::update_task(conn, task).await?;
        record_transition(
            conn,
            task,
            Some(from),
            &holder,
            TransitionCause::LeaseExpired,
            last_heartbeat.map(|at| format!("last heartbeat {}", at.to_rfc3339())),
            now,
        )
        .await?;

        info!(task_id = %task.id, worker = %holder, "Lease expired, task requeued");
        Ok(())
    }

    // ── Background sweeps ───────────────────────────────────────────

    /// Requeue every task whose lease has lapsed. Returns the reaped ids.
    pub async fn reap_expired(&self) -> Result<Vec<Uuid>, CoordinationError> {
        let now = self.now();
        let candidates: Vec<Uuid> = {
            let conn = self.store.conn().await;
            task_rows::leased_tasks(&conn)
                .await?
                .into_iter()
                .filter(|t| t.lease_expired(now))
                .map(|t| t.id)
                .collect()
        };

        let mut reaped = Vec::new();
        for id in candidates {
            let tx = self.store.begin().await?;
            let outcome = self.reap_one(&tx, id, now).await;
            if self.finish(tx, outcome.map(Ok)).await? {
                reaped.push(id);
            }
        }
        if !reaped.is_empty() {
            info!(count = reaped.len(), "Expired leases reaped");
        }
        Ok(reaped)
    }

    async fn reap_one(&self, conn: &Connection, id: Uuid, now: DateTime<Utc>) -> Result<bool, CoordinationError> {
        // A heartbeat may have landed since the scan.
        let Some(mut task) = task_rows::get_task(conn, id).await? else {
            return Ok(false);
        };
        if !task.lease_expired(now) {
            return Ok(false);
        }
        self.expire_lease(conn, &mut task, now).await?;
        Ok(true)
    }

    /// Requeue failed tasks whose backoff has elapsed.
    pub async fn promote_retries(&self) -> Result<Vec<Uuid>, CoordinationError> {
        let now = self.now();
        let due: Vec<Uuid> = {
            let conn = self.store.conn().await;
            task_rows::due_retries(&conn, now)
                .await?
                .into_iter()
                .map(|t| t.id)
                .collect()
        };

        let mut promoted = Vec::new();
        for id in due {
            let tx = self.store.begin().await?;
            let outcome = promote_one(&tx, id, now).await;
            if self.finish(tx, outcome.map(Ok)).await? {
                promoted.push(id);
            }
        }
        if !promoted.is_empty() {
            info!(count = promoted.len(), "Retries promoted");
        }
        Ok(promoted)
    }

    /// Re-evaluate running tasks whose effective policy asks for it. A task
    /// the current policy no longer permits is failed (advisory: the worker
    /// process is not interrupted). Returns the revoked ids.
    pub async fn recheck_running(&self) -> Result<Vec<Uuid>, CoordinationError> {
        let now = self.now();
        let running = {
            let conn = self.store.conn().await;
            task_rows::list_tasks(&conn, Some(TaskStatus::Running)).await?
        };

        let mut revoked = Vec::new();
        for task in running {
            let Some(worker_id) = task.claimed_by.as_deref() else {
                continue;
            };
            let policy = self.policy.effective(worker_id, task.project.as_deref());
            if !policy.execution.recheck_while_running {
                continue;
            }
            let tx = self.store.begin().await?;
            let outcome = self.recheck_one(&tx, task.id, worker_id, now).await;
            if self.finish(tx, outcome.map(Ok)).await? {
                revoked.push(task.id);
            }
        }
        Ok(revoked)
    }

    /// Fail a running task the current policy no longer permits.
    ///
    /// No automatic retry is scheduled (`retry_at` stays empty): the same
    /// policy would deny the next claim as well. `retry` can still requeue
    /// the task by hand once the policy changes.
    async fn recheck_one(
        &self,
        conn: &Connection,
        id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, CoordinationError> {
        let Some(mut task) = task_rows::get_task(conn, id).await? else {
            return Ok(false);
        };
        if task.status != TaskStatus::Running || !task.is_claimed_by(worker_id) {
            return Ok(false);
        }

        let verdict = self.policy.evaluate_running(&task, worker_id);
        let record = record_verdict(conn, id, worker_id, &verdict, now).await?;
        if verdict.permits() {
            return Ok(false);
        }

        locks::release_all(conn, id).await?;
        task.transition_to(TaskStatus::Failed, now)?;
        task.clear_claim();
        task.attempts = task.attempts.saturating_add(1);
        task.last_error = Some(verdict.reason.clone());
        task.retry_at = None;
        task_rows::update_task(conn, &task).await?;
        record_transition(
            conn,
            &task,
            Some(TaskStatus::Running),
            worker_id,
            TransitionCause::PolicyRevoked,
            Some(format!("{} (decision {})", verdict.reason, record.id)),
            now,
        )
        .await?;

        warn!(task_id = %id, worker = worker_id, reason = %verdict.reason, "Running task revoked by policy");
        Ok(true)
    }

    // ── Workers ─────────────────────────────────────────────────────

    pub async fn register_worker(
        &self,
        registration: &WorkerRegistration,
    ) -> Result<WorkerInstance, CoordinationError> {
        validate_worker(&registration.id)?;
        let now = self.now();
        let conn = self.store.conn().await;
        workers::register(&conn, registration, now).await?;
        info!(worker = %registration.id, "Worker registered");
        workers::get(&conn, &registration.id).await?.ok_or_else(|| {
            CoordinationError::Database(DatabaseError::NotFound {
                entity: "worker".into(),
                id: registration.id.clone(),
            })
        })
    }

    pub async fn workers_snapshot(
        &self,
        offline_after: Duration,
        global_max: usize,
    ) -> Result<WorkersSnapshot, CoordinationError> {
        let now = self.now();
        let conn = self.store.conn().await;
        let registry = workers::list(&conn, now, offline_after).await?;
        let leased = task_rows::leased_tasks(&conn).await?;
        Ok(workers::snapshot(registry, &leased, global_max))
    }

    // ── Runs and memory ─────────────────────────────────────────────

    pub async fn record_run(&self, run: &TaskRun) -> Result<(), CoordinationError> {
        let conn = self.store.conn().await;
        artifacts::insert_run(&conn, run).await?;
        debug!(task_id = %run.task_id, command = %run.command, exit_code = run.exit_code, "Run recorded");
        Ok(())
    }

    pub async fn runs(&self, task_id: Uuid) -> Result<Vec<TaskRun>, CoordinationError> {
        let conn = self.store.conn().await;
        load(&conn, task_id).await?;
        Ok(artifacts::runs_for_task(&conn, task_id).await?)
    }

    pub async fn add_memory(&self, new: NewMemory) -> Result<MemoryItem, CoordinationError> {
        if new.content.trim().is_empty() {
            return Err(CoordinationError::Validation("memory content must not be empty".into()));
        }
        let conn = self.store.conn().await;
        if let Some(task_id) = new.task_id {
            load(&conn, task_id).await?;
        }
        let item = MemoryItem {
            id: Uuid::new_v4(),
            task_id: new.task_id,
            content: new.content,
            tags: new.tags,
            created_at: self.now(),
        };
        artifacts::insert_memory(&conn, &item).await?;
        Ok(item)
    }

    pub async fn task_memory(&self, task_id: Uuid) -> Result<Vec<MemoryItem>, CoordinationError> {
        let conn = self.store.conn().await;
        load(&conn, task_id).await?;
        Ok(artifacts::memory_for_task(&conn, task_id).await?)
    }

    pub async fn search_memory(&self, query: &str, limit: u32) -> Result<Vec<MemoryItem>, CoordinationError> {
        let conn = self.store.conn().await;
        Ok(artifacts::search_memory(&conn, query, limit).await?)
    }
}

fn validate_worker(worker_id: &str) -> Result<(), CoordinationError> {
    if is_valid_identifier(worker_id) {
        Ok(())
    } else {
        Err(CoordinationError::Validation(format!("invalid worker id {worker_id:?}")))
    }
}

async fn load(conn: &Connection, id: Uuid) -> Result<Task, CoordinationError> {
    task_rows::get_task(conn, id)
        .await?
        .ok_or(CoordinationError::NotFound(id))
}

/// `NotOwner` unless `worker_id` holds the lease. A worker whose own lease
/// lapsed gets `ClaimExpired` instead, before or after the reaper ran.
async fn check_owner(
    conn: &Connection,
    task: &Task,
    worker_id: &str,
    now: DateTime<Utc>,
    allow_expired: bool,
) -> Result<(), CoordinationError> {
    if task.is_claimed_by(worker_id) {
        if !allow_expired && task.lease_expired(now) {
            return Err(CoordinationError::ClaimExpired { id: task.id });
        }
        return Ok(());
    }
    if let Some(last) = recorder::last_transition_involving(conn, task.id, worker_id).await? {
        if last.cause == TransitionCause::LeaseExpired {
            return Err(CoordinationError::ClaimExpired { id: task.id });
        }
    }
    Err(CoordinationError::NotOwner {
        id: task.id,
        worker: worker_id.to_string(),
    })
}

async fn promote_one(conn: &Connection, id: Uuid, now: DateTime<Utc>) -> Result<bool, CoordinationError> {
    let Some(mut task) = task_rows::get_task(conn, id).await? else {
        return Ok(false);
    };
    let due = task.status == TaskStatus::Failed && task.retry_at.is_some_and(|at| at <= now);
    if !due {
        return Ok(false);
    }
    requeue(conn, &mut task, "backoff elapsed", now).await?;
    Ok(true)
}

async fn requeue(
    conn: &Connection,
    task: &mut Task,
    detail: &str,
    now: DateTime<Utc>,
) -> Result<(), CoordinationError> {
    task.transition_to(TaskStatus::Queued, now)?;
    task.retry_at = None;
    task_rows::update_task(conn, task).await?;
    record_transition(
        conn,
        task,
        Some(TaskStatus::Failed),
        SYSTEM_ACTOR,
        TransitionCause::Retried,
        Some(detail.to_string()),
        now,
    )
    .await?;
    info!(task_id = %task.id, attempts = task.attempts, "Task requeued for retry");
    Ok(())
}

async fn record_verdict(
    conn: &Connection,
    task_id: Uuid,
    worker_id: &str,
    verdict: &Verdict,
    now: DateTime<Utc>,
) -> Result<PolicyDecisionRecord, CoordinationError> {
    let record = PolicyDecisionRecord {
        id: Uuid::new_v4(),
        task_id,
        worker_id: worker_id.to_string(),
        point: verdict.point,
        decision: verdict.decision,
        policy: verdict.policy,
        reason: verdict.reason.clone(),
        created_at: now,
    };
    recorder::record_decision(conn, &record).await?;
    Ok(record)
}

async fn record_transition(
    conn: &Connection,
    task: &Task,
    from: Option<TaskStatus>,
    actor: &str,
    cause: TransitionCause,
    detail: Option<String>,
    now: DateTime<Utc>,
) -> Result<(), CoordinationError> {
    recorder::record_transition(
        conn,
        &TransitionRecord {
            id: Uuid::new_v4(),
            task_id: task.id,
            from_status: from,
            to_status: task.status,
            actor: actor.to_string(),
            cause,
            detail,
            created_at: now,
        },
    )
    .await
}

fn denial(verdict: &Verdict, decision_id: Uuid) -> CoordinationError {
    let reason = verdict.reason.clone();
    match verdict.violation {
        Some(Violation::EvidenceRequired) => CoordinationError::EvidenceRequired { reason, decision_id },
        Some(Violation::EvidenceInvalid) => CoordinationError::EvidenceInvalid { reason, decision_id },
        Some(Violation::Policy) | None => CoordinationError::PolicyViolation { reason, decision_id },
    }
}
