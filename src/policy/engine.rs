//! Policy engine: layered documents in, verdicts out.
//!
//! The engine is pure with respect to the store. It resolves the effective
//! policy for a (worker, project) pair and evaluates it at each enforcement
//! point; writing the decision record is the task manager's job, on the same
//! transaction as the change being gated.

use std::path::Path;
use std::sync::RwLock;

use tracing::info;

use crate::audit::{Decision, DecisionPoint};
use crate::error::PolicyError;
use crate::policy::model::{EffectivePolicy, EvidenceRequirement, PolicyDocument, PolicySet};
use crate::tasks::model::{Evidence, Task};
use crate::workers::is_valid_identifier;

/// Branches a worker may not write to unless `directMainWriteAllowed`.
const PROTECTED_BRANCHES: &[&str] = &["main", "master"];

/// What kind of rule produced a denial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Violation {
    Policy,
    EvidenceRequired,
    EvidenceInvalid,
}

/// Result of one evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub point: DecisionPoint,
    pub decision: Decision,
    pub reason: String,
    pub policy: EffectivePolicy,
    /// Set when `decision` does not permit the change.
    pub violation: Option<Violation>,
}

impl Verdict {
    fn permit(point: DecisionPoint, decision: Decision, policy: EffectivePolicy, reason: &str) -> Self {
        Self {
            point,
            decision,
            reason: reason.to_string(),
            policy,
            violation: None,
        }
    }

    fn deny(
        point: DecisionPoint,
        decision: Decision,
        policy: EffectivePolicy,
        violation: Violation,
        reason: String,
    ) -> Self {
        Self {
            point,
            decision,
            reason,
            policy,
            violation: Some(violation),
        }
    }

    pub fn permits(&self) -> bool {
        self.decision.permits()
    }
}

/// Which scope a policy update targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyScope {
    Global,
    Project(String),
    Worker(String),
}

/// How an update combines with the scope's current document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    Replace,
    /// Per-key overlay on the existing document.
    Merge,
}

/// Holds the layered policy and evaluates it.
pub struct PolicyEngine {
    set: RwLock<PolicySet>,
}

impl Default for PolicyEngine {
    fn default() -> Self {
        Self::new(PolicySet::default())
    }
}

impl PolicyEngine {
    pub fn new(set: PolicySet) -> Self {
        Self {
            set: RwLock::new(set),
        }
    }

    /// Parse a layered policy document.
    pub fn from_json(s: &str) -> Result<Self, PolicyError> {
        let set: PolicySet = serde_json::from_str(s).map_err(|e| PolicyError::Parse(e.to_string()))?;
        for name in set.projects.keys().chain(set.workers.keys()) {
            if !is_valid_identifier(name) {
                return Err(PolicyError::InvalidScope(name.clone()));
            }
        }
        Ok(Self::new(set))
    }

    /// Load a layered policy file from disk.
    pub fn load(path: &Path) -> Result<Self, PolicyError> {
        let raw = std::fs::read_to_string(path)?;
        let engine = Self::from_json(&raw)?;
        let set = engine.snapshot();
        info!(
            path = %path.display(),
            projects = set.projects.len(),
            workers = set.workers.len(),
            "Policy loaded"
        );
        Ok(engine)
    }

    /// A copy of every layer.
    pub fn snapshot(&self) -> PolicySet {
        self.read().clone()
    }

    pub fn effective(&self, worker_id: &str, project: Option<&str>) -> EffectivePolicy {
        self.read().resolve(worker_id, project)
    }

    /// Replace or merge one scope's document. The only way policy changes.
    pub fn update(
        &self,
        scope: PolicyScope,
        doc: PolicyDocument,
        mode: UpdateMode,
    ) -> Result<PolicyDocument, PolicyError> {
        if let PolicyScope::Project(name) | PolicyScope::Worker(name) = &scope {
            if !is_valid_identifier(name) {
                return Err(PolicyError::InvalidScope(name.clone()));
            }
        }

        let mut set = self.set.write().unwrap_or_else(|p| p.into_inner());
        let slot = match &scope {
            PolicyScope::Global => &mut set.global,
            PolicyScope::Project(name) => set.projects.entry(name.clone()).or_default(),
            PolicyScope::Worker(name) => set.workers.entry(name.clone()).or_default(),
        };
        *slot = match mode {
            UpdateMode::Replace => doc,
            UpdateMode::Merge => slot.overlay(&doc),
        };
        info!(scope = ?scope, mode = ?mode, "Policy updated");
        Ok(slot.clone())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, PolicySet> {
        self.set.read().unwrap_or_else(|p| p.into_inner())
    }

    /// Pre-claim: may this worker take this task?
    pub fn evaluate_claim(&self, task: &Task, worker_id: &str) -> Verdict {
        let policy = self.effective(worker_id, task.project.as_deref());
        match secrets_violation(task, &policy) {
            Some(reason) => Verdict::deny(
                DecisionPoint::PreClaim,
                Decision::Block,
                policy,
                Violation::Policy,
                reason,
            ),
            None => Verdict::permit(DecisionPoint::PreClaim, Decision::Allow, policy, "claim permitted"),
        }
    }

    /// Mid-execution: does the current policy still permit a running task?
    pub fn evaluate_running(&self, task: &Task, worker_id: &str) -> Verdict {
        let policy = self.effective(worker_id, task.project.as_deref());
        match secrets_violation(task, &policy) {
            Some(reason) => Verdict::deny(
                DecisionPoint::MidExecution,
                Decision::Block,
                policy,
                Violation::Policy,
                reason,
            ),
            None => Verdict::permit(
                DecisionPoint::MidExecution,
                Decision::Allow,
                policy,
                "execution still permitted",
            ),
        }
    }

    /// Pre-run: may this worker execute a command for the task?
    pub fn evaluate_run(&self, task: &Task, worker_id: &str, is_live_claimant: bool) -> Verdict {
        let policy = self.effective(worker_id, task.project.as_deref());
        let deny = |reason: String| {
            Verdict::deny(DecisionPoint::PreRun, Decision::Block, policy, Violation::Policy, reason)
        };
        if !policy.execution.run_allowed {
            return deny("command execution is disabled by policy".into());
        }
        if policy.claim_required && !is_live_claimant {
            return deny(format!("worker {worker_id} must hold a live claim on the task to run commands"));
        }
        Verdict::permit(DecisionPoint::PreRun, Decision::Allow, policy, "run permitted")
    }

    /// Post-completion: is the submitted evidence acceptable?
    pub fn evaluate_completion(&self, task: &Task, worker_id: &str, evidence: &Evidence) -> Verdict {
        let policy = self.effective(worker_id, task.project.as_deref());
        let reject = |violation, reason: String| {
            Verdict::deny(DecisionPoint::PostCompletion, Decision::Reject, policy, violation, reason)
        };

        match policy.evidence_required {
            EvidenceRequirement::None => {}
            EvidenceRequirement::Any => {
                if evidence.is_empty() {
                    return reject(
                        Violation::EvidenceRequired,
                        "completion requires evidence (diff refs, logs or test results)".into(),
                    );
                }
            }
            EvidenceRequirement::Tests => match evidence.test_results {
                None => {
                    return reject(
                        Violation::EvidenceRequired,
                        "completion requires test results".into(),
                    );
                }
                Some(results) if results.failed > 0 => {
                    return reject(
                        Violation::EvidenceInvalid,
                        format!("{} of {} tests failed", results.failed, results.passed + results.failed),
                    );
                }
                Some(_) => {}
            },
        }

        if !policy.direct_main_write_allowed {
            if let Some(branch) = evidence.target_branch.as_deref() {
                let short = branch.trim().trim_start_matches("refs/heads/");
                if PROTECTED_BRANCHES.contains(&short) {
                    return reject(
                        Violation::EvidenceInvalid,
                        format!("direct writes to {short} are not allowed"),
                    );
                }
            }
        }

        Verdict::permit(DecisionPoint::PostCompletion, Decision::Approve, policy, "evidence approved")
    }
}

fn secrets_violation(task: &Task, policy: &EffectivePolicy) -> Option<String> {
    (task.needs_secrets && !policy.secrets_access_allowed)
        .then(|| "task requires secrets access, which policy does not allow".to_string())
}
