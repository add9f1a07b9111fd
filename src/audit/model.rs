//! Ledger record types.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::policy::EffectivePolicy;
use crate::tasks::model::TaskStatus;

/// Outcome of a policy evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Decision {
    Allow,
    Block,
    Reject,
    Approve,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "ALLOW",
            Self::Block => "BLOCK",
            Self::Reject => "REJECT",
            Self::Approve => "APPROVE",
        }
    }

    /// ALLOW and APPROVE let the gated change through.
    pub fn permits(&self) -> bool {
        matches!(self, Self::Allow | Self::Approve)
    }
}

impl FromStr for Decision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ALLOW" => Ok(Self::Allow),
            "BLOCK" => Ok(Self::Block),
            "REJECT" => Ok(Self::Reject),
            "APPROVE" => Ok(Self::Approve),
            other => Err(format!("unknown decision: {other}")),
        }
    }
}

/// Where in the lifecycle a policy was evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionPoint {
    PreClaim,
    MidExecution,
    PostCompletion,
    PreRun,
}

impl DecisionPoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PreClaim => "pre_claim",
            Self::MidExecution => "mid_execution",
            Self::PostCompletion => "post_completion",
            Self::PreRun => "pre_run",
        }
    }
}

impl FromStr for DecisionPoint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pre_claim" => Ok(Self::PreClaim),
            "mid_execution" => Ok(Self::MidExecution),
            "post_completion" => Ok(Self::PostCompletion),
            "pre_run" => Ok(Self::PreRun),
            other => Err(format!("unknown decision point: {other}")),
        }
    }
}

/// Policy Decision Record: one per evaluation, never updated or deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyDecisionRecord {
    pub id: Uuid,
    pub task_id: Uuid,
    pub worker_id: String,
    pub point: DecisionPoint,
    pub decision: Decision,
    /// The effective policy the decision was made against.
    pub policy: EffectivePolicy,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

/// Why a task changed status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionCause {
    Created,
    Claimed,
    Started,
    Released,
    LeaseExpired,
    Completed,
    EvidenceRejected,
    Failed,
    Retried,
    PolicyRevoked,
}

impl TransitionCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Claimed => "claimed",
            Self::Started => "started",
            Self::Released => "released",
            Self::LeaseExpired => "lease_expired",
            Self::Completed => "completed",
            Self::EvidenceRejected => "evidence_rejected",
            Self::Failed => "failed",
            Self::Retried => "retried",
            Self::PolicyRevoked => "policy_revoked",
        }
    }
}

impl FromStr for TransitionCause {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "created" => Self::Created,
            "claimed" => Self::Claimed,
            "started" => Self::Started,
            "released" => Self::Released,
            "lease_expired" => Self::LeaseExpired,
            "completed" => Self::Completed,
            "evidence_rejected" => Self::EvidenceRejected,
            "failed" => Self::Failed,
            "retried" => Self::Retried,
            "policy_revoked" => Self::PolicyRevoked,
            other => return Err(format!("unknown transition cause: {other}")),
        })
    }
}

/// Append-only record of a status change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub id: Uuid,
    pub task_id: Uuid,
    /// `None` for creation.
    pub from_status: Option<TaskStatus>,
    pub to_status: TaskStatus,
    /// Worker id, or `system` for the daemon's own sweeps.
    pub actor: String,
    pub cause: TransitionCause,
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Actor name used for transitions the daemon makes on its own.
pub const SYSTEM_ACTOR: &str = "system";
