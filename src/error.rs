//! Error types for the Neona control plane.

use std::time::Duration;

use uuid::Uuid;

use crate::tasks::model::TaskStatus;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Policy document errors.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("Failed to parse policy document: {0}")]
    Parse(String),

    #[error("Invalid policy scope name: {0}")]
    InvalidScope(String),

    #[error("IO error reading policy: {0}")]
    Io(#[from] std::io::Error),
}

/// Execution connector errors.
#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    #[error("Command not allowed: {0}")]
    NotAllowed(String),

    #[error("Failed to spawn command: {0}")]
    SpawnFailed(String),

    #[error("Command timed out after {0:?}")]
    Timeout(Duration),
}

/// Coordination failures surfaced to workers and clients.
///
/// Denials that went through a policy evaluation carry the id of the
/// decision record that was written for them.
#[derive(Debug, thiserror::Error)]
pub enum CoordinationError {
    #[error("Task {0} not found")]
    NotFound(Uuid),

    #[error("Task {id} is not claimable: {reason}")]
    TaskNotClaimable { id: Uuid, reason: String },

    #[error("Lock on {resource} is held by {holder}")]
    LockConflict { resource: String, holder: String },

    #[error("Worker {worker} does not own task {id}")]
    NotOwner { id: Uuid, worker: String },

    #[error("Policy violation: {reason}")]
    PolicyViolation { reason: String, decision_id: Uuid },

    #[error("Evidence required: {reason}")]
    EvidenceRequired { reason: String, decision_id: Uuid },

    #[error("Evidence invalid: {reason}")]
    EvidenceInvalid { reason: String, decision_id: Uuid },

    #[error("Dependency cycle: {}", format_cycle(.cycle))]
    CyclicDependency { cycle: Vec<Uuid> },

    #[error("Claim on task {id} expired")]
    ClaimExpired { id: Uuid },

    #[error("Invalid transition for task {id}: {from} -> {to}")]
    InvalidTransition {
        id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Task {id} has no retries left ({attempts} attempts)")]
    RetryExhausted { id: Uuid, attempts: u32 },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Audit ledger write failed: {0}")]
    Audit(String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Connector error: {0}")]
    Connector(#[from] ConnectorError),
}

impl CoordinationError {
    /// Stable machine-readable kind used in HTTP error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NotFound",
            Self::TaskNotClaimable { .. } => "TaskNotClaimable",
            Self::LockConflict { .. } => "LockConflict",
            Self::NotOwner { .. } => "NotOwner",
            Self::PolicyViolation { .. } => "PolicyViolation",
            Self::EvidenceRequired { .. } => "EvidenceRequired",
            Self::EvidenceInvalid { .. } => "EvidenceInvalid",
            Self::CyclicDependency { .. } => "CyclicDependency",
            Self::ClaimExpired { .. } => "ClaimExpired",
            Self::InvalidTransition { .. } => "InvalidTransition",
            Self::RetryExhausted { .. } => "RetryExhausted",
            Self::Validation(_) => "Validation",
            Self::Audit(_) => "AuditFailure",
            Self::Database(_) => "Database",
            Self::Connector(_) => "Connector",
        }
    }

    /// The decision record behind a policy denial, if any.
    pub fn decision_id(&self) -> Option<Uuid> {
        match self {
            Self::PolicyViolation { decision_id, .. }
            | Self::EvidenceRequired { decision_id, .. }
            | Self::EvidenceInvalid { decision_id, .. } => Some(*decision_id),
            _ => None,
        }
    }
}

fn format_cycle(cycle: &[Uuid]) -> String {
    cycle
        .iter()
        .map(Uuid::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_message_lists_path() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let err = CoordinationError::CyclicDependency {
            cycle: vec![a, b, a],
        };
        assert_eq!(err.to_string(), format!("Dependency cycle: {a} -> {b} -> {a}"));
        assert_eq!(err.kind(), "CyclicDependency");
    }

    #[test]
    fn decision_id_only_on_policy_denials() {
        let id = Uuid::new_v4();
        let denial = CoordinationError::PolicyViolation {
            reason: "secrets".into(),
            decision_id: id,
        };
        assert_eq!(denial.decision_id(), Some(id));
        assert_eq!(CoordinationError::ClaimExpired { id }.decision_id(), None);
    }
}
