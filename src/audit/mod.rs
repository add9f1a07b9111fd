//! Decision ledger: policy decision records and task transitions.

pub mod model;
pub mod recorder;

pub use model::{
    Decision, DecisionPoint, PolicyDecisionRecord, SYSTEM_ACTOR, TransitionCause,
    TransitionRecord,
};
