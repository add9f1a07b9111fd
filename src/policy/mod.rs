//! Hierarchical policy: Global, Project and Worker layers merged per key.

pub mod engine;
pub mod model;

pub use engine::{PolicyEngine, PolicyScope, UpdateMode, Verdict, Violation};
pub use model::{
    EffectiveExecution, EffectivePolicy, EvidenceRequirement, ExecutionDocument, PolicyDocument,
    PolicySet,
};
