//! Policy documents and per-key merging.
//!
//! A `PolicyDocument` is partial: any key may be absent and absent keys
//! inherit from the layer below. Unknown keys are rejected when parsing.
//! `EffectivePolicy` is the fully resolved result.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// How much evidence a completion must carry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceRequirement {
    /// Anything goes, including nothing.
    None,
    /// At least one diff ref, log or test result.
    #[default]
    Any,
    /// Test results with zero failures.
    Tests,
}

/// One scope's policy settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PolicyDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim_required: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direct_main_write_allowed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secrets_access_allowed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence_required: Option<EvidenceRequirement>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution: Option<ExecutionDocument>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ExecutionDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_allowed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recheck_while_running: Option<bool>,
}

impl PolicyDocument {
    /// Parse a single document, rejecting unknown keys.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    /// Per-key overlay: keys present in `over` win, everything else is kept.
    pub fn overlay(&self, over: &PolicyDocument) -> PolicyDocument {
        PolicyDocument {
            claim_required: over.claim_required.or(self.claim_required),
            direct_main_write_allowed: over
                .direct_main_write_allowed
                .or(self.direct_main_write_allowed),
            secrets_access_allowed: over.secrets_access_allowed.or(self.secrets_access_allowed),
            evidence_required: over.evidence_required.or(self.evidence_required),
            execution: match (&self.execution, &over.execution) {
                (None, None) => None,
                (Some(base), None) => Some(base.clone()),
                (None, Some(top)) => Some(top.clone()),
                (Some(base), Some(top)) => Some(ExecutionDocument {
                    run_allowed: top.run_allowed.or(base.run_allowed),
                    recheck_while_running: top.recheck_while_running.or(base.recheck_while_running),
                }),
            },
        }
    }
}

/// Fully resolved policy: every key has a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectivePolicy {
    pub claim_required: bool,
    pub direct_main_write_allowed: bool,
    pub secrets_access_allowed: bool,
    pub evidence_required: EvidenceRequirement,
    pub execution: EffectiveExecution,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectiveExecution {
    pub run_allowed: bool,
    pub recheck_while_running: bool,
}

impl Default for EffectivePolicy {
    fn default() -> Self {
        Self {
            claim_required: true,
            direct_main_write_allowed: false,
            secrets_access_allowed: false,
            evidence_required: EvidenceRequirement::Any,
            execution: EffectiveExecution {
                run_allowed: true,
                recheck_while_running: false,
            },
        }
    }
}

impl EffectivePolicy {
    /// Apply one document on top of this resolved policy.
    pub fn apply(self, doc: &PolicyDocument) -> Self {
        let exec = doc.execution.clone().unwrap_or_default();
        Self {
            claim_required: doc.claim_required.unwrap_or(self.claim_required),
            direct_main_write_allowed: doc
                .direct_main_write_allowed
                .unwrap_or(self.direct_main_write_allowed),
            secrets_access_allowed: doc
                .secrets_access_allowed
                .unwrap_or(self.secrets_access_allowed),
            evidence_required: doc.evidence_required.unwrap_or(self.evidence_required),
            execution: EffectiveExecution {
                run_allowed: exec.run_allowed.unwrap_or(self.execution.run_allowed),
                recheck_while_running: exec
                    .recheck_while_running
                    .unwrap_or(self.execution.recheck_while_running),
            },
        }
    }
}

/// The layered policy file: `{"global": .., "projects": {..}, "workers": {..}}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicySet {
    #[serde(default)]
    pub global: PolicyDocument,
    #[serde(default)]
    pub projects: BTreeMap<String, PolicyDocument>,
    #[serde(default)]
    pub workers: BTreeMap<String, PolicyDocument>,
}

impl PolicySet {
    /// Built-in defaults, then Global, then the project, then the worker.
    pub fn resolve(&self, worker_id: &str, project: Option<&str>) -> EffectivePolicy {
        let mut effective = EffectivePolicy::default().apply(&self.global);
        if let Some(doc) = project.and_then(|p| self.projects.get(p)) {
            effective = effective.apply(doc);
        }
        if let Some(doc) = self.workers.get(worker_id) {
            effective = effective.apply(doc);
        }
        effective
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(PolicyDocument::from_json(r#"{"claimRequired": true, "yolo": 1}"#).is_err());
        assert!(PolicyDocument::from_json(r#"{"execution": {"sudo": true}}"#).is_err());
        assert!(serde_json::from_str::<PolicySet>(r#"{"teams": {}}"#).is_err());
    }

    #[test]
    fn wrong_types_are_rejected() {
        assert!(PolicyDocument::from_json(r#"{"claimRequired": "yes"}"#).is_err());
        assert!(PolicyDocument::from_json(r#"{"evidenceRequired": "some"}"#).is_err());
    }

    #[test]
    fn merge_is_per_key_not_whole_document() {
        let set: PolicySet = serde_json::from_str(
            r#"{
                "global": {"claimRequired": true, "secretsAccessAllowed": false},
                "projects": {"infra": {"secretsAccessAllowed": true}},
                "workers": {"w-ci": {"evidenceRequired": "tests", "execution": {"runAllowed": false}}}
            }"#,
        )
        .unwrap();

        let eff = set.resolve("w-ci", Some("infra"));
        assert!(eff.claim_required);
        assert!(eff.secrets_access_allowed);
        assert_eq!(eff.evidence_required, EvidenceRequirement::Tests);
        assert!(!eff.execution.run_allowed);
        // Untouched nested key keeps its default.
        assert!(!eff.execution.recheck_while_running);
    }

    #[test]
    fn narrower_scope_wins() {
        let set: PolicySet = serde_json::from_str(
            r#"{
                "global": {"directMainWriteAllowed": true},
                "projects": {"p": {"directMainWriteAllowed": false}},
                "workers": {"w": {"directMainWriteAllowed": true}}
            }"#,
        )
        .unwrap();
        assert!(!set.resolve("other", Some("p")).direct_main_write_allowed);
        assert!(set.resolve("w", Some("p")).direct_main_write_allowed);
        assert!(set.resolve("other", None).direct_main_write_allowed);
    }

    #[test]
    fn overlay_keeps_base_keys() {
        let base = PolicyDocument {
            claim_required: Some(false),
            execution: Some(ExecutionDocument {
                run_allowed: Some(false),
                recheck_while_running: None,
            }),
            ..Default::default()
        };
        let top = PolicyDocument {
            execution: Some(ExecutionDocument {
                run_allowed: None,
                recheck_while_running: Some(true),
            }),
            ..Default::default()
        };
        let merged = base.overlay(&top);
        assert_eq!(merged.claim_required, Some(false));
        let exec = merged.execution.unwrap();
        assert_eq!(exec.run_allowed, Some(false));
        assert_eq!(exec.recheck_while_running, Some(true));
    }

    #[test]
    fn empty_set_is_defaults() {
        assert_eq!(PolicySet::default().resolve("w", None), EffectivePolicy::default());
    }
}
