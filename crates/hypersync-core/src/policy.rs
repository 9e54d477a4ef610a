//! Policy Gate: pure allow/deny decisions over intents and operator metadata.
//!
//! Rules are evaluated in a fixed order; the first deny wins. When no rule
//! denies, the document's `default` decides. The default is `allow`
//! (fail-open) unless the policy document says `"default": "deny"`, in which
//! case only operators listed in `allow_operators` pass `check_operator`.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{ConfigError, PolicyDenied};
use crate::intent::Intent;
use crate::operator::OperatorMetadata;

/// Whether operator `deny_tiers` are enforced.
///
/// Only `"enforced"` and `"advisory"` are recognised; any other value,
/// including `null`, turns gating off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TierGating {
    #[default]
    Off,
    /// Log tier conflicts without denying.
    Advisory,
    Enforced,
}

impl<'de> Deserialize<'de> for TierGating {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        Ok(match Value::deserialize(deserializer)?.as_str() {
            Some("enforced") => Self::Enforced,
            Some("advisory") => Self::Advisory,
            _ => Self::Off,
        })
    }
}

/// Decision when no rule denies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefaultDecision {
    #[default]
    Allow,
    Deny,
}

/// Read-only policy document consumed by the gate.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PolicyDocument {
    /// Trust zone of the current caller, e.g. `core`.
    #[serde(default)]
    pub tier: Option<String>,
    #[serde(default)]
    pub tier_gating: TierGating,
    #[serde(default)]
    pub require_determinism: bool,
    #[serde(default)]
    pub require_privacy: bool,
    #[serde(default)]
    pub default: DefaultDecision,
    /// Operators that pass a fail-closed gate.
    #[serde(default)]
    pub allow_operators: BTreeSet<String>,
}

impl PolicyDocument {
    /// Load a policy document. An absent file yields `Ok(None)`; a present but
    /// malformed file is an error.
    pub fn load(path: impl AsRef<Path>) -> Result<Option<Self>, ConfigError> {
        let path = path.as_ref();
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })
    }
}

/// Outcome of a gate check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl PolicyDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }

    /// Convert into a `Result`, carrying the deny reason.
    pub fn into_result(self) -> Result<(), PolicyDenied> {
        if self.allowed {
            Ok(())
        } else {
            Err(PolicyDenied {
                reason: self.reason.unwrap_or_else(|| "denied".to_string()),
            })
        }
    }
}

/// Tags that satisfy privacy gating.
const PRIVACY_TAGS: [&str; 2] = ["compliance", "privacy"];

/// Stateless gate over an immutable [`PolicyDocument`].
#[derive(Debug, Clone, Default)]
pub struct PolicyGate {
    document: PolicyDocument,
}

impl PolicyGate {
    pub fn new(document: PolicyDocument) -> Self {
        Self { document }
    }

    pub fn document(&self) -> &PolicyDocument {
        &self.document
    }

    /// Request-level checks, run before planning.
    pub fn check(&self, intent: &Intent) -> PolicyDecision {
        let core_tier = intent.meta_str("tier") == Some("core");
        let actuation = intent.params.get("capability") == Some(&Value::from("actuation"));
        if core_tier && actuation {
            return PolicyDecision::deny("Actuation not allowed for core tier");
        }
        PolicyDecision::allow()
    }

    /// Operator-level checks, run after planning and before validation.
    pub fn check_operator(&self, meta: &OperatorMetadata) -> PolicyDecision {
        let doc = &self.document;

        if let Some(tier) = &doc.tier {
            if meta.deny_tiers.contains(tier) {
                match doc.tier_gating {
                    TierGating::Enforced => {
                        return PolicyDecision::deny(format!(
                            "Tier {tier} denied for this operator"
                        ));
                    }
                    TierGating::Advisory => {
                        debug!(event = "policy.tier_advisory", operator = %meta.id, tier = %tier);
                    }
                    TierGating::Off => {}
                }
            }
        }

        if doc.require_determinism && !meta.deterministic {
            return PolicyDecision::deny("Operator not deterministic under policy");
        }

        if doc.require_privacy && !PRIVACY_TAGS.iter().any(|t| meta.tags.contains(*t)) {
            return PolicyDecision::deny("Operator lacks compliance/privacy tag under policy");
        }

        match doc.default {
            DefaultDecision::Allow => {
                debug!(event = "policy.default_allow", operator = %meta.id);
                PolicyDecision::allow()
            }
            DefaultDecision::Deny if doc.allow_operators.contains(meta.id.as_str()) => {
                PolicyDecision::allow()
            }
            DefaultDecision::Deny => PolicyDecision::deny("No policy rule allowed this request"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::{DeterminismTier, OperatorId};
    use serde_json::json;

    fn meta(id: &str) -> OperatorMetadata {
        OperatorMetadata::new(OperatorId::parse(id).expect("id")).with_tier(DeterminismTier::D0)
    }

    #[test]
    fn test_default_allows() {
        let gate = PolicyGate::default();
        assert!(gate.check(&Intent::new("task://x")).allowed);
        assert!(gate.check_operator(&meta("op://a.0")).allowed);
    }

    #[test]
    fn test_core_tier_actuation_denied() {
        let gate = PolicyGate::default();
        let intent = Intent::new("task://x")
            .with_meta("tier", json!("core"))
            .with_param("capability", json!("actuation"));
        let decision = gate.check(&intent);
        assert!(!decision.allowed);
        assert_eq!(decision.reason.as_deref(), Some("Actuation not allowed for core tier"));

        let intent = Intent::new("task://x")
            .with_meta("tier", json!("edge"))
            .with_param("capability", json!("actuation"));
        assert!(gate.check(&intent).allowed);
    }

    #[test]
    fn test_tier_gating_enforced() {
        let gate = PolicyGate::new(PolicyDocument {
            tier: Some("sandbox".into()),
            tier_gating: TierGating::Enforced,
            ..Default::default()
        });
        let decision = gate.check_operator(&meta("op://a.0").with_deny_tier("sandbox"));
        assert_eq!(decision, PolicyDecision::deny("Tier sandbox denied for this operator"));
        assert!(gate.check_operator(&meta("op://a.0").with_deny_tier("core")).allowed);
    }

    #[test]
    fn test_tier_gating_off_and_advisory_allow() {
        for gating in [TierGating::Off, TierGating::Advisory] {
            let gate = PolicyGate::new(PolicyDocument {
                tier: Some("sandbox".into()),
                tier_gating: gating,
                ..Default::default()
            });
            assert!(gate.check_operator(&meta("op://a.0").with_deny_tier("sandbox")).allowed);
        }
    }

    #[test]
    fn test_determinism_required() {
        let gate = PolicyGate::new(PolicyDocument {
            require_determinism: true,
            ..Default::default()
        });
        let nondeterministic = meta("op://a.0").with_tier(DeterminismTier::D2);
        assert_eq!(
            gate.check_operator(&nondeterministic).reason.as_deref(),
            Some("Operator not deterministic under policy")
        );
        assert!(gate.check_operator(&meta("op://b.0")).allowed);
    }

    #[test]
    fn test_privacy_required() {
        let gate = PolicyGate::new(PolicyDocument {
            require_privacy: true,
            ..Default::default()
        });
        assert!(!gate.check_operator(&meta("op://a.0")).allowed);
        assert!(gate.check_operator(&meta("op://a.0").with_tag("privacy")).allowed);
        assert!(gate.check_operator(&meta("op://a.0").with_tag("compliance")).allowed);
    }

    #[test]
    fn test_fail_closed_allow_list() {
        let gate = PolicyGate::new(PolicyDocument {
            default: DefaultDecision::Deny,
            allow_operators: ["op://a.0".to_string()].into_iter().collect(),
            ..Default::default()
        });
        assert!(gate.check_operator(&meta("op://a.0")).allowed);
        assert!(!gate.check_operator(&meta("op://b.0")).allowed);
    }

    #[test]
    fn test_document_parse() {
        let doc: PolicyDocument = serde_json::from_value(json!({
            "tier": "core",
            "tier_gating": "enforced",
            "require_determinism": true
        }))
        .expect("parse");
        assert_eq!(doc.tier_gating, TierGating::Enforced);
        assert_eq!(doc.default, DefaultDecision::Allow);
    }

    #[test]
    fn test_unrecognised_tier_gating_is_off() {
        for gating in [json!("disabled"), json!("none"), json!("soft"), json!(null), json!(1)] {
            let doc: PolicyDocument =
                serde_json::from_value(json!({"tier": "core", "tier_gating": gating}))
                    .expect("parse");
            assert_eq!(doc.tier_gating, TierGating::Off);
            let gate = PolicyGate::new(doc);
            assert!(gate.check_operator(&meta("op://a.0").with_deny_tier("core")).allowed);
        }
    }

    #[test]
    fn test_unrecognised_tier_gating_loads_from_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("policy.json");
        std::fs::write(&path, r#"{"tier": "core", "tier_gating": "disabled"}"#).expect("write");
        let doc = PolicyDocument::load(&path).expect("load").expect("present");
        assert_eq!(doc.tier_gating, TierGating::Off);
    }

    #[test]
    fn test_load_absent_vs_malformed() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(PolicyDocument::load(dir.path().join("policy.json"))
            .expect("absent is ok")
            .is_none());

        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{not json").expect("write");
        assert!(matches!(
            PolicyDocument::load(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_into_result() {
        assert!(PolicyDecision::allow().into_result().is_ok());
        let err = PolicyDecision::deny("nope").into_result().unwrap_err();
        assert_eq!(err.reason, "nope");
    }
}
