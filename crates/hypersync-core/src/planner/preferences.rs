//! Tie-break scoring among functionally equivalent operators.

use serde::{Deserialize, Serialize};

use crate::operator::{OperatorId, OperatorMetadata, OperatorRegistry};

const TAG_BONUS: f64 = 0.25;
const FLAG_BONUS: f64 = 0.25;
const COST_WEIGHT: f64 = 0.1;
const CONFORMANCE_BONUS: f64 = 0.2;

/// Selection preferences derived from the rules document. Lower score wins.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Preferences {
    #[serde(default)]
    pub determinism_required: bool,
    #[serde(default)]
    pub prefer_tags: Option<Vec<String>>,
    #[serde(default)]
    pub prefer_flags: Option<Vec<String>>,
    #[serde(default)]
    pub prefer_conformance_available: bool,
    #[serde(default)]
    pub prefer_lower_estimated_cost: bool,
    /// Seed handed to operators that need randomness.
    #[serde(default)]
    pub seed: u64,
}

impl Preferences {
    /// Score adjustment for `meta`; more negative is more preferred.
    pub fn score_delta(&self, meta: &OperatorMetadata) -> f64 {
        let mut score = 0.0;

        if let Some(tags) = &self.prefer_tags {
            if tags.iter().any(|t| meta.tags.contains(t)) {
                score -= TAG_BONUS;
            }
        }
        if let Some(flags) = &self.prefer_flags {
            if flags.iter().any(|f| meta.flags.contains(f)) {
                score -= FLAG_BONUS;
            }
        }
        if self.prefer_lower_estimated_cost {
            if let Some(cost) = meta.estimated_cost {
                score -= COST_WEIGHT * cost.clamp(0.0, 1.0);
            }
        }
        if self.prefer_conformance_available && meta.has_conformance() {
            score -= CONFORMANCE_BONUS;
        }
        score
    }

    /// Pick the best registered candidate.
    ///
    /// Unregistered candidates are skipped, non-deterministic ones too when
    /// `determinism_required` is set. Equal scores keep candidate order.
    pub fn select<'a>(
        &self,
        candidates: &'a [OperatorId],
        registry: &OperatorRegistry,
    ) -> Option<&'a OperatorId> {
        let mut best: Option<(&OperatorId, f64)> = None;
        for id in candidates {
            let Some(meta) = registry.get(id.as_str()) else {
                continue;
            };
            if self.determinism_required && !meta.deterministic {
                continue;
            }
            let score = self.score_delta(meta);
            if best.map_or(true, |(_, s)| score < s) {
                best = Some((id, score));
            }
        }
        best.map(|(id, _)| id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::DeterminismTier;

    fn meta(id: &str) -> OperatorMetadata {
        OperatorMetadata::new(OperatorId::parse(id).expect("id"))
    }

    #[test]
    fn test_default_preferences_score_zero() {
        let prefs = Preferences::default();
        assert_eq!(prefs.score_delta(&meta("op://a.0").with_tag("fast").with_cost(1.0)), 0.0);
    }

    #[test]
    fn test_score_components() {
        let prefs = Preferences {
            prefer_tags: Some(vec!["fast".into()]),
            prefer_flags: Some(vec!["gpu".into()]),
            prefer_conformance_available: true,
            prefer_lower_estimated_cost: true,
            ..Default::default()
        };

        let m = meta("op://a.0").with_tag("fast");
        assert!((prefs.score_delta(&m) + 0.25).abs() < 1e-12);

        let m = meta("op://a.0").with_flag("gpu").with_flag("conformance");
        assert!((prefs.score_delta(&m) + 0.45).abs() < 1e-12);

        // Cost is clamped into [0, 1] before weighting.
        let m = meta("op://a.0").with_cost(5.0);
        assert!((prefs.score_delta(&m) + 0.1).abs() < 1e-12);
        let m = meta("op://a.0").with_cost(0.5);
        assert!((prefs.score_delta(&m) + 0.05).abs() < 1e-12);
    }

    #[test]
    fn test_select_lowest_score() {
        let registry = OperatorRegistry::from_entries(vec![
            meta("op://plain.0"),
            meta("op://tagged.0").with_tag("fast"),
        ])
        .expect("registry");
        let prefs = Preferences {
            prefer_tags: Some(vec!["fast".into()]),
            ..Default::default()
        };
        let candidates = vec![
            OperatorId::parse("op://plain.0").expect("id"),
            OperatorId::parse("op://tagged.0").expect("id"),
        ];
        assert_eq!(
            prefs.select(&candidates, &registry).map(OperatorId::as_str),
            Some("op://tagged.0")
        );
    }

    #[test]
    fn test_select_ties_keep_order_and_skip_unknown() {
        let registry = OperatorRegistry::from_entries(vec![meta("op://b.0"), meta("op://c.0")])
            .expect("registry");
        let candidates = vec![
            OperatorId::parse("op://missing.0").expect("id"),
            OperatorId::parse("op://b.0").expect("id"),
            OperatorId::parse("op://c.0").expect("id"),
        ];
        let chosen = Preferences::default().select(&candidates, &registry);
        assert_eq!(chosen.map(OperatorId::as_str), Some("op://b.0"));
    }

    #[test]
    fn test_select_respects_determinism_requirement() {
        let registry = OperatorRegistry::from_entries(vec![
            meta("op://random.0").with_tag("fast"),
            meta("op://exact.0").with_tier(DeterminismTier::D0),
        ])
        .expect("registry");
        let prefs = Preferences {
            determinism_required: true,
            prefer_tags: Some(vec!["fast".into()]),
            ..Default::default()
        };
        let candidates = vec![
            OperatorId::parse("op://random.0").expect("id"),
            OperatorId::parse("op://exact.0").expect("id"),
        ];
        assert_eq!(
            prefs.select(&candidates, &registry).map(OperatorId::as_str),
            Some("op://exact.0")
        );
    }
}
