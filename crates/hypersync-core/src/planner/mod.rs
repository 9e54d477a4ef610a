//! Rules Planner: resolve an [`Intent`] to an operator id.
//!
//! Precedence, first match wins:
//! 1. `intent.op` in the builtin task map
//! 2. a builtin key found under `meta`/`context` hint keys
//! 3. the rules document `tasks` map (same two-step lookup)
//! 4. the first rules document route whose task and param predicates match
//! 5. `intent.op` naming a registered operator directly
//!
//! Overrides chosen by a route are returned in the [`PlanDecision`]; the
//! planner keeps no per-call state.

pub mod preferences;
pub mod rules;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use preferences::Preferences;
pub use rules::{Comparator, Route, RouteMatch, RouteSet, RulesDocument, TaskTarget};

use crate::intent::Intent;
use crate::operator::{OperatorId, OperatorRegistry};

/// Fixed task → operator map consulted before any rules document.
pub const BUILTIN_TASKS: &[(&str, &str)] = &[
    ("task://optimal_transport", "op://sinkhorn_entropic.0"),
    ("task://optimal_transport/entropic", "op://sinkhorn_entropic.0"),
];

/// `(source, key)` pairs searched for a task hint, in order.
const HINT_KEYS: &[(HintSource, &str)] = &[
    (HintSource::Meta, "task"),
    (HintSource::Meta, "category"),
    (HintSource::Meta, "route"),
    (HintSource::Context, "task"),
    (HintSource::Context, "category"),
    (HintSource::Context, "route"),
];

#[derive(Debug, Clone, Copy)]
enum HintSource {
    Meta,
    Context,
}

impl HintSource {
    fn prefix(self) -> &'static str {
        match self {
            HintSource::Meta => "meta",
            HintSource::Context => "context",
        }
    }
}

/// Outcome of planning. `operator_id == None` means "no plan".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanDecision {
    pub operator_id: Option<OperatorId>,
    pub reason: String,
    /// Parameter overrides to merge over the intent's params before execution.
    #[serde(default)]
    pub overrides: Map<String, Value>,
}

impl PlanDecision {
    fn resolved(id: OperatorId, reason: impl Into<String>) -> Self {
        Self {
            operator_id: Some(id),
            reason: reason.into(),
            overrides: Map::new(),
        }
    }

    fn no_plan() -> Self {
        Self {
            operator_id: None,
            reason: "no plan".to_string(),
            overrides: Map::new(),
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.operator_id.is_some()
    }

    /// The applied override set in rules-document shape: `{"params": {...}}`.
    pub fn last_set(&self) -> Value {
        let mut set = Map::new();
        set.insert("params".to_string(), Value::Object(self.overrides.clone()));
        Value::Object(set)
    }
}

/// Resolves intents using the builtin map and an immutable rules document.
#[derive(Debug, Clone, Default)]
pub struct Planner {
    rules: RulesDocument,
}

impl Planner {
    pub fn new(rules: RulesDocument) -> Self {
        Self { rules }
    }

    /// Planner with no rules document: builtin map and direct references only.
    pub fn builtin() -> Self {
        Self::default()
    }

    pub fn rules(&self) -> &RulesDocument {
        &self.rules
    }

    pub fn preferences(&self) -> &Preferences {
        &self.rules.preferences
    }

    /// Resolve `intent` to an operator id.
    pub fn plan(&self, intent: &Intent, registry: &OperatorRegistry) -> PlanDecision {
        let hints = task_hints(intent);

        if let Some(id) = builtin_lookup(&intent.op) {
            return PlanDecision::resolved(id, "builtin task map");
        }
        for (label, value) in &hints {
            if let Some(id) = builtin_lookup(value) {
                return PlanDecision::resolved(id, format!("builtin via {label}"));
            }
        }

        if let Some(id) = self.tasks_lookup(&intent.op, registry) {
            return PlanDecision::resolved(id, "rules.tasks map");
        }
        for (label, value) in &hints {
            if let Some(id) = self.tasks_lookup(value, registry) {
                return PlanDecision::resolved(id, format!("rules via {label}"));
            }
        }

        for route in &self.rules.routes {
            let task = route.matcher.task.as_str();
            let task_matches = task == intent.op || hints.iter().any(|(_, v)| *v == task);
            if task_matches && route.matcher.params_hold(&intent.params) {
                return PlanDecision {
                    operator_id: Some(route.operator.clone()),
                    reason: "rules route".to_string(),
                    overrides: route.set.params.clone(),
                };
            }
        }

        if let Ok(id) = OperatorId::parse(&intent.op) {
            if registry.contains(id.as_str()) {
                return PlanDecision::resolved(id, "direct operator reference");
            }
        }

        PlanDecision::no_plan()
    }

    fn tasks_lookup(&self, task: &str, registry: &OperatorRegistry) -> Option<OperatorId> {
        match self.rules.tasks.get(task)? {
            TaskTarget::Single(id) => Some(id.clone()),
            TaskTarget::Candidates(ids) => self.rules.preferences.select(ids, registry).cloned(),
        }
    }
}

fn builtin_lookup(task: &str) -> Option<OperatorId> {
    BUILTIN_TASKS
        .iter()
        .find(|(key, _)| *key == task)
        .and_then(|(_, op)| OperatorId::parse(op).ok())
}

/// String hints from `meta`/`context`, labelled like `meta.task`.
fn task_hints(intent: &Intent) -> Vec<(String, &str)> {
    HINT_KEYS
        .iter()
        .filter_map(|(source, key)| {
            let value = match source {
                HintSource::Meta => intent.meta_str(key),
                HintSource::Context => intent.context_str(key),
            }?;
            Some((format!("{}.{key}", source.prefix()), value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builtin_entries_are_valid_ids() {
        for (task, _) in BUILTIN_TASKS {
            assert!(builtin_lookup(task).is_some(), "invalid builtin target for {task}");
        }
    }

    #[test]
    fn test_task_hints_order() {
        let intent = Intent::new("x")
            .with_context("task", json!("c"))
            .with_meta("route", json!("b"))
            .with_meta("task", json!("a"));
        let hints = task_hints(&intent);
        let labels: Vec<&str> = hints.iter().map(|(l, _)| l.as_str()).collect();
        assert_eq!(labels, vec!["meta.task", "meta.route", "context.task"]);
    }

    #[test]
    fn test_last_set_shape() {
        let decision = PlanDecision {
            operator_id: None,
            reason: "x".into(),
            overrides: json!({"accelerated": true}).as_object().cloned().expect("object"),
        };
        assert_eq!(decision.last_set()["params"]["accelerated"], json!(true));
    }
}
