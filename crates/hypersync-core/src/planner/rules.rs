//! Rules document: task map, predicate routes, and preferences.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::preferences::Preferences;
use crate::error::ConfigError;
use crate::operator::OperatorId;

/// Comparison operator in a route param predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Comparator {
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "==")]
    Eq,
}

impl Comparator {
    /// Whether `actual <op> expected` holds.
    ///
    /// Ordering comparators need two numbers; `==` compares numbers
    /// numerically and anything else structurally.
    pub fn holds(self, actual: &Value, expected: &Value) -> bool {
        let numbers = actual.as_f64().zip(expected.as_f64());
        match self {
            Comparator::Eq => match numbers {
                Some((a, e)) => a == e,
                None => actual == expected,
            },
            Comparator::Le => numbers.is_some_and(|(a, e)| a <= e),
            Comparator::Ge => numbers.is_some_and(|(a, e)| a >= e),
            Comparator::Lt => numbers.is_some_and(|(a, e)| a < e),
            Comparator::Gt => numbers.is_some_and(|(a, e)| a > e),
        }
    }
}

/// `match` block of a route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteMatch {
    pub task: String,
    /// `field → {comparator: value}`; every predicate must hold.
    #[serde(default)]
    pub params: BTreeMap<String, BTreeMap<Comparator, Value>>,
}

impl RouteMatch {
    /// Whether every param predicate holds against `params`. A missing field fails.
    pub fn params_hold(&self, params: &Map<String, Value>) -> bool {
        self.params.iter().all(|(field, predicates)| match params.get(field) {
            Some(actual) => predicates.iter().all(|(cmp, expected)| cmp.holds(actual, expected)),
            None => false,
        })
    }
}

/// `set` block of a route: parameter overrides applied before execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteSet {
    #[serde(default)]
    pub params: Map<String, Value>,
}

/// A predicate route from a task to an operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    #[serde(rename = "match")]
    pub matcher: RouteMatch,
    pub operator: OperatorId,
    #[serde(default)]
    pub set: RouteSet,
}

/// Target of a `tasks` entry: one operator or an ordered candidate list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TaskTarget {
    Single(OperatorId),
    Candidates(Vec<OperatorId>),
}

impl TaskTarget {
    pub fn candidates(&self) -> &[OperatorId] {
        match self {
            TaskTarget::Single(id) => std::slice::from_ref(id),
            TaskTarget::Candidates(ids) => ids,
        }
    }
}

/// Planner configuration loaded once per process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RulesDocument {
    #[serde(default)]
    pub tasks: BTreeMap<String, TaskTarget>,
    #[serde(default)]
    pub routes: Vec<Route>,
    #[serde(default)]
    pub preferences: Preferences,
}

impl RulesDocument {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Load a rules document. An absent file yields `Ok(None)` (builtin-only
    /// planning); a present but malformed file is an error.
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
