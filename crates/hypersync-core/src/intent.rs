//! The structured request accepted by the runtime.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ConfigError;

fn new_intent_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// A request naming an operation (`task://…` or `op://…`) and its parameters.
///
/// Intents are never mutated by the runtime; planner overrides are applied to
/// a copy via [`Intent::merged_params`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    #[serde(default = "new_intent_id")]
    pub id: String,
    pub op: String,
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default)]
    pub meta: Map<String, Value>,
    #[serde(default)]
    pub context: Map<String, Value>,
}

impl Intent {
    /// Create an intent with a fresh id and empty maps.
    pub fn new(op: impl Into<String>) -> Self {
        Self {
            id: new_intent_id(),
            op: op.into(),
            params: Map::new(),
            meta: Map::new(),
            context: Map::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    /// Replace `params` with the entries of a JSON object. Non-objects are ignored.
    pub fn with_params(mut self, params: Value) -> Self {
        if let Value::Object(map) = params {
            self.params = map;
        }
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: Value) -> Self {
        self.meta.insert(key.into(), value);
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    /// Parse an intent from JSON text.
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Read an intent from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// String value of `meta[key]`, if present and a string.
    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.meta.get(key).and_then(Value::as_str)
    }

    /// String value of `context[key]`, if present and a string.
    pub fn context_str(&self, key: &str) -> Option<&str> {
        self.context.get(key).and_then(Value::as_str)
    }

    /// A copy of `params` with `overrides` applied on top (override wins).
    pub fn merged_params(&self, overrides: &Map<String, Value>) -> Map<String, Value> {
        let mut merged = self.params.clone();
        for (key, value) in overrides {
            merged.insert(key.clone(), value.clone());
        }
        merged
    }
}
