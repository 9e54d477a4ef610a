//! Immutable operator registry snapshots and atomic hot reload.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde_json::{Map, Value};
use tracing::{debug, info};

use super::metadata::{OperatorId, OperatorMetadata};
use super::schema;
use crate::error::{ConfigError, ExecutionError, ValidationError};

/// Outcome of parameter validation.
pub type ValidationResult = std::result::Result<(), ValidationError>;

/// Subdirectory of a spec pack holding one metadata file per operator.
pub const OPERATORS_DIR: &str = "operators";

/// A snapshot of operator metadata. Never mutated after construction.
#[derive(Debug, Clone, Default)]
pub struct OperatorRegistry {
    entries: BTreeMap<OperatorId, OperatorMetadata>,
}

impl OperatorRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a registry from in-memory metadata. Duplicate ids are rejected.
    pub fn from_entries<I>(entries: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = OperatorMetadata>,
    {
        let mut map = BTreeMap::new();
        for meta in entries {
            if map.contains_key(&meta.id) {
                return Err(ConfigError::DuplicateOperator {
                    id: meta.id.to_string(),
                    path: PathBuf::from("<memory>"),
                });
            }
            map.insert(meta.id.clone(), meta);
        }
        Ok(Self { entries: map })
    }

    /// Load every `*.json` file from `<dir>/operators/`, or from `dir` itself
    /// when it has no `operators/` subdirectory. Files are read in name order.
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let dir = dir.as_ref();
        let nested = dir.join(OPERATORS_DIR);
        let source = if nested.is_dir() { nested } else { dir.to_path_buf() };

        let io_err = |path: &Path, source: std::io::Error| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };

        let mut files: Vec<PathBuf> = fs::read_dir(&source)
            .map_err(|e| io_err(&source, e))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        files.sort();

        let mut entries = BTreeMap::new();
        for path in files {
            let raw = fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
            let value: Value = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.clone(),
                source,
            })?;
            let meta = OperatorMetadata::from_json(value).map_err(|err| match err {
                ConfigError::Serialization(source) => ConfigError::Parse {
                    path: path.clone(),
                    source,
                },
                other => other,
            })?;

            if entries.contains_key(&meta.id) {
                return Err(ConfigError::DuplicateOperator {
                    id: meta.id.to_string(),
                    path,
                });
            }
            debug!(
                operator = %meta.id,
                tier = %meta.determinism_tier,
                file = %path.display(),
                "operator loaded"
            );
            entries.insert(meta.id.clone(), meta);
        }

        info!(
            event = "registry.loaded",
            dir = %source.display(),
            operators = entries.len(),
        );
        Ok(Self { entries })
    }

    pub fn get(&self, id: &str) -> Option<&OperatorMetadata> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &OperatorId> {
        self.entries.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = &OperatorMetadata> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Check `params` against the operator's required list, then its input schema.
    ///
    /// Both phases complete before any operator code runs.
    pub fn validate_params(&self, id: &str, params: &Map<String, Value>) -> ValidationResult {
        let meta = self.get(id).ok_or_else(|| ValidationError::UnknownOperator {
            id: id.to_string(),
        })?;

        let missing: Vec<String> = meta
            .required_params
            .iter()
            .filter(|name| !params.contains_key(name.as_str()))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(ValidationError::MissingParameters {
                id: id.to_string(),
                missing,
            });
        }

        if let Some(input_schema) = &meta.input_schema {
            let violations = schema::check_map(input_schema, params);
            if !violations.is_empty() {
                return Err(ValidationError::SchemaViolation {
                    id: id.to_string(),
                    violations: violations.iter().map(ToString::to_string).collect(),
                });
            }
        }
        Ok(())
    }

    /// Check kernel outputs against the operator's output schema.
    ///
    /// A violation here is the operator's fault, not the caller's.
    pub fn validate_outputs(
        &self,
        id: &str,
        outputs: &Map<String, Value>,
    ) -> std::result::Result<(), ExecutionError> {
        let Some(output_schema) = self.get(id).and_then(|m| m.output_schema.as_ref()) else {
            return Ok(());
        };
        let violations = schema::check_map(output_schema, outputs);
        if violations.is_empty() {
            Ok(())
        } else {
            Err(ExecutionError::OutputSchemaViolation {
                id: id.to_string(),
                violations: violations.iter().map(ToString::to_string).collect(),
            })
        }
    }
}

/// Shared handle to the current registry snapshot.
///
/// Readers take an `Arc` snapshot per call; [`RegistryHandle::replace`] and
/// [`RegistryHandle::reload`] swap the whole snapshot, so a reader never
/// observes a partially updated registry.
#[derive(Debug)]
pub struct RegistryHandle {
    current: RwLock<Arc<OperatorRegistry>>,
    source: Option<PathBuf>,
}

impl RegistryHandle {
    /// Wrap an in-memory registry (no reload source).
    pub fn new(registry: OperatorRegistry) -> Self {
        Self {
            current: RwLock::new(Arc::new(registry)),
            source: None,
        }
    }

    /// Load from a spec-pack directory and remember it for [`Self::reload`].
    pub fn load(dir: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let dir = dir.as_ref().to_path_buf();
        let registry = OperatorRegistry::load_dir(&dir)?;
        Ok(Self {
            current: RwLock::new(Arc::new(registry)),
            source: Some(dir),
        })
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Arc<OperatorRegistry> {
        let guard = self.current.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&*guard)
    }

    /// Replace the snapshot wholesale.
    pub fn replace(&self, registry: OperatorRegistry) {
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        *guard = Arc::new(registry);
    }

    /// Re-read the source directory and swap in the result.
    ///
    /// On error the previous snapshot stays in place. Returns the number of
    /// operators in the new snapshot.
    pub fn reload(&self) -> Result<usize, ConfigError> {
        let Some(dir) = &self.source else {
            return Ok(self.snapshot().len());
        };
        let registry = OperatorRegistry::load_dir(dir)?;
        let count = registry.len();
        self.replace(registry);
        info!(event = "registry.reloaded", dir = %dir.display(), operators = count);
        Ok(count)
    }
}
