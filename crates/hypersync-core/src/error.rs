//! Error taxonomy for the intent runtime.
//!
//! Load-time problems (`ConfigError`) fail loudly at startup. Per-intent
//! problems (`PlanningError`, `ValidationError`, `PolicyDenied`,
//! `ExecutionError`) are folded into [`RuntimeFailure`] and end up in a
//! `FAIL` receipt. `ReceiptIntegrityError` is only produced by the verifier.

use std::path::PathBuf;

use serde_json::{json, Map, Value};

/// Errors produced while loading packs, rules, policy, or environment config.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed JSON in {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid operator id `{id}`: {reason}")]
    InvalidOperatorId { id: String, reason: String },

    #[error("invalid operator metadata for {id}: {reason}")]
    InvalidOperator { id: String, reason: String },

    #[error("duplicate operator id {id} (second definition in {})", .path.display())]
    DuplicateOperator { id: String, path: PathBuf },

    #[error("kernel already registered for {0}")]
    DuplicateKernel(String),

    #[error("invalid value for {var}: `{value}`")]
    InvalidEnv { var: String, value: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors produced by canonical encoding and hashing.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("NaN/Infinity not permitted in canonical JSON")]
    NonFinite,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// No operator could be resolved for an intent.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PlanningError {
    #[error("no plan for `{op}`")]
    NoPlan { op: String },
}

/// Request-side validation failures. Nothing has executed when these occur.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("operator {id} is not registered")]
    UnknownOperator { id: String },

    #[error("operator {id} missing required parameters: {}", .missing.join(", "))]
    MissingParameters { id: String, missing: Vec<String> },

    #[error("parameters for {id} violate input schema: {}", .violations.join("; "))]
    SchemaViolation { id: String, violations: Vec<String> },
}

/// Policy Gate rejection.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("policy denied: {reason}")]
pub struct PolicyDenied {
    pub reason: String,
}

/// Operator-side failures captured during or after execution.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExecutionError {
    #[error("no kernel implementation registered for {id}")]
    NotImplemented { id: String },

    #[error("operator {id} failed: {message}")]
    Kernel { id: String, message: String },

    #[error("operator {id} panicked: {message}")]
    Panic { id: String, message: String },

    #[error("operator {id} timed out after {limit_ms}ms")]
    Timeout { id: String, limit_ms: u64 },

    #[error(
        "operator {id} produced outputs violating its output schema: {}",
        .violations.join("; ")
    )]
    OutputSchemaViolation { id: String, violations: Vec<String> },
}

/// Any per-intent failure. Each variant maps to a stable `outputs.error` code.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RuntimeFailure {
    #[error(transparent)]
    Planning(#[from] PlanningError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Policy(#[from] PolicyDenied),

    #[error(transparent)]
    Execution(#[from] ExecutionError),
}

impl RuntimeFailure {
    /// The error code written to `outputs.error`.
    pub fn code(&self) -> &'static str {
        match self {
            RuntimeFailure::Planning(PlanningError::NoPlan { .. }) => "NoPlan",
            RuntimeFailure::Validation(ValidationError::UnknownOperator { .. }) => {
                "UnknownOperator"
            }
            RuntimeFailure::Validation(_) => "InvalidParameters",
            RuntimeFailure::Policy(_) => "PolicyDenied",
            RuntimeFailure::Execution(e) => match e {
                ExecutionError::NotImplemented { .. } => "OperatorNotImplemented",
                ExecutionError::Kernel { .. } => "ExecutionError",
                ExecutionError::Panic { .. } => "KernelPanic",
                ExecutionError::Timeout { .. } => "Timeout",
                ExecutionError::OutputSchemaViolation { .. } => "OutputSchemaViolation",
            },
        }
    }

    /// Render this failure as the `outputs` map of a `FAIL` receipt.
    pub fn to_outputs(&self) -> Map<String, Value> {
        let mut outputs = Map::new();
        outputs.insert("error".into(), json!(self.code()));
        outputs.insert("message".into(), json!(self.to_string()));

        match self {
            RuntimeFailure::Validation(ValidationError::MissingParameters { missing, .. }) => {
                outputs.insert("missing".into(), json!(missing));
            }
            RuntimeFailure::Validation(ValidationError::SchemaViolation { violations, .. })
            | RuntimeFailure::Execution(ExecutionError::OutputSchemaViolation {
                violations, ..
            }) => {
                outputs.insert("violations".into(), json!(violations));
            }
            RuntimeFailure::Policy(PolicyDenied { reason }) => {
                outputs.insert("reason".into(), json!(reason));
            }
            RuntimeFailure::Execution(ExecutionError::Timeout { limit_ms, .. }) => {
                outputs.insert("limit_ms".into(), json!(limit_ms));
            }
            _ => {}
        }
        outputs
    }
}

/// Errors surfaced by receipt verification.
///
/// A hash mismatch means the content was altered after it was sealed; an
/// invalid signature means the MAC does not match under the supplied key.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReceiptIntegrityError {
    #[error("Receipt hash mismatch")]
    HashMismatch,

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Receipt is not signed")]
    MissingSignature,

    #[error("Receipt content cannot be encoded: {0}")]
    Unencodable(String),
}

/// Errors produced while building or signing a receipt.
#[derive(Debug, thiserror::Error)]
pub enum ReceiptError {
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("invalid signing key")]
    InvalidKey,
}
