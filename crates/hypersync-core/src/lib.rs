//! HyperSync Core Library
//!
//! Policy-gated intent resolution, operator execution, and deterministic
//! receipts. Start from [`Runtime`]: build one with
//! [`Runtime::from_config`], then call [`Runtime::run`] per [`Intent`].

pub mod codec;
pub mod config;
pub mod error;
pub mod executor;
pub mod intent;
pub mod kernels;
pub mod obs;
pub mod operator;
pub mod planner;
pub mod policy;
pub mod receipt;
pub mod runtime;
pub mod telemetry;

pub use codec::{canonical_json, canonical_json_hash, quantize, RECEIPT_FLOAT_DECIMALS};
pub use config::RuntimeConfig;
pub use error::{
    CodecError, ConfigError, ExecutionError, PlanningError, PolicyDenied, ReceiptError,
    ReceiptIntegrityError, RuntimeFailure, ValidationError,
};
pub use executor::{
    CancellationFlag, ExecutionContext, Executor, ExecutorConfig, KernelError, KernelRegistry,
    OperatorKernel,
};
pub use intent::Intent;
pub use kernels::builtin_kernels;
pub use operator::{
    DeterminismTier, OperatorId, OperatorMetadata, OperatorRegistry, RegistryHandle,
    SchemaViolation,
};
pub use planner::{PlanDecision, Planner, Preferences, RulesDocument};
pub use policy::{PolicyDecision, PolicyDocument, PolicyGate};
pub use receipt::{
    compute_receipt_hash, inputs_commitment, sign_receipt, verify_receipt, Receipt,
    ReceiptBuilder, ReceiptStatus, SigningKey, VerifyReport, RECEIPT_FORMAT,
};
pub use runtime::{Runtime, RuntimeBuilder, RuntimeContext};
pub use telemetry::init_tracing;

/// Crate version, reported by the CLI.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
