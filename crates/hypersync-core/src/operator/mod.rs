//! Operator registry: identity, metadata, and schema validation.
//!
//! - [`metadata`]: `OperatorId`, `DeterminismTier`, `OperatorMetadata`
//! - [`schema`]: structural input/output schema checks
//! - [`registry`]: `OperatorRegistry` snapshots and `RegistryHandle`

pub mod metadata;
pub mod registry;
pub mod schema;

pub use metadata::{DeterminismTier, OperatorId, OperatorMetadata, CONFORMANCE_MARKER};
pub use registry::{OperatorRegistry, RegistryHandle, ValidationResult, OPERATORS_DIR};
pub use schema::SchemaViolation;
