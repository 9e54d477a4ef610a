//! Reference kernels bundled with the runtime.

pub mod sinkhorn;

pub use sinkhorn::{SinkhornEntropic, SinkhornGreenkhorn};

use crate::error::ConfigError;
use crate::executor::KernelRegistry;

pub const SINKHORN_ENTROPIC: &str = "op://sinkhorn_entropic.0";
pub const SINKHORN_GREENKHORN: &str = "op://sinkhorn_greenkhorn.0";

/// A kernel registry holding every bundled kernel.
pub fn builtin_kernels() -> Result<KernelRegistry, ConfigError> {
    let mut kernels = KernelRegistry::new();
    kernels.register(SINKHORN_ENTROPIC, SinkhornEntropic)?;
    kernels.register(SINKHORN_GREENKHORN, SinkhornGreenkhorn)?;
    Ok(kernels)
}
