//! Operator Executor: kernel dispatch with a bounded worker pool and timeout.
//!
//! Kernels implement [`OperatorKernel`] and are registered in a
//! [`KernelRegistry`] under a validated [`OperatorId`]. The [`Executor`] runs
//! each invocation on the blocking pool, limited by a semaphore of
//! `max_workers` permits and a per-call timeout. Kernel errors, panics, and
//! timeouts all come back as [`ExecutionError`]; nothing is retried.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::error::{ConfigError, ExecutionError};
use crate::operator::{DeterminismTier, OperatorId, OperatorRegistry};

/// Errors a kernel may return.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum KernelError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("numerical failure: {0}")]
    Numerical(String),

    #[error("cancelled")]
    Cancelled,
}

/// Cooperative cancellation signal shared between the executor and a kernel.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Everything a kernel may read besides its params.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    seed: u64,
    cancel: CancellationFlag,
}

impl ExecutionContext {
    pub fn new(seed: u64, cancel: CancellationFlag) -> Self {
        Self { seed, cancel }
    }

    /// Seed for any randomness; D1 kernels must derive all draws from it.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// `Err(Cancelled)` once the executor has given up on this call.
    pub fn check_cancelled(&self) -> Result<(), KernelError> {
        if self.is_cancelled() {
            Err(KernelError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// A concrete operator implementation.
///
/// Implementations must be pure: no hidden I/O and no global state beyond
/// what arrives in `params` and `ctx`.
pub trait OperatorKernel: Send + Sync {
    /// Declared reproducibility tier.
    fn tier(&self) -> DeterminismTier;

    /// Run the operator. Diagnostics belong inside the returned map.
    fn run(
        &self,
        params: &Map<String, Value>,
        ctx: &ExecutionContext,
    ) -> Result<Map<String, Value>, KernelError>;
}

/// Dispatch table from operator id to kernel.
#[derive(Default, Clone)]
pub struct KernelRegistry {
    kernels: BTreeMap<OperatorId, Arc<dyn OperatorKernel>>,
}

impl std::fmt::Debug for KernelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelRegistry")
            .field("kernels", &self.kernels.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl KernelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `kernel` under `id`. Registering the same id twice is an error.
    pub fn register(
        &mut self,
        id: &str,
        kernel: impl OperatorKernel + 'static,
    ) -> Result<(), ConfigError> {
        let id = OperatorId::parse(id)?;
        if self.kernels.contains_key(&id) {
            return Err(ConfigError::DuplicateKernel(id.to_string()));
        }
        self.kernels.insert(id, Arc::new(kernel));
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn OperatorKernel>> {
        self.kernels.get(id).cloned()
    }

    pub fn ids(&self) -> impl Iterator<Item = &OperatorId> {
        self.kernels.keys()
    }

    /// Registered operators that have no kernel.
    pub fn missing_kernels(&self, registry: &OperatorRegistry) -> Vec<OperatorId> {
        registry
            .ids()
            .filter(|id| !self.kernels.contains_key(*id))
            .cloned()
            .collect()
    }

    /// Kernels whose declared tier differs from the registry metadata.
    pub fn tier_mismatches(&self, registry: &OperatorRegistry) -> Vec<OperatorId> {
        self.kernels
            .iter()
            .filter(|(id, kernel)| {
                registry
                    .get(id.as_str())
                    .is_some_and(|meta| meta.determinism_tier != kernel.tier())
            })
            .map(|(id, _)| id.clone())
            .collect()
    }
}

/// Configuration for kernel execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutorConfig {
    /// Maximum wall-clock time for one invocation, including queueing (milliseconds).
    pub timeout_ms: u64,
    /// Maximum number of kernels running at once.
    pub max_workers: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            max_workers: 4,
        }
    }
}

/// Runs kernels with bounded concurrency and a per-call timeout.
#[derive(Debug)]
pub struct Executor {
    kernels: KernelRegistry,
    config: ExecutorConfig,
    permits: Arc<Semaphore>,
}

impl Executor {
    pub fn new(kernels: KernelRegistry, config: ExecutorConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_workers.max(1)));
        Self {
            kernels,
            config,
            permits,
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn kernels(&self) -> &KernelRegistry {
        &self.kernels
    }

    /// Invoke the kernel for `id` with already-validated `params`.
    pub async fn run(
        &self,
        id: &OperatorId,
        params: Map<String, Value>,
        seed: u64,
    ) -> Result<Map<String, Value>, ExecutionError> {
        let kernel = self
            .kernels
            .get(id.as_str())
            .ok_or_else(|| ExecutionError::NotImplemented { id: id.to_string() })?;

        let cancel = CancellationFlag::new();
        let ctx = ExecutionContext::new(seed, cancel.clone());
        let permits = Arc::clone(&self.permits);
        let limit = Duration::from_millis(self.config.timeout_ms);

        let invocation = async move {
            let permit = permits.acquire_owned().await.ok();
            let handle = tokio::task::spawn_blocking(move || {
                // The permit is held until the kernel actually returns, so a
                // timed-out kernel still occupies its worker slot.
                let _permit = permit;
                kernel.run(&params, &ctx)
            });
            handle.await
        };

        match tokio::time::timeout(limit, invocation).await {
            Ok(Ok(Ok(outputs))) => {
                debug!(operator = %id, "kernel completed");
                Ok(outputs)
            }
            Ok(Ok(Err(err))) => Err(ExecutionError::Kernel {
                id: id.to_string(),
                message: err.to_string(),
            }),
            Ok(Err(join_err)) => {
                let message = if join_err.is_panic() {
                    panic_message(join_err.into_panic())
                } else {
                    "kernel task was cancelled".to_string()
                };
                warn!(operator = %id, error = %message, "kernel panicked");
                Err(ExecutionError::Panic {
                    id: id.to_string(),
                    message,
                })
            }
            Err(_elapsed) => {
                cancel.cancel();
                warn!(operator = %id, limit_ms = self.config.timeout_ms, "kernel timed out");
                Err(ExecutionError::Timeout {
                    id: id.to_string(),
                    limit_ms: self.config.timeout_ms,
                })
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "kernel panicked".to_string()
    }
}
