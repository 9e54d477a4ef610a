//! Runtime wiring: intent in, receipt out.
//!
//! ```text
//! Intent → PolicyGate::check → Planner::plan → PolicyGate::check_operator
//!        → validate_params → Executor::run → validate_outputs → Receipt
//! ```
//!
//! [`Runtime::run`] never returns an error. Every failure along the way is
//! sealed into a `FAIL` receipt whose `outputs.error` names the stage.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::{json, Map, Value};
use tracing::{info, warn, Instrument};

use crate::config::RuntimeConfig;
use crate::error::{ConfigError, PlanningError, ReceiptError, RuntimeFailure, ValidationError};
use crate::executor::{Executor, ExecutorConfig, KernelRegistry};
use crate::intent::Intent;
use crate::kernels::builtin_kernels;
use crate::obs;
use crate::operator::{OperatorId, OperatorRegistry, RegistryHandle};
use crate::planner::{PlanDecision, Planner, RulesDocument};
use crate::policy::{PolicyDocument, PolicyGate};
use crate::receipt::{
    compute_receipt_hash, inputs_commitment, sign_receipt, Receipt, ReceiptBuilder,
    ReceiptStatus, SigningKey,
};

/// Error code used when a receipt itself cannot be encoded.
const RECEIPT_ENCODING_ERROR: &str = "ReceiptEncodingError";

/// Shared, read-only collaborators of a [`Runtime`].
#[derive(Debug, Clone)]
pub struct RuntimeContext {
    pub registry: Arc<RegistryHandle>,
    pub planner: Arc<Planner>,
    pub policy: Arc<PolicyGate>,
    pub executor: Arc<Executor>,
    pub signing_key: Option<SigningKey>,
}

/// Assembles a [`Runtime`] from parts.
#[derive(Debug)]
pub struct RuntimeBuilder {
    registry: RegistryHandle,
    kernels: KernelRegistry,
    rules: RulesDocument,
    policy: PolicyDocument,
    executor: ExecutorConfig,
    signing_key: Option<SigningKey>,
}

impl RuntimeBuilder {
    pub fn rules(mut self, rules: RulesDocument) -> Self {
        self.rules = rules;
        self
    }

    pub fn policy(mut self, policy: PolicyDocument) -> Self {
        self.policy = policy;
        self
    }

    pub fn executor_config(mut self, config: ExecutorConfig) -> Self {
        self.executor = config;
        self
    }

    pub fn signing_key(mut self, key: Option<SigningKey>) -> Self {
        self.signing_key = key;
        self
    }

    pub fn build(self) -> Runtime {
        let snapshot = self.registry.snapshot();
        for id in self.kernels.missing_kernels(&snapshot) {
            warn!(operator = %id, "operator has no kernel; intents routed to it will fail");
        }
        for id in self.kernels.tier_mismatches(&snapshot) {
            warn!(operator = %id, "kernel tier differs from operator metadata");
        }

        Runtime::new(RuntimeContext {
            registry: Arc::new(self.registry),
            planner: Arc::new(Planner::new(self.rules)),
            policy: Arc::new(PolicyGate::new(self.policy)),
            executor: Arc::new(Executor::new(self.kernels, self.executor)),
            signing_key: self.signing_key,
        })
    }
}

/// Processes intents into receipts. Cheap to clone; holds no per-call state.
#[derive(Debug, Clone)]
pub struct Runtime {
    ctx: RuntimeContext,
}

impl Runtime {
    pub fn new(ctx: RuntimeContext) -> Self {
        Self { ctx }
    }

    pub fn builder(registry: RegistryHandle, kernels: KernelRegistry) -> RuntimeBuilder {
        RuntimeBuilder {
            registry,
            kernels,
            rules: RulesDocument::empty(),
            policy: PolicyDocument::default(),
            executor: ExecutorConfig::default(),
            signing_key: None,
        }
    }

    /// Load the spec pack, rules and policy named by `config`, with the
    /// bundled reference kernels.
    pub fn from_config(config: &RuntimeConfig) -> Result<Self, ConfigError> {
        Self::from_config_with_kernels(config, builtin_kernels()?)
    }

    pub fn from_config_with_kernels(
        config: &RuntimeConfig,
        kernels: KernelRegistry,
    ) -> Result<Self, ConfigError> {
        let registry = RegistryHandle::load(&config.spec_pack)?;

        let rules_path = config.rules_file();
        let rules = match RulesDocument::load(&rules_path)? {
            Some(rules) => {
                info!(
                    event = "rules.loaded",
                    path = %rules_path.display(),
                    tasks = rules.tasks.len(),
                    routes = rules.routes.len(),
                );
                rules
            }
            None => {
                info!(
                    path = %rules_path.display(),
                    "no rules document; using builtin task map only"
                );
                RulesDocument::empty()
            }
        };

        let policy_path = config.policy_file();
        let policy = match PolicyDocument::load(&policy_path)? {
            Some(policy) => {
                info!(event = "policy.loaded", path = %policy_path.display());
                policy
            }
            None => {
                info!(path = %policy_path.display(), "no policy document; default allow");
                PolicyDocument::default()
            }
        };

        Ok(Self::builder(registry, kernels)
            .rules(rules)
            .policy(policy)
            .executor_config(config.executor.clone())
            .signing_key(config.hmac_secret.clone())
            .build())
    }

    pub fn context(&self) -> &RuntimeContext {
        &self.ctx
    }

    pub fn registry(&self) -> Arc<OperatorRegistry> {
        self.ctx.registry.snapshot()
    }

    /// Re-read the spec pack. In-flight intents keep their snapshot.
    pub fn reload_registry(&self) -> Result<usize, ConfigError> {
        self.ctx.registry.reload()
    }

    /// Planning alone, against the current registry snapshot.
    pub fn plan(&self, intent: &Intent) -> PlanDecision {
        self.ctx.planner.plan(intent, &self.ctx.registry.snapshot())
    }

    /// Resolve, execute, and seal one intent.
    pub async fn run(&self, intent: &Intent) -> Receipt {
        let span = obs::intent_span(&intent.id, &intent.op);
        self.run_in_span(intent).instrument(span).await
    }

    async fn run_in_span(&self, intent: &Intent) -> Receipt {
        obs::emit_intent_received(&intent.id, &intent.op);
        let registry = self.ctx.registry.snapshot();

        let attempt = self.attempt(intent, &registry).await;
        if let Err(failure) = &attempt.result {
            log_failure(&attempt.op, failure);
        }

        let commitment = inputs_commitment(&intent.op, &attempt.params);
        self.seal(&attempt.op, commitment.map_err(ReceiptError::from), attempt.result)
    }

    async fn attempt(&self, intent: &Intent, registry: &OperatorRegistry) -> Attempt {
        if let Err(denied) = self.ctx.policy.check(intent).into_result() {
            return Attempt {
                op: intent.op.clone(),
                params: intent.params.clone(),
                result: Err(denied.into()),
            };
        }

        let plan = self.ctx.planner.plan(intent, registry);
        obs::emit_intent_planned(
            plan.operator_id.as_ref().map(OperatorId::as_str),
            &plan.reason,
            plan.overrides.len(),
        );
        let params = intent.merged_params(&plan.overrides);

        let Some(op_id) = plan.operator_id else {
            return Attempt {
                op: intent.op.clone(),
                params,
                result: Err(PlanningError::NoPlan {
                    op: intent.op.clone(),
                }
                .into()),
            };
        };

        let result = self.execute(&op_id, &params, registry).await;
        Attempt {
            op: op_id.to_string(),
            params,
            result,
        }
    }

    async fn execute(
        &self,
        op_id: &OperatorId,
        params: &Map<String, Value>,
        registry: &OperatorRegistry,
    ) -> Result<Map<String, Value>, RuntimeFailure> {
        let meta = registry
            .get(op_id.as_str())
            .ok_or_else(|| ValidationError::UnknownOperator { id: op_id.to_string() })?;
        self.ctx.policy.check_operator(meta).into_result()?;
        registry.validate_params(op_id.as_str(), params)?;

        let started = Instant::now();
        let seed = self.ctx.planner.preferences().seed;
        let outputs = self.ctx.executor.run(op_id, params.clone(), seed).await?;
        registry.validate_outputs(op_id.as_str(), &outputs)?;

        obs::emit_operator_executed(op_id.as_str(), started.elapsed().as_millis() as u64);
        Ok(outputs)
    }

    fn seal(
        &self,
        op: &str,
        commitment: Result<String, ReceiptError>,
        result: Result<Map<String, Value>, RuntimeFailure>,
    ) -> Receipt {
        let (status, outputs) = match result {
            Ok(outputs) => (ReceiptStatus::Ok, outputs),
            Err(failure) => (ReceiptStatus::Fail, failure.to_outputs()),
        };

        let receipt = commitment
            .and_then(|commitment| ReceiptBuilder::build(op, commitment, outputs, status))
            .unwrap_or_else(|err| {
                warn!(error = %err, "receipt could not be encoded");
                encoding_failure(op, &err)
            });

        let receipt = match &self.ctx.signing_key {
            Some(key) => sign_receipt(receipt.clone(), key).unwrap_or_else(|err| {
                warn!(error = %err, "receipt signing failed; emitting unsigned");
                receipt
            }),
            None => receipt,
        };

        obs::emit_receipt_emitted(
            receipt.status.as_str(),
            &receipt.hash,
            receipt.signature.is_some(),
        );
        receipt
    }
}

/// Where an intent ended up: the operator label, the params it ran (or would
/// have run) with, and the outcome.
struct Attempt {
    op: String,
    params: Map<String, Value>,
    result: Result<Map<String, Value>, RuntimeFailure>,
}

fn log_failure(op: &str, failure: &RuntimeFailure) {
    match failure {
        RuntimeFailure::Policy(denied) => obs::emit_intent_denied(&denied.reason),
        RuntimeFailure::Validation(err) => obs::emit_intent_invalid(op, err),
        RuntimeFailure::Execution(err) => obs::emit_operator_failed(op, failure.code(), err),
        RuntimeFailure::Planning(_) => {}
    }
}

/// Last-resort receipt when the real one cannot be encoded.
fn encoding_failure(op: &str, err: &ReceiptError) -> Receipt {
    let mut outputs = Map::new();
    outputs.insert("error".into(), json!(RECEIPT_ENCODING_ERROR));
    outputs.insert("message".into(), json!(err.to_string()));
    let hash = compute_receipt_hash(op, ReceiptStatus::Fail, &outputs, "").unwrap_or_default();
    Receipt {
        op: op.to_string(),
        inputs_commitment: String::new(),
        outputs,
        status: ReceiptStatus::Fail,
        hash,
        signature: None,
        ts: Utc::now(),
    }
}
