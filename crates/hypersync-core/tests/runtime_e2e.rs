//! End-to-end tests: intent in, receipt out, through every failure stage.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hypersync_core::{
    builtin_kernels, verify_receipt, DeterminismTier, ExecutionContext, ExecutorConfig, Intent,
    KernelError, KernelRegistry, OperatorId, OperatorKernel, OperatorMetadata, OperatorRegistry,
    PolicyDocument, ReceiptStatus, RegistryHandle, RulesDocument, Runtime, RuntimeConfig,
    SigningKey,
};
use serde_json::{json, Map, Value};

fn default_pack() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../packs/default")
}

fn default_runtime() -> Runtime {
    Runtime::from_config(&RuntimeConfig::new(default_pack())).expect("default pack loads")
}

fn ot_params() -> Value {
    json!({"a": [0.5, 0.5], "b": [0.3, 0.7], "C": [[0, 1], [1, 0]], "epsilon": 0.1})
}

fn sums(plan: &Value) -> (Vec<f64>, Vec<f64>) {
    let rows: Vec<Vec<f64>> = plan
        .as_array()
        .expect("rows")
        .iter()
        .map(|r| r.as_array().expect("row").iter().filter_map(Value::as_f64).collect())
        .collect();
    let row_sums = rows.iter().map(|r| r.iter().sum()).collect();
    let col_sums = (0..rows[0].len()).map(|j| rows.iter().map(|r| r[j]).sum()).collect();
    (row_sums, col_sums)
}

fn id(s: &str) -> OperatorId {
    OperatorId::parse(s).expect("valid id")
}

fn write_operator(dir: &Path, file: &str, body: Value) {
    let ops = dir.join("operators");
    std::fs::create_dir_all(&ops).expect("mkdir");
    std::fs::write(ops.join(file), body.to_string()).expect("write operator");
}

/// Counts invocations; returns `{"ok": true}`.
struct Counting(Arc<AtomicUsize>);

impl OperatorKernel for Counting {
    fn tier(&self) -> DeterminismTier {
        DeterminismTier::D0
    }

    fn run(
        &self,
        _p: &Map<String, Value>,
        _c: &ExecutionContext,
    ) -> Result<Map<String, Value>, KernelError> {
        self.0.fetch_add(1, Ordering::SeqCst);
        let mut out = Map::new();
        out.insert("ok".into(), json!(true));
        Ok(out)
    }
}

/// Sleeps in short steps until cancelled.
struct Slow;

impl OperatorKernel for Slow {
    fn tier(&self) -> DeterminismTier {
        DeterminismTier::D0
    }

    fn run(
        &self,
        _p: &Map<String, Value>,
        ctx: &ExecutionContext,
    ) -> Result<Map<String, Value>, KernelError> {
        for _ in 0..400 {
            ctx.check_cancelled()?;
            std::thread::sleep(Duration::from_millis(5));
        }
        Ok(Map::new())
    }
}

struct Exploding;

impl OperatorKernel for Exploding {
    fn tier(&self) -> DeterminismTier {
        DeterminismTier::D0
    }

    fn run(
        &self,
        _p: &Map<String, Value>,
        _c: &ExecutionContext,
    ) -> Result<Map<String, Value>, KernelError> {
        panic!("division by zero in solver");
    }
}

fn single_operator_runtime(
    meta: OperatorMetadata,
    kernel: impl OperatorKernel + 'static,
    executor: ExecutorConfig,
) -> Runtime {
    let name = meta.id.to_string();
    let registry = OperatorRegistry::from_entries(vec![meta]).expect("registry");
    let mut kernels = KernelRegistry::new();
    kernels.register(&name, kernel).expect("register");
    Runtime::builder(RegistryHandle::new(registry), kernels)
        .executor_config(executor)
        .build()
}

// -------------------------------------------------------------------------
// Happy paths
// -------------------------------------------------------------------------

#[tokio::test]
async fn test_end_to_end_sinkhorn_direct_reference() {
    let rt = default_runtime();
    let intent = Intent::new("op://sinkhorn_entropic.0").with_params(ot_params());

    let receipt = rt.run(&intent).await;
    assert_eq!(receipt.status, ReceiptStatus::Ok, "outputs: {:?}", receipt.outputs);
    assert_eq!(receipt.op, "op://sinkhorn_entropic.0");
    assert!(receipt.hash.starts_with("sha256:"));
    assert!(receipt.inputs_commitment.starts_with("sha256:"));

    let (rows, cols) = sums(&receipt.outputs["transport_plan"]);
    for (got, want) in rows.iter().zip([0.5, 0.5]) {
        assert!((got - want).abs() < 1e-6, "row sum {got} vs {want}");
    }
    for (got, want) in cols.iter().zip([0.3, 0.7]) {
        assert!((got - want).abs() < 1e-6, "col sum {got} vs {want}");
    }
    assert!(receipt.outputs["diagnostics"]["iterations"].as_u64().is_some());
}

#[tokio::test]
async fn test_builtin_task_with_empty_rules() {
    let registry = RegistryHandle::load(default_pack()).expect("pack");
    let rt = Runtime::builder(registry, builtin_kernels().expect("kernels"))
        .rules(RulesDocument::empty())
        .build();
    let intent = Intent::new("task://optimal_transport").with_params(ot_params());

    assert_eq!(rt.plan(&intent).reason, "builtin task map");
    let receipt = rt.run(&intent).await;
    assert_eq!(receipt.status, ReceiptStatus::Ok);
    assert_eq!(receipt.op, "op://sinkhorn_entropic.0");
}

#[tokio::test]
async fn test_greenkhorn_route_applies_overrides() {
    let rt = default_runtime();
    let intent = Intent::new("task://optimal_transport/greenkhorn").with_params(ot_params());

    let plan = rt.plan(&intent);
    assert_eq!(plan.operator_id, Some(id("op://sinkhorn_greenkhorn.0")));
    assert_eq!(plan.last_set()["params"]["accelerated"], json!(true));

    let receipt = rt.run(&intent).await;
    assert_eq!(receipt.status, ReceiptStatus::Ok, "outputs: {:?}", receipt.outputs);
    assert_eq!(receipt.op, "op://sinkhorn_greenkhorn.0");
    assert_eq!(receipt.outputs["diagnostics"]["converged"], json!(true));
}

#[tokio::test]
async fn test_overrides_enter_inputs_commitment() {
    let rt = default_runtime();
    let routed = rt
        .run(&Intent::new("task://optimal_transport/greenkhorn").with_params(ot_params()))
        .await;
    let expected = hypersync_core::inputs_commitment(
        "task://optimal_transport/greenkhorn",
        &{
            let mut p = ot_params().as_object().cloned().expect("object");
            p.insert("accelerated".into(), json!(true));
            p.insert("momentum".into(), json!(0.3));
            p
        },
    )
    .expect("commitment");
    assert_eq!(routed.inputs_commitment, expected);
}

// -------------------------------------------------------------------------
// Determinism
// -------------------------------------------------------------------------

#[tokio::test]
async fn test_identical_intents_produce_identical_hashes() {
    let rt = default_runtime();
    let intent = Intent::new("task://optimal_transport").with_params(ot_params());

    let first = rt.run(&intent).await;
    let second = rt.run(&intent.clone().with_id("another-id")).await;
    assert_eq!(first.hash, second.hash);
    assert_eq!(first.inputs_commitment, second.inputs_commitment);
}

#[tokio::test]
async fn test_concurrent_runs_share_runtime() {
    let rt = Arc::new(default_runtime());
    let mut handles = Vec::new();
    for _ in 0..8 {
        let rt = Arc::clone(&rt);
        handles.push(tokio::spawn(async move {
            rt.run(&Intent::new("task://optimal_transport").with_params(ot_params()))
                .await
                .hash
        }));
    }
    let mut hashes = Vec::new();
    for handle in handles {
        hashes.push(handle.await.expect("join"));
    }
    assert!(hashes.windows(2).all(|w| w[0] == w[1]));
}

// -------------------------------------------------------------------------
// Failure receipts
// -------------------------------------------------------------------------

#[tokio::test]
async fn test_missing_parameter_fails_before_execution() {
    let calls = Arc::new(AtomicUsize::new(0));
    let rt = single_operator_runtime(
        OperatorMetadata::new(id("op://dummy.0")).with_required(["alpha", "beta"]),
        Counting(Arc::clone(&calls)),
        ExecutorConfig::default(),
    );

    let receipt = rt
        .run(&Intent::new("op://dummy.0").with_param("alpha", json!(1)))
        .await;
    assert_eq!(receipt.status, ReceiptStatus::Fail);
    assert_eq!(receipt.error_code(), Some("InvalidParameters"));
    assert_eq!(receipt.outputs["missing"], json!(["beta"]));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_schema_violation_lists_paths() {
    let rt = default_runtime();
    let intent = Intent::new("op://sinkhorn_entropic.0").with_params(json!({
        "a": [0.5, 0.5], "b": [0.3, 0.7], "C": [[0, 1], [1, 0]], "epsilon": "small"
    }));
    let receipt = rt.run(&intent).await;
    assert_eq!(receipt.error_code(), Some("InvalidParameters"));
    let violations = receipt.outputs["violations"].as_array().expect("violations");
    assert!(violations.iter().any(|v| v.as_str().is_some_and(|s| s.starts_with("$.epsilon"))));
}

#[tokio::test]
async fn test_no_plan() {
    let rt = default_runtime();
    let receipt = rt.run(&Intent::new("task://does_not_exist")).await;
    assert_eq!(receipt.status, ReceiptStatus::Fail);
    assert_eq!(receipt.op, "task://does_not_exist");
    assert_eq!(receipt.error_code(), Some("NoPlan"));
}

#[tokio::test]
async fn test_core_tier_actuation_denied() {
    let rt = default_runtime();
    let intent = Intent::new("task://optimal_transport")
        .with_params(ot_params())
        .with_param("capability", json!("actuation"))
        .with_meta("tier", json!("core"));
    let receipt = rt.run(&intent).await;
    assert_eq!(receipt.error_code(), Some("PolicyDenied"));
    assert_eq!(receipt.outputs["reason"], json!("Actuation not allowed for core tier"));
    assert_eq!(receipt.op, "task://optimal_transport");
}

#[tokio::test]
async fn test_privacy_policy_denies_untagged_operator() {
    let registry = RegistryHandle::load(default_pack()).expect("pack");
    let rt = Runtime::builder(registry, builtin_kernels().expect("kernels"))
        .policy(PolicyDocument {
            require_privacy: true,
            ..Default::default()
        })
        .build();
    let receipt = rt
        .run(&Intent::new("task://optimal_transport").with_params(ot_params()))
        .await;
    assert_eq!(receipt.error_code(), Some("PolicyDenied"));
    assert_eq!(receipt.op, "op://sinkhorn_entropic.0");
    assert_eq!(
        receipt.outputs["reason"],
        json!("Operator lacks compliance/privacy tag under policy")
    );
}

#[tokio::test]
async fn test_timeout_yields_fail_receipt() {
    let rt = single_operator_runtime(
        OperatorMetadata::new(id("op://slow.0")).with_tier(DeterminismTier::D0),
        Slow,
        ExecutorConfig {
            timeout_ms: 50,
            max_workers: 1,
        },
    );
    let receipt = rt.run(&Intent::new("op://slow.0")).await;
    assert_eq!(receipt.status, ReceiptStatus::Fail);
    assert_eq!(receipt.error_code(), Some("Timeout"));
    assert_eq!(receipt.outputs["limit_ms"], json!(50));
    assert!(verify_receipt(&receipt, None).is_ok());
}

#[tokio::test]
async fn test_kernel_panic_is_captured() {
    let rt = single_operator_runtime(
        OperatorMetadata::new(id("op://boom.0")).with_tier(DeterminismTier::D0),
        Exploding,
        ExecutorConfig::default(),
    );
    let receipt = rt.run(&Intent::new("op://boom.0")).await;
    assert_eq!(receipt.error_code(), Some("KernelPanic"));
    let message = receipt.outputs["message"].as_str().expect("message");
    assert!(message.contains("division by zero"), "{message}");
}

#[tokio::test]
async fn test_output_schema_violation() {
    let rt = single_operator_runtime(
        OperatorMetadata::new(id("op://liar.0"))
            .with_tier(DeterminismTier::D0)
            .with_output_schema(json!({"type": "object", "required": ["transport_plan"]})),
        Counting(Arc::new(AtomicUsize::new(0))),
        ExecutorConfig::default(),
    );
    let receipt = rt.run(&Intent::new("op://liar.0")).await;
    assert_eq!(receipt.error_code(), Some("OutputSchemaViolation"));
}

#[tokio::test]
async fn test_operator_without_kernel() {
    let registry = OperatorRegistry::from_entries(vec![OperatorMetadata::new(id("op://paper.0"))])
        .expect("registry");
    let rt = Runtime::builder(RegistryHandle::new(registry), KernelRegistry::new()).build();
    let receipt = rt.run(&Intent::new("op://paper.0")).await;
    assert_eq!(receipt.error_code(), Some("OperatorNotImplemented"));
}

#[tokio::test]
async fn test_kernel_invalid_input_is_execution_error() {
    let rt = default_runtime();
    let intent = Intent::new("op://sinkhorn_entropic.0").with_params(json!({
        "a": [0.5, 0.5], "b": [0.3, 0.7], "C": [[0, 1, 2], [1, 0, 2]], "epsilon": 0.1
    }));
    let receipt = rt.run(&intent).await;
    assert_eq!(receipt.error_code(), Some("ExecutionError"));
}

// -------------------------------------------------------------------------
// Signing and reload
// -------------------------------------------------------------------------

#[tokio::test]
async fn test_signed_receipts_verify_with_secret() {
    let key = SigningKey::from("integration-secret");
    let rt = Runtime::from_config(&RuntimeConfig::new(default_pack()).with_secret(key.clone()))
        .expect("runtime");

    let ok = rt
        .run(&Intent::new("task://optimal_transport").with_params(ot_params()))
        .await;
    let failed = rt.run(&Intent::new("task://nowhere")).await;
    for receipt in [&ok, &failed] {
        let signature = receipt.signature.as_deref().expect("signed");
        assert!(signature.starts_with("hmac-sha256:"));
        assert!(verify_receipt(receipt, Some(&key)).is_ok());
    }
}

#[tokio::test]
async fn test_hot_reload_picks_up_new_operator() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_operator(
        dir.path(),
        "a.json",
        json!({"id": "op://sinkhorn_entropic.0", "deterministic": true}),
    );
    let rt = Runtime::from_config(&RuntimeConfig::new(dir.path())).expect("runtime");
    let before = rt.registry();

    let intent = Intent::new("op://sinkhorn_greenkhorn.0").with_params(ot_params());
    assert!(!rt.plan(&intent).is_resolved());

    write_operator(
        dir.path(),
        "b.json",
        json!({"id": "op://sinkhorn_greenkhorn.0", "deterministic": true}),
    );
    assert_eq!(rt.reload_registry().expect("reload"), 2);

    assert_eq!(before.len(), 1, "old snapshot is untouched");
    assert_eq!(rt.plan(&intent).reason, "direct operator reference");
    assert_eq!(rt.run(&intent).await.status, ReceiptStatus::Ok);
}

#[tokio::test]
async fn test_failed_reload_keeps_previous_snapshot() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_operator(dir.path(), "a.json", json!({"id": "op://sinkhorn_entropic.0"}));
    let rt = Runtime::from_config(&RuntimeConfig::new(dir.path())).expect("runtime");

    std::fs::write(dir.path().join("operators").join("broken.json"), "{").expect("write");
    assert!(rt.reload_registry().is_err());
    assert_eq!(rt.registry().len(), 1);
}
