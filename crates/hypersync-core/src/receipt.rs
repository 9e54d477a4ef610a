//! Receipt Builder, Signer, and Verifier.
//!
//! A receipt seals the outcome of one intent. Its `hash` covers the format
//! tag, operator, status, inputs commitment, and quantized outputs, never the
//! timestamp, so identical runs of a reproducible operator agree on `hash`
//! while `ts` differs. An optional HMAC-SHA256 signature binds the hash to a
//! shared secret.

use std::fmt;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::Sha256;

use crate::codec::{self, canonical_json, canonical_json_hash, quantize};
use crate::error::{ReceiptError, ReceiptIntegrityError};

type HmacSha256 = Hmac<Sha256>;

/// Format tag mixed into every hash and signature. The quantization grid is
/// part of this version.
pub const RECEIPT_FORMAT: &str = "hypersync.receipt.v1";

/// Prefix of the `signature` field.
pub const SIGNATURE_PREFIX: &str = "hmac-sha256:";

/// Terminal status of an intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReceiptStatus {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "FAIL")]
    Fail,
}

impl ReceiptStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ReceiptStatus::Ok => "OK",
            ReceiptStatus::Fail => "FAIL",
        }
    }
}

impl fmt::Display for ReceiptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tamper-evident record of one intent's outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    pub op: String,
    pub inputs_commitment: String,
    pub outputs: Map<String, Value>,
    pub status: ReceiptStatus,
    pub hash: String,
    #[serde(default)]
    pub signature: Option<String>,
    pub ts: DateTime<Utc>,
}

impl Receipt {
    pub fn is_ok(&self) -> bool {
        self.status == ReceiptStatus::Ok
    }

    /// `outputs.error` for failed receipts.
    pub fn error_code(&self) -> Option<&str> {
        self.outputs.get("error").and_then(Value::as_str)
    }

    pub fn from_json_str(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}

/// Shared secret for receipt signatures. `Debug` never prints the bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct SigningKey(Vec<u8>);

impl SigningKey {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self(secret.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn mac(&self) -> Option<HmacSha256> {
        HmacSha256::new_from_slice(&self.0).ok()
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SigningKey(<redacted>)")
    }
}

impl From<&str> for SigningKey {
    fn from(secret: &str) -> Self {
        Self::new(secret.as_bytes())
    }
}

/// `sha256:<hex>` over `{"op", "params"}` with the merged params actually executed.
pub fn inputs_commitment(op: &str, params: &Map<String, Value>) -> codec::Result<String> {
    canonical_json_hash(&json!({ "op": op, "params": params }))
}

/// Digest of a receipt's sealed content. `ts` and `signature` are not inputs.
pub fn compute_receipt_hash(
    op: &str,
    status: ReceiptStatus,
    outputs: &Map<String, Value>,
    intent_ref: &str,
) -> codec::Result<String> {
    let payload = json!({
        "format": RECEIPT_FORMAT,
        "op": op,
        "status": status.as_str(),
        "intent_ref": intent_ref,
        "outputs": quantize(&Value::Object(outputs.clone())),
    });
    canonical_json_hash(&payload)
}

/// Seals outputs into receipts.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReceiptBuilder;

impl ReceiptBuilder {
    /// Build an unsigned receipt stamped with the current time.
    pub fn build(
        op: impl Into<String>,
        inputs_commitment: impl Into<String>,
        outputs: Map<String, Value>,
        status: ReceiptStatus,
    ) -> Result<Receipt, ReceiptError> {
        Self::build_at(op, inputs_commitment, outputs, status, Utc::now())
    }

    /// Build an unsigned receipt with an explicit timestamp.
    pub fn build_at(
        op: impl Into<String>,
        inputs_commitment: impl Into<String>,
        outputs: Map<String, Value>,
        status: ReceiptStatus,
        ts: DateTime<Utc>,
    ) -> Result<Receipt, ReceiptError> {
        let op = op.into();
        let inputs_commitment = inputs_commitment.into();
        let hash = compute_receipt_hash(&op, status, &outputs, &inputs_commitment)?;
        Ok(Receipt {
            op,
            inputs_commitment,
            outputs,
            status,
            hash,
            signature: None,
            ts,
        })
    }
}

fn signing_payload(receipt: &Receipt) -> codec::Result<String> {
    canonical_json(&json!({
        "format": RECEIPT_FORMAT,
        "hash": receipt.hash,
        "op": receipt.op,
        "inputs_commitment": receipt.inputs_commitment,
        "status": receipt.status.as_str(),
    }))
}

/// Attach an HMAC-SHA256 signature over the receipt's sealed fields.
pub fn sign_receipt(mut receipt: Receipt, key: &SigningKey) -> Result<Receipt, ReceiptError> {
    let payload = signing_payload(&receipt)?;
    let mut mac = key.mac().ok_or(ReceiptError::InvalidKey)?;
    mac.update(payload.as_bytes());
    let tag = hex::encode(mac.finalize().into_bytes());
    receipt.signature = Some(format!("{SIGNATURE_PREFIX}{tag}"));
    Ok(receipt)
}

/// Recompute the hash and, when `key` is given, check the signature.
///
/// The hash check runs first so tampered content is reported as such even
/// when the signature is also wrong.
pub fn verify_receipt(
    receipt: &Receipt,
    key: Option<&SigningKey>,
) -> Result<(), ReceiptIntegrityError> {
    let recomputed = compute_receipt_hash(
        &receipt.op,
        receipt.status,
        &receipt.outputs,
        &receipt.inputs_commitment,
    )
    .map_err(|e| ReceiptIntegrityError::Unencodable(e.to_string()))?;
    if recomputed != receipt.hash {
        return Err(ReceiptIntegrityError::HashMismatch);
    }

    let Some(key) = key else {
        return Ok(());
    };
    let signature = receipt
        .signature
        .as_deref()
        .ok_or(ReceiptIntegrityError::MissingSignature)?;
    let tag = signature
        .strip_prefix(SIGNATURE_PREFIX)
        .and_then(|hex_tag| hex::decode(hex_tag).ok())
        .ok_or(ReceiptIntegrityError::InvalidSignature)?;

    let payload = signing_payload(receipt)
        .map_err(|e| ReceiptIntegrityError::Unencodable(e.to_string()))?;
    let mut mac = key.mac().ok_or(ReceiptIntegrityError::InvalidSignature)?;
    mac.update(payload.as_bytes());
    mac.verify_slice(&tag)
        .map_err(|_| ReceiptIntegrityError::InvalidSignature)
}

/// Two-outcome verification result, as printed by `hypersync verify`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyReport {
    pub ok: bool,
    pub error: Option<String>,
}

impl VerifyReport {
    pub fn check(receipt: &Receipt, key: Option<&SigningKey>) -> Self {
        match verify_receipt(receipt, key) {
            Ok(()) => Self { ok: true, error: None },
            Err(e) => Self {
                ok: false,
                error: Some(e.to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outputs(value: Value) -> Map<String, Value> {
        value.as_object().cloned().expect("object")
    }

    fn sample() -> Receipt {
        ReceiptBuilder::build(
            "op://sinkhorn_entropic.0",
            "sha256:abc",
            outputs(json!({"cost": 0.5, "transport_plan": [[0.3, 0.2], [0.0, 0.5]]})),
            ReceiptStatus::Ok,
        )
        .expect("build")
    }

    #[test]
    fn test_hash_excludes_timestamp() {
        let out = outputs(json!({"cost": 0.5}));
        let early = ReceiptBuilder::build_at(
            "op://a.0",
            "sha256:x",
            out.clone(),
            ReceiptStatus::Ok,
            DateTime::from_timestamp(0, 0).expect("ts"),
        )
        .expect("build");
        let late =
            ReceiptBuilder::build("op://a.0", "sha256:x", out, ReceiptStatus::Ok).expect("build");
        assert_ne!(early.ts, late.ts);
        assert_eq!(early.hash, late.hash);
    }

    #[test]
    fn test_hash_tolerates_sub_grid_noise() {
        let hash_of = |x: f64| {
            compute_receipt_hash("op://a.0", ReceiptStatus::Ok, &outputs(json!({ "x": x })), "r")
                .expect("hash")
        };
        let base = hash_of(0.5);
        let noisy = hash_of(0.500001);
        let moved = hash_of(0.51);
        assert_eq!(base, noisy);
        assert_ne!(base, moved);
    }

    #[test]
    fn test_hash_covers_status_and_intent_ref() {
        let out = outputs(json!({"x": 1}));
        let ok = compute_receipt_hash("op://a.0", ReceiptStatus::Ok, &out, "r").expect("hash");
        let fail = compute_receipt_hash("op://a.0", ReceiptStatus::Fail, &out, "r").expect("hash");
        let other_ref =
            compute_receipt_hash("op://a.0", ReceiptStatus::Ok, &out, "s").expect("hash");
        assert_ne!(ok, fail);
        assert_ne!(ok, other_ref);
        assert!(ok.starts_with("sha256:"));
    }

    #[test]
    fn test_unsigned_receipt_serializes_null_signature() {
        let value = serde_json::to_value(sample()).expect("serialize");
        assert_eq!(value["signature"], Value::Null);
        assert_eq!(value["status"], json!("OK"));
    }

    #[test]
    fn test_sign_and_verify() {
        let key = SigningKey::from("s3cret");
        let signed = sign_receipt(sample(), &key).expect("sign");
        let signature = signed.signature.as_deref().expect("signature");
        assert!(signature.starts_with(SIGNATURE_PREFIX));
        assert!(verify_receipt(&signed, Some(&key)).is_ok());
        assert!(verify_receipt(&signed, None).is_ok());
    }

    #[test]
    fn test_wrong_key_is_invalid_signature() {
        let signed = sign_receipt(sample(), &SigningKey::from("s3cret")).expect("sign");
        assert_eq!(
            verify_receipt(&signed, Some(&SigningKey::from("other"))),
            Err(ReceiptIntegrityError::InvalidSignature)
        );
    }

    #[test]
    fn test_garbled_signature_is_invalid() {
        let key = SigningKey::from("s3cret");
        let mut signed = sign_receipt(sample(), &key).expect("sign");
        signed.signature = Some("hmac-sha256:zz".into());
        assert_eq!(
            verify_receipt(&signed, Some(&key)),
            Err(ReceiptIntegrityError::InvalidSignature)
        );
    }

    #[test]
    fn test_tampered_outputs_is_hash_mismatch() {
        let key = SigningKey::from("s3cret");
        let mut signed = sign_receipt(sample(), &key).expect("sign");
        signed.outputs.insert("cost".into(), json!(0.9));
        assert_eq!(
            verify_receipt(&signed, Some(&key)),
            Err(ReceiptIntegrityError::HashMismatch)
        );
    }

    #[test]
    fn test_missing_signature_with_key() {
        assert_eq!(
            verify_receipt(&sample(), Some(&SigningKey::from("k"))),
            Err(ReceiptIntegrityError::MissingSignature)
        );
    }

    #[test]
    fn test_verify_report() {
        let mut receipt = sample();
        assert_eq!(VerifyReport::check(&receipt, None), VerifyReport { ok: true, error: None });
        receipt.status = ReceiptStatus::Fail;
        let report = VerifyReport::check(&receipt, None);
        assert!(!report.ok);
        assert_eq!(report.error.as_deref(), Some("Receipt hash mismatch"));
    }

    #[test]
    fn test_signing_key_debug_redacted() {
        assert_eq!(format!("{:?}", SigningKey::from("hunter2")), "SigningKey(<redacted>)");
    }
}
