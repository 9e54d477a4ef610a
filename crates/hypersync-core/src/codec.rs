//! Canonical JSON normalization, quantization, and digest computation.
//!
//! Canonical form:
//! - UTF-16 code unit ordering for object keys (RFC 8785 §3.2.3)
//! - Integer-valued floats written as integers; NaN/Infinity rejected
//! - Arrays keep their order, no incidental whitespace
//!
//! Digests are rendered as `sha256:<hex>`.

use serde_json::{Map, Number, Value};
use sha2::{Digest, Sha256};

use crate::error::CodecError;

/// Prefix carried by every digest string produced by this module.
pub const HASH_PREFIX: &str = "sha256:";

/// Decimal places kept by [`quantize`]. Part of the receipt format contract.
pub const RECEIPT_FLOAT_DECIMALS: i32 = 4;

/// Magnitude at and above which floats are left untouched by [`quantize`].
const QUANTIZE_CEILING: f64 = 1e15;

pub type Result<T> = std::result::Result<T, CodecError>;

/// Write `value` as compact JSON with object keys in UTF-16 code unit order.
///
/// `serde_json::Map` iterates in UTF-8 byte order, so keys are ordered here
/// at write time instead of by rebuilding the map.
fn write_sorted(value: &Value, out: &mut String) -> Result<()> {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.encode_utf16().cmp(b.encode_utf16()));

            out.push('{');
            for (i, (key, v)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key)?);
                out.push(':');
                write_sorted(v, out)?;
            }
            out.push('}');
        }
        Value::Array(arr) => {
            out.push('[');
            for (i, v) in arr.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_sorted(v, out)?;
            }
            out.push(']');
        }
        scalar => out.push_str(&serde_json::to_string(scalar)?),
    }
    Ok(())
}

/// Normalize numbers: integer-valued floats → integer repr; reject NaN/Infinity.
fn normalize_value(value: &Value) -> Result<Value> {
    match value {
        Value::Object(map) => {
            let mut normalized = Map::new();
            for (k, v) in map {
                normalized.insert(k.clone(), normalize_value(v)?);
            }
            Ok(Value::Object(normalized))
        }
        Value::Array(arr) => {
            let normalized = arr.iter().map(normalize_value).collect::<Result<Vec<_>>>()?;
            Ok(Value::Array(normalized))
        }
        Value::Number(n) => {
            if n.is_i64() || n.is_u64() {
                return Ok(Value::Number(n.clone()));
            }
            match n.as_f64() {
                Some(f) if !f.is_finite() => Err(CodecError::NonFinite),
                Some(f) if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 => {
                    Ok(Value::Number(Number::from(f as i64)))
                }
                _ => Ok(Value::Number(n.clone())),
            }
        }
        other => Ok(other.clone()),
    }
}

/// Convert a JSON value to canonical form: normalize numbers → sort keys → compact JSON.
pub fn canonical_json(value: &Value) -> Result<String> {
    let normalized = normalize_value(value)?;
    let mut out = String::new();
    write_sorted(&normalized, &mut out)?;
    Ok(out)
}

/// SHA-256 of raw bytes as lowercase hex.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Compute `sha256:<hex>` over the canonical JSON of `value`.
pub fn canonical_json_hash(value: &Value) -> Result<String> {
    let canonical = canonical_json(value)?;
    Ok(format!("{HASH_PREFIX}{}", sha256_hex(canonical.as_bytes())))
}

/// Round every non-integer numeric leaf to [`RECEIPT_FLOAT_DECIMALS`] places.
///
/// Perturbations well below the grid (e.g. `1e-6`) collapse to the same
/// value; perturbations of `1e-2` and above always survive.
pub fn quantize(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), quantize(v)))
                .collect(),
        ),
        Value::Array(arr) => Value::Array(arr.iter().map(quantize).collect()),
        Value::Number(n) if !(n.is_i64() || n.is_u64()) => match n.as_f64() {
            Some(f) if f.is_finite() && f.abs() < QUANTIZE_CEILING => {
                let scale = 10f64.powi(RECEIPT_FLOAT_DECIMALS);
                let rounded = (f * scale).round() / scale;
                // Fold -0.0 into 0.0 so the sign of a vanishing value is not hashed.
                let rounded = if rounded == 0.0 { 0.0 } else { rounded };
                Number::from_f64(rounded).map_or_else(|| value.clone(), Value::Number)
            }
            _ => value.clone(),
        },
        other => other.clone(),
    }
}
