//! Structured lifecycle events for intent processing.
//!
//! Every intent runs inside an [`intent_span`]; the `emit_*` functions log
//! one event each with a stable `event` field so log pipelines can filter
//! on it.

use tracing::{info, warn, Span};

/// Span tagging everything logged while an intent is processed.
///
/// Attach with `Instrument::instrument` rather than entering it, so the
/// span follows the future across worker threads.
pub fn intent_span(intent_id: &str, op: &str) -> Span {
    tracing::info_span!("intent", intent_id = %intent_id, op = %op)
}

pub fn emit_intent_received(intent_id: &str, op: &str) {
    info!(event = "intent.received", intent_id = %intent_id, op = %op);
}

pub fn emit_intent_denied(reason: &str) {
    warn!(event = "intent.denied", reason = %reason);
}

/// Planning outcome, including "no plan".
pub fn emit_intent_planned(operator: Option<&str>, reason: &str, overrides: usize) {
    info!(
        event = "intent.planned",
        operator = operator.unwrap_or("-"),
        reason = %reason,
        overrides = overrides,
    );
}

pub fn emit_intent_invalid(operator: &str, error: &dyn std::fmt::Display) {
    warn!(event = "intent.invalid", operator = %operator, error = %error);
}

pub fn emit_operator_executed(operator: &str, duration_ms: u64) {
    info!(event = "operator.executed", operator = %operator, duration_ms = duration_ms);
}

pub fn emit_operator_failed(operator: &str, code: &str, error: &dyn std::fmt::Display) {
    warn!(event = "operator.failed", operator = %operator, code = %code, error = %error);
}

pub fn emit_receipt_emitted(status: &str, hash: &str, signed: bool) {
    info!(event = "receipt.emitted", status = %status, hash = %hash, signed = signed);
}
