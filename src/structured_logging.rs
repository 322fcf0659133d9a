//! Structured logging for order execution

use crate::errors::ErrorKind;
use crate::observability::TraceContext;
use crate::types::{OrderIntent, OrderOutcome, Side, SlotRange};

/// Structured logger bound to one intent
#[derive(Debug, Clone)]
pub struct OrderLogger {
    trace: TraceContext,
    instrument: String,
    side: Side,
}

impl OrderLogger {
    pub fn new(intent: &OrderIntent) -> Self {
        Self {
            trace: TraceContext::new("execute_order", intent.correlation_id().clone()),
            instrument: intent.instrument().to_string(),
            side: intent.side(),
        }
    }

    pub fn trace(&self) -> &TraceContext {
        &self.trace
    }

    pub fn log_accepted(&self, quantity: &str, max_slippage_bps: u16) {
        tracing::info!(
            correlation_id = %self.trace.correlation_id,
            trace_id = %self.trace.trace_id,
            instrument = %self.instrument,
            side = %self.side,
            quantity = %quantity,
            max_slippage_bps,
            "Intent accepted"
        );
    }

    pub fn log_rejected(&self, kind: ErrorKind) {
        tracing::info!(
            correlation_id = %self.trace.correlation_id,
            instrument = %self.instrument,
            error_kind = %kind,
            "Intent rejected before submission"
        );
    }

    /// Child span for one attempt
    pub fn attempt_span(&self, attempt: u32) -> TraceContext {
        self.trace.child_span(&format!("attempt-{attempt}"))
    }

    pub fn log_attempt_submitted(&self, span: &TraceContext, attempt: u32, fee_bid: u64, slots: SlotRange) {
        tracing::debug!(
            correlation_id = %self.trace.correlation_id,
            span_id = %span.span_id,
            instrument = %self.instrument,
            attempt,
            fee_bid,
            min_slot = slots.min_slot,
            max_slot = slots.max_slot,
            "Bundle submitted"
        );
    }

    pub fn log_attempt_failed(&self, attempt: u32, fee_bid: u64, kind: ErrorKind, detail: &str) {
        tracing::warn!(
            correlation_id = %self.trace.correlation_id,
            instrument = %self.instrument,
            attempt,
            fee_bid,
            error_kind = %kind,
            detail = %detail,
            "Attempt failed"
        );
    }

    pub fn log_backoff(&self, attempt: u32, delay_ms: u64) {
        tracing::debug!(
            correlation_id = %self.trace.correlation_id,
            attempt,
            delay_ms,
            "Backing off before retry"
        );
    }

    pub fn log_confirmed(&self, outcome: &OrderOutcome) {
        tracing::info!(
            correlation_id = %self.trace.correlation_id,
            instrument = %self.instrument,
            side = %self.side,
            signature = outcome.external_ref.as_deref().unwrap_or_default(),
            attempt = outcome.attempt,
            fee_paid = outcome.fee_paid,
            latency_ms = outcome.latency_ms,
            "Order confirmed"
        );
    }

    pub fn log_aborted(&self, outcome: &OrderOutcome) {
        tracing::warn!(
            correlation_id = %self.trace.correlation_id,
            instrument = %self.instrument,
            error_kind = %outcome.error.map(|k| k.as_str()).unwrap_or("unknown"),
            attempt = outcome.attempt,
            latency_ms = outcome.latency_ms,
            "Order aborted"
        );
    }

    pub fn error(&self, message: &str) {
        tracing::error!(
            correlation_id = %self.trace.correlation_id,
            instrument = %self.instrument,
            message = %message,
            "Error"
        );
    }
}
