//! Structured spans for ledger commits, request transitions and reports.

use std::time::Instant;

use tracing::{Level, Span, field, span};

use crate::types::{AccountId, EntryKind, RequestId};

pub fn commit_span(account_id: &AccountId, kind: EntryKind, amount: u64) -> Span {
    span!(
        Level::INFO,
        "ledger.commit",
        account_id = %account_id,
        kind = kind.as_str(),
        amount = amount,
        attempt = field::Empty,
    )
}

pub fn create_span(account_id: &AccountId, model: &str, size: &str) -> Span {
    span!(
        Level::INFO,
        "request.create",
        account_id = %account_id,
        model = model,
        size = size,
        request_id = field::Empty,
        cost = field::Empty,
    )
}

pub fn resolve_span(request_id: &RequestId) -> Span {
    span!(
        Level::INFO,
        "request.resolve",
        request_id = %request_id,
        status = field::Empty,
    )
}

pub fn report_span(period_key: &str) -> Span {
    span!(
        Level::INFO,
        "report.generate",
        period_key = period_key,
        total_requests = field::Empty,
        anomalies = field::Empty,
    )
}

/// Times one executor call and records the outcome on its span.
pub struct ExecutionSpan {
    span: Span,
    start: Instant,
}

impl ExecutionSpan {
    pub fn new(request_id: &RequestId, model: &str) -> Self {
        let span = span!(
            Level::INFO,
            "request.execute",
            request_id = %request_id,
            model = model,
            success = field::Empty,
            latency_ms = field::Empty,
        );
        Self {
            span,
            start: Instant::now(),
        }
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Returns the elapsed time in milliseconds.
    pub fn finish(self, success: bool) -> f64 {
        let latency_ms = self.start.elapsed().as_secs_f64() * 1000.0;
        self.span.record("success", success);
        self.span.record("latency_ms", latency_ms as u64);
        latency_ms
    }
}
