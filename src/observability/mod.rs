//! Tracing spans and in-process metrics.
//!
//! Components log through `tracing` and count through a shared
//! [`MetricsRegistry`]. Installing a subscriber is left to the host process.

mod metrics;
mod spans;

pub use metrics::{
    Counter, Gauge, Histogram, MetricsRegistry, MetricsSummary, ModelCounters, ModelSummary,
};
pub use spans::{ExecutionSpan, commit_span, create_span, report_span, resolve_span};
