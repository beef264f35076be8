//! In-process metrics for the ledger, request lifecycle and report job.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use dashmap::DashMap;

/// Thread-safe atomic counter.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Thread-safe atomic gauge.
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicI64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Fixed-bucket histogram.
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<AtomicU64>,
    bucket_bounds: Vec<f64>,
    // scaled by 1000 to keep sub-millisecond precision
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new(bucket_bounds: Vec<f64>) -> Self {
        let buckets = (0..=bucket_bounds.len())
            .map(|_| AtomicU64::new(0))
            .collect();
        Self {
            buckets,
            bucket_bounds,
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn default_latency() -> Self {
        Self::new(vec![
            10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 30000.0,
        ])
    }

    pub fn observe(&self, value: f64) {
        let idx = self
            .bucket_bounds
            .iter()
            .position(|&bound| value <= bound)
            .unwrap_or(self.bucket_bounds.len());

        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.sum
            .fetch_add((value * 1000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum_ms(&self) -> f64 {
        self.sum.load(Ordering::Relaxed) as f64 / 1000.0
    }
}

/// Outcome counts for one model.
#[derive(Debug, Default)]
pub struct ModelCounters {
    pub created: Counter,
    pub completed: Counter,
    pub failed: Counter,
}

pub struct MetricsRegistry {
    pub requests_created: Counter,
    pub requests_completed: Counter,
    pub requests_failed: Counter,
    pub pending_requests: Gauge,
    pub credits_deducted: Counter,
    pub credits_refunded: Counter,
    pub transaction_conflicts: Counter,
    pub refund_failures: Counter,
    pub reports_generated: Counter,
    pub report_runs_skipped: Counter,
    pub anomalies_flagged: Counter,
    pub execution_latency_ms: Histogram,
    by_model: DashMap<String, ModelCounters>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            requests_created: Counter::new(),
            requests_completed: Counter::new(),
            requests_failed: Counter::new(),
            pending_requests: Gauge::new(),
            credits_deducted: Counter::new(),
            credits_refunded: Counter::new(),
            transaction_conflicts: Counter::new(),
            refund_failures: Counter::new(),
            reports_generated: Counter::new(),
            report_runs_skipped: Counter::new(),
            anomalies_flagged: Counter::new(),
            execution_latency_ms: Histogram::default_latency(),
            by_model: DashMap::new(),
        }
    }

    pub fn record_request_created(&self, model: &str) {
        self.requests_created.inc();
        self.pending_requests.inc();
        self.by_model
            .entry(model.to_string())
            .or_default()
            .created
            .inc();
    }

    pub fn record_request_resolved(&self, model: &str, success: bool) {
        self.pending_requests.dec();
        let counters = self.by_model.entry(model.to_string()).or_default();
        if success {
            self.requests_completed.inc();
            counters.completed.inc();
        } else {
            self.requests_failed.inc();
            counters.failed.inc();
        }
    }

    pub fn record_deduction(&self, amount: u64) {
        self.credits_deducted.add(amount);
    }

    pub fn record_refund(&self, amount: u64) {
        self.credits_refunded.add(amount);
    }

    pub fn record_conflict(&self) {
        self.transaction_conflicts.inc();
    }

    pub fn record_refund_failure(&self) {
        self.refund_failures.inc();
    }

    pub fn record_execution(&self, latency_ms: f64) {
        self.execution_latency_ms.observe(latency_ms);
    }

    pub fn record_report(&self, anomalies: usize) {
        self.reports_generated.inc();
        self.anomalies_flagged.add(anomalies as u64);
    }

    pub fn record_report_skipped(&self) {
        self.report_runs_skipped.inc();
    }

    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary::from_registry(self)
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("summary", &self.summary())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModelSummary {
    pub created: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Point-in-time snapshot of a [`MetricsRegistry`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSummary {
    pub requests_created: u64,
    pub requests_completed: u64,
    pub requests_failed: u64,
    pub pending_requests: i64,
    pub credits_deducted: u64,
    pub credits_refunded: u64,
    pub transaction_conflicts: u64,
    pub refund_failures: u64,
    pub reports_generated: u64,
    pub report_runs_skipped: u64,
    pub anomalies_flagged: u64,
    pub avg_execution_ms: f64,
    pub by_model: BTreeMap<String, ModelSummary>,
}

impl MetricsSummary {
    pub fn from_registry(registry: &MetricsRegistry) -> Self {
        let count = registry.execution_latency_ms.count();
        let avg_execution_ms = if count > 0 {
            registry.execution_latency_ms.sum_ms() / count as f64
        } else {
            0.0
        };

        let by_model = registry
            .by_model
            .iter()
            .map(|entry| {
                let counters = entry.value();
                (
                    entry.key().clone(),
                    ModelSummary {
                        created: counters.created.get(),
                        completed: counters.completed.get(),
                        failed: counters.failed.get(),
                    },
                )
            })
            .collect();

        Self {
            requests_created: registry.requests_created.get(),
            requests_completed: registry.requests_completed.get(),
            requests_failed: registry.requests_failed.get(),
            pending_requests: registry.pending_requests.get(),
            credits_deducted: registry.credits_deducted.get(),
            credits_refunded: registry.credits_refunded.get(),
            transaction_conflicts: registry.transaction_conflicts.get(),
            refund_failures: registry.refund_failures.get(),
            reports_generated: registry.reports_generated.get(),
            report_runs_skipped: registry.report_runs_skipped.get(),
            anomalies_flagged: registry.anomalies_flagged.get(),
            avg_execution_ms,
            by_model,
        }
    }
}
