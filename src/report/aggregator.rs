//! Weekly aggregation of generation requests.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::Result;
use crate::store::LedgerStore;
use crate::types::{
    DimensionBreakdown, GenerationRequest, LedgerEntry, PeriodReport, RequestId, RequestStatus,
};

pub const WINDOW_DAYS: i64 = 7;

/// Reports are keyed by the date their window starts.
pub fn period_key(window_start: DateTime<Utc>) -> String {
    window_start.format("%Y-%m-%d").to_string()
}

pub fn window_start(window_end: DateTime<Utc>) -> DateTime<Utc> {
    window_end - Duration::days(WINDOW_DAYS)
}

#[derive(Clone)]
pub struct ReportAggregator {
    store: Arc<dyn LedgerStore>,
}

impl ReportAggregator {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Statistics for `[now - 7d, now)`. Reads only; anomalies are left empty.
    pub async fn generate(&self, now: DateTime<Utc>) -> Result<PeriodReport> {
        let start = window_start(now);
        let requests = self.store.requests_between(start, now).await?;
        let ids: Vec<RequestId> = requests.iter().map(|r| r.id).collect();
        let refunds = self.store.refunds_for(&ids).await?;
        Ok(aggregate(start, now, &requests, &refunds))
    }
}

/// Builds the report for one window from its requests and their refunds.
pub fn aggregate(
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    requests: &[GenerationRequest],
    refunds: &[LedgerEntry],
) -> PeriodReport {
    let mut report = PeriodReport {
        period_key: period_key(window_start),
        window_start,
        window_end,
        total_requests: requests.len() as u64,
        completed: 0,
        failed: 0,
        pending: 0,
        total_credits_spent: 0,
        total_credits_refunded: 0,
        success_rate: 0.0,
        by_model: DimensionBreakdown::new(),
        by_style: DimensionBreakdown::new(),
        by_size: DimensionBreakdown::new(),
        anomalies: Vec::new(),
        generated_at: window_end,
    };

    for request in requests {
        let success = match request.status {
            RequestStatus::Pending => {
                report.pending += 1;
                continue;
            }
            RequestStatus::Completed => {
                report.completed += 1;
                true
            }
            RequestStatus::Failed => {
                report.failed += 1;
                false
            }
        };
        // Charged upfront, so failed requests count as spent too.
        report.total_credits_spent = report.total_credits_spent.saturating_add(request.cost);

        for (breakdown, key) in [
            (&mut report.by_model, &request.model),
            (&mut report.by_style, &request.style),
            (&mut report.by_size, &request.size),
        ] {
            let stats = breakdown.entry(key.clone()).or_default();
            if success {
                stats.success += 1;
            } else {
                stats.failure += 1;
            }
        }
    }

    let in_window: HashSet<RequestId> = requests.iter().map(|r| r.id).collect();
    report.total_credits_refunded = refunds
        .iter()
        .filter(|entry| in_window.contains(&entry.request_id))
        .fold(0u64, |total, entry| total.saturating_add(entry.amount));

    let resolved = report.completed + report.failed;
    if resolved > 0 {
        report.success_rate = report.completed as f64 / resolved as f64;
    }
    report
}
