//! Weekly usage reports.
//!
//! [`ReportJob`] aggregates the last seven days, compares them with the most
//! recent earlier report and stores the result once per period key. Runs
//! never overlap: a trigger that fires while a run is in progress is skipped.

mod aggregator;
mod anomaly;

pub use aggregator::{ReportAggregator, WINDOW_DAYS, aggregate, period_key, window_start};
pub use anomaly::AnomalyDetector;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};

use crate::clock::Clock;
use crate::config::Catalog;
use crate::observability::{MetricsRegistry, report_span};
use crate::store::LedgerStore;
use crate::types::PeriodReport;
use crate::{Error, Result};

#[derive(Clone, Debug, PartialEq)]
pub enum JobOutcome {
    Generated(PeriodReport),
    /// Another run held the lock.
    Skipped,
}

pub struct ReportJob {
    store: Arc<dyn LedgerStore>,
    aggregator: ReportAggregator,
    catalog: Catalog,
    clock: Arc<dyn Clock>,
    metrics: Arc<MetricsRegistry>,
    running: Mutex<()>,
}

impl ReportJob {
    pub fn new(store: Arc<dyn LedgerStore>, catalog: Catalog, clock: Arc<dyn Clock>) -> Self {
        Self {
            aggregator: ReportAggregator::new(store.clone()),
            store,
            catalog,
            clock,
            metrics: Arc::new(MetricsRegistry::new()),
            running: Mutex::new(()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Scheduled entry point. Returns [`JobOutcome::Skipped`] without doing
    /// anything if a run is already in progress.
    pub async fn run(&self, now: DateTime<Utc>) -> Result<JobOutcome> {
        let Ok(_guard) = self.running.try_lock() else {
            self.metrics.record_report_skipped();
            warn!(at = %now, "Report run already in progress; skipping");
            return Ok(JobOutcome::Skipped);
        };
        let report = self.generate_locked(now).await?;
        Ok(JobOutcome::Generated(report))
    }

    /// Generates, compares and stores the report for the window ending at
    /// `window_end`. Waits for any run in progress.
    ///
    /// Fails with [`Error::ReportAlreadyExists`] if the period was already
    /// reported.
    pub async fn generate_report(&self, window_end: DateTime<Utc>) -> Result<PeriodReport> {
        let _guard = self.running.lock().await;
        self.generate_locked(window_end).await
    }

    async fn generate_locked(&self, window_end: DateTime<Utc>) -> Result<PeriodReport> {
        let start = window_start(window_end);
        let key = period_key(start);
        let span = report_span(&key);

        async {
            if self.store.load_report(&key).await?.is_some() {
                return Err(Error::ReportAlreadyExists { period_key: key });
            }

            let mut report = self.aggregator.generate(window_end).await?;
            let previous = self.store.latest_report_before(start).await?;
            let detector = AnomalyDetector::new(self.catalog.anomaly_thresholds().await?);
            report.anomalies = detector.compare(&report, previous.as_ref());
            report.generated_at = self.clock.now();

            self.store.insert_report(&report).await?;

            let span = tracing::Span::current();
            span.record("total_requests", report.total_requests);
            span.record("anomalies", report.anomalies.len() as u64);
            for finding in &report.anomalies {
                warn!(
                    kind = ?finding.kind,
                    dimension = %finding.dimension,
                    current = finding.current_value,
                    previous = finding.previous_value,
                    "{}",
                    finding.description
                );
            }
            self.metrics.record_report(report.anomalies.len());
            info!(
                period_key = %report.period_key,
                total_requests = report.total_requests,
                anomalies = report.anomalies.len(),
                "Weekly report generated"
            );
            Ok::<_, Error>(report)
        }
        .instrument(span)
        .await
    }

    /// Runs the job every `every` until `cancel` fires. The first run happens
    /// immediately.
    pub fn spawn(self: Arc<Self>, every: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Report job cancelled");
                        break;
                    }
                    _ = ticker.tick() => {
                        match self.run(self.clock.now()).await {
                            Ok(_) => {}
                            Err(Error::ReportAlreadyExists { period_key }) => {
                                debug!(period_key = %period_key, "Period already reported");
                            }
                            Err(e) => error!(error = %e, "Report run failed"),
                        }
                    }
                }
            }
        })
    }
}

impl std::fmt::Debug for ReportJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReportJob")
            .field("store", &self.store.name())
            .field("catalog", &self.catalog)
            .finish()
    }
}
