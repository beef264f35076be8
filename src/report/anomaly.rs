//! Week-over-week anomaly rules.

use crate::config::AnomalyThresholds;
use crate::types::{AnomalyFinding, AnomalyKind, Dimension, PeriodReport};

#[derive(Clone, Debug, Default)]
pub struct AnomalyDetector {
    thresholds: AnomalyThresholds,
}

impl AnomalyDetector {
    pub fn new(thresholds: AnomalyThresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &AnomalyThresholds {
        &self.thresholds
    }

    /// Findings for `current` against the report before it. Without a
    /// baseline, or with one smaller than `min_samples`, nothing is flagged.
    pub fn compare(
        &self,
        current: &PeriodReport,
        previous: Option<&PeriodReport>,
    ) -> Vec<AnomalyFinding> {
        let Some(previous) = previous else {
            return Vec::new();
        };
        if previous.total_requests < self.thresholds.min_samples {
            return Vec::new();
        }

        let mut findings = Vec::new();
        findings.extend(self.success_rate_drop(current, previous));
        findings.extend(self.spike(
            AnomalyKind::VolumeSpike,
            "Request volume",
            current.total_requests,
            previous.total_requests,
        ));
        findings.extend(self.spike(
            AnomalyKind::CreditSpike,
            "Credit consumption",
            current.total_credits_spent,
            previous.total_credits_spent,
        ));
        for dimension in Dimension::BREAKDOWNS {
            self.failure_rate_spikes(dimension, current, previous, &mut findings);
        }
        findings
    }

    fn success_rate_drop(
        &self,
        current: &PeriodReport,
        previous: &PeriodReport,
    ) -> Option<AnomalyFinding> {
        // nothing resolved last week leaves no rate to fall from
        if previous.completed + previous.failed == 0 {
            return None;
        }
        let threshold = self.thresholds.success_rate_drop_threshold;
        let drop = previous.success_rate - current.success_rate;
        (drop > threshold).then(|| AnomalyFinding {
            kind: AnomalyKind::SuccessRateDrop,
            dimension: Dimension::Overall,
            key: None,
            description: format!(
                "Success rate fell from {:.1}% to {:.1}%",
                previous.success_rate * 100.0,
                current.success_rate * 100.0
            ),
            current_value: current.success_rate,
            previous_value: previous.success_rate,
            threshold,
        })
    }

    fn spike(
        &self,
        kind: AnomalyKind,
        label: &str,
        current: u64,
        previous: u64,
    ) -> Option<AnomalyFinding> {
        if previous == 0 {
            return None;
        }
        let multiplier = self.thresholds.volume_spike_multiplier;
        let (current, previous) = (current as f64, previous as f64);
        (current > previous * multiplier).then(|| AnomalyFinding {
            kind,
            dimension: Dimension::Overall,
            key: None,
            description: format!(
                "{label} rose from {previous} to {current}, more than {multiplier}x"
            ),
            current_value: current,
            previous_value: previous,
            threshold: multiplier,
        })
    }

    fn failure_rate_spikes(
        &self,
        dimension: Dimension,
        current: &PeriodReport,
        previous: &PeriodReport,
        findings: &mut Vec<AnomalyFinding>,
    ) {
        let (Some(current_stats), Some(previous_stats)) =
            (current.breakdown(dimension), previous.breakdown(dimension))
        else {
            return;
        };
        let multiplier = self.thresholds.dimension_failure_spike_multiplier;

        for (key, stats) in current_stats {
            let Some(before) = previous_stats.get(key) else {
                continue;
            };
            let (Some(now_rate), Some(prev_rate)) = (stats.failure_rate(), before.failure_rate())
            else {
                continue;
            };
            if prev_rate == 0.0 || now_rate <= self.thresholds.significant_failure_rate {
                continue;
            }
            if now_rate > prev_rate * multiplier {
                findings.push(AnomalyFinding {
                    kind: AnomalyKind::FailureRateSpike,
                    dimension,
                    key: Some(key.clone()),
                    description: format!(
                        "Failure rate for {dimension} {key} rose from {:.1}% to {:.1}%",
                        prev_rate * 100.0,
                        now_rate * 100.0
                    ),
                    current_value: now_rate,
                    previous_value: prev_rate,
                    threshold: multiplier,
                });
            }
        }
    }
}
