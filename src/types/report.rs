//! Period reports and anomaly findings.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Success/failure counts for one dimension value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimensionStats {
    pub success: u64,
    pub failure: u64,
}

impl DimensionStats {
    pub fn total(&self) -> u64 {
        self.success + self.failure
    }

    /// `None` when nothing was resolved for this value.
    pub fn failure_rate(&self) -> Option<f64> {
        match self.total() {
            0 => None,
            total => Some(self.failure as f64 / total as f64),
        }
    }
}

pub type DimensionBreakdown = BTreeMap<String, DimensionStats>;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeriodReport {
    pub period_key: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub total_requests: u64,
    pub completed: u64,
    pub failed: u64,
    pub pending: u64,
    pub total_credits_spent: u64,
    pub total_credits_refunded: u64,
    pub success_rate: f64,
    pub by_model: DimensionBreakdown,
    pub by_style: DimensionBreakdown,
    pub by_size: DimensionBreakdown,
    pub anomalies: Vec<AnomalyFinding>,
    pub generated_at: DateTime<Utc>,
}

impl PeriodReport {
    pub fn breakdown(&self, dimension: Dimension) -> Option<&DimensionBreakdown> {
        match dimension {
            Dimension::Model => Some(&self.by_model),
            Dimension::Style => Some(&self.by_style),
            Dimension::Size => Some(&self.by_size),
            Dimension::Overall => None,
        }
    }

    /// Statistics only, without anomalies or generation time.
    pub fn statistics_json(&self) -> serde_json::Result<String> {
        let mut stats = self.clone();
        stats.anomalies.clear();
        stats.generated_at = stats.window_end;
        serde_json::to_string(&stats)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Model,
    Style,
    Size,
    Overall,
}

impl Dimension {
    pub const BREAKDOWNS: [Dimension; 3] = [Dimension::Model, Dimension::Style, Dimension::Size];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Model => "model",
            Self::Style => "style",
            Self::Size => "size",
            Self::Overall => "overall",
        }
    }
}

impl std::fmt::Display for Dimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    SuccessRateDrop,
    VolumeSpike,
    CreditSpike,
    FailureRateSpike,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnomalyFinding {
    pub kind: AnomalyKind,
    pub dimension: Dimension,
    /// Dimension value (e.g. the model name); `None` for overall findings.
    pub key: Option<String>,
    pub description: String,
    pub current_value: f64,
    pub previous_value: f64,
    pub threshold: f64,
}
