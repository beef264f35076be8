//! Typed view over a [`ConfigProvider`].
//!
//! Nothing is cached: each getter reads the provider, so edits to the
//! allow-lists or thresholds apply to the next request or report.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use super::memory::MemoryConfigProvider;
use super::provider::{ConfigProvider, ConfigProviderExt};
use super::{ConfigError, ConfigResult};
use crate::ledger::RetryPolicy;

pub mod keys {
    pub const MODELS: &str = "catalog.models";
    pub const STYLES: &str = "catalog.styles";
    pub const COLORS: &str = "catalog.colors";
    pub const SIZES: &str = "catalog.sizes";

    pub const SUCCESS_RATE_DROP_THRESHOLD: &str = "anomaly.success_rate_drop_threshold";
    pub const VOLUME_SPIKE_MULTIPLIER: &str = "anomaly.volume_spike_multiplier";
    pub const DIMENSION_FAILURE_SPIKE_MULTIPLIER: &str =
        "anomaly.dimension_failure_spike_multiplier";
    pub const MIN_SAMPLES: &str = "anomaly.min_samples";
    pub const SIGNIFICANT_FAILURE_RATE: &str = "anomaly.significant_failure_rate";

    pub const MAX_ATTEMPTS: &str = "ledger.max_attempts";
    pub const INITIAL_BACKOFF_MS: &str = "ledger.initial_backoff_ms";

    pub const EXECUTOR_TIMEOUT_MS: &str = "executor.timeout_ms";
}

const DEFAULT_MODELS: [&str; 2] = ["Model A", "Model B"];
const DEFAULT_STYLES: [&str; 6] = [
    "realistic",
    "anime",
    "oil-painting",
    "sketch",
    "cyberpunk",
    "watercolor",
];
const DEFAULT_COLORS: [&str; 5] = ["vibrant", "monochrome", "pastel", "neon", "vintage"];
const DEFAULT_SIZES: [(&str, u64); 3] = [("512x512", 1), ("1024x1024", 3), ("1024x1792", 4)];

const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_INITIAL_BACKOFF_MS: u64 = 10;
const DEFAULT_EXECUTOR_TIMEOUT_MS: u64 = 30_000;

/// Thresholds for week-over-week comparison.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnomalyThresholds {
    /// Flag when the success rate falls by more than this fraction.
    pub success_rate_drop_threshold: f64,
    pub volume_spike_multiplier: f64,
    pub dimension_failure_spike_multiplier: f64,
    /// Baselines with fewer requests are not compared.
    pub min_samples: u64,
    /// A dimension spike also needs the current failure rate above this.
    pub significant_failure_rate: f64,
}

impl Default for AnomalyThresholds {
    fn default() -> Self {
        Self {
            success_rate_drop_threshold: 0.0,
            volume_spike_multiplier: 3.0,
            dimension_failure_spike_multiplier: 3.0,
            min_samples: 0,
            significant_failure_rate: 0.0,
        }
    }
}

#[derive(Clone)]
pub struct Catalog {
    provider: Arc<dyn ConfigProvider>,
}

impl Catalog {
    pub fn new(provider: Arc<dyn ConfigProvider>) -> Self {
        Self { provider }
    }

    /// Catalog backed by the stock models, styles, colors and sizes.
    pub fn with_defaults() -> Self {
        Self::new(Arc::new(Self::default_provider()))
    }

    pub fn default_provider() -> MemoryConfigProvider {
        let sizes: BTreeMap<&str, u64> = DEFAULT_SIZES.into_iter().collect();
        MemoryConfigProvider::named("catalog-defaults")
            .value(keys::MODELS, json_list(&DEFAULT_MODELS))
            .value(keys::STYLES, json_list(&DEFAULT_STYLES))
            .value(keys::COLORS, json_list(&DEFAULT_COLORS))
            .value(
                keys::SIZES,
                serde_json::to_string(&sizes).unwrap_or_else(|_| "{}".into()),
            )
    }

    pub fn provider(&self) -> &Arc<dyn ConfigProvider> {
        &self.provider
    }

    async fn read<T: DeserializeOwned + Send>(&self, key: &str) -> ConfigResult<Option<T>> {
        self.provider.get::<T>(key).await
    }

    pub async fn models(&self) -> ConfigResult<Vec<String>> {
        Ok(self
            .read(keys::MODELS)
            .await?
            .unwrap_or_else(|| DEFAULT_MODELS.iter().map(|m| m.to_string()).collect()))
    }

    pub async fn styles(&self) -> ConfigResult<Vec<String>> {
        Ok(self.read(keys::STYLES).await?.unwrap_or_default())
    }

    pub async fn colors(&self) -> ConfigResult<Vec<String>> {
        Ok(self.read(keys::COLORS).await?.unwrap_or_default())
    }

    pub async fn size_costs(&self) -> ConfigResult<BTreeMap<String, u64>> {
        let sizes: BTreeMap<String, u64> = self.read(keys::SIZES).await?.unwrap_or_default();
        if let Some((size, _)) = sizes.iter().find(|(_, cost)| **cost == 0) {
            return Err(ConfigError::invalid(
                keys::SIZES,
                format!("cost for {size} must be positive"),
            ));
        }
        Ok(sizes)
    }

    /// Cost of one request at `size`, or `None` if the size is not offered.
    pub async fn size_cost(&self, size: &str) -> ConfigResult<Option<u64>> {
        Ok(self.size_costs().await?.get(size).copied())
    }

    pub async fn anomaly_thresholds(&self) -> ConfigResult<AnomalyThresholds> {
        let defaults = AnomalyThresholds::default();
        let thresholds = AnomalyThresholds {
            success_rate_drop_threshold: self
                .fraction(keys::SUCCESS_RATE_DROP_THRESHOLD, defaults.success_rate_drop_threshold)
                .await?,
            volume_spike_multiplier: self
                .multiplier(keys::VOLUME_SPIKE_MULTIPLIER, defaults.volume_spike_multiplier)
                .await?,
            dimension_failure_spike_multiplier: self
                .multiplier(
                    keys::DIMENSION_FAILURE_SPIKE_MULTIPLIER,
                    defaults.dimension_failure_spike_multiplier,
                )
                .await?,
            min_samples: self
                .read(keys::MIN_SAMPLES)
                .await?
                .unwrap_or(defaults.min_samples),
            significant_failure_rate: self
                .fraction(keys::SIGNIFICANT_FAILURE_RATE, defaults.significant_failure_rate)
                .await?,
        };
        Ok(thresholds)
    }

    pub async fn retry_policy(&self) -> ConfigResult<RetryPolicy> {
        let max_attempts: u32 = self
            .read(keys::MAX_ATTEMPTS)
            .await?
            .unwrap_or(DEFAULT_MAX_ATTEMPTS);
        if max_attempts == 0 {
            return Err(ConfigError::invalid(keys::MAX_ATTEMPTS, "must be at least 1"));
        }
        let backoff_ms: u64 = self
            .read(keys::INITIAL_BACKOFF_MS)
            .await?
            .unwrap_or(DEFAULT_INITIAL_BACKOFF_MS);
        Ok(RetryPolicy::new(max_attempts, Duration::from_millis(backoff_ms)))
    }

    pub async fn executor_timeout(&self) -> ConfigResult<Duration> {
        let ms: u64 = self
            .read(keys::EXECUTOR_TIMEOUT_MS)
            .await?
            .unwrap_or(DEFAULT_EXECUTOR_TIMEOUT_MS);
        Ok(Duration::from_millis(ms))
    }

    async fn fraction(&self, key: &str, default: f64) -> ConfigResult<f64> {
        let value: f64 = self.read(key).await?.unwrap_or(default);
        if !(0.0..=1.0).contains(&value) {
            return Err(ConfigError::invalid(key, "must be between 0 and 1"));
        }
        Ok(value)
    }

    async fn multiplier(&self, key: &str, default: f64) -> ConfigResult<f64> {
        let value: f64 = self.read(key).await?.unwrap_or(default);
        if !value.is_finite() || value < 0.0 {
            return Err(ConfigError::invalid(key, "must be a non-negative number"));
        }
        Ok(value)
    }
}

impl std::fmt::Debug for Catalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Catalog")
            .field("provider", &self.provider.name())
            .finish()
    }
}

fn json_list(items: &[&str]) -> String {
    serde_json::to_string(items).unwrap_or_else(|_| "[]".into())
}
