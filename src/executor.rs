//! Generation executors.
//!
//! The lifecycle treats an executor as one bounded call: whatever it returns
//! is final, and a failure is refunded rather than retried.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::types::{GenerationRequest, Outcome};

pub const DEFAULT_FAILURE_RATE: f64 = 0.05;

const MODEL_A_RESULT: &str =
    "https://storage.googleapis.com/proudcity/mebanenc/uploads/2018/02/placeholder-image.png";
const MODEL_B_RESULT: &str =
    "https://www.russorizio.com/wp-content/uploads/2016/07/ef3-placeholder-image.jpg";

#[async_trait]
pub trait GenerationExecutor: Send + Sync {
    fn name(&self) -> &str {
        "executor"
    }

    async fn run(&self, request: &GenerationRequest) -> Outcome;
}

/// Coin-flip executor returning a fixed placeholder per model.
#[derive(Clone, Debug)]
pub struct SimulatedExecutor {
    failure_rate: f64,
    result_refs: HashMap<String, String>,
}

impl SimulatedExecutor {
    pub fn new(failure_rate: f64) -> Self {
        let result_refs = HashMap::from([
            ("Model A".to_string(), MODEL_A_RESULT.to_string()),
            ("Model B".to_string(), MODEL_B_RESULT.to_string()),
        ]);
        Self {
            failure_rate: failure_rate.clamp(0.0, 1.0),
            result_refs,
        }
    }

    pub fn always_succeed() -> Self {
        Self::new(0.0)
    }

    pub fn always_fail() -> Self {
        Self::new(1.0)
    }

    pub fn with_result_ref(mut self, model: impl Into<String>, url: impl Into<String>) -> Self {
        self.result_refs.insert(model.into(), url.into());
        self
    }

    pub fn failure_rate(&self) -> f64 {
        self.failure_rate
    }
}

impl Default for SimulatedExecutor {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURE_RATE)
    }
}

#[async_trait]
impl GenerationExecutor for SimulatedExecutor {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn run(&self, request: &GenerationRequest) -> Outcome {
        let Some(url) = self.result_refs.get(&request.model) else {
            return Outcome::failure(format!("no simulator for model {}", request.model));
        };
        if rand::random::<f64>() < self.failure_rate {
            return Outcome::failure("generation failed due to a simulated error");
        }
        Outcome::success(url.clone())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::types::{AccountId, GenerationParams};

    fn request(model: &str) -> GenerationRequest {
        GenerationRequest::pending(
            AccountId::new("alice"),
            GenerationParams::new(model, "sketch", "pastel", "512x512", "a lighthouse"),
            1,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_always_succeed_returns_model_placeholder() {
        let executor = SimulatedExecutor::always_succeed();
        assert_eq!(
            executor.run(&request("Model B")).await,
            Outcome::success(MODEL_B_RESULT)
        );
    }

    #[tokio::test]
    async fn test_always_fail() {
        let executor = SimulatedExecutor::always_fail();
        for _ in 0..10 {
            assert!(!executor.run(&request("Model A")).await.is_success());
        }
    }

    #[tokio::test]
    async fn test_unknown_model_fails() {
        let executor = SimulatedExecutor::always_succeed();
        assert!(!executor.run(&request("Model Z")).await.is_success());

        let executor = executor.with_result_ref("Model Z", "https://example.com/z.png");
        assert!(executor.run(&request("Model Z")).await.is_success());
    }

    #[test]
    fn test_failure_rate_clamped() {
        assert_eq!(SimulatedExecutor::new(3.0).failure_rate(), 1.0);
        assert_eq!(SimulatedExecutor::default().failure_rate(), DEFAULT_FAILURE_RATE);
    }
}
