//! Generation request state machine: `Pending -> Completed | Failed`.
//!
//! A request exists only if its deduction committed, and it fails only
//! together with its refund. When a refund cannot be committed the request
//! stays `Pending` and [`Error::CompensationPending`] is returned; calling
//! [`RequestLifecycle::resolve`] again with a failure retries the refund.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{Instrument, error, info, warn};

use crate::config::Catalog;
use crate::executor::GenerationExecutor;
use crate::ledger::{CreditLedger, with_retry};
use crate::observability::{ExecutionSpan, create_span, resolve_span};
use crate::types::{
    AccountId, GenerationParams, GenerationRequest, Outcome, RequestId, RequestStatus,
};
use crate::{Error, ErrorCategory, Result};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Created {
    pub request_id: RequestId,
    pub deducted_credits: u64,
    pub balance: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub request: GenerationRequest,
    pub refunded_credits: u64,
}

/// Result of [`RequestLifecycle::submit`].
///
/// An execution failure is not an error: it shows up as `status == Failed`
/// with the deducted credits refunded.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    pub request_id: RequestId,
    pub deducted_credits: u64,
    pub status: RequestStatus,
    pub result_ref: Option<String>,
    pub refunded_credits: u64,
    pub failure_reason: Option<String>,
}

pub struct RequestLifecycle {
    ledger: Arc<CreditLedger>,
    catalog: Catalog,
    executor: Arc<dyn GenerationExecutor>,
    timeout: Option<Duration>,
}

impl RequestLifecycle {
    pub fn new(
        ledger: Arc<CreditLedger>,
        catalog: Catalog,
        executor: Arc<dyn GenerationExecutor>,
    ) -> Self {
        Self {
            ledger,
            catalog,
            executor,
            timeout: None,
        }
    }

    /// Fixed executor timeout instead of `executor.timeout_ms`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn ledger(&self) -> &Arc<CreditLedger> {
        &self.ledger
    }

    /// Validates `params`, prices the request by size and deducts the cost.
    /// The request is stored as `Pending` in the same commit.
    pub async fn create(&self, account_id: &AccountId, params: GenerationParams) -> Result<Created> {
        let (request, balance) = self.create_request(account_id, params).await?;
        Ok(Created {
            request_id: request.id,
            deducted_credits: request.cost,
            balance,
        })
    }

    async fn create_request(
        &self,
        account_id: &AccountId,
        params: GenerationParams,
    ) -> Result<(GenerationRequest, u64)> {
        let span = create_span(account_id, &params.model, &params.size);
        async {
            let cost = self.validate(account_id, &params).await?;
            let now = self.ledger.clock().now();
            let request = GenerationRequest::pending(account_id.clone(), params, cost, now);
            let balance = self.ledger.deduct(&request).await?;

            tracing::Span::current().record("request_id", tracing::field::display(&request.id));
            tracing::Span::current().record("cost", cost);
            self.ledger.metrics().record_request_created(&request.model);
            info!(request_id = %request.id, cost, balance, "Generation request created");
            Ok::<_, Error>((request, balance))
        }
        .instrument(span)
        .await
    }

    async fn validate(&self, account_id: &AccountId, params: &GenerationParams) -> Result<u64> {
        if account_id.is_blank() {
            return Err(Error::validation("account_id", "Missing required field"));
        }
        if let Some(field) = params.first_missing() {
            return Err(Error::validation(field, "Missing required field"));
        }

        check_allowed("model", &params.model, &self.catalog.models().await?)?;
        check_allowed("style", &params.style, &self.catalog.styles().await?)?;
        check_allowed("color", &params.color, &self.catalog.colors().await?)?;

        self.catalog
            .size_cost(&params.size)
            .await?
            .ok_or_else(|| Error::validation("size", format!("unsupported size {}", params.size)))
    }

    /// Moves a pending request to its terminal state. A failure refunds the
    /// request's cost in the same commit that marks it `Failed`.
    pub async fn resolve(&self, request_id: &RequestId, outcome: Outcome) -> Result<Resolution> {
        let span = resolve_span(request_id);
        async {
            let resolution = match outcome {
                Outcome::Success { result_ref } => self.complete(request_id, result_ref).await?,
                Outcome::Failure { reason } => self.fail(request_id, &reason).await?,
            };
            tracing::Span::current().record("status", resolution.request.status.as_str());
            Ok::<_, Error>(resolution)
        }
        .instrument(span)
        .await
    }

    async fn complete(
        &self,
        request_id: &RequestId,
        result_ref: Option<String>,
    ) -> Result<Resolution> {
        let ledger = &self.ledger;
        let policy = ledger.retry_policy().await?;

        let completed = with_retry(&policy, ledger.metrics(), |_| {
            let result_ref = result_ref.clone();
            async move {
                let stored = ledger.load_pending(request_id).await?;
                let completed = stored.value.completed(result_ref, ledger.clock().now());
                ledger
                    .store()
                    .update_request(&completed, stored.version)
                    .await?;
                Ok::<_, Error>(completed)
            }
        })
        .await?;

        ledger
            .metrics()
            .record_request_resolved(&completed.model, true);
        info!(request_id = %request_id, "Generation request completed");
        Ok(Resolution {
            request: completed,
            refunded_credits: 0,
        })
    }

    async fn fail(&self, request_id: &RequestId, reason: &str) -> Result<Resolution> {
        match self.ledger.refund_for(request_id).await {
            Ok((failed, balance)) => {
                self.ledger
                    .metrics()
                    .record_request_resolved(&failed.model, false);
                info!(
                    request_id = %request_id,
                    refunded = failed.cost,
                    balance,
                    reason,
                    "Generation request failed and refunded"
                );
                Ok(Resolution {
                    refunded_credits: failed.cost,
                    request: failed,
                })
            }
            Err(e) if e.category() == ErrorCategory::Rejected => Err(e),
            Err(e) => {
                self.ledger.metrics().record_refund_failure();
                error!(
                    request_id = %request_id,
                    error = %e,
                    "Refund could not be committed; request left pending"
                );
                Err(Error::CompensationPending {
                    request_id: *request_id,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Creates a request, runs it on the executor and resolves it.
    pub async fn submit(
        &self,
        account_id: &AccountId,
        params: GenerationParams,
    ) -> Result<Submission> {
        let timeout = match self.timeout {
            Some(timeout) => timeout,
            None => self.catalog.executor_timeout().await?,
        };
        let (request, _) = self.create_request(account_id, params).await?;

        let execution = ExecutionSpan::new(&request.id, &request.model);
        let outcome = match tokio::time::timeout(
            timeout,
            self.executor
                .run(&request)
                .instrument(execution.span().clone()),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(
                    request_id = %request.id,
                    timeout_ms = timeout.as_millis() as u64,
                    executor = self.executor.name(),
                    "Generation timed out"
                );
                Outcome::failure(format!(
                    "generation timed out after {}ms",
                    timeout.as_millis()
                ))
            }
        };
        let latency_ms = execution.finish(outcome.is_success());
        self.ledger.metrics().record_execution(latency_ms);

        let failure_reason = match &outcome {
            Outcome::Failure { reason } => Some(reason.clone()),
            Outcome::Success { .. } => None,
        };
        let resolution = self.resolve(&request.id, outcome).await?;

        Ok(Submission {
            request_id: request.id,
            deducted_credits: request.cost,
            status: resolution.request.status,
            result_ref: resolution.request.result_ref,
            refunded_credits: resolution.refunded_credits,
            failure_reason,
        })
    }

    pub async fn get(&self, request_id: &RequestId) -> Result<GenerationRequest> {
        self.ledger
            .store()
            .load_request(request_id)
            .await?
            .map(|stored| stored.value)
            .ok_or(Error::RequestNotFound(*request_id))
    }

    /// Pending requests created more than `max_age` ago, oldest first.
    pub async fn stale_pending(&self, max_age: chrono::Duration) -> Result<Vec<GenerationRequest>> {
        let cutoff = self.ledger.clock().now() - max_age;
        Ok(self.ledger.store().pending_before(cutoff).await?)
    }
}

fn check_allowed(field: &str, value: &str, allowed: &[String]) -> Result<()> {
    if allowed.iter().any(|a| a == value) {
        Ok(())
    } else {
        Err(Error::validation(field, format!("unsupported {field} {value}")))
    }
}

impl std::fmt::Debug for RequestLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestLifecycle")
            .field("ledger", &self.ledger)
            .field("executor", &self.executor.name())
            .field("timeout", &self.timeout)
            .finish()
    }
}
