//! Credit balances and their append-only ledger.
//!
//! Every balance change is one [`Commit`] against the account's current
//! version: the new balance and its ledger entry land together. A conflicting
//! writer forces a re-read and retry under the configured [`RetryPolicy`].

mod retry;

pub use retry::{ExponentialBackoff, RetryPolicy, with_retry};

use std::sync::Arc;

use tracing::{Instrument, debug, info};

use crate::clock::Clock;
use crate::config::Catalog;
use crate::observability::{MetricsRegistry, commit_span};
use crate::store::{Commit, LedgerStore, RequestWrite, Versioned};
use crate::types::{
    Account, AccountId, AccountLedger, EntryKind, GenerationRequest, LedgerEntry, RequestId,
    RequestStatus,
};
use crate::{Error, Result};

pub struct CreditLedger {
    store: Arc<dyn LedgerStore>,
    catalog: Catalog,
    clock: Arc<dyn Clock>,
    metrics: Arc<MetricsRegistry>,
    retry: Option<RetryPolicy>,
}

impl CreditLedger {
    pub fn new(store: Arc<dyn LedgerStore>, catalog: Catalog, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            catalog,
            clock,
            metrics: Arc::new(MetricsRegistry::new()),
            retry: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Fixed retry policy instead of the one read from the catalog.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub(crate) async fn retry_policy(&self) -> Result<RetryPolicy> {
        match &self.retry {
            Some(policy) => Ok(policy.clone()),
            None => Ok(self.catalog.retry_policy().await?),
        }
    }

    pub async fn open_account(&self, id: &AccountId, initial_balance: u64) -> Result<Account> {
        if id.is_blank() {
            return Err(Error::validation("account_id", "must not be blank"));
        }
        let account = Account::new(id.clone(), initial_balance, self.clock.now());
        self.store.create_account(&account).await?;
        info!(account_id = %id, balance = initial_balance, "Account opened");
        Ok(account)
    }

    pub async fn balance(&self, id: &AccountId) -> Result<u64> {
        Ok(self.load_account(id).await?.value.balance)
    }

    /// Current balance and every entry, oldest first.
    pub async fn history(&self, id: &AccountId) -> Result<AccountLedger> {
        let account = self.load_account(id).await?;
        let entries = self.store.entries(id).await?;
        Ok(AccountLedger {
            account_id: id.clone(),
            balance: account.value.balance,
            entries,
        })
    }

    /// Deducts the request's cost and inserts the request, pending, in the
    /// same commit. Returns the new balance.
    ///
    /// A Deduction entry never exists without its request record.
    pub async fn deduct(&self, request: &GenerationRequest) -> Result<u64> {
        if request.status != RequestStatus::Pending {
            return Err(Error::validation(
                "status",
                format!("cannot charge a {} request", request.status),
            ));
        }
        let account_id = &request.account_id;
        let amount = request.cost;
        if amount == 0 {
            return Err(Error::validation("amount", "must be positive"));
        }
        let policy = self.retry_policy().await?;
        let span = commit_span(account_id, EntryKind::Deduction, amount);

        let balance = with_retry(&policy, &self.metrics, |attempt| {
            span.record("attempt", attempt);
            async move {
                let current = self.load_account(account_id).await?;
                let balance = current.value.balance;
                let new_balance = balance
                    .checked_sub(amount)
                    .ok_or(Error::InsufficientFunds {
                        balance,
                        required: amount,
                    })?;

                self.store
                    .commit(Commit {
                        account_id: account_id.clone(),
                        expected_version: current.version,
                        balance: new_balance,
                        entry: LedgerEntry::deduction(
                            account_id.clone(),
                            amount,
                            request.id,
                            self.clock.now(),
                        ),
                        request: Some(RequestWrite::Insert(request.clone())),
                    })
                    .await?;
                Ok::<_, Error>(new_balance)
            }
            .instrument(span.clone())
        })
        .await?;

        self.metrics.record_deduction(amount);
        debug!(account_id = %account_id, amount, balance, "Deduction committed");
        Ok(balance)
    }

    /// Refunds a pending request charged to `account_id` and marks it failed.
    ///
    /// `amount` must equal the request's cost and the account must hold the
    /// matching Deduction entry. A request refunded before is rejected with
    /// [`Error::AlreadyResolved`].
    pub async fn refund(
        &self,
        account_id: &AccountId,
        amount: u64,
        request_id: RequestId,
    ) -> Result<u64> {
        let stored = self.load_pending(&request_id).await?;
        let request = &stored.value;
        if &request.account_id != account_id {
            return Err(Error::validation(
                "account_id",
                format!("request {request_id} was not charged to {account_id}"),
            ));
        }
        if amount != request.cost {
            return Err(Error::validation(
                "amount",
                format!("refund of {amount} does not match cost {}", request.cost),
            ));
        }
        let charged = self.store.entries(account_id).await?.iter().any(|entry| {
            entry.kind == EntryKind::Deduction
                && entry.request_id == request_id
                && entry.amount == amount
        });
        if !charged {
            return Err(Error::validation(
                "request_id",
                format!("no deduction recorded for request {request_id}"),
            ));
        }

        let (_, balance) = self.refund_for(&request_id).await?;
        Ok(balance)
    }

    /// Refunds a pending request's cost and marks it failed in one commit.
    ///
    /// The request is re-read on every attempt, so a concurrent resolution
    /// surfaces as [`Error::AlreadyResolved`] rather than a second refund.
    pub(crate) async fn refund_for(
        &self,
        request_id: &RequestId,
    ) -> Result<(GenerationRequest, u64)> {
        let policy = self.retry_policy().await?;

        let (failed, balance) = with_retry(&policy, &self.metrics, |attempt| async move {
            let stored = self.load_pending(request_id).await?;
            let request = &stored.value;
            let span = commit_span(&request.account_id, EntryKind::Refund, request.cost);
            span.record("attempt", attempt);

            async {
                let now = self.clock.now();
                let failed = request.failed(now);
                let current = self.load_account(&request.account_id).await?;
                let new_balance = credit(&current, request.cost)?;
                self.store
                    .commit(Commit {
                        account_id: request.account_id.clone(),
                        expected_version: current.version,
                        balance: new_balance,
                        entry: LedgerEntry::refund(
                            request.account_id.clone(),
                            request.cost,
                            *request_id,
                            now,
                        ),
                        request: Some(RequestWrite::Update {
                            request: failed.clone(),
                            expected_version: stored.version,
                        }),
                    })
                    .await?;
                Ok::<_, Error>((failed, new_balance))
            }
            .instrument(span)
            .await
        })
        .await?;

        self.metrics.record_refund(failed.cost);
        debug!(request_id = %request_id, amount = failed.cost, balance, "Request refunded");
        Ok((failed, balance))
    }

    async fn load_account(&self, id: &AccountId) -> Result<Versioned<Account>> {
        self.store
            .load_account(id)
            .await?
            .ok_or_else(|| Error::AccountNotFound(id.clone()))
    }

    pub(crate) async fn load_pending(
        &self,
        request_id: &RequestId,
    ) -> Result<Versioned<GenerationRequest>> {
        let stored = self
            .store
            .load_request(request_id)
            .await?
            .ok_or(Error::RequestNotFound(*request_id))?;
        if stored.value.status != RequestStatus::Pending {
            return Err(Error::AlreadyResolved {
                status: stored.value.status,
            });
        }
        Ok(stored)
    }
}

fn credit(account: &Versioned<Account>, amount: u64) -> Result<u64> {
    account
        .value
        .balance
        .checked_add(amount)
        .ok_or_else(|| Error::validation("amount", "balance would overflow"))
}

impl std::fmt::Debug for CreditLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CreditLedger")
            .field("store", &self.store.name())
            .field("retry", &self.retry)
            .finish()
    }
}
