//! Ledger and request lifecycle integration tests.
//!
//! Covers the balance scenarios, the ledger invariants after mixed
//! workloads, same-account contention, injected store faults and executor
//! timeouts.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use usage_ledger::clock::ManualClock;
use usage_ledger::config::{Catalog, ConfigProvider};
use usage_ledger::executor::{GenerationExecutor, SimulatedExecutor};
use usage_ledger::ledger::{CreditLedger, RetryPolicy};
use usage_ledger::lifecycle::RequestLifecycle;
use usage_ledger::observability::MetricsRegistry;
use usage_ledger::store::{
    Commit, LedgerStore, MemoryStore, StoreError, StoreResult, Versioned,
};
use usage_ledger::types::{
    Account, AccountId, EntryKind, GenerationParams, GenerationRequest, LedgerEntry, Outcome,
    PeriodReport, RequestId, RequestStatus,
};
use usage_ledger::{Error, ErrorCategory};

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 4, 9, 0, 0).unwrap()
}

fn params(size: &str) -> GenerationParams {
    GenerationParams::new("Model A", "anime", "neon", size, "a red fox")
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("usage_ledger=debug"))
        .with_test_writer()
        .try_init();
}

struct Harness {
    clock: Arc<ManualClock>,
    metrics: Arc<MetricsRegistry>,
    lifecycle: Arc<RequestLifecycle>,
}

impl Harness {
    fn new(store: Arc<dyn LedgerStore>, executor: Arc<dyn GenerationExecutor>) -> Self {
        Self::with_policy(store, executor, RetryPolicy::immediate(5))
    }

    fn with_policy(
        store: Arc<dyn LedgerStore>,
        executor: Arc<dyn GenerationExecutor>,
        policy: RetryPolicy,
    ) -> Self {
        let clock = Arc::new(ManualClock::new(start()));
        let metrics = Arc::new(MetricsRegistry::new());
        let catalog = Catalog::with_defaults();
        let ledger = CreditLedger::new(store, catalog.clone(), clock.clone())
            .with_metrics(metrics.clone())
            .with_retry_policy(policy);
        let lifecycle = RequestLifecycle::new(Arc::new(ledger), catalog, executor);
        Self {
            clock,
            metrics,
            lifecycle: Arc::new(lifecycle),
        }
    }

    fn ledger(&self) -> &CreditLedger {
        self.lifecycle.ledger()
    }

    async fn open(&self, id: &str, balance: u64) -> AccountId {
        let id = AccountId::new(id);
        self.ledger().open_account(&id, balance).await.unwrap();
        id
    }
}

/// Wraps a [`MemoryStore`] and fails commits on demand.
#[derive(Default)]
struct FaultyStore {
    inner: MemoryStore,
    conflicts: AtomicU32,
    fail_refunds: AtomicBool,
}

impl FaultyStore {
    fn inject_conflicts(&self, n: u32) {
        self.conflicts.store(n, Ordering::SeqCst);
    }

    fn fail_refunds(&self, fail: bool) {
        self.fail_refunds.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl LedgerStore for FaultyStore {
    fn name(&self) -> &str {
        "faulty"
    }

    async fn create_account(&self, account: &Account) -> StoreResult<()> {
        self.inner.create_account(account).await
    }

    async fn load_account(&self, id: &AccountId) -> StoreResult<Option<Versioned<Account>>> {
        self.inner.load_account(id).await
    }

    async fn commit(&self, commit: Commit) -> StoreResult<()> {
        if self
            .conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StoreError::conflict(format!("account:{}", commit.account_id)));
        }
        if commit.entry.kind == EntryKind::Refund && self.fail_refunds.load(Ordering::SeqCst) {
            return Err(StoreError::Storage {
                message: "connection reset".into(),
            });
        }
        self.inner.commit(commit).await
    }

    async fn entries(&self, account_id: &AccountId) -> StoreResult<Vec<LedgerEntry>> {
        self.inner.entries(account_id).await
    }

    async fn refund_entry(&self, request_id: &RequestId) -> StoreResult<Option<LedgerEntry>> {
        self.inner.refund_entry(request_id).await
    }

    async fn refunds_for(&self, request_ids: &[RequestId]) -> StoreResult<Vec<LedgerEntry>> {
        self.inner.refunds_for(request_ids).await
    }

    async fn load_request(
        &self,
        id: &RequestId,
    ) -> StoreResult<Option<Versioned<GenerationRequest>>> {
        self.inner.load_request(id).await
    }

    async fn update_request(
        &self,
        request: &GenerationRequest,
        expected_version: u64,
    ) -> StoreResult<()> {
        self.inner.update_request(request, expected_version).await
    }

    async fn requests_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<GenerationRequest>> {
        self.inner.requests_between(start, end).await
    }

    async fn pending_before(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<GenerationRequest>> {
        self.inner.pending_before(cutoff).await
    }

    async fn insert_report(&self, report: &PeriodReport) -> StoreResult<()> {
        self.inner.insert_report(report).await
    }

    async fn load_report(&self, period_key: &str) -> StoreResult<Option<PeriodReport>> {
        self.inner.load_report(period_key).await
    }

    async fn latest_report_before(
        &self,
        window_start: DateTime<Utc>,
    ) -> StoreResult<Option<PeriodReport>> {
        self.inner.latest_report_before(window_start).await
    }
}

/// Executor that never returns on its own.
struct HangingExecutor;

#[async_trait]
impl GenerationExecutor for HangingExecutor {
    async fn run(&self, _request: &GenerationRequest) -> Outcome {
        tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
        Outcome::success("never")
    }
}

// ============================================================================
// Balance scenarios
// ============================================================================

mod scenarios {
    use super::*;

    #[tokio::test]
    async fn test_last_credit_then_insufficient_funds() {
        let h = Harness::new(
            Arc::new(MemoryStore::new()),
            Arc::new(SimulatedExecutor::always_succeed()),
        );
        let alice = h.open("alice", 1).await;

        let created = h.lifecycle.create(&alice, params("512x512")).await.unwrap();
        assert_eq!(created.deducted_credits, 1);
        assert_eq!(created.balance, 0);

        let err = h
            .lifecycle
            .create(&alice, params("512x512"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::InsufficientFunds {
                balance: 0,
                required: 1
            }
        ));
        assert!(!err.state_changed());

        let history = h.ledger().history(&alice).await.unwrap();
        assert_eq!(history.balance, 0);
        assert_eq!(history.entries.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_execution_restores_balance() {
        init_tracing();
        let h = Harness::new(
            Arc::new(MemoryStore::new()),
            Arc::new(SimulatedExecutor::always_fail()),
        );
        let alice = h.open("alice", 10).await;

        let submission = h.lifecycle.submit(&alice, params("1024x1024")).await.unwrap();
        assert_eq!(submission.status, RequestStatus::Failed);
        assert_eq!(submission.refunded_credits, 3);

        let history = h.ledger().history(&alice).await.unwrap();
        assert_eq!(history.balance, 10);
        let refunds: Vec<_> = history
            .entries_for(&submission.request_id)
            .filter(|e| e.kind == EntryKind::Refund)
            .collect();
        assert_eq!(refunds.len(), 1);
        assert_eq!(refunds[0].amount, 3);
        assert_eq!(
            h.lifecycle.get(&submission.request_id).await.unwrap().status,
            RequestStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_successful_execution_keeps_charge() {
        let h = Harness::new(
            Arc::new(MemoryStore::new()),
            Arc::new(SimulatedExecutor::always_succeed()),
        );
        let alice = h.open("alice", 10).await;

        let submission = h.lifecycle.submit(&alice, params("1024x1792")).await.unwrap();
        assert_eq!(submission.status, RequestStatus::Completed);
        assert_eq!(submission.refunded_credits, 0);
        assert!(submission.result_ref.is_some());
        assert_eq!(h.ledger().balance(&alice).await.unwrap(), 6);

        let summary = h.metrics.summary();
        assert_eq!(summary.requests_completed, 1);
        assert_eq!(summary.credits_deducted, 4);
        assert_eq!(summary.pending_requests, 0);
    }

    #[tokio::test]
    async fn test_unknown_account() {
        let h = Harness::new(
            Arc::new(MemoryStore::new()),
            Arc::new(SimulatedExecutor::always_succeed()),
        );
        let ghost = AccountId::new("ghost");

        assert!(matches!(
            h.lifecycle.create(&ghost, params("512x512")).await,
            Err(Error::AccountNotFound(_))
        ));
        assert!(matches!(
            h.ledger().history(&ghost).await,
            Err(Error::AccountNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_history_ordering() {
        let h = Harness::new(
            Arc::new(MemoryStore::new()),
            Arc::new(SimulatedExecutor::always_fail()),
        );
        let alice = h.open("alice", 10).await;

        let first = h.lifecycle.create(&alice, params("512x512")).await.unwrap();
        h.clock.advance(chrono::Duration::minutes(1));
        h.lifecycle.create(&alice, params("1024x1024")).await.unwrap();
        h.clock.advance(chrono::Duration::minutes(1));
        h.lifecycle
            .resolve(&first.request_id, Outcome::failure("boom"))
            .await
            .unwrap();

        let history = h.ledger().history(&alice).await.unwrap();
        let kinds: Vec<_> = history.entries.iter().map(|e| (e.kind, e.amount)).collect();
        assert_eq!(
            kinds,
            vec![
                (EntryKind::Deduction, 1),
                (EntryKind::Deduction, 3),
                (EntryKind::Refund, 1)
            ]
        );
        let newest = history.history_desc();
        assert_eq!(newest[0].kind, EntryKind::Refund);
        assert_eq!(history.balance, 7);
    }
}

// ============================================================================
// Ledger invariants
// ============================================================================

mod invariants {
    use super::*;

    #[tokio::test]
    async fn test_mixed_workload_preserves_invariants() {
        let store = Arc::new(MemoryStore::new());
        let h = Harness::new(store.clone(), Arc::new(SimulatedExecutor::always_succeed()));
        let initial = [("alice", 7u64), ("bob", 4), ("carol", 0)];
        for (id, balance) in initial {
            h.open(id, balance).await;
        }

        let sizes = ["512x512", "1024x1024", "1024x1792"];
        let mut step = 0usize;
        for round in 0..6 {
            for (id, _) in initial {
                let account = AccountId::new(id);
                step += 1;
                let Ok(created) = h
                    .lifecycle
                    .create(&account, params(sizes[step % sizes.len()]))
                    .await
                else {
                    continue;
                };
                let outcome = match (round + step) % 3 {
                    0 => Outcome::failure("simulated"),
                    1 => Outcome::success("https://example.com/out.png"),
                    _ => continue,
                };
                h.lifecycle.resolve(&created.request_id, outcome).await.unwrap();
            }
        }

        for (id, initial_balance) in initial {
            let account = AccountId::new(id);
            let history = h.ledger().history(&account).await.unwrap();
            let deducted = history.total(EntryKind::Deduction);
            let refunded = history.total(EntryKind::Refund);
            assert_eq!(deducted - refunded, initial_balance - history.balance);
        }

        for request in store.all_requests().await {
            let history = h.ledger().history(&request.account_id).await.unwrap();
            let entries: Vec<_> = history.entries_for(&request.id).collect();
            let deductions = entries
                .iter()
                .filter(|e| e.kind == EntryKind::Deduction)
                .count();
            let refunds: Vec<_> = entries
                .iter()
                .filter(|e| e.kind == EntryKind::Refund)
                .collect();

            assert_eq!(deductions, 1, "request {} deductions", request.id);
            match request.status {
                RequestStatus::Failed => {
                    assert_eq!(refunds.len(), 1);
                    assert_eq!(refunds[0].amount, request.cost);
                }
                _ => assert!(refunds.is_empty()),
            }
        }
    }

    #[tokio::test]
    async fn test_second_resolve_rejected_without_new_entry() {
        let store = Arc::new(MemoryStore::new());
        let h = Harness::new(store.clone(), Arc::new(SimulatedExecutor::always_succeed()));
        let alice = h.open("alice", 5).await;
        let created = h.lifecycle.create(&alice, params("1024x1024")).await.unwrap();

        h.lifecycle
            .resolve(&created.request_id, Outcome::failure("boom"))
            .await
            .unwrap();
        let entries_after_first = store.entry_count().await;

        for outcome in [Outcome::failure("again"), Outcome::success("late")] {
            let err = h
                .lifecycle
                .resolve(&created.request_id, outcome)
                .await
                .unwrap_err();
            assert!(matches!(
                err,
                Error::AlreadyResolved {
                    status: RequestStatus::Failed
                }
            ));
            assert_eq!(err.category(), ErrorCategory::Rejected);
        }
        assert_eq!(store.entry_count().await, entries_after_first);
        assert_eq!(h.ledger().balance(&alice).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_cost_fixed_at_creation() {
        let h = Harness::new(
            Arc::new(MemoryStore::new()),
            Arc::new(SimulatedExecutor::always_succeed()),
        );
        let provider = h.ledger().catalog().provider().clone();
        let alice = h.open("alice", 10).await;

        let created = h.lifecycle.create(&alice, params("512x512")).await.unwrap();
        provider
            .set_raw("catalog.sizes", r#"{"512x512": 5}"#)
            .await
            .unwrap();

        let resolution = h
            .lifecycle
            .resolve(&created.request_id, Outcome::failure("boom"))
            .await
            .unwrap();
        assert_eq!(resolution.refunded_credits, 1);
        assert_eq!(h.ledger().balance(&alice).await.unwrap(), 10);

        let repriced = h.lifecycle.create(&alice, params("512x512")).await.unwrap();
        assert_eq!(repriced.deducted_credits, 5);
    }

    #[tokio::test]
    async fn test_direct_ledger_calls_keep_request_coupling() {
        let store = Arc::new(MemoryStore::new());
        let h = Harness::new(store.clone(), Arc::new(SimulatedExecutor::always_succeed()));
        let alice = h.open("alice", 5).await;

        let request = GenerationRequest::pending(alice.clone(), params("1024x1024"), 3, start());
        assert_eq!(h.ledger().deduct(&request).await.unwrap(), 2);
        let stored = store.load_request(&request.id).await.unwrap().unwrap();
        assert_eq!(stored.value.status, RequestStatus::Pending);

        let err = h
            .ledger()
            .refund(&alice, 100, RequestId::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RequestNotFound(_)));
        assert!(!err.state_changed());
        assert!(matches!(
            h.ledger().refund(&alice, 100, request.id).await,
            Err(Error::Validation { .. })
        ));
        assert_eq!(h.ledger().balance(&alice).await.unwrap(), 2);

        assert_eq!(h.ledger().refund(&alice, 3, request.id).await.unwrap(), 5);
        assert_eq!(
            h.lifecycle.get(&request.id).await.unwrap().status,
            RequestStatus::Failed
        );
        assert!(matches!(
            h.lifecycle
                .resolve(&request.id, Outcome::failure("late"))
                .await,
            Err(Error::AlreadyResolved { .. })
        ));
        assert_eq!(store.entry_count().await, 2);
    }
}

// ============================================================================
// Same-account contention
// ============================================================================

mod concurrency {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_creates_never_overdraw() {
        let store = Arc::new(MemoryStore::new());
        let h = Harness::with_policy(
            store.clone(),
            Arc::new(SimulatedExecutor::always_succeed()),
            RetryPolicy::immediate(100),
        );
        let alice = h.open("alice", 5).await;

        let handles: Vec<_> = (0..12)
            .map(|_| {
                let lifecycle = h.lifecycle.clone();
                let alice = alice.clone();
                tokio::spawn(async move { lifecycle.create(&alice, params("512x512")).await })
            })
            .collect();

        let mut created = 0;
        let mut rejected = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => created += 1,
                Err(Error::InsufficientFunds { .. }) => rejected += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }

        assert_eq!(created, 5);
        assert_eq!(rejected, 7);
        assert_eq!(h.ledger().balance(&alice).await.unwrap(), 0);
        assert_eq!(store.entry_count().await, 5);
        assert_eq!(store.all_requests().await.len(), 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_failures_refund_once() {
        let store = Arc::new(MemoryStore::new());
        let h = Harness::with_policy(
            store.clone(),
            Arc::new(SimulatedExecutor::always_succeed()),
            RetryPolicy::immediate(100),
        );
        let alice = h.open("alice", 3).await;
        let created = h.lifecycle.create(&alice, params("1024x1024")).await.unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let lifecycle = h.lifecycle.clone();
                let request_id = created.request_id;
                tokio::spawn(async move {
                    lifecycle
                        .resolve(&request_id, Outcome::failure("boom"))
                        .await
                })
            })
            .collect();

        let mut resolved = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => resolved += 1,
                Err(Error::AlreadyResolved { .. }) => {}
                Err(e) => panic!("unexpected error: {e}"),
            }
        }

        assert_eq!(resolved, 1);
        assert_eq!(h.ledger().balance(&alice).await.unwrap(), 3);
        assert_eq!(store.entry_count().await, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_accounts_do_not_contend() {
        let h = Harness::new(
            Arc::new(MemoryStore::new()),
            Arc::new(SimulatedExecutor::always_succeed()),
        );
        let mut handles = Vec::new();
        for i in 0..8 {
            let account = h.open(&format!("user-{i}"), 1).await;
            let lifecycle = h.lifecycle.clone();
            handles.push(tokio::spawn(async move {
                lifecycle.submit(&account, params("512x512")).await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap().status, RequestStatus::Completed);
        }
        assert_eq!(h.metrics.transaction_conflicts.get(), 0);
    }
}

// ============================================================================
// Injected store faults
// ============================================================================

mod faults {
    use super::*;

    #[tokio::test]
    async fn test_conflicts_retried_transparently() {
        let store = Arc::new(FaultyStore::default());
        let h = Harness::new(store.clone(), Arc::new(SimulatedExecutor::always_succeed()));
        let alice = h.open("alice", 3).await;

        store.inject_conflicts(3);
        let created = h.lifecycle.create(&alice, params("512x512")).await.unwrap();

        assert_eq!(created.balance, 2);
        assert_eq!(h.metrics.transaction_conflicts.get(), 3);
    }

    #[tokio::test]
    async fn test_exhausted_conflicts_leave_no_trace() {
        let store = Arc::new(FaultyStore::default());
        let h = Harness::with_policy(
            store.clone(),
            Arc::new(SimulatedExecutor::always_succeed()),
            RetryPolicy::immediate(3),
        );
        let alice = h.open("alice", 3).await;

        store.inject_conflicts(10);
        let err = h
            .lifecycle
            .create(&alice, params("512x512"))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::TransactionConflict { attempts: 3 }));
        assert!(err.is_retryable());
        assert_eq!(h.ledger().balance(&alice).await.unwrap(), 3);
        assert!(store.inner.all_requests().await.is_empty());
        assert_eq!(store.inner.entry_count().await, 0);
    }

    #[tokio::test]
    async fn test_failed_refund_stays_recoverable() {
        init_tracing();
        let store = Arc::new(FaultyStore::default());
        let h = Harness::new(store.clone(), Arc::new(SimulatedExecutor::always_fail()));
        let alice = h.open("alice", 4).await;

        store.fail_refunds(true);
        let err = h
            .lifecycle
            .submit(&alice, params("1024x1792"))
            .await
            .unwrap_err();
        let Error::CompensationPending { request_id, .. } = err else {
            panic!("expected pending compensation, got {err:?}");
        };
        assert_eq!(h.metrics.refund_failures.get(), 1);
        assert_eq!(
            h.lifecycle.get(&request_id).await.unwrap().status,
            RequestStatus::Pending
        );
        assert_eq!(h.ledger().balance(&alice).await.unwrap(), 0);

        h.clock.advance(chrono::Duration::hours(2));
        let stale = h
            .lifecycle
            .stale_pending(chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, request_id);

        store.fail_refunds(false);
        let resolution = h
            .lifecycle
            .resolve(&request_id, Outcome::failure("retry refund"))
            .await
            .unwrap();
        assert_eq!(resolution.request.status, RequestStatus::Failed);
        assert_eq!(resolution.refunded_credits, 4);
        assert_eq!(h.ledger().balance(&alice).await.unwrap(), 4);
        assert!(
            h.lifecycle
                .stale_pending(chrono::Duration::hours(1))
                .await
                .unwrap()
                .is_empty()
        );
    }
}

// ============================================================================
// Executor timeouts
// ============================================================================

mod timeouts {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(start()));
        let catalog = Catalog::with_defaults();
        let ledger = CreditLedger::new(store, catalog.clone(), clock)
            .with_retry_policy(RetryPolicy::immediate(5));
        let lifecycle = RequestLifecycle::new(Arc::new(ledger), catalog, Arc::new(HangingExecutor))
            .with_timeout(Duration::from_millis(50));
        let alice = AccountId::new("alice");
        lifecycle.ledger().open_account(&alice, 3).await.unwrap();

        let submission = lifecycle.submit(&alice, params("1024x1024")).await.unwrap();

        assert_eq!(submission.status, RequestStatus::Failed);
        assert_eq!(submission.refunded_credits, 3);
        assert!(
            submission
                .failure_reason
                .as_deref()
                .is_some_and(|r| r.contains("timed out"))
        );
        assert_eq!(lifecycle.ledger().balance(&alice).await.unwrap(), 3);
    }
}
