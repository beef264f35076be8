//! Store trait and the in-memory backend.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{StoreError, StoreResult};
use crate::types::{
    Account, AccountId, EntryKind, GenerationRequest, LedgerEntry, PeriodReport, RequestId,
};

/// A value together with the version it was read at.
#[derive(Clone, Debug, PartialEq)]
pub struct Versioned<T> {
    pub value: T,
    pub version: u64,
}

impl<T> Versioned<T> {
    pub fn new(value: T, version: u64) -> Self {
        Self { value, version }
    }
}

#[derive(Clone, Debug)]
pub enum RequestWrite {
    Insert(GenerationRequest),
    Update {
        request: GenerationRequest,
        expected_version: u64,
    },
}

impl RequestWrite {
    pub fn request(&self) -> &GenerationRequest {
        match self {
            Self::Insert(request) => request,
            Self::Update { request, .. } => request,
        }
    }
}

/// One atomic balance mutation.
///
/// Applied only if the account is still at `expected_version`; the balance,
/// the ledger entry and the optional request write land together or not at all.
#[derive(Clone, Debug)]
pub struct Commit {
    pub account_id: AccountId,
    pub expected_version: u64,
    pub balance: u64,
    pub entry: LedgerEntry,
    pub request: Option<RequestWrite>,
}

#[async_trait::async_trait]
pub trait LedgerStore: Send + Sync {
    fn name(&self) -> &str;

    async fn create_account(&self, account: &Account) -> StoreResult<()>;

    async fn load_account(&self, id: &AccountId) -> StoreResult<Option<Versioned<Account>>>;

    /// Fails with [`StoreError::Conflict`] when any expected version is stale.
    async fn commit(&self, commit: Commit) -> StoreResult<()>;

    /// Entries for one account, ordered by timestamp then append order.
    async fn entries(&self, account_id: &AccountId) -> StoreResult<Vec<LedgerEntry>>;

    async fn refund_entry(&self, request_id: &RequestId) -> StoreResult<Option<LedgerEntry>>;

    async fn refunds_for(&self, request_ids: &[RequestId]) -> StoreResult<Vec<LedgerEntry>>;

    async fn load_request(
        &self,
        id: &RequestId,
    ) -> StoreResult<Option<Versioned<GenerationRequest>>>;

    /// Compare-and-set update of a request that does not touch the ledger.
    async fn update_request(
        &self,
        request: &GenerationRequest,
        expected_version: u64,
    ) -> StoreResult<()>;

    /// Requests created in `[start, end)`, ordered by creation time.
    async fn requests_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<GenerationRequest>>;

    /// Pending requests created before `cutoff`.
    async fn pending_before(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<GenerationRequest>>;

    /// Fails with [`StoreError::DuplicateReport`] if the period key is taken.
    async fn insert_report(&self, report: &PeriodReport) -> StoreResult<()>;

    async fn load_report(&self, period_key: &str) -> StoreResult<Option<PeriodReport>>;

    /// Most recent report whose window starts before `window_start`.
    async fn latest_report_before(
        &self,
        window_start: DateTime<Utc>,
    ) -> StoreResult<Option<PeriodReport>>;
}

#[derive(Debug, Default)]
struct MemoryState {
    accounts: HashMap<AccountId, Versioned<Account>>,
    entries: Vec<LedgerEntry>,
    by_account: HashMap<AccountId, Vec<usize>>,
    refunds: HashMap<RequestId, usize>,
    requests: HashMap<RequestId, Versioned<GenerationRequest>>,
    reports: BTreeMap<String, PeriodReport>,
}

impl MemoryState {
    fn check_request_write(&self, write: &RequestWrite) -> StoreResult<()> {
        match write {
            RequestWrite::Insert(request) => {
                if self.requests.contains_key(&request.id) {
                    return Err(StoreError::conflict(format!("request:{}", request.id)));
                }
            }
            RequestWrite::Update {
                request,
                expected_version,
            } => match self.requests.get(&request.id) {
                Some(current) if current.version == *expected_version => {}
                Some(_) => return Err(StoreError::conflict(format!("request:{}", request.id))),
                None => {
                    return Err(StoreError::NotFound {
                        key: format!("request:{}", request.id),
                    });
                }
            },
        }
        Ok(())
    }

    fn apply_request_write(&mut self, write: RequestWrite) {
        match write {
            RequestWrite::Insert(request) => {
                self.requests.insert(request.id, Versioned::new(request, 1));
            }
            RequestWrite::Update {
                request,
                expected_version,
            } => {
                self.requests
                    .insert(request.id, Versioned::new(request, expected_version + 1));
            }
        }
    }
}

/// In-memory store (tests and single-instance deployments).
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn account_count(&self) -> usize {
        self.state.read().await.accounts.len()
    }

    pub async fn entry_count(&self) -> usize {
        self.state.read().await.entries.len()
    }

    pub async fn all_requests(&self) -> Vec<GenerationRequest> {
        let state = self.state.read().await;
        let mut requests: Vec<_> = state.requests.values().map(|v| v.value.clone()).collect();
        requests.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        requests
    }
}

#[async_trait::async_trait]
impl LedgerStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn create_account(&self, account: &Account) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if state.accounts.contains_key(&account.id) {
            return Err(StoreError::DuplicateAccount {
                id: account.id.to_string(),
            });
        }
        state
            .accounts
            .insert(account.id.clone(), Versioned::new(account.clone(), 1));
        Ok(())
    }

    async fn load_account(&self, id: &AccountId) -> StoreResult<Option<Versioned<Account>>> {
        let state = self.state.read().await;
        Ok(state.accounts.get(id).cloned())
    }

    async fn commit(&self, commit: Commit) -> StoreResult<()> {
        let mut state = self.state.write().await;

        match state.accounts.get(&commit.account_id) {
            Some(current) if current.version == commit.expected_version => {}
            Some(_) => return Err(StoreError::conflict(format!("account:{}", commit.account_id))),
            None => {
                return Err(StoreError::NotFound {
                    key: format!("account:{}", commit.account_id),
                });
            }
        }

        if commit.entry.kind == EntryKind::Refund
            && state.refunds.contains_key(&commit.entry.request_id)
        {
            return Err(StoreError::DuplicateRefund {
                request_id: commit.entry.request_id,
            });
        }

        if let Some(write) = &commit.request {
            state.check_request_write(write)?;
        }

        // All checks passed; apply every write under the same lock.
        if let Some(account) = state.accounts.get_mut(&commit.account_id) {
            account.value.balance = commit.balance;
            account.version += 1;
        }

        let index = state.entries.len();
        if commit.entry.kind == EntryKind::Refund {
            state.refunds.insert(commit.entry.request_id, index);
        }
        state
            .by_account
            .entry(commit.account_id.clone())
            .or_default()
            .push(index);
        state.entries.push(commit.entry);

        if let Some(write) = commit.request {
            state.apply_request_write(write);
        }

        Ok(())
    }

    async fn entries(&self, account_id: &AccountId) -> StoreResult<Vec<LedgerEntry>> {
        let state = self.state.read().await;
        let mut entries: Vec<LedgerEntry> = state
            .by_account
            .get(account_id)
            .map(|indices| indices.iter().map(|&i| state.entries[i].clone()).collect())
            .unwrap_or_default();
        // Stable sort keeps append order for equal timestamps.
        entries.sort_by_key(|e| e.timestamp);
        Ok(entries)
    }

    async fn refund_entry(&self, request_id: &RequestId) -> StoreResult<Option<LedgerEntry>> {
        let state = self.state.read().await;
        Ok(state
            .refunds
            .get(request_id)
            .map(|&i| state.entries[i].clone()))
    }

    async fn refunds_for(&self, request_ids: &[RequestId]) -> StoreResult<Vec<LedgerEntry>> {
        let state = self.state.read().await;
        Ok(request_ids
            .iter()
            .filter_map(|id| state.refunds.get(id).map(|&i| state.entries[i].clone()))
            .collect())
    }

    async fn load_request(
        &self,
        id: &RequestId,
    ) -> StoreResult<Option<Versioned<GenerationRequest>>> {
        let state = self.state.read().await;
        Ok(state.requests.get(id).cloned())
    }

    async fn update_request(
        &self,
        request: &GenerationRequest,
        expected_version: u64,
    ) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let write = RequestWrite::Update {
            request: request.clone(),
            expected_version,
        };
        state.check_request_write(&write)?;
        state.apply_request_write(write);
        Ok(())
    }

    async fn requests_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<GenerationRequest>> {
        let state = self.state.read().await;
        let mut requests: Vec<GenerationRequest> = state
            .requests
            .values()
            .filter(|v| v.value.created_at >= start && v.value.created_at < end)
            .map(|v| v.value.clone())
            .collect();
        requests.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(requests)
    }

    async fn pending_before(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<GenerationRequest>> {
        let state = self.state.read().await;
        let mut requests: Vec<GenerationRequest> = state
            .requests
            .values()
            .filter(|v| !v.value.status.is_terminal() && v.value.created_at < cutoff)
            .map(|v| v.value.clone())
            .collect();
        requests.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(requests)
    }

    async fn insert_report(&self, report: &PeriodReport) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if state.reports.contains_key(&report.period_key) {
            return Err(StoreError::DuplicateReport {
                period_key: report.period_key.clone(),
            });
        }
        state
            .reports
            .insert(report.period_key.clone(), report.clone());
        Ok(())
    }

    async fn load_report(&self, period_key: &str) -> StoreResult<Option<PeriodReport>> {
        let state = self.state.read().await;
        Ok(state.reports.get(period_key).cloned())
    }

    async fn latest_report_before(
        &self,
        window_start: DateTime<Utc>,
    ) -> StoreResult<Option<PeriodReport>> {
        let state = self.state.read().await;
        Ok(state
            .reports
            .values()
            .filter(|r| r.window_start < window_start)
            .max_by_key(|r| r.window_start)
            .cloned())
    }
}

/// Factory for store backends.
pub struct StoreFactory;

impl StoreFactory {
    pub fn memory() -> Arc<dyn LedgerStore> {
        Arc::new(MemoryStore::new())
    }
}
