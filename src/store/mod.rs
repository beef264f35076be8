//! Transactional storage for balances, ledger entries, requests and reports.
//!
//! Every balance mutation is a single [`Commit`] guarded by the account's
//! version (compare-and-set). A commit may carry one generation request write,
//! which is applied in the same atomic step as the balance and ledger entry.

mod persistence;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use persistence::{Commit, LedgerStore, MemoryStore, RequestWrite, StoreFactory, Versioned};
#[cfg(feature = "postgres")]
pub use postgres::{PostgresConfig, PostgresStore};

use thiserror::Error;

use crate::types::RequestId;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Write conflict on {key}")]
    Conflict { key: String },

    #[error("Record not found: {key}")]
    NotFound { key: String },

    #[error("Account already exists: {id}")]
    DuplicateAccount { id: String },

    #[error("Refund already recorded for request {request_id}")]
    DuplicateRefund { request_id: RequestId },

    #[error("Report already exists for period {period_key}")]
    DuplicateReport { period_key: String },

    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn conflict(key: impl std::fmt::Display) -> Self {
        Self::Conflict {
            key: key.to_string(),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[cfg(feature = "postgres")]
pub(crate) trait StorageResultExt<T> {
    fn storage_err(self) -> StoreResult<T>;
    fn storage_err_ctx(self, context: &str) -> StoreResult<T>;
}

#[cfg(feature = "postgres")]
impl<T, E: std::fmt::Display> StorageResultExt<T> for std::result::Result<T, E> {
    fn storage_err(self) -> StoreResult<T> {
        self.map_err(|e| StoreError::Storage {
            message: e.to_string(),
        })
    }

    fn storage_err_ctx(self, context: &str) -> StoreResult<T> {
        self.map_err(|e| StoreError::Storage {
            message: format!("{}: {}", context, e),
        })
    }
}
