//! # usage-ledger
//!
//! Credit ledger for a usage-metered generation service.
//!
//! Callers spend credits to run a generation request. The deduction and the
//! request record are committed together, a failed execution is refunded
//! exactly once, and a weekly job aggregates activity and flags anomalies
//! against the previous week.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use usage_ledger::{
//!     Catalog, CreditLedger, GenerationParams, RequestLifecycle, SimulatedExecutor,
//!     StoreFactory, SystemClock,
//! };
//!
//! # async fn example() -> usage_ledger::Result<()> {
//! let store = StoreFactory::memory();
//! let catalog = Catalog::with_defaults();
//! let ledger = Arc::new(CreditLedger::new(store.clone(), catalog.clone(), Arc::new(SystemClock)));
//! ledger.open_account(&"alice".into(), 10).await?;
//!
//! let lifecycle = RequestLifecycle::new(ledger, catalog, Arc::new(SimulatedExecutor::default()));
//! let params = GenerationParams::new("Model A", "anime", "neon", "512x512", "a red fox");
//! let submission = lifecycle.submit(&"alice".into(), params).await?;
//! println!("{} -> {}", submission.request_id, submission.status);
//! # Ok(())
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod clock;
pub mod config;
pub mod executor;
pub mod ledger;
pub mod lifecycle;
pub mod observability;
pub mod report;
pub mod store;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AnomalyThresholds, Catalog, ConfigError, ConfigProvider};
pub use executor::{GenerationExecutor, SimulatedExecutor};
pub use ledger::{CreditLedger, ExponentialBackoff, RetryPolicy};
pub use lifecycle::{Created, RequestLifecycle, Resolution, Submission};
pub use observability::{MetricsRegistry, MetricsSummary};
pub use report::{AnomalyDetector, JobOutcome, ReportAggregator, ReportJob};
pub use store::{LedgerStore, MemoryStore, StoreError, StoreFactory};
pub use types::{
    Account, AccountId, AccountLedger, AnomalyFinding, AnomalyKind, Dimension, DimensionStats,
    EntryKind, GenerationParams, GenerationRequest, LedgerEntry, Outcome, PeriodReport,
    RequestId, RequestStatus,
};

/// Error type for ledger, lifecycle and report operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Input failed a required-field or allow-list check.
    #[error("Invalid {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Account not found: {0}")]
    AccountNotFound(AccountId),

    #[error("Account already exists: {0}")]
    AccountExists(AccountId),

    #[error("Request not found: {0}")]
    RequestNotFound(RequestId),

    #[error("Insufficient funds: balance {balance}, required {required}")]
    InsufficientFunds { balance: u64, required: u64 },

    /// Optimistic-concurrency retries ran out.
    #[error("Transaction conflict after {attempts} attempts")]
    TransactionConflict { attempts: u32 },

    #[error("Request already resolved as {status}")]
    AlreadyResolved { status: RequestStatus },

    #[error("Refund already recorded for request {0}")]
    DuplicateRefund(RequestId),

    #[error("Report already exists for period {period_key}")]
    ReportAlreadyExists { period_key: String },

    /// The execution failed but its refund could not be committed. The
    /// request stays pending so the refund can be retried.
    #[error("Refund outstanding for request {request_id}: {reason}")]
    CompensationPending {
        request_id: RequestId,
        reason: String,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Store(StoreError),
}

/// Error category for unified error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Nothing was written: bad input, unknown ids, insufficient funds or a
    /// repeated resolve/report.
    Rejected,
    /// Conflicts and storage failures that may succeed on retry
    Transient,
    /// A refund obligation is outstanding
    Recoverable,
    /// Configuration or serialization faults
    Internal,
}

impl Error {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Validation { .. }
            | Error::AccountNotFound(_)
            | Error::AccountExists(_)
            | Error::RequestNotFound(_)
            | Error::InsufficientFunds { .. }
            | Error::AlreadyResolved { .. }
            | Error::DuplicateRefund(_)
            | Error::ReportAlreadyExists { .. } => ErrorCategory::Rejected,

            Error::TransactionConflict { .. } => ErrorCategory::Transient,
            Error::Store(StoreError::Serialization(_)) => ErrorCategory::Internal,
            Error::Store(_) => ErrorCategory::Transient,

            Error::CompensationPending { .. } => ErrorCategory::Recoverable,

            Error::Config(_) => ErrorCategory::Internal,
        }
    }

    /// False when the operation is known to have written nothing.
    pub fn state_changed(&self) -> bool {
        match self.category() {
            ErrorCategory::Rejected => false,
            ErrorCategory::Recoverable => true,
            // a failed commit is rolled back; other faults happen before any write
            ErrorCategory::Transient | ErrorCategory::Internal => false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DuplicateAccount { id } => Error::AccountExists(AccountId::new(id)),
            StoreError::DuplicateRefund { request_id } => Error::DuplicateRefund(request_id),
            StoreError::DuplicateReport { period_key } => Error::ReportAlreadyExists { period_key },
            other => Error::Store(other),
        }
    }
}

/// Result type alias using the crate's [`Error`] type.
pub type Result<T> = std::result::Result<T, Error>;
