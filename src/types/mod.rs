//! Core data model for the credit ledger and usage reports.

mod ids;
mod ledger;
mod report;
mod request;

pub use ids::{AccountId, EntryId, RequestId};
pub use ledger::{Account, AccountLedger, EntryKind, LedgerEntry};
pub use report::{
    AnomalyFinding, AnomalyKind, Dimension, DimensionBreakdown, DimensionStats, PeriodReport,
};
pub use request::{GenerationParams, GenerationRequest, Outcome, RequestStatus};
