//! Balance documents and the append-only entries that mutate them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{AccountId, EntryId, RequestId};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub balance: u64,
    pub created_at: DateTime<Utc>,
}

impl Account {
    pub fn new(id: AccountId, balance: u64, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            balance,
            created_at,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Deduction,
    Refund,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deduction => "deduction",
            Self::Refund => "refund",
        }
    }
}

impl std::fmt::Display for EntryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EntryKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deduction" => Ok(Self::Deduction),
            "refund" => Ok(Self::Refund),
            other => Err(format!("unknown entry kind: {}", other)),
        }
    }
}

/// Immutable record of one balance mutation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: EntryId,
    pub account_id: AccountId,
    pub kind: EntryKind,
    pub amount: u64,
    pub request_id: RequestId,
    pub timestamp: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn new(
        account_id: AccountId,
        kind: EntryKind,
        amount: u64,
        request_id: RequestId,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: EntryId::new(),
            account_id,
            kind,
            amount,
            request_id,
            timestamp,
        }
    }

    pub fn deduction(
        account_id: AccountId,
        amount: u64,
        request_id: RequestId,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self::new(account_id, EntryKind::Deduction, amount, request_id, timestamp)
    }

    pub fn refund(
        account_id: AccountId,
        amount: u64,
        request_id: RequestId,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self::new(account_id, EntryKind::Refund, amount, request_id, timestamp)
    }

    /// Effect of this entry on the balance.
    pub fn signed_amount(&self) -> i128 {
        match self.kind {
            EntryKind::Deduction => -(self.amount as i128),
            EntryKind::Refund => self.amount as i128,
        }
    }
}

/// Current balance plus the account's entries, oldest first.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AccountLedger {
    pub account_id: AccountId,
    pub balance: u64,
    pub entries: Vec<LedgerEntry>,
}

impl AccountLedger {
    pub fn total(&self, kind: EntryKind) -> u64 {
        self.entries
            .iter()
            .filter(|e| e.kind == kind)
            .map(|e| e.amount)
            .sum()
    }

    pub fn entries_for(&self, request_id: &RequestId) -> impl Iterator<Item = &LedgerEntry> {
        self.entries
            .iter()
            .filter(move |e| &e.request_id == request_id)
    }

    pub fn history_desc(&self) -> Vec<LedgerEntry> {
        let mut entries = self.entries.clone();
        entries.reverse();
        entries
    }
}
