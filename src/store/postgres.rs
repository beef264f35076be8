//! PostgreSQL store backend.
//!
//! Enable with the `postgres` feature flag. Each [`Commit`] runs in one SQL
//! transaction; `UPDATE ... WHERE version = $n` is the compare-and-set.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};

use super::persistence::{Commit, LedgerStore, RequestWrite, Versioned};
use super::{StorageResultExt, StoreError, StoreResult};
use crate::types::{
    Account, AccountId, EntryId, EntryKind, GenerationRequest, LedgerEntry, PeriodReport,
    RequestId,
};

#[derive(Clone, Debug)]
pub struct PostgresConfig {
    pub table_prefix: String,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            table_prefix: "usage_".to_string(),
        }
    }
}

impl PostgresConfig {
    pub fn prefix(mut self, prefix: impl Into<String>) -> StoreResult<Self> {
        let prefix = prefix.into();
        if !prefix.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(StoreError::Storage {
                message: format!(
                    "Invalid table prefix '{}': only ASCII alphanumeric and underscore allowed",
                    prefix
                ),
            });
        }
        self.table_prefix = prefix;
        Ok(self)
    }

    fn table(&self, name: &str) -> String {
        format!("{}{}", self.table_prefix, name)
    }
}

pub struct PostgresStore {
    pool: Arc<PgPool>,
    accounts: String,
    entries: String,
    requests: String,
    reports: String,
}

impl PostgresStore {
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self::with_pool(Arc::new(pool), PostgresConfig::default()))
    }

    pub fn with_pool(pool: Arc<PgPool>, config: PostgresConfig) -> Self {
        Self {
            pool,
            accounts: config.table("accounts"),
            entries: config.table("ledger_entries"),
            requests: config.table("generation_requests"),
            reports: config.table("period_reports"),
        }
    }

    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        let ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {accounts} (
                id TEXT PRIMARY KEY,
                balance BIGINT NOT NULL CHECK (balance >= 0),
                version BIGINT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            );
            CREATE TABLE IF NOT EXISTS {entries} (
                seq BIGSERIAL PRIMARY KEY,
                id UUID NOT NULL UNIQUE,
                account_id TEXT NOT NULL REFERENCES {accounts} (id),
                kind TEXT NOT NULL,
                amount BIGINT NOT NULL CHECK (amount > 0),
                request_id UUID NOT NULL,
                ts TIMESTAMPTZ NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_{entries}_account ON {entries} (account_id, ts, seq);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_{entries}_refund
                ON {entries} (request_id) WHERE kind = 'refund';
            CREATE TABLE IF NOT EXISTS {requests} (
                id UUID PRIMARY KEY,
                account_id TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                version BIGINT NOT NULL,
                data JSONB NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_{requests}_created ON {requests} (created_at);
            CREATE INDEX IF NOT EXISTS idx_{requests}_status ON {requests} (status, created_at);
            CREATE TABLE IF NOT EXISTS {reports} (
                period_key TEXT PRIMARY KEY,
                window_start TIMESTAMPTZ NOT NULL,
                data JSONB NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_{reports}_window ON {reports} (window_start);
            "#,
            accounts = self.accounts,
            entries = self.entries,
            requests = self.requests,
            reports = self.reports,
        );
        sqlx::raw_sql(&ddl).execute(&*self.pool).await?;
        Ok(())
    }

    fn entry_from_row(row: &PgRow) -> StoreResult<LedgerEntry> {
        let kind: String = row.try_get("kind").storage_err()?;
        let amount: i64 = row.try_get("amount").storage_err()?;
        Ok(LedgerEntry {
            id: EntryId(row.try_get("id").storage_err()?),
            account_id: AccountId(row.try_get("account_id").storage_err()?),
            kind: kind.parse::<EntryKind>().storage_err()?,
            amount: to_u64(amount)?,
            request_id: RequestId(row.try_get("request_id").storage_err()?),
            timestamp: row.try_get("ts").storage_err()?,
        })
    }

    fn request_from_row(row: &PgRow) -> StoreResult<Versioned<GenerationRequest>> {
        let data: serde_json::Value = row.try_get("data").storage_err()?;
        let version: i64 = row.try_get("version").storage_err()?;
        Ok(Versioned::new(serde_json::from_value(data)?, to_u64(version)?))
    }

    async fn insert_entry(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        entry: &LedgerEntry,
    ) -> StoreResult<()> {
        let query = format!(
            "INSERT INTO {} (id, account_id, kind, amount, request_id, ts) VALUES ($1, $2, $3, $4, $5, $6)",
            self.entries
        );
        let result = sqlx::query(&query)
            .bind(entry.id.0)
            .bind(entry.account_id.as_str())
            .bind(entry.kind.as_str())
            .bind(to_i64(entry.amount)?)
            .bind(entry.request_id.0)
            .bind(entry.timestamp)
            .execute(&mut **tx)
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db))
                if db.is_unique_violation() && entry.kind == EntryKind::Refund =>
            {
                Err(StoreError::DuplicateRefund {
                    request_id: entry.request_id,
                })
            }
            Err(e) => Err(StoreError::Storage {
                message: format!("insert ledger entry: {}", e),
            }),
        }
    }

    async fn write_request(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        write: &RequestWrite,
    ) -> StoreResult<()> {
        let request = write.request();
        let data = serde_json::to_value(request)?;
        let affected = match write {
            RequestWrite::Insert(_) => {
                let query = format!(
                    "INSERT INTO {} (id, account_id, status, created_at, version, data) \
                     VALUES ($1, $2, $3, $4, 1, $5) ON CONFLICT (id) DO NOTHING",
                    self.requests
                );
                sqlx::query(&query)
                    .bind(request.id.0)
                    .bind(request.account_id.as_str())
                    .bind(request.status.as_str())
                    .bind(request.created_at)
                    .bind(&data)
                    .execute(&mut **tx)
                    .await
                    .storage_err_ctx("insert request")?
                    .rows_affected()
            }
            RequestWrite::Update {
                expected_version, ..
            } => {
                let query = format!(
                    "UPDATE {} SET status = $1, data = $2, version = version + 1 \
                     WHERE id = $3 AND version = $4",
                    self.requests
                );
                sqlx::query(&query)
                    .bind(request.status.as_str())
                    .bind(&data)
                    .bind(request.id.0)
                    .bind(to_i64(*expected_version)?)
                    .execute(&mut **tx)
                    .await
                    .storage_err_ctx("update request")?
                    .rows_affected()
            }
        };

        if affected == 0 {
            return Err(StoreError::conflict(format!("request:{}", request.id)));
        }
        Ok(())
    }
}

fn to_i64(value: u64) -> StoreResult<i64> {
    i64::try_from(value).storage_err_ctx("value exceeds BIGINT range")
}

fn to_u64(value: i64) -> StoreResult<u64> {
    u64::try_from(value).storage_err_ctx("negative value in unsigned column")
}

#[async_trait]
impl LedgerStore for PostgresStore {
    fn name(&self) -> &str {
        "postgres"
    }

    async fn create_account(&self, account: &Account) -> StoreResult<()> {
        let query = format!(
            "INSERT INTO {} (id, balance, version, created_at) VALUES ($1, $2, 1, $3) \
             ON CONFLICT (id) DO NOTHING",
            self.accounts
        );
        let result = sqlx::query(&query)
            .bind(account.id.as_str())
            .bind(to_i64(account.balance)?)
            .bind(account.created_at)
            .execute(&*self.pool)
            .await
            .storage_err_ctx("create account")?;

        if result.rows_affected() == 0 {
            return Err(StoreError::DuplicateAccount {
                id: account.id.to_string(),
            });
        }
        Ok(())
    }

    async fn load_account(&self, id: &AccountId) -> StoreResult<Option<Versioned<Account>>> {
        let query = format!(
            "SELECT balance, version, created_at FROM {} WHERE id = $1",
            self.accounts
        );
        let row = sqlx::query(&query)
            .bind(id.as_str())
            .fetch_optional(&*self.pool)
            .await
            .storage_err_ctx("load account")?;

        match row {
            Some(row) => {
                let balance: i64 = row.try_get("balance").storage_err()?;
                let version: i64 = row.try_get("version").storage_err()?;
                let created_at: DateTime<Utc> = row.try_get("created_at").storage_err()?;
                Ok(Some(Versioned::new(
                    Account::new(id.clone(), to_u64(balance)?, created_at),
                    to_u64(version)?,
                )))
            }
            None => Ok(None),
        }
    }

    async fn commit(&self, commit: Commit) -> StoreResult<()> {
        let mut tx = self.pool.begin().await.storage_err_ctx("begin")?;

        let query = format!(
            "UPDATE {} SET balance = $1, version = version + 1 WHERE id = $2 AND version = $3",
            self.accounts
        );
        let updated = sqlx::query(&query)
            .bind(to_i64(commit.balance)?)
            .bind(commit.account_id.as_str())
            .bind(to_i64(commit.expected_version)?)
            .execute(&mut *tx)
            .await
            .storage_err_ctx("update balance")?
            .rows_affected();

        if updated == 0 {
            let exists = format!("SELECT 1 FROM {} WHERE id = $1", self.accounts);
            let found = sqlx::query(&exists)
                .bind(commit.account_id.as_str())
                .fetch_optional(&mut *tx)
                .await
                .storage_err()?;
            return Err(match found {
                Some(_) => StoreError::conflict(format!("account:{}", commit.account_id)),
                None => StoreError::NotFound {
                    key: format!("account:{}", commit.account_id),
                },
            });
        }

        self.insert_entry(&mut tx, &commit.entry).await?;
        if let Some(write) = &commit.request {
            self.write_request(&mut tx, write).await?;
        }

        tx.commit().await.storage_err_ctx("commit")?;
        Ok(())
    }

    async fn entries(&self, account_id: &AccountId) -> StoreResult<Vec<LedgerEntry>> {
        let query = format!(
            "SELECT id, account_id, kind, amount, request_id, ts FROM {} \
             WHERE account_id = $1 ORDER BY ts ASC, seq ASC",
            self.entries
        );
        let rows = sqlx::query(&query)
            .bind(account_id.as_str())
            .fetch_all(&*self.pool)
            .await
            .storage_err_ctx("load entries")?;
        rows.iter().map(Self::entry_from_row).collect()
    }

    async fn refund_entry(&self, request_id: &RequestId) -> StoreResult<Option<LedgerEntry>> {
        let query = format!(
            "SELECT id, account_id, kind, amount, request_id, ts FROM {} \
             WHERE request_id = $1 AND kind = 'refund'",
            self.entries
        );
        let row = sqlx::query(&query)
            .bind(request_id.0)
            .fetch_optional(&*self.pool)
            .await
            .storage_err_ctx("load refund")?;
        row.as_ref().map(Self::entry_from_row).transpose()
    }

    async fn refunds_for(&self, request_ids: &[RequestId]) -> StoreResult<Vec<LedgerEntry>> {
        if request_ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<uuid::Uuid> = request_ids.iter().map(|id| id.0).collect();
        let query = format!(
            "SELECT id, account_id, kind, amount, request_id, ts FROM {} \
             WHERE kind = 'refund' AND request_id = ANY($1) ORDER BY ts ASC, seq ASC",
            self.entries
        );
        let rows = sqlx::query(&query)
            .bind(ids)
            .fetch_all(&*self.pool)
            .await
            .storage_err_ctx("load refunds")?;
        rows.iter().map(Self::entry_from_row).collect()
    }

    async fn load_request(
        &self,
        id: &RequestId,
    ) -> StoreResult<Option<Versioned<GenerationRequest>>> {
        let query = format!("SELECT version, data FROM {} WHERE id = $1", self.requests);
        let row = sqlx::query(&query)
            .bind(id.0)
            .fetch_optional(&*self.pool)
            .await
            .storage_err_ctx("load request")?;
        row.as_ref().map(Self::request_from_row).transpose()
    }

    async fn update_request(
        &self,
        request: &GenerationRequest,
        expected_version: u64,
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await.storage_err_ctx("begin")?;
        let write = RequestWrite::Update {
            request: request.clone(),
            expected_version,
        };
        self.write_request(&mut tx, &write).await?;
        tx.commit().await.storage_err_ctx("commit")?;
        Ok(())
    }

    async fn requests_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<GenerationRequest>> {
        let query = format!(
            "SELECT version, data FROM {} WHERE created_at >= $1 AND created_at < $2 \
             ORDER BY created_at ASC, id ASC",
            self.requests
        );
        let rows = sqlx::query(&query)
            .bind(start)
            .bind(end)
            .fetch_all(&*self.pool)
            .await
            .storage_err_ctx("load requests")?;
        rows.iter()
            .map(|row| Self::request_from_row(row).map(|v| v.value))
            .collect()
    }

    async fn pending_before(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<GenerationRequest>> {
        let query = format!(
            "SELECT version, data FROM {} WHERE status = 'pending' AND created_at < $1 \
             ORDER BY created_at ASC, id ASC",
            self.requests
        );
        let rows = sqlx::query(&query)
            .bind(cutoff)
            .fetch_all(&*self.pool)
            .await
            .storage_err_ctx("load pending requests")?;
        rows.iter()
            .map(|row| Self::request_from_row(row).map(|v| v.value))
            .collect()
    }

    async fn insert_report(&self, report: &PeriodReport) -> StoreResult<()> {
        let data = serde_json::to_value(report)?;
        let query = format!(
            "INSERT INTO {} (period_key, window_start, data) VALUES ($1, $2, $3) \
             ON CONFLICT (period_key) DO NOTHING",
            self.reports
        );
        let result = sqlx::query(&query)
            .bind(&report.period_key)
            .bind(report.window_start)
            .bind(&data)
            .execute(&*self.pool)
            .await
            .storage_err_ctx("insert report")?;

        if result.rows_affected() == 0 {
            return Err(StoreError::DuplicateReport {
                period_key: report.period_key.clone(),
            });
        }
        Ok(())
    }

    async fn load_report(&self, period_key: &str) -> StoreResult<Option<PeriodReport>> {
        let query = format!("SELECT data FROM {} WHERE period_key = $1", self.reports);
        let row = sqlx::query(&query)
            .bind(period_key)
            .fetch_optional(&*self.pool)
            .await
            .storage_err_ctx("load report")?;

        match row {
            Some(row) => {
                let data: serde_json::Value = row.try_get("data").storage_err()?;
                Ok(Some(serde_json::from_value(data)?))
            }
            None => Ok(None),
        }
    }

    async fn latest_report_before(
        &self,
        window_start: DateTime<Utc>,
    ) -> StoreResult<Option<PeriodReport>> {
        let query = format!(
            "SELECT data FROM {} WHERE window_start < $1 ORDER BY window_start DESC LIMIT 1",
            self.reports
        );
        let row = sqlx::query(&query)
            .bind(window_start)
            .fetch_optional(&*self.pool)
            .await
            .storage_err_ctx("load previous report")?;

        match row {
            Some(row) => {
                let data: serde_json::Value = row.try_get("data").storage_err()?;
                Ok(Some(serde_json::from_value(data)?))
            }
            None => Ok(None),
        }
    }
}
