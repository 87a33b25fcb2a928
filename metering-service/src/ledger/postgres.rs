//! Postgres-backed usage ledger.

use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::PgPool;
use tracing::{debug, instrument};
use uuid::Uuid;

use super::UsageLedger;
use crate::error::StoreError;
use crate::models::{BatchTally, LedgerSource, NewUsageRow, PeriodBounds, UsageRow};
use crate::services::metrics::DB_QUERY_DURATION;

/// One physical usage table. The table name comes from [`LedgerSource`], never
/// from input.
#[derive(Clone)]
pub struct PgUsageLedger {
    pool: PgPool,
    source: LedgerSource,
}

impl PgUsageLedger {
    pub fn new(pool: PgPool, source: LedgerSource) -> Self {
        Self { pool, source }
    }

    fn table(&self) -> &'static str {
        self.source.table_name()
    }

    /// Insert a usage row the way upstream producers do.
    #[instrument(skip(self, input), fields(ledger = self.source.as_str(), owner_user_id = %input.owner_user_id))]
    pub async fn record(&self, input: &NewUsageRow) -> Result<UsageRow, StoreError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["record_usage"])
            .start_timer();

        let row = sqlx::query_as::<_, UsageRow>(&format!(
            r#"
            INSERT INTO {} (id, owner_user_id, billable_amount, created_at, metered, batch_key)
            VALUES ($1, $2, $3, $4, FALSE, NULL)
            RETURNING id, owner_user_id, billable_amount, created_at, metered, batch_key
            "#,
            self.table()
        ))
        .bind(Uuid::new_v4())
        .bind(input.owner_user_id)
        .bind(input.billable_amount)
        .bind(input.created_at)
        .fetch_one(&self.pool)
        .await?;

        timer.observe_duration();

        Ok(row)
    }

    /// Fetch a row by id.
    pub async fn get(&self, id: Uuid) -> Result<Option<UsageRow>, StoreError> {
        let row = sqlx::query_as::<_, UsageRow>(&format!(
            r#"
            SELECT id, owner_user_id, billable_amount, created_at, metered, batch_key
            FROM {}
            WHERE id = $1
            "#,
            self.table()
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }
}

#[async_trait]
impl UsageLedger for PgUsageLedger {
    fn source(&self) -> LedgerSource {
        self.source
    }

    #[instrument(skip(self), fields(ledger = self.source.as_str()))]
    async fn owners_with_unmetered(&self) -> Result<Vec<Uuid>, StoreError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["owners_with_unmetered"])
            .start_timer();

        let owners: Vec<Uuid> = sqlx::query_scalar(&format!(
            r#"
            SELECT DISTINCT owner_user_id
            FROM {}
            WHERE metered = FALSE
            "#,
            self.table()
        ))
        .fetch_all(&self.pool)
        .await?;

        timer.observe_duration();

        Ok(owners)
    }

    #[instrument(skip(self, bounds), fields(ledger = self.source.as_str()))]
    async fn pending_batch_keys(
        &self,
        owner_user_id: Uuid,
        bounds: &PeriodBounds,
    ) -> Result<Vec<String>, StoreError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["pending_batch_keys"])
            .start_timer();

        let keys: Vec<String> = sqlx::query_scalar(&format!(
            r#"
            SELECT DISTINCT batch_key
            FROM {}
            WHERE owner_user_id = $1
              AND metered = FALSE
              AND batch_key IS NOT NULL
              AND created_at >= $2
              AND created_at < $3
            ORDER BY batch_key
            "#,
            self.table()
        ))
        .bind(owner_user_id)
        .bind(bounds.start)
        .bind(bounds.end)
        .fetch_all(&self.pool)
        .await?;

        timer.observe_duration();

        Ok(keys)
    }

    #[instrument(skip(self, bounds), fields(ledger = self.source.as_str()))]
    async fn find_unmetered(
        &self,
        owner_user_id: Uuid,
        bounds: &PeriodBounds,
    ) -> Result<Vec<UsageRow>, StoreError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_unmetered"])
            .start_timer();

        let rows = sqlx::query_as::<_, UsageRow>(&format!(
            r#"
            SELECT id, owner_user_id, billable_amount, created_at, metered, batch_key
            FROM {}
            WHERE owner_user_id = $1
              AND metered = FALSE
              AND batch_key IS NULL
              AND created_at >= $2
              AND created_at < $3
            ORDER BY created_at, id
            "#,
            self.table()
        ))
        .bind(owner_user_id)
        .bind(bounds.start)
        .bind(bounds.end)
        .fetch_all(&self.pool)
        .await?;

        timer.observe_duration();

        Ok(rows)
    }

    #[instrument(skip(self, ids), fields(ledger = self.source.as_str(), candidates = ids.len()))]
    async fn claim(&self, ids: &[Uuid], batch_key: &str) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let timer = DB_QUERY_DURATION
            .with_label_values(&["claim"])
            .start_timer();

        // The batch_key IS NULL guard is what makes concurrent claims safe.
        let result = sqlx::query(&format!(
            r#"
            UPDATE {}
            SET batch_key = $1
            WHERE id = ANY($2)
              AND batch_key IS NULL
              AND metered = FALSE
            "#,
            self.table()
        ))
        .bind(batch_key)
        .bind(ids)
        .execute(&self.pool)
        .await?;

        timer.observe_duration();

        debug!(claimed = result.rows_affected(), "Claimed usage rows");

        Ok(result.rows_affected())
    }

    #[instrument(skip(self, bounds), fields(ledger = self.source.as_str()))]
    async fn tally_batch(
        &self,
        owner_user_id: Uuid,
        batch_key: &str,
        bounds: &PeriodBounds,
    ) -> Result<BatchTally, StoreError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["tally_batch"])
            .start_timer();

        let (rows, total): (i64, Decimal) = sqlx::query_as(&format!(
            r#"
            SELECT COUNT(*), COALESCE(SUM(billable_amount), 0)
            FROM {}
            WHERE owner_user_id = $1
              AND batch_key = $2
              AND metered = FALSE
              AND created_at >= $3
              AND created_at < $4
            "#,
            self.table()
        ))
        .bind(owner_user_id)
        .bind(batch_key)
        .bind(bounds.start)
        .bind(bounds.end)
        .fetch_one(&self.pool)
        .await?;

        timer.observe_duration();

        Ok(BatchTally {
            rows: rows.max(0) as u64,
            total,
        })
    }

    #[instrument(skip(self), fields(ledger = self.source.as_str()))]
    async fn mark_metered(&self, batch_key: &str) -> Result<u64, StoreError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["mark_metered"])
            .start_timer();

        let result = sqlx::query(&format!(
            r#"
            UPDATE {}
            SET metered = TRUE
            WHERE batch_key = $1
              AND metered = FALSE
            "#,
            self.table()
        ))
        .bind(batch_key)
        .execute(&self.pool)
        .await?;

        timer.observe_duration();

        Ok(result.rows_affected())
    }

    #[instrument(skip(self), fields(ledger = self.source.as_str()))]
    async fn release(&self, batch_key: &str) -> Result<u64, StoreError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["release"])
            .start_timer();

        let result = sqlx::query(&format!(
            r#"
            UPDATE {}
            SET batch_key = NULL
            WHERE batch_key = $1
              AND metered = FALSE
            "#,
            self.table()
        ))
        .bind(batch_key)
        .execute(&self.pool)
        .await?;

        timer.observe_duration();

        Ok(result.rows_affected())
    }
}
