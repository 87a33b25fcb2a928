//! Postgres-backed batch store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{instrument, warn};
use uuid::Uuid;

use super::BatchStore;
use crate::error::StoreError;
use crate::models::{MeteringBatch, UpsertBatch};
use crate::services::metrics::DB_QUERY_DURATION;

const BATCH_COLUMNS: &str = "batch_key, owner_user_id, idempotency_key, period_start, period_end, total_billable_amount, rounded_quantity, external_confirmation_id, status, created_utc, updated_utc";

#[derive(Clone)]
pub struct PgBatchStore {
    pool: PgPool,
}

impl PgBatchStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BatchStore for PgBatchStore {
    #[instrument(skip(self, input), fields(batch_key = %input.batch_key, owner_user_id = %input.owner_user_id))]
    async fn upsert(&self, input: &UpsertBatch) -> Result<MeteringBatch, StoreError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["upsert_batch"])
            .start_timer();

        let updated = sqlx::query_as::<_, MeteringBatch>(&format!(
            r#"
            INSERT INTO metering_batches (batch_key, owner_user_id, idempotency_key, period_start, period_end, total_billable_amount, rounded_quantity, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (batch_key) DO UPDATE
            SET total_billable_amount = EXCLUDED.total_billable_amount,
                rounded_quantity = EXCLUDED.rounded_quantity,
                period_start = EXCLUDED.period_start,
                period_end = EXCLUDED.period_end,
                status = EXCLUDED.status,
                updated_utc = NOW()
            WHERE metering_batches.external_confirmation_id IS NULL
              AND metering_batches.status = 'pending'
            RETURNING {}
            "#,
            BATCH_COLUMNS
        ))
        .bind(&input.batch_key)
        .bind(input.owner_user_id)
        .bind(input.idempotency_key())
        .bind(input.period.start_date)
        .bind(input.period.end_date)
        .bind(input.total_billable_amount)
        .bind(input.rounded_quantity)
        .bind(input.status.as_str())
        .fetch_optional(&self.pool)
        .await?;

        // No row back means the conflict guard kept a finalized record.
        let batch = match updated {
            Some(batch) => batch,
            None => self.get(&input.batch_key).await?.ok_or_else(|| {
                StoreError::Unavailable(format!("batch {} vanished during upsert", input.batch_key))
            })?,
        };

        timer.observe_duration();

        Ok(batch)
    }

    #[instrument(skip(self))]
    async fn record_confirmation(
        &self,
        batch_key: &str,
        confirmation_id: &str,
    ) -> Result<Option<MeteringBatch>, StoreError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["record_confirmation"])
            .start_timer();

        let batch = sqlx::query_as::<_, MeteringBatch>(&format!(
            r#"
            UPDATE metering_batches
            SET external_confirmation_id = $2,
                status = 'reported',
                updated_utc = NOW()
            WHERE batch_key = $1
              AND (external_confirmation_id IS NULL OR external_confirmation_id = $2)
            RETURNING {}
            "#,
            BATCH_COLUMNS
        ))
        .bind(batch_key)
        .bind(confirmation_id)
        .fetch_optional(&self.pool)
        .await?;

        timer.observe_duration();

        if batch.is_none() {
            warn!(
                batch_key = %batch_key,
                confirmation_id = %confirmation_id,
                "Batch missing or already confirmed under a different id"
            );
        }

        Ok(batch)
    }

    #[instrument(skip(self))]
    async fn get(&self, batch_key: &str) -> Result<Option<MeteringBatch>, StoreError> {
        let batch = sqlx::query_as::<_, MeteringBatch>(&format!(
            "SELECT {} FROM metering_batches WHERE batch_key = $1",
            BATCH_COLUMNS
        ))
        .bind(batch_key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(batch)
    }

    #[instrument(skip(self))]
    async fn list_for_owner(&self, owner_user_id: Uuid) -> Result<Vec<MeteringBatch>, StoreError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_batches_for_owner"])
            .start_timer();

        let batches = sqlx::query_as::<_, MeteringBatch>(&format!(
            r#"
            SELECT {}
            FROM metering_batches
            WHERE owner_user_id = $1
            ORDER BY created_utc DESC, batch_key
            "#,
            BATCH_COLUMNS
        ))
        .bind(owner_user_id)
        .fetch_all(&self.pool)
        .await?;

        timer.observe_duration();

        Ok(batches)
    }

    #[instrument(skip(self))]
    async fn list_stale_pending(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<MeteringBatch>, StoreError> {
        let batches = sqlx::query_as::<_, MeteringBatch>(&format!(
            r#"
            SELECT {}
            FROM metering_batches
            WHERE status = 'pending'
              AND updated_utc < $1
            ORDER BY updated_utc
            "#,
            BATCH_COLUMNS
        ))
        .bind(older_than)
        .fetch_all(&self.pool)
        .await?;

        Ok(batches)
    }
}
