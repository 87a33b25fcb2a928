//! In-memory batch store for tests and local development.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::BatchStore;
use crate::error::StoreError;
use crate::models::{BatchStatus, MeteringBatch, UpsertBatch};

#[derive(Default)]
pub struct InMemoryBatchStore {
    batches: Mutex<HashMap<String, MeteringBatch>>,
}

impl InMemoryBatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, MeteringBatch>>, StoreError> {
        self.batches
            .lock()
            .map_err(|e| StoreError::Unavailable(format!("batch store mutex poisoned: {}", e)))
    }

    pub fn all(&self) -> Result<Vec<MeteringBatch>, StoreError> {
        let mut batches: Vec<MeteringBatch> = self.lock()?.values().cloned().collect();
        batches.sort_by(|a, b| a.created_utc.cmp(&b.created_utc).then(a.batch_key.cmp(&b.batch_key)));
        Ok(batches)
    }

    /// Backdate a record, to exercise stale-batch detection.
    pub fn set_updated_utc(&self, batch_key: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        if let Some(batch) = self.lock()?.get_mut(batch_key) {
            batch.updated_utc = at;
        }
        Ok(())
    }
}

#[async_trait]
impl BatchStore for InMemoryBatchStore {
    async fn upsert(&self, input: &UpsertBatch) -> Result<MeteringBatch, StoreError> {
        let now = Utc::now();
        let mut batches = self.lock()?;

        let batch = batches
            .entry(input.batch_key.clone())
            .or_insert_with(|| MeteringBatch {
                batch_key: input.batch_key.clone(),
                owner_user_id: input.owner_user_id,
                idempotency_key: input.idempotency_key(),
                period_start: input.period.start_date,
                period_end: input.period.end_date,
                total_billable_amount: input.total_billable_amount,
                rounded_quantity: input.rounded_quantity,
                external_confirmation_id: None,
                status: input.status.as_str().to_string(),
                created_utc: now,
                updated_utc: now,
            });

        if !batch.is_finalized() {
            batch.period_start = input.period.start_date;
            batch.period_end = input.period.end_date;
            batch.total_billable_amount = input.total_billable_amount;
            batch.rounded_quantity = input.rounded_quantity;
            batch.status = input.status.as_str().to_string();
            batch.updated_utc = now;
        }

        Ok(batch.clone())
    }

    async fn record_confirmation(
        &self,
        batch_key: &str,
        confirmation_id: &str,
    ) -> Result<Option<MeteringBatch>, StoreError> {
        let mut batches = self.lock()?;
        let Some(batch) = batches.get_mut(batch_key) else {
            return Ok(None);
        };

        match batch.external_confirmation_id.as_deref() {
            Some(existing) if existing != confirmation_id => Ok(None),
            _ => {
                batch.external_confirmation_id = Some(confirmation_id.to_string());
                batch.status = BatchStatus::Reported.as_str().to_string();
                batch.updated_utc = Utc::now();
                Ok(Some(batch.clone()))
            }
        }
    }

    async fn get(&self, batch_key: &str) -> Result<Option<MeteringBatch>, StoreError> {
        Ok(self.lock()?.get(batch_key).cloned())
    }

    async fn list_for_owner(&self, owner_user_id: Uuid) -> Result<Vec<MeteringBatch>, StoreError> {
        let mut batches: Vec<MeteringBatch> = self
            .lock()?
            .values()
            .filter(|b| b.owner_user_id == owner_user_id)
            .cloned()
            .collect();
        batches.sort_by(|a, b| b.created_utc.cmp(&a.created_utc).then(a.batch_key.cmp(&b.batch_key)));
        Ok(batches)
    }

    async fn list_stale_pending(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<MeteringBatch>, StoreError> {
        let mut batches: Vec<MeteringBatch> = self
            .lock()?
            .values()
            .filter(|b| b.status() == BatchStatus::Pending && b.updated_utc < older_than)
            .cloned()
            .collect();
        batches.sort_by_key(|b| b.updated_utc);
        Ok(batches)
    }
}
