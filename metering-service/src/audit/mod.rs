//! Batch ledger: durable audit and idempotency records, one per batch.

pub mod in_memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{MeteringBatch, UpsertBatch};

pub use in_memory::InMemoryBatchStore;
pub use postgres::PgBatchStore;

#[async_trait]
pub trait BatchStore: Send + Sync {
    /// Create the record, or refresh it while it is still pending.
    /// Finalized records are returned unchanged.
    async fn upsert(&self, input: &UpsertBatch) -> Result<MeteringBatch, StoreError>;

    /// Store the processor's confirmation id and mark the batch reported.
    /// Repeating with the same id is a no-op.
    async fn record_confirmation(
        &self,
        batch_key: &str,
        confirmation_id: &str,
    ) -> Result<Option<MeteringBatch>, StoreError>;

    async fn get(&self, batch_key: &str) -> Result<Option<MeteringBatch>, StoreError>;

    /// Most recent first.
    async fn list_for_owner(&self, owner_user_id: Uuid) -> Result<Vec<MeteringBatch>, StoreError>;

    /// Pending batches not touched since `older_than`.
    async fn list_stale_pending(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<MeteringBatch>, StoreError>;
}
