//! Usage ledger abstraction.
//!
//! Agent usage is written to two physical tables by different producers
//! (task-level and step-level). The rollup engine treats them as one logical
//! ledger: each table gets a [`UsageLedger`] adapter and [`LedgerSet`] fans
//! every operation out over all of them.
//!
//! Every mutation is a conditional bulk update scoped by row ids or by
//! `batch_key`. Adapters never lock rows and never write back state they read
//! earlier; `claim` must only touch rows whose `batch_key` is still NULL.

pub mod in_memory;
pub mod postgres;

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{BatchTally, LedgerSource, PeriodBounds, UsageRow};

pub use in_memory::InMemoryUsageLedger;
pub use postgres::PgUsageLedger;

#[async_trait]
pub trait UsageLedger: Send + Sync {
    fn source(&self) -> LedgerSource;

    /// Distinct owners with at least one unmetered row.
    async fn owners_with_unmetered(&self) -> Result<Vec<Uuid>, StoreError>;

    /// Distinct batch keys on unmetered, reserved rows of `owner` in `bounds`.
    async fn pending_batch_keys(
        &self,
        owner_user_id: Uuid,
        bounds: &PeriodBounds,
    ) -> Result<Vec<String>, StoreError>;

    /// Unmetered, unreserved rows of `owner` in `bounds`.
    async fn find_unmetered(
        &self,
        owner_user_id: Uuid,
        bounds: &PeriodBounds,
    ) -> Result<Vec<UsageRow>, StoreError>;

    /// Set `batch_key` on the given rows where it is still NULL.
    /// Returns how many rows this call actually claimed.
    async fn claim(&self, ids: &[Uuid], batch_key: &str) -> Result<u64, StoreError>;

    /// Sum of unmetered rows of `owner` in `bounds` carrying `batch_key`.
    async fn tally_batch(
        &self,
        owner_user_id: Uuid,
        batch_key: &str,
        bounds: &PeriodBounds,
    ) -> Result<BatchTally, StoreError>;

    /// Mark every row carrying `batch_key` as metered. The key is kept.
    async fn mark_metered(&self, batch_key: &str) -> Result<u64, StoreError>;

    /// Clear `batch_key` on unmetered rows carrying it.
    async fn release(&self, batch_key: &str) -> Result<u64, StoreError>;
}

/// All usage ledgers, addressed as one.
#[derive(Clone)]
pub struct LedgerSet {
    ledgers: Vec<Arc<dyn UsageLedger>>,
}

impl LedgerSet {
    pub fn new(ledgers: Vec<Arc<dyn UsageLedger>>) -> Self {
        Self { ledgers }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn UsageLedger>> {
        self.ledgers.iter()
    }

    pub fn len(&self) -> usize {
        self.ledgers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ledgers.is_empty()
    }

    /// Union of owners with unmetered usage, in stable order.
    pub async fn owners_with_unmetered(&self) -> Result<Vec<Uuid>, StoreError> {
        let mut owners = BTreeSet::new();
        for ledger in &self.ledgers {
            owners.extend(ledger.owners_with_unmetered().await?);
        }
        Ok(owners.into_iter().collect())
    }

    /// Union of pending batch keys, sorted lexicographically.
    pub async fn pending_batch_keys(
        &self,
        owner_user_id: Uuid,
        bounds: &PeriodBounds,
    ) -> Result<Vec<String>, StoreError> {
        let mut keys = BTreeSet::new();
        for ledger in &self.ledgers {
            keys.extend(ledger.pending_batch_keys(owner_user_id, bounds).await?);
        }
        Ok(keys.into_iter().collect())
    }

    pub async fn tally_batch(
        &self,
        owner_user_id: Uuid,
        batch_key: &str,
        bounds: &PeriodBounds,
    ) -> Result<BatchTally, StoreError> {
        let mut tally = BatchTally::default();
        for ledger in &self.ledgers {
            tally = tally + ledger.tally_batch(owner_user_id, batch_key, bounds).await?;
        }
        Ok(tally)
    }

    pub async fn mark_metered(&self, batch_key: &str) -> Result<u64, StoreError> {
        let mut marked = 0;
        for ledger in &self.ledgers {
            marked += ledger.mark_metered(batch_key).await?;
        }
        Ok(marked)
    }

    pub async fn release(&self, batch_key: &str) -> Result<u64, StoreError> {
        let mut released = 0;
        for ledger in &self.ledgers {
            released += ledger.release(batch_key).await?;
        }
        Ok(released)
    }
}
