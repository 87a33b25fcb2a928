//! Race-free reservation of usage rows into a batch.
//!
//! Correctness rests on the ledgers' guarded claim (`batch_key IS NULL`):
//! concurrent reservers may select the same candidates, but each row ends up
//! under exactly one key. No row or advisory locks are taken.

use tracing::{debug, info};
use uuid::Uuid;

use crate::error::StoreError;
use crate::ledger::LedgerSet;
use crate::models::{new_batch_key, PeriodBounds};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservedBatch {
    pub batch_key: String,
    /// True when an earlier, unfinished batch was picked up again.
    pub resumed: bool,
    /// Rows claimed by this call. Zero for a resumed batch.
    pub claimed_rows: u64,
}

#[derive(Clone)]
pub struct BatchReservationManager {
    ledgers: LedgerSet,
}

impl BatchReservationManager {
    pub fn new(ledgers: LedgerSet) -> Self {
        Self { ledgers }
    }

    /// Resolve the batch to work on for `owner_user_id` within `bounds`.
    ///
    /// A pending batch (reserved rows that are still unmetered) always wins,
    /// smallest key first, so a failed report is retried under the same key.
    /// Otherwise unreserved rows are claimed under a fresh key. `None` means
    /// there is nothing to bill for this owner right now.
    pub async fn reserve(
        &self,
        owner_user_id: Uuid,
        bounds: &PeriodBounds,
    ) -> Result<Option<ReservedBatch>, StoreError> {
        let pending = self
            .ledgers
            .pending_batch_keys(owner_user_id, bounds)
            .await?;

        if let Some(batch_key) = pending.into_iter().next() {
            debug!(
                owner_user_id = %owner_user_id,
                batch_key = %batch_key,
                "Resuming pending batch"
            );
            return Ok(Some(ReservedBatch {
                batch_key,
                resumed: true,
                claimed_rows: 0,
            }));
        }

        let mut candidates = Vec::with_capacity(self.ledgers.len());
        for ledger in self.ledgers.iter() {
            let ids: Vec<Uuid> = ledger
                .find_unmetered(owner_user_id, bounds)
                .await?
                .into_iter()
                .map(|row| row.id)
                .collect();
            if !ids.is_empty() {
                candidates.push((ledger, ids));
            }
        }

        if candidates.is_empty() {
            return Ok(None);
        }

        let batch_key = new_batch_key();
        let mut claimed_rows = 0;
        let mut candidate_rows = 0;
        for (ledger, ids) in &candidates {
            candidate_rows += ids.len();
            claimed_rows += ledger.claim(ids, &batch_key).await?;
        }

        if claimed_rows == 0 {
            info!(
                owner_user_id = %owner_user_id,
                candidate_rows,
                "Every candidate row was claimed by a concurrent pass"
            );
            return Ok(None);
        }

        debug!(
            owner_user_id = %owner_user_id,
            batch_key = %batch_key,
            claimed_rows,
            candidate_rows,
            "Reserved new batch"
        );

        Ok(Some(ReservedBatch {
            batch_key,
            resumed: false,
            claimed_rows,
        }))
    }
}
