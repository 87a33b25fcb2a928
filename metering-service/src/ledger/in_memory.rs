//! In-memory usage ledger for tests and local development.
//!
//! Every operation runs under a single mutex, so each conditional update is
//! atomic per row exactly like its SQL counterpart.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::UsageLedger;
use crate::error::StoreError;
use crate::models::{BatchTally, LedgerSource, NewUsageRow, PeriodBounds, UsageRow};

pub struct InMemoryUsageLedger {
    source: LedgerSource,
    rows: Mutex<HashMap<Uuid, UsageRow>>,
}

impl InMemoryUsageLedger {
    pub fn new(source: LedgerSource) -> Self {
        Self {
            source,
            rows: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<Uuid, UsageRow>>, StoreError> {
        self.rows
            .lock()
            .map_err(|e| StoreError::Unavailable(format!("ledger mutex poisoned: {}", e)))
    }

    /// Insert a usage row the way upstream producers do.
    pub fn record(&self, input: NewUsageRow) -> Result<UsageRow, StoreError> {
        let row = UsageRow {
            id: Uuid::new_v4(),
            owner_user_id: input.owner_user_id,
            billable_amount: input.billable_amount,
            created_at: input.created_at,
            metered: false,
            batch_key: None,
        };
        self.lock()?.insert(row.id, row.clone());
        Ok(row)
    }

    pub fn get(&self, id: Uuid) -> Result<Option<UsageRow>, StoreError> {
        Ok(self.lock()?.get(&id).cloned())
    }

    /// Snapshot of all rows.
    pub fn rows(&self) -> Result<Vec<UsageRow>, StoreError> {
        let mut rows: Vec<UsageRow> = self.lock()?.values().cloned().collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(rows)
    }
}

fn in_period(row: &UsageRow, owner_user_id: Uuid, bounds: &PeriodBounds) -> bool {
    row.owner_user_id == owner_user_id && !row.metered && bounds.contains(row.created_at)
}

#[async_trait]
impl UsageLedger for InMemoryUsageLedger {
    fn source(&self) -> LedgerSource {
        self.source
    }

    async fn owners_with_unmetered(&self) -> Result<Vec<Uuid>, StoreError> {
        let owners: BTreeSet<Uuid> = self
            .lock()?
            .values()
            .filter(|row| !row.metered)
            .map(|row| row.owner_user_id)
            .collect();
        Ok(owners.into_iter().collect())
    }

    async fn pending_batch_keys(
        &self,
        owner_user_id: Uuid,
        bounds: &PeriodBounds,
    ) -> Result<Vec<String>, StoreError> {
        let keys: BTreeSet<String> = self
            .lock()?
            .values()
            .filter(|row| in_period(row, owner_user_id, bounds))
            .filter_map(|row| row.batch_key.clone())
            .collect();
        Ok(keys.into_iter().collect())
    }

    async fn find_unmetered(
        &self,
        owner_user_id: Uuid,
        bounds: &PeriodBounds,
    ) -> Result<Vec<UsageRow>, StoreError> {
        let mut rows: Vec<UsageRow> = self
            .lock()?
            .values()
            .filter(|row| in_period(row, owner_user_id, bounds) && row.batch_key.is_none())
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(rows)
    }

    async fn claim(&self, ids: &[Uuid], batch_key: &str) -> Result<u64, StoreError> {
        let mut rows = self.lock()?;
        let mut claimed = 0;
        for id in ids {
            if let Some(row) = rows.get_mut(id) {
                if row.batch_key.is_none() && !row.metered {
                    row.batch_key = Some(batch_key.to_string());
                    claimed += 1;
                }
            }
        }
        Ok(claimed)
    }

    async fn tally_batch(
        &self,
        owner_user_id: Uuid,
        batch_key: &str,
        bounds: &PeriodBounds,
    ) -> Result<BatchTally, StoreError> {
        Ok(self
            .lock()?
            .values()
            .filter(|row| {
                in_period(row, owner_user_id, bounds) && row.batch_key.as_deref() == Some(batch_key)
            })
            .fold(BatchTally::default(), |tally, row| BatchTally {
                rows: tally.rows + 1,
                total: tally.total + row.billable_amount,
            }))
    }

    async fn mark_metered(&self, batch_key: &str) -> Result<u64, StoreError> {
        let mut rows = self.lock()?;
        let mut marked = 0;
        for row in rows.values_mut() {
            if !row.metered && row.batch_key.as_deref() == Some(batch_key) {
                row.metered = true;
                marked += 1;
            }
        }
        Ok(marked)
    }

    async fn release(&self, batch_key: &str) -> Result<u64, StoreError> {
        let mut rows = self.lock()?;
        let mut released = 0;
        for row in rows.values_mut() {
            if !row.metered && row.batch_key.as_deref() == Some(batch_key) {
                row.batch_key = None;
                released += 1;
            }
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use rust_decimal::Decimal;

    fn bounds() -> PeriodBounds {
        PeriodBounds {
            start: Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2025, 4, 1, 0, 0, 0).unwrap(),
        }
    }

    fn usage(ledger: &InMemoryUsageLedger, owner: Uuid, cents: i64) -> UsageRow {
        ledger
            .record(NewUsageRow {
                owner_user_id: owner,
                billable_amount: Decimal::new(cents, 2),
                created_at: Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).unwrap(),
            })
            .unwrap()
    }

    #[tokio::test]
    async fn claim_only_takes_unreserved_rows() {
        let ledger = InMemoryUsageLedger::new(LedgerSource::Task);
        let owner = Uuid::new_v4();
        let a = usage(&ledger, owner, 50);
        let b = usage(&ledger, owner, 25);

        assert_eq!(ledger.claim(&[a.id], "first").await.unwrap(), 1);
        assert_eq!(ledger.claim(&[a.id, b.id], "second").await.unwrap(), 1);

        assert_eq!(
            ledger.get(a.id).unwrap().unwrap().batch_key.as_deref(),
            Some("first")
        );
        assert_eq!(
            ledger.get(b.id).unwrap().unwrap().batch_key.as_deref(),
            Some("second")
        );
    }

    #[tokio::test]
    async fn mark_metered_keeps_batch_key() {
        let ledger = InMemoryUsageLedger::new(LedgerSource::Step);
        let owner = Uuid::new_v4();
        let row = usage(&ledger, owner, 120);

        ledger.claim(&[row.id], "k").await.unwrap();
        assert_eq!(ledger.mark_metered("k").await.unwrap(), 1);

        let stored = ledger.get(row.id).unwrap().unwrap();
        assert!(stored.metered);
        assert_eq!(stored.batch_key.as_deref(), Some("k"));

        // Metered rows can no longer be released or re-claimed.
        assert_eq!(ledger.release("k").await.unwrap(), 0);
        assert_eq!(ledger.claim(&[row.id], "other").await.unwrap(), 0);
        assert!(ledger.owners_with_unmetered().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn tally_ignores_rows_outside_period() {
        let ledger = InMemoryUsageLedger::new(LedgerSource::Task);
        let owner = Uuid::new_v4();
        let inside = usage(&ledger, owner, 75);
        let outside = ledger
            .record(NewUsageRow {
                owner_user_id: owner,
                billable_amount: Decimal::new(500, 2),
                created_at: Utc.with_ymd_and_hms(2025, 4, 1, 0, 0, 0).unwrap(),
            })
            .unwrap();

        ledger.claim(&[inside.id, outside.id], "k").await.unwrap();
        let tally = ledger.tally_batch(owner, "k", &bounds()).await.unwrap();

        assert_eq!(tally.rows, 1);
        assert_eq!(tally.total, Decimal::new(75, 2));
    }
}
