//! Concurrent claimers and overlapping passes must never double count.

mod common;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use common::{date, march, mid_period, subscriber_id, Harness};
use futures::future::join_all;
use metering_service::audit::{BatchStore, InMemoryBatchStore};
use metering_service::error::StoreError;
use metering_service::ledger::{InMemoryUsageLedger, UsageLedger};
use metering_service::models::{
    ActiveSubscription, BatchStatus, LedgerSource, MeteringBatch, UpsertBatch,
};
use metering_service::reporter::{MeteringReporter, UsageReport};
use metering_service::rollup::{Aggregator, UserOutcome};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Barrier;
use uuid::Uuid;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_claims_partition_the_candidate_rows() {
    let ledger = Arc::new(InMemoryUsageLedger::new(LedgerSource::Task));
    let owner = Uuid::new_v4();
    for _ in 0..200 {
        common::record(&ledger, owner, dec!(0.01), common::at(10, 9));
    }

    let bounds = march().bounds(chrono::FixedOffset::east_opt(0).unwrap());
    let claimers = 8;
    let barrier = Arc::new(Barrier::new(claimers));

    let handles = (0..claimers).map(|i| {
        let ledger = ledger.clone();
        let barrier = barrier.clone();
        tokio::spawn(async move {
            // Everyone sees the full candidate set before anyone claims
            let ids: Vec<Uuid> = ledger
                .find_unmetered(owner, &bounds)
                .await
                .unwrap()
                .into_iter()
                .map(|r| r.id)
                .collect();
            assert_eq!(ids.len(), 200);
            barrier.wait().await;

            let key = format!("batch-{}", i);
            let claimed = ledger.claim(&ids, &key).await.unwrap();
            (key, claimed)
        })
    });

    let results: Vec<(String, u64)> = join_all(handles)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    let total_claimed: u64 = results.iter().map(|(_, n)| n).sum();
    assert_eq!(total_claimed, 200);

    let rows = ledger.rows().unwrap();
    let mut per_key: HashMap<String, u64> = HashMap::new();
    for row in &rows {
        *per_key.entry(row.batch_key.clone().unwrap()).or_default() += 1;
    }
    for (key, claimed) in &results {
        assert_eq!(per_key.get(key).copied().unwrap_or(0), *claimed);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn overlapping_passes_bill_every_row_exactly_once() {
    let h = Harness::new();
    let mut expected: HashMap<Uuid, Decimal> = HashMap::new();
    for _ in 0..20 {
        let owner = h.subscriber();
        h.record_task(owner, dec!(1.2));
        h.record_step(owner, dec!(0.9));
        expected.insert(owner, dec!(2.1));
    }

    let orchestrators: Vec<_> = (0..5).map(|_| Arc::new(h.orchestrator())).collect();
    let passes = orchestrators.iter().map(|o| {
        let o = o.clone();
        tokio::spawn(async move { o.run_pass_at(mid_period()).await })
    });
    for result in join_all(passes).await {
        result.unwrap().unwrap();
    }

    // Anything a racing pass left half-done is finished by a quiet pass
    h.orchestrator().run_pass_at(mid_period()).await.unwrap();

    let mut reported_batches = 0;
    for (owner, total) in &expected {
        let rows = h.rows_of(*owner);
        assert!(rows.iter().all(|r| r.metered && r.batch_key.is_some()));

        let batches: Vec<_> = h
            .batches
            .list_for_owner(*owner)
            .await
            .unwrap()
            .into_iter()
            .filter(|b| b.status() == BatchStatus::Reported)
            .collect();

        let batched: Decimal = batches.iter().map(|b| b.total_billable_amount).sum();
        assert_eq!(batched, *total, "owner {} billed a different total", owner);

        let row_keys: HashSet<_> = rows.iter().filter_map(|r| r.batch_key.clone()).collect();
        let batch_keys: HashSet<_> = batches.iter().map(|b| b.batch_key.clone()).collect();
        assert_eq!(row_keys, batch_keys);

        reported_batches += batches.len();
    }

    // One charge per idempotency key
    let charges = h.reporter.charges();
    let keys: HashSet<_> = charges.iter().map(|c| c.idempotency_key.clone()).collect();
    assert_eq!(keys.len(), charges.len());

    assert_eq!(charges.len(), reported_batches);
}

/// Answers the first `get` as it looked before another worker recorded the
/// batch, then reads through.
struct LaggingBatchStore {
    inner: Arc<InMemoryBatchStore>,
    lagged: AtomicBool,
}

#[async_trait]
impl BatchStore for LaggingBatchStore {
    async fn upsert(&self, input: &UpsertBatch) -> Result<MeteringBatch, StoreError> {
        self.inner.upsert(input).await
    }

    async fn record_confirmation(
        &self,
        batch_key: &str,
        confirmation_id: &str,
    ) -> Result<Option<MeteringBatch>, StoreError> {
        self.inner.record_confirmation(batch_key, confirmation_id).await
    }

    async fn get(&self, batch_key: &str) -> Result<Option<MeteringBatch>, StoreError> {
        if !self.lagged.swap(true, Ordering::SeqCst) {
            return Ok(None);
        }
        self.inner.get(batch_key).await
    }

    async fn list_for_owner(&self, owner_user_id: Uuid) -> Result<Vec<MeteringBatch>, StoreError> {
        self.inner.list_for_owner(owner_user_id).await
    }

    async fn list_stale_pending(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<MeteringBatch>, StoreError> {
        self.inner.list_stale_pending(older_than).await
    }
}

#[tokio::test]
async fn resumed_batch_reported_elsewhere_is_completed_not_released() {
    let h = Harness::new();
    let owner = h.subscriber();
    let task_row = h.record_task(owner, dec!(2.6));
    let step_row = h.record_step(owner, dec!(0.3));

    let batch_key = "batch-k";
    h.task.claim(&[task_row.id], batch_key).await.unwrap();
    h.step.claim(&[step_row.id], batch_key).await.unwrap();

    // Worker A: recorded, reported and confirmed, but only the task ledger
    // has been marked so far.
    let stored = h
        .batches
        .upsert(&UpsertBatch {
            batch_key: batch_key.to_string(),
            owner_user_id: owner,
            period: march(),
            total_billable_amount: dec!(2.9),
            rounded_quantity: 3,
            status: BatchStatus::Pending,
        })
        .await
        .unwrap();
    let confirmation = h
        .reporter
        .report_usage(&UsageReport {
            subscriber_id: subscriber_id(owner),
            quantity: 3,
            idempotency_key: stored.idempotency_key.clone(),
        })
        .await
        .unwrap();
    h.batches
        .record_confirmation(batch_key, &confirmation.id)
        .await
        .unwrap();
    h.task.mark_metered(batch_key).await.unwrap();

    // Worker B resumes the same key with a read taken before A recorded it,
    // so it only tallies the unmarked 0.3.
    let lagging = Arc::new(LaggingBatchStore {
        inner: h.batches.clone(),
        lagged: AtomicBool::new(false),
    });
    let aggregator = Aggregator::new(h.ledgers(), lagging, h.reporter.clone());
    let subscription = ActiveSubscription {
        owner_user_id: owner,
        subscriber_id: subscriber_id(owner),
    };
    let bounds = march().bounds(FixedOffset::east_opt(0).unwrap());

    let outcome = aggregator
        .settle(&subscription, &march(), &bounds, date(2025, 3, 15), batch_key)
        .await
        .unwrap();
    assert_eq!(
        outcome,
        UserOutcome::Reported {
            batch_key: batch_key.to_string(),
            quantity: 3,
            confirmation_id: confirmation.id.clone(),
        }
    );

    let step_row = h.step.get(step_row.id).unwrap().unwrap();
    assert!(step_row.metered);
    assert_eq!(step_row.batch_key.as_deref(), Some(batch_key));

    // Worker A finishing late is harmless
    h.step.mark_metered(batch_key).await.unwrap();

    // New usage alone stays below one unit and is never billed with the old rows
    h.record_step(owner, dec!(0.3));
    let summary = h.orchestrator().run_pass_at(mid_period()).await.unwrap();
    assert_eq!(summary.released, 1);

    let charges = h.reporter.charges();
    assert_eq!(charges.len(), 1);
    assert_eq!(charges[0].quantity, 3);
}
