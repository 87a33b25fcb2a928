//! Postgres adapters. Skipped unless TEST_DATABASE_URL is set.

mod common;

use chrono::{Duration, FixedOffset, Utc};
use common::{at, date, march, mid_period, period_end, subscriber_id, TestDb};
use metering_service::audit::{BatchStore, PgBatchStore};
use metering_service::eligibility::{
    AnchorDayPeriodResolver, BillingPeriodResolver, FixedPeriodResolver, PgSubscriptionGate,
    SubscriptionGate,
};
use metering_service::error::EligibilityError;
use metering_service::ledger::{LedgerSet, PgUsageLedger, UsageLedger};
use metering_service::models::{BatchStatus, LedgerSource, NewUsageRow, UpsertBatch};
use metering_service::reporter::MockMeteringReporter;
use metering_service::rollup::RollupOrchestrator;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use uuid::Uuid;

fn usage(owner: Uuid, amount: Decimal) -> NewUsageRow {
    NewUsageRow {
        owner_user_id: owner,
        billable_amount: amount,
        created_at: at(10, 9),
    }
}

fn utc() -> FixedOffset {
    FixedOffset::east_opt(0).unwrap()
}

#[tokio::test]
async fn guarded_claim_only_takes_unreserved_rows() {
    let Some(test_db) = TestDb::connect().await else {
        return;
    };
    let ledger = PgUsageLedger::new(test_db.pool(), LedgerSource::Task);
    let owner = Uuid::new_v4();
    let a = ledger.record(&usage(owner, dec!(0.5))).await.unwrap();
    let b = ledger.record(&usage(owner, dec!(0.7))).await.unwrap();
    let bounds = march().bounds(utc());

    assert_eq!(ledger.claim(&[a.id], "first").await.unwrap(), 1);
    assert_eq!(ledger.claim(&[a.id, b.id], "second").await.unwrap(), 1);
    assert_eq!(ledger.claim(&[a.id, b.id], "third").await.unwrap(), 0);

    assert_eq!(
        ledger.get(a.id).await.unwrap().unwrap().batch_key.as_deref(),
        Some("first")
    );
    assert_eq!(
        ledger.pending_batch_keys(owner, &bounds).await.unwrap(),
        vec!["first".to_string(), "second".to_string()]
    );
    assert!(ledger.find_unmetered(owner, &bounds).await.unwrap().is_empty());

    let tally = ledger.tally_batch(owner, "second", &bounds).await.unwrap();
    assert_eq!(tally.rows, 1);
    assert_eq!(tally.total, dec!(0.7));

    assert_eq!(ledger.mark_metered("first").await.unwrap(), 1);
    let marked = ledger.get(a.id).await.unwrap().unwrap();
    assert!(marked.metered);
    assert_eq!(marked.batch_key.as_deref(), Some("first"));

    // Metered rows keep their key; only the open reservation is released
    assert_eq!(ledger.release("first").await.unwrap(), 0);
    assert_eq!(ledger.release("second").await.unwrap(), 1);
    assert!(ledger.get(b.id).await.unwrap().unwrap().batch_key.is_none());

    test_db.cleanup().await;
}

#[tokio::test]
async fn finalized_batches_are_not_overwritten() {
    let Some(test_db) = TestDb::connect().await else {
        return;
    };
    let store = PgBatchStore::new(test_db.pool());
    let owner = Uuid::new_v4();
    let mut input = UpsertBatch {
        batch_key: "batch-a".to_string(),
        owner_user_id: owner,
        period: march(),
        total_billable_amount: dec!(2.6),
        rounded_quantity: 3,
        status: BatchStatus::Pending,
    };

    let created = store.upsert(&input).await.unwrap();
    assert_eq!(created.status(), BatchStatus::Pending);
    assert_eq!(created.idempotency_key, input.idempotency_key());

    input.total_billable_amount = dec!(2.7);
    let refreshed = store.upsert(&input).await.unwrap();
    assert_eq!(refreshed.total_billable_amount, dec!(2.7));

    let reported = store
        .record_confirmation("batch-a", "mev_1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reported.status(), BatchStatus::Reported);

    // Same confirmation again is a no-op, a different one is refused
    assert!(store
        .record_confirmation("batch-a", "mev_1")
        .await
        .unwrap()
        .is_some());
    assert!(store
        .record_confirmation("batch-a", "mev_other")
        .await
        .unwrap()
        .is_none());

    input.total_billable_amount = dec!(9.9);
    input.rounded_quantity = 10;
    let unchanged = store.upsert(&input).await.unwrap();
    assert_eq!(unchanged.total_billable_amount, dec!(2.7));
    assert_eq!(unchanged.rounded_quantity, 3);
    assert_eq!(unchanged.external_confirmation_id.as_deref(), Some("mev_1"));

    assert_eq!(store.list_for_owner(owner).await.unwrap().len(), 1);
    assert!(store
        .list_stale_pending(Utc::now() + Duration::hours(1))
        .await
        .unwrap()
        .is_empty());

    test_db.cleanup().await;
}

#[tokio::test]
async fn subscription_projection_drives_eligibility() {
    let Some(test_db) = TestDb::connect().await else {
        return;
    };
    let gate = PgSubscriptionGate::new(test_db.pool());
    let resolver = AnchorDayPeriodResolver::new(test_db.pool());

    let active = Uuid::new_v4();
    let past_due = Uuid::new_v4();
    let unknown = Uuid::new_v4();
    test_db.subscribe(active, "active", 15).await;
    test_db.subscribe(past_due, "past_due", 1).await;

    let subscription = gate.active_subscription(active).await.unwrap().unwrap();
    assert_eq!(subscription.subscriber_id, subscriber_id(active));
    assert!(gate.active_subscription(past_due).await.unwrap().is_none());
    assert!(gate.active_subscription(unknown).await.unwrap().is_none());

    let period = resolver
        .current_period(active, date(2025, 3, 20))
        .await
        .unwrap();
    assert_eq!(period.start_date, date(2025, 3, 15));
    assert_eq!(period.end_date, date(2025, 4, 14));

    assert!(matches!(
        resolver.current_period(unknown, date(2025, 3, 20)).await,
        Err(EligibilityError::MissingAnchor(id)) if id == unknown
    ));

    test_db.cleanup().await;
}

#[tokio::test]
async fn rollup_runs_end_to_end_on_postgres() {
    let Some(test_db) = TestDb::connect().await else {
        return;
    };
    let pool = test_db.pool();
    let task = Arc::new(PgUsageLedger::new(pool.clone(), LedgerSource::Task));
    let step = Arc::new(PgUsageLedger::new(pool.clone(), LedgerSource::Step));
    let batches = Arc::new(PgBatchStore::new(pool.clone()));
    let reporter = Arc::new(MockMeteringReporter::new());

    let owner = Uuid::new_v4();
    let small = Uuid::new_v4();
    test_db.subscribe(owner, "active", 1).await;
    test_db.subscribe(small, "active", 1).await;

    task.record(&usage(owner, dec!(0.6))).await.unwrap();
    task.record(&usage(owner, dec!(0.3))).await.unwrap();
    step.record(&usage(owner, dec!(1.7))).await.unwrap();
    let tiny = step.record(&usage(small, dec!(0.2))).await.unwrap();

    let orchestrator = RollupOrchestrator::new(
        LedgerSet::new(vec![
            task.clone() as Arc<dyn UsageLedger>,
            step.clone() as Arc<dyn UsageLedger>,
        ]),
        batches.clone(),
        reporter.clone(),
        Arc::new(PgSubscriptionGate::new(pool.clone())),
        Arc::new(FixedPeriodResolver::new(march())),
    );

    let summary = orchestrator.run_pass_at(mid_period()).await.unwrap();
    assert_eq!(summary.attempted, 2);
    assert_eq!(summary.reported, 1);
    assert_eq!(summary.released, 1);

    assert_eq!(reporter.total_charged(&subscriber_id(owner)), 3);
    let reported = batches.list_for_owner(owner).await.unwrap();
    assert_eq!(reported.len(), 1);
    assert_eq!(reported[0].status(), BatchStatus::Reported);
    assert_eq!(reported[0].total_billable_amount, dec!(2.6));

    let tiny_row = step.get(tiny.id).await.unwrap().unwrap();
    assert!(!tiny_row.metered);
    assert!(tiny_row.batch_key.is_none());

    // Period close writes the remainder off
    let summary = orchestrator.run_pass_at(period_end()).await.unwrap();
    assert_eq!(summary.written_off, 1);
    assert!(step.get(tiny.id).await.unwrap().unwrap().metered);
    assert_eq!(reporter.charges().len(), 1);

    let summary = orchestrator.run_pass_at(period_end()).await.unwrap();
    assert_eq!(summary.attempted, 0);

    test_db.cleanup().await;
}
