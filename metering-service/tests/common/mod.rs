//! Test helper module for metering-service integration tests.
//!
//! The in-memory harness wires the rollup engine against in-process stores.
//! The Postgres harness isolates each test in its own schema and is only
//! available when TEST_DATABASE_URL is set.

#![allow(dead_code)]

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use metering_service::audit::{BatchStore, InMemoryBatchStore};
use metering_service::eligibility::{FixedPeriodResolver, StaticSubscriptionGate};
use metering_service::ledger::{InMemoryUsageLedger, LedgerSet, UsageLedger};
use metering_service::models::{BillingPeriod, LedgerSource, NewUsageRow, UsageRow};
use metering_service::reporter::MockMeteringReporter;
use metering_service::rollup::RollupOrchestrator;
use metering_service::services::Database;
use rust_decimal::Decimal;
use sqlx::PgPool;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use uuid::Uuid;

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

/// March 2025, inclusive.
pub fn march() -> BillingPeriod {
    BillingPeriod::new(date(2025, 3, 1), date(2025, 3, 31))
}

pub fn at(day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, day, hour, 0, 0).unwrap()
}

/// A pass while March is still open.
pub fn mid_period() -> DateTime<Utc> {
    at(15, 12)
}

/// A pass on March's last day, when the period counts as closed.
pub fn period_end() -> DateTime<Utc> {
    at(31, 12)
}

pub fn subscriber_id(owner: Uuid) -> String {
    format!("cus_{}", owner.simple())
}

pub struct Harness {
    pub task: Arc<InMemoryUsageLedger>,
    pub step: Arc<InMemoryUsageLedger>,
    pub batches: Arc<InMemoryBatchStore>,
    pub reporter: Arc<MockMeteringReporter>,
    pub gate: Arc<StaticSubscriptionGate>,
    pub resolver: Arc<FixedPeriodResolver>,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            task: Arc::new(InMemoryUsageLedger::new(LedgerSource::Task)),
            step: Arc::new(InMemoryUsageLedger::new(LedgerSource::Step)),
            batches: Arc::new(InMemoryBatchStore::new()),
            reporter: Arc::new(MockMeteringReporter::new()),
            gate: Arc::new(StaticSubscriptionGate::new()),
            resolver: Arc::new(FixedPeriodResolver::new(march())),
        }
    }

    pub fn ledgers(&self) -> LedgerSet {
        LedgerSet::new(vec![
            self.task.clone() as Arc<dyn UsageLedger>,
            self.step.clone() as Arc<dyn UsageLedger>,
        ])
    }

    pub fn orchestrator(&self) -> RollupOrchestrator {
        self.orchestrator_with(self.ledgers())
    }

    /// An orchestrator sharing this harness' stores but reading through
    /// the given ledgers.
    pub fn orchestrator_with(&self, ledgers: LedgerSet) -> RollupOrchestrator {
        RollupOrchestrator::new(
            ledgers,
            self.batches.clone() as Arc<dyn BatchStore>,
            self.reporter.clone(),
            self.gate.clone(),
            self.resolver.clone(),
        )
    }

    /// Register a paying owner and return their id.
    pub fn subscriber(&self) -> Uuid {
        let owner = Uuid::new_v4();
        self.gate.subscribe(owner, subscriber_id(owner));
        owner
    }

    pub fn record_task(&self, owner: Uuid, amount: Decimal) -> UsageRow {
        record(&self.task, owner, amount, at(10, 9))
    }

    pub fn record_step(&self, owner: Uuid, amount: Decimal) -> UsageRow {
        record(&self.step, owner, amount, at(10, 9))
    }

    /// Every row in both ledgers belonging to `owner`.
    pub fn rows_of(&self, owner: Uuid) -> Vec<UsageRow> {
        self.task
            .rows()
            .unwrap()
            .into_iter()
            .chain(self.step.rows().unwrap())
            .filter(|r| r.owner_user_id == owner)
            .collect()
    }
}

pub fn record(
    ledger: &InMemoryUsageLedger,
    owner: Uuid,
    amount: Decimal,
    created_at: DateTime<Utc>,
) -> UsageRow {
    ledger
        .record(NewUsageRow {
            owner_user_id: owner,
            billable_amount: amount,
            created_at,
        })
        .unwrap()
}

// Counter for unique schema names
static SCHEMA_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Database URL for Postgres-backed tests, if configured.
pub fn test_database_url() -> Option<String> {
    std::env::var("TEST_DATABASE_URL")
        .ok()
        .filter(|url| !url.is_empty())
}

fn unique_schema_name() -> String {
    let counter = SCHEMA_COUNTER.fetch_add(1, Ordering::SeqCst);
    format!("test_metering_{}_{}", std::process::id(), counter)
}

/// A migrated, schema-isolated database.
pub struct TestDb {
    pub db: Database,
    pub url: String,
    base_url: String,
    schema_name: String,
}

impl TestDb {
    /// `None` when TEST_DATABASE_URL is unset; callers skip the test.
    pub async fn connect() -> Option<Self> {
        let Some(base_url) = test_database_url() else {
            eprintln!("TEST_DATABASE_URL not set - skipping Postgres test");
            return None;
        };
        let schema_name = unique_schema_name();

        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(1)
            .connect(&base_url)
            .await
            .expect("Failed to connect to test database");

        sqlx::query(&format!("DROP SCHEMA IF EXISTS {} CASCADE", schema_name))
            .execute(&pool)
            .await
            .ok();
        sqlx::query(&format!("CREATE SCHEMA {}", schema_name))
            .execute(&pool)
            .await
            .expect("Failed to create test schema");
        pool.close().await;

        let separator = if base_url.contains('?') { "&" } else { "?" };
        let url = format!(
            "{}{}options=-c search_path%3D{}",
            base_url, separator, schema_name
        );

        let db = Database::new(&url, 5, 1)
            .await
            .expect("Failed to create test database");
        db.run_migrations().await.expect("Failed to run migrations");

        Some(Self {
            db,
            url,
            base_url,
            schema_name,
        })
    }

    pub fn pool(&self) -> PgPool {
        self.db.pool().clone()
    }

    pub async fn subscribe(&self, owner: Uuid, status: &str, anchor_day: i32) {
        sqlx::query(
            r#"
            INSERT INTO owner_subscriptions (owner_user_id, external_customer_id, status, billing_anchor_day)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(owner)
        .bind(subscriber_id(owner))
        .bind(status)
        .bind(anchor_day)
        .execute(self.db.pool())
        .await
        .expect("Failed to insert subscription");
    }

    pub async fn cleanup(&self) {
        self.db.pool().close().await;

        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(1)
            .connect(&self.base_url)
            .await
            .ok();

        if let Some(pool) = pool {
            let _ = sqlx::query(&format!(
                "DROP SCHEMA IF EXISTS {} CASCADE",
                self.schema_name
            ))
            .execute(&pool)
            .await;
            pool.close().await;
        }
    }
}
