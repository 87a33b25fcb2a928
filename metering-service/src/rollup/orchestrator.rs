//! Rollup pass driver.
//!
//! Stateless between passes: everything it needs lives in the ledgers and
//! the batch store, so any number of processes may run passes at once.

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Offset, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::{Aggregator, BatchReservationManager, UserOutcome};
use crate::audit::BatchStore;
use crate::eligibility::{BillingPeriodResolver, SubscriptionGate};
use crate::error::RollupError;
use crate::ledger::LedgerSet;
use crate::reporter::MeteringReporter;
use crate::services::metrics;

/// Counts for one pass. `attempted` is the number of eligible owners a
/// rollup was attempted for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RollupSummary {
    pub attempted: usize,
    pub reported: usize,
    pub written_off: usize,
    pub released: usize,
    pub idle: usize,
    pub skipped_free: usize,
    pub failed: usize,
}

impl RollupSummary {
    fn record(&mut self, outcome: &UserOutcome) {
        match outcome {
            UserOutcome::Reported { .. } => self.reported += 1,
            UserOutcome::WrittenOff { .. } => self.written_off += 1,
            UserOutcome::Released { .. } => self.released += 1,
            UserOutcome::NothingToDo => self.idle += 1,
            UserOutcome::NotSubscribed => self.skipped_free += 1,
        }
    }
}

pub struct RollupOrchestrator {
    ledgers: LedgerSet,
    batches: Arc<dyn BatchStore>,
    gate: Arc<dyn SubscriptionGate>,
    resolver: Arc<dyn BillingPeriodResolver>,
    reservations: BatchReservationManager,
    aggregator: Aggregator,
    billing_tz: FixedOffset,
    stale_after: Duration,
}

impl RollupOrchestrator {
    pub fn new(
        ledgers: LedgerSet,
        batches: Arc<dyn BatchStore>,
        reporter: Arc<dyn MeteringReporter>,
        gate: Arc<dyn SubscriptionGate>,
        resolver: Arc<dyn BillingPeriodResolver>,
    ) -> Self {
        Self {
            reservations: BatchReservationManager::new(ledgers.clone()),
            aggregator: Aggregator::new(ledgers.clone(), batches.clone(), reporter),
            ledgers,
            batches,
            gate,
            resolver,
            billing_tz: Utc.fix(),
            stale_after: Duration::hours(1),
        }
    }

    pub fn with_billing_tz(mut self, billing_tz: FixedOffset) -> Self {
        self.billing_tz = billing_tz;
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub async fn run_pass(&self) -> Result<RollupSummary, RollupError> {
        self.run_pass_at(Utc::now()).await
    }

    /// Run one pass as if the clock read `now`.
    ///
    /// Per-owner failures are logged and counted; only failing to list
    /// candidate owners aborts the pass.
    pub async fn run_pass_at(&self, now: DateTime<Utc>) -> Result<RollupSummary, RollupError> {
        let owners = match self.ledgers.owners_with_unmetered().await {
            Ok(owners) => owners,
            Err(e) => {
                error!(error = %e, "Failed to list rollup candidates");
                metrics::record_rollup_pass("aborted");
                metrics::record_error("store", "list_candidates");
                return Err(e.into());
            }
        };

        let today = self.billing_date(now);
        let mut summary = RollupSummary::default();

        for owner_user_id in owners {
            match self.roll_up_owner(owner_user_id, today, &mut summary).await {
                Ok(outcome) => {
                    metrics::record_user_outcome(outcome.label());
                    summary.record(&outcome);
                }
                Err(e) => {
                    error!(
                        owner_user_id = %owner_user_id,
                        error = %e,
                        "Rollup failed for owner"
                    );
                    metrics::record_user_outcome("failed");
                    metrics::record_error(error_kind(&e), "roll_up_owner");
                    summary.failed += 1;
                }
            }
        }

        self.warn_stale_batches(now).await;

        metrics::record_rollup_pass("completed");
        info!(
            attempted = summary.attempted,
            reported = summary.reported,
            written_off = summary.written_off,
            released = summary.released,
            idle = summary.idle,
            skipped_free = summary.skipped_free,
            failed = summary.failed,
            "Rollup pass completed"
        );

        Ok(summary)
    }

    /// Billing-calendar date for an instant.
    pub fn billing_date(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.billing_tz).date_naive()
    }

    async fn roll_up_owner(
        &self,
        owner_user_id: Uuid,
        today: NaiveDate,
        summary: &mut RollupSummary,
    ) -> Result<UserOutcome, RollupError> {
        let Some(subscription) = self.gate.active_subscription(owner_user_id).await? else {
            return Ok(UserOutcome::NotSubscribed);
        };

        let period = self.resolver.current_period(owner_user_id, today).await?;
        let bounds = period.bounds(self.billing_tz);

        summary.attempted += 1;

        let Some(batch) = self.reservations.reserve(owner_user_id, &bounds).await? else {
            return Ok(UserOutcome::NothingToDo);
        };

        self.aggregator
            .settle(&subscription, &period, &bounds, today, &batch.batch_key)
            .await
    }

    async fn warn_stale_batches(&self, now: DateTime<Utc>) {
        match self.batches.list_stale_pending(now - self.stale_after).await {
            Ok(stale) if !stale.is_empty() => {
                let oldest = &stale[0];
                warn!(
                    count = stale.len(),
                    oldest_batch_key = %oldest.batch_key,
                    oldest_owner_user_id = %oldest.owner_user_id,
                    oldest_updated_utc = %oldest.updated_utc,
                    "Pending batches have not been reported for a while"
                );
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Failed to check for stale batches"),
        }
    }
}

fn error_kind(err: &RollupError) -> &'static str {
    match err {
        RollupError::Store(_) => "store",
        RollupError::Eligibility(_) => "eligibility",
        RollupError::Report(e) => e.kind(),
        RollupError::QuantityOverflow(_) => "quantity_overflow",
    }
}
