//! Batch settlement: sum, round, then report, write off or release.

use chrono::NaiveDate;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use std::sync::Arc;
use tracing::{info, warn};

use super::UserOutcome;
use crate::audit::BatchStore;
use crate::error::RollupError;
use crate::ledger::LedgerSet;
use crate::models::{
    ActiveSubscription, BatchStatus, BillingPeriod, MeteringBatch, PeriodBounds, UpsertBatch,
};
use crate::reporter::{MeteringReporter, UsageReport};

/// Nearest integer, halves rounded up. Amounts are never negative, so
/// rounding midpoints away from zero is exactly half-up.
pub fn round_half_up(total: Decimal) -> Decimal {
    total.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
}

pub fn to_billable_quantity(total: Decimal) -> Result<i64, RollupError> {
    round_half_up(total)
        .to_i64()
        .ok_or(RollupError::QuantityOverflow(total))
}

#[derive(Clone)]
pub struct Aggregator {
    ledgers: LedgerSet,
    batches: Arc<dyn BatchStore>,
    reporter: Arc<dyn MeteringReporter>,
}

impl Aggregator {
    pub fn new(
        ledgers: LedgerSet,
        batches: Arc<dyn BatchStore>,
        reporter: Arc<dyn MeteringReporter>,
    ) -> Self {
        Self {
            ledgers,
            batches,
            reporter,
        }
    }

    /// Settle one reserved batch.
    ///
    /// A reporter failure is returned as an error and leaves the rows
    /// reserved and unmetered; the next pass resumes the same key.
    pub async fn settle(
        &self,
        subscription: &ActiveSubscription,
        period: &BillingPeriod,
        bounds: &PeriodBounds,
        today: NaiveDate,
        batch_key: &str,
    ) -> Result<UserOutcome, RollupError> {
        let owner_user_id = subscription.owner_user_id;

        // A finalized record means an earlier pass decided this batch but
        // stopped before every row was marked. Finish that decision as recorded.
        if let Some(existing) = self.batches.get(batch_key).await? {
            if existing.is_finalized() {
                return self.complete(subscription, &existing).await;
            }
        }

        let tally = self
            .ledgers
            .tally_batch(owner_user_id, batch_key, bounds)
            .await?;

        // A concurrent pass working the same key already finished it.
        if tally.rows == 0 {
            return Ok(UserOutcome::NothingToDo);
        }

        let quantity = to_billable_quantity(tally.total)?;

        let mut record = UpsertBatch {
            batch_key: batch_key.to_string(),
            owner_user_id,
            period: *period,
            total_billable_amount: tally.total,
            rounded_quantity: quantity,
            status: BatchStatus::Pending,
        };

        if quantity > 0 {
            let stored = self.batches.upsert(&record).await?;
            return self.report_and_mark(subscription, &stored).await;
        }

        if period.has_closed(today) {
            record.status = BatchStatus::WrittenOff;
            let stored = self.batches.upsert(&record).await?;
            return self.complete(subscription, &stored).await;
        }

        // Only an unrecorded batch may be released. A record written since the
        // first read means another pass already decided this key, and the
        // rows still under it belong to that decision.
        if let Some(existing) = self.batches.get(batch_key).await? {
            return self.complete(subscription, &existing).await;
        }

        let released = self.ledgers.release(batch_key).await?;

        info!(
            owner_user_id = %owner_user_id,
            batch_key = %batch_key,
            total = %tally.total,
            rows = released,
            "Below one unit, usage carried forward"
        );

        Ok(UserOutcome::Released {
            batch_key: batch_key.to_string(),
        })
    }

    async fn complete(
        &self,
        subscription: &ActiveSubscription,
        batch: &MeteringBatch,
    ) -> Result<UserOutcome, RollupError> {
        if batch.status() != BatchStatus::WrittenOff {
            return self.report_and_mark(subscription, batch).await;
        }

        let marked = self.ledgers.mark_metered(&batch.batch_key).await?;

        info!(
            owner_user_id = %batch.owner_user_id,
            batch_key = %batch.batch_key,
            total = %batch.total_billable_amount,
            rows = marked,
            period_end = %batch.period_end,
            "Sub-unit usage written off at period end"
        );

        Ok(UserOutcome::WrittenOff {
            batch_key: batch.batch_key.clone(),
        })
    }

    /// Report the stored quantity under the batch's idempotency key, then
    /// record the confirmation and mark the rows. Safe to repeat.
    async fn report_and_mark(
        &self,
        subscription: &ActiveSubscription,
        batch: &MeteringBatch,
    ) -> Result<UserOutcome, RollupError> {
        let report = UsageReport {
            subscriber_id: subscription.subscriber_id.clone(),
            quantity: batch.rounded_quantity,
            idempotency_key: batch.idempotency_key.clone(),
        };

        let confirmation = match self.reporter.report_usage(&report).await {
            Ok(confirmation) => confirmation,
            Err(e) => {
                warn!(
                    owner_user_id = %batch.owner_user_id,
                    batch_key = %batch.batch_key,
                    idempotency_key = %report.idempotency_key,
                    quantity = report.quantity,
                    error = %e,
                    "Metering report failed, batch left pending"
                );
                return Err(e.into());
            }
        };

        if self
            .batches
            .record_confirmation(&batch.batch_key, &confirmation.id)
            .await?
            .is_none()
        {
            warn!(
                batch_key = %batch.batch_key,
                confirmation_id = %confirmation.id,
                "Batch already carries a different confirmation"
            );
        }

        let marked = self.ledgers.mark_metered(&batch.batch_key).await?;

        info!(
            owner_user_id = %batch.owner_user_id,
            batch_key = %batch.batch_key,
            total = %batch.total_billable_amount,
            quantity = report.quantity,
            rows = marked,
            confirmation_id = %confirmation.id,
            "Batch reported"
        );

        Ok(UserOutcome::Reported {
            batch_key: batch.batch_key.clone(),
            quantity: report.quantity,
            confirmation_id: confirmation.id,
        })
    }
}
