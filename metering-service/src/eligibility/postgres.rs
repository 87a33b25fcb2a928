//! Eligibility backed by the `owner_subscriptions` projection.

use async_trait::async_trait;
use chrono::{Datelike, Days, Months, NaiveDate};
use sqlx::PgPool;
use tracing::instrument;
use uuid::Uuid;

use super::{BillingPeriodResolver, SubscriptionGate};
use crate::error::{EligibilityError, StoreError};
use crate::models::{ActiveSubscription, BillingPeriod, OwnerSubscription};

#[derive(Clone)]
pub struct PgSubscriptionGate {
    pool: PgPool,
}

impl PgSubscriptionGate {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

async fn fetch_subscription(
    pool: &PgPool,
    owner_user_id: Uuid,
) -> Result<Option<OwnerSubscription>, StoreError> {
    let subscription = sqlx::query_as::<_, OwnerSubscription>(
        r#"
        SELECT owner_user_id, external_customer_id, status, billing_anchor_day, updated_utc
        FROM owner_subscriptions
        WHERE owner_user_id = $1
        "#,
    )
    .bind(owner_user_id)
    .fetch_optional(pool)
    .await?;

    Ok(subscription)
}

#[async_trait]
impl SubscriptionGate for PgSubscriptionGate {
    #[instrument(skip(self))]
    async fn active_subscription(
        &self,
        owner_user_id: Uuid,
    ) -> Result<Option<ActiveSubscription>, EligibilityError> {
        let subscription = fetch_subscription(&self.pool, owner_user_id).await?;

        Ok(subscription
            .filter(|s| s.status().is_paid())
            .map(|s| ActiveSubscription {
                owner_user_id: s.owner_user_id,
                subscriber_id: s.external_customer_id,
            }))
    }
}

/// Monthly cycles starting on the owner's billing anchor day.
#[derive(Clone)]
pub struct AnchorDayPeriodResolver {
    pool: PgPool,
}

impl AnchorDayPeriodResolver {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BillingPeriodResolver for AnchorDayPeriodResolver {
    #[instrument(skip(self))]
    async fn current_period(
        &self,
        owner_user_id: Uuid,
        today: NaiveDate,
    ) -> Result<BillingPeriod, EligibilityError> {
        let subscription = fetch_subscription(&self.pool, owner_user_id)
            .await?
            .ok_or(EligibilityError::MissingAnchor(owner_user_id))?;

        period_for_anchor(subscription.billing_anchor_day, today)
    }
}

/// Cycle containing `today` for a monthly anchor day.
///
/// Anchor days past the end of a month fall on that month's last day, so an
/// anchor of 31 starts February's cycle on the 28th (or 29th).
pub fn period_for_anchor(
    anchor_day: i32,
    today: NaiveDate,
) -> Result<BillingPeriod, EligibilityError> {
    let day = u32::try_from(anchor_day)
        .ok()
        .filter(|d| (1..=31).contains(d))
        .ok_or(EligibilityError::InvalidAnchor(anchor_day))?;

    let first_of_month = today.with_day(1).ok_or(EligibilityError::InvalidAnchor(anchor_day))?;
    let this_anchor = anchor_in_month(first_of_month, day)?;

    let start = if today >= this_anchor {
        this_anchor
    } else {
        let prev_month = first_of_month
            .checked_sub_months(Months::new(1))
            .ok_or(EligibilityError::InvalidAnchor(anchor_day))?;
        anchor_in_month(prev_month, day)?
    };

    let next_month = start
        .with_day(1)
        .and_then(|d| d.checked_add_months(Months::new(1)))
        .ok_or(EligibilityError::InvalidAnchor(anchor_day))?;
    let end = anchor_in_month(next_month, day)?
        .pred_opt()
        .ok_or(EligibilityError::InvalidAnchor(anchor_day))?;

    Ok(BillingPeriod::new(start, end))
}

/// `day` clamped to the length of the month starting at `first_of_month`.
fn anchor_in_month(first_of_month: NaiveDate, day: u32) -> Result<NaiveDate, EligibilityError> {
    let last_day = first_of_month
        .checked_add_months(Months::new(1))
        .and_then(|d| d.checked_sub_days(Days::new(1)))
        .map(|d| d.day())
        .ok_or(EligibilityError::InvalidAnchor(day as i32))?;

    first_of_month
        .with_day(day.min(last_day))
        .ok_or(EligibilityError::InvalidAnchor(day as i32))
}
