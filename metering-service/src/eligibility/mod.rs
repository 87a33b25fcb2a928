//! Eligibility collaborators: who is billed, and for which period.

pub mod fixed;
pub mod postgres;

use async_trait::async_trait;
use chrono::NaiveDate;
use uuid::Uuid;

use crate::error::EligibilityError;
use crate::models::{ActiveSubscription, BillingPeriod};

pub use fixed::{FixedPeriodResolver, StaticSubscriptionGate};
pub use postgres::{period_for_anchor, AnchorDayPeriodResolver, PgSubscriptionGate};

#[async_trait]
pub trait SubscriptionGate: Send + Sync {
    /// `None` means the owner is not a paying subscriber and must not be billed.
    async fn active_subscription(
        &self,
        owner_user_id: Uuid,
    ) -> Result<Option<ActiveSubscription>, EligibilityError>;
}

#[async_trait]
pub trait BillingPeriodResolver: Send + Sync {
    /// Inclusive start and end dates of the cycle containing `today`.
    async fn current_period(
        &self,
        owner_user_id: Uuid,
        today: NaiveDate,
    ) -> Result<BillingPeriod, EligibilityError>;
}
