//! Subscription projection used for eligibility checks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Subscription status as mirrored from the billing system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trial,
    Active,
    PastDue,
    Cancelled,
    Expired,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Trial => "trial",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Cancelled => "cancelled",
            SubscriptionStatus::Expired => "expired",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "active" => SubscriptionStatus::Active,
            "past_due" => SubscriptionStatus::PastDue,
            "cancelled" => SubscriptionStatus::Cancelled,
            "expired" => SubscriptionStatus::Expired,
            _ => SubscriptionStatus::Trial,
        }
    }

    /// Only paying subscriptions are metered.
    pub fn is_paid(&self) -> bool {
        matches!(self, SubscriptionStatus::Active)
    }
}

/// Row of the `owner_subscriptions` projection.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct OwnerSubscription {
    pub owner_user_id: Uuid,
    pub external_customer_id: String,
    pub status: String,
    pub billing_anchor_day: i32,
    pub updated_utc: DateTime<Utc>,
}

impl OwnerSubscription {
    pub fn status(&self) -> SubscriptionStatus {
        SubscriptionStatus::from_string(&self.status)
    }
}

/// A paying subscriber, as returned by the subscription gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveSubscription {
    pub owner_user_id: Uuid,
    /// Identifier of the customer at the metering processor.
    pub subscriber_id: String,
}
