//! In-process eligibility collaborators for tests and local development.

use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use uuid::Uuid;

use super::{BillingPeriodResolver, SubscriptionGate};
use crate::error::{EligibilityError, StoreError};
use crate::models::{ActiveSubscription, BillingPeriod};

fn poisoned(what: &str) -> EligibilityError {
    EligibilityError::Store(StoreError::Unavailable(format!("{} mutex poisoned", what)))
}

/// Subscribers registered up front; everyone else is on the free tier.
#[derive(Default)]
pub struct StaticSubscriptionGate {
    subscribers: Mutex<HashMap<Uuid, String>>,
    failing: Mutex<HashSet<Uuid>>,
}

impl StaticSubscriptionGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, owner_user_id: Uuid, subscriber_id: impl Into<String>) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.insert(owner_user_id, subscriber_id.into());
        }
    }

    pub fn unsubscribe(&self, owner_user_id: Uuid) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.remove(&owner_user_id);
        }
    }

    /// Make lookups for `owner_user_id` fail until cleared.
    pub fn fail_for(&self, owner_user_id: Uuid) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.insert(owner_user_id);
        }
    }

    pub fn clear_failures(&self) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.clear();
        }
    }
}

#[async_trait]
impl SubscriptionGate for StaticSubscriptionGate {
    async fn active_subscription(
        &self,
        owner_user_id: Uuid,
    ) -> Result<Option<ActiveSubscription>, EligibilityError> {
        if self
            .failing
            .lock()
            .map_err(|_| poisoned("subscription gate"))?
            .contains(&owner_user_id)
        {
            return Err(EligibilityError::Store(StoreError::Unavailable(format!(
                "subscription lookup failed for {}",
                owner_user_id
            ))));
        }

        let subscribers = self
            .subscribers
            .lock()
            .map_err(|_| poisoned("subscription gate"))?;

        Ok(subscribers
            .get(&owner_user_id)
            .map(|subscriber_id| ActiveSubscription {
                owner_user_id,
                subscriber_id: subscriber_id.clone(),
            }))
    }
}

/// Same period for every owner, regardless of `today`.
pub struct FixedPeriodResolver {
    period: Mutex<BillingPeriod>,
    failing: Mutex<HashSet<Uuid>>,
}

impl FixedPeriodResolver {
    pub fn new(period: BillingPeriod) -> Self {
        Self {
            period: Mutex::new(period),
            failing: Mutex::new(HashSet::new()),
        }
    }

    pub fn set_period(&self, period: BillingPeriod) {
        if let Ok(mut current) = self.period.lock() {
            *current = period;
        }
    }

    pub fn fail_for(&self, owner_user_id: Uuid) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.insert(owner_user_id);
        }
    }
}

#[async_trait]
impl BillingPeriodResolver for FixedPeriodResolver {
    async fn current_period(
        &self,
        owner_user_id: Uuid,
        _today: NaiveDate,
    ) -> Result<BillingPeriod, EligibilityError> {
        if self
            .failing
            .lock()
            .map_err(|_| poisoned("period resolver"))?
            .contains(&owner_user_id)
        {
            return Err(EligibilityError::MissingAnchor(owner_user_id));
        }

        let period = *self.period.lock().map_err(|_| poisoned("period resolver"))?;
        Ok(period)
    }
}
