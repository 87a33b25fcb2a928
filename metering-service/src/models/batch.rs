//! Metering batch (audit / idempotency) model.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::BillingPeriod;

/// Lifecycle state of a batch record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// Computed, not yet confirmed by the metering processor.
    Pending,
    /// Confirmation recorded.
    Reported,
    /// Closed out with zero quantity after its period ended.
    WrittenOff,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Reported => "reported",
            BatchStatus::WrittenOff => "written_off",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "reported" => BatchStatus::Reported,
            "written_off" => BatchStatus::WrittenOff,
            _ => BatchStatus::Pending,
        }
    }
}

/// Durable record of one rollup attempt for one owner and period.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct MeteringBatch {
    pub batch_key: String,
    pub owner_user_id: Uuid,
    pub idempotency_key: String,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub total_billable_amount: Decimal,
    pub rounded_quantity: i64,
    pub external_confirmation_id: Option<String>,
    pub status: String,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl MeteringBatch {
    pub fn status(&self) -> BatchStatus {
        BatchStatus::from_string(&self.status)
    }

    /// Finalized records are never rewritten.
    pub fn is_finalized(&self) -> bool {
        self.external_confirmation_id.is_some() || self.status() != BatchStatus::Pending
    }
}

/// Input for creating or refreshing a batch record.
#[derive(Debug, Clone)]
pub struct UpsertBatch {
    pub batch_key: String,
    pub owner_user_id: Uuid,
    pub period: BillingPeriod,
    pub total_billable_amount: Decimal,
    pub rounded_quantity: i64,
    pub status: BatchStatus,
}

impl UpsertBatch {
    pub fn idempotency_key(&self) -> String {
        idempotency_key(self.owner_user_id, &self.batch_key)
    }
}

/// Fresh opaque batch key. UUIDv4, so URL-safe and globally unique.
pub fn new_batch_key() -> String {
    Uuid::new_v4().to_string()
}

/// Key handed to the metering processor; stable across retries of a batch.
pub fn idempotency_key(owner_user_id: Uuid, batch_key: &str) -> String {
    format!("meter:{}:{}", owner_user_id, batch_key)
}
