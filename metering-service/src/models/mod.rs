//! Domain models for metering-service.

mod batch;
mod period;
mod subscription;
mod usage;

pub use batch::{idempotency_key, new_batch_key, BatchStatus, MeteringBatch, UpsertBatch};
pub use period::{BillingPeriod, PeriodBounds};
pub use subscription::{ActiveSubscription, OwnerSubscription, SubscriptionStatus};
pub use usage::{BatchTally, LedgerSource, NewUsageRow, UsageRow};
