//! Usage ledger row model.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Which physical ledger a usage row lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerSource {
    /// Usage recorded once per agent task.
    Task,
    /// Usage recorded once per agent step.
    Step,
}

impl LedgerSource {
    pub const ALL: [LedgerSource; 2] = [LedgerSource::Task, LedgerSource::Step];

    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerSource::Task => "task",
            LedgerSource::Step => "step",
        }
    }

    pub fn table_name(&self) -> &'static str {
        match self {
            LedgerSource::Task => "agent_task_usage",
            LedgerSource::Step => "agent_step_usage",
        }
    }
}

/// One fractional usage record.
///
/// `batch_key` is set while the row is reserved and kept after metering.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UsageRow {
    pub id: Uuid,
    pub owner_user_id: Uuid,
    pub billable_amount: Decimal,
    pub created_at: DateTime<Utc>,
    pub metered: bool,
    pub batch_key: Option<String>,
}

impl UsageRow {
    pub fn is_reserved(&self) -> bool {
        !self.metered && self.batch_key.is_some()
    }
}

/// Input for recording usage, as written by upstream producers.
#[derive(Debug, Clone)]
pub struct NewUsageRow {
    pub owner_user_id: Uuid,
    pub billable_amount: Decimal,
    pub created_at: DateTime<Utc>,
}

/// Sum of unmetered rows carrying one batch key in one or more ledgers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchTally {
    pub rows: u64,
    pub total: Decimal,
}

impl std::ops::Add for BatchTally {
    type Output = BatchTally;

    fn add(self, other: BatchTally) -> BatchTally {
        BatchTally {
            rows: self.rows + other.rows,
            total: self.total + other.total,
        }
    }
}
