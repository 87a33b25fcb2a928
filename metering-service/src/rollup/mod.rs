//! The usage rollup engine.
//!
//! One pass discovers owners with unmetered usage, reserves a batch of their
//! rows for the current billing period, rounds the batch total to whole
//! units and reports it once to the metering processor. Sub-unit totals are
//! carried forward while the period is open and written off once it closes.

pub mod aggregator;
pub mod orchestrator;
pub mod reservation;
pub mod scheduler;

pub use aggregator::{round_half_up, to_billable_quantity, Aggregator};
pub use orchestrator::{RollupOrchestrator, RollupSummary};
pub use reservation::{BatchReservationManager, ReservedBatch};
pub use scheduler::RollupScheduler;

/// What a pass did for one owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserOutcome {
    Reported {
        batch_key: String,
        quantity: i64,
        confirmation_id: String,
    },
    WrittenOff {
        batch_key: String,
    },
    Released {
        batch_key: String,
    },
    NothingToDo,
    NotSubscribed,
}

impl UserOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            UserOutcome::Reported { .. } => "reported",
            UserOutcome::WrittenOff { .. } => "written_off",
            UserOutcome::Released { .. } => "released",
            UserOutcome::NothingToDo => "nothing_to_do",
            UserOutcome::NotSubscribed => "not_subscribed",
        }
    }
}
