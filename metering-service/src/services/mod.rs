//! Services module for metering-service.

pub mod database;
pub mod metrics;

pub use database::Database;
pub use metrics::{
    get_metrics, init_metrics, record_error, record_reported_quantity, record_reporter_call,
    record_reporter_duration, record_rollup_pass, record_user_outcome,
};
