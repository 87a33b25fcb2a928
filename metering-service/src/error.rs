//! Error types for the rollup engine.

use rust_decimal::Decimal;
use service_core::error::AppError;
use thiserror::Error;
use uuid::Uuid;

use crate::reporter::ReportError;

/// Failure reading or writing the usage ledgers or the batch store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Failure answering "should this owner be billed, and for which period".
#[derive(Error, Debug)]
pub enum EligibilityError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("No billing anchor configured for owner {0}")]
    MissingAnchor(Uuid),

    #[error("Invalid billing anchor day {0}")]
    InvalidAnchor(i32),
}

#[derive(Error, Debug)]
pub enum RollupError {
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Eligibility lookup failed: {0}")]
    Eligibility(#[from] EligibilityError),

    #[error("Metering report failed: {0}")]
    Report(#[from] ReportError),

    #[error("Billable total {0} does not fit in an integer quantity")]
    QuantityOverflow(Decimal),
}

impl From<sqlx::Error> for RollupError {
    fn from(err: sqlx::Error) -> Self {
        RollupError::Store(StoreError::Database(err))
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        AppError::DatabaseError(anyhow::Error::new(err))
    }
}

impl From<RollupError> for AppError {
    fn from(err: RollupError) -> Self {
        match err {
            RollupError::Store(e) => e.into(),
            RollupError::Report(e) => AppError::BadGateway(e.to_string()),
            other => AppError::InternalError(anyhow::Error::new(other)),
        }
    }
}
