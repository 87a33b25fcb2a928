//! External metering processor abstraction.
//!
//! The processor accepts `(subscriber, quantity, idempotency_key)` and
//! charges at most once per key. Implementations must not partially apply a
//! report: either a confirmation comes back or nothing was recorded.

pub mod http;
pub mod mock;

use async_trait::async_trait;
use service_core::retry::Retryable;
use thiserror::Error;

pub use http::HttpMeteringReporter;
pub use mock::{MockMeteringReporter, RecordedCharge};

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Metering request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Metering processor rejected report ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("Invalid response from metering processor: {0}")]
    InvalidResponse(String),

    #[error("Reporter not configured: {0}")]
    NotConfigured(String),
}

impl ReportError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ReportError::Timeout(_) | ReportError::Network(_) => true,
            ReportError::Rejected { status, .. } => *status == 429 || *status >= 500,
            ReportError::InvalidResponse(_) | ReportError::NotConfigured(_) => false,
        }
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ReportError::Timeout(_) => "timeout",
            ReportError::Network(_) => "network",
            ReportError::Rejected { .. } => "rejected",
            ReportError::InvalidResponse(_) => "invalid_response",
            ReportError::NotConfigured(_) => "not_configured",
        }
    }
}

impl Retryable for ReportError {
    fn is_retryable(&self) -> bool {
        ReportError::is_retryable(self)
    }
}

/// One usage report for one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageReport {
    pub subscriber_id: String,
    pub quantity: i64,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Confirmation {
    pub id: String,
}

#[async_trait]
pub trait MeteringReporter: Send + Sync {
    /// Must be idempotent per `report.idempotency_key`.
    async fn report_usage(&self, report: &UsageReport) -> Result<Confirmation, ReportError>;
}
