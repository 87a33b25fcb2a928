//! In-process metering processor for tests and local development.
//!
//! Behaves like a well-behaved processor: one charge per idempotency key,
//! and a repeated key returns the original confirmation.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use super::{Confirmation, MeteringReporter, ReportError, UsageReport};
use crate::services::metrics;

/// A charge that became externally visible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCharge {
    pub subscriber_id: String,
    pub quantity: i64,
    pub idempotency_key: String,
    pub confirmation_id: String,
}

#[derive(Default)]
struct MockState {
    by_key: HashMap<String, Confirmation>,
    charges: Vec<RecordedCharge>,
    calls: Vec<UsageReport>,
    fail_next: u32,
    next_id: u64,
}

#[derive(Default)]
pub struct MockMeteringReporter {
    state: Mutex<MockState>,
}

impl MockMeteringReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` calls with a network error, before anything is charged.
    pub fn fail_next(&self, n: u32) {
        if let Ok(mut state) = self.state.lock() {
            state.fail_next = n;
        }
    }

    pub fn charges(&self) -> Vec<RecordedCharge> {
        self.state
            .lock()
            .map(|s| s.charges.clone())
            .unwrap_or_default()
    }

    /// Every call received, including failed and duplicate ones.
    pub fn calls(&self) -> Vec<UsageReport> {
        self.state
            .lock()
            .map(|s| s.calls.clone())
            .unwrap_or_default()
    }

    pub fn total_charged(&self, subscriber_id: &str) -> i64 {
        self.charges()
            .iter()
            .filter(|c| c.subscriber_id == subscriber_id)
            .map(|c| c.quantity)
            .sum()
    }
}

#[async_trait]
impl MeteringReporter for MockMeteringReporter {
    async fn report_usage(&self, report: &UsageReport) -> Result<Confirmation, ReportError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| ReportError::Network("mock reporter mutex poisoned".into()))?;

        state.calls.push(report.clone());

        if state.fail_next > 0 {
            state.fail_next -= 1;
            metrics::record_reporter_call("network");
            return Err(ReportError::Network("simulated outage".into()));
        }

        if let Some(existing) = state.by_key.get(&report.idempotency_key) {
            metrics::record_reporter_call("duplicate");
            return Ok(existing.clone());
        }

        state.next_id += 1;
        let confirmation = Confirmation {
            id: format!("mev_mock_{:06}", state.next_id),
        };

        state
            .by_key
            .insert(report.idempotency_key.clone(), confirmation.clone());
        state.charges.push(RecordedCharge {
            subscriber_id: report.subscriber_id.clone(),
            quantity: report.quantity,
            idempotency_key: report.idempotency_key.clone(),
            confirmation_id: confirmation.id.clone(),
        });

        metrics::record_reporter_call("success");
        metrics::record_reported_quantity("mock", report.quantity);

        Ok(confirmation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(key: &str, quantity: i64) -> UsageReport {
        UsageReport {
            subscriber_id: "cus_1".to_string(),
            quantity,
            idempotency_key: key.to_string(),
        }
    }

    #[tokio::test]
    async fn repeated_key_charges_once() {
        let reporter = MockMeteringReporter::new();

        let first = reporter.report_usage(&report("meter:a:1", 3)).await.unwrap();
        let second = reporter.report_usage(&report("meter:a:1", 3)).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(reporter.charges().len(), 1);
        assert_eq!(reporter.calls().len(), 2);
        assert_eq!(reporter.total_charged("cus_1"), 3);
    }

    #[tokio::test]
    async fn distinct_keys_charge_separately() {
        let reporter = MockMeteringReporter::new();

        let a = reporter.report_usage(&report("meter:a:1", 2)).await.unwrap();
        let b = reporter.report_usage(&report("meter:a:2", 5)).await.unwrap();

        assert_ne!(a.id, b.id);
        assert_eq!(reporter.total_charged("cus_1"), 7);
    }

    #[tokio::test]
    async fn simulated_failures_charge_nothing() {
        let reporter = MockMeteringReporter::new();
        reporter.fail_next(2);

        assert!(reporter.report_usage(&report("k", 1)).await.is_err());
        assert!(reporter.report_usage(&report("k", 1)).await.is_err());
        assert!(reporter.charges().is_empty());

        reporter.report_usage(&report("k", 1)).await.unwrap();
        assert_eq!(reporter.charges().len(), 1);
        assert_eq!(reporter.calls().len(), 3);
    }
}
