//! Metrics module for metering-service.
//! Provides Prometheus metrics for rollup passes and metering reports.

use once_cell::sync::Lazy;
use prometheus::{
    histogram_opts, opts, register_histogram_vec, register_int_counter_vec, Encoder, HistogramVec,
    IntCounterVec, TextEncoder,
};
use std::sync::OnceLock;

/// Database query duration histogram
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!(
            "metering_db_query_duration_seconds",
            "Database query duration"
        ),
        &["operation"]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Rollup passes by status
pub static ROLLUP_PASSES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Per-owner rollup outcomes
pub static ROLLUP_USER_OUTCOMES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Calls to the external metering processor
pub static REPORTER_CALLS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// External metering call duration
pub static REPORTER_CALL_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Whole units reported, by ledger-independent outcome
pub static REPORTED_QUANTITY_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Error counter for alerting
pub static ERRORS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Initialize all metrics. Call once at startup.
pub fn init_metrics() {
    ROLLUP_PASSES_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("metering_rollup_passes_total", "Total rollup passes by status"),
            &["status"]
        )
        .expect("Failed to register ROLLUP_PASSES_TOTAL")
    });

    ROLLUP_USER_OUTCOMES_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "metering_rollup_user_outcomes_total",
                "Per-owner rollup outcomes"
            ),
            &["outcome"]
        )
        .expect("Failed to register ROLLUP_USER_OUTCOMES_TOTAL")
    });

    REPORTER_CALLS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "metering_reporter_calls_total",
                "Calls to the metering processor by status"
            ),
            &["status"]
        )
        .expect("Failed to register REPORTER_CALLS_TOTAL")
    });

    REPORTER_CALL_DURATION.get_or_init(|| {
        register_histogram_vec!(
            histogram_opts!(
                "metering_reporter_call_duration_seconds",
                "Metering processor call duration",
                vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
            ),
            &["status"]
        )
        .expect("Failed to register REPORTER_CALL_DURATION")
    });

    REPORTED_QUANTITY_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "metering_reported_quantity_total",
                "Whole billable units confirmed by the metering processor"
            ),
            &["event_name"]
        )
        .expect("Failed to register REPORTED_QUANTITY_TOTAL")
    });

    ERRORS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("metering_errors_total", "Total errors by type for alerting"),
            &["error_type", "operation"]
        )
        .expect("Failed to register ERRORS_TOTAL")
    });

    // Force initialization of lazy statics
    let _ = &*DB_QUERY_DURATION;
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

pub fn record_rollup_pass(status: &str) {
    if let Some(counter) = ROLLUP_PASSES_TOTAL.get() {
        counter.with_label_values(&[status]).inc();
    }
}

pub fn record_user_outcome(outcome: &str) {
    if let Some(counter) = ROLLUP_USER_OUTCOMES_TOTAL.get() {
        counter.with_label_values(&[outcome]).inc();
    }
}

pub fn record_reporter_call(status: &str) {
    if let Some(counter) = REPORTER_CALLS_TOTAL.get() {
        counter.with_label_values(&[status]).inc();
    }
}

pub fn record_reporter_duration(status: &str, duration_secs: f64) {
    if let Some(histogram) = REPORTER_CALL_DURATION.get() {
        histogram.with_label_values(&[status]).observe(duration_secs);
    }
}

pub fn record_reported_quantity(event_name: &str, quantity: i64) {
    if let Some(counter) = REPORTED_QUANTITY_TOTAL.get() {
        counter
            .with_label_values(&[event_name])
            .inc_by(quantity.max(0) as u64);
    }
}

/// Record an error for alerting.
pub fn record_error(error_type: &str, operation: &str) {
    if let Some(counter) = ERRORS_TOTAL.get() {
        counter.with_label_values(&[error_type, operation]).inc();
    }
}
