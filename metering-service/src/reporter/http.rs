//! HTTP client for the external metering processor.
//!
//! Posts one meter event per batch. The idempotency key travels both as the
//! `Idempotency-Key` header and as the event identifier, so a replayed
//! request is collapsed by the processor into the original charge.

use async_trait::async_trait;
use reqwest::Client;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use service_core::retry::{retry_call, RetryConfig};
use std::time::{Duration, Instant};

use super::{Confirmation, MeteringReporter, ReportError, UsageReport};
use crate::config::ReporterConfig;
use crate::services::metrics;

pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

#[derive(Debug, Serialize)]
pub struct MeterEventRequest<'a> {
    pub event_name: &'a str,
    pub subscriber: &'a str,
    pub quantity: i64,
    pub identifier: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct MeterEventResponse {
    pub id: String,
}

#[derive(Clone)]
pub struct HttpMeteringReporter {
    client: Client,
    base_url: String,
    config: ReporterConfig,
    retry: RetryConfig,
}

impl HttpMeteringReporter {
    pub fn new(config: ReporterConfig) -> Result<Self, ReportError> {
        let base_url = config
            .base_url
            .clone()
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| ReportError::NotConfigured("METERING_REPORTER_URL not set".into()))?;

        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| ReportError::NotConfigured(e.to_string()))?;

        let retry = RetryConfig {
            max_retries: config.max_retries,
            ..RetryConfig::quick()
        };

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            config,
            retry,
        })
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    fn events_url(&self) -> String {
        format!("{}/meter_events", self.base_url)
    }

    async fn send_once(&self, report: &UsageReport) -> Result<Confirmation, ReportError> {
        let request = MeterEventRequest {
            event_name: &self.config.event_name,
            subscriber: &report.subscriber_id,
            quantity: report.quantity,
            identifier: &report.idempotency_key,
        };

        let started = Instant::now();
        let result = self.post(&request, &report.idempotency_key).await;
        let elapsed = started.elapsed().as_secs_f64();

        let status = match &result {
            Ok(_) => "success",
            Err(e) => e.kind(),
        };
        metrics::record_reporter_call(status);
        metrics::record_reporter_duration(status, elapsed);

        result
    }

    async fn post(
        &self,
        request: &MeterEventRequest<'_>,
        idempotency_key: &str,
    ) -> Result<Confirmation, ReportError> {
        let response = self
            .client
            .post(self.events_url())
            .bearer_auth(self.config.api_key.expose_secret())
            .header(IDEMPOTENCY_KEY_HEADER, idempotency_key)
            .json(request)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        let body = response.text().await.map_err(map_transport_error)?;

        tracing::debug!(status = %status, body = %body, "Metering processor response");

        if !status.is_success() {
            return Err(ReportError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let event: MeterEventResponse = serde_json::from_str(&body)
            .map_err(|e| ReportError::InvalidResponse(e.to_string()))?;

        Ok(Confirmation { id: event.id })
    }
}

fn map_transport_error(err: reqwest::Error) -> ReportError {
    if err.is_timeout() {
        ReportError::Timeout(err.to_string())
    } else {
        ReportError::Network(err.to_string())
    }
}

#[async_trait]
impl MeteringReporter for HttpMeteringReporter {
    async fn report_usage(&self, report: &UsageReport) -> Result<Confirmation, ReportError> {
        let confirmation = retry_call(&self.retry, "report_usage", || self.send_once(report)).await?;

        metrics::record_reported_quantity(&self.config.event_name, report.quantity);

        tracing::info!(
            confirmation_id = %confirmation.id,
            subscriber = %report.subscriber_id,
            quantity = report.quantity,
            idempotency_key = %report.idempotency_key,
            "Usage reported to metering processor"
        );

        Ok(confirmation)
    }
}
