//! Configuration module for metering-service.

use chrono::{FixedOffset, Offset, Utc};
use secrecy::Secret;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct MeteringConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub rollup: RollupConfig,
    pub reporter: ReporterConfig,
    /// Required in `X-Admin-Api-Key` on admin routes. Unset rejects them all.
    pub admin_api_key: Option<Secret<String>>,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct RollupConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    /// Billing calendar, as a fixed offset from UTC.
    pub billing_tz: FixedOffset,
    /// Pending batches older than this are reported as stuck.
    pub stale_batch_secs: u64,
}

impl RollupConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.stale_batch_secs).unwrap_or(i64::MAX / 1000))
    }
}

impl Default for RollupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 300,
            billing_tz: Utc.fix(),
            stale_batch_secs: 3600,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReporterConfig {
    /// Metering processor base URL. Unset means the in-process mock is used.
    pub base_url: Option<String>,
    pub api_key: Secret<String>,
    pub event_name: String,
    pub timeout_ms: u64,
    pub max_retries: u32,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: Secret::new(String::new()),
            event_name: "agent_usage".to_string(),
            timeout_ms: 10_000,
            max_retries: 2,
        }
    }
}

impl ReporterConfig {
    pub fn is_configured(&self) -> bool {
        self.base_url
            .as_deref()
            .is_some_and(|url| !url.trim().is_empty())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn utc_offset(minutes: i32) -> Result<FixedOffset, AppError> {
    minutes
        .checked_mul(60)
        .and_then(FixedOffset::east_opt)
        .ok_or_else(|| {
            AppError::ConfigError(anyhow::anyhow!(
                "BILLING_UTC_OFFSET_MINUTES out of range: {}",
                minutes
            ))
        })
}

impl MeteringConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;

        let reporter_defaults = ReporterConfig::default();

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "metering-service".to_string()),
            service_version: env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok().filter(|s| !s.is_empty()),
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("DATABASE_URL is required"))
                })?,
                max_connections: parse_env("DATABASE_MAX_CONNECTIONS", 10),
                min_connections: parse_env("DATABASE_MIN_CONNECTIONS", 2),
            },
            rollup: RollupConfig {
                enabled: parse_env("ROLLUP_ENABLED", true),
                interval_secs: parse_env("ROLLUP_INTERVAL_SECS", 300),
                billing_tz: utc_offset(parse_env("BILLING_UTC_OFFSET_MINUTES", 0))?,
                stale_batch_secs: parse_env("ROLLUP_STALE_BATCH_SECS", 3600),
            },
            reporter: ReporterConfig {
                base_url: env::var("METERING_REPORTER_URL")
                    .ok()
                    .filter(|s| !s.trim().is_empty()),
                api_key: Secret::new(env::var("METERING_REPORTER_API_KEY").unwrap_or_default()),
                event_name: env::var("METERING_REPORTER_EVENT_NAME")
                    .unwrap_or(reporter_defaults.event_name),
                timeout_ms: parse_env("METERING_REPORTER_TIMEOUT_MS", reporter_defaults.timeout_ms),
                max_retries: parse_env(
                    "METERING_REPORTER_MAX_RETRIES",
                    reporter_defaults.max_retries,
                ),
            },
            admin_api_key: env::var("ADMIN_API_KEY")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .map(Secret::new),
        })
    }
}
