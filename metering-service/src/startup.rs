//! Application startup and lifecycle management.

use crate::audit::{BatchStore, PgBatchStore};
use crate::config::{MeteringConfig, ReporterConfig};
use crate::eligibility::{AnchorDayPeriodResolver, PgSubscriptionGate};
use crate::middleware::admin_auth_middleware;
use crate::ledger::{LedgerSet, PgUsageLedger, UsageLedger};
use crate::models::LedgerSource;
use crate::reporter::{HttpMeteringReporter, MeteringReporter, MockMeteringReporter};
use crate::rollup::{RollupOrchestrator, RollupScheduler, RollupSummary};
use crate::services::{get_metrics, init_metrics, Database};
use axum::{
    extract::State, http::StatusCode, middleware, response::IntoResponse, routing::get,
    routing::post, Json, Router,
};
use serde_json::json;
use service_core::error::AppError;
use service_core::middleware::tracing::request_id_middleware;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

/// Shared state for the HTTP listener.
#[derive(Clone)]
pub struct AppState {
    pub config: MeteringConfig,
    pub db: Arc<Database>,
    pub orchestrator: Arc<RollupOrchestrator>,
}

/// Health check endpoint for Docker/K8s liveness probes.
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.db.health_check().await {
        Ok(_) => {
            tracing::debug!("Health check passed");
            (
                StatusCode::OK,
                Json(json!({
                    "status": "ok",
                    "service": "metering-service",
                    "version": env!("CARGO_PKG_VERSION")
                })),
            )
        }
        Err(e) => {
            tracing::warn!(error = %e, "Health check failed - database unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "service": "metering-service",
                    "error": e.to_string()
                })),
            )
        }
    }
}

/// Readiness check endpoint for K8s readiness probes.
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.db.health_check().await {
        Ok(_) => StatusCode::OK,
        Err(e) => {
            tracing::warn!(error = %e, "Readiness check failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// Metrics endpoint for Prometheus scraping.
async fn metrics_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        get_metrics(),
    )
}

/// Run one rollup pass immediately, outside the schedule.
async fn trigger_rollup(
    State(state): State<AppState>,
) -> Result<Json<RollupSummary>, AppError> {
    tracing::info!("Manual rollup pass requested");
    let summary = state.orchestrator.run_pass().await?;
    Ok(Json(summary))
}

/// Pick the metering processor client for this deployment.
pub fn build_reporter(config: &ReporterConfig) -> Result<Arc<dyn MeteringReporter>, AppError> {
    if config.is_configured() {
        let reporter = HttpMeteringReporter::new(config.clone())
            .map_err(|e| AppError::ConfigError(anyhow::Error::new(e)))?;
        Ok(Arc::new(reporter))
    } else {
        tracing::warn!("METERING_REPORTER_URL not set - using in-process mock reporter");
        Ok(Arc::new(MockMeteringReporter::new()))
    }
}

/// Wire the rollup engine against Postgres.
pub fn build_orchestrator(
    db: &Database,
    config: &MeteringConfig,
    reporter: Arc<dyn MeteringReporter>,
) -> RollupOrchestrator {
    let pool = db.pool().clone();

    let ledgers = LedgerSet::new(
        LedgerSource::ALL
            .into_iter()
            .map(|source| Arc::new(PgUsageLedger::new(pool.clone(), source)) as Arc<dyn UsageLedger>)
            .collect(),
    );
    let batches: Arc<dyn BatchStore> = Arc::new(PgBatchStore::new(pool.clone()));

    RollupOrchestrator::new(
        ledgers,
        batches,
        reporter,
        Arc::new(PgSubscriptionGate::new(pool.clone())),
        Arc::new(AnchorDayPeriodResolver::new(pool)),
    )
    .with_billing_tz(config.rollup.billing_tz)
    .with_stale_after(config.rollup.stale_after())
}

/// Application container for managing server lifecycle.
pub struct Application {
    http_port: u16,
    http_listener: TcpListener,
    state: AppState,
    shutdown_token: CancellationToken,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: MeteringConfig) -> Result<Self, AppError> {
        Self::build_internal(config, true).await
    }

    /// Build the application without running migrations.
    /// Use this in tests when migrations are already applied by the test harness.
    pub async fn build_without_migrations(config: MeteringConfig) -> Result<Self, AppError> {
        Self::build_internal(config, false).await
    }

    async fn build_internal(config: MeteringConfig, run_migrations: bool) -> Result<Self, AppError> {
        init_metrics();

        let db = Database::new(
            &config.database.url,
            config.database.max_connections,
            config.database.min_connections,
        )
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to PostgreSQL");
            e
        })?;

        if run_migrations {
            db.run_migrations().await.map_err(|e| {
                tracing::error!(error = %e, "Failed to run migrations");
                e
            })?;
        }

        let reporter = build_reporter(&config.reporter)?;
        let orchestrator = Arc::new(build_orchestrator(&db, &config, reporter));

        let http_addr = config.common.bind_address();
        let http_listener = TcpListener::bind(&http_addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %http_addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let http_port = http_listener.local_addr()?.port();

        tracing::info!(http_port = http_port, "Metering service listener bound");

        Ok(Self {
            http_port,
            http_listener,
            state: AppState {
                config,
                db: Arc::new(db),
                orchestrator,
            },
            shutdown_token: CancellationToken::new(),
        })
    }

    /// Get the HTTP port the server is listening on.
    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    /// Get a reference to the database.
    pub fn db(&self) -> &Database {
        &self.state.db
    }

    pub fn orchestrator(&self) -> Arc<RollupOrchestrator> {
        self.state.orchestrator.clone()
    }

    /// Cancelling this token stops accepting requests and ends the rollup
    /// scheduler. `run_until_stopped` returns once its current pass is done.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Run the application until stopped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let rollup = &self.state.config.rollup;

        let scheduler = if rollup.enabled {
            let scheduler =
                RollupScheduler::new(self.state.orchestrator.clone(), rollup.interval());
            let token = scheduler.shutdown_token();
            let stop = self.shutdown_token.clone();
            tokio::spawn(async move {
                stop.cancelled().await;
                token.cancel();
            });
            Some(scheduler.spawn())
        } else {
            tracing::info!("Rollup scheduler disabled by configuration");
            None
        };

        let admin_routes = Router::new()
            .route("/admin/rollup", post(trigger_rollup))
            .route_layer(middleware::from_fn_with_state(
                self.state.config.admin_api_key.clone(),
                admin_auth_middleware,
            ));

        let http_router = Router::new()
            .route("/health", get(health_check))
            .route("/ready", get(readiness_check))
            .route("/metrics", get(metrics_handler))
            .merge(admin_routes)
            .layer(TraceLayer::new_for_http())
            .layer(middleware::from_fn(request_id_middleware))
            .with_state(self.state.clone());

        tracing::info!(
            service = "metering-service",
            version = env!("CARGO_PKG_VERSION"),
            http_port = self.http_port,
            rollup_enabled = rollup.enabled,
            rollup_interval_secs = rollup.interval_secs,
            "Service ready to accept connections"
        );

        let stop = self.shutdown_token.clone();
        let result = axum::serve(self.http_listener, http_router)
            .with_graceful_shutdown(async move { stop.cancelled().await })
            .await;

        // Also reached when the listener fails on its own
        self.shutdown_token.cancel();
        if let Some(handle) = scheduler {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Rollup scheduler task failed");
            }
        }

        result.map_err(|e| {
            tracing::error!(error = %e, "HTTP server error");
            std::io::Error::other(format!("HTTP server error: {}", e))
        })
    }
}
