//! Periodic trigger for rollup passes.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::RollupOrchestrator;
use crate::services::metrics;

pub struct RollupScheduler {
    orchestrator: Arc<RollupOrchestrator>,
    interval: Duration,
    shutdown_token: CancellationToken,
}

impl RollupScheduler {
    pub fn new(orchestrator: Arc<RollupOrchestrator>, interval: Duration) -> Self {
        Self {
            orchestrator,
            interval,
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Cancelling the token stops the loop once the current pass finishes.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            interval_secs = self.interval.as_secs(),
            "Rollup scheduler started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown_token.cancelled() => {
                    tracing::info!("Rollup scheduler shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    // Errors are logged and counted inside the pass
                    if let Err(e) = self.orchestrator.run_pass().await {
                        tracing::error!(error = %e, "Rollup pass aborted");
                        metrics::record_error("rollup_pass", "scheduler");
                    }
                }
            }
        }
    }
}
