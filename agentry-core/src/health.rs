// ABOUTME: Periodic health probing of idle pooled instances.
// ABOUTME: Repeatedly failing instances are evicted so checkouts never hand them out.

use crate::pool::{PoolManager, ProbeSummary};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(30);

/// Probe results for one backend's pool
#[derive(Debug, Clone, Serialize)]
pub struct PoolHealth {
    pub backend_id: String,
    pub summary: ProbeSummary,
}

/// Results of one monitoring pass, sorted by backend id
#[derive(Debug, Clone, Default, Serialize)]
pub struct HealthReport {
    pub backends: Vec<PoolHealth>,
}

impl HealthReport {
    pub fn evicted(&self) -> usize {
        self.backends.iter().map(|b| b.summary.evicted).sum()
    }

    pub fn unhealthy(&self) -> usize {
        self.backends.iter().map(|b| b.summary.unhealthy).sum()
    }

    pub fn get(&self, backend_id: &str) -> Option<&ProbeSummary> {
        self.backends
            .iter()
            .find(|b| b.backend_id == backend_id)
            .map(|b| &b.summary)
    }
}

pub struct HealthMonitor {
    pools: Arc<PoolManager>,
    interval: Duration,
}

impl HealthMonitor {
    pub fn new(pools: Arc<PoolManager>) -> Self {
        Self {
            pools,
            interval: DEFAULT_HEALTH_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Probe every idle instance of every pool once. Leased instances are
    /// left alone; they are probed by the orchestrator after a failure.
    pub async fn run_once(&self) -> HealthReport {
        let ids = self.pools.pool_ids();
        let pools = &self.pools;
        let backends = futures::future::join_all(ids.into_iter().map(|id| async move {
            let summary = pools.probe_idle(&id).await;
            PoolHealth {
                backend_id: id,
                summary,
            }
        }))
        .await;

        let report = HealthReport { backends };
        if report.evicted() > 0 || report.unhealthy() > 0 {
            tracing::warn!(
                pools = report.backends.len(),
                unhealthy = report.unhealthy(),
                evicted = report.evicted(),
                "Health pass found failing instances"
            );
        } else {
            tracing::debug!(pools = report.backends.len(), "Health pass clean");
        }
        report
    }

    /// Run passes on the configured interval until the handle is stopped
    pub fn spawn(self) -> MonitorHandle {
        let token = CancellationToken::new();
        let child = token.clone();
        tracing::info!(
            interval_secs = self.interval.as_secs(),
            "Starting health monitor"
        );

        let task = tokio::spawn(async move {
            let mut ticker = interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick fires immediately; pools were just probed on construction
            ticker.tick().await;

            loop {
                tokio::select! {
                    biased;
                    _ = child.cancelled() => {
                        tracing::info!("Health monitor stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.run_once().await;
                    }
                }
            }
        });

        MonitorHandle { token, task }
    }
}

/// Running background monitor
pub struct MonitorHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop the monitor and wait for an in-flight pass to finish
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "Health monitor task ended abnormally");
        }
    }
}
