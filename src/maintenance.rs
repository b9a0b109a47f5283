//! Background housekeeping
//!
//! Two periodic tasks keep long-running processes bounded: one purges error
//! reports past the retention horizon, the other sweeps elapsed rate-limit
//! windows, recovery cooldowns and alert stamps. Both are owned by a
//! [`MaintenanceHandle`] and stop when it is shut down.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::monitoring::ErrorMonitor;
use crate::rate_limiter::RateLimiter;
use crate::recovery::RecoveryEngine;

/// Intervals and horizons for the periodic tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaintenanceSettings {
    pub report_retention: Duration,
    pub prune_interval: Duration,
    pub sweep_interval: Duration,
}

impl Default for MaintenanceSettings {
    fn default() -> Self {
        Self {
            report_retention: Duration::from_secs(30 * 24 * 3600),
            prune_interval: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Components the tasks operate on
#[derive(Debug, Clone)]
pub struct MaintenanceTargets {
    pub monitor: Arc<ErrorMonitor>,
    pub limiter: Arc<RateLimiter>,
    pub recovery: Arc<RecoveryEngine>,
}

/// What one bookkeeping pass removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub rate_windows: usize,
    pub recovery_entries: usize,
    pub alert_stamps: usize,
}

impl MaintenanceTargets {
    /// Purge reports older than `retention`
    pub fn prune_reports(&self, retention: Duration) -> usize {
        self.monitor.prune(retention)
    }

    /// One pass over limiter windows, recovery bookkeeping and alert cooldowns
    pub async fn sweep(&self) -> SweepSummary {
        SweepSummary {
            rate_windows: self.limiter.sweep().await,
            recovery_entries: self.recovery.sweep(),
            alert_stamps: self.monitor.alerts().sweep(),
        }
    }
}

/// Owner of the background tasks
#[derive(Debug)]
pub struct MaintenanceHandle {
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl MaintenanceHandle {
    /// Spawn the periodic tasks on the current runtime
    pub fn start(targets: MaintenanceTargets, settings: MaintenanceSettings) -> Self {
        let token = CancellationToken::new();

        let prune = {
            let targets = targets.clone();
            let token = token.child_token();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(settings.prune_interval);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = interval.tick() => {
                            let removed = targets.prune_reports(settings.report_retention);
                            if removed > 0 {
                                info!(removed, "Purged expired error reports");
                            }
                        }
                    }
                }
                debug!("Report pruning task stopped");
            })
        };

        let sweep = {
            let token = token.child_token();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(settings.sweep_interval);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = interval.tick() => {
                            let summary = targets.sweep().await;
                            debug!(
                                rate_windows = summary.rate_windows,
                                recovery_entries = summary.recovery_entries,
                                alert_stamps = summary.alert_stamps,
                                "Bookkeeping sweep finished"
                            );
                        }
                    }
                }
                debug!("Bookkeeping task stopped");
            })
        };

        info!(
            prune_interval_secs = settings.prune_interval.as_secs(),
            sweep_interval_secs = settings.sweep_interval.as_secs(),
            "Maintenance tasks started"
        );

        Self {
            token,
            tasks: vec![prune, sweep],
        }
    }

    pub fn is_running(&self) -> bool {
        !self.token.is_cancelled() && self.tasks.iter().any(|t| !t.is_finished())
    }

    /// Stop the tasks and wait for them to finish
    pub async fn shutdown(mut self) {
        self.token.cancel();
        for task in std::mem::take(&mut self.tasks) {
            if let Err(e) = task.await {
                warn!("Maintenance task ended abnormally: {}", e);
            }
        }
        info!("Maintenance tasks stopped");
    }
}

impl Drop for MaintenanceHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
