//! Liveness Guard
//!
//! Periodic maintenance loops around the engine:
//!
//! - **Resubscribe**: re-establish upstream subscriptions for every active
//!   instrument (recovers from failed subscribes and gateway restarts) and
//!   tear down orphans left behind by races.
//! - **Heartbeat**: push a keep-alive to every active instrument's sessions.
//! - **Reap**: detach sessions that lost their transport and never came back.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;

use crate::infrastructure::broadcast::FanoutEngine;
use crate::infrastructure::config::EngineSettings;

/// Guard periods.
#[derive(Debug, Clone, Copy)]
pub struct GuardConfig {
    /// Resubscribe period.
    pub resubscribe_interval: Duration,
    /// Heartbeat period.
    pub heartbeat_interval: Duration,
    /// Reaper period.
    pub cleanup_interval: Duration,
    /// Idle time after which a detached session is reaped.
    pub stale_after: Duration,
}

impl From<&EngineSettings> for GuardConfig {
    fn from(settings: &EngineSettings) -> Self {
        Self {
            resubscribe_interval: settings.guard_interval,
            heartbeat_interval: settings.heartbeat_interval,
            cleanup_interval: settings.cleanup_interval,
            stale_after: settings.stale_after,
        }
    }
}

/// Periodic engine maintenance.
#[derive(Debug, Clone)]
pub struct LivenessGuard {
    engine: Arc<FanoutEngine>,
    config: GuardConfig,
}

impl LivenessGuard {
    /// Create a guard over `engine`.
    #[must_use]
    pub const fn new(engine: Arc<FanoutEngine>, config: GuardConfig) -> Self {
        Self { engine, config }
    }

    /// Re-ensure upstream resources for every active instrument.
    ///
    /// Returns the number of active instruments visited.
    pub async fn resubscribe_cycle(&self) -> usize {
        let active = self.engine.registry().active_instruments();
        for instrument in &active {
            self.engine.ensure_upstream(instrument).await;
        }
        let orphans = self.engine.sweep_orphans().await;
        if !orphans.is_empty() {
            tracing::info!(count = orphans.len(), "Tore down orphaned instruments");
        }
        active.len()
    }

    /// Send a heartbeat to every active instrument's subscribers.
    pub fn heartbeat_cycle(&self) -> usize {
        let active = self.engine.registry().active_instruments();
        for instrument in &active {
            self.engine.broadcast_heartbeat(instrument);
        }
        active.len()
    }

    /// Reap stale sessions.
    pub async fn reap_cycle(&self) -> usize {
        self.engine.reap_stale(self.config.stale_after).await.len()
    }

    /// Spawn the three maintenance loops. They stop when `cancel` fires.
    #[must_use]
    pub fn spawn(&self, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(self.clone().run_resubscribe(cancel.clone())),
            tokio::spawn(self.clone().run_heartbeat(cancel.clone())),
            tokio::spawn(self.clone().run_reaper(cancel.clone())),
        ]
    }

    async fn run_resubscribe(self, cancel: CancellationToken) {
        let period = self.config.resubscribe_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let active = self.resubscribe_cycle().await;
                    tracing::debug!(active, "Resubscribe guard pass complete");
                }
            }
        }
        tracing::debug!("Resubscribe guard stopped");
    }

    async fn run_heartbeat(self, cancel: CancellationToken) {
        let period = self.config.heartbeat_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.heartbeat_cycle();
                }
            }
        }
        tracing::debug!("Heartbeat loop stopped");
    }

    async fn run_reaper(self, cancel: CancellationToken) {
        let period = self.config.cleanup_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let reaped = self.reap_cycle().await;
                    if reaped > 0 {
                        tracing::info!(reaped, "Stale sessions reaped");
                    }
                }
            }
        }
        tracing::debug!("Session reaper stopped");
    }
}
