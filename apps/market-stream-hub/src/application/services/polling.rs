//! Minute Bar Polling Fallback
//!
//! The push connection does not reliably deliver one-minute bars, so every
//! subscribed instrument also gets a pull loop. Each loop fetches the latest
//! bars, skips the result when the newest `time_key` has not moved, and
//! submits changes through the same hand-off channel the push path uses.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::EventSink;
use crate::application::ports::MarketDataUpstream;
use crate::domain::streaming::{CanonicalEvent, EventPayload, KlineBar};
use crate::domain::subscription::InstrumentId;
use crate::infrastructure::metrics::{self, UpstreamOperation};

/// Polling cadence.
#[derive(Debug, Clone, Copy)]
pub struct PollingConfig {
    /// Pause between polls.
    pub interval: Duration,
    /// Bars requested per poll.
    pub limit: usize,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            limit: 240,
        }
    }
}

struct PollTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Per-instrument minute bar pull loops.
pub struct PollingFallback {
    upstream: Arc<dyn MarketDataUpstream>,
    sink: EventSink,
    config: PollingConfig,
    cancel: CancellationToken,
    tasks: Mutex<HashMap<InstrumentId, PollTask>>,
}

impl std::fmt::Debug for PollingFallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollingFallback")
            .field("config", &self.config)
            .field("instruments", &self.instruments())
            .finish_non_exhaustive()
    }
}

impl PollingFallback {
    /// Create the fallback. Every loop is a child of `cancel`.
    #[must_use]
    pub fn new(
        upstream: Arc<dyn MarketDataUpstream>,
        sink: EventSink,
        config: PollingConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            upstream,
            sink,
            config,
            cancel,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Start polling `instrument` unless a loop already runs.
    ///
    /// Must be called from within a tokio runtime. Returns `true` when a new
    /// loop was spawned.
    pub fn start(&self, instrument: &str) -> bool {
        let mut tasks = self.tasks.lock();
        if let Some(task) = tasks.get(instrument) {
            if !task.handle.is_finished() {
                return false;
            }
        }
        if self.cancel.is_cancelled() {
            return false;
        }

        let token = self.cancel.child_token();
        let handle = tokio::spawn(poll_loop(
            Arc::clone(&self.upstream),
            self.sink.clone(),
            instrument.to_string(),
            self.config,
            token.clone(),
        ));
        tasks.insert(instrument.to_string(), PollTask { token, handle });
        let count = tasks.len();
        drop(tasks);

        tracing::debug!(instrument, "Minute bar polling started");
        publish_gauge(count);
        true
    }

    /// Cancel the loop for `instrument` and wait for it to finish.
    pub async fn stop(&self, instrument: &str) -> bool {
        let (task, count) = {
            let mut tasks = self.tasks.lock();
            let task = tasks.remove(instrument);
            (task, tasks.len())
        };
        let Some(task) = task else {
            return false;
        };

        task.token.cancel();
        if let Err(e) = task.handle.await {
            tracing::warn!(instrument, error = %e, "Polling task ended abnormally");
        }
        tracing::debug!(instrument, "Minute bar polling stopped");
        publish_gauge(count);
        true
    }

    /// Cancel every loop and wait for all of them.
    pub async fn stop_all(&self) {
        let tasks: Vec<PollTask> = self.tasks.lock().drain().map(|(_, task)| task).collect();
        for task in &tasks {
            task.token.cancel();
        }
        for task in tasks {
            let _ = task.handle.await;
        }
        publish_gauge(0);
    }

    /// Whether a loop runs for `instrument`.
    #[must_use]
    pub fn is_polling(&self, instrument: &str) -> bool {
        self.tasks
            .lock()
            .get(instrument)
            .is_some_and(|task| !task.handle.is_finished())
    }

    /// Instruments with a registered loop.
    #[must_use]
    pub fn instruments(&self) -> Vec<InstrumentId> {
        self.tasks.lock().keys().cloned().collect()
    }
}

#[allow(clippy::cast_precision_loss)]
fn publish_gauge(count: usize) {
    metrics::set_polling_tasks(count as f64);
}

fn newest_time_key(bars: &[KlineBar]) -> Option<&str> {
    bars.last().and_then(|bar| bar.time_key.as_deref())
}

async fn poll_loop(
    upstream: Arc<dyn MarketDataUpstream>,
    sink: EventSink,
    instrument: InstrumentId,
    config: PollingConfig,
    cancel: CancellationToken,
) {
    let mut last_seen: Option<String> = None;

    loop {
        let result = tokio::select! {
            () = cancel.cancelled() => break,
            result = upstream.fetch_recent_bars(&instrument, config.limit) => result,
        };

        match result {
            Ok(bars) if bars.is_empty() => {}
            Ok(bars) => {
                let newest = newest_time_key(&bars).map(str::to_string);
                if newest.is_some() && newest == last_seen {
                    tracing::trace!(instrument = %instrument, "Minute bars unchanged");
                } else {
                    if newest.is_some() {
                        last_seen = newest;
                    }
                    sink.submit(CanonicalEvent::new(
                        instrument.clone(),
                        EventPayload::Kline(bars),
                    ));
                }
            }
            Err(e) => {
                tracing::warn!(instrument = %instrument, error = %e, "Minute bar poll failed");
                metrics::record_upstream_failure(UpstreamOperation::FetchBars);
            }
        }

        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(config.interval) => {}
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
