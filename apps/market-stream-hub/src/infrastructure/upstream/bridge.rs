//! Upstream Bridge
//!
//! Binds one normalizer per pushed kind to the upstream connection and
//! tracks the upstream subscription state of every instrument.
//!
//! # State machine (per instrument)
//!
//! ```text
//! Unsubscribed ──► Subscribing ──► Subscribed ──► Unsubscribed
//!                      │   ▲
//!                      ▼   │ (guard retry)
//!                 SubscribeFailed
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;

use super::normalize;
use crate::application::ports::{MarketDataUpstream, PushHandler, UpstreamError};
use crate::application::services::EventSink;
use crate::domain::streaming::EventKind;
use crate::domain::subscription::InstrumentId;
use crate::infrastructure::metrics::{self, UpstreamOperation};

/// Upstream subscription state of one instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamState {
    /// No upstream subscription.
    Unsubscribed,
    /// Subscribe request in flight.
    Subscribing,
    /// Subscribed for every pushed kind.
    Subscribed,
    /// Last subscribe attempt failed; the guard retries.
    SubscribeFailed,
}

impl UpstreamState {
    /// Get the state name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unsubscribed => "unsubscribed",
            Self::Subscribing => "subscribing",
            Self::Subscribed => "subscribed",
            Self::SubscribeFailed => "subscribe_failed",
        }
    }
}

/// Tracked state plus the subscribe attempt that owns it.
#[derive(Debug, Clone, Copy)]
struct Entry {
    state: UpstreamState,
    generation: u64,
}

/// How a completed subscribe request relates to the tracked entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    Owned,
    Superseded,
    TornDown,
}

/// Bridge between the upstream connection and the engine.
pub struct UpstreamBridge {
    upstream: Arc<dyn MarketDataUpstream>,
    states: Mutex<HashMap<InstrumentId, Entry>>,
    generations: AtomicU64,
    started: AtomicBool,
}

impl std::fmt::Debug for UpstreamBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamBridge")
            .field("states", &*self.states.lock())
            .field("started", &self.started.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl UpstreamBridge {
    /// Create a bridge over `upstream`.
    #[must_use]
    pub fn new(upstream: Arc<dyn MarketDataUpstream>) -> Self {
        Self {
            upstream,
            states: Mutex::new(HashMap::new()),
            generations: AtomicU64::new(0),
            started: AtomicBool::new(false),
        }
    }

    fn entry(&self, state: UpstreamState) -> Entry {
        Entry {
            state,
            generation: self.generations.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Register a normalizing handler for every pushed kind.
    ///
    /// Handlers only normalize and submit to `sink`; they never touch
    /// engine state and never panic into the vendor thread.
    pub fn bind(&self, sink: &EventSink) {
        for kind in EventKind::PUSHED.iter().copied() {
            let sink = sink.clone();
            let handler: PushHandler = Arc::new(move |rows: Vec<serde_json::Value>| {
                let outcome = normalize::normalize(kind, &rows);
                if outcome.rejected > 0 {
                    tracing::warn!(
                        kind = %kind,
                        rejected = outcome.rejected,
                        reason = ?outcome.first_error,
                        "Dropped malformed upstream records"
                    );
                    metrics::record_malformed_records(kind, outcome.rejected as u64);
                }
                for event in outcome.events {
                    sink.submit(event);
                }
            });
            self.upstream.register_handler(kind, handler);
        }
        tracing::info!(kinds = EventKind::PUSHED.len(), "Upstream push handlers registered");
    }

    /// Start the upstream delivery worker. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns the upstream error if the worker could not be started; a
    /// later call retries.
    pub fn start(&self) -> Result<(), UpstreamError> {
        if self
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }
        if let Err(e) = self.upstream.start() {
            self.started.store(false, Ordering::SeqCst);
            tracing::error!(error = %e, "Failed to start upstream delivery");
            return Err(e);
        }
        tracing::info!("Upstream delivery started");
        Ok(())
    }

    /// Whether the delivery worker has been started.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Subscribe `instrument` upstream unless already subscribed or in flight.
    ///
    /// Returns `true` when this call established the subscription or found
    /// it established. Failures leave it in [`UpstreamState::SubscribeFailed`].
    ///
    /// Each attempt is tagged with a generation and only the attempt owning
    /// the tracked entry settles it. An attempt whose entry was removed by a
    /// teardown rolls its subscription back; if a newer attempt appeared in
    /// the meantime, the rollback may have undone it, so the entry is
    /// reclaimed and subscribed again.
    pub async fn ensure_subscribed(&self, instrument: &str) -> bool {
        let mut generation = {
            let mut states = self.states.lock();
            match states.get(instrument).map(|entry| entry.state) {
                Some(UpstreamState::Subscribed) => return true,
                Some(UpstreamState::Subscribing) => return false,
                _ => {
                    let entry = self.entry(UpstreamState::Subscribing);
                    states.insert(instrument.to_string(), entry);
                    entry.generation
                }
            }
        };

        loop {
            let result = self
                .upstream
                .subscribe(instrument, EventKind::PUSHED)
                .await;
            let outcome = self.settle(instrument, generation, result.is_ok());
            self.publish_gauge();

            match (result, outcome) {
                (Ok(()), Attempt::Owned) => {
                    tracing::info!(instrument, "Upstream subscription established");
                    return true;
                }
                (Ok(()), Attempt::Superseded) => {
                    tracing::debug!(instrument, "Subscribe superseded by a newer attempt");
                    return false;
                }
                (Ok(()), Attempt::TornDown) => {
                    tracing::info!(instrument, "Instrument released during subscribe, rolling back");
                    if let Err(e) = self.upstream.unsubscribe(instrument, EventKind::PUSHED).await {
                        tracing::warn!(instrument, error = %e, "Rollback unsubscribe failed");
                        metrics::record_upstream_failure(UpstreamOperation::Unsubscribe);
                    }
                    match self.reclaim(instrument) {
                        Some(next) => {
                            tracing::info!(instrument, "Rollback overlapped a newer subscribe, resubscribing");
                            generation = next;
                        }
                        None => return false,
                    }
                }
                (Err(e), _) => {
                    tracing::warn!(instrument, error = %e, "Upstream subscribe failed, guard will retry");
                    metrics::record_upstream_failure(UpstreamOperation::Subscribe);
                    return false;
                }
            }
        }
    }

    /// Record the result of the attempt tagged `generation`.
    fn settle(&self, instrument: &str, generation: u64, succeeded: bool) -> Attempt {
        let mut states = self.states.lock();
        match states.get_mut(instrument) {
            Some(entry) if entry.generation == generation => {
                entry.state = if succeeded {
                    UpstreamState::Subscribed
                } else {
                    UpstreamState::SubscribeFailed
                };
                Attempt::Owned
            }
            Some(_) => Attempt::Superseded,
            None => Attempt::TornDown,
        }
    }

    /// Take over an entry created after a teardown, unless its attempt failed.
    fn reclaim(&self, instrument: &str) -> Option<u64> {
        let mut states = self.states.lock();
        let entry = states.get_mut(instrument)?;
        if entry.state == UpstreamState::SubscribeFailed {
            return None;
        }
        *entry = self.entry(UpstreamState::Subscribing);
        Some(entry.generation)
    }

    /// Unsubscribe `instrument` upstream if it is subscribed.
    ///
    /// Returns `true` when no upstream subscription remains. On failure the
    /// instrument stays [`UpstreamState::Subscribed`] so the guard sweep
    /// retries the teardown.
    pub async fn ensure_unsubscribed(&self, instrument: &str) -> bool {
        let previous = self.states.lock().remove(instrument).map(|entry| entry.state);
        match previous {
            None | Some(UpstreamState::SubscribeFailed) => return true,
            // The in-flight subscribe sees the missing entry and rolls back
            Some(UpstreamState::Subscribing) => return true,
            Some(UpstreamState::Unsubscribed | UpstreamState::Subscribed) => {}
        }

        let result = self
            .upstream
            .unsubscribe(instrument, EventKind::PUSHED)
            .await;

        let released = match result {
            Ok(()) => {
                tracing::info!(instrument, "Upstream subscription released");
                true
            }
            Err(e) => {
                tracing::warn!(instrument, error = %e, "Upstream unsubscribe failed");
                metrics::record_upstream_failure(UpstreamOperation::Unsubscribe);
                let entry = self.entry(UpstreamState::Subscribed);
                self.states
                    .lock()
                    .entry(instrument.to_string())
                    .or_insert(entry);
                false
            }
        };
        self.publish_gauge();
        released
    }

    /// Current state of `instrument`.
    #[must_use]
    pub fn state(&self, instrument: &str) -> UpstreamState {
        self.states
            .lock()
            .get(instrument)
            .map_or(UpstreamState::Unsubscribed, |entry| entry.state)
    }

    /// Instruments holding (or acquiring) an upstream subscription.
    #[must_use]
    pub fn tracked_instruments(&self) -> Vec<InstrumentId> {
        self.states.lock().keys().cloned().collect()
    }

    /// Number of instruments in [`UpstreamState::Subscribed`].
    #[must_use]
    pub fn subscribed_count(&self) -> usize {
        self.states
            .lock()
            .values()
            .filter(|entry| entry.state == UpstreamState::Subscribed)
            .count()
    }

    /// The wrapped upstream connection.
    #[must_use]
    pub fn upstream(&self) -> Arc<dyn MarketDataUpstream> {
        Arc::clone(&self.upstream)
    }

    #[allow(clippy::cast_precision_loss)]
    fn publish_gauge(&self) {
        metrics::set_upstream_subscriptions(self.subscribed_count() as f64);
    }
}

// =============================================================================
// Tests
// =============================================================================
