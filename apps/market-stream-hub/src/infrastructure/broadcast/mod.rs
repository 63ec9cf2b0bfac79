//! Fan-out Engine
//!
//! Owns the session table and routes every canonical event to the sessions
//! subscribed to its instrument.
//!
//! # Architecture
//!
//! ```text
//! upstream push / polling ──► EventSink ──► pump ──► FanoutEngine::ingest
//!                                                       │
//!                                   StateCache::update ─┤ (dedup)
//!                                                       ▼
//!                              compose snapshot ──► SessionQueue × N ──► SSE
//! ```
//!
//! The engine composes a full per-instrument snapshot on every accepted
//! change, so a consumer only ever needs the latest message it received.
//! Each session owns a bounded [`SessionQueue`]; a slow consumer loses its
//! oldest messages and never slows down the others.
//!
//! Locks are never held across `.await`. Upstream calls happen after the
//! session table lock has been released.

mod queue;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

pub use queue::{PushOutcome, QueueClosed, SessionQueue};

use crate::application::ports::MinuteBarStore;
use crate::application::services::PollingFallback;
use crate::domain::state::StateCache;
use crate::domain::streaming::{
    CanonicalEvent, EventPayload, KlineBar, SharedMessage, StreamMessage,
};
use crate::domain::subscription::{InstrumentId, SessionId, SubscriptionRegistry};
use crate::infrastructure::config::EngineSettings;
use crate::infrastructure::metrics;
use crate::infrastructure::upstream::UpstreamBridge;

// =============================================================================
// Session Table
// =============================================================================

#[derive(Debug)]
struct SessionSlot {
    queue: Option<Arc<SessionQueue>>,
    created_at: DateTime<Utc>,
    last_seen: Instant,
}

impl SessionSlot {
    fn new() -> Self {
        Self {
            queue: None,
            created_at: Utc::now(),
            last_seen: Instant::now(),
        }
    }

    fn release(&mut self) -> usize {
        self.queue.take().map_or(0, |queue| queue.close_and_drain())
    }
}

/// Read-only view of one session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    /// Session identifier.
    pub session_id: SessionId,
    /// Instruments the session is registered for.
    pub instruments: Vec<InstrumentId>,
    /// When the session was first seen.
    pub created_at: DateTime<Utc>,
    /// Seconds since the last attach or touch.
    pub idle_secs: u64,
    /// Messages waiting in the outbound queue.
    pub queued: usize,
    /// Whether a transport currently holds the queue.
    pub attached: bool,
}

/// Outcome of one broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Queues the message was appended to.
    pub delivered: usize,
    /// Deliveries that evicted an older message.
    pub evicted: usize,
    /// Subscribers without an attached queue.
    pub skipped: usize,
}

/// Engine-wide counts.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct EngineStats {
    /// Known sessions.
    pub sessions: usize,
    /// Sessions with an attached queue.
    pub attached_sessions: usize,
    /// Instruments with at least one subscriber.
    pub active_instruments: usize,
    /// Instruments with cached state.
    pub cached_instruments: usize,
    /// Instruments holding an upstream subscription.
    pub upstream_subscriptions: usize,
    /// Running minute bar polling loops.
    pub polling_tasks: usize,
}

// =============================================================================
// Fan-out Engine
// =============================================================================

/// Session-aware broadcaster.
pub struct FanoutEngine {
    settings: EngineSettings,
    registry: Arc<SubscriptionRegistry>,
    cache: Arc<StateCache>,
    sessions: RwLock<HashMap<SessionId, SessionSlot>>,
    bridge: Arc<UpstreamBridge>,
    polling: Arc<PollingFallback>,
    store: Option<Arc<dyn MinuteBarStore>>,
}

impl std::fmt::Debug for FanoutEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanoutEngine")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl FanoutEngine {
    /// Create an engine with empty session and state tables.
    #[must_use]
    pub fn new(
        settings: EngineSettings,
        bridge: Arc<UpstreamBridge>,
        polling: Arc<PollingFallback>,
        store: Option<Arc<dyn MinuteBarStore>>,
    ) -> Self {
        Self {
            settings,
            registry: Arc::new(SubscriptionRegistry::new()),
            cache: Arc::new(StateCache::new()),
            sessions: RwLock::new(HashMap::new()),
            bridge,
            polling,
            store,
        }
    }

    /// Subscription registry.
    #[must_use]
    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    /// State cache.
    #[must_use]
    pub fn cache(&self) -> &StateCache {
        &self.cache
    }

    /// Engine settings.
    #[must_use]
    pub const fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    // =========================================================================
    // Session Lifecycle
    // =========================================================================

    /// Attach a transport for `session` watching `instrument`.
    ///
    /// Registers the pair, replaces any previous queue of the session with a
    /// fresh one, and seeds it with the cached snapshot of the instrument so
    /// the snapshot is always the first message the transport reads.
    pub async fn attach(&self, session: &str, instrument: &str) -> Arc<SessionQueue> {
        let queue = Arc::new(SessionQueue::new(self.settings.queue_capacity));
        let changes = {
            let mut sessions = self.sessions.write();
            let slot = sessions
                .entry(session.to_string())
                .or_insert_with(SessionSlot::new);
            let discarded = slot.release();
            if discarded > 0 {
                tracing::debug!(session, discarded, "Replaced previous session queue");
            }
            slot.last_seen = Instant::now();
            slot.queue = Some(Arc::clone(&queue));

            let changes = self.registry.register(session, instrument);
            if let Some(snapshot) = self.cache.compose_snapshot(instrument) {
                let _ = queue.push(snapshot);
            }
            changes
        };

        if !changes.activated.is_empty() {
            tracing::info!(instrument, "Instrument activated");
        }
        tracing::info!(session, instrument, "Session attached");
        self.publish_gauges();
        self.ensure_upstream(instrument).await;
        queue
    }

    /// Register interest without attaching a transport.
    pub async fn register(&self, session: &str, instrument: &str) {
        let changes = {
            let mut sessions = self.sessions.write();
            sessions
                .entry(session.to_string())
                .or_insert_with(SessionSlot::new)
                .last_seen = Instant::now();
            self.registry.register(session, instrument)
        };

        if !changes.activated.is_empty() {
            tracing::info!(instrument, "Instrument activated");
        }
        tracing::info!(session, instrument, "Session registered");
        self.publish_gauges();
        self.ensure_upstream(instrument).await;
    }

    /// Close the session's queue and discard what it buffered.
    ///
    /// Registry membership is kept; the stale reaper removes it if the
    /// session never comes back. Returns `false` when no queue was attached.
    pub fn release(&self, session: &str) -> bool {
        let released = self
            .sessions
            .write()
            .get_mut(session)
            .and_then(|slot| {
                let queue = slot.queue.take()?;
                slot.last_seen = Instant::now();
                Some(queue.close_and_drain())
            });
        match released {
            Some(discarded) => {
                tracing::info!(session, discarded, "Session released");
                true
            }
            None => false,
        }
    }

    /// Release only if `queue` is still the session's current queue.
    ///
    /// A transport that has been replaced by a newer attach must not close
    /// the newer queue on its way out.
    pub fn release_if_current(&self, session: &str, queue: &Arc<SessionQueue>) -> bool {
        let mut sessions = self.sessions.write();
        let Some(slot) = sessions.get_mut(session) else {
            queue.close_and_drain();
            return false;
        };
        let is_current = slot
            .queue
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, queue));
        if !is_current {
            drop(sessions);
            queue.close_and_drain();
            return false;
        }
        let discarded = slot.release();
        slot.last_seen = Instant::now();
        drop(sessions);
        tracing::info!(session, discarded, "Session released");
        true
    }

    /// Remove `session` entirely and tear down instruments nobody watches anymore.
    pub async fn detach(&self, session: &str) -> bool {
        let (existed, changes) = {
            let mut sessions = self.sessions.write();
            let existed = sessions
                .remove(session)
                .map(|mut slot| slot.release())
                .is_some();
            (existed, self.registry.unregister(session))
        };

        if existed {
            tracing::info!(session, "Session detached");
        }
        self.publish_gauges();
        for instrument in &changes.deactivated {
            self.teardown_instrument(instrument).await;
        }
        existed
    }

    /// Refresh the session's idle timer.
    pub fn touch(&self, session: &str) -> bool {
        self.sessions
            .write()
            .get_mut(session)
            .map(|slot| slot.last_seen = Instant::now())
            .is_some()
    }

    /// Detach every session idle longer than `stale_after`.
    ///
    /// Attached sessions are not exempt: a live transport touches its session
    /// on every delivered message, heartbeats included, so only a hung
    /// transport goes stale. Detaching closes its queue and ends the stream.
    pub async fn reap_stale(&self, stale_after: Duration) -> Vec<SessionId> {
        let stale: Vec<SessionId> = self
            .sessions
            .read()
            .iter()
            .filter(|(_, slot)| slot.last_seen.elapsed() > stale_after)
            .map(|(session, _)| session.clone())
            .collect();

        for session in &stale {
            tracing::info!(session = %session, "Reaping stale session");
            self.detach(session).await;
            metrics::record_session_reaped();
        }
        stale
    }

    // =========================================================================
    // Delivery
    // =========================================================================

    /// Append `message` to every attached subscriber of `instrument`.
    pub fn broadcast(&self, instrument: &str, message: &SharedMessage) -> BroadcastReport {
        let subscribers = self.registry.subscribers_of(instrument);
        if subscribers.is_empty() {
            return BroadcastReport::default();
        }

        let mut report = BroadcastReport::default();
        let queues: Vec<Arc<SessionQueue>> = {
            let sessions = self.sessions.read();
            subscribers
                .iter()
                .filter_map(|session| {
                    let queue = sessions.get(session).and_then(|slot| slot.queue.clone());
                    if queue.is_none() {
                        report.skipped += 1;
                    }
                    queue
                })
                .collect()
        };

        for queue in queues {
            match queue.push(Arc::clone(message)) {
                Ok(PushOutcome::Enqueued) => report.delivered += 1,
                Ok(PushOutcome::EvictedOldest) => {
                    report.delivered += 1;
                    report.evicted += 1;
                }
                Err(QueueClosed) => report.skipped += 1,
            }
        }

        metrics::record_messages_delivered(report.delivered as u64);
        if report.evicted > 0 {
            tracing::debug!(instrument, evicted = report.evicted, "Slow consumers lost messages");
            metrics::record_messages_evicted(report.evicted as u64);
        }
        report
    }

    /// Send a liveness heartbeat to the subscribers of `instrument`.
    pub fn broadcast_heartbeat(&self, instrument: &str) -> BroadcastReport {
        self.broadcast(instrument, &Arc::new(StreamMessage::heartbeat(instrument)))
    }

    /// Apply one canonical event.
    ///
    /// Events for instruments nobody watches are dropped. Heartbeats bypass
    /// the cache. Every other event updates the cache and, when it changed
    /// the instrument's broadcast state, fans the composed snapshot out and
    /// writes minute bars through to the store.
    pub fn ingest(&self, event: CanonicalEvent) -> BroadcastReport {
        let started = Instant::now();
        let kind = event.kind();
        metrics::record_event_received(kind);

        if matches!(event.payload, EventPayload::Heartbeat) {
            return self.broadcast_heartbeat(&event.instrument);
        }
        if !self.registry.is_active(&event.instrument) {
            tracing::debug!(instrument = %event.instrument, kind = %kind, "Dropping event for inactive instrument");
            return BroadcastReport::default();
        }

        let instrument = event.instrument;
        let bars = match &event.payload {
            EventPayload::Kline(bars) => Some(bars.clone()),
            _ => None,
        };
        if !self.cache.update(&instrument, event.payload) {
            tracing::trace!(instrument = %instrument, kind = %kind, "Duplicate state suppressed");
            metrics::record_event_deduplicated(kind);
            return BroadcastReport::default();
        }
        if let Some(bars) = bars {
            self.persist_bars(&instrument, bars);
        }

        let report = self
            .cache
            .compose_snapshot(&instrument)
            .map(|message| self.broadcast(&instrument, &message))
            .unwrap_or_default();
        metrics::record_ingest_duration(kind, started.elapsed());
        report
    }

    fn persist_bars(&self, instrument: &str, bars: Vec<KlineBar>) {
        let Some(store) = self.store.clone() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::debug!(instrument, "No runtime available, skipping minute bar write");
            return;
        };

        let instrument = instrument.to_string();
        let retention = self.settings.kline_retention;
        runtime.spawn_blocking(move || {
            let result = store
                .save_batch(&instrument, &bars)
                .and_then(|_| store.prune(&instrument, retention));
            if let Err(e) = result {
                tracing::warn!(instrument = %instrument, error = %e, "Failed to persist minute bars");
                metrics::record_persistence_failure();
            }
        });
    }

    // =========================================================================
    // Upstream Coordination
    // =========================================================================

    /// Make sure an active instrument holds an upstream subscription and a
    /// polling loop.
    pub async fn ensure_upstream(&self, instrument: &str) {
        if !self.registry.is_active(instrument) {
            return;
        }
        if !self.bridge.ensure_subscribed(instrument).await {
            return;
        }
        // The last subscriber may have left while the request was in flight
        if self.registry.is_active(instrument) {
            self.polling.start(instrument);
        } else {
            self.teardown_instrument(instrument).await;
        }
    }

    /// Release upstream resources of an instrument that lost its last subscriber.
    pub async fn teardown_instrument(&self, instrument: &str) {
        if self.registry.is_active(instrument) {
            return;
        }
        self.polling.stop(instrument).await;
        self.bridge.ensure_unsubscribed(instrument).await;
        self.cache.evict(instrument);
        tracing::info!(instrument, "Instrument torn down");
    }

    /// Tear down every instrument the bridge or poller still tracks but
    /// nobody watches.
    pub async fn sweep_orphans(&self) -> Vec<InstrumentId> {
        let mut tracked = self.bridge.tracked_instruments();
        tracked.extend(self.polling.instruments());
        tracked.sort_unstable();
        tracked.dedup();

        let orphans: Vec<InstrumentId> = tracked
            .into_iter()
            .filter(|instrument| !self.registry.is_active(instrument))
            .collect();
        for instrument in &orphans {
            self.teardown_instrument(instrument).await;
        }
        orphans
    }

    /// Detach every session and stop every upstream resource.
    pub async fn shutdown(&self) {
        let sessions: Vec<SessionId> = self.sessions.read().keys().cloned().collect();
        for session in &sessions {
            self.detach(session).await;
        }
        self.sweep_orphans().await;
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Snapshot of the session table.
    #[must_use]
    pub fn sessions(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.read();
        let mut infos: Vec<SessionInfo> = sessions
            .iter()
            .map(|(session, slot)| {
                let mut instruments = self.registry.instruments_of(session);
                instruments.sort_unstable();
                SessionInfo {
                    session_id: session.clone(),
                    instruments,
                    created_at: slot.created_at,
                    idle_secs: slot.last_seen.elapsed().as_secs(),
                    queued: slot.queue.as_ref().map_or(0, |queue| queue.len()),
                    attached: slot.queue.is_some(),
                }
            })
            .collect();
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        infos
    }

    /// Whether `session` is known.
    #[must_use]
    pub fn has_session(&self, session: &str) -> bool {
        self.sessions.read().contains_key(session)
    }

    /// Engine-wide counts.
    #[must_use]
    pub fn stats(&self) -> EngineStats {
        let (sessions, attached_sessions) = {
            let sessions = self.sessions.read();
            let attached = sessions.values().filter(|slot| slot.queue.is_some()).count();
            (sessions.len(), attached)
        };
        EngineStats {
            sessions,
            attached_sessions,
            active_instruments: self.registry.stats().instrument_count,
            cached_instruments: self.cache.len(),
            upstream_subscriptions: self.bridge.subscribed_count(),
            polling_tasks: self.polling.instruments().len(),
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn publish_gauges(&self) {
        let stats = self.registry.stats();
        metrics::set_active_sessions(stats.session_count as f64);
        metrics::set_active_instruments(stats.instrument_count as f64);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use rust_decimal_macros::dec;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::application::ports::{MockMarketDataUpstream, MockMinuteBarStore};
    use crate::application::services::{EventSink, PollingConfig};
    use crate::domain::streaming::{EventKind, QuotePayload};

    fn quiet_upstream() -> MockMarketDataUpstream {
        let mut mock = MockMarketDataUpstream::new();
        mock.expect_subscribe().returning(|_, _| Ok(()));
        mock.expect_unsubscribe().returning(|_, _| Ok(()));
        mock.expect_fetch_recent_bars().returning(|_, _| Ok(vec![]));
        mock
    }

    fn engine_with(mock: MockMarketDataUpstream, queue_capacity: usize) -> FanoutEngine {
        let upstream: Arc<dyn crate::application::ports::MarketDataUpstream> = Arc::new(mock);
        let (sink, _rx) = EventSink::channel(16);
        let bridge = Arc::new(UpstreamBridge::new(Arc::clone(&upstream)));
        let polling = Arc::new(PollingFallback::new(
            upstream,
            sink,
            PollingConfig {
                interval: Duration::from_secs(3600),
                limit: 10,
            },
            CancellationToken::new(),
        ));
        let settings = EngineSettings {
            queue_capacity,
            ..EngineSettings::default()
        };
        FanoutEngine::new(settings, bridge, polling, None)
    }

    fn quote_event(instrument: &str, price: rust_decimal::Decimal) -> CanonicalEvent {
        CanonicalEvent::new(
            instrument,
            EventPayload::Quote(QuotePayload {
                price,
                change_rate: dec!(0.5),
                update_time: Some("10:00:00".to_string()),
                ..QuotePayload::default()
            }),
        )
    }

    #[tokio::test]
    async fn attach_seeds_queue_with_snapshot() {
        let engine = engine_with(quiet_upstream(), 8);
        let _first = engine.attach("s1", "HK.00700").await;
        engine.ingest(quote_event("HK.00700", dec!(320)));

        let queue = engine.attach("s2", "HK.00700").await;
        let message = queue.try_pop().unwrap();
        let snapshot = message.as_snapshot().unwrap();
        assert_eq!(snapshot.quote.as_ref().unwrap().price, dec!(320));
    }

    #[tokio::test]
    async fn duplicate_quotes_are_broadcast_once() {
        let engine = engine_with(quiet_upstream(), 8);
        let queue = engine.attach("s1", "HK.00700").await;

        assert_eq!(engine.ingest(quote_event("HK.00700", dec!(320))).delivered, 1);
        assert_eq!(engine.ingest(quote_event("HK.00700", dec!(320))).delivered, 0);
        assert_eq!(engine.ingest(quote_event("HK.00700", dec!(321))).delivered, 1);
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn events_for_inactive_instruments_are_dropped() {
        let engine = engine_with(quiet_upstream(), 8);
        let report = engine.ingest(quote_event("US.AAPL", dec!(190)));
        assert_eq!(report, BroadcastReport::default());
        assert!(engine.cache().is_empty());
    }

    #[tokio::test]
    async fn slow_consumer_keeps_newest_messages() {
        let engine = engine_with(quiet_upstream(), 2);
        let slow = engine.attach("slow", "HK.00700").await;
        let fast = engine.attach("fast", "HK.00700").await;

        for price in [dec!(1), dec!(2), dec!(3)] {
            engine.ingest(quote_event("HK.00700", price));
            fast.try_pop();
        }

        assert_eq!(slow.evicted(), 1);
        let prices: Vec<_> = std::iter::from_fn(|| slow.try_pop())
            .map(|m| m.as_snapshot().unwrap().quote.as_ref().unwrap().price)
            .collect();
        assert_eq!(prices, vec![dec!(2), dec!(3)]);
    }

    #[tokio::test]
    async fn heartbeat_reaches_subscribers_without_touching_cache() {
        let engine = engine_with(quiet_upstream(), 8);
        let queue = engine.attach("s1", "HK.00700").await;

        let report = engine.ingest(CanonicalEvent::new("HK.00700", EventPayload::Heartbeat));
        assert_eq!(report.delivered, 1);
        assert!(queue.try_pop().unwrap().is_heartbeat());
        assert!(engine.cache().is_empty());
    }

    #[tokio::test]
    async fn release_keeps_registration_and_detach_tears_down() {
        let mut mock = MockMarketDataUpstream::new();
        mock.expect_subscribe()
            .withf(|instrument, kinds| instrument == "HK.00700" && kinds == EventKind::PUSHED)
            .times(1)
            .returning(|_, _| Ok(()));
        mock.expect_unsubscribe().times(1).returning(|_, _| Ok(()));
        mock.expect_fetch_recent_bars().returning(|_, _| Ok(vec![]));
        let engine = engine_with(mock, 8);

        let queue = engine.attach("s1", "HK.00700").await;
        assert!(engine.release("s1"));
        assert!(queue.is_closed());
        assert!(engine.registry().is_active("HK.00700"));
        assert!(!engine.release("s1"));

        assert!(engine.detach("s1").await);
        assert!(!engine.registry().is_active("HK.00700"));
        assert_eq!(engine.stats().upstream_subscriptions, 0);
        assert_eq!(engine.stats().polling_tasks, 0);
    }

    #[tokio::test]
    async fn reattach_replaces_queue() {
        let engine = engine_with(quiet_upstream(), 8);
        let old = engine.attach("s1", "HK.00700").await;
        let new = engine.attach("s1", "HK.00700").await;

        assert!(old.is_closed());
        assert!(!engine.release_if_current("s1", &old));
        assert!(!new.is_closed());
        assert!(engine.release_if_current("s1", &new));
        assert!(new.is_closed());
    }

    #[tokio::test]
    async fn reap_removes_idle_sessions_with_or_without_transport() {
        let engine = engine_with(quiet_upstream(), 8);
        let hung = engine.attach("hung", "HK.00700").await;
        engine.register("idle", "US.AAPL").await;

        let mut reaped = engine.reap_stale(Duration::ZERO).await;
        reaped.sort_unstable();
        assert_eq!(reaped, vec!["hung".to_string(), "idle".to_string()]);
        assert!(hung.is_closed());
        assert!(engine.registry().subscribers_of("HK.00700").is_empty());
        assert!(!engine.registry().is_active("US.AAPL"));
        assert_eq!(engine.stats().upstream_subscriptions, 0);
    }

    #[tokio::test]
    async fn touched_session_survives_reap() {
        let engine = engine_with(quiet_upstream(), 8);
        let _queue = engine.attach("live", "HK.00700").await;
        engine.touch("live");

        assert!(engine.reap_stale(Duration::from_secs(60)).await.is_empty());
        assert!(engine.has_session("live"));
    }

    #[tokio::test]
    async fn duplicate_minute_bars_are_written_once() {
        let saves = Arc::new(AtomicUsize::new(0));
        let mut store = MockMinuteBarStore::new();
        {
            let saves = Arc::clone(&saves);
            store.expect_save_batch().returning(move |_, bars| {
                saves.fetch_add(1, Ordering::SeqCst);
                Ok(bars.len())
            });
        }
        store.expect_prune().returning(|_, _| Ok(0));

        let mut engine = engine_with(quiet_upstream(), 8);
        engine.store = Some(Arc::new(store));
        let queue = engine.attach("s1", "HK.00700").await;

        let bars = vec![KlineBar {
            time_key: Some("2024-05-02 09:30:00".to_string()),
            close: Some(dec!(320.4)),
            ..KlineBar::default()
        }];
        let first = engine.ingest(CanonicalEvent::new("HK.00700", EventPayload::Kline(bars.clone())));
        let repeat = engine.ingest(CanonicalEvent::new("HK.00700", EventPayload::Kline(bars)));
        assert_eq!(first.delivered, 1);
        assert_eq!(repeat.delivered, 0);
        assert_eq!(queue.len(), 1);

        tokio::time::timeout(Duration::from_secs(1), async {
            while saves.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(saves.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn sessions_report_registrations() {
        let engine = engine_with(quiet_upstream(), 8);
        engine.register("s1", "US.AAPL").await;
        let _queue = engine.attach("s1", "HK.00700").await;

        let sessions = engine.sessions();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].instruments, vec!["HK.00700", "US.AAPL"]);
        assert!(sessions[0].attached);
    }
}
