//! Fan-out Engine Integration Tests
//!
//! Drives a full `StreamRuntime` through a scripted upstream: subscription
//! reference counting, deduplication, snapshot-first delivery, stale session
//! reaping and minute bar write-through.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use proptest::prelude::*;
use serde_json::{Value, json};
use tokio::time::timeout;

use market_stream_hub::application::ports::PushHandler;
use market_stream_hub::domain::streaming::SharedMessage;
use market_stream_hub::infrastructure::upstream::UpstreamState;
use market_stream_hub::{
    EngineSettings, EventKind, InMemoryMinuteBarStore, KlineBar, MarketDataUpstream,
    MinuteBarStore, SessionQueue, StreamRuntime, UpstreamError,
};

// =============================================================================
// Scripted Upstream
// =============================================================================

#[derive(Default)]
struct ScriptedUpstream {
    handlers: Mutex<HashMap<EventKind, PushHandler>>,
    subscribes: Mutex<HashMap<String, usize>>,
    unsubscribes: Mutex<HashMap<String, usize>>,
}

impl ScriptedUpstream {
    fn push(&self, kind: EventKind, rows: Vec<Value>) {
        let handler = self.handlers.lock().get(&kind).cloned().unwrap();
        handler(rows);
    }

    fn subscribes(&self, instrument: &str) -> usize {
        self.subscribes.lock().get(instrument).copied().unwrap_or(0)
    }

    fn unsubscribes(&self, instrument: &str) -> usize {
        self.unsubscribes.lock().get(instrument).copied().unwrap_or(0)
    }
}

#[async_trait]
impl MarketDataUpstream for ScriptedUpstream {
    fn register_handler(&self, kind: EventKind, handler: PushHandler) {
        self.handlers.lock().insert(kind, handler);
    }

    fn start(&self) -> Result<(), UpstreamError> {
        Ok(())
    }

    async fn subscribe(&self, instrument: &str, _kinds: &[EventKind]) -> Result<(), UpstreamError> {
        *self
            .subscribes
            .lock()
            .entry(instrument.to_string())
            .or_default() += 1;
        Ok(())
    }

    async fn unsubscribe(
        &self,
        instrument: &str,
        _kinds: &[EventKind],
    ) -> Result<(), UpstreamError> {
        *self
            .unsubscribes
            .lock()
            .entry(instrument.to_string())
            .or_default() += 1;
        Ok(())
    }

    async fn fetch_recent_bars(
        &self,
        _instrument: &str,
        _limit: usize,
    ) -> Result<Vec<KlineBar>, UpstreamError> {
        Ok(Vec::new())
    }
}

fn start_runtime(
    upstream: &Arc<ScriptedUpstream>,
    store: Option<Arc<dyn MinuteBarStore>>,
) -> StreamRuntime {
    let upstream: Arc<dyn MarketDataUpstream> = upstream.clone();
    StreamRuntime::start(EngineSettings::default(), upstream, store).unwrap()
}

async fn next_message(queue: &SessionQueue) -> SharedMessage {
    timeout(Duration::from_secs(1), queue.pop())
        .await
        .expect("message within a second")
        .expect("queue open")
}

fn quote_row(code: &str, price: f64) -> Value {
    json!({"code": code, "last_price": price, "change_rate": 0.8, "volume": 1200})
}

// =============================================================================
// Subscription Reference Counting
// =============================================================================

#[tokio::test]
async fn shared_instrument_subscribes_once_and_unsubscribes_after_last_session() {
    let upstream = Arc::new(ScriptedUpstream::default());
    let runtime = start_runtime(&upstream, None);
    let engine = runtime.engine();

    let _a = engine.attach("A", "SYM1").await;
    assert_eq!(upstream.subscribes("SYM1"), 1);

    let _b = engine.attach("B", "SYM1").await;
    assert_eq!(upstream.subscribes("SYM1"), 1);

    assert!(engine.detach("A").await);
    assert_eq!(upstream.unsubscribes("SYM1"), 0);
    assert_eq!(runtime.bridge().state("SYM1"), UpstreamState::Subscribed);

    assert!(engine.detach("B").await);
    assert_eq!(upstream.unsubscribes("SYM1"), 1);
    assert_eq!(runtime.bridge().state("SYM1"), UpstreamState::Unsubscribed);
    assert!(!engine.registry().is_active("SYM1"));

    runtime.shutdown().await;
    assert_eq!(upstream.unsubscribes("SYM1"), 1);
}

#[tokio::test]
async fn reattach_does_not_resubscribe() {
    let upstream = Arc::new(ScriptedUpstream::default());
    let runtime = start_runtime(&upstream, None);
    let engine = runtime.engine();

    let first = engine.attach("A", "HK.00700").await;
    let second = engine.attach("A", "HK.00700").await;

    assert!(first.is_closed());
    assert!(!second.is_closed());
    assert_eq!(upstream.subscribes("HK.00700"), 1);

    runtime.shutdown().await;
}

// =============================================================================
// Delivery
// =============================================================================

#[tokio::test]
async fn identical_quotes_are_delivered_once() {
    let upstream = Arc::new(ScriptedUpstream::default());
    let runtime = start_runtime(&upstream, None);
    let queue = runtime.engine().attach("A", "HK.00700").await;

    upstream.push(EventKind::Quote, vec![quote_row("HK.00700", 320.2)]);
    upstream.push(EventKind::Quote, vec![quote_row("HK.00700", 320.2)]);
    upstream.push(EventKind::Quote, vec![quote_row("HK.00700", 320.4)]);

    let first = next_message(&queue).await;
    let second = next_message(&queue).await;

    let price = |message: &SharedMessage| {
        message.as_snapshot().unwrap().quote.as_ref().unwrap().price
    };
    assert_eq!(price(&first).to_string(), "320.2");
    assert_eq!(price(&second).to_string(), "320.4");
    assert!(queue.is_empty());

    runtime.shutdown().await;
}

#[tokio::test]
async fn late_session_reads_cached_snapshot_first() {
    let upstream = Arc::new(ScriptedUpstream::default());
    let runtime = start_runtime(&upstream, None);
    let engine = runtime.engine();

    let early = engine.attach("A", "HK.00700").await;
    upstream.push(EventKind::Quote, vec![quote_row("HK.00700", 320.2)]);
    next_message(&early).await;

    let late = engine.attach("B", "HK.00700").await;
    let first = late.try_pop().expect("snapshot seeded on attach");
    let snapshot = first.as_snapshot().unwrap();
    assert_eq!(snapshot.quote.as_ref().unwrap().price.to_string(), "320.2");
    assert!(snapshot.order_book.is_none());

    runtime.shutdown().await;
}

#[tokio::test]
async fn records_for_unwatched_instruments_are_dropped() {
    let upstream = Arc::new(ScriptedUpstream::default());
    let runtime = start_runtime(&upstream, None);
    let engine = runtime.engine();
    let queue = engine.attach("A", "HK.00700").await;

    upstream.push(EventKind::Quote, vec![quote_row("US.AAPL", 189.5)]);
    upstream.push(EventKind::Quote, vec![quote_row("HK.00700", 320.2)]);

    let message = next_message(&queue).await;
    assert_eq!(message.code, "HK.00700");
    assert_eq!(engine.cache().len(), 1);

    runtime.shutdown().await;
}

#[tokio::test]
async fn heartbeats_reach_attached_sessions() {
    let upstream = Arc::new(ScriptedUpstream::default());
    let runtime = start_runtime(&upstream, None);
    let engine = runtime.engine();
    let queue = engine.attach("A", "HK.00700").await;

    let report = engine.broadcast_heartbeat("HK.00700");
    assert_eq!(report.delivered, 1);
    assert!(next_message(&queue).await.is_heartbeat());

    runtime.shutdown().await;
}

// =============================================================================
// Session Lifecycle
// =============================================================================

#[tokio::test]
async fn stale_session_is_reaped_and_instrument_released() {
    let upstream = Arc::new(ScriptedUpstream::default());
    let runtime = start_runtime(&upstream, None);
    let engine = runtime.engine();

    engine.register("idle", "HK.00700").await;
    let queue = engine.attach("live", "HK.00005").await;
    engine.release_if_current("live", &queue);

    tokio::time::sleep(Duration::from_millis(50)).await;
    engine.touch("live");
    let reaped = engine.reap_stale(Duration::from_millis(20)).await;

    assert_eq!(reaped, vec!["idle".to_string()]);
    assert!(!engine.has_session("idle"));
    assert!(engine.registry().subscribers_of("HK.00700").is_empty());
    assert_eq!(upstream.unsubscribes("HK.00700"), 1);
    assert!(engine.has_session("live"));

    runtime.shutdown().await;
}

#[tokio::test]
async fn hung_transport_is_reaped_and_its_stream_ended() {
    let upstream = Arc::new(ScriptedUpstream::default());
    let runtime = start_runtime(&upstream, None);
    let engine = runtime.engine();
    let queue = engine.attach("S", "SYM1").await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    let reaped = engine.reap_stale(Duration::from_millis(10)).await;

    assert_eq!(reaped, vec!["S".to_string()]);
    assert!(queue.is_closed());
    assert!(engine.registry().subscribers_of("SYM1").is_empty());
    assert_eq!(upstream.unsubscribes("SYM1"), 1);
    assert_eq!(runtime.bridge().state("SYM1"), UpstreamState::Unsubscribed);

    runtime.shutdown().await;
}

#[tokio::test]
async fn shutdown_closes_queues_and_releases_upstream() {
    let upstream = Arc::new(ScriptedUpstream::default());
    let runtime = start_runtime(&upstream, None);
    let engine = runtime.engine();
    let a = engine.attach("A", "HK.00700").await;
    let b = engine.attach("B", "US.AAPL").await;

    runtime.shutdown().await;

    assert!(a.is_closed());
    assert!(b.is_closed());
    assert_eq!(upstream.unsubscribes("HK.00700"), 1);
    assert_eq!(upstream.unsubscribes("US.AAPL"), 1);
    assert_eq!(engine.stats().sessions, 0);
    assert_eq!(engine.stats().polling_tasks, 0);
}

// =============================================================================
// Minute Bars
// =============================================================================

#[tokio::test]
async fn pushed_minute_bars_are_written_through() {
    let upstream = Arc::new(ScriptedUpstream::default());
    let store = Arc::new(InMemoryMinuteBarStore::new());
    let runtime = start_runtime(&upstream, Some(store.clone()));
    let queue = runtime.engine().attach("A", "HK.00700").await;

    upstream.push(
        EventKind::Kline,
        vec![
            json!({"code": "HK.00700", "time_key": "2024-05-02 09:30:00", "open": 320, "close": 320.4}),
            json!({"code": "HK.00700", "time_key": "2024-05-02 09:31:00", "open": 320.4, "cur_price": 321}),
        ],
    );

    let message = next_message(&queue).await;
    let bars = message.as_snapshot().unwrap().kline.clone().unwrap();
    assert_eq!(bars.len(), 2);

    timeout(Duration::from_secs(1), async {
        while store.count("HK.00700") < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("bars persisted");

    let stored = store.fetch_recent("HK.00700", 10).unwrap();
    assert_eq!(stored[1].close.unwrap().to_string(), "321");

    runtime.shutdown().await;
}

// =============================================================================
// Upstream Consistency
// =============================================================================

#[derive(Debug, Clone)]
enum Step {
    Attach(u8, u8),
    Register(u8, u8),
    Release(u8),
    Detach(u8),
    Reap,
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        (0u8..4, 0u8..3).prop_map(|(s, i)| Step::Attach(s, i)),
        (0u8..4, 0u8..3).prop_map(|(s, i)| Step::Register(s, i)),
        (0u8..4).prop_map(Step::Release),
        (0u8..4).prop_map(Step::Detach),
        Just(Step::Reap),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn upstream_subscribed_iff_instrument_watched(steps in prop::collection::vec(step(), 1..40)) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let upstream = Arc::new(ScriptedUpstream::default());
            let runtime = start_runtime(&upstream, None);
            let engine = runtime.engine();

            for step in steps {
                match step {
                    Step::Attach(s, i) => {
                        engine.attach(&format!("s{s}"), &format!("I{i}")).await;
                    }
                    Step::Register(s, i) => {
                        engine.register(&format!("s{s}"), &format!("I{i}")).await;
                    }
                    Step::Release(s) => {
                        engine.release(&format!("s{s}"));
                    }
                    Step::Detach(s) => {
                        engine.detach(&format!("s{s}")).await;
                    }
                    Step::Reap => {
                        engine.reap_stale(Duration::ZERO).await;
                    }
                }

                for i in 0..3u8 {
                    let instrument = format!("I{i}");
                    let watched = engine.registry().is_active(&instrument);
                    prop_assert_eq!(
                        runtime.bridge().state(&instrument) == UpstreamState::Subscribed,
                        watched
                    );
                    let held = upstream
                        .subscribes(&instrument)
                        .checked_sub(upstream.unsubscribes(&instrument));
                    prop_assert_eq!(held, Some(usize::from(watched)));
                }
            }

            runtime.shutdown().await;
            for i in 0..3u8 {
                let instrument = format!("I{i}");
                prop_assert_eq!(upstream.subscribes(&instrument), upstream.unsubscribes(&instrument));
            }
            Ok::<(), TestCaseError>(())
        })?;
    }
}
