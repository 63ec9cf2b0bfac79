//! Market Gateway Client
//!
//! [`MarketDataUpstream`] adapter for the local market gateway.
//!
//! # Push
//!
//! A WebSocket connection delivers frames of the form
//! `{"subtype": "QUOTE", "data": [rows...]}`. The connection runs on a
//! dedicated OS thread with its own single-threaded runtime, so the
//! registered handlers are always invoked outside the engine's runtime.
//! The thread pings the gateway, treats prolonged silence as a dead
//! connection, and reconnects with exponential backoff. After a reconnect
//! every subscription made through this client is replayed.
//!
//! # Requests
//!
//! | Operation | Request |
//! |-----------|---------|
//! | subscribe | `POST /subscribe {"code_list": [..], "subtype_list": [..]}` |
//! | unsubscribe | `POST /unsubscribe` (same body) |
//! | minute bars | `GET /kline?code=..&num=..&ktype=K_1M&autype=qfq` |
//!
//! Replies are `{"ret": 0, "msg": "...", "data": ...}`; a non-zero `ret` is a
//! rejection.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use super::backoff::{Backoff, BackoffConfig};
use super::normalize::parse_kline_rows;
use crate::application::ports::{MarketDataUpstream, PushHandler, UpstreamError};
use crate::domain::streaming::{EventKind, KlineBar};
use crate::domain::subscription::InstrumentId;
use crate::infrastructure::config::GatewaySettings;
use crate::infrastructure::metrics;

// =============================================================================
// Feed State
// =============================================================================

/// Push connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Not started or stopped.
    Disconnected,
    /// First connection attempt in progress.
    Connecting,
    /// Receiving frames.
    Connected,
    /// Waiting to retry after a failure.
    Reconnecting,
    /// Reconnect attempts exhausted.
    Failed,
}

impl ConnectionState {
    /// Lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        }
    }
}

/// Observable state of the push connection, shared with the health server.
#[derive(Debug)]
pub struct FeedState {
    state: RwLock<ConnectionState>,
    last_connected_at: RwLock<Option<DateTime<Utc>>>,
    last_error: RwLock<Option<String>>,
    reconnect_attempts: AtomicU32,
    frames_received: AtomicU64,
}

impl Default for FeedState {
    fn default() -> Self {
        Self {
            state: RwLock::new(ConnectionState::Disconnected),
            last_connected_at: RwLock::new(None),
            last_error: RwLock::new(None),
            reconnect_attempts: AtomicU32::new(0),
            frames_received: AtomicU64::new(0),
        }
    }
}

impl FeedState {
    /// Set the connection state.
    pub fn set_state(&self, state: ConnectionState) {
        *self.state.write() = state;
        if state == ConnectionState::Connected {
            *self.last_connected_at.write() = Some(Utc::now());
            *self.last_error.write() = None;
            self.reconnect_attempts.store(0, Ordering::Relaxed);
        }
    }

    /// Remember the most recent connection error.
    pub fn set_error(&self, message: String) {
        *self.last_error.write() = Some(message);
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Whether frames are flowing.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Last time the connection was established.
    #[must_use]
    pub fn last_connected_at(&self) -> Option<DateTime<Utc>> {
        *self.last_connected_at.read()
    }

    /// Most recent connection error.
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    /// Reconnect attempts since the last successful connection.
    #[must_use]
    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::Relaxed)
    }

    /// Frames received over the client's lifetime.
    #[must_use]
    pub fn frames_received(&self) -> u64 {
        self.frames_received.load(Ordering::Relaxed)
    }

    fn record_frame(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    fn record_reconnect_attempt(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }
}

// =============================================================================
// Frames
// =============================================================================

/// Push frame decoding error.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// Frame is not valid JSON or lacks the envelope fields.
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Subtype the client does not handle.
    #[error("unknown subtype: {0}")]
    UnknownSubtype(String),
}

#[derive(Debug, Deserialize)]
struct PushFrame {
    subtype: String,
    #[serde(default)]
    data: Value,
}

/// Decode one push frame into its kind and rows.
///
/// A single object in `data` is treated as a one-row batch.
///
/// # Errors
///
/// Returns [`FrameError`] for malformed frames and unknown subtypes.
pub fn decode_frame(text: &str) -> Result<(EventKind, Vec<Value>), FrameError> {
    let frame: PushFrame = serde_json::from_str(text)?;
    let kind = EventKind::from_vendor_subtype(&frame.subtype)
        .ok_or(FrameError::UnknownSubtype(frame.subtype))?;
    let rows = match frame.data {
        Value::Array(rows) => rows,
        Value::Null => Vec::new(),
        row => vec![row],
    };
    Ok((kind, rows))
}

type HandlerTable = Arc<RwLock<HashMap<EventKind, PushHandler>>>;

fn dispatch(text: &str, handlers: &HandlerTable, feed: &FeedState) {
    feed.record_frame();
    match decode_frame(text) {
        Ok((kind, rows)) => {
            if rows.is_empty() {
                return;
            }
            let handler = handlers.read().get(&kind).cloned();
            match handler {
                Some(handler) => handler(rows),
                None => tracing::trace!(kind = %kind, "No handler registered"),
            }
        }
        Err(FrameError::UnknownSubtype(subtype)) => {
            tracing::trace!(subtype = %subtype, "Ignoring frame with unknown subtype");
        }
        Err(e) => tracing::debug!(error = %e, "Dropping undecodable frame"),
    }
}

// =============================================================================
// REST Replies
// =============================================================================

#[derive(Debug, Deserialize)]
struct GatewayReply {
    ret: i64,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    data: Value,
}

impl GatewayReply {
    fn into_data(self) -> Result<Value, UpstreamError> {
        if self.ret == 0 {
            Ok(self.data)
        } else {
            Err(UpstreamError::rejected(
                self.msg
                    .unwrap_or_else(|| format!("gateway returned ret={}", self.ret)),
            ))
        }
    }
}

fn map_request_error(e: &reqwest::Error) -> UpstreamError {
    if e.is_timeout() {
        UpstreamError::Timeout
    } else if e.is_decode() {
        UpstreamError::InvalidResponse {
            message: e.to_string(),
        }
    } else {
        UpstreamError::connection(e.to_string())
    }
}

fn subtype_list(kinds: &[EventKind]) -> Vec<&'static str> {
    kinds.iter().filter_map(|kind| kind.vendor_subtype()).collect()
}

#[derive(Debug, Clone)]
struct RestClient {
    http: reqwest::Client,
    base_url: String,
}

impl RestClient {
    fn new(settings: &GatewaySettings) -> Result<Self, UpstreamError> {
        let http = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .build()
            .map_err(|e| UpstreamError::connection(e.to_string()))?;
        Ok(Self {
            http,
            base_url: settings.rest_url.trim_end_matches('/').to_string(),
        })
    }

    async fn read_reply(response: reqwest::Response) -> Result<Value, UpstreamError> {
        let status = response.status();
        if !status.is_success() {
            return Err(UpstreamError::rejected(format!("gateway returned HTTP {status}")));
        }
        response
            .json::<GatewayReply>()
            .await
            .map_err(|e| UpstreamError::InvalidResponse {
                message: e.to_string(),
            })?
            .into_data()
    }

    async fn post_subscription(
        &self,
        path: &str,
        instrument: &str,
        kinds: &[EventKind],
    ) -> Result<(), UpstreamError> {
        let body = json!({
            "code_list": [instrument],
            "subtype_list": subtype_list(kinds),
        });
        let response = self
            .http
            .post(format!("{}{path}", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| map_request_error(&e))?;
        Self::read_reply(response).await.map(|_| ())
    }

    async fn fetch_kline(&self, instrument: &str, limit: usize) -> Result<Vec<KlineBar>, UpstreamError> {
        let num = limit.to_string();
        let response = self
            .http
            .get(format!("{}/kline", self.base_url))
            .query(&[
                ("code", instrument),
                ("num", num.as_str()),
                ("ktype", "K_1M"),
                ("autype", "qfq"),
            ])
            .send()
            .await
            .map_err(|e| map_request_error(&e))?;

        match Self::read_reply(response).await? {
            Value::Array(rows) => Ok(parse_kline_rows(&rows)),
            Value::Null => Ok(Vec::new()),
            other => Err(UpstreamError::InvalidResponse {
                message: format!("expected a list of bars, got {other}"),
            }),
        }
    }
}

// =============================================================================
// Gateway Client
// =============================================================================

type SubscriptionBook = Arc<Mutex<HashMap<InstrumentId, Vec<EventKind>>>>;

/// Market gateway adapter.
pub struct GatewayClient {
    settings: GatewaySettings,
    rest: RestClient,
    handlers: HandlerTable,
    subscriptions: SubscriptionBook,
    feed: Arc<FeedState>,
    cancel: CancellationToken,
    push_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl std::fmt::Debug for GatewayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayClient")
            .field("push_url", &self.settings.push_url)
            .field("rest_url", &self.settings.rest_url)
            .field("state", &self.feed.state())
            .finish_non_exhaustive()
    }
}

impl GatewayClient {
    /// Create a client. Nothing connects until [`MarketDataUpstream::start`].
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(settings: GatewaySettings, cancel: CancellationToken) -> Result<Self, UpstreamError> {
        Ok(Self {
            rest: RestClient::new(&settings)?,
            settings,
            handlers: Arc::default(),
            subscriptions: Arc::default(),
            feed: Arc::new(FeedState::default()),
            cancel,
            push_thread: Mutex::new(None),
        })
    }

    /// Push connection state, shared with the health server.
    #[must_use]
    pub fn feed_state(&self) -> Arc<FeedState> {
        Arc::clone(&self.feed)
    }

    /// Stop the push thread and wait for it to exit.
    pub fn stop(&self) {
        self.cancel.cancel();
        let handle = self.push_thread.lock().take();
        if let Some(handle) = handle
            && handle.join().is_err()
        {
            tracing::warn!("Gateway push thread panicked");
        }
    }
}

#[async_trait]
impl MarketDataUpstream for GatewayClient {
    fn register_handler(&self, kind: EventKind, handler: PushHandler) {
        self.handlers.write().insert(kind, handler);
    }

    fn start(&self) -> Result<(), UpstreamError> {
        let mut slot = self.push_thread.lock();
        if slot.is_some() {
            return Ok(());
        }

        let worker = PushWorker {
            url: self.settings.push_url.clone(),
            ping_interval: self.settings.ping_interval,
            pong_timeout: self.settings.pong_timeout,
            backoff: BackoffConfig::from(&self.settings),
            rest: self.rest.clone(),
            handlers: Arc::clone(&self.handlers),
            subscriptions: Arc::clone(&self.subscriptions),
            feed: Arc::clone(&self.feed),
            cancel: self.cancel.clone(),
        };

        let handle = std::thread::Builder::new()
            .name("gateway-push".to_string())
            .spawn(move || worker.run_blocking())
            .map_err(|e| UpstreamError::connection(format!("failed to spawn push thread: {e}")))?;
        *slot = Some(handle);
        tracing::info!(url = %self.settings.push_url, "Gateway push thread started");
        Ok(())
    }

    async fn subscribe(&self, instrument: &str, kinds: &[EventKind]) -> Result<(), UpstreamError> {
        self.rest.post_subscription("/subscribe", instrument, kinds).await?;
        self.subscriptions
            .lock()
            .insert(instrument.to_string(), kinds.to_vec());
        tracing::debug!(instrument, kinds = ?subtype_list(kinds), "Gateway subscription added");
        Ok(())
    }

    async fn unsubscribe(&self, instrument: &str, kinds: &[EventKind]) -> Result<(), UpstreamError> {
        self.rest.post_subscription("/unsubscribe", instrument, kinds).await?;
        self.subscriptions.lock().remove(instrument);
        tracing::debug!(instrument, "Gateway subscription removed");
        Ok(())
    }

    async fn fetch_recent_bars(
        &self,
        instrument: &str,
        limit: usize,
    ) -> Result<Vec<KlineBar>, UpstreamError> {
        self.rest.fetch_kline(instrument, limit).await
    }
}

// =============================================================================
// Push Worker
// =============================================================================

#[derive(Debug, thiserror::Error)]
enum PushError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("no traffic for {0:?}")]
    Silent(Duration),
    #[error("connection closed by gateway")]
    Closed,
}

struct PushWorker {
    url: String,
    ping_interval: Duration,
    pong_timeout: Duration,
    backoff: BackoffConfig,
    rest: RestClient,
    handlers: HandlerTable,
    subscriptions: SubscriptionBook,
    feed: Arc<FeedState>,
    cancel: CancellationToken,
}

impl PushWorker {
    fn run_blocking(self) {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                tracing::error!(error = %e, "Failed to build push runtime");
                self.feed.set_error(e.to_string());
                self.feed.set_state(ConnectionState::Failed);
                return;
            }
        };
        runtime.block_on(self.run());
    }

    async fn run(self) {
        let mut backoff = Backoff::new(self.backoff.clone());
        let mut connected_before = false;
        self.feed.set_state(ConnectionState::Connecting);

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            match self.connect_and_read(&mut backoff, connected_before).await {
                Ok(()) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "Gateway push connection lost");
                    self.feed.set_error(e.to_string());
                }
            }
            connected_before |= self.feed.last_connected_at().is_some();

            let Some(delay) = backoff.next_delay() else {
                tracing::error!(attempts = backoff.attempts(), "Gateway reconnect attempts exhausted");
                self.feed.set_state(ConnectionState::Failed);
                return;
            };
            self.feed.set_state(ConnectionState::Reconnecting);
            self.feed.record_reconnect_attempt();
            metrics::record_reconnect();
            tracing::info!(
                attempt = backoff.attempts(),
                delay_ms = delay.as_millis(),
                "Reconnecting to gateway push"
            );

            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }

        self.feed.set_state(ConnectionState::Disconnected);
        tracing::info!("Gateway push thread stopped");
    }

    async fn connect_and_read(
        &self,
        backoff: &mut Backoff,
        replay: bool,
    ) -> Result<(), PushError> {
        let (stream, _response) = tokio::select! {
            () = self.cancel.cancelled() => return Ok(()),
            result = tokio_tungstenite::connect_async(self.url.as_str()) => result?,
        };
        let (mut write, mut read) = stream.split();

        backoff.reset();
        self.feed.set_state(ConnectionState::Connected);
        tracing::info!(url = %self.url, "Gateway push connected");
        if replay {
            self.replay_subscriptions().await;
        }

        let mut ping = tokio::time::interval(self.ping_interval);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last_traffic = Instant::now();

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
                _ = ping.tick() => {
                    let silent = last_traffic.elapsed();
                    if silent > self.pong_timeout {
                        return Err(PushError::Silent(silent));
                    }
                    write.send(Message::Ping(Vec::new().into())).await?;
                }
                message = read.next() => {
                    last_traffic = Instant::now();
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            dispatch(text.as_str(), &self.handlers, &self.feed);
                        }
                        Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                            Ok(text) => dispatch(text, &self.handlers, &self.feed),
                            Err(_) => tracing::debug!(len = data.len(), "Dropping non-UTF-8 frame"),
                        },
                        Some(Ok(Message::Ping(data))) => {
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => return Err(PushError::Closed),
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                    }
                }
            }
        }
    }

    async fn replay_subscriptions(&self) {
        let book: Vec<(InstrumentId, Vec<EventKind>)> = self
            .subscriptions
            .lock()
            .iter()
            .map(|(instrument, kinds)| (instrument.clone(), kinds.clone()))
            .collect();
        if book.is_empty() {
            return;
        }

        tracing::info!(count = book.len(), "Replaying gateway subscriptions");
        for (instrument, kinds) in book {
            if let Err(e) = self
                .rest
                .post_subscription("/subscribe", &instrument, &kinds)
                .await
            {
                tracing::warn!(instrument = %instrument, error = %e, "Failed to replay subscription");
                metrics::record_upstream_failure(metrics::UpstreamOperation::Subscribe);
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
