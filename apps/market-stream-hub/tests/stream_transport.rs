//! Stream and Health Endpoint Integration Tests
//!
//! Exercises the axum routers in-process with `tower::ServiceExt::oneshot`.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::response::Response;
use futures::StreamExt;
use rust_decimal_macros::dec;
use serde_json::{Value, json};
use tower::ServiceExt;

use market_stream_hub::application::ports::PushHandler;
use market_stream_hub::{
    CanonicalEvent, ConnectionState, EngineSettings, EventKind, EventPayload, FanoutEngine,
    FeedState, HealthServer, HealthServerState, KlineBar, MarketDataUpstream, QuotePayload,
    StreamRuntime, StreamServer, UpstreamError,
};

struct QuietUpstream;

#[async_trait]
impl MarketDataUpstream for QuietUpstream {
    fn register_handler(&self, _kind: EventKind, _handler: PushHandler) {}

    fn start(&self) -> Result<(), UpstreamError> {
        Ok(())
    }

    async fn subscribe(&self, _instrument: &str, _kinds: &[EventKind]) -> Result<(), UpstreamError> {
        Ok(())
    }

    async fn unsubscribe(
        &self,
        _instrument: &str,
        _kinds: &[EventKind],
    ) -> Result<(), UpstreamError> {
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

fn start_runtime() -> StreamRuntime {
    StreamRuntime::start(EngineSettings::default(), Arc::new(QuietUpstream), None).unwrap()
}

async fn send(
    engine: &Arc<FanoutEngine>,
    method: Method,
    uri: &str,
    body: Option<Value>,
) -> Response {
    let request = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => request
            .header("content-type", "application/json")
            .body(Body::from(body.to_string())),
        None => request.body(Body::empty()),
    }
    .unwrap();
    StreamServer::router(Arc::clone(engine))
        .oneshot(request)
        .await
        .unwrap()
}

async fn json_body(response: Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

/// First `data:` payload of an SSE response.
async fn first_event(response: Response) -> Value {
    let mut stream = response.into_body().into_data_stream();
    let chunk = tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await
        .expect("event within a second")
        .expect("stream open")
        .unwrap();
    let text = String::from_utf8(chunk.to_vec()).unwrap();
    let data = text
        .lines()
        .find_map(|line| line.strip_prefix("data:"))
        .expect("data line");
    serde_json::from_str(data.trim()).unwrap()
}

// =============================================================================
// Sessions
// =============================================================================

#[tokio::test]
async fn create_list_and_delete_session() {
    let runtime = start_runtime();
    let engine = runtime.engine();

    let created = send(
        &engine,
        Method::POST,
        "/api/dashboard/sessions",
        Some(json!({"instrument": " HK.00700 "})),
    )
    .await;
    assert_eq!(created.status(), StatusCode::CREATED);
    let created = json_body(created).await;
    let session_id = created["session_id"].as_str().unwrap().to_string();
    assert_eq!(created["instrument"], "HK.00700");
    assert!(engine.registry().is_active("HK.00700"));

    let listed = json_body(send(&engine, Method::GET, "/api/dashboard/sessions", None).await).await;
    assert_eq!(listed["sessions"][0]["session_id"], session_id.as_str());
    assert_eq!(listed["sessions"][0]["attached"], false);
    assert_eq!(listed["stats"]["active_instruments"], 1);

    let uri = format!("/api/dashboard/sessions/{session_id}");
    let deleted = send(&engine, Method::DELETE, &uri, None).await;
    assert_eq!(deleted.status(), StatusCode::NO_CONTENT);
    assert!(!engine.registry().is_active("HK.00700"));

    let again = send(&engine, Method::DELETE, &uri, None).await;
    assert_eq!(again.status(), StatusCode::NOT_FOUND);

    runtime.shutdown().await;
}

#[tokio::test]
async fn blank_instrument_is_rejected() {
    let runtime = start_runtime();
    let response = send(
        &runtime.engine(),
        Method::POST,
        "/api/dashboard/sessions",
        Some(json!({"instrument": "  "})),
    )
    .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["error"], "instrument is required");
    runtime.shutdown().await;
}

// =============================================================================
// Event Stream
// =============================================================================

#[tokio::test]
async fn stream_starts_with_cached_snapshot() {
    let runtime = start_runtime();
    let engine = runtime.engine();
    engine.register("s1", "HK.00700").await;
    engine.ingest(CanonicalEvent::new(
        "HK.00700",
        EventPayload::Quote(QuotePayload {
            price: dec!(320.2),
            change_rate: dec!(0.5),
            ..QuotePayload::default()
        }),
    ));

    let response = send(&engine, Method::GET, "/api/dashboard/sse/s1", None).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "text/event-stream");

    let event = first_event(response).await;
    assert_eq!(event["code"], "HK.00700");
    assert_eq!(event["quote"]["price"], 320.2);
    assert!(event.get("heartbeat").is_none());

    runtime.shutdown().await;
}

#[tokio::test]
async fn stream_delivers_heartbeats_for_requested_instrument() {
    let runtime = start_runtime();
    let engine = runtime.engine();

    let response = send(
        &engine,
        Method::GET,
        "/api/dashboard/sse/s1?instrument=US.AAPL",
        None,
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(engine.sessions()[0].attached);

    engine.broadcast_heartbeat("US.AAPL");
    let event = first_event(response).await;
    assert_eq!(event["code"], "US.AAPL");
    assert_eq!(event["heartbeat"], true);

    runtime.shutdown().await;
}

#[tokio::test]
async fn dropping_the_stream_releases_the_queue() {
    let runtime = start_runtime();
    let engine = runtime.engine();

    let response = send(
        &engine,
        Method::GET,
        "/api/dashboard/sse/s1?instrument=HK.00700",
        None,
    )
    .await;
    assert_eq!(engine.stats().attached_sessions, 1);

    drop(response);
    assert_eq!(engine.stats().attached_sessions, 0);
    assert!(engine.has_session("s1"));
    assert!(engine.registry().is_active("HK.00700"));

    runtime.shutdown().await;
}

#[tokio::test]
async fn stream_for_unknown_session_without_instrument_is_not_found() {
    let runtime = start_runtime();
    let response = send(&runtime.engine(), Method::GET, "/api/dashboard/sse/nobody", None).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    runtime.shutdown().await;
}

#[tokio::test]
async fn stream_for_another_instrument_is_rejected() {
    let runtime = start_runtime();
    let engine = runtime.engine();
    engine.register("s1", "HK.00700").await;

    let response = send(
        &engine,
        Method::GET,
        "/api/dashboard/sse/s1?instrument=US.AAPL",
        None,
    )
    .await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(engine.registry().instruments_of("s1"), vec!["HK.00700".to_string()]);
    assert!(!engine.registry().is_active("US.AAPL"));

    let same = send(
        &engine,
        Method::GET,
        "/api/dashboard/sse/s1?instrument=HK.00700",
        None,
    )
    .await;
    assert_eq!(same.status(), StatusCode::OK);

    runtime.shutdown().await;
}

// =============================================================================
// Health
// =============================================================================

async fn health_get(state: &Arc<HealthServerState>, uri: &str) -> Response {
    HealthServer::router(Arc::clone(state))
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap()
}

#[tokio::test]
async fn health_reflects_gateway_connection() {
    let runtime = start_runtime();
    let engine = runtime.engine();
    engine.register("s1", "HK.00700").await;

    let feed = Arc::new(FeedState::default());
    let state = Arc::new(HealthServerState::new(
        "test-0.0.1".to_string(),
        Arc::clone(&engine),
        Arc::clone(&feed),
    ));

    assert_eq!(health_get(&state, "/healthz").await.status(), StatusCode::OK);
    assert_eq!(
        health_get(&state, "/readyz").await.status(),
        StatusCode::SERVICE_UNAVAILABLE
    );

    feed.set_state(ConnectionState::Connected);
    assert_eq!(health_get(&state, "/readyz").await.status(), StatusCode::OK);

    let health = health_get(&state, "/health").await;
    assert_eq!(health.status(), StatusCode::OK);
    let body = json_body(health).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["version"], "test-0.0.1");
    assert_eq!(body["gateway"]["state"], "connected");
    assert_eq!(body["engine"]["sessions"], 1);
    assert_eq!(body["engine"]["upstream_subscriptions"], 1);

    feed.set_state(ConnectionState::Failed);
    let health = health_get(&state, "/health").await;
    assert_eq!(health.status(), StatusCode::SERVICE_UNAVAILABLE);

    runtime.shutdown().await;
}
