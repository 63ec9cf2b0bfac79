//! Dashboard Stream Server
//!
//! Session management and Server-Sent Events transport over the engine.
//!
//! # Endpoints
//!
//! - `POST /api/dashboard/sessions` - register a session for an instrument
//! - `GET /api/dashboard/sessions` - list sessions
//! - `DELETE /api/dashboard/sessions/{session_id}` - detach a session
//! - `GET /api/dashboard/sse/{session_id}?instrument=...` - event stream; a
//!   session registered for another instrument is rejected with 409
//!
//! A stream holds a lease on the session's queue. When the client goes
//! away the lease is dropped and the queue released; the registration stays
//! until the session is deleted or reaped as stale.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get};
use axum::{Json, Router};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::domain::subscription::SessionId;
use crate::infrastructure::broadcast::{EngineStats, FanoutEngine, SessionInfo, SessionQueue};

// =============================================================================
// Requests and Responses
// =============================================================================

/// Body of a session creation request.
#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    /// Instrument to watch, e.g. `HK.00700`.
    pub instrument: String,
}

/// Reply to a session creation request.
#[derive(Debug, Serialize, Deserialize)]
pub struct CreateSessionResponse {
    /// New session identifier.
    pub session_id: SessionId,
    /// Instrument the session was registered for.
    pub instrument: String,
}

/// Session listing.
#[derive(Debug, Serialize)]
pub struct SessionList {
    /// Known sessions, oldest first.
    pub sessions: Vec<SessionInfo>,
    /// Engine-wide counts.
    pub stats: EngineStats,
}

/// Query of the event stream endpoint.
#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    /// Instrument to attach to; defaults to the session's registration.
    pub instrument: Option<String>,
}

/// Request error returned as `{"error": "..."}`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Instrument missing or blank.
    #[error("instrument is required")]
    MissingInstrument,

    /// Unknown session.
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    /// Session is registered for a different instrument.
    #[error("session {session_id} is registered for {registered}, not {requested}")]
    InstrumentMismatch {
        /// Session identifier.
        session_id: SessionId,
        /// Instrument the session was registered for.
        registered: String,
        /// Instrument the stream asked for.
        requested: String,
    },
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::MissingInstrument => StatusCode::BAD_REQUEST,
            Self::SessionNotFound(_) => StatusCode::NOT_FOUND,
            Self::InstrumentMismatch { .. } => StatusCode::CONFLICT,
        };
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

fn normalize_instrument(instrument: Option<&str>) -> Option<String> {
    instrument
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

// =============================================================================
// Server
// =============================================================================

/// Dashboard HTTP server.
pub struct StreamServer {
    port: u16,
    engine: Arc<FanoutEngine>,
    cancel: CancellationToken,
}

impl StreamServer {
    /// Create a server over `engine`.
    #[must_use]
    pub const fn new(port: u16, engine: Arc<FanoutEngine>, cancel: CancellationToken) -> Self {
        Self {
            port,
            engine,
            cancel,
        }
    }

    /// Routes served by the stream server.
    pub fn router(engine: Arc<FanoutEngine>) -> Router {
        Router::new()
            .route(
                "/api/dashboard/sessions",
                get(list_sessions).post(create_session),
            )
            .route("/api/dashboard/sessions/{session_id}", delete(delete_session))
            .route("/api/dashboard/sse/{session_id}", get(stream_events))
            .with_state(engine)
    }

    /// Serve until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HttpServerError` if binding fails or the server stops abnormally.
    pub async fn run(self) -> Result<(), HttpServerError> {
        let app = Self::router(self.engine);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HttpServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "Stream server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HttpServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Stream server stopped");
        Ok(())
    }
}

/// Stream server errors.
#[derive(Debug, thiserror::Error)]
pub enum HttpServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Handlers
// =============================================================================

async fn create_session(
    State(engine): State<Arc<FanoutEngine>>,
    Json(request): Json<CreateSessionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let instrument =
        normalize_instrument(Some(&request.instrument)).ok_or(ApiError::MissingInstrument)?;
    let session_id = uuid::Uuid::new_v4().to_string();
    engine.register(&session_id, &instrument).await;

    Ok((
        StatusCode::CREATED,
        Json(CreateSessionResponse {
            session_id,
            instrument,
        }),
    ))
}

async fn list_sessions(State(engine): State<Arc<FanoutEngine>>) -> Json<SessionList> {
    Json(SessionList {
        sessions: engine.sessions(),
        stats: engine.stats(),
    })
}

async fn delete_session(
    State(engine): State<Arc<FanoutEngine>>,
    Path(session_id): Path<SessionId>,
) -> Result<StatusCode, ApiError> {
    if engine.detach(&session_id).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::SessionNotFound(session_id))
    }
}

async fn stream_events(
    State(engine): State<Arc<FanoutEngine>>,
    Path(session_id): Path<SessionId>,
    Query(query): Query<StreamQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let mut registered = engine.registry().instruments_of(&session_id);
    registered.sort_unstable();

    // A dashboard session watches exactly one instrument
    let instrument = match (normalize_instrument(query.instrument.as_deref()), registered.first()) {
        (Some(requested), Some(current)) if requested != *current => {
            return Err(ApiError::InstrumentMismatch {
                session_id,
                registered: current.clone(),
                requested,
            });
        }
        (Some(requested), _) => requested,
        (None, Some(current)) => current.clone(),
        (None, None) => return Err(ApiError::SessionNotFound(session_id)),
    };

    let queue = engine.attach(&session_id, &instrument).await;
    let lease = QueueLease {
        engine,
        session_id,
        queue,
    };
    Ok(Sse::new(event_stream(lease)).keep_alive(KeepAlive::default()))
}

// =============================================================================
// Event Stream
// =============================================================================

/// Releases the session's queue when the stream is dropped.
struct QueueLease {
    engine: Arc<FanoutEngine>,
    session_id: SessionId,
    queue: Arc<SessionQueue>,
}

impl Drop for QueueLease {
    fn drop(&mut self) {
        if self.engine.release_if_current(&self.session_id, &self.queue) {
            tracing::debug!(session_id = %self.session_id, "Stream client disconnected");
        }
    }
}

fn event_stream(lease: QueueLease) -> impl Stream<Item = Result<Event, Infallible>> {
    futures::stream::unfold(lease, |lease| async move {
        let message = lease.queue.pop().await?;
        let event = Event::default().json_data(&*message).unwrap_or_else(|e| {
            tracing::warn!(error = %e, code = %message.code, "Failed to serialize stream message");
            Event::default().comment("serialization error")
        });
        lease.engine.touch(&lease.session_id);
        Some((Ok(event), lease))
    })
}
