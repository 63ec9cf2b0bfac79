#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Market Stream Hub - Real-time market data fan-out
//!
//! Keeps at most one upstream subscription per instrument against a
//! market-data gateway and fans normalized events out to any number of
//! dashboard sessions over Server-Sent Events.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: pure data and bookkeeping
//!   - `streaming`: canonical events, snapshots, stream envelopes
//!   - `subscription`: session ↔ instrument registry
//!   - `state`: last-known state and deduplication
//!
//! - **Application**: ports and orchestration
//!   - `ports`: gateway and bar storage contracts
//!   - `services`: event hand-off, polling fallback, liveness guard, runtime
//!
//! - **Infrastructure**: adapters
//!   - `upstream`: gateway client, normalization, subscription bridge
//!   - `broadcast`: fan-out engine and session queues
//!   - `persistence`: SQLite and in-memory minute-bar stores
//!   - `http` / `health`: SSE and health endpoints
//!
//! # Data Flow
//!
//! ```text
//!  gateway push ──► normalize ──► hand-off queue ──► FanoutEngine ──► session queue ──► SSE
//!  REST polling ─────────────────────┘                  │
//!                                                       ├──► StateCache (dedup, snapshot)
//!                                                       └──► MinuteBarStore
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core streaming types with no external dependencies.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::state::StateCache;
pub use domain::streaming::{
    CanonicalEvent, EventKind, EventPayload, InstrumentSnapshot, KlineBar, QuotePayload,
    StreamMessage,
};
pub use domain::subscription::{
    InstrumentId, RegistryStats, SessionId, SubscriptionChanges, SubscriptionRegistry,
};

// Ports
pub use application::ports::{MarketDataUpstream, MinuteBarStore, StoreError, UpstreamError};

// Services
pub use application::services::{
    EventSink, GuardConfig, LivenessGuard, PollingConfig, PollingFallback, StreamRuntime,
};

// Configuration
pub use infrastructure::config::{
    ConfigError, EngineSettings, GatewaySettings, HubConfig, ServerSettings, StorageSettings,
};

// Engine
pub use infrastructure::broadcast::{
    BroadcastReport, EngineStats, FanoutEngine, SessionInfo, SessionQueue,
};

// Upstream
pub use infrastructure::upstream::{ConnectionState, FeedState, GatewayClient, UpstreamBridge};

// Storage
pub use infrastructure::persistence::{InMemoryMinuteBarStore, SqliteMinuteBarStore};

// Servers
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};
pub use infrastructure::http::{HttpServerError, StreamServer};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
