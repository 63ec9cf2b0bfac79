//! Infrastructure Layer - Adapters and external integrations.
//!
//! Concrete implementations of the application ports plus the engine,
//! servers and process-wide observability setup.

/// Gateway push/REST client and the upstream subscription bridge.
pub mod upstream;

/// Session fan-out engine and per-session queues.
pub mod broadcast;

/// Minute-bar storage adapters.
pub mod persistence;

/// Environment-driven configuration.
pub mod config;

/// Dashboard session and SSE endpoints.
pub mod http;

/// Health check HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Logging and OpenTelemetry span export.
pub mod telemetry;
