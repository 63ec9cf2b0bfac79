//! Domain Layer - Core streaming types and business logic.
//!
//! Pure data structures for market data fan-out: canonical events,
//! session/instrument membership and per-instrument state. Nothing here
//! performs I/O or spawns tasks.

/// Canonical market data events and delivery envelopes.
pub mod streaming;

/// Session ↔ instrument subscription registry.
pub mod subscription;

/// Last-known state per instrument with broadcast deduplication.
pub mod state;
