//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the application services and port interfaces
//! that define how the engine interacts with external systems.

/// Port interfaces for external systems (market gateway, bar storage).
pub mod ports;

/// Application services for event hand-off, polling and liveness.
pub mod services;
