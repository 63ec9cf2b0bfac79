//! Port Interfaces
//!
//! Contracts the engine holds against the outside world, following the
//! Hexagonal Architecture pattern. Infrastructure adapters implement them.
//!
//! ## Driven Ports (Outbound)
//!
//! - `MarketDataUpstream`: push connection plus subscribe/unsubscribe calls
//! - `MinuteBarStore`: persistent minute-bar storage

mod bar_store;
mod upstream;

pub use bar_store::{MinuteBarStore, StoreError};
#[cfg(test)]
pub use upstream::MockMarketDataUpstream;
#[cfg(test)]
pub use bar_store::MockMinuteBarStore;
pub use upstream::{MarketDataUpstream, PushHandler, UpstreamError};
