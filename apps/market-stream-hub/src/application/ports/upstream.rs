//! Market Data Upstream Port (Driven Port)
//!
//! Interface to the vendor connection that pushes market data and accepts
//! subscribe/unsubscribe requests.

use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::streaming::{EventKind, KlineBar};

/// Callback invoked with the raw rows of one pushed frame.
///
/// Runs on the upstream's delivery thread and must return quickly.
pub type PushHandler = Arc<dyn Fn(Vec<serde_json::Value>) + Send + Sync>;

/// Upstream port error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpstreamError {
    /// Transport failure talking to the gateway.
    #[error("Upstream connection error: {message}")]
    Connection {
        /// Error details.
        message: String,
    },

    /// Gateway answered with a non-zero return code.
    #[error("Upstream rejected request: {message}")]
    Rejected {
        /// Gateway message.
        message: String,
    },

    /// Gateway reply could not be decoded.
    #[error("Invalid upstream response: {message}")]
    InvalidResponse {
        /// Error details.
        message: String,
    },

    /// Request exceeded the configured timeout.
    #[error("Upstream request timed out")]
    Timeout,
}

impl UpstreamError {
    /// Create a connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a rejection error.
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected {
            message: message.into(),
        }
    }
}

/// Port for the market data push connection.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MarketDataUpstream: Send + Sync {
    /// Register the callback for one pushed kind, replacing any previous one.
    fn register_handler(&self, kind: EventKind, handler: PushHandler);

    /// Start the delivery worker. No callback fires before this.
    fn start(&self) -> Result<(), UpstreamError>;

    /// Subscribe `instrument` to the given kinds.
    async fn subscribe(&self, instrument: &str, kinds: &[EventKind]) -> Result<(), UpstreamError>;

    /// Unsubscribe `instrument` from the given kinds.
    async fn unsubscribe(&self, instrument: &str, kinds: &[EventKind])
    -> Result<(), UpstreamError>;

    /// Pull the latest `limit` minute bars, oldest first.
    async fn fetch_recent_bars(
        &self,
        instrument: &str,
        limit: usize,
    ) -> Result<Vec<KlineBar>, UpstreamError>;
}
