//! Minute Bar Store Port (Driven Port)
//!
//! Persistent storage for one-minute bars. Calls are synchronous; the
//! engine runs them on the blocking pool, off the broadcast path.

use crate::domain::streaming::KlineBar;

/// Store port error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// Backend failure.
    #[error("Minute bar storage error: {message}")]
    Backend {
        /// Error details.
        message: String,
    },

    /// Store could not be opened.
    #[error("Failed to open minute bar store at {path}: {message}")]
    Open {
        /// Database location.
        path: String,
        /// Error details.
        message: String,
    },
}

impl StoreError {
    /// Create a backend error.
    pub fn backend(message: impl std::fmt::Display) -> Self {
        Self::Backend {
            message: message.to_string(),
        }
    }
}

/// Port for minute bar persistence.
#[cfg_attr(test, mockall::automock)]
pub trait MinuteBarStore: Send + Sync {
    /// Upsert bars keyed by (instrument, `time_key`).
    ///
    /// Bars without a `time_key` are skipped. Returns the number written.
    fn save_batch(&self, instrument: &str, bars: &[KlineBar]) -> Result<usize, StoreError>;

    /// Latest `limit` bars for `instrument`, oldest first.
    fn fetch_recent(&self, instrument: &str, limit: usize) -> Result<Vec<KlineBar>, StoreError>;

    /// Keep only the newest `keep` bars. Returns the number deleted.
    fn prune(&self, instrument: &str, keep: usize) -> Result<usize, StoreError>;
}
