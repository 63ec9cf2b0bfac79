//! State Cache
//!
//! Last-known canonical payload per (instrument, kind). Every update is
//! stored, but only updates that differ from the previous value under the
//! kind's equality rule are reported as changes worth broadcasting.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::streaming::{EventPayload, InstrumentSnapshot, SharedMessage, StreamMessage};
use super::subscription::InstrumentId;

/// Per-instrument state cache with broadcast deduplication.
#[derive(Debug, Default)]
pub struct StateCache {
    states: RwLock<HashMap<InstrumentId, InstrumentSnapshot>>,
}

impl StateCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `payload` as the latest value for `instrument`.
    ///
    /// Returns `true` when a broadcast should follow.
    pub fn update(&self, instrument: &str, payload: EventPayload) -> bool {
        if matches!(payload, EventPayload::Heartbeat) {
            return false;
        }
        self.states
            .write()
            .entry(instrument.to_string())
            .or_default()
            .replace(payload)
    }

    /// Compose every stored kind into one message with a fresh timestamp.
    ///
    /// `None` until the first payload for the instrument has been stored.
    #[must_use]
    pub fn compose_snapshot(&self, instrument: &str) -> Option<SharedMessage> {
        let snapshot = self
            .states
            .read()
            .get(instrument)
            .filter(|snapshot| !snapshot.is_empty())
            .cloned()?;
        Some(Arc::new(StreamMessage::snapshot(instrument, snapshot)))
    }

    /// Drop everything stored for `instrument`.
    pub fn evict(&self, instrument: &str) -> bool {
        self.states.write().remove(instrument).is_some()
    }

    /// Number of instruments with stored state.
    #[must_use]
    pub fn len(&self) -> usize {
        self.states.read().len()
    }

    /// Whether nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.states.read().is_empty()
    }
}
