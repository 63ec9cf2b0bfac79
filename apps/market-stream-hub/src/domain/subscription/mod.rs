//! Subscription Registry
//!
//! Bidirectional membership between viewer sessions and instruments.
//!
//! # Design
//!
//! The registry tracks:
//! - Which instruments each session is registered against
//! - Which sessions subscribe to each instrument (the reference count)
//!
//! Any number of sessions may watch the same instrument while only one
//! upstream subscription exists for it. Mutations report which instruments
//! became active (first subscriber) or inactive (last subscriber left) so
//! the caller can drive upstream subscribe/unsubscribe.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;

// =============================================================================
// Types
// =============================================================================

/// Opaque session identifier (a UUID string when created over HTTP).
pub type SessionId = String;

/// Instrument code as used by the market gateway, e.g. `HK.00700`.
pub type InstrumentId = String;

// =============================================================================
// Subscription Changes
// =============================================================================

/// Instruments whose active state changed as a result of a mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionChanges {
    /// Instruments that gained their first subscriber.
    pub activated: HashSet<InstrumentId>,
    /// Instruments that lost their last subscriber.
    pub deactivated: HashSet<InstrumentId>,
}

impl SubscriptionChanges {
    /// Check if there are any changes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.activated.is_empty() && self.deactivated.is_empty()
    }

    /// Create changes with only activations.
    #[must_use]
    pub fn activated_only(instruments: impl IntoIterator<Item = InstrumentId>) -> Self {
        Self {
            activated: instruments.into_iter().collect(),
            deactivated: HashSet::new(),
        }
    }

    /// Create changes with only deactivations.
    #[must_use]
    pub fn deactivated_only(instruments: impl IntoIterator<Item = InstrumentId>) -> Self {
        Self {
            activated: HashSet::new(),
            deactivated: instruments.into_iter().collect(),
        }
    }
}

// =============================================================================
// Registry State
// =============================================================================

#[derive(Debug, Default)]
struct RegistryState {
    /// Session to the instruments it watches.
    session_instruments: HashMap<SessionId, HashSet<InstrumentId>>,
    /// Instrument to its subscribers. Entries are never empty.
    instrument_sessions: HashMap<InstrumentId, HashSet<SessionId>>,
}

impl RegistryState {
    fn register(&mut self, session: &str, instrument: &str) -> bool {
        let instruments = self
            .session_instruments
            .entry(session.to_string())
            .or_default();
        if !instruments.insert(instrument.to_string()) {
            return false;
        }

        let subscribers = self
            .instrument_sessions
            .entry(instrument.to_string())
            .or_default();
        subscribers.insert(session.to_string());
        subscribers.len() == 1
    }

    fn unregister(&mut self, session: &str) -> Vec<InstrumentId> {
        let Some(instruments) = self.session_instruments.remove(session) else {
            return vec![];
        };

        let mut emptied = Vec::new();
        for instrument in instruments {
            if let Some(subscribers) = self.instrument_sessions.get_mut(&instrument) {
                subscribers.remove(session);
                if subscribers.is_empty() {
                    self.instrument_sessions.remove(&instrument);
                    emptied.push(instrument);
                }
            }
        }
        emptied
    }
}

// =============================================================================
// Subscription Registry
// =============================================================================

/// Thread-safe session ↔ instrument registry.
///
/// All mutation goes through one coarse lock. Lookups return owned copies,
/// so no caller ever iterates while holding it.
///
/// # Example
///
/// ```rust
/// use market_stream_hub::domain::subscription::SubscriptionRegistry;
///
/// let registry = SubscriptionRegistry::new();
///
/// // First viewer activates the instrument
/// let changes = registry.register("a", "HK.00700");
/// assert!(changes.activated.contains("HK.00700"));
///
/// // Second viewer shares the existing subscription
/// assert!(registry.register("b", "HK.00700").is_empty());
///
/// // Instrument stays active while "b" remains
/// assert!(registry.unregister("a").is_empty());
///
/// // Last viewer leaves
/// let changes = registry.unregister("b");
/// assert!(changes.deactivated.contains("HK.00700"));
/// ```
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    state: RwLock<RegistryState>,
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `session` against `instrument`.
    ///
    /// Idempotent. Reports the instrument as activated when this is its
    /// first subscriber.
    pub fn register(&self, session: &str, instrument: &str) -> SubscriptionChanges {
        if self.state.write().register(session, instrument) {
            SubscriptionChanges::activated_only([instrument.to_string()])
        } else {
            SubscriptionChanges::default()
        }
    }

    /// Remove every edge of `session`.
    ///
    /// Returns the instruments left without subscribers; the caller owns
    /// their teardown.
    pub fn unregister(&self, session: &str) -> SubscriptionChanges {
        let emptied = self.state.write().unregister(session);
        SubscriptionChanges::deactivated_only(emptied)
    }

    /// Snapshot of the sessions subscribed to `instrument`.
    #[must_use]
    pub fn subscribers_of(&self, instrument: &str) -> Vec<SessionId> {
        self.state
            .read()
            .instrument_sessions
            .get(instrument)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshot of the instruments `session` is registered against.
    #[must_use]
    pub fn instruments_of(&self, session: &str) -> Vec<InstrumentId> {
        self.state
            .read()
            .session_instruments
            .get(session)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Instruments with at least one subscriber.
    #[must_use]
    pub fn active_instruments(&self) -> Vec<InstrumentId> {
        self.state
            .read()
            .instrument_sessions
            .keys()
            .cloned()
            .collect()
    }

    /// Whether `instrument` has at least one subscriber.
    #[must_use]
    pub fn is_active(&self, instrument: &str) -> bool {
        self.state.read().instrument_sessions.contains_key(instrument)
    }

    /// Whether `session` holds any registration.
    #[must_use]
    pub fn contains_session(&self, session: &str) -> bool {
        self.state.read().session_instruments.contains_key(session)
    }

    /// Current registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let state = self.state.read();
        RegistryStats {
            session_count: state.session_instruments.len(),
            instrument_count: state.instrument_sessions.len(),
            edge_count: state.session_instruments.values().map(HashSet::len).sum(),
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Registry statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Sessions with at least one registration.
    pub session_count: usize,
    /// Instruments with at least one subscriber.
    pub instrument_count: usize,
    /// Total session ↔ instrument edges.
    pub edge_count: usize,
}

// =============================================================================
// Tests
// =============================================================================
