//! Event Hand-off
//!
//! The single crossing point between producer contexts (the upstream push
//! thread, polling tasks) and the engine. Producers `try_send` into a
//! bounded channel and never wait; one pump task drains it and applies
//! every state change, which serializes updates per instrument.

use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

use crate::domain::streaming::CanonicalEvent;
use crate::infrastructure::broadcast::FanoutEngine;
use crate::infrastructure::metrics;

/// Producer side of the hand-off channel.
///
/// Cheap to clone; safe to use from threads outside the tokio runtime.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<CanonicalEvent>,
}

impl EventSink {
    /// Create a sink and the receiver the pump consumes.
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<CanonicalEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Submit an event without blocking.
    ///
    /// Returns `false` when the event was dropped (channel full or engine stopped).
    pub fn submit(&self, event: CanonicalEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                tracing::warn!(
                    instrument = %event.instrument,
                    kind = %event.kind(),
                    "Hand-off channel full, dropping event"
                );
                metrics::record_handoff_dropped(event.kind());
                false
            }
            Err(TrySendError::Closed(event)) => {
                tracing::debug!(
                    instrument = %event.instrument,
                    "Engine stopped, discarding event"
                );
                false
            }
        }
    }
}

/// Drain the hand-off channel into the engine until cancelled.
pub async fn run_event_pump(
    mut rx: mpsc::Receiver<CanonicalEvent>,
    engine: Arc<FanoutEngine>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                tracing::debug!("Event pump cancelled");
                break;
            }
            event = rx.recv() => {
                let Some(event) = event else {
                    tracing::debug!("Hand-off channel closed, stopping event pump");
                    break;
                };
                engine.ingest(event);
            }
        }
    }
}
