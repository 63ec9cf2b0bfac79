//! Prometheus Metrics Module
//!
//! Exposes hub metrics in Prometheus format.
//!
//! # Metrics Categories
//!
//! - **Events**: upstream records received, deduplicated, malformed, dropped at hand-off
//! - **Delivery**: messages enqueued to sessions and evicted by backpressure
//! - **Subscriptions**: active sessions, instruments and upstream subscriptions
//! - **Upstream**: request failures and push reconnects
//! - **Latency**: event ingest duration
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::domain::streaming::EventKind;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// # Panics
///
/// Panics if the recorder cannot be installed.
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let handle = PrometheusBuilder::new()
                .install_recorder()
                .expect("failed to install Prometheus recorder");

            register_metrics();
            handle
        })
        .clone()
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Event counters
    describe_counter!(
        "stream_hub_events_received_total",
        "Canonical events consumed by the engine"
    );
    describe_counter!(
        "stream_hub_events_deduplicated_total",
        "Events whose broadcast was suppressed as unchanged"
    );
    describe_counter!(
        "stream_hub_malformed_records_total",
        "Upstream records dropped by normalization"
    );
    describe_counter!(
        "stream_hub_handoff_dropped_total",
        "Events dropped because the hand-off channel was full"
    );

    // Delivery counters
    describe_counter!(
        "stream_hub_messages_delivered_total",
        "Messages enqueued to session queues"
    );
    describe_counter!(
        "stream_hub_messages_evicted_total",
        "Oldest messages evicted from full session queues"
    );

    // Subscription gauges
    describe_gauge!("stream_hub_active_sessions", "Sessions known to the engine");
    describe_gauge!(
        "stream_hub_active_instruments",
        "Instruments with at least one subscriber"
    );
    describe_gauge!(
        "stream_hub_upstream_subscriptions",
        "Instruments currently subscribed upstream"
    );
    describe_gauge!(
        "stream_hub_polling_tasks",
        "Running minute bar polling tasks"
    );

    // Lifecycle counters
    describe_counter!(
        "stream_hub_sessions_reaped_total",
        "Sessions detached for staleness"
    );
    describe_counter!(
        "stream_hub_upstream_failures_total",
        "Failed upstream requests by operation"
    );
    describe_counter!(
        "stream_hub_reconnects_total",
        "Push connection reconnection attempts"
    );
    describe_counter!(
        "stream_hub_persistence_failures_total",
        "Minute bar write-through failures"
    );

    // Latency histograms
    describe_histogram!(
        "stream_hub_ingest_seconds",
        "Time to dedup and fan out one event"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Metric labels for upstream operations.
#[derive(Debug, Clone, Copy)]
pub enum UpstreamOperation {
    /// Subscribe request.
    Subscribe,
    /// Unsubscribe request.
    Unsubscribe,
    /// Minute bar pull.
    FetchBars,
}

impl UpstreamOperation {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
            Self::FetchBars => "fetch_bars",
        }
    }
}

/// Record an event consumed by the engine.
pub fn record_event_received(kind: EventKind) {
    counter!("stream_hub_events_received_total", "kind" => kind.as_str()).increment(1);
}

/// Record an event suppressed by deduplication.
pub fn record_event_deduplicated(kind: EventKind) {
    counter!("stream_hub_events_deduplicated_total", "kind" => kind.as_str()).increment(1);
}

/// Record upstream records dropped by a normalizer.
pub fn record_malformed_records(kind: EventKind, count: u64) {
    counter!("stream_hub_malformed_records_total", "kind" => kind.as_str()).increment(count);
}

/// Record an event dropped at the hand-off channel.
pub fn record_handoff_dropped(kind: EventKind) {
    counter!("stream_hub_handoff_dropped_total", "kind" => kind.as_str()).increment(1);
}

/// Record messages enqueued to sessions.
pub fn record_messages_delivered(count: u64) {
    counter!("stream_hub_messages_delivered_total").increment(count);
}

/// Record messages evicted by drop-oldest backpressure.
pub fn record_messages_evicted(count: u64) {
    counter!("stream_hub_messages_evicted_total").increment(count);
}

/// Update the session count.
pub fn set_active_sessions(count: f64) {
    gauge!("stream_hub_active_sessions").set(count);
}

/// Update the active instrument count.
pub fn set_active_instruments(count: f64) {
    gauge!("stream_hub_active_instruments").set(count);
}

/// Update the upstream subscription count.
pub fn set_upstream_subscriptions(count: f64) {
    gauge!("stream_hub_upstream_subscriptions").set(count);
}

/// Update the polling task count.
pub fn set_polling_tasks(count: f64) {
    gauge!("stream_hub_polling_tasks").set(count);
}

/// Record a session detached for staleness.
pub fn record_session_reaped() {
    counter!("stream_hub_sessions_reaped_total").increment(1);
}

/// Record a failed upstream request.
pub fn record_upstream_failure(operation: UpstreamOperation) {
    counter!(
        "stream_hub_upstream_failures_total",
        "operation" => operation.as_str()
    )
    .increment(1);
}

/// Record a push connection reconnection attempt.
pub fn record_reconnect() {
    counter!("stream_hub_reconnects_total").increment(1);
}

/// Record a failed minute bar write-through.
pub fn record_persistence_failure() {
    counter!("stream_hub_persistence_failures_total").increment(1);
}

/// Record event ingest duration.
pub fn record_ingest_duration(kind: EventKind, duration: Duration) {
    histogram!("stream_hub_ingest_seconds", "kind" => kind.as_str())
        .record(duration.as_secs_f64());
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_operation_as_str() {
        assert_eq!(UpstreamOperation::Subscribe.as_str(), "subscribe");
        assert_eq!(UpstreamOperation::Unsubscribe.as_str(), "unsubscribe");
        assert_eq!(UpstreamOperation::FetchBars.as_str(), "fetch_bars");
    }

    #[test]
    fn recording_without_recorder_is_a_no_op() {
        record_event_received(EventKind::Quote);
        record_messages_evicted(3);
        set_active_sessions(2.0);
        record_ingest_duration(EventKind::Kline, Duration::from_millis(1));
    }
}
