//! Market Data Streaming Types
//!
//! Canonical, vendor-independent representation of the records pushed by
//! the upstream market gateway, plus the envelope delivered to sessions.
//!
//! Every pushed record is normalized into a [`CanonicalEvent`] whose
//! [`EventPayload`] shape is fixed per [`EventKind`]. The latest payload of
//! each kind is folded into an [`InstrumentSnapshot`], which is what
//! sessions actually receive.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::subscription::InstrumentId;

// =============================================================================
// Event Kinds
// =============================================================================

/// Kind of a canonical market data event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Top-of-book quote with session statistics.
    Quote,
    /// Ten-level order book.
    OrderBook,
    /// Most recent tick-by-tick trades.
    Ticker,
    /// Broker queue on both sides of the book.
    BrokerQueue,
    /// Intraday time-sharing points.
    RtData,
    /// One-minute candlestick bars.
    Kline,
    /// Synthetic keep-alive with no payload.
    Heartbeat,
}

impl EventKind {
    /// Kinds delivered by the upstream push connection.
    pub const PUSHED: &'static [Self] = &[
        Self::Quote,
        Self::OrderBook,
        Self::Ticker,
        Self::BrokerQueue,
        Self::RtData,
        Self::Kline,
    ];

    /// Stable lowercase name, also the snapshot field name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Quote => "quote",
            Self::OrderBook => "order_book",
            Self::Ticker => "ticker",
            Self::BrokerQueue => "broker_queue",
            Self::RtData => "rt_data",
            Self::Kline => "kline",
            Self::Heartbeat => "heartbeat",
        }
    }

    /// Gateway subtype name used for subscribe calls and push frames.
    #[must_use]
    pub const fn vendor_subtype(self) -> Option<&'static str> {
        match self {
            Self::Quote => Some("QUOTE"),
            Self::OrderBook => Some("ORDER_BOOK"),
            Self::Ticker => Some("TICKER"),
            Self::BrokerQueue => Some("BROKER"),
            Self::RtData => Some("RT_DATA"),
            Self::Kline => Some("K_1M"),
            Self::Heartbeat => None,
        }
    }

    /// Resolve a gateway subtype name.
    #[must_use]
    pub fn from_vendor_subtype(subtype: &str) -> Option<Self> {
        Self::PUSHED
            .iter()
            .copied()
            .find(|kind| kind.vendor_subtype() == Some(subtype))
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Payloads
// =============================================================================

/// Quote payload.
///
/// Broadcast equality only considers `price`, `change_rate` and
/// `update_time`; volume drift alone does not produce a new message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotePayload {
    /// Last traded price.
    #[serde(with = "rust_decimal::serde::float")]
    pub price: Decimal,
    /// Change versus previous close, in percent.
    #[serde(with = "rust_decimal::serde::float")]
    pub change_rate: Decimal,
    /// Session volume.
    #[serde(with = "rust_decimal::serde::float")]
    pub volume: Decimal,
    /// Session turnover.
    #[serde(with = "rust_decimal::serde::float")]
    pub turnover: Decimal,
    /// Session high.
    #[serde(with = "rust_decimal::serde::float")]
    pub high: Decimal,
    /// Session low.
    #[serde(with = "rust_decimal::serde::float")]
    pub low: Decimal,
    /// Session open.
    #[serde(with = "rust_decimal::serde::float")]
    pub open: Decimal,
    /// Close (last price while the session is live).
    #[serde(with = "rust_decimal::serde::float")]
    pub close: Decimal,
    /// Previous session close.
    #[serde(with = "rust_decimal::serde::float")]
    pub prev_close: Decimal,
    /// Gateway update time, passed through verbatim.
    pub update_time: Option<String>,
}

impl QuotePayload {
    /// Whether two quotes would produce the same broadcast.
    #[must_use]
    pub fn same_broadcast_state(&self, other: &Self) -> bool {
        self.price == other.price
            && self.change_rate == other.change_rate
            && self.update_time == other.update_time
    }
}

/// A single order book level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLevel {
    /// Level price.
    #[serde(with = "rust_decimal::serde::float")]
    pub price: Decimal,
    /// Level volume, if the gateway supplied a parsable one.
    #[serde(with = "rust_decimal::serde::float_option")]
    pub volume: Option<Decimal>,
}

/// Order book payload (top ten levels per side).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBookPayload {
    /// Bid levels, best first.
    pub bids: Vec<PriceLevel>,
    /// Ask levels, best first.
    pub asks: Vec<PriceLevel>,
    /// Gateway timestamp of the book.
    pub timestamp: Option<String>,
}

/// One tick-by-tick trade.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickRecord {
    /// Trade time.
    pub time: Option<String>,
    /// Trade price.
    #[serde(with = "rust_decimal::serde::float_option")]
    pub price: Option<Decimal>,
    /// Trade volume.
    #[serde(with = "rust_decimal::serde::float_option")]
    pub volume: Option<Decimal>,
    /// Trade turnover.
    #[serde(with = "rust_decimal::serde::float_option")]
    pub turnover: Option<Decimal>,
    /// Aggressor side as reported by the gateway.
    pub direction: Option<String>,
}

/// Broker queue payload; entries are passed through untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BrokerQueuePayload {
    /// Brokers on the bid side.
    pub buyers: Vec<serde_json::Value>,
    /// Brokers on the ask side.
    pub sellers: Vec<serde_json::Value>,
}

/// One intraday time-sharing point.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtPoint {
    /// Minute of the point.
    pub time: Option<String>,
    /// Price at the minute.
    #[serde(with = "rust_decimal::serde::float_option")]
    pub price: Option<Decimal>,
    /// Running average price.
    #[serde(with = "rust_decimal::serde::float_option")]
    pub avg_price: Option<Decimal>,
    /// Minute volume.
    #[serde(with = "rust_decimal::serde::float_option")]
    pub volume: Option<Decimal>,
    /// Minute turnover.
    #[serde(with = "rust_decimal::serde::float_option")]
    pub turnover: Option<Decimal>,
}

/// One-minute candlestick bar.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KlineBar {
    /// Bar start, e.g. `2024-05-02 09:31:00`.
    pub time_key: Option<String>,
    /// Open price.
    #[serde(with = "rust_decimal::serde::float_option")]
    pub open: Option<Decimal>,
    /// High price.
    #[serde(with = "rust_decimal::serde::float_option")]
    pub high: Option<Decimal>,
    /// Low price.
    #[serde(with = "rust_decimal::serde::float_option")]
    pub low: Option<Decimal>,
    /// Close price.
    #[serde(with = "rust_decimal::serde::float_option")]
    pub close: Option<Decimal>,
    /// Bar volume.
    #[serde(with = "rust_decimal::serde::float_option")]
    pub volume: Option<Decimal>,
    /// Bar turnover.
    #[serde(with = "rust_decimal::serde::float_option")]
    pub turnover: Option<Decimal>,
}

/// Payload of a canonical event, one variant per [`EventKind`].
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    /// Quote update.
    Quote(QuotePayload),
    /// Order book update.
    OrderBook(OrderBookPayload),
    /// Recent ticks (at most 20).
    Ticker(Vec<TickRecord>),
    /// Broker queue update.
    BrokerQueue(BrokerQueuePayload),
    /// Intraday points (at most 180).
    RtData(Vec<RtPoint>),
    /// Minute bars.
    Kline(Vec<KlineBar>),
    /// Keep-alive.
    Heartbeat,
}

impl EventPayload {
    /// Kind of this payload.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::Quote(_) => EventKind::Quote,
            Self::OrderBook(_) => EventKind::OrderBook,
            Self::Ticker(_) => EventKind::Ticker,
            Self::BrokerQueue(_) => EventKind::BrokerQueue,
            Self::RtData(_) => EventKind::RtData,
            Self::Kline(_) => EventKind::Kline,
            Self::Heartbeat => EventKind::Heartbeat,
        }
    }
}

// =============================================================================
// Canonical Event
// =============================================================================

/// Internal representation of one upstream record.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalEvent {
    /// Instrument the record belongs to.
    pub instrument: InstrumentId,
    /// Normalized payload.
    pub payload: EventPayload,
    /// Time the record was normalized.
    pub timestamp: DateTime<Utc>,
}

impl CanonicalEvent {
    /// Create an event stamped with the current time.
    #[must_use]
    pub fn new(instrument: impl Into<InstrumentId>, payload: EventPayload) -> Self {
        Self {
            instrument: instrument.into(),
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Kind of the event.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        self.payload.kind()
    }
}

// =============================================================================
// Snapshot
// =============================================================================

/// Latest payload of every kind seen for one instrument.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InstrumentSnapshot {
    /// Latest quote.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quote: Option<QuotePayload>,
    /// Latest order book.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_book: Option<OrderBookPayload>,
    /// Latest ticks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ticker: Option<Vec<TickRecord>>,
    /// Latest broker queue.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broker_queue: Option<BrokerQueuePayload>,
    /// Latest intraday points.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rt_data: Option<Vec<RtPoint>>,
    /// Latest minute bars.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kline: Option<Vec<KlineBar>>,
}

impl InstrumentSnapshot {
    /// Store `payload` as the latest value of its kind.
    ///
    /// Storage is always overwritten. The return value tells whether the
    /// new value differs from the previous one under the kind's broadcast
    /// equality rule. Heartbeats are never stored and never count as a change.
    pub fn replace(&mut self, payload: EventPayload) -> bool {
        match payload {
            EventPayload::Quote(quote) => {
                let changed = self
                    .quote
                    .as_ref()
                    .is_none_or(|previous| !previous.same_broadcast_state(&quote));
                self.quote = Some(quote);
                changed
            }
            EventPayload::OrderBook(book) => store(&mut self.order_book, book),
            EventPayload::Ticker(ticks) => store(&mut self.ticker, ticks),
            EventPayload::BrokerQueue(queue) => store(&mut self.broker_queue, queue),
            EventPayload::RtData(points) => store(&mut self.rt_data, points),
            EventPayload::Kline(bars) => store(&mut self.kline, bars),
            EventPayload::Heartbeat => false,
        }
    }

    /// Kinds that currently hold a value.
    #[must_use]
    pub fn kinds(&self) -> Vec<EventKind> {
        let present = [
            (EventKind::Quote, self.quote.is_some()),
            (EventKind::OrderBook, self.order_book.is_some()),
            (EventKind::Ticker, self.ticker.is_some()),
            (EventKind::BrokerQueue, self.broker_queue.is_some()),
            (EventKind::RtData, self.rt_data.is_some()),
            (EventKind::Kline, self.kline.is_some()),
        ];
        present
            .into_iter()
            .filter_map(|(kind, is_set)| is_set.then_some(kind))
            .collect()
    }

    /// Whether no kind has been seen yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.kinds().is_empty()
    }
}

fn store<T: PartialEq>(slot: &mut Option<T>, value: T) -> bool {
    let changed = slot.as_ref() != Some(&value);
    *slot = Some(value);
    changed
}

// =============================================================================
// Delivery Envelope
// =============================================================================

/// Body of a message delivered to a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MessageBody {
    /// Composed state of the instrument.
    Snapshot(InstrumentSnapshot),
    /// Keep-alive marker.
    Heartbeat {
        /// Always `true`.
        heartbeat: bool,
    },
}

/// Message placed on a session's outbound queue.
///
/// Serializes flat, e.g. `{"code":"HK.00700","timestamp":"...","quote":{...}}`
/// or `{"code":"HK.00700","timestamp":"...","heartbeat":true}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamMessage {
    /// Instrument the message is about.
    pub code: InstrumentId,
    /// Time the message was composed.
    pub timestamp: DateTime<Utc>,
    /// Snapshot or heartbeat.
    #[serde(flatten)]
    pub body: MessageBody,
}

impl StreamMessage {
    /// Wrap a composed snapshot with a fresh timestamp.
    #[must_use]
    pub fn snapshot(code: impl Into<InstrumentId>, snapshot: InstrumentSnapshot) -> Self {
        Self {
            code: code.into(),
            timestamp: Utc::now(),
            body: MessageBody::Snapshot(snapshot),
        }
    }

    /// Create a heartbeat message.
    #[must_use]
    pub fn heartbeat(code: impl Into<InstrumentId>) -> Self {
        Self {
            code: code.into(),
            timestamp: Utc::now(),
            body: MessageBody::Heartbeat { heartbeat: true },
        }
    }

    /// Whether this is a heartbeat.
    #[must_use]
    pub const fn is_heartbeat(&self) -> bool {
        matches!(self.body, MessageBody::Heartbeat { .. })
    }

    /// Snapshot carried by the message, if any.
    #[must_use]
    pub const fn as_snapshot(&self) -> Option<&InstrumentSnapshot> {
        match &self.body {
            MessageBody::Snapshot(snapshot) => Some(snapshot),
            MessageBody::Heartbeat { .. } => None,
        }
    }
}

/// Message shared between every session queue it is delivered to.
pub type SharedMessage = Arc<StreamMessage>;

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn quote(price: Decimal, volume: Decimal, update_time: &str) -> QuotePayload {
        QuotePayload {
            price,
            change_rate: dec!(1.5),
            volume,
            update_time: Some(update_time.to_string()),
            ..QuotePayload::default()
        }
    }

    #[test]
    fn vendor_subtypes_round_trip() {
        for kind in EventKind::PUSHED {
            let subtype = kind.vendor_subtype().unwrap();
            assert_eq!(EventKind::from_vendor_subtype(subtype), Some(*kind));
        }
        assert_eq!(EventKind::Heartbeat.vendor_subtype(), None);
        assert_eq!(EventKind::from_vendor_subtype("K_DAY"), None);
    }

    #[test]
    fn quote_equality_ignores_volume() {
        let a = quote(dec!(320.2), dec!(1000), "09:30:01");
        let b = quote(dec!(320.2), dec!(2500), "09:30:01");
        assert!(a.same_broadcast_state(&b));

        let c = quote(dec!(320.4), dec!(1000), "09:30:01");
        assert!(!a.same_broadcast_state(&c));
    }

    #[test]
    fn replace_reports_change_and_always_stores() {
        let mut snapshot = InstrumentSnapshot::default();
        assert!(snapshot.replace(EventPayload::Quote(quote(dec!(10), dec!(1), "t1"))));
        assert!(!snapshot.replace(EventPayload::Quote(quote(dec!(10), dec!(7), "t1"))));

        // Latest value is stored even when the broadcast is suppressed
        assert_eq!(snapshot.quote.as_ref().unwrap().volume, dec!(7));
    }

    #[test]
    fn replace_uses_structural_equality_for_books() {
        let mut snapshot = InstrumentSnapshot::default();
        let book = OrderBookPayload {
            bids: vec![PriceLevel {
                price: dec!(10.1),
                volume: Some(dec!(300)),
            }],
            asks: vec![],
            timestamp: None,
        };
        assert!(snapshot.replace(EventPayload::OrderBook(book.clone())));
        assert!(!snapshot.replace(EventPayload::OrderBook(book.clone())));

        let mut moved = book;
        moved.bids[0].volume = Some(dec!(200));
        assert!(snapshot.replace(EventPayload::OrderBook(moved)));
    }

    #[test]
    fn heartbeat_is_never_stored() {
        let mut snapshot = InstrumentSnapshot::default();
        assert!(!snapshot.replace(EventPayload::Heartbeat));
        assert!(snapshot.is_empty());
    }

    #[test]
    fn snapshot_message_serializes_flat() {
        let mut snapshot = InstrumentSnapshot::default();
        snapshot.replace(EventPayload::Quote(quote(dec!(320.2), dec!(1), "09:30:01")));
        let message = StreamMessage::snapshot("HK.00700", snapshot);

        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["code"], "HK.00700");
        assert_eq!(json["quote"]["price"], 320.2);
        assert!(json.get("order_book").is_none());
        assert!(json.get("heartbeat").is_none());
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn heartbeat_message_serializes_flat() {
        let message = StreamMessage::heartbeat("US.AAPL");
        assert!(message.is_heartbeat());
        assert!(message.as_snapshot().is_none());

        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["code"], "US.AAPL");
        assert_eq!(json["heartbeat"], true);
    }

    #[test]
    fn snapshot_kinds_lists_present_fields() {
        let mut snapshot = InstrumentSnapshot::default();
        snapshot.replace(EventPayload::Kline(vec![KlineBar::default()]));
        snapshot.replace(EventPayload::Ticker(vec![]));
        assert_eq!(snapshot.kinds(), vec![EventKind::Ticker, EventKind::Kline]);
    }
}
