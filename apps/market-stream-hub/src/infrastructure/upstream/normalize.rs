//! Vendor Record Normalization
//!
//! One pure function per pushed [`EventKind`], looked up from a static
//! table. Each maps the JSON rows of a gateway frame into canonical events.
//! Malformed rows are counted and dropped; normalization never fails as a
//! whole.
//!
//! Field lookups follow the gateway's loose schema: a field may appear
//! under several names, and a falsy value (null, `0`, `""`, `[]`) falls
//! through to the next candidate name.

use rust_decimal::Decimal;
use serde_json::{Map, Value};

use crate::domain::streaming::{
    BrokerQueuePayload, CanonicalEvent, EventKind, EventPayload, KlineBar, OrderBookPayload,
    PriceLevel, QuotePayload, RtPoint, TickRecord,
};

/// Order book levels kept per side.
pub const ORDER_BOOK_DEPTH: usize = 10;

/// Tick records kept per ticker frame.
pub const TICKER_LIMIT: usize = 20;

/// Intraday points kept per frame.
pub const RT_DATA_LIMIT: usize = 180;

/// Reason a row was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NormalizeError {
    /// Row is not a JSON object.
    #[error("record is not an object")]
    NotAnObject,
    /// Row carries no instrument code.
    #[error("record has no instrument code")]
    MissingCode,
    /// A numeric field could not be parsed.
    #[error("field {field} is not a number")]
    InvalidNumber {
        /// Offending field.
        field: &'static str,
    },
}

/// Result of normalizing one frame.
#[derive(Debug, Default)]
pub struct NormalizeOutcome {
    /// Canonical events produced.
    pub events: Vec<CanonicalEvent>,
    /// Rows dropped as malformed.
    pub rejected: usize,
    /// First rejection reason, for logging.
    pub first_error: Option<NormalizeError>,
}

impl NormalizeOutcome {
    fn reject(&mut self, error: NormalizeError) {
        self.rejected += 1;
        if self.first_error.is_none() {
            self.first_error = Some(error);
        }
    }
}

type Normalizer = fn(&[Value]) -> NormalizeOutcome;

static NORMALIZERS: &[(EventKind, Normalizer)] = &[
    (EventKind::Quote, normalize_quotes),
    (EventKind::OrderBook, normalize_order_books),
    (EventKind::Ticker, normalize_ticker),
    (EventKind::BrokerQueue, normalize_broker_queues),
    (EventKind::RtData, normalize_rt_data),
    (EventKind::Kline, normalize_kline),
];

/// Normalizer registered for `kind`, if the kind is pushed.
#[must_use]
pub fn normalizer_for(kind: EventKind) -> Option<Normalizer> {
    NORMALIZERS
        .iter()
        .find(|(k, _)| *k == kind)
        .map(|(_, normalizer)| *normalizer)
}

/// Normalize the rows of one frame of `kind`.
#[must_use]
pub fn normalize(kind: EventKind, rows: &[Value]) -> NormalizeOutcome {
    normalizer_for(kind).map_or_else(
        || NormalizeOutcome {
            rejected: rows.len(),
            ..NormalizeOutcome::default()
        },
        |normalizer| normalizer(rows),
    )
}

/// Parse minute bar rows, skipping rows that are not objects.
#[must_use]
pub fn parse_kline_rows(rows: &[Value]) -> Vec<KlineBar> {
    rows.iter()
        .filter_map(Value::as_object)
        .filter_map(|row| kline_bar(row).ok())
        .collect()
}

// =============================================================================
// Per-row kinds
// =============================================================================

fn normalize_quotes(rows: &[Value]) -> NormalizeOutcome {
    per_row(rows, |row| {
        Ok(EventPayload::Quote(QuotePayload {
            price: number_or_zero(row, &["last_price", "price"], "price")?,
            change_rate: number_or_zero(row, &["change_rate"], "change_rate")?,
            volume: number_or_zero(row, &["volume"], "volume")?,
            turnover: number_or_zero(row, &["turnover"], "turnover")?,
            high: number_or_zero(row, &["high_price", "high"], "high")?,
            low: number_or_zero(row, &["low_price", "low"], "low")?,
            open: number_or_zero(row, &["open_price", "open"], "open")?,
            close: number_or_zero(row, &["last_price", "close"], "close")?,
            prev_close: number_or_zero(row, &["prev_close_price", "prev_close"], "prev_close")?,
            update_time: text(row, &["update_time"]),
        }))
    })
}

fn normalize_order_books(rows: &[Value]) -> NormalizeOutcome {
    per_row(rows, |row| {
        Ok(EventPayload::OrderBook(OrderBookPayload {
            bids: levels(first(row, &["Bid", "bid", "BidList"])),
            asks: levels(first(row, &["Ask", "ask", "AskList"])),
            timestamp: text(row, &["update_time", "time"]),
        }))
    })
}

fn normalize_broker_queues(rows: &[Value]) -> NormalizeOutcome {
    per_row(rows, |row| {
        Ok(EventPayload::BrokerQueue(BrokerQueuePayload {
            buyers: list(first(row, &["BidBrokerQueue", "Bid", "buyers"])),
            sellers: list(first(row, &["AskBrokerQueue", "Ask", "sellers"])),
        }))
    })
}

// =============================================================================
// Batch kinds (instrument taken from the first row)
// =============================================================================

fn normalize_ticker(rows: &[Value]) -> NormalizeOutcome {
    batch(&rows[..rows.len().min(TICKER_LIMIT)], EventPayload::Ticker, |row| {
        Ok(TickRecord {
            time: text(row, &["time"]),
            price: number(row, &["price"]),
            volume: number(row, &["volume"]),
            turnover: number(row, &["turnover"]),
            direction: text(row, &["ticker_direction", "direction"]),
        })
    })
}

fn normalize_rt_data(rows: &[Value]) -> NormalizeOutcome {
    batch(&rows[..rows.len().min(RT_DATA_LIMIT)], EventPayload::RtData, |row| {
        Ok(RtPoint {
            time: text(row, &["time"]),
            price: number(row, &["price", "cur_price", "last_price"]),
            avg_price: number(row, &["avg_price"]),
            volume: number(row, &["volume"]),
            turnover: number(row, &["turnover"]),
        })
    })
}

fn normalize_kline(rows: &[Value]) -> NormalizeOutcome {
    batch(rows, EventPayload::Kline, kline_bar)
}

fn kline_bar(row: &Map<String, Value>) -> Result<KlineBar, NormalizeError> {
    Ok(KlineBar {
        time_key: text(row, &["time_key", "time"]),
        open: number(row, &["open"]),
        high: number(row, &["high"]),
        low: number(row, &["low"]),
        close: number(row, &["close", "cur_price"]),
        volume: number(row, &["volume"]),
        turnover: number(row, &["turnover"]),
    })
}

// =============================================================================
// Shapes
// =============================================================================

fn per_row<F>(rows: &[Value], build: F) -> NormalizeOutcome
where
    F: Fn(&Map<String, Value>) -> Result<EventPayload, NormalizeError>,
{
    let mut outcome = NormalizeOutcome::default();
    for row in rows {
        let Some(row) = row.as_object() else {
            outcome.reject(NormalizeError::NotAnObject);
            continue;
        };
        let Some(code) = code(row) else {
            outcome.reject(NormalizeError::MissingCode);
            continue;
        };
        match build(row) {
            Ok(payload) => outcome.events.push(CanonicalEvent::new(code, payload)),
            Err(error) => outcome.reject(error),
        }
    }
    outcome
}

fn batch<T, W, F>(rows: &[Value], wrap: W, build: F) -> NormalizeOutcome
where
    W: Fn(Vec<T>) -> EventPayload,
    F: Fn(&Map<String, Value>) -> Result<T, NormalizeError>,
{
    let mut outcome = NormalizeOutcome::default();
    let Some(head) = rows.first() else {
        return outcome;
    };
    let Some(code) = head.as_object().and_then(code) else {
        outcome.rejected = rows.len();
        outcome.first_error = Some(NormalizeError::MissingCode);
        return outcome;
    };

    let mut records = Vec::with_capacity(rows.len());
    for row in rows {
        match row.as_object().ok_or(NormalizeError::NotAnObject).and_then(&build) {
            Ok(record) => records.push(record),
            Err(error) => outcome.reject(error),
        }
    }
    if !records.is_empty() {
        outcome.events.push(CanonicalEvent::new(code, wrap(records)));
    }
    outcome
}

// =============================================================================
// Field helpers
// =============================================================================

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => !matches!(n.as_f64(), Some(f) if f == 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn first<'a>(row: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|key| row.get(*key))
        .find(|value| is_truthy(value))
}

fn code(row: &Map<String, Value>) -> Option<String> {
    text(row, &["code", "stock_code"])
}

fn text(row: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    match first(row, keys)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn to_decimal(value: &Value) -> Option<Decimal> {
    let raw = match value {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.trim().to_string(),
        _ => return None,
    };
    raw.parse::<Decimal>()
        .ok()
        .or_else(|| Decimal::from_scientific(&raw).ok())
}

fn number(row: &Map<String, Value>, keys: &[&str]) -> Option<Decimal> {
    first(row, keys).and_then(to_decimal)
}

fn number_or_zero(
    row: &Map<String, Value>,
    keys: &[&str],
    field: &'static str,
) -> Result<Decimal, NormalizeError> {
    first(row, keys).map_or(Ok(Decimal::ZERO), |value| {
        to_decimal(value).ok_or(NormalizeError::InvalidNumber { field })
    })
}

fn list(value: Option<&Value>) -> Vec<Value> {
    match value {
        Some(Value::Array(items)) => items.clone(),
        _ => Vec::new(),
    }
}

fn levels(value: Option<&Value>) -> Vec<PriceLevel> {
    let Some(Value::Array(items)) = value else {
        return Vec::new();
    };
    items
        .iter()
        .take(ORDER_BOOK_DEPTH)
        .filter_map(|level| {
            let (price, volume) = match level {
                Value::Array(pair) if pair.len() >= 2 => (Some(&pair[0]), Some(&pair[1])),
                Value::Object(fields) => (
                    first(fields, &["price", "Price"]),
                    first(fields, &["volume", "Volume", "qty", "Qty"]),
                ),
                _ => (None, None),
            };
            Some(PriceLevel {
                price: price.and_then(to_decimal)?,
                volume: volume.and_then(to_decimal),
            })
        })
        .collect()
}

// =============================================================================
// Tests
// =============================================================================
