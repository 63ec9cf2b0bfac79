//! SQLite Minute Bar Store
//!
//! One row per (code, `time_key`) in `minute_kline`. Prices and volumes are
//! stored as decimal text so values round-trip without float drift.

use std::path::Path;
use std::str::FromStr;

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use rust_decimal::Decimal;

use crate::application::ports::{MinuteBarStore, StoreError};
use crate::domain::streaming::KlineBar;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS minute_kline (
        code     TEXT NOT NULL,
        time_key TEXT NOT NULL,
        open     TEXT,
        high     TEXT,
        low      TEXT,
        close    TEXT,
        volume   TEXT,
        turnover TEXT,
        PRIMARY KEY (code, time_key)
    );
";

const UPSERT: &str = "
    INSERT INTO minute_kline (code, time_key, open, high, low, close, volume, turnover)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
    ON CONFLICT(code, time_key) DO UPDATE SET
        open = excluded.open,
        high = excluded.high,
        low = excluded.low,
        close = excluded.close,
        volume = excluded.volume,
        turnover = excluded.turnover
";

/// `rusqlite`-backed store.
#[derive(Debug)]
pub struct SqliteMinuteBarStore {
    conn: Mutex<Connection>,
}

impl SqliteMinuteBarStore {
    /// Open (or create) the database at `path`, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Open`] if the file or schema cannot be created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let open_error = |message: String| StoreError::Open {
            path: path.display().to_string(),
            message,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| open_error(e.to_string()))?;
        }
        let conn = Connection::open(path).map_err(|e| open_error(e.to_string()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| open_error(e.to_string()))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|e| open_error(e.to_string()))?;
        Self::with_connection(conn).map_err(|e| open_error(e.to_string()))
    }

    /// Open a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be created.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(StoreError::backend)?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA).map_err(StoreError::backend)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn decimal_text(value: Option<Decimal>) -> Option<String> {
    value.map(|d| d.normalize().to_string())
}

fn parse_decimal(value: Option<String>) -> Option<Decimal> {
    value.and_then(|text| Decimal::from_str(&text).ok())
}

impl MinuteBarStore for SqliteMinuteBarStore {
    fn save_batch(&self, instrument: &str, bars: &[KlineBar]) -> Result<usize, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(StoreError::backend)?;
        let mut written = 0;
        {
            let mut stmt = tx.prepare_cached(UPSERT).map_err(StoreError::backend)?;
            for bar in bars {
                let Some(time_key) = &bar.time_key else {
                    continue;
                };
                stmt.execute(params![
                    instrument,
                    time_key,
                    decimal_text(bar.open),
                    decimal_text(bar.high),
                    decimal_text(bar.low),
                    decimal_text(bar.close),
                    decimal_text(bar.volume),
                    decimal_text(bar.turnover),
                ])
                .map_err(StoreError::backend)?;
                written += 1;
            }
        }
        tx.commit().map_err(StoreError::backend)?;
        Ok(written)
    }

    fn fetch_recent(&self, instrument: &str, limit: usize) -> Result<Vec<KlineBar>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT time_key, open, high, low, close, volume, turnover
                 FROM minute_kline WHERE code = ?1
                 ORDER BY time_key DESC LIMIT ?2",
            )
            .map_err(StoreError::backend)?;

        let rows = stmt
            .query_map(params![instrument, limit], |row| {
                Ok(KlineBar {
                    time_key: row.get(0)?,
                    open: parse_decimal(row.get(1)?),
                    high: parse_decimal(row.get(2)?),
                    low: parse_decimal(row.get(3)?),
                    close: parse_decimal(row.get(4)?),
                    volume: parse_decimal(row.get(5)?),
                    turnover: parse_decimal(row.get(6)?),
                })
            })
            .map_err(StoreError::backend)?;

        let mut bars = rows
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::backend)?;
        bars.reverse();
        Ok(bars)
    }

    fn prune(&self, instrument: &str, keep: usize) -> Result<usize, StoreError> {
        let keep = i64::try_from(keep).unwrap_or(i64::MAX);
        let conn = self.conn.lock();

        // time_key of the oldest bar still kept
        let cutoff: Option<String> = conn
            .query_row(
                "SELECT time_key FROM minute_kline WHERE code = ?1
                 ORDER BY time_key DESC LIMIT 1 OFFSET ?2",
                params![instrument, keep.saturating_sub(1)],
                |row| row.get(0),
            )
            .optional()
            .map_err(StoreError::backend)?;

        let deleted = match (cutoff, keep) {
            (_, 0) => conn.execute("DELETE FROM minute_kline WHERE code = ?1", params![instrument]),
            (Some(cutoff), _) => conn.execute(
                "DELETE FROM minute_kline WHERE code = ?1 AND time_key < ?2",
                params![instrument, cutoff],
            ),
            (None, _) => Ok(0),
        }
        .map_err(StoreError::backend)?;
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    fn bar(time_key: &str, close: Decimal) -> KlineBar {
        KlineBar {
            time_key: Some(time_key.to_string()),
            open: Some(dec!(320.1)),
            close: Some(close),
            volume: Some(dec!(1500)),
            ..KlineBar::default()
        }
    }

    #[test]
    fn save_and_fetch_round_trip_decimals() {
        let store = SqliteMinuteBarStore::open_in_memory().unwrap();
        store
            .save_batch("HK.00700", &[bar("2024-05-02 09:30:00", dec!(320.45))])
            .unwrap();

        let bars = store.fetch_recent("HK.00700", 10).unwrap();
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].close, Some(dec!(320.45)));
        assert_eq!(bars[0].open, Some(dec!(320.1)));
        assert_eq!(bars[0].high, None);
    }

    #[test]
    fn upsert_replaces_existing_bar() {
        let store = SqliteMinuteBarStore::open_in_memory().unwrap();
        store.save_batch("HK.00700", &[bar("09:30", dec!(1))]).unwrap();
        store.save_batch("HK.00700", &[bar("09:30", dec!(2))]).unwrap();

        let bars = store.fetch_recent("HK.00700", 10).unwrap();
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].close, Some(dec!(2)));
    }

    #[test]
    fn fetch_recent_returns_newest_window_ascending() {
        let store = SqliteMinuteBarStore::open_in_memory().unwrap();
        let bars: Vec<_> = (0..5).map(|i| bar(&format!("09:3{i}"), dec!(1))).collect();
        store.save_batch("HK.00700", &bars).unwrap();
        store.save_batch("US.AAPL", &bars[..1]).unwrap();

        let keys: Vec<_> = store
            .fetch_recent("HK.00700", 3)
            .unwrap()
            .into_iter()
            .filter_map(|b| b.time_key)
            .collect();
        assert_eq!(keys, vec!["09:32", "09:33", "09:34"]);
    }

    #[test]
    fn prune_keeps_newest_per_instrument() {
        let store = SqliteMinuteBarStore::open_in_memory().unwrap();
        let bars: Vec<_> = (0..5).map(|i| bar(&format!("09:3{i}"), dec!(1))).collect();
        store.save_batch("HK.00700", &bars).unwrap();
        store.save_batch("US.AAPL", &bars).unwrap();

        assert_eq!(store.prune("HK.00700", 2).unwrap(), 3);
        assert_eq!(store.fetch_recent("HK.00700", 10).unwrap().len(), 2);
        assert_eq!(store.fetch_recent("US.AAPL", 10).unwrap().len(), 5);
        assert_eq!(store.prune("HK.00700", 10).unwrap(), 0);
        assert_eq!(store.prune("HK.00700", 0).unwrap(), 2);
    }

    #[test]
    fn open_creates_file_and_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("minute_kline.db");

        {
            let store = SqliteMinuteBarStore::open(&path).unwrap();
            store.save_batch("HK.00700", &[bar("09:30", dec!(1))]).unwrap();
        }
        let reopened = SqliteMinuteBarStore::open(&path).unwrap();
        assert_eq!(reopened.fetch_recent("HK.00700", 1).unwrap().len(), 1);
    }
}
