//! In-memory minute bar store, used when no database path is configured.

use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;

use crate::application::ports::{MinuteBarStore, StoreError};
use crate::domain::streaming::KlineBar;
use crate::domain::subscription::InstrumentId;

/// Bars per instrument, ordered by `time_key`.
#[derive(Debug, Default)]
pub struct InMemoryMinuteBarStore {
    bars: RwLock<HashMap<InstrumentId, BTreeMap<String, KlineBar>>>,
}

impl InMemoryMinuteBarStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of bars stored for `instrument`.
    #[must_use]
    pub fn count(&self, instrument: &str) -> usize {
        self.bars.read().get(instrument).map_or(0, BTreeMap::len)
    }
}

impl MinuteBarStore for InMemoryMinuteBarStore {
    fn save_batch(&self, instrument: &str, bars: &[KlineBar]) -> Result<usize, StoreError> {
        let mut store = self.bars.write();
        let series = store.entry(instrument.to_string()).or_default();
        let mut written = 0;
        for bar in bars {
            if let Some(time_key) = &bar.time_key {
                series.insert(time_key.clone(), bar.clone());
                written += 1;
            }
        }
        Ok(written)
    }

    fn fetch_recent(&self, instrument: &str, limit: usize) -> Result<Vec<KlineBar>, StoreError> {
        let store = self.bars.read();
        let Some(series) = store.get(instrument) else {
            return Ok(Vec::new());
        };
        let mut recent: Vec<KlineBar> = series.values().rev().take(limit).cloned().collect();
        recent.reverse();
        Ok(recent)
    }

    fn prune(&self, instrument: &str, keep: usize) -> Result<usize, StoreError> {
        let mut store = self.bars.write();
        let Some(series) = store.get_mut(instrument) else {
            return Ok(0);
        };
        let excess = series.len().saturating_sub(keep);
        let stale: Vec<String> = series.keys().take(excess).cloned().collect();
        for key in &stale {
            series.remove(key);
        }
        Ok(stale.len())
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    fn bar(time_key: &str, close: rust_decimal::Decimal) -> KlineBar {
        KlineBar {
            time_key: Some(time_key.to_string()),
            close: Some(close),
            ..KlineBar::default()
        }
    }

    #[test]
    fn upserts_and_returns_oldest_first() {
        let store = InMemoryMinuteBarStore::new();
        store
            .save_batch("HK.00700", &[bar("09:31", dec!(1)), bar("09:30", dec!(2))])
            .unwrap();
        store.save_batch("HK.00700", &[bar("09:31", dec!(3))]).unwrap();

        let bars = store.fetch_recent("HK.00700", 10).unwrap();
        let keys: Vec<_> = bars.iter().map(|b| b.time_key.as_deref().unwrap()).collect();
        assert_eq!(keys, vec!["09:30", "09:31"]);
        assert_eq!(bars[1].close, Some(dec!(3)));
    }

    #[test]
    fn skips_bars_without_time_key() {
        let store = InMemoryMinuteBarStore::new();
        let written = store
            .save_batch("HK.00700", &[KlineBar::default(), bar("09:30", dec!(1))])
            .unwrap();
        assert_eq!(written, 1);
    }

    #[test]
    fn prune_keeps_newest() {
        let store = InMemoryMinuteBarStore::new();
        let bars: Vec<_> = (0..5).map(|i| bar(&format!("09:3{i}"), dec!(1))).collect();
        store.save_batch("HK.00700", &bars).unwrap();

        assert_eq!(store.prune("HK.00700", 2).unwrap(), 3);
        let keys: Vec<_> = store
            .fetch_recent("HK.00700", 10)
            .unwrap()
            .into_iter()
            .filter_map(|b| b.time_key)
            .collect();
        assert_eq!(keys, vec!["09:33", "09:34"]);
        assert_eq!(store.prune("US.AAPL", 2).unwrap(), 0);
    }
}
