use crate::events::{KlineEvent, Timeframe};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// One closed OHLCV bar.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub ts_open_ms: u64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl From<&KlineEvent> for Candle {
    fn from(event: &KlineEvent) -> Self {
        Candle {
            ts_open_ms: event.ts_open_ms,
            open: event.open,
            high: event.high,
            low: event.low,
            close: event.close,
            volume: event.volume,
        }
    }
}

/// Bounded candle series per (symbol, timeframe). Series timestamps stay
/// strictly increasing; out-of-order bars are dropped, equal-timestamp
/// bars overwrite the last entry.
pub struct CandleStore {
    capacity: usize,
    series: DashMap<(String, Timeframe), VecDeque<Candle>>,
}

impl CandleStore {
    pub fn new(capacity: usize) -> Self {
        CandleStore {
            capacity: capacity.max(100),
            series: DashMap::new(),
        }
    }

    /// Folds a kline event into its series. Unclosed bars are ignored.
    pub fn apply(&self, event: &KlineEvent) {
        if !event.closed {
            return;
        }
        let mut series = self
            .series
            .entry((event.symbol.clone(), event.interval))
            .or_default();
        if let Some(last) = series.back_mut() {
            if event.ts_open_ms < last.ts_open_ms {
                return;
            }
            if event.ts_open_ms == last.ts_open_ms {
                *last = Candle::from(event);
                return;
            }
        }
        series.push_back(Candle::from(event));
        while series.len() > self.capacity {
            series.pop_front();
        }
    }

    /// Replaces a series wholesale, as after a REST backfill. Bars are
    /// sorted and de-duplicated on the way in.
    pub fn replace(&self, symbol: &str, timeframe: Timeframe, mut candles: Vec<Candle>) {
        candles.sort_by_key(|c| c.ts_open_ms);
        candles.dedup_by_key(|c| c.ts_open_ms);
        if candles.len() > self.capacity {
            candles.drain(..candles.len() - self.capacity);
        }
        self.series
            .insert((symbol.to_string(), timeframe), candles.into());
    }

    pub fn series(&self, symbol: &str, timeframe: Timeframe) -> Vec<Candle> {
        self.series
            .get(&(symbol.to_string(), timeframe))
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn latest(&self, symbol: &str, timeframe: Timeframe) -> Option<Candle> {
        self.series
            .get(&(symbol.to_string(), timeframe))
            .and_then(|s| s.back().copied())
    }

    pub fn len(&self, symbol: &str, timeframe: Timeframe) -> usize {
        self.series
            .get(&(symbol.to_string(), timeframe))
            .map(|s| s.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Venue;

    fn kline(ts_open_ms: u64, close: f64, closed: bool) -> KlineEvent {
        KlineEvent {
            venue: Venue::Binance,
            symbol: "BTCUSDT".to_string(),
            interval: Timeframe::H1,
            ts_open_ms,
            open: close - 10.0,
            high: close + 20.0,
            low: close - 20.0,
            close,
            volume: 100.0,
            closed,
        }
    }

    #[test]
    fn test_unclosed_bars_are_ignored() {
        let store = CandleStore::new(100);
        store.apply(&kline(1_000, 50_000.0, false));
        assert_eq!(store.len("BTCUSDT", Timeframe::H1), 0);
    }

    #[test]
    fn test_timestamps_stay_strictly_increasing() {
        let store = CandleStore::new(100);
        store.apply(&kline(2_000, 50_000.0, true));
        store.apply(&kline(1_000, 49_000.0, true)); // late bar, dropped
        store.apply(&kline(2_000, 50_100.0, true)); // re-push, overwrites
        store.apply(&kline(3_000, 50_200.0, true));
        let series = store.series("BTCUSDT", Timeframe::H1);
        assert_eq!(series.len(), 2);
        assert_eq!(series[0].close, 50_100.0);
        assert_eq!(series[1].close, 50_200.0);
    }

    #[test]
    fn test_capacity_bound_evicts_oldest() {
        let store = CandleStore::new(100);
        for i in 0..150u64 {
            store.apply(&kline(i * 3_600_000, 50_000.0 + i as f64, true));
        }
        let series = store.series("BTCUSDT", Timeframe::H1);
        assert_eq!(series.len(), 100);
        assert_eq!(series[0].close, 50_050.0);
    }

    #[test]
    fn test_replace_sorts_and_dedups() {
        let store = CandleStore::new(100);
        let bars = vec![
            Candle { ts_open_ms: 3_000, open: 1.0, high: 1.0, low: 1.0, close: 3.0, volume: 1.0 },
            Candle { ts_open_ms: 1_000, open: 1.0, high: 1.0, low: 1.0, close: 1.0, volume: 1.0 },
            Candle { ts_open_ms: 3_000, open: 1.0, high: 1.0, low: 1.0, close: 3.5, volume: 1.0 },
        ];
        store.replace("BTCUSDT", Timeframe::H4, bars);
        let series = store.series("BTCUSDT", Timeframe::H4);
        assert_eq!(series.len(), 2);
        assert_eq!(series[0].ts_open_ms, 1_000);
        assert_eq!(series[1].ts_open_ms, 3_000);
    }
}
