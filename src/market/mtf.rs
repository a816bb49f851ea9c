use crate::events::Timeframe;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Trend read on one timeframe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TrendDirection {
    Bullish,
    Bearish,
    Neutral,
}

impl TrendDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrendDirection::Bullish => "BULLISH",
            TrendDirection::Bearish => "BEARISH",
            TrendDirection::Neutral => "NEUTRAL",
        }
    }
}

/// Indicator digest for one (symbol, timeframe), refreshed as a unit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TfAssessment {
    pub trend: TrendDirection,
    pub rsi: f64,
    pub adx: f64,
    pub ema20: f64,
    pub ema50: f64,
    pub close: f64,
    /// Last bar volume relative to its 20-bar mean, minus one.
    pub volume_delta: f64,
}

impl Default for TfAssessment {
    fn default() -> Self {
        TfAssessment {
            trend: TrendDirection::Neutral,
            rsi: 50.0,
            adx: 0.0,
            ema20: 0.0,
            ema50: 0.0,
            close: 0.0,
            volume_delta: 0.0,
        }
    }
}

/// One refresh cycle's output for a symbol across all cached timeframes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MtfEntry {
    pub ts_ms: u64,
    pub h1: TfAssessment,
    pub h4: TfAssessment,
    pub d1: TfAssessment,
}

impl MtfEntry {
    pub fn frame(&self, timeframe: Timeframe) -> &TfAssessment {
        match timeframe {
            Timeframe::H1 => &self.h1,
            Timeframe::H4 => &self.h4,
            Timeframe::D1 => &self.d1,
        }
    }
}

/// Per-symbol MTF entries. Refreshes overwrite the whole entry so readers
/// never observe half-updated timeframes.
pub struct MtfCache {
    entries: DashMap<String, MtfEntry>,
}

impl MtfCache {
    pub fn new() -> Self {
        MtfCache {
            entries: DashMap::new(),
        }
    }

    pub fn store(&self, symbol: &str, entry: MtfEntry) {
        self.entries.insert(symbol.to_string(), entry);
    }

    /// The symbol's entry, if one exists and is no older than
    /// `stale_after_secs`.
    pub fn fresh(&self, symbol: &str, now_ms: u64, stale_after_secs: u64) -> Option<MtfEntry> {
        let entry = self.entries.get(symbol)?;
        let age_ms = now_ms.saturating_sub(entry.ts_ms);
        if age_ms > stale_after_secs * 1_000 {
            return None;
        }
        Some(*entry)
    }
}

impl Default for MtfCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(ts_ms: u64) -> MtfEntry {
        MtfEntry {
            ts_ms,
            h1: TfAssessment::default(),
            h4: TfAssessment::default(),
            d1: TfAssessment::default(),
        }
    }

    #[test]
    fn test_store_overwrites_whole_entry() {
        let cache = MtfCache::new();
        cache.store("BTCUSDT", entry(1_000));
        let mut updated = entry(2_000);
        updated.h4.trend = TrendDirection::Bullish;
        cache.store("BTCUSDT", updated);
        let got = cache.fresh("BTCUSDT", 2_000, 600).unwrap();
        assert_eq!(got.ts_ms, 2_000);
        assert_eq!(got.h4.trend, TrendDirection::Bullish);
    }

    #[test]
    fn test_staleness_boundary() {
        let cache = MtfCache::new();
        cache.store("BTCUSDT", entry(1_000_000));
        // Exactly at the limit is still fresh, one ms past is not.
        assert!(cache.fresh("BTCUSDT", 1_600_000, 600).is_some());
        assert!(cache.fresh("BTCUSDT", 1_600_001, 600).is_none());
    }

    #[test]
    fn test_unknown_symbol_is_absent() {
        let cache = MtfCache::new();
        assert!(cache.fresh("ETHUSDT", 0, 600).is_none());
    }
}
