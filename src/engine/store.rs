use crate::engine::types::{Direction, Signal, SignalStatus};
use crate::error::CoreError;
use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, info};

/// Signed percent return from entry to a price, in the signal's direction.
fn level_return(entry: f64, level: f64, direction: Direction) -> f64 {
    match direction {
        Direction::Long => (level - entry) / entry * 100.0,
        Direction::Short => (entry - level) / entry * 100.0,
    }
}

/// Advances one signal against a price print. Hit flags latch, excursions
/// ratchet, and the signal closes once tp3 or the stop is breached. A
/// newly crossed level locks ROI at that level's return; otherwise ROI
/// floats mark-to-market. Returns true when a flag or the status changed.
pub fn track_price(signal: &mut Signal, price: f64, now_ms: u64) -> bool {
    if signal.status == SignalStatus::Closed || !price.is_finite() || price <= 0.0 {
        return false;
    }
    let entry = signal.entry_price;
    let mark = level_return(entry, price, signal.direction);
    signal.max_favorable_pct = signal.max_favorable_pct.max(mark);
    signal.max_adverse_pct = signal.max_adverse_pct.min(mark);

    let reached = |level: f64| match signal.direction {
        Direction::Long => price >= level,
        Direction::Short => price <= level,
    };
    let stop_breached = match signal.direction {
        Direction::Long => price <= signal.stop_loss,
        Direction::Short => price >= signal.stop_loss,
    };

    let before = (signal.tp1_hit, signal.tp2_hit, signal.tp3_hit, signal.sl_hit);
    signal.tp1_hit |= reached(signal.tp1);
    signal.tp2_hit |= reached(signal.tp2);
    signal.tp3_hit |= reached(signal.tp3);
    signal.sl_hit |= stop_breached;

    // Stop first: a print through both sides settles at the stop.
    signal.roi_pct = if signal.sl_hit && !before.3 {
        level_return(entry, signal.stop_loss, signal.direction)
    } else if signal.tp3_hit && !before.2 {
        level_return(entry, signal.tp3, signal.direction)
    } else if signal.tp2_hit && !before.1 {
        level_return(entry, signal.tp2, signal.direction)
    } else if signal.tp1_hit && !before.0 {
        level_return(entry, signal.tp1, signal.direction)
    } else {
        mark
    };

    let mut changed = (signal.tp1_hit, signal.tp2_hit, signal.tp3_hit, signal.sl_hit) != before;
    if signal.tp3_hit || signal.sl_hit {
        signal.status = SignalStatus::Closed;
        signal.closed_at_ms = Some(now_ms);
        changed = true;
    }
    changed
}

/// Persistence seam for emitted signals.
#[async_trait]
pub trait SignalStore: Send + Sync {
    async fn insert_signal(&self, signal: Signal) -> Result<(), CoreError>;

    async fn get_signal(&self, id: &str) -> Result<Option<Signal>, CoreError>;

    /// Active signals for one symbol.
    async fn list_active_signals(&self, symbol: &str) -> Result<Vec<Signal>, CoreError>;

    /// Applies a price print to every active signal of the symbol and
    /// returns the signals whose hit flags or status changed.
    async fn update_signal_roi(
        &self,
        symbol: &str,
        price: f64,
        now_ms: u64,
    ) -> Result<Vec<Signal>, CoreError>;

    /// Explicit close regardless of levels. ROI keeps its last value.
    async fn close_signal(&self, id: &str, now_ms: u64) -> Result<Option<Signal>, CoreError>;

    /// When the symbol's most recent signal closed, for cooldown checks.
    async fn latest_close_ms(&self, symbol: &str) -> Result<Option<u64>, CoreError>;
}

/// DashMap-backed store. The process keeps every signal of its lifetime;
/// a database-backed implementation slots in behind the same trait.
#[derive(Debug, Default)]
pub struct InMemorySignalStore {
    signals: DashMap<String, Signal>,
}

impl InMemorySignalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.signals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }
}

#[async_trait]
impl SignalStore for InMemorySignalStore {
    async fn insert_signal(&self, signal: Signal) -> Result<(), CoreError> {
        debug!(id = %signal.id, symbol = %signal.symbol, "signal stored");
        self.signals.insert(signal.id.clone(), signal);
        Ok(())
    }

    async fn get_signal(&self, id: &str) -> Result<Option<Signal>, CoreError> {
        Ok(self.signals.get(id).map(|s| s.clone()))
    }

    async fn list_active_signals(&self, symbol: &str) -> Result<Vec<Signal>, CoreError> {
        Ok(self
            .signals
            .iter()
            .filter(|s| s.symbol == symbol && s.status == SignalStatus::Active)
            .map(|s| s.clone())
            .collect())
    }

    async fn update_signal_roi(
        &self,
        symbol: &str,
        price: f64,
        now_ms: u64,
    ) -> Result<Vec<Signal>, CoreError> {
        let mut changed = Vec::new();
        for mut entry in self.signals.iter_mut() {
            let signal = entry.value_mut();
            if signal.symbol != symbol {
                continue;
            }
            if track_price(signal, price, now_ms) {
                if signal.status == SignalStatus::Closed {
                    info!(
                        id = %signal.id,
                        symbol = %signal.symbol,
                        roi_pct = signal.roi_pct,
                        sl_hit = signal.sl_hit,
                        "signal closed"
                    );
                }
                changed.push(signal.clone());
            }
        }
        Ok(changed)
    }

    async fn close_signal(&self, id: &str, now_ms: u64) -> Result<Option<Signal>, CoreError> {
        let Some(mut entry) = self.signals.get_mut(id) else {
            return Ok(None);
        };
        let signal = entry.value_mut();
        if signal.status == SignalStatus::Active {
            signal.status = SignalStatus::Closed;
            signal.closed_at_ms = Some(now_ms);
            info!(id = %signal.id, symbol = %signal.symbol, "signal closed on request");
        }
        Ok(Some(signal.clone()))
    }

    async fn latest_close_ms(&self, symbol: &str) -> Result<Option<u64>, CoreError> {
        Ok(self
            .signals
            .iter()
            .filter(|s| s.symbol == symbol)
            .filter_map(|s| s.closed_at_ms)
            .max())
    }
}

#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;
    use crate::engine::types::{
        AiMetadata, ConfidenceTier, MarketRegime, MtfAlignment, ScenarioKind,
    };
    use crate::market::mtf::TrendDirection;
    use crate::market::validator::ValidationStatus;

    /// An ACTIVE LONG at 50k with the stock 1.5% stop and 2/4/6% targets.
    pub(crate) fn active_long(id: &str, symbol: &str) -> Signal {
        Signal {
            id: id.to_string(),
            symbol: symbol.to_string(),
            direction: Direction::Long,
            scenario_id: "MOMO_LONG".to_string(),
            scenario_name: "Momentum continuation".to_string(),
            scenario_kind: ScenarioKind::Momentum,
            tier: ConfidenceTier::Deal,
            status: SignalStatus::Active,
            created_at_ms: 1_000,
            closed_at_ms: None,
            entry_price: 50_000.0,
            stop_loss: 49_250.0,
            tp1: 51_000.0,
            tp2: 52_000.0,
            tp3: 53_000.0,
            ai: AiMetadata {
                match_score: 0.8,
                relevance: 1.0,
                stability: 0.7,
                diversity: 1.0,
                composite: 0.9,
                mtf_alignment: MtfAlignment::Strong,
                mtf_score: 0.8,
                adx: 30.0,
                adx_multiplier: 1.15,
                regime: MarketRegime::StrongTrend,
                trend_1h: TrendDirection::Bullish,
                trend_4h: TrendDirection::Bullish,
                trend_1d: TrendDirection::Bullish,
                volume_ratio: 1.2,
                cvd_trend: "rising".to_string(),
                risk_reward: 1.33,
                validation_status: ValidationStatus::Valid,
                validation_confidence: 100.0,
                fallback: false,
            },
            roi_pct: 0.0,
            tp1_hit: false,
            tp2_hit: false,
            tp3_hit: false,
            sl_hit: false,
            max_favorable_pct: 0.0,
            max_adverse_pct: 0.0,
        }
    }
}
