use crate::engine::types::MarketRegime;
use dashmap::DashMap;
use std::collections::VecDeque;

/// Samples kept per symbol for the moving averages.
const HISTORY_CAP: usize = 20;
/// Below this many samples the regime stays UNKNOWN.
const MIN_SAMPLES: usize = 5;

const HIGH_VOL_ATR_PCT: f64 = 2.5;
const RANGING_ATR_PCT: f64 = 0.5;
const RANGING_ADX_MA: f64 = 18.0;
const STRONG_ADX_MA: f64 = 22.0;
const STRONG_ADX: f64 = 20.0;
const MEDIUM_ADX_MA: f64 = 18.0;
const MEDIUM_ADX: f64 = 16.0;

/// Per-regime knobs applied on top of scenario tactics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdaptiveConfig {
    pub min_adx: f64,
    pub tp_multiplier: f64,
    pub sl_multiplier: f64,
    pub volume_requirement: f64,
    pub trade: bool,
}

impl AdaptiveConfig {
    pub fn for_regime(regime: MarketRegime) -> AdaptiveConfig {
        match regime {
            MarketRegime::StrongTrend => AdaptiveConfig {
                min_adx: 20.0,
                tp_multiplier: 1.2,
                sl_multiplier: 1.0,
                volume_requirement: 1.0,
                trade: true,
            },
            MarketRegime::MediumTrend => AdaptiveConfig {
                min_adx: 18.0,
                tp_multiplier: 1.0,
                sl_multiplier: 1.0,
                volume_requirement: 1.1,
                trade: true,
            },
            MarketRegime::HighVol => AdaptiveConfig {
                min_adx: 40.0,
                tp_multiplier: 1.5,
                sl_multiplier: 1.3,
                volume_requirement: 1.5,
                trade: true,
            },
            MarketRegime::Ranging => AdaptiveConfig {
                min_adx: 15.0,
                tp_multiplier: 0.8,
                sl_multiplier: 0.8,
                volume_requirement: 1.2,
                trade: true,
            },
            MarketRegime::Choppy => AdaptiveConfig {
                min_adx: 25.0,
                tp_multiplier: 0.8,
                sl_multiplier: 1.0,
                volume_requirement: 1.5,
                trade: false,
            },
            MarketRegime::Unknown => AdaptiveConfig {
                min_adx: 20.0,
                tp_multiplier: 1.0,
                sl_multiplier: 1.0,
                volume_requirement: 1.0,
                trade: false,
            },
        }
    }
}

/// A classified regime together with the inputs that produced it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegimeAssessment {
    pub regime: MarketRegime,
    pub adaptive: AdaptiveConfig,
    pub atr_pct: f64,
    pub atr_pct_ma20: f64,
    pub adx: f64,
    pub adx_ma20: f64,
    pub samples: usize,
}

#[derive(Debug, Default)]
struct RegimeHistory {
    atr_pct: VecDeque<f64>,
    adx: VecDeque<f64>,
}

impl RegimeHistory {
    fn push(&mut self, atr_pct: f64, adx: f64) {
        self.atr_pct.push_back(atr_pct);
        self.adx.push_back(adx);
        while self.atr_pct.len() > HISTORY_CAP {
            self.atr_pct.pop_front();
        }
        while self.adx.len() > HISTORY_CAP {
            self.adx.pop_front();
        }
    }

    fn mean(values: &VecDeque<f64>) -> f64 {
        if values.is_empty() {
            return 0.0;
        }
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Classifies each symbol's market regime from rolling ATR% and ADX
/// samples of the 1h base series.
#[derive(Debug, Default)]
pub struct RegimeDetector {
    history: DashMap<String, RegimeHistory>,
}

impl RegimeDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one sample. Non-finite inputs are dropped so a bad tick
    /// cannot poison the moving averages.
    pub fn observe(&self, symbol: &str, atr_pct: f64, adx: f64) {
        if !atr_pct.is_finite() || !adx.is_finite() {
            return;
        }
        self.history
            .entry(symbol.to_string())
            .or_default()
            .push(atr_pct, adx);
    }

    pub fn assess(&self, symbol: &str) -> RegimeAssessment {
        let (atr_pct, atr_pct_ma20, adx, adx_ma20, samples) = match self.history.get(symbol) {
            Some(h) => (
                h.atr_pct.back().copied().unwrap_or(0.0),
                RegimeHistory::mean(&h.atr_pct),
                h.adx.back().copied().unwrap_or(0.0),
                RegimeHistory::mean(&h.adx),
                h.adx.len(),
            ),
            None => (0.0, 0.0, 0.0, 0.0, 0),
        };

        let regime = if samples < MIN_SAMPLES {
            MarketRegime::Unknown
        } else if atr_pct > HIGH_VOL_ATR_PCT {
            MarketRegime::HighVol
        } else if adx_ma20 > STRONG_ADX_MA && adx > STRONG_ADX {
            MarketRegime::StrongTrend
        } else if adx_ma20 > MEDIUM_ADX_MA && adx > MEDIUM_ADX {
            MarketRegime::MediumTrend
        } else if atr_pct < RANGING_ATR_PCT && adx_ma20 < RANGING_ADX_MA {
            MarketRegime::Ranging
        } else {
            MarketRegime::Choppy
        };

        RegimeAssessment {
            regime,
            adaptive: AdaptiveConfig::for_regime(regime),
            atr_pct,
            atr_pct_ma20,
            adx,
            adx_ma20,
            samples,
        }
    }
}
