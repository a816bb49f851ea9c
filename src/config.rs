use crate::error::CoreError;
use serde::{Deserialize, Serialize};

/// Weights for the scoreable condition categories of a scenario.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CategoryWeights {
    pub mtf: f64,
    pub exocharts: f64,
    pub cvd: f64,
    pub clusters: f64,
    pub news: f64,
    pub triggers: f64,
}

impl Default for CategoryWeights {
    fn default() -> Self {
        CategoryWeights {
            mtf: 0.30,
            exocharts: 0.25,
            cvd: 0.15,
            clusters: 0.15,
            news: 0.10,
            triggers: 0.05,
        }
    }
}

impl CategoryWeights {
    pub fn sum(&self) -> f64 {
        self.mtf + self.exocharts + self.cvd + self.clusters + self.news + self.triggers
    }

    /// Weight for a scoreable category key. Recognized but unweighted keys
    /// (advisory blocks such as `trend_strength`) return None and stay out
    /// of score normalization.
    pub fn weight_for(&self, key: &str) -> Option<f64> {
        match key {
            "mtf" => Some(self.mtf),
            "exocharts" => Some(self.exocharts),
            "cvd" => Some(self.cvd),
            "clusters" => Some(self.clusters),
            "news" => Some(self.news),
            "triggers" => Some(self.triggers),
            _ => None,
        }
    }
}

/// Runtime configuration for the signal core. Defaults are production
/// values; any field can be overridden through `SIGNALGEN_*` env vars.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    pub tracked_symbols: Vec<String>,
    pub scenario_files: Vec<String>,

    /// Seconds between signal-generation ticks per symbol.
    pub signal_cadence_secs: u64,
    /// Seconds between MTF cache refreshes per symbol.
    pub mtf_refresh_secs: u64,
    /// Latest-price entries older than this are treated as absent.
    pub price_stale_secs: u64,
    pub http_timeout_secs: u64,

    /// Single trade notional (USD) at or above which a trade is a whale print.
    pub whale_notional_usd: f64,

    pub deal_threshold: f64,
    pub risky_threshold: f64,
    pub observation_threshold: f64,

    /// Cross-venue deviation ratios: above warning the context degrades,
    /// above invalid the cycle is rejected.
    pub deviation_warning: f64,
    pub deviation_invalid: f64,
    /// Consecutive INVALID validation cycles before the veto trips.
    pub consecutive_invalid_veto: u32,
    /// Seconds after a signal closes before the symbol may signal again.
    pub signal_cooldown_secs: u64,

    pub category_weights: CategoryWeights,
    pub diversity_weight: f64,

    /// Closed candles retained per (symbol, timeframe) series.
    pub candle_capacity: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        CoreConfig {
            tracked_symbols: vec![
                "BTCUSDT".to_string(),
                "ETHUSDT".to_string(),
                "SOLUSDT".to_string(),
            ],
            scenario_files: vec!["scenarios.json".to_string()],
            signal_cadence_secs: 60,
            mtf_refresh_secs: 300,
            price_stale_secs: 30,
            http_timeout_secs: 10,
            whale_notional_usd: 50_000.0,
            deal_threshold: 0.15,
            risky_threshold: 0.10,
            observation_threshold: 0.05,
            deviation_warning: 0.001,
            deviation_invalid: 0.005,
            consecutive_invalid_veto: 3,
            signal_cooldown_secs: 1_800,
            category_weights: CategoryWeights::default(),
            diversity_weight: 0.20,
            candle_capacity: 500,
        }
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_list(key: &str, default: Vec<String>) -> Vec<String> {
    match std::env::var(key) {
        Ok(raw) => {
            let items: Vec<String> = raw
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if items.is_empty() {
                default
            } else {
                items
            }
        }
        Err(_) => default,
    }
}

impl CoreConfig {
    /// Build from defaults plus `SIGNALGEN_*` env overrides, then validate.
    pub fn from_env() -> Result<Self, CoreError> {
        let d = CoreConfig::default();
        let config = CoreConfig {
            tracked_symbols: env_list("SIGNALGEN_SYMBOLS", d.tracked_symbols),
            scenario_files: env_list("SIGNALGEN_SCENARIOS", d.scenario_files),
            signal_cadence_secs: env_u64("SIGNALGEN_SIGNAL_CADENCE_SECS", d.signal_cadence_secs),
            mtf_refresh_secs: env_u64("SIGNALGEN_MTF_REFRESH_SECS", d.mtf_refresh_secs),
            price_stale_secs: env_u64("SIGNALGEN_PRICE_STALE_SECS", d.price_stale_secs),
            http_timeout_secs: env_u64("SIGNALGEN_HTTP_TIMEOUT_SECS", d.http_timeout_secs),
            whale_notional_usd: env_f64("SIGNALGEN_WHALE_NOTIONAL_USD", d.whale_notional_usd),
            deal_threshold: env_f64("SIGNALGEN_DEAL_THRESHOLD", d.deal_threshold),
            risky_threshold: env_f64("SIGNALGEN_RISKY_THRESHOLD", d.risky_threshold),
            observation_threshold: env_f64(
                "SIGNALGEN_OBSERVATION_THRESHOLD",
                d.observation_threshold,
            ),
            deviation_warning: env_f64("SIGNALGEN_DEVIATION_WARNING", d.deviation_warning),
            deviation_invalid: env_f64("SIGNALGEN_DEVIATION_INVALID", d.deviation_invalid),
            consecutive_invalid_veto: env_u64(
                "SIGNALGEN_CONSECUTIVE_INVALID_VETO",
                d.consecutive_invalid_veto as u64,
            ) as u32,
            signal_cooldown_secs: env_u64("SIGNALGEN_SIGNAL_COOLDOWN_SECS", d.signal_cooldown_secs),
            category_weights: d.category_weights,
            diversity_weight: env_f64("SIGNALGEN_DIVERSITY_WEIGHT", d.diversity_weight),
            candle_capacity: env_usize("SIGNALGEN_CANDLE_CAPACITY", d.candle_capacity),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.tracked_symbols.is_empty() {
            return Err(CoreError::Config("tracked_symbols must not be empty".into()));
        }
        if self.scenario_files.is_empty() {
            return Err(CoreError::Config("scenario_files must not be empty".into()));
        }
        if self.signal_cadence_secs == 0 || self.mtf_refresh_secs == 0 {
            return Err(CoreError::Config(
                "signal_cadence_secs and mtf_refresh_secs must be positive".into(),
            ));
        }
        if self.whale_notional_usd <= 0.0 {
            return Err(CoreError::Config("whale_notional_usd must be positive".into()));
        }
        if !(self.deal_threshold > self.risky_threshold
            && self.risky_threshold > self.observation_threshold
            && self.observation_threshold > 0.0)
        {
            return Err(CoreError::Config(format!(
                "confidence thresholds must satisfy deal > risky > observation > 0, got {} / {} / {}",
                self.deal_threshold, self.risky_threshold, self.observation_threshold
            )));
        }
        if !(self.deviation_invalid > self.deviation_warning && self.deviation_warning > 0.0) {
            return Err(CoreError::Config(format!(
                "deviation thresholds must satisfy invalid > warning > 0, got {} / {}",
                self.deviation_invalid, self.deviation_warning
            )));
        }
        if self.consecutive_invalid_veto == 0 {
            return Err(CoreError::Config(
                "consecutive_invalid_veto must be at least 1".into(),
            ));
        }
        let weight_sum = self.category_weights.sum();
        if (weight_sum - 1.0).abs() > 1e-6 {
            return Err(CoreError::Config(format!(
                "category weights must sum to 1.0, got {weight_sum}"
            )));
        }
        if !(0.0..=1.0).contains(&self.diversity_weight) {
            return Err(CoreError::Config(format!(
                "diversity_weight must be in [0, 1], got {}",
                self.diversity_weight
            )));
        }
        if self.candle_capacity < 100 {
            return Err(CoreError::Config(format!(
                "candle_capacity must be at least 100, got {}",
                self.candle_capacity
            )));
        }
        Ok(())
    }

    /// MTF entries older than twice the refresh interval are stale.
    pub fn mtf_stale_after_secs(&self) -> u64 {
        self.mtf_refresh_secs * 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(CoreConfig::default().validate().is_ok());
    }

    #[test]
    fn test_default_weights_sum_to_one() {
        let sum = CategoryWeights::default().sum();
        assert!((sum - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_threshold_ordering_enforced() {
        let mut config = CoreConfig::default();
        config.risky_threshold = 0.20;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_deviation_ordering_enforced() {
        let mut config = CoreConfig::default();
        config.deviation_invalid = 0.0005;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_candle_capacity_floor() {
        let mut config = CoreConfig::default();
        config.candle_capacity = 50;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_mtf_staleness_window() {
        let config = CoreConfig::default();
        assert_eq!(config.mtf_stale_after_secs(), 600);
    }
}
