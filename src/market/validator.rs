use crate::events::Venue;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::warn;

/// Median moving more than this (%) between cycles flags a spike.
const PRICE_SPIKE_PCT: f64 = 2.0;
/// Volume at or above this multiple of its 20-bar mean flags a spike.
const VOLUME_SPIKE_RATIO: f64 = 4.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ValidationStatus {
    /// Fewer than two fresh venue prices.
    Unverified,
    Valid,
    Warning,
    Invalid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Anomaly {
    /// Cross-venue spread wide enough to arb.
    Arbitrage { spread_pct: f64, low: Venue, high: Venue },
    PriceSpike { change_pct: f64 },
    StaleFeed { venue: Venue },
    VolumeSpike { ratio: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub symbol: String,
    pub status: ValidationStatus,
    /// (max - min) / median across fresh venue prices.
    pub deviation: f64,
    pub median_price: f64,
    pub venue_prices: Vec<(Venue, f64)>,
    pub anomalies: Vec<Anomaly>,
    /// 0-100.
    pub confidence: f64,
    pub consecutive_invalid: u32,
    pub vetoed: bool,
}

#[derive(Debug, Default)]
struct SymbolHistory {
    last_median: Option<f64>,
    seen_venues: HashSet<Venue>,
    consecutive_invalid: u32,
}

/// Compares fresh prices across venues and tracks per-symbol anomaly
/// history. Three INVALID cycles in a row veto the symbol until a
/// non-invalid cycle clears it.
pub struct CrossVenueValidator {
    warning_threshold: f64,
    invalid_threshold: f64,
    veto_after: u32,
    history: DashMap<String, SymbolHistory>,
}

fn median(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n == 0 {
        return 0.0;
    }
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    }
}

impl CrossVenueValidator {
    pub fn new(warning_threshold: f64, invalid_threshold: f64, veto_after: u32) -> Self {
        CrossVenueValidator {
            warning_threshold,
            invalid_threshold,
            veto_after: veto_after.max(1),
            history: DashMap::new(),
        }
    }

    /// Runs one validation cycle. `volume_ratio` is last volume over its
    /// 20-bar mean, when candle history is available.
    pub fn validate(
        &self,
        symbol: &str,
        prices: &[(Venue, f64)],
        volume_ratio: Option<f64>,
    ) -> ValidationReport {
        let mut fresh: Vec<(Venue, f64)> = prices
            .iter()
            .filter(|(_, p)| p.is_finite() && *p > 0.0)
            .copied()
            .collect();
        fresh.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        let sorted_prices: Vec<f64> = fresh.iter().map(|&(_, p)| p).collect();
        let median_price = median(&sorted_prices);

        let mut history = self.history.entry(symbol.to_string()).or_default();
        let mut anomalies = Vec::new();

        // Venues that reported before but are missing this cycle.
        let present: HashSet<Venue> = fresh.iter().map(|&(v, _)| v).collect();
        for &venue in &history.seen_venues {
            if !present.contains(&venue) {
                anomalies.push(Anomaly::StaleFeed { venue });
            }
        }
        history.seen_venues.extend(present.iter().copied());

        if let Some(prev) = history.last_median {
            if prev > 0.0 && median_price > 0.0 {
                let change_pct = 100.0 * (median_price - prev).abs() / prev;
                if change_pct > PRICE_SPIKE_PCT {
                    anomalies.push(Anomaly::PriceSpike { change_pct });
                }
            }
        }
        if median_price > 0.0 {
            history.last_median = Some(median_price);
        }

        if let Some(ratio) = volume_ratio {
            if ratio.is_finite() && ratio >= VOLUME_SPIKE_RATIO {
                anomalies.push(Anomaly::VolumeSpike { ratio });
            }
        }

        let (status, deviation) = if fresh.len() < 2 {
            (ValidationStatus::Unverified, 0.0)
        } else {
            let spread = sorted_prices[sorted_prices.len() - 1] - sorted_prices[0];
            let deviation = if median_price > 0.0 {
                spread / median_price
            } else {
                0.0
            };
            let status = if deviation > self.invalid_threshold {
                ValidationStatus::Invalid
            } else if deviation > self.warning_threshold {
                ValidationStatus::Warning
            } else {
                ValidationStatus::Valid
            };
            if status == ValidationStatus::Invalid {
                anomalies.push(Anomaly::Arbitrage {
                    spread_pct: deviation * 100.0,
                    low: fresh[0].0,
                    high: fresh[fresh.len() - 1].0,
                });
            }
            (status, deviation)
        };

        if status == ValidationStatus::Invalid {
            history.consecutive_invalid += 1;
        } else {
            history.consecutive_invalid = 0;
        }
        let consecutive_invalid = history.consecutive_invalid;
        let vetoed = consecutive_invalid >= self.veto_after;
        drop(history);

        let base = match status {
            ValidationStatus::Valid => 100.0,
            ValidationStatus::Unverified => 50.0,
            ValidationStatus::Warning => {
                // 90 down to 60 across the warning band.
                let span = self.invalid_threshold - self.warning_threshold;
                let depth = if span > 0.0 {
                    ((deviation - self.warning_threshold) / span).clamp(0.0, 1.0)
                } else {
                    1.0
                };
                90.0 - 30.0 * depth
            }
            ValidationStatus::Invalid => 20.0,
        };
        let confidence = (base - 10.0 * anomalies.len() as f64).clamp(0.0, 100.0);

        if vetoed {
            warn!(
                symbol,
                consecutive_invalid, deviation, "cross-venue veto active"
            );
        }

        ValidationReport {
            symbol: symbol.to_string(),
            status,
            deviation,
            median_price,
            venue_prices: fresh,
            anomalies,
            confidence,
            consecutive_invalid,
            vetoed,
        }
    }

    /// Veto state without running a cycle.
    pub fn is_vetoed(&self, symbol: &str) -> bool {
        self.history
            .get(symbol)
            .map(|h| h.consecutive_invalid >= self.veto_after)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> CrossVenueValidator {
        CrossVenueValidator::new(0.001, 0.005, 3)
    }

    #[test]
    fn test_tight_prices_validate() {
        let v = validator();
        let report = v.validate(
            "BTCUSDT",
            &[(Venue::Binance, 50_000.0), (Venue::Bybit, 50_020.0)],
            None,
        );
        assert_eq!(report.status, ValidationStatus::Valid);
        assert_eq!(report.confidence, 100.0);
        assert!(!report.vetoed);
    }

    #[test]
    fn test_single_venue_is_unverified() {
        let v = validator();
        let report = v.validate("BTCUSDT", &[(Venue::Binance, 50_000.0)], None);
        assert_eq!(report.status, ValidationStatus::Unverified);
        assert_eq!(report.deviation, 0.0);
    }

    #[test]
    fn test_wide_spread_is_invalid_with_arbitrage_anomaly() {
        let v = validator();
        let report = v.validate(
            "BTCUSDT",
            &[
                (Venue::Binance, 50_000.0),
                (Venue::Bybit, 50_020.0),
                (Venue::Okx, 50_700.0),
            ],
            None,
        );
        assert_eq!(report.status, ValidationStatus::Invalid);
        // (50700 - 50000) / 50020 ~ 1.4%
        assert!((report.deviation - 0.013994).abs() < 1e-4);
        assert!(matches!(
            report.anomalies.as_slice(),
            [Anomaly::Arbitrage { low: Venue::Binance, high: Venue::Okx, .. }]
        ));
    }

    #[test]
    fn test_veto_trips_after_three_invalid_cycles() {
        let v = validator();
        let wide = [(Venue::Binance, 50_000.0), (Venue::Okx, 50_700.0)];
        assert!(!v.validate("BTCUSDT", &wide, None).vetoed);
        assert!(!v.validate("BTCUSDT", &wide, None).vetoed);
        let third = v.validate("BTCUSDT", &wide, None);
        assert_eq!(third.consecutive_invalid, 3);
        assert!(third.vetoed);
        assert!(v.is_vetoed("BTCUSDT"));

        // A clean cycle clears the counter.
        let clean = v.validate(
            "BTCUSDT",
            &[(Venue::Binance, 50_000.0), (Venue::Okx, 50_010.0)],
            None,
        );
        assert!(!clean.vetoed);
        assert!(!v.is_vetoed("BTCUSDT"));
    }

    #[test]
    fn test_warning_band_scales_confidence() {
        let v = validator();
        let report = v.validate(
            "BTCUSDT",
            &[(Venue::Binance, 50_000.0), (Venue::Bybit, 50_150.0)],
            None,
        );
        assert_eq!(report.status, ValidationStatus::Warning);
        assert!(report.confidence < 90.0 && report.confidence >= 60.0);
    }

    #[test]
    fn test_stale_feed_and_spike_anomalies() {
        let v = validator();
        v.validate(
            "BTCUSDT",
            &[(Venue::Binance, 50_000.0), (Venue::Bybit, 50_010.0)],
            None,
        );
        // Bybit drops out and the median jumps over 2%.
        let report = v.validate("BTCUSDT", &[(Venue::Binance, 52_000.0)], Some(5.0));
        assert!(report
            .anomalies
            .contains(&Anomaly::StaleFeed { venue: Venue::Bybit }));
        assert!(report
            .anomalies
            .iter()
            .any(|a| matches!(a, Anomaly::PriceSpike { .. })));
        assert!(report
            .anomalies
            .iter()
            .any(|a| matches!(a, Anomaly::VolumeSpike { ratio } if *ratio == 5.0)));
    }
}
