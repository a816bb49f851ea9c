use crate::events::{Side, TradeEvent, Venue};
use dashmap::DashMap;
use std::collections::VecDeque;

const WINDOW_5M_MS: u64 = 300_000;
const WINDOW_15M_MS: u64 = 900_000;
const WHALE_RING_CAP: usize = 100;
/// A whale print within this fraction of the 15m extreme counts as absorption.
const ABSORPTION_BAND: f64 = 0.003;

/// Single trade at or above the whale notional threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct WhalePrint {
    pub venue: Venue,
    pub ts_ms: u64,
    pub side: Side,
    pub price: f64,
    pub qty: f64,
    pub notional: f64,
}

/// Point-in-time view of a symbol's aggregated order flow.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CvdSnapshot {
    /// Signed notional sums (buys positive).
    pub cvd_5m: f64,
    pub cvd_15m: f64,
    /// cvd_15m as a percentage of total 15m turnover, in [-100, 100].
    pub cvd_percent: f64,
    /// Last 5m signed flow minus the 5m before it.
    pub slope: f64,
    /// CVD and price moved the same direction over the window.
    pub confirms: bool,
    /// Last minus first trade price over the window.
    pub price_change_15m: f64,
    pub whale_count_15m: usize,
    pub whale_net_notional_15m: f64,
    /// Whale sells printed near the 15m high / buys near the 15m low.
    pub absorption_high: bool,
    pub absorption_low: bool,
}

#[derive(Debug)]
struct FlowSample {
    ts_ms: u64,
    signed_notional: f64,
    abs_notional: f64,
    price: f64,
}

#[derive(Debug, Default)]
struct SymbolFlow {
    /// Pruned to the 15m window on every insert.
    trades: VecDeque<FlowSample>,
    whales: VecDeque<WhalePrint>,
}

/// Venue-fused cumulative volume delta plus whale print tracking, per symbol.
pub struct CvdTracker {
    whale_notional_usd: f64,
    state: DashMap<String, SymbolFlow>,
}

impl CvdTracker {
    pub fn new(whale_notional_usd: f64) -> Self {
        CvdTracker {
            whale_notional_usd,
            state: DashMap::new(),
        }
    }

    pub fn record(&self, trade: &TradeEvent) {
        let notional = trade.notional();
        if !notional.is_finite() || notional <= 0.0 {
            return;
        }
        let mut flow = self.state.entry(trade.symbol.clone()).or_default();
        let horizon = trade.ts_ms.saturating_sub(WINDOW_15M_MS);
        while flow.trades.front().is_some_and(|s| s.ts_ms < horizon) {
            flow.trades.pop_front();
        }
        flow.trades.push_back(FlowSample {
            ts_ms: trade.ts_ms,
            signed_notional: trade.signed_notional(),
            abs_notional: notional,
            price: trade.price,
        });
        if notional >= self.whale_notional_usd {
            if flow.whales.len() == WHALE_RING_CAP {
                flow.whales.pop_front();
            }
            flow.whales.push_back(WhalePrint {
                venue: trade.venue,
                ts_ms: trade.ts_ms,
                side: trade.side,
                price: trade.price,
                qty: trade.qty,
                notional,
            });
        }
    }

    pub fn snapshot(&self, symbol: &str, now_ms: u64) -> CvdSnapshot {
        let Some(flow) = self.state.get(symbol) else {
            return CvdSnapshot::default();
        };
        let cut_15m = now_ms.saturating_sub(WINDOW_15M_MS);
        let cut_10m = now_ms.saturating_sub(2 * WINDOW_5M_MS);
        let cut_5m = now_ms.saturating_sub(WINDOW_5M_MS);

        let mut cvd_5m = 0.0;
        let mut cvd_15m = 0.0;
        let mut prev_5m = 0.0;
        let mut turnover_15m = 0.0;
        let mut first_price = None;
        let mut last_price = None;
        let mut low = f64::MAX;
        let mut high = f64::MIN;
        for sample in flow.trades.iter().filter(|s| s.ts_ms >= cut_15m && s.ts_ms <= now_ms) {
            cvd_15m += sample.signed_notional;
            turnover_15m += sample.abs_notional;
            if sample.ts_ms >= cut_5m {
                cvd_5m += sample.signed_notional;
            } else if sample.ts_ms >= cut_10m {
                prev_5m += sample.signed_notional;
            }
            if first_price.is_none() {
                first_price = Some(sample.price);
            }
            last_price = Some(sample.price);
            low = low.min(sample.price);
            high = high.max(sample.price);
        }

        let cvd_percent = if turnover_15m > 0.0 {
            100.0 * cvd_15m / turnover_15m
        } else {
            0.0
        };
        let price_change_15m = match (first_price, last_price) {
            (Some(first), Some(last)) => last - first,
            _ => 0.0,
        };
        let confirms = first_price.is_some()
            && ((cvd_15m > 0.0 && price_change_15m > 0.0)
                || (cvd_15m < 0.0 && price_change_15m < 0.0));

        let mut whale_count_15m = 0;
        let mut whale_net = 0.0;
        let mut absorption_high = false;
        let mut absorption_low = false;
        for print in flow.whales.iter().filter(|w| w.ts_ms >= cut_15m && w.ts_ms <= now_ms) {
            whale_count_15m += 1;
            whale_net += match print.side {
                Side::Buy => print.notional,
                Side::Sell => -print.notional,
            };
            if low < high {
                let near_low = (print.price - low).abs() / low <= ABSORPTION_BAND;
                let near_high = (high - print.price).abs() / high <= ABSORPTION_BAND;
                if print.side == Side::Buy && near_low {
                    absorption_low = true;
                }
                if print.side == Side::Sell && near_high {
                    absorption_high = true;
                }
            }
        }

        CvdSnapshot {
            cvd_5m,
            cvd_15m,
            cvd_percent,
            slope: cvd_5m - prev_5m,
            confirms,
            price_change_15m,
            whale_count_15m,
            whale_net_notional_15m: whale_net,
            absorption_high,
            absorption_low,
        }
    }

    /// Whale prints currently retained for the symbol, oldest first.
    pub fn whale_prints(&self, symbol: &str) -> Vec<WhalePrint> {
        self.state
            .get(symbol)
            .map(|flow| flow.whales.iter().cloned().collect())
            .unwrap_or_default()
    }
}
