use crate::events::{OrderBookEvent, PriceLevel, TradeEvent, Venue};
use dashmap::DashMap;

/// Long/short ratios are capped so a one-sided book stays finite.
const MAX_LS_RATIO: f64 = 100.0;

/// A cluster is this many consecutive levels, each holding at least
/// CLUSTER_DOMINANCE times the opposing side's mean level size.
const CLUSTER_RUN: usize = 3;
const CLUSTER_DOMINANCE: f64 = 3.0;

/// Scalar copy of one venue book, safe to hand across tasks.
#[derive(Debug, Clone, PartialEq)]
pub struct BookSummary {
    pub venue: Venue,
    pub symbol: String,
    pub ts_ms: u64,
    pub best_bid: f64,
    pub best_ask: f64,
    pub mid: f64,
    pub bid_volume: f64,
    pub ask_volume: f64,
    /// (bidVol - askVol) / (bidVol + askVol), in [-1, 1].
    pub imbalance: f64,
    /// bidVol / askVol, capped at MAX_LS_RATIO.
    pub ls_ratio: f64,
    /// Oversized level runs on the bid / ask side.
    pub stacked_imbalance_up: bool,
    pub stacked_imbalance_down: bool,
}

fn has_cluster(levels: &[PriceLevel], opposing: &[PriceLevel]) -> bool {
    if levels.len() < CLUSTER_RUN || opposing.is_empty() {
        return false;
    }
    let opposing_mean = opposing.iter().map(|l| l.qty).sum::<f64>() / opposing.len() as f64;
    if opposing_mean <= 0.0 {
        return false;
    }
    let mut run = 0;
    for level in levels {
        if level.qty >= CLUSTER_DOMINANCE * opposing_mean {
            run += 1;
            if run >= CLUSTER_RUN {
                return true;
            }
        } else {
            run = 0;
        }
    }
    false
}

#[derive(Debug, Default)]
struct BookState {
    /// Bids descending, asks ascending by price.
    bids: Vec<PriceLevel>,
    asks: Vec<PriceLevel>,
    ts_ms: u64,
}

impl BookState {
    fn merge_side(levels: &mut Vec<PriceLevel>, update: &PriceLevel, descending: bool) {
        let found = levels.binary_search_by(|probe| {
            if descending {
                update.price.partial_cmp(&probe.price).unwrap_or(std::cmp::Ordering::Equal)
            } else {
                probe.price.partial_cmp(&update.price).unwrap_or(std::cmp::Ordering::Equal)
            }
        });
        match found {
            Ok(i) => {
                if update.qty <= 0.0 {
                    levels.remove(i);
                } else {
                    levels[i].qty = update.qty;
                }
            }
            Err(i) => {
                if update.qty > 0.0 {
                    levels.insert(i, *update);
                }
            }
        }
    }

    fn summarize(&self, venue: Venue, symbol: &str) -> Option<BookSummary> {
        let best_bid = self.bids.first()?.price;
        let best_ask = self.asks.first()?.price;
        let bid_volume: f64 = self.bids.iter().map(|l| l.qty).sum();
        let ask_volume: f64 = self.asks.iter().map(|l| l.qty).sum();
        let total = bid_volume + ask_volume;
        let imbalance = if total > 0.0 {
            (bid_volume - ask_volume) / total
        } else {
            0.0
        };
        let ls_ratio = if ask_volume <= f64::EPSILON {
            if bid_volume <= f64::EPSILON {
                1.0
            } else {
                MAX_LS_RATIO
            }
        } else {
            (bid_volume / ask_volume).min(MAX_LS_RATIO)
        };
        Some(BookSummary {
            venue,
            symbol: symbol.to_string(),
            ts_ms: self.ts_ms,
            best_bid,
            best_ask,
            mid: (best_bid + best_ask) / 2.0,
            bid_volume,
            ask_volume,
            imbalance,
            ls_ratio,
            stacked_imbalance_up: has_cluster(&self.bids, &self.asks),
            stacked_imbalance_down: has_cluster(&self.asks, &self.bids),
        })
    }
}

/// Latest L2 book per (venue, symbol), plus last trade prices. Writers are
/// the venue connectors; readers take scalar summaries only.
pub struct OrderBookStore {
    books: DashMap<(Venue, String), BookState>,
    last_trade: DashMap<(Venue, String), (f64, u64)>,
}

impl OrderBookStore {
    pub fn new() -> Self {
        OrderBookStore {
            books: DashMap::new(),
            last_trade: DashMap::new(),
        }
    }

    /// Replaces the stored book with the event's levels.
    pub fn apply_snapshot(&self, event: &OrderBookEvent) {
        let mut bids = event.bids.clone();
        let mut asks = event.asks.clone();
        bids.sort_by(|a, b| b.price.partial_cmp(&a.price).unwrap_or(std::cmp::Ordering::Equal));
        asks.sort_by(|a, b| a.price.partial_cmp(&b.price).unwrap_or(std::cmp::Ordering::Equal));
        self.books.insert(
            (event.venue, event.symbol.clone()),
            BookState {
                bids,
                asks,
                ts_ms: event.ts_ms,
            },
        );
    }

    /// Merges delta levels into the stored book. Quantity zero removes the
    /// level. A delta with no prior snapshot seeds a fresh book.
    pub fn apply_delta(&self, event: &OrderBookEvent) {
        let mut entry = self
            .books
            .entry((event.venue, event.symbol.clone()))
            .or_default();
        for level in &event.bids {
            BookState::merge_side(&mut entry.bids, level, true);
        }
        for level in &event.asks {
            BookState::merge_side(&mut entry.asks, level, false);
        }
        entry.ts_ms = event.ts_ms;
    }

    pub fn record_trade(&self, trade: &TradeEvent) {
        self.last_trade.insert(
            (trade.venue, trade.symbol.clone()),
            (trade.price, trade.ts_ms),
        );
    }

    pub fn summary(&self, venue: Venue, symbol: &str) -> Option<BookSummary> {
        self.books
            .get(&(venue, symbol.to_string()))
            .and_then(|state| state.summarize(venue, symbol))
    }

    /// Summaries from every venue currently holding a book for the symbol.
    pub fn summaries(&self, symbol: &str) -> Vec<BookSummary> {
        Venue::ALL
            .iter()
            .filter_map(|&venue| self.summary(venue, symbol))
            .collect()
    }

    /// Last trade prices per venue no older than `stale_secs`.
    pub fn venue_prices(&self, symbol: &str, now_ms: u64, stale_secs: u64) -> Vec<(Venue, f64)> {
        let cutoff = now_ms.saturating_sub(stale_secs * 1_000);
        Venue::ALL
            .iter()
            .filter_map(|&venue| {
                self.last_trade
                    .get(&(venue, symbol.to_string()))
                    .filter(|entry| entry.1 >= cutoff)
                    .map(|entry| (venue, entry.0))
            })
            .collect()
    }

    /// Most recent non-stale trade price across venues.
    pub fn latest_price(&self, symbol: &str, now_ms: u64, stale_secs: u64) -> Option<f64> {
        let cutoff = now_ms.saturating_sub(stale_secs * 1_000);
        Venue::ALL
            .iter()
            .filter_map(|&venue| {
                self.last_trade
                    .get(&(venue, symbol.to_string()))
                    .filter(|entry| entry.1 >= cutoff)
                    .map(|entry| *entry)
            })
            .max_by_key(|&(_, ts)| ts)
            .map(|(price, _)| price)
    }
}

impl Default for OrderBookStore {
    fn default() -> Self {
        Self::new()
    }
}
