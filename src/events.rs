use serde::{Deserialize, Serialize};

// ============================================================================
// Venue / side / timeframe identifiers
// ============================================================================

/// Venues the core consumes market data from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Venue {
    Binance,
    Bybit,
    Okx,
}

impl Venue {
    pub const ALL: [Venue; 3] = [Venue::Binance, Venue::Bybit, Venue::Okx];

    pub fn as_str(&self) -> &'static str {
        match self {
            Venue::Binance => "binance",
            Venue::Bybit => "bybit",
            Venue::Okx => "okx",
        }
    }
}

impl std::fmt::Display for Venue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggressor side of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

/// Timeframes tracked by the MTF cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
}

impl Timeframe {
    pub const ALL: [Timeframe; 3] = [Timeframe::H1, Timeframe::H4, Timeframe::D1];

    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
            Timeframe::D1 => "1d",
        }
    }

    pub fn secs(&self) -> u64 {
        match self {
            Timeframe::H1 => 3_600,
            Timeframe::H4 => 14_400,
            Timeframe::D1 => 86_400,
        }
    }

    pub fn parse(s: &str) -> Option<Timeframe> {
        match s {
            "1h" | "60" | "1H" => Some(Timeframe::H1),
            "4h" | "240" | "4H" => Some(Timeframe::H4),
            "1d" | "D" | "1D" => Some(Timeframe::D1),
            _ => None,
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Normalized feed events
// ============================================================================

/// One price level of an L2 book.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: f64,
    pub qty: f64,
}

/// L2 depth update normalized out of a venue book stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBookEvent {
    pub venue: Venue,
    pub symbol: String,
    pub ts_ms: u64,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
}

/// A single execution normalized out of a venue trade stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeEvent {
    pub venue: Venue,
    pub symbol: String,
    pub ts_ms: u64,
    pub side: Side,
    pub price: f64,
    pub qty: f64,
    /// Maker flag as reported by the venue, when it reports one.
    pub buyer_is_maker: Option<bool>,
}

impl TradeEvent {
    pub fn notional(&self) -> f64 {
        self.price * self.qty
    }

    /// Notional signed by aggressor side: buys positive, sells negative.
    pub fn signed_notional(&self) -> f64 {
        match self.side {
            Side::Buy => self.notional(),
            Side::Sell => -self.notional(),
        }
    }
}

/// Candle update from a venue kline stream. Only `closed == true` events
/// are folded into candle series.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KlineEvent {
    pub venue: Venue,
    pub symbol: String,
    pub interval: Timeframe,
    pub ts_open_ms: u64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub closed: bool,
}
