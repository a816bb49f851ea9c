use crate::events::{KlineEvent, OrderBookEvent, PriceLevel, Side, Timeframe, TradeEvent, Venue};
use crate::utils::epoch_ms;
use serde_json::Value;
use smallvec::SmallVec;

/// Up to this many trades arrive batched in one venue frame.
pub type TradeBatch = SmallVec<[TradeEvent; 4]>;

/// Turns raw venue frames into normalized events. Anything that does not
/// match the expected shape yields `None` / an empty batch and is skipped.
pub trait VenueParser: Send + Sync {
    fn venue(&self) -> Venue;
    fn parse_book(&self, json: &Value) -> Option<OrderBookEvent>;
    fn parse_trades(&self, json: &Value) -> TradeBatch;
    fn parse_kline(&self, json: &Value) -> Option<KlineEvent>;
}

/// Collapses venue symbol spellings ("BTC-USDT", "btcusdt", the OKX
/// "BTC-USDT-SWAP" instrument form) to "BTCUSDT".
pub fn normalize_symbol(raw: &str) -> String {
    let raw = raw.strip_suffix("-SWAP").unwrap_or(raw);
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Parses `[["price","qty"], ...]` rows, tolerating extra trailing columns.
fn parse_levels(value: &Value) -> Vec<PriceLevel> {
    value
        .as_array()
        .map(|rows| {
            rows.iter()
                .filter_map(|row| {
                    let row = row.as_array()?;
                    let price: f64 = row.first()?.as_str()?.parse().ok()?;
                    let qty: f64 = row.get(1)?.as_str()?.parse().ok()?;
                    Some(PriceLevel { price, qty })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn str_f64(json: &Value, key: &str) -> Option<f64> {
    json.get(key).and_then(|v| v.as_str()).and_then(|s| s.parse().ok())
}

// ============================================================================
// Binance (combined stream frames: {"stream": "...", "data": {...}})
// ============================================================================

pub struct BinanceParser;

impl BinanceParser {
    fn stream_symbol(json: &Value) -> Option<String> {
        json.get("stream")
            .and_then(|v| v.as_str())
            .and_then(|s| s.split('@').next())
            .map(normalize_symbol)
    }

    fn stream_kind<'a>(json: &'a Value) -> Option<&'a str> {
        json.get("stream")
            .and_then(|v| v.as_str())
            .and_then(|s| s.split('@').nth(1))
    }
}

impl VenueParser for BinanceParser {
    fn venue(&self) -> Venue {
        Venue::Binance
    }

    fn parse_book(&self, json: &Value) -> Option<OrderBookEvent> {
        if !Self::stream_kind(json)?.starts_with("depth") {
            return None;
        }
        let symbol = Self::stream_symbol(json)?;
        let data = json.get("data")?;
        let bids = parse_levels(data.get("bids")?);
        let asks = parse_levels(data.get("asks")?);
        if bids.is_empty() && asks.is_empty() {
            return None;
        }
        Some(OrderBookEvent {
            venue: Venue::Binance,
            symbol,
            // Partial depth frames carry no event time.
            ts_ms: epoch_ms(),
            bids,
            asks,
        })
    }

    fn parse_trades(&self, json: &Value) -> TradeBatch {
        let mut out = TradeBatch::new();
        let Some(data) = json.get("data") else {
            return out;
        };
        if data.get("e").and_then(|v| v.as_str()) != Some("aggTrade") {
            return out;
        }
        let parsed = (|| {
            let symbol = data.get("s").and_then(|v| v.as_str()).map(normalize_symbol)?;
            let price = str_f64(data, "p")?;
            let qty = str_f64(data, "q")?;
            let ts_ms = data.get("T").and_then(|v| v.as_u64())?;
            let buyer_is_maker = data.get("m").and_then(|v| v.as_bool())?;
            // Buyer as maker means the aggressor sold into the bid.
            let side = if buyer_is_maker { Side::Sell } else { Side::Buy };
            Some(TradeEvent {
                venue: Venue::Binance,
                symbol,
                ts_ms,
                side,
                price,
                qty,
                buyer_is_maker: Some(buyer_is_maker),
            })
        })();
        if let Some(trade) = parsed {
            out.push(trade);
        }
        out
    }

    fn parse_kline(&self, json: &Value) -> Option<KlineEvent> {
        let data = json.get("data")?;
        if data.get("e").and_then(|v| v.as_str()) != Some("kline") {
            return None;
        }
        let k = data.get("k")?;
        let symbol = k.get("s").and_then(|v| v.as_str()).map(normalize_symbol)?;
        let interval = k.get("i").and_then(|v| v.as_str()).and_then(Timeframe::parse)?;
        Some(KlineEvent {
            venue: Venue::Binance,
            symbol,
            interval,
            ts_open_ms: k.get("t").and_then(|v| v.as_u64())?,
            open: str_f64(k, "o")?,
            high: str_f64(k, "h")?,
            low: str_f64(k, "l")?,
            close: str_f64(k, "c")?,
            volume: str_f64(k, "v")?,
            closed: k.get("x").and_then(|v| v.as_bool())?,
        })
    }
}

// ============================================================================
// Bybit (v5 topic frames: {"topic": "...", "ts": ..., "data": ...})
// ============================================================================

pub struct BybitParser;

impl BybitParser {
    fn topic<'a>(json: &'a Value) -> Option<&'a str> {
        json.get("topic").and_then(|v| v.as_str())
    }
}

impl VenueParser for BybitParser {
    fn venue(&self) -> Venue {
        Venue::Bybit
    }

    fn parse_book(&self, json: &Value) -> Option<OrderBookEvent> {
        if !Self::topic(json)?.starts_with("orderbook.") {
            return None;
        }
        let data = json.get("data")?;
        let symbol = data.get("s").and_then(|v| v.as_str()).map(normalize_symbol)?;
        let ts_ms = json.get("ts").and_then(|v| v.as_u64()).unwrap_or_else(epoch_ms);
        Some(OrderBookEvent {
            venue: Venue::Bybit,
            symbol,
            ts_ms,
            bids: parse_levels(data.get("b")?),
            asks: parse_levels(data.get("a")?),
        })
    }

    fn parse_trades(&self, json: &Value) -> TradeBatch {
        let mut out = TradeBatch::new();
        if !Self::topic(json).is_some_and(|t| t.starts_with("publicTrade.")) {
            return out;
        }
        let Some(rows) = json.get("data").and_then(|d| d.as_array()) else {
            return out;
        };
        for row in rows {
            let parsed = (|| {
                let symbol = row.get("s").and_then(|v| v.as_str()).map(normalize_symbol)?;
                let side = match row.get("S").and_then(|v| v.as_str())? {
                    "Buy" => Side::Buy,
                    "Sell" => Side::Sell,
                    _ => return None,
                };
                Some(TradeEvent {
                    venue: Venue::Bybit,
                    symbol,
                    ts_ms: row.get("T").and_then(|v| v.as_u64())?,
                    side,
                    price: str_f64(row, "p")?,
                    qty: str_f64(row, "v")?,
                    buyer_is_maker: None,
                })
            })();
            if let Some(trade) = parsed {
                out.push(trade);
            }
        }
        out
    }

    fn parse_kline(&self, json: &Value) -> Option<KlineEvent> {
        let topic = Self::topic(json)?;
        let mut parts = topic.split('.');
        if parts.next() != Some("kline") {
            return None;
        }
        let interval = Timeframe::parse(parts.next()?)?;
        let symbol = normalize_symbol(parts.next()?);
        let row = json.get("data").and_then(|d| d.as_array()).and_then(|a| a.first())?;
        Some(KlineEvent {
            venue: Venue::Bybit,
            symbol,
            interval,
            ts_open_ms: row.get("start").and_then(|v| v.as_u64())?,
            open: str_f64(row, "open")?,
            high: str_f64(row, "high")?,
            low: str_f64(row, "low")?,
            close: str_f64(row, "close")?,
            volume: str_f64(row, "volume")?,
            closed: row.get("confirm").and_then(|v| v.as_bool())?,
        })
    }
}

// ============================================================================
// OKX (v5 frames: {"arg": {"channel": ..., "instId": ...}, "data": [...]})
// ============================================================================

pub struct OkxParser;

impl OkxParser {
    fn channel<'a>(json: &'a Value) -> Option<&'a str> {
        json.get("arg").and_then(|a| a.get("channel")).and_then(|v| v.as_str())
    }

    fn inst_symbol(json: &Value) -> Option<String> {
        json.get("arg")
            .and_then(|a| a.get("instId"))
            .and_then(|v| v.as_str())
            .map(normalize_symbol)
    }
}

impl VenueParser for OkxParser {
    fn venue(&self) -> Venue {
        Venue::Okx
    }

    fn parse_book(&self, json: &Value) -> Option<OrderBookEvent> {
        if !Self::channel(json)?.starts_with("books") {
            return None;
        }
        let symbol = Self::inst_symbol(json)?;
        let row = json.get("data").and_then(|d| d.as_array()).and_then(|a| a.first())?;
        let ts_ms = str_f64(row, "ts").map(|t| t as u64).unwrap_or_else(epoch_ms);
        Some(OrderBookEvent {
            venue: Venue::Okx,
            symbol,
            ts_ms,
            bids: parse_levels(row.get("bids")?),
            asks: parse_levels(row.get("asks")?),
        })
    }

    fn parse_trades(&self, json: &Value) -> TradeBatch {
        let mut out = TradeBatch::new();
        if Self::channel(json) != Some("trades") {
            return out;
        }
        let Some(rows) = json.get("data").and_then(|d| d.as_array()) else {
            return out;
        };
        for row in rows {
            let parsed = (|| {
                let symbol = row
                    .get("instId")
                    .and_then(|v| v.as_str())
                    .map(normalize_symbol)?;
                let side = match row.get("side").and_then(|v| v.as_str())? {
                    "buy" => Side::Buy,
                    "sell" => Side::Sell,
                    _ => return None,
                };
                Some(TradeEvent {
                    venue: Venue::Okx,
                    symbol,
                    ts_ms: str_f64(row, "ts")? as u64,
                    side,
                    price: str_f64(row, "px")?,
                    qty: str_f64(row, "sz")?,
                    buyer_is_maker: None,
                })
            })();
            if let Some(trade) = parsed {
                out.push(trade);
            }
        }
        out
    }

    fn parse_kline(&self, json: &Value) -> Option<KlineEvent> {
        let channel = Self::channel(json)?;
        let interval = Timeframe::parse(channel.strip_prefix("candle")?)?;
        let symbol = Self::inst_symbol(json)?;
        // Candle rows are positional: [ts, o, h, l, c, vol, ..., confirm].
        let row = json
            .get("data")
            .and_then(|d| d.as_array())
            .and_then(|a| a.first())
            .and_then(|r| r.as_array())?;
        let cell = |i: usize| -> Option<f64> { row.get(i)?.as_str()?.parse().ok() };
        Some(KlineEvent {
            venue: Venue::Okx,
            symbol,
            interval,
            ts_open_ms: cell(0)? as u64,
            open: cell(1)?,
            high: cell(2)?,
            low: cell(3)?,
            close: cell(4)?,
            volume: cell(5)?,
            closed: row.last().and_then(|v| v.as_str()) == Some("1"),
        })
    }
}

pub fn get_parser(venue: Venue) -> Box<dyn VenueParser> {
    match venue {
        Venue::Binance => Box::new(BinanceParser),
        Venue::Bybit => Box::new(BybitParser),
        Venue::Okx => Box::new(OkxParser),
    }
}
