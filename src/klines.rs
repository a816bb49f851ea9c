use tracing::{info, warn};

use crate::config::CoreConfig;
use crate::error::CoreError;
use crate::events::Timeframe;
use crate::market::{Candle, CandleStore};
use crate::utils::epoch_ms;

const BINANCE_USDM_BASE_URL: &str = "https://fapi.binance.com";
/// Binance serves at most this many klines per request.
const MAX_KLINE_LIMIT: usize = 1_000;

/// Seeds candle series over REST so indicators have history at startup.
/// A failed series is left empty; the live kline streams fill it in.
pub async fn backfill(client: &reqwest::Client, config: &CoreConfig, candles: &CandleStore) {
    for symbol in &config.tracked_symbols {
        for timeframe in Timeframe::ALL {
            let limit = config.candle_capacity.min(MAX_KLINE_LIMIT);
            match fetch_series(client, symbol, timeframe, limit).await {
                Ok(bars) => {
                    info!(symbol, timeframe = %timeframe, bars = bars.len(), "kline backfill loaded");
                    candles.replace(symbol, timeframe, bars);
                }
                Err(e) => {
                    warn!(error = %e, "kline backfill failed");
                }
            }
        }
    }
}

async fn fetch_series(
    client: &reqwest::Client,
    symbol: &str,
    timeframe: Timeframe,
    limit: usize,
) -> Result<Vec<Candle>, CoreError> {
    let url = format!("{BINANCE_USDM_BASE_URL}/fapi/v1/klines");
    let limit_param = limit.to_string();
    let rows: Vec<serde_json::Value> = client
        .get(url)
        .query(&[
            ("symbol", symbol),
            ("interval", timeframe.as_str()),
            ("limit", limit_param.as_str()),
        ])
        .send()
        .await
        .map_err(|source| fetch_error(symbol, timeframe, source))?
        .error_for_status()
        .map_err(|source| fetch_error(symbol, timeframe, source))?
        .json()
        .await
        .map_err(|source| fetch_error(symbol, timeframe, source))?;

    let now_ms = epoch_ms();
    Ok(rows.iter().filter_map(|row| parse_row(row, now_ms)).collect())
}

fn fetch_error(symbol: &str, timeframe: Timeframe, source: reqwest::Error) -> CoreError {
    CoreError::Fetch {
        symbol: symbol.to_string(),
        timeframe: timeframe.as_str().to_string(),
        source,
    }
}

/// Positional kline row: [openTime, open, high, low, close, volume,
/// closeTime, ...]. Rows still open at `now_ms` are skipped.
fn parse_row(row: &serde_json::Value, now_ms: u64) -> Option<Candle> {
    let row = row.as_array()?;
    let cell = |i: usize| -> Option<f64> { row.get(i)?.as_str()?.parse().ok() };
    let close_time = row.get(6)?.as_u64()?;
    if close_time >= now_ms {
        return None;
    }
    let candle = Candle {
        ts_open_ms: row.first()?.as_u64()?,
        open: cell(1)?,
        high: cell(2)?,
        low: cell(3)?,
        close: cell(4)?,
        volume: cell(5)?,
    };
    let finite = candle.open.is_finite()
        && candle.high.is_finite()
        && candle.low.is_finite()
        && candle.close.is_finite()
        && candle.volume.is_finite();
    finite.then_some(candle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_row_closed_bar() {
        let row = json!([
            1_700_000_000_000u64,
            "50000.0",
            "50500.0",
            "49800.0",
            "50200.0",
            "1234.5",
            1_700_003_599_999u64
        ]);
        let candle = parse_row(&row, 1_700_010_000_000).unwrap();
        assert_eq!(candle.ts_open_ms, 1_700_000_000_000);
        assert_eq!(candle.close, 50_200.0);
        assert_eq!(candle.volume, 1_234.5);
    }

    #[test]
    fn test_parse_row_skips_open_bar() {
        let row = json!([
            1_700_000_000_000u64,
            "50000.0",
            "50500.0",
            "49800.0",
            "50200.0",
            "1234.5",
            1_700_003_599_999u64
        ]);
        // Close time has not passed yet.
        assert!(parse_row(&row, 1_700_000_300_000).is_none());
    }

    #[test]
    fn test_parse_row_rejects_junk() {
        assert!(parse_row(&json!({"not": "a row"}), 1_700_000_000_000).is_none());
        assert!(parse_row(&json!([1, 2, 3]), 1_700_000_000_000).is_none());
    }
}
