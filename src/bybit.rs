use futures_util::SinkExt;
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::events::Venue;
use crate::market::MarketStores;
use crate::utils;
use crate::venue_parser::get_parser;
use crate::DynError;

const BYBIT_LINEAR_WS_PUBLIC_URL: &str = "wss://stream.bybit.com/v5/public/linear";

const TOPICS_PER_CONNECTION: usize = 100;
const SUBSCRIBE_BATCH_SIZE: usize = 10;
const SUBSCRIBE_BATCH_DELAY_MS: u64 = 100;
/// Bybit drops connections idle longer than 30s without an app-level ping.
const PING_INTERVAL_SECS: u64 = 20;

pub struct BybitConnector;

impl BybitConnector {
    pub fn spawn(symbols: &[String], stores: MarketStores, shutdown: Arc<AtomicBool>) {
        let topics = build_topics(symbols);
        if topics.is_empty() {
            return;
        }
        let batches = utils::chunk_vec(&topics, TOPICS_PER_CONNECTION);
        info!(workers = batches.len(), topics = topics.len(), "starting bybit ws workers");

        for (worker_id, batch) in batches.into_iter().enumerate() {
            let stores = stores.clone();
            let shutdown = Arc::clone(&shutdown);
            tokio::spawn(run_ws_worker(worker_id, Arc::new(batch), stores, shutdown));
        }
    }
}

fn build_topics(symbols: &[String]) -> Vec<String> {
    let mut topics = Vec::with_capacity(symbols.len() * 5);
    for s in symbols {
        topics.push(format!("orderbook.50.{s}"));
        topics.push(format!("publicTrade.{s}"));
        topics.push(format!("kline.60.{s}"));
        topics.push(format!("kline.240.{s}"));
        topics.push(format!("kline.D.{s}"));
    }
    topics
}

async fn run_ws_batch(
    worker_id: usize,
    topics: &[String],
    stores: &MarketStores,
    shutdown: &AtomicBool,
) -> Result<(), DynError> {
    let (ws, _) = tokio_tungstenite::connect_async(BYBIT_LINEAR_WS_PUBLIC_URL).await?;
    let (mut write, mut read) = ws.split();

    info!(worker = worker_id, topics = topics.len(), "bybit ws connected");

    let parser = get_parser(Venue::Bybit);
    let mut first_data_logged = false;

    utils::subscribe_in_batches(
        &mut write,
        topics,
        SUBSCRIBE_BATCH_SIZE,
        SUBSCRIBE_BATCH_DELAY_MS,
        |w, chunk| {
            Box::pin(async move {
                let subscribe = json!({
                    "op": "subscribe",
                    "args": chunk
                });
                w.send(Message::Text(subscribe.to_string())).await?;
                Ok(())
            })
        },
    )
    .await?;

    let mut ping_tick = utils::interval_secs(PING_INTERVAL_SECS);
    let mut shutdown_tick = utils::interval_secs(1);

    loop {
        tokio::select! {
            _ = shutdown_tick.tick() => {
                if shutdown.load(Ordering::Relaxed) {
                    let _ = write.send(Message::Close(None)).await;
                    break;
                }
            }
            _ = ping_tick.tick() => {
                let ping = json!({"op": "ping"});
                if write.send(Message::Text(ping.to_string())).await.is_err() {
                    break;
                }
            }
            msg = read.next() => {
                let msg = match msg {
                    Some(m) => m?,
                    None => break,
                };
                if !msg.is_text() {
                    continue;
                }
                let text = msg.into_text()?;
                let value: Value = match serde_json::from_str(&text) {
                    Ok(v) => v,
                    Err(_) => continue,
                };

                // Op acks and pong replies carry no topic.
                if value.get("topic").is_none() {
                    continue;
                }
                if !first_data_logged {
                    first_data_logged = true;
                    debug!(worker = worker_id, "bybit ws first data frame");
                }

                if let Some(event) = parser.parse_book(&value) {
                    // orderbook.50 sends one snapshot, then deltas where a
                    // zero quantity deletes the level.
                    if value.get("type").and_then(|t| t.as_str()) == Some("delta") {
                        stores.books.apply_delta(&event);
                    } else {
                        stores.books.apply_snapshot(&event);
                    }
                    continue;
                }
                let trades = parser.parse_trades(&value);
                if !trades.is_empty() {
                    for trade in &trades {
                        stores.books.record_trade(trade);
                        stores.cvd.record(trade);
                    }
                    continue;
                }
                if let Some(kline) = parser.parse_kline(&value) {
                    stores.candles.apply(&kline);
                }
            }
        }
    }

    Ok(())
}

async fn run_ws_worker(
    worker_id: usize,
    topics: Arc<Vec<String>>,
    stores: MarketStores,
    shutdown: Arc<AtomicBool>,
) {
    let mut backoff = utils::Backoff::new();
    while !shutdown.load(Ordering::Relaxed) {
        let res = run_ws_batch(worker_id, &topics[..], &stores, &shutdown).await;
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
        match &res {
            Ok(()) => {
                info!(worker = worker_id, "bybit ws disconnected, reconnecting");
                backoff.reset();
            }
            Err(e) => {
                warn!(worker = worker_id, error = %e, "bybit ws error, reconnecting");
                backoff.wait().await;
            }
        }
    }
    info!(worker = worker_id, "bybit ws worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_topics_five_per_symbol() {
        let topics = build_topics(&["BTCUSDT".to_string()]);
        assert_eq!(topics.len(), 5);
        assert!(topics.contains(&"orderbook.50.BTCUSDT".to_string()));
        assert!(topics.contains(&"kline.D.BTCUSDT".to_string()));
    }
}
