use futures_util::SinkExt;
use futures_util::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::events::Venue;
use crate::market::MarketStores;
use crate::utils;
use crate::venue_parser::get_parser;
use crate::DynError;

const BINANCE_USDM_WS_STREAM_URL: &str = "wss://fstream.binance.com/stream";

// Binance caps combined-stream connections at 1024 streams and meters
// connection attempts per IP, so streams are chunked across workers and
// worker startup is staggered.
const STREAMS_PER_CONNECTION: usize = 100;
const WORKER_STAGGER_MS: u64 = 2_000;
const RECONNECT_FLOOR_MS: u64 = 2_000;

pub struct BinanceConnector;

impl BinanceConnector {
    /// Spawns one websocket worker per stream batch. Workers reconnect on
    /// their own until the shutdown flag is raised.
    pub fn spawn(symbols: &[String], stores: MarketStores, shutdown: Arc<AtomicBool>) {
        let streams = build_streams(symbols);
        if streams.is_empty() {
            return;
        }
        let batches = utils::chunk_vec(&streams, STREAMS_PER_CONNECTION);
        info!(workers = batches.len(), streams = streams.len(), "starting binance ws workers");

        for (worker_id, batch) in batches.into_iter().enumerate() {
            let stores = stores.clone();
            let shutdown = Arc::clone(&shutdown);
            tokio::spawn(async move {
                // Stagger startup so workers do not burst-connect.
                tokio::time::sleep(std::time::Duration::from_millis(
                    worker_id as u64 * WORKER_STAGGER_MS,
                ))
                .await;
                run_ws_worker(worker_id, Arc::new(batch), stores, shutdown).await;
            });
        }
    }
}

fn build_streams(symbols: &[String]) -> Vec<String> {
    let mut streams = Vec::with_capacity(symbols.len() * 5);
    for s in symbols {
        let sym = s.to_lowercase();
        streams.push(format!("{sym}@depth20@100ms"));
        streams.push(format!("{sym}@aggTrade"));
        streams.push(format!("{sym}@kline_1h"));
        streams.push(format!("{sym}@kline_4h"));
        streams.push(format!("{sym}@kline_1d"));
    }
    streams
}

async fn run_ws_batch(
    worker_id: usize,
    streams: &[String],
    stores: &MarketStores,
    shutdown: &AtomicBool,
) -> Result<(), DynError> {
    // Combined stream URL: one connection carries every stream in the batch,
    // each frame wrapped as {"stream": ..., "data": ...}.
    let url = format!("{}?streams={}", BINANCE_USDM_WS_STREAM_URL, streams.join("/"));
    let (ws, _) = tokio_tungstenite::connect_async(&url).await?;
    let (mut write, mut read) = ws.split();

    info!(worker = worker_id, streams = streams.len(), "binance ws connected");

    let parser = get_parser(Venue::Binance);
    let mut first_data_logged = false;
    let mut shutdown_tick = utils::interval_secs(1);

    loop {
        tokio::select! {
            _ = shutdown_tick.tick() => {
                if shutdown.load(Ordering::Relaxed) {
                    let _ = write.send(Message::Close(None)).await;
                    break;
                }
            }
            msg = read.next() => {
                let msg = match msg {
                    Some(m) => m?,
                    None => break,
                };

                // Binance pings every few minutes and disconnects clients
                // that do not pong back.
                let bytes = match msg {
                    Message::Ping(payload) => {
                        if write.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                        continue;
                    }
                    Message::Close(_) => break,
                    Message::Text(text) => text.into_bytes(),
                    Message::Binary(bytes) => bytes,
                    _ => continue,
                };

                let mut bytes = bytes;
                let value: serde_json::Value = match simd_json::serde::from_slice(&mut bytes) {
                    Ok(v) => v,
                    Err(_) => continue,
                };

                if !first_data_logged {
                    first_data_logged = true;
                    debug!(worker = worker_id, "binance ws first data frame");
                }

                // depth20 frames carry the full top-of-book, so they land as
                // snapshots rather than deltas.
                if let Some(event) = parser.parse_book(&value) {
                    stores.books.apply_snapshot(&event);
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
    streams: Arc<Vec<String>>,
    stores: MarketStores,
    shutdown: Arc<AtomicBool>,
) {
    let mut backoff = utils::Backoff::new();
    while !shutdown.load(Ordering::Relaxed) {
        let res = run_ws_batch(worker_id, &streams[..], &stores, &shutdown).await;
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
        match &res {
            Ok(()) => {
                info!(worker = worker_id, "binance ws disconnected, reconnecting");
                backoff.reset();
            }
            Err(e) => {
                warn!(worker = worker_id, error = %e, "binance ws error, reconnecting");
                backoff.wait().await;
            }
        }
        // Connection attempts per IP are rate limited, so reconnects keep a
        // floor delay even after clean disconnects.
        tokio::time::sleep(std::time::Duration::from_millis(
            RECONNECT_FLOOR_MS.max(backoff.delay_ms()),
        ))
        .await;
    }
    info!(worker = worker_id, "binance ws worker stopped");
}
