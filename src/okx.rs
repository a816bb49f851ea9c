use futures_util::SinkExt;
use futures_util::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use crate::events::Venue;
use crate::market::MarketStores;
use crate::utils;
use crate::venue_parser::get_parser;
use crate::DynError;

type OkxWrite = futures_util::stream::SplitSink<
    WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;

const OKX_WS_PUBLIC_URL: &str = "wss://ws.okx.com:8443/ws/v5/public";

const INSTRUMENTS_PER_CONNECTION: usize = 80;
const SUBSCRIBE_INSTRUMENTS_PER_MSG: usize = 25;
const SUBSCRIBE_BATCH_DELAY_MS: u64 = 50;
/// OKX closes connections silent for 30s; a text "ping" keeps them alive.
const PING_INTERVAL_SECS: u64 = 20;

pub struct OkxConnector;

impl OkxConnector {
    pub fn spawn(symbols: &[String], stores: MarketStores, shutdown: Arc<AtomicBool>) {
        let inst_ids: Vec<String> = symbols.iter().filter_map(|s| to_inst_id(s)).collect();
        if inst_ids.is_empty() {
            warn!("no okx instruments derivable from tracked symbols");
            return;
        }
        let batches = utils::chunk_vec(&inst_ids, INSTRUMENTS_PER_CONNECTION);
        info!(workers = batches.len(), instruments = inst_ids.len(), "starting okx ws workers");

        for (worker_id, batch) in batches.into_iter().enumerate() {
            let stores = stores.clone();
            let shutdown = Arc::clone(&shutdown);
            tokio::spawn(run_ws_worker(worker_id, Arc::new(batch), stores, shutdown));
        }
    }
}

/// "BTCUSDT" to the OKX perpetual instrument id "BTC-USDT-SWAP".
fn to_inst_id(symbol: &str) -> Option<String> {
    let base = symbol.strip_suffix("USDT")?;
    if base.is_empty() {
        return None;
    }
    Some(format!("{base}-USDT-SWAP"))
}

async fn subscribe_channel(
    write: &mut OkxWrite,
    channel: &str,
    inst_ids: &[String],
) -> Result<(), DynError> {
    let mut args = Vec::with_capacity(inst_ids.len());
    for inst_id in inst_ids {
        args.push(serde_json::json!({"channel": channel, "instId": inst_id}));
    }

    let subscribe = serde_json::json!({
        "op": "subscribe",
        "args": args
    });

    write.send(Message::Text(subscribe.to_string())).await?;

    Ok(())
}

async fn run_ws_batch(
    worker_id: usize,
    inst_ids: &[String],
    stores: &MarketStores,
    shutdown: &AtomicBool,
) -> Result<(), DynError> {
    let (ws, _) = tokio_tungstenite::connect_async(OKX_WS_PUBLIC_URL).await?;
    let (mut write, mut read) = ws.split();

    info!(worker = worker_id, instruments = inst_ids.len(), "okx ws connected");

    let parser = get_parser(Venue::Okx);
    let mut first_data_logged = false;

    utils::subscribe_in_batches(
        &mut write,
        inst_ids,
        SUBSCRIBE_INSTRUMENTS_PER_MSG,
        0,
        |w, chunk| {
            Box::pin(async move {
                for channel in ["books5", "trades", "candle1H", "candle4H", "candle1D"] {
                    subscribe_channel(w, channel, chunk).await?;
                    time::sleep(std::time::Duration::from_millis(SUBSCRIBE_BATCH_DELAY_MS)).await;
                }
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
                if write.send(Message::Text("ping".to_string())).await.is_err() {
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
                if text == "pong" {
                    continue;
                }
                let value: serde_json::Value = match serde_json::from_str(&text) {
                    Ok(v) => v,
                    Err(_) => continue,
                };

                // Subscribe acks carry an "event" field and no data rows.
                if value.get("data").is_none() {
                    continue;
                }
                if !first_data_logged {
                    first_data_logged = true;
                    debug!(worker = worker_id, "okx ws first data frame");
                }

                // books5 frames are always full five-level snapshots.
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
    inst_ids: Arc<Vec<String>>,
    stores: MarketStores,
    shutdown: Arc<AtomicBool>,
) {
    let mut backoff = utils::Backoff::new();
    while !shutdown.load(Ordering::Relaxed) {
        let res = run_ws_batch(worker_id, &inst_ids[..], &stores, &shutdown).await;
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
        match &res {
            Ok(()) => {
                info!(worker = worker_id, "okx ws disconnected, reconnecting");
                backoff.reset();
            }
            Err(e) => {
                warn!(worker = worker_id, error = %e, "okx ws error, reconnecting");
                backoff.wait().await;
            }
        }
    }
    info!(worker = worker_id, "okx ws worker stopped");
}
