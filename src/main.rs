use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use signalgen::config::CoreConfig;
use signalgen::engine::library::ScenarioLibrary;
use signalgen::engine::matcher::ScenarioMatcher;
use signalgen::engine::scheduler::Scheduler;
use signalgen::engine::store::{InMemorySignalStore, SignalStore};
use signalgen::market::{CrossVenueValidator, MarketStores, MtfCache};
use signalgen::{binance, bybit, klines, okx, DynError};

/// Maximum wait for the scheduler to wind down after a shutdown signal.
const SHUTDOWN_TIMEOUT_SECS: u64 = 10;

#[tokio::main]
async fn main() -> Result<(), DynError> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Arc::new(CoreConfig::from_env()?);
    info!(
        symbols = ?config.tracked_symbols,
        cadence_secs = config.signal_cadence_secs,
        "signal core starting"
    );

    let library = Arc::new(ScenarioLibrary::load(&config.scenario_files)?);
    info!(scenarios = library.len(), "scenario library loaded");

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.http_timeout_secs))
        .build()?;

    let stores = MarketStores::new(&config);
    let mtf = Arc::new(MtfCache::new());
    let validator = Arc::new(CrossVenueValidator::new(
        config.deviation_warning,
        config.deviation_invalid,
        config.consecutive_invalid_veto,
    ));
    let store: Arc<dyn SignalStore> = Arc::new(InMemorySignalStore::new());

    // Indicators need candle history before the first tick.
    klines::backfill(&client, &config, &stores.candles).await;

    let shutdown = Arc::new(AtomicBool::new(false));

    binance::BinanceConnector::spawn(&config.tracked_symbols, stores.clone(), shutdown.clone());
    bybit::BybitConnector::spawn(&config.tracked_symbols, stores.clone(), shutdown.clone());
    okx::OkxConnector::spawn(&config.tracked_symbols, stores.clone(), shutdown.clone());

    let matcher = ScenarioMatcher::new(config.clone(), library);
    let scheduler = Scheduler::new(
        config.clone(),
        stores.books.clone(),
        stores.cvd.clone(),
        stores.candles.clone(),
        mtf,
        validator,
        matcher,
        store,
    );
    let scheduler_handle = tokio::spawn(scheduler.run(shutdown.clone()));

    wait_for_shutdown_signal().await?;
    info!("shutdown signal received, stopping");
    shutdown.store(true, Ordering::Relaxed);

    match tokio::time::timeout(Duration::from_secs(SHUTDOWN_TIMEOUT_SECS), scheduler_handle).await {
        Ok(Ok(())) => info!("scheduler stopped cleanly"),
        Ok(Err(e)) => error!(error = %e, "scheduler task failed"),
        Err(_) => error!("scheduler did not stop within timeout"),
    }

    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> Result<(), DynError> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> Result<(), DynError> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
