use crate::config::CoreConfig;
use crate::engine::indicators::IndicatorSnapshot;
use crate::engine::matcher::{MatchDecision, ScenarioMatcher};
use crate::engine::regime::RegimeDetector;
use crate::engine::store::SignalStore;
use crate::engine::types::{FusedContext, VetoChecks};
use crate::events::{Timeframe, Venue};
use crate::market::book::OrderBookStore;
use crate::market::candles::CandleStore;
use crate::market::cvd::CvdTracker;
use crate::market::mtf::{MtfCache, MtfEntry, TfAssessment};
use crate::market::profile::VolumeProfile;
use crate::market::validator::CrossVenueValidator;
use crate::utils::epoch_ms;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

/// H1 candles the volume profile is built over (four days).
const PROFILE_WINDOW: usize = 96;

/// Drives the periodic pipeline: a fast signal loop over every tracked
/// symbol and a slower MTF recompute. Owns the matcher and its selection
/// history; everything else is shared with the connectors.
pub struct Scheduler {
    config: Arc<CoreConfig>,
    books: Arc<OrderBookStore>,
    cvd: Arc<CvdTracker>,
    candles: Arc<CandleStore>,
    mtf: Arc<MtfCache>,
    validator: Arc<CrossVenueValidator>,
    regimes: RegimeDetector,
    matcher: ScenarioMatcher,
    store: Arc<dyn SignalStore>,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<CoreConfig>,
        books: Arc<OrderBookStore>,
        cvd: Arc<CvdTracker>,
        candles: Arc<CandleStore>,
        mtf: Arc<MtfCache>,
        validator: Arc<CrossVenueValidator>,
        matcher: ScenarioMatcher,
        store: Arc<dyn SignalStore>,
    ) -> Self {
        Scheduler {
            config,
            books,
            cvd,
            candles,
            mtf,
            validator,
            regimes: RegimeDetector::new(),
            matcher,
            store,
        }
    }

    /// Runs until the shutdown flag flips. The first MTF refresh happens
    /// immediately so the signal loop has trends to work with.
    pub async fn run(mut self, shutdown: Arc<AtomicBool>) {
        let mut signal_tick =
            tokio::time::interval(Duration::from_secs(self.config.signal_cadence_secs.max(1)));
        let mut mtf_tick =
            tokio::time::interval(Duration::from_secs(self.config.mtf_refresh_secs.max(1)));
        signal_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        mtf_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        self.refresh_mtf();
        info!(
            symbols = self.config.tracked_symbols.len(),
            cadence_secs = self.config.signal_cadence_secs,
            "scheduler started"
        );

        while !shutdown.load(Ordering::Relaxed) {
            tokio::select! {
                _ = signal_tick.tick() => {
                    let symbols = self.config.tracked_symbols.clone();
                    for symbol in &symbols {
                        self.tick_symbol(symbol).await;
                    }
                }
                _ = mtf_tick.tick() => {
                    self.refresh_mtf();
                }
            }
        }
        info!("scheduler stopped");
    }

    /// Recomputes every tracked symbol's timeframe assessments from the
    /// candle store. Symbols with no candles at all keep their old entry.
    pub fn refresh_mtf(&self) {
        let now_ms = epoch_ms();
        for symbol in &self.config.tracked_symbols {
            let h1 = self.candles.series(symbol, Timeframe::H1);
            let h4 = self.candles.series(symbol, Timeframe::H4);
            let d1 = self.candles.series(symbol, Timeframe::D1);
            if h1.is_empty() && h4.is_empty() && d1.is_empty() {
                debug!(symbol = %symbol, "no candles yet, mtf refresh skipped");
                continue;
            }
            let entry = MtfEntry {
                ts_ms: now_ms,
                h1: assess_frame(&h1),
                h4: assess_frame(&h4),
                d1: assess_frame(&d1),
            };
            debug!(
                symbol = %symbol,
                trend_1h = entry.h1.trend.as_str(),
                trend_4h = entry.h4.trend.as_str(),
                trend_1d = entry.d1.trend.as_str(),
                "mtf refreshed"
            );
            self.mtf.store(symbol, entry);
        }
    }

    /// One signal cycle for one symbol. ROI tracking always runs; signal
    /// generation can be skipped by staleness, the regime gate, or a veto.
    pub async fn tick_symbol(&mut self, symbol: &str) {
        let now_ms = epoch_ms();
        let Some(price) = self
            .books
            .latest_price(symbol, now_ms, self.config.price_stale_secs)
        else {
            debug!(symbol = %symbol, "no fresh price, tick skipped");
            return;
        };

        match self.store.update_signal_roi(symbol, price, now_ms).await {
            Ok(changed) => {
                for signal in &changed {
                    info!(
                        id = %signal.id,
                        symbol = %symbol,
                        status = ?signal.status,
                        roi_pct = signal.roi_pct,
                        tp1 = signal.tp1_hit,
                        tp2 = signal.tp2_hit,
                        tp3 = signal.tp3_hit,
                        sl = signal.sl_hit,
                        "signal progressed"
                    );
                }
            }
            Err(e) => error!(symbol = %symbol, error = %e, "roi update failed"),
        }

        let base = IndicatorSnapshot::compute(&self.candles.series(symbol, Timeframe::H1));
        let volume_ratio = base.volume_ratio();

        let venue_prices = self
            .books
            .venue_prices(symbol, now_ms, self.config.price_stale_secs);
        let report = self
            .validator
            .validate(symbol, &venue_prices, Some(volume_ratio));

        self.regimes.observe(symbol, base.atr_pct, base.adx);
        let regime = self.regimes.assess(symbol);

        // MTF gone stale means the trend picture is unreliable; skip
        // generation and let the next refresh restore it.
        let Some(mtf_entry) = self
            .mtf
            .fresh(symbol, now_ms, self.config.mtf_stale_after_secs())
        else {
            debug!(symbol = %symbol, "mtf cache stale, generation skipped");
            return;
        };

        if !regime.adaptive.trade {
            debug!(symbol = %symbol, regime = regime.regime.as_str(), "regime disallows trading");
            return;
        }
        if base.adx < regime.adaptive.min_adx {
            debug!(
                symbol = %symbol,
                regime = regime.regime.as_str(),
                adx = base.adx,
                min_adx = regime.adaptive.min_adx,
                "adx below regime minimum, generation skipped"
            );
            return;
        }
        if volume_ratio < regime.adaptive.volume_requirement {
            debug!(
                symbol = %symbol,
                volume_ratio,
                required = regime.adaptive.volume_requirement,
                "volume below regime requirement, generation skipped"
            );
            return;
        }

        let veto = self.build_veto(symbol, now_ms, report.vetoed).await;
        let ctx = self.fuse_context(symbol, now_ms, price, base, mtf_entry, &report);

        match self.matcher.evaluate(&ctx, &regime, &veto) {
            MatchDecision::Emit(signal) => {
                info!(
                    symbol = %symbol,
                    scenario = %signal.scenario_id,
                    direction = %signal.direction,
                    tier = signal.tier.as_str(),
                    entry = signal.entry_price,
                    stop = signal.stop_loss,
                    composite = signal.ai.composite,
                    fallback = signal.ai.fallback,
                    "signal emitted"
                );
                if let Err(e) = self.store.insert_signal(*signal).await {
                    error!(symbol = %symbol, error = %e, "signal store rejected insert");
                }
            }
            MatchDecision::Observation(scored) => {
                debug!(
                    symbol = %symbol,
                    scenario = %scored.scenario_id,
                    match_score = scored.match_score,
                    "observation only"
                );
            }
            MatchDecision::Vetoed(reasons) => {
                debug!(symbol = %symbol, ?reasons, "generation vetoed");
            }
            MatchDecision::Empty => {}
        }
    }

    async fn build_veto(&self, symbol: &str, now_ms: u64, validator_veto: bool) -> VetoChecks {
        let active_signal = match self.store.list_active_signals(symbol).await {
            Ok(active) => !active.is_empty(),
            Err(e) => {
                error!(symbol = %symbol, error = %e, "active signal lookup failed");
                false
            }
        };
        let cooldown = match self.store.latest_close_ms(symbol).await {
            Ok(Some(closed_ms)) => {
                now_ms.saturating_sub(closed_ms) < self.config.signal_cooldown_secs * 1_000
            }
            Ok(None) => false,
            Err(e) => {
                error!(symbol = %symbol, error = %e, "close history lookup failed");
                false
            }
        };
        VetoChecks {
            validator: validator_veto,
            active_signal,
            cooldown,
        }
    }

    fn fuse_context(
        &self,
        symbol: &str,
        now_ms: u64,
        price: f64,
        base: IndicatorSnapshot,
        mtf_entry: MtfEntry,
        report: &crate::market::validator::ValidationReport,
    ) -> FusedContext {
        let book = Venue::ALL
            .iter()
            .find_map(|&venue| self.books.summary(venue, symbol));
        let (imbalance, ls_ratio, stacked_up, stacked_down) = match &book {
            Some(b) => (
                b.imbalance,
                b.ls_ratio,
                b.stacked_imbalance_up,
                b.stacked_imbalance_down,
            ),
            None => (0.0, 1.0, false, false),
        };

        let h1 = self.candles.series(symbol, Timeframe::H1);
        let profile_slice = if h1.len() > PROFILE_WINDOW {
            &h1[h1.len() - PROFILE_WINDOW..]
        } else {
            &h1[..]
        };

        FusedContext {
            symbol: symbol.to_string(),
            ts_ms: now_ms,
            price,
            imbalance,
            ls_ratio,
            stacked_imbalance_up: stacked_up,
            stacked_imbalance_down: stacked_down,
            cvd: self.cvd.snapshot(symbol, now_ms),
            profile: VolumeProfile::from_candles(profile_slice),
            base,
            mtf: Some(mtf_entry),
            news_score: 0.0,
            validation_status: report.status,
            validation_confidence: report.confidence,
        }
    }
}

/// Collapses one timeframe's candle series into the cached assessment.
fn assess_frame(candles: &[crate::market::candles::Candle]) -> TfAssessment {
    if candles.is_empty() {
        return TfAssessment::default();
    }
    let snap = IndicatorSnapshot::compute(candles);
    TfAssessment {
        trend: snap.trend,
        rsi: snap.rsi,
        adx: snap.adx,
        ema20: snap.ema20,
        ema50: snap.ema50,
        close: snap.close,
        volume_delta: snap.volume_ratio() - 1.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::library::ScenarioLibrary;
    use crate::engine::store::InMemorySignalStore;
    use crate::events::{KlineEvent, Side, TradeEvent};
    use crate::market::candles::Candle;

    fn rising_candles(n: usize, start: f64, step: f64) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let open = start + step * i as f64;
                Candle {
                    ts_open_ms: 3_600_000 * i as u64,
                    open,
                    high: open + step,
                    low: open - step * 0.3,
                    close: open + step * 0.8,
                    volume: 1_000.0,
                }
            })
            .collect()
    }

    fn scheduler_with_empty_library() -> (Scheduler, Arc<InMemorySignalStore>) {
        let config = Arc::new(CoreConfig::default());
        let store = Arc::new(InMemorySignalStore::new());
        let library = Arc::new(ScenarioLibrary::from_scenarios(Vec::new()));
        let matcher = ScenarioMatcher::new(config.clone(), library);
        let scheduler = Scheduler::new(
            config.clone(),
            Arc::new(OrderBookStore::new()),
            Arc::new(CvdTracker::new(config.whale_notional_usd)),
            Arc::new(CandleStore::new(config.candle_capacity)),
            Arc::new(MtfCache::new()),
            Arc::new(CrossVenueValidator::new(
                config.deviation_warning,
                config.deviation_invalid,
                config.consecutive_invalid_veto,
            )),
            matcher,
            store.clone() as Arc<dyn SignalStore>,
        );
        (scheduler, store)
    }

    #[test]
    fn test_assess_frame_reads_trend() {
        let candles = rising_candles(80, 100.0, 1.0);
        let frame = assess_frame(&candles);
        assert_eq!(frame.trend, crate::market::mtf::TrendDirection::Bullish);
        assert!(frame.rsi > 50.0);
        assert!(frame.close > 0.0);
        assert_eq!(assess_frame(&[]).trend, crate::market::mtf::TrendDirection::Neutral);
    }

    #[test]
    fn test_refresh_mtf_skips_symbols_without_candles() {
        let (scheduler, _) = scheduler_with_empty_library();
        scheduler.refresh_mtf();
        assert!(scheduler.mtf.fresh("BTCUSDT", epoch_ms(), 600).is_none());
    }

    #[test]
    fn test_refresh_mtf_populates_cache() {
        let (scheduler, _) = scheduler_with_empty_library();
        for candle in rising_candles(80, 100.0, 1.0) {
            let event = KlineEvent {
                venue: Venue::Binance,
                symbol: "BTCUSDT".to_string(),
                interval: Timeframe::H1,
                ts_open_ms: candle.ts_open_ms,
                open: candle.open,
                high: candle.high,
                low: candle.low,
                close: candle.close,
                volume: candle.volume,
                closed: true,
            };
            scheduler.candles.apply(&event);
        }
        scheduler.refresh_mtf();
        let entry = scheduler.mtf.fresh("BTCUSDT", epoch_ms(), 600).unwrap();
        assert_eq!(entry.h1.trend, crate::market::mtf::TrendDirection::Bullish);
        // Timeframes without candles fall back to a neutral frame.
        assert_eq!(entry.h4.trend, crate::market::mtf::TrendDirection::Neutral);
    }

    #[tokio::test]
    async fn test_tick_without_price_is_inert() {
        let (mut scheduler, store) = scheduler_with_empty_library();
        scheduler.tick_symbol("BTCUSDT").await;
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_tick_updates_roi_even_when_generation_skipped() {
        let (mut scheduler, store) = scheduler_with_empty_library();

        // A fresh trade print gives the tick a price; no MTF entry exists,
        // so generation is skipped after the ROI pass.
        let trade = TradeEvent {
            venue: Venue::Binance,
            symbol: "BTCUSDT".to_string(),
            ts_ms: epoch_ms(),
            side: Side::Buy,
            price: 51_050.0,
            qty: 0.5,
            buyer_is_maker: Some(false),
        };
        scheduler.books.record_trade(&trade);

        let signal = crate::engine::store::tests_support::active_long("sig-roi", "BTCUSDT");
        store.insert_signal(signal).await.unwrap();

        scheduler.tick_symbol("BTCUSDT").await;

        let updated = store.get_signal("sig-roi").await.unwrap().unwrap();
        assert!(updated.tp1_hit);
        assert_eq!(updated.status, crate::engine::types::SignalStatus::Active);
        // The 51 050 print locks tp1's two percent.
        assert!((updated.roi_pct - 2.0).abs() < 1e-9);
    }
}
