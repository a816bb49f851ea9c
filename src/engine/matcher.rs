use crate::config::CoreConfig;
use crate::engine::library::{CategoryBody, Scenario, ScenarioLibrary, Tactics};
use crate::engine::regime::RegimeAssessment;
use crate::engine::types::{
    AiMetadata, ConfidenceTier, Direction, FusedContext, MtfAlignment, RiskLevels, ScenarioKind,
    ScoredScenario, Signal, SignalStatus, VetoChecks,
};
use crate::utils::round2;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, warn};

/// Selected scenario ids remembered for the diversity score.
const SELECTION_RING_CAP: usize = 50;
/// Selections of the same id that drive its diversity score to zero.
const DIVERSITY_SATURATION: f64 = 10.0;

const COMPOSITE_MATCH_WEIGHT: f64 = 0.40;
const COMPOSITE_RELEVANCE_WEIGHT: f64 = 0.25;
const COMPOSITE_STABILITY_WEIGHT: f64 = 0.15;
const DEAL_COMPOSITE_BOOST: f64 = 1.2;

const STABILITY_BASE: f64 = 0.7;
const STABILITY_ADVANCED_BONUS: f64 = 0.1;

const FALLBACK_CVD_PERCENT: f64 = 2.0;
const FALLBACK_LS_LONG: f64 = 1.2;
const FALLBACK_LS_SHORT: f64 = 0.8;
const FALLBACK_RANGE_ADX: f64 = 20.0;
const FALLBACK_RANGE_RSI_HIGH: f64 = 65.0;
const FALLBACK_RANGE_RSI_LOW: f64 = 35.0;
const FALLBACK_MATCH_SCORE: f64 = 0.25;

/// Outcome of one matcher invocation for one symbol.
#[derive(Debug, Clone)]
pub enum MatchDecision {
    /// A pre-check refused the cycle; reasons kept for audit.
    Vetoed(Vec<&'static str>),
    /// Nothing scored and no fallback triggered.
    Empty,
    /// Best candidate only reached observation tier: watch, write nothing.
    Observation(ScoredScenario),
    /// A signal to persist.
    Emit(Box<Signal>),
}

/// The decision core. Stateless apart from the selection ring, which is
/// owned by the scheduler task along with this struct.
pub struct ScenarioMatcher {
    config: Arc<CoreConfig>,
    library: Arc<ScenarioLibrary>,
    selections: VecDeque<String>,
}

impl ScenarioMatcher {
    pub fn new(config: Arc<CoreConfig>, library: Arc<ScenarioLibrary>) -> Self {
        ScenarioMatcher {
            config,
            library,
            selections: VecDeque::with_capacity(SELECTION_RING_CAP),
        }
    }

    /// Runs the full decision flow: veto gate, scoring, MTF and ADX
    /// adjustment, composite ranking, fallbacks, risk levels.
    pub fn evaluate(
        &mut self,
        ctx: &FusedContext,
        regime: &RegimeAssessment,
        veto: &VetoChecks,
    ) -> MatchDecision {
        if veto.has_veto() {
            let reasons = veto.reasons();
            debug!(symbol = %ctx.symbol, ?reasons, "cycle vetoed");
            return MatchDecision::Vetoed(reasons);
        }

        let mut candidates: Vec<ScoredScenario> = Vec::new();
        for scenario in self.library.scenarios() {
            if let Some(scored) = self.score_scenario(scenario, ctx) {
                candidates.push(scored);
            }
        }

        let best = candidates
            .into_iter()
            .max_by(|a, b| a.composite.total_cmp(&b.composite));

        let Some(mut best) = best else {
            return self.fallback(ctx, regime);
        };

        if best.tier == ConfidenceTier::Deal {
            best.composite *= DEAL_COMPOSITE_BOOST;
        }
        self.remember_selection(&best.scenario_id);

        if best.tier == ConfidenceTier::Observation {
            debug!(
                symbol = %ctx.symbol,
                scenario = %best.scenario_id,
                match_score = best.match_score,
                "best candidate is observation only"
            );
            return MatchDecision::Observation(best);
        }

        let Some(scenario) = self.library.get(&best.scenario_id) else {
            return MatchDecision::Empty;
        };
        match self.build_signal(ctx, regime, scenario, &best, false) {
            Some(signal) => MatchDecision::Emit(Box::new(signal)),
            None => MatchDecision::Empty,
        }
    }

    pub fn recent_selection_count(&self, id: &str) -> usize {
        self.selections.iter().filter(|s| s.as_str() == id).count()
    }

    fn remember_selection(&mut self, id: &str) {
        self.selections.push_back(id.to_string());
        while self.selections.len() > SELECTION_RING_CAP {
            self.selections.pop_front();
        }
    }

    /// Scores one scenario. Returns None when the hard trend gate fails or
    /// the adjusted match stays below the observation threshold.
    fn score_scenario(&self, scenario: &Scenario, ctx: &FusedContext) -> Option<ScoredScenario> {
        for (tf, required) in &scenario.required_trends {
            let frame = match tf {
                crate::events::Timeframe::H1 => ctx.frame_1h(),
                crate::events::Timeframe::H4 => ctx.frame_4h(),
                crate::events::Timeframe::D1 => ctx.frame_1d(),
            };
            if frame.trend != *required {
                return None;
            }
        }

        let mut total_weight = 0.0;
        let mut earned = 0.0;
        for category in &scenario.categories {
            let Some(weight) = self.config.category_weights.weight_for(&category.key) else {
                continue;
            };
            total_weight += weight;
            earned += weight * category_credit(&category.body, ctx);
        }
        let base = if total_weight > 0.0 {
            earned / total_weight
        } else {
            0.0
        };

        let mtf_score = ctx.mtf_alignment_score(scenario.direction);
        let alignment = MtfAlignment::from_score(mtf_score);
        let adx_multiplier = adx_filter(scenario.kind, ctx.base.adx);
        let match_score = (base * alignment.multiplier() * adx_multiplier).clamp(0.0, 1.0);

        if match_score < self.config.observation_threshold {
            return None;
        }

        let relevance = scenario.direction.relevance_factor(ctx.dominant_trend());
        let stability = if scenario.advanced {
            STABILITY_BASE + STABILITY_ADVANCED_BONUS
        } else {
            STABILITY_BASE
        };
        let recent = self.recent_selection_count(&scenario.id) as f64;
        let diversity = (1.0 - recent / DIVERSITY_SATURATION).max(0.0);
        let composite = COMPOSITE_MATCH_WEIGHT * match_score
            + COMPOSITE_RELEVANCE_WEIGHT * relevance
            + COMPOSITE_STABILITY_WEIGHT * stability
            + self.config.diversity_weight * diversity;

        Some(ScoredScenario {
            scenario_id: scenario.id.clone(),
            name: scenario.name.clone(),
            kind: scenario.kind,
            direction: scenario.direction,
            match_score,
            tier: ConfidenceTier::from_match_score(
                match_score,
                self.config.deal_threshold,
                self.config.risky_threshold,
            ),
            relevance,
            stability,
            diversity,
            composite,
            mtf_alignment: alignment,
            mtf_score,
            adx_multiplier,
        })
    }

    /// CVD, long/short-ratio and RSI backstops for cycles where the
    /// library produced nothing. These always emit at observation tier.
    fn fallback(&mut self, ctx: &FusedContext, regime: &RegimeAssessment) -> MatchDecision {
        let rsi_1h = ctx.frame_1h().rsi;
        let adx_1h = ctx.frame_1h().adx;
        let cvd_percent = ctx.cvd.cvd_percent;

        let (id, direction) = if cvd_percent > FALLBACK_CVD_PERCENT
            && ctx.ls_ratio > FALLBACK_LS_LONG
            && rsi_1h < 50.0
        {
            ("FALLBACK_LONG", Direction::Long)
        } else if cvd_percent < -FALLBACK_CVD_PERCENT
            && ctx.ls_ratio < FALLBACK_LS_SHORT
            && rsi_1h > 50.0
        {
            ("FALLBACK_SHORT", Direction::Short)
        } else if adx_1h < FALLBACK_RANGE_ADX && rsi_1h >= FALLBACK_RANGE_RSI_HIGH {
            ("FALLBACK_RANGE", Direction::Short)
        } else if adx_1h < FALLBACK_RANGE_ADX && rsi_1h <= FALLBACK_RANGE_RSI_LOW {
            ("FALLBACK_RANGE", Direction::Long)
        } else {
            return MatchDecision::Empty;
        };

        let scenario = Scenario {
            id: id.to_string(),
            name: id.to_string(),
            direction,
            kind: ScenarioKind::Fallback,
            type_label: "FALLBACK".to_string(),
            advanced: false,
            opinion: None,
            required_trends: Vec::new(),
            categories: Vec::new(),
            tactics: Tactics::Percent {
                tp1: 1.5,
                tp2: 2.5,
                tp3: 3.5,
                sl: 1.0,
            },
        };

        let relevance = direction.relevance_factor(ctx.dominant_trend());
        let recent = self.recent_selection_count(id) as f64;
        let diversity = (1.0 - recent / DIVERSITY_SATURATION).max(0.0);
        let mtf_score = ctx.mtf_alignment_score(direction);
        let scored = ScoredScenario {
            scenario_id: scenario.id.clone(),
            name: scenario.name.clone(),
            kind: scenario.kind,
            direction,
            match_score: FALLBACK_MATCH_SCORE,
            tier: ConfidenceTier::Observation,
            relevance,
            stability: STABILITY_BASE,
            diversity,
            composite: COMPOSITE_MATCH_WEIGHT * FALLBACK_MATCH_SCORE
                + COMPOSITE_RELEVANCE_WEIGHT * relevance
                + COMPOSITE_STABILITY_WEIGHT * STABILITY_BASE
                + self.config.diversity_weight * diversity,
            mtf_alignment: MtfAlignment::from_score(mtf_score),
            mtf_score,
            adx_multiplier: 1.0,
        };

        self.remember_selection(id);
        match self.build_signal(ctx, regime, &scenario, &scored, true) {
            Some(signal) => MatchDecision::Emit(Box::new(signal)),
            None => MatchDecision::Empty,
        }
    }

    /// Derives risk levels and assembles the signal. A degenerate level set
    /// discards the cycle rather than emitting a broken signal.
    fn build_signal(
        &self,
        ctx: &FusedContext,
        regime: &RegimeAssessment,
        scenario: &Scenario,
        scored: &ScoredScenario,
        fallback: bool,
    ) -> Option<Signal> {
        let levels = risk_levels(ctx.price, scenario, regime, ctx.base.atr14)?;
        if !levels.is_finite() || !levels.ordering_valid(scenario.direction) {
            warn!(
                symbol = %ctx.symbol,
                scenario = %scenario.id,
                ?levels,
                "rejecting signal with degenerate risk levels"
            );
            return None;
        }

        let cvd_trend = if ctx.cvd.slope > 0.0 {
            "rising"
        } else if ctx.cvd.slope < 0.0 {
            "falling"
        } else {
            "flat"
        };

        let ai = AiMetadata {
            match_score: scored.match_score,
            relevance: scored.relevance,
            stability: scored.stability,
            diversity: scored.diversity,
            composite: scored.composite,
            mtf_alignment: scored.mtf_alignment,
            mtf_score: scored.mtf_score,
            adx: ctx.base.adx,
            adx_multiplier: scored.adx_multiplier,
            regime: regime.regime,
            trend_1h: ctx.frame_1h().trend,
            trend_4h: ctx.frame_4h().trend,
            trend_1d: ctx.frame_1d().trend,
            volume_ratio: ctx.base.volume_ratio(),
            cvd_trend: cvd_trend.to_string(),
            risk_reward: levels.risk_reward(scenario.direction),
            validation_status: ctx.validation_status,
            validation_confidence: ctx.validation_confidence,
            fallback,
        };

        Some(Signal {
            id: uuid::Uuid::new_v4().to_string(),
            symbol: ctx.symbol.clone(),
            direction: scenario.direction,
            scenario_id: scenario.id.clone(),
            scenario_name: scenario.name.clone(),
            scenario_kind: scenario.kind,
            tier: scored.tier,
            status: SignalStatus::Active,
            created_at_ms: ctx.ts_ms,
            closed_at_ms: None,
            entry_price: levels.entry,
            stop_loss: levels.stop_loss,
            tp1: levels.tp1,
            tp2: levels.tp2,
            tp3: levels.tp3,
            ai,
            roi_pct: 0.0,
            tp1_hit: false,
            tp2_hit: false,
            tp3_hit: false,
            sl_hit: false,
            max_favorable_pct: 0.0,
            max_adverse_pct: 0.0,
        })
    }
}

/// Category credit in [0, 1]. A plain list pays out only when every
/// predicate passes; OR-groups pay out per group with a passing member.
/// An empty body earns nothing.
fn category_credit(body: &CategoryBody, ctx: &FusedContext) -> f64 {
    match body {
        CategoryBody::AllOf(predicates) => {
            if predicates.is_empty() {
                return 0.0;
            }
            if predicates.iter().all(|p| p.eval(ctx)) {
                1.0
            } else {
                0.0
            }
        }
        CategoryBody::AnyGroup(groups) => {
            if groups.is_empty() {
                return 0.0;
            }
            let passing = groups
                .iter()
                .filter(|group| group.iter().any(|p| p.eval(ctx)))
                .count();
            passing as f64 / groups.len() as f64
        }
    }
}

/// Trending scenarios are rewarded above ADX 25 and punished below 20;
/// ranging scenarios the other way around.
fn adx_filter(kind: ScenarioKind, adx: f64) -> f64 {
    if kind.is_trending() {
        if adx > 25.0 {
            1.15
        } else if adx < 20.0 {
            0.60
        } else {
            1.0
        }
    } else if kind.is_ranging() {
        if adx < 20.0 {
            1.10
        } else if adx > 30.0 {
            0.70
        } else {
            1.0
        }
    } else {
        1.0
    }
}

/// Percent tactics price off entry alone; ATR tactics scale by the
/// regime's SL/TP multipliers. Everything snaps to two decimals.
pub(crate) fn risk_levels(
    entry: f64,
    scenario: &Scenario,
    regime: &RegimeAssessment,
    atr: f64,
) -> Option<RiskLevels> {
    if !entry.is_finite() || entry <= 0.0 {
        return None;
    }
    let sign = match scenario.direction {
        Direction::Long => 1.0,
        Direction::Short => -1.0,
    };

    let (sl, tp1, tp2, tp3) = match scenario.tactics {
        Tactics::Percent { tp1, tp2, tp3, sl } => (
            entry * (1.0 - sign * sl / 100.0),
            entry * (1.0 + sign * tp1 / 100.0),
            entry * (1.0 + sign * tp2 / 100.0),
            entry * (1.0 + sign * tp3 / 100.0),
        ),
        Tactics::Atr { tp1, tp2, tp3, sl } => {
            if !atr.is_finite() || atr <= 0.0 {
                return None;
            }
            let tp_step = atr * regime.adaptive.tp_multiplier;
            let sl_step = atr * regime.adaptive.sl_multiplier;
            (
                entry - sign * sl * sl_step,
                entry + sign * tp1 * tp_step,
                entry + sign * tp2 * tp_step,
                entry + sign * tp3 * tp_step,
            )
        }
    };

    Some(RiskLevels {
        entry: round2(entry),
        stop_loss: round2(sl),
        tp1: round2(tp1),
        tp2: round2(tp2),
        tp3: round2(tp3),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::condition::parse_predicate;
    use crate::engine::indicators::IndicatorSnapshot;
    use crate::engine::regime::AdaptiveConfig;
    use crate::engine::types::MarketRegime;
    use crate::market::cvd::CvdSnapshot;
    use crate::market::mtf::{MtfEntry, TfAssessment, TrendDirection};
    use crate::market::validator::ValidationStatus;

    fn preds(texts: &[&str]) -> Vec<crate::engine::condition::Predicate> {
        texts.iter().map(|t| parse_predicate(t).unwrap()).collect()
    }

    fn all_of(key: &str, texts: &[&str]) -> crate::engine::library::ConditionCategory {
        crate::engine::library::ConditionCategory {
            key: key.to_string(),
            body: CategoryBody::AllOf(preds(texts)),
        }
    }

    fn any_group(key: &str, groups: &[&[&str]]) -> crate::engine::library::ConditionCategory {
        crate::engine::library::ConditionCategory {
            key: key.to_string(),
            body: CategoryBody::AnyGroup(groups.iter().map(|g| preds(g)).collect()),
        }
    }

    fn momentum_long() -> Scenario {
        Scenario {
            id: "MOMO_LONG".to_string(),
            name: "Momentum continuation".to_string(),
            direction: Direction::Long,
            kind: ScenarioKind::Momentum,
            type_label: "MOMENTUM-LONG".to_string(),
            advanced: false,
            opinion: None,
            required_trends: vec![(crate::events::Timeframe::H4, TrendDirection::Bullish)],
            categories: vec![
                all_of("mtf", &["trend_1h == BULLISH", "trend_4h == BULLISH", "trend_1d == BULLISH"]),
                all_of("exocharts", &["pullback_to_poc"]),
                all_of("cvd", &["cvd_value > 0"]),
                any_group("clusters", &[&["cluster.stacked_imbalance_up"]]),
                any_group("news", &[&["news_score > 0.5"]]),
                any_group("triggers", &[&["volume_ratio > 2"]]),
            ],
            tactics: Tactics::default(),
        }
    }

    fn bullish_context() -> FusedContext {
        let mut entry = MtfEntry {
            ts_ms: 0,
            h1: TfAssessment::default(),
            h4: TfAssessment::default(),
            d1: TfAssessment::default(),
        };
        entry.h1.trend = TrendDirection::Bullish;
        entry.h4.trend = TrendDirection::Bullish;
        entry.d1.trend = TrendDirection::Bullish;
        entry.h1.rsi = 60.0;
        entry.h1.adx = 28.0;

        let mut base = IndicatorSnapshot::default();
        base.adx = 30.0;
        base.plus_di = 30.0;
        base.minus_di = 12.0;
        base.atr14 = 600.0;

        let mut cvd = CvdSnapshot::default();
        cvd.cvd_5m = 1_000.0;
        cvd.cvd_15m = 2_500.0;
        cvd.slope = 400.0;
        cvd.cvd_percent = 1.0;

        FusedContext {
            symbol: "BTCUSDT".to_string(),
            ts_ms: 1_700_000_000_000,
            price: 50_000.0,
            imbalance: 0.2,
            ls_ratio: 1.1,
            stacked_imbalance_up: true,
            stacked_imbalance_down: false,
            cvd,
            profile: None,
            base,
            mtf: Some(entry),
            news_score: 0.0,
            validation_status: ValidationStatus::Valid,
            validation_confidence: 100.0,
        }
    }

    fn strong_trend_regime() -> RegimeAssessment {
        RegimeAssessment {
            regime: MarketRegime::StrongTrend,
            adaptive: AdaptiveConfig::for_regime(MarketRegime::StrongTrend),
            atr_pct: 1.2,
            atr_pct_ma20: 1.1,
            adx: 30.0,
            adx_ma20: 27.0,
            samples: 20,
        }
    }

    fn matcher_with(scenarios: Vec<Scenario>) -> ScenarioMatcher {
        ScenarioMatcher::new(
            Arc::new(CoreConfig::default()),
            Arc::new(ScenarioLibrary::from_scenarios(scenarios)),
        )
    }

    #[test]
    fn test_trend_confirmed_long_emits_exact_levels() {
        let mut matcher = matcher_with(vec![momentum_long()]);
        let ctx = bullish_context();
        let decision = matcher.evaluate(&ctx, &strong_trend_regime(), &VetoChecks::default());

        let MatchDecision::Emit(signal) = decision else {
            panic!("expected an emitted signal, got {decision:?}");
        };
        assert_eq!(signal.direction, Direction::Long);
        assert_eq!(signal.tier, ConfidenceTier::Deal);
        assert_eq!(signal.status, SignalStatus::Active);
        assert_eq!(signal.entry_price, 50_000.0);
        assert_eq!(signal.stop_loss, 49_250.0);
        assert_eq!(signal.tp1, 51_000.0);
        assert_eq!(signal.tp2, 52_000.0);
        assert_eq!(signal.tp3, 53_000.0);

        // mtf + cvd + clusters pass, exocharts + news + triggers fail.
        let expected_match = 0.60 * 1.20 * 1.15;
        assert!((signal.ai.match_score - expected_match).abs() < 1e-9);
        assert_eq!(signal.ai.mtf_alignment, MtfAlignment::Strong);
        assert!((signal.ai.mtf_score - 0.80).abs() < 1e-12);
        assert!((signal.ai.adx_multiplier - 1.15).abs() < 1e-12);
        assert!(!signal.ai.fallback);
        assert_eq!(signal.ai.cvd_trend, "rising");
        assert!(signal.is_active());
    }

    #[test]
    fn test_opposing_4h_trend_writes_nothing() {
        let mut matcher = matcher_with(vec![momentum_long()]);
        let mut ctx = bullish_context();
        if let Some(entry) = ctx.mtf.as_mut() {
            entry.h4.trend = TrendDirection::Bearish;
        }
        let decision = matcher.evaluate(&ctx, &strong_trend_regime(), &VetoChecks::default());
        // The required 4h trend gates the scenario out and nothing else
        // qualifies; CVD is too weak for a fallback.
        assert!(matches!(decision, MatchDecision::Empty));
    }

    #[test]
    fn test_veto_gate_preserves_reasons() {
        let mut matcher = matcher_with(vec![momentum_long()]);
        let ctx = bullish_context();
        let veto = VetoChecks {
            validator: true,
            active_signal: true,
            cooldown: false,
        };
        let decision = matcher.evaluate(&ctx, &strong_trend_regime(), &veto);
        let MatchDecision::Vetoed(reasons) = decision else {
            panic!("expected veto");
        };
        assert_eq!(reasons, vec!["cross_venue_invalid", "active_signal_exists"]);
    }

    #[test]
    fn test_fallback_long_emits_at_observation() {
        let mut gated = momentum_long();
        gated.required_trends = vec![(crate::events::Timeframe::H4, TrendDirection::Bearish)];
        let mut matcher = matcher_with(vec![gated]);

        let mut ctx = bullish_context();
        ctx.cvd.cvd_percent = 3.0;
        ctx.ls_ratio = 1.5;
        if let Some(entry) = ctx.mtf.as_mut() {
            entry.h1.rsi = 40.0;
        }

        let decision = matcher.evaluate(&ctx, &strong_trend_regime(), &VetoChecks::default());
        let MatchDecision::Emit(signal) = decision else {
            panic!("expected fallback signal, got {decision:?}");
        };
        assert_eq!(signal.scenario_id, "FALLBACK_LONG");
        assert_eq!(signal.direction, Direction::Long);
        assert_eq!(signal.tier, ConfidenceTier::Observation);
        assert!((signal.ai.match_score - 0.25).abs() < 1e-12);
        assert!(signal.ai.fallback);
        // tp1 1.5% and sl 1.0% of a 50k entry.
        assert_eq!(signal.tp1, 50_750.0);
        assert_eq!(signal.stop_loss, 49_500.0);
    }

    #[test]
    fn test_fallback_range_uses_rsi_extremes() {
        let mut matcher = matcher_with(vec![momentum_long()]);
        let mut ctx = bullish_context();
        // Kill the regular path and the directional fallbacks.
        if let Some(entry) = ctx.mtf.as_mut() {
            entry.h4.trend = TrendDirection::Bearish;
            entry.h1.adx = 12.0;
            entry.h1.rsi = 70.0;
        }
        ctx.cvd.cvd_percent = 0.5;

        let decision = matcher.evaluate(&ctx, &strong_trend_regime(), &VetoChecks::default());
        let MatchDecision::Emit(signal) = decision else {
            panic!("expected range fallback, got {decision:?}");
        };
        assert_eq!(signal.scenario_id, "FALLBACK_RANGE");
        assert_eq!(signal.direction, Direction::Short);
    }

    #[test]
    fn test_observation_tier_watches_without_writing() {
        // One of ten OR-groups passes: base 0.10, weak alignment drags the
        // match under the risky threshold but above observation.
        let scenario = Scenario {
            id: "THIN".to_string(),
            name: "THIN".to_string(),
            direction: Direction::Long,
            kind: ScenarioKind::Other,
            type_label: String::new(),
            advanced: false,
            opinion: None,
            required_trends: Vec::new(),
            categories: vec![any_group(
                "clusters",
                &[
                    &["cluster.stacked_imbalance_up"],
                    &["news_score > 9"],
                    &["news_score > 9"],
                    &["news_score > 9"],
                    &["news_score > 9"],
                    &["news_score > 9"],
                    &["news_score > 9"],
                    &["news_score > 9"],
                    &["news_score > 9"],
                    &["news_score > 9"],
                ],
            )],
            tactics: Tactics::default(),
        };
        let mut matcher = matcher_with(vec![scenario]);
        let mut ctx = bullish_context();
        if let Some(entry) = ctx.mtf.as_mut() {
            entry.h1.trend = TrendDirection::Neutral;
            entry.h4.trend = TrendDirection::Neutral;
        }
        // Alignment 0.40 -> WEAK x0.80; base 0.10 -> match 0.08.
        let decision = matcher.evaluate(&ctx, &strong_trend_regime(), &VetoChecks::default());
        let MatchDecision::Observation(scored) = decision else {
            panic!("expected observation, got {decision:?}");
        };
        assert!((scored.match_score - 0.08).abs() < 1e-9);
        assert_eq!(scored.tier, ConfidenceTier::Observation);
    }

    #[test]
    fn test_atr_tactics_scale_with_regime() {
        let mut scenario = momentum_long();
        scenario.tactics = Tactics::Atr {
            tp1: 1.0,
            tp2: 2.0,
            tp3: 3.0,
            sl: 1.5,
        };
        let mut matcher = matcher_with(vec![scenario]);
        let ctx = bullish_context();
        let regime = RegimeAssessment {
            regime: MarketRegime::HighVol,
            adaptive: AdaptiveConfig::for_regime(MarketRegime::HighVol),
            atr_pct: 3.0,
            atr_pct_ma20: 2.8,
            adx: 30.0,
            adx_ma20: 27.0,
            samples: 20,
        };
        let decision = matcher.evaluate(&ctx, &regime, &VetoChecks::default());
        let MatchDecision::Emit(signal) = decision else {
            panic!("expected signal, got {decision:?}");
        };
        // ATR 600, tp multiplier 1.5 -> step 900; sl multiplier 1.3 -> 780.
        assert_eq!(signal.stop_loss, 50_000.0 - 1.5 * 780.0);
        assert_eq!(signal.tp1, 50_900.0);
        assert_eq!(signal.tp2, 51_800.0);
        assert_eq!(signal.tp3, 52_700.0);
    }

    #[test]
    fn test_degenerate_atr_discards_cycle() {
        let mut scenario = momentum_long();
        scenario.tactics = Tactics::Atr {
            tp1: 1.0,
            tp2: 2.0,
            tp3: 3.0,
            sl: 1.5,
        };
        let mut matcher = matcher_with(vec![scenario]);
        let mut ctx = bullish_context();
        ctx.base.atr14 = 0.0;
        let decision = matcher.evaluate(&ctx, &strong_trend_regime(), &VetoChecks::default());
        assert!(matches!(decision, MatchDecision::Empty));
    }

    #[test]
    fn test_diversity_decays_with_repeated_selection() {
        let mut matcher = matcher_with(vec![momentum_long()]);
        let ctx = bullish_context();
        let regime = strong_trend_regime();

        let mut composites = Vec::new();
        for _ in 0..12 {
            let decision = matcher.evaluate(&ctx, &regime, &VetoChecks::default());
            let MatchDecision::Emit(signal) = decision else {
                panic!("expected signal");
            };
            composites.push((signal.ai.diversity, signal.ai.composite));
        }
        assert!((composites[0].0 - 1.0).abs() < 1e-12);
        assert!((composites[5].0 - 0.5).abs() < 1e-12);
        // After ten selections the diversity term is exhausted.
        assert_eq!(composites[10].0, 0.0);
        assert_eq!(composites[11].0, 0.0);
        assert!(composites[0].1 > composites[10].1);
    }

    #[test]
    fn test_selection_ring_is_bounded() {
        let mut matcher = matcher_with(vec![momentum_long()]);
        let ctx = bullish_context();
        let regime = strong_trend_regime();
        for _ in 0..80 {
            let _ = matcher.evaluate(&ctx, &regime, &VetoChecks::default());
        }
        assert_eq!(matcher.recent_selection_count("MOMO_LONG"), SELECTION_RING_CAP);
    }

    #[test]
    fn test_best_composite_wins() {
        let mut weak = momentum_long();
        weak.id = "WEAK".to_string();
        weak.categories = vec![all_of("cvd", &["cvd_value > 0"])];
        weak.advanced = false;
        let mut strong = momentum_long();
        strong.id = "STRONG".to_string();
        strong.categories = vec![
            all_of("mtf", &["trend_1h == BULLISH", "trend_4h == BULLISH"]),
            all_of("cvd", &["cvd_value > 0"]),
        ];
        strong.advanced = true;

        let mut matcher = matcher_with(vec![weak, strong]);
        let ctx = bullish_context();
        let decision = matcher.evaluate(&ctx, &strong_trend_regime(), &VetoChecks::default());
        let MatchDecision::Emit(signal) = decision else {
            panic!("expected signal");
        };
        // Both reach full base; the advanced one wins on stability.
        assert_eq!(signal.scenario_id, "STRONG");
    }

    #[test]
    fn test_deal_composite_boost_applies_to_winner() {
        let mut matcher = matcher_with(vec![momentum_long()]);
        let ctx = bullish_context();
        let decision = matcher.evaluate(&ctx, &strong_trend_regime(), &VetoChecks::default());
        let MatchDecision::Emit(signal) = decision else {
            panic!("expected signal");
        };
        let unboosted = COMPOSITE_MATCH_WEIGHT * signal.ai.match_score
            + COMPOSITE_RELEVANCE_WEIGHT * signal.ai.relevance
            + COMPOSITE_STABILITY_WEIGHT * signal.ai.stability
            + 0.20 * signal.ai.diversity;
        assert!((signal.ai.composite - unboosted * DEAL_COMPOSITE_BOOST).abs() < 1e-9);
    }

    #[test]
    fn test_adx_filter_table() {
        assert_eq!(adx_filter(ScenarioKind::Momentum, 30.0), 1.15);
        assert_eq!(adx_filter(ScenarioKind::Momentum, 15.0), 0.60);
        assert_eq!(adx_filter(ScenarioKind::Momentum, 22.0), 1.0);
        assert_eq!(adx_filter(ScenarioKind::Range, 15.0), 1.10);
        assert_eq!(adx_filter(ScenarioKind::Range, 35.0), 0.70);
        assert_eq!(adx_filter(ScenarioKind::Range, 25.0), 1.0);
        assert_eq!(adx_filter(ScenarioKind::Fallback, 5.0), 1.0);
        assert_eq!(adx_filter(ScenarioKind::Other, 50.0), 1.0);
    }

    #[test]
    fn test_empty_categories_score_zero() {
        let mut empty = momentum_long();
        empty.id = "EMPTY".to_string();
        empty.required_trends = Vec::new();
        empty.categories = vec![all_of("mtf", &[])];
        let mut matcher = matcher_with(vec![empty]);
        let mut ctx = bullish_context();
        ctx.cvd.cvd_percent = 0.0;
        let decision = matcher.evaluate(&ctx, &strong_trend_regime(), &VetoChecks::default());
        assert!(matches!(decision, MatchDecision::Empty));
    }
}
