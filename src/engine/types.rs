use crate::engine::condition::{EvalContext, Value};
use crate::engine::indicators::IndicatorSnapshot;
use crate::market::cvd::CvdSnapshot;
use crate::market::mtf::{MtfEntry, TfAssessment, TrendDirection};
use crate::market::profile::VolumeProfile;
use crate::market::validator::ValidationStatus;
use serde::{Deserialize, Serialize};

/// Weighted timeframe contributions to MTF alignment. The 15m slot exists
/// in the weighting but no 15m series is tracked, so it contributes zero;
/// full alignment therefore tops out at 0.80.
const MTF_WEIGHT_4H: f64 = 0.50;
const MTF_WEIGHT_1H: f64 = 0.30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Long => "LONG",
            Direction::Short => "SHORT",
        }
    }

    /// Per-timeframe alignment credit: full for agreement, half for a
    /// neutral trend, none when opposed.
    pub fn trend_factor(&self, trend: TrendDirection) -> f64 {
        match (self, trend) {
            (Direction::Long, TrendDirection::Bullish) => 1.0,
            (Direction::Short, TrendDirection::Bearish) => 1.0,
            (_, TrendDirection::Neutral) => 0.5,
            _ => 0.0,
        }
    }

    /// Relevance credit against the dominant MTF trend.
    pub fn relevance_factor(&self, dominant: TrendDirection) -> f64 {
        match (self, dominant) {
            (Direction::Long, TrendDirection::Bullish) => 1.0,
            (Direction::Short, TrendDirection::Bearish) => 1.0,
            (_, TrendDirection::Neutral) => 0.5,
            _ => 0.2,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceTier {
    Deal,
    RiskyEntry,
    Observation,
}

impl ConfidenceTier {
    pub fn from_match_score(score: f64, deal: f64, risky: f64) -> ConfidenceTier {
        if score >= deal {
            ConfidenceTier::Deal
        } else if score >= risky {
            ConfidenceTier::RiskyEntry
        } else {
            ConfidenceTier::Observation
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConfidenceTier::Deal => "deal",
            ConfidenceTier::RiskyEntry => "risky_entry",
            ConfidenceTier::Observation => "observation",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalStatus {
    Active,
    Closed,
}

/// MTF alignment strength and its score multiplier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MtfAlignment {
    Strong,
    Moderate,
    Weak,
    None,
}

impl MtfAlignment {
    pub fn from_score(score: f64) -> MtfAlignment {
        if score >= 0.80 {
            MtfAlignment::Strong
        } else if score >= 0.60 {
            MtfAlignment::Moderate
        } else if score >= 0.40 {
            MtfAlignment::Weak
        } else {
            MtfAlignment::None
        }
    }

    pub fn multiplier(&self) -> f64 {
        match self {
            MtfAlignment::Strong => 1.20,
            MtfAlignment::Moderate => 1.00,
            MtfAlignment::Weak => 0.80,
            MtfAlignment::None => 0.50,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MtfAlignment::Strong => "STRONG",
            MtfAlignment::Moderate => "MODERATE",
            MtfAlignment::Weak => "WEAK",
            MtfAlignment::None => "NONE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MarketRegime {
    StrongTrend,
    MediumTrend,
    HighVol,
    Ranging,
    Choppy,
    Unknown,
}

impl MarketRegime {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketRegime::StrongTrend => "STRONG_TREND",
            MarketRegime::MediumTrend => "MEDIUM_TREND",
            MarketRegime::HighVol => "HIGH_VOL",
            MarketRegime::Ranging => "RANGING",
            MarketRegime::Choppy => "CHOPPY",
            MarketRegime::Unknown => "UNKNOWN",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScenarioKind {
    Momentum,
    Breakout,
    Pullback,
    MeanReversion,
    Wyckoff,
    Range,
    Fallback,
    #[serde(other)]
    Other,
}

impl ScenarioKind {
    /// Maps a library `type` label such as "MOMENTUM-LONG" or
    /// "mean_reversion" onto a kind. Unrecognized labels become Other,
    /// which no ADX filter applies to.
    pub fn from_type_str(label: &str) -> ScenarioKind {
        let upper = label.trim().to_ascii_uppercase();
        if upper.starts_with("MOMENTUM") {
            ScenarioKind::Momentum
        } else if upper.starts_with("BREAKOUT") {
            ScenarioKind::Breakout
        } else if upper.starts_with("PULLBACK") {
            ScenarioKind::Pullback
        } else if upper.starts_with("MEAN") {
            ScenarioKind::MeanReversion
        } else if upper.starts_with("WYCKOFF") {
            ScenarioKind::Wyckoff
        } else if upper.starts_with("FALLBACK") {
            ScenarioKind::Fallback
        } else if upper.starts_with("RANGE") {
            ScenarioKind::Range
        } else {
            ScenarioKind::Other
        }
    }

    pub fn is_trending(&self) -> bool {
        matches!(
            self,
            ScenarioKind::Momentum | ScenarioKind::Breakout | ScenarioKind::Pullback
        )
    }

    pub fn is_ranging(&self) -> bool {
        matches!(
            self,
            ScenarioKind::MeanReversion | ScenarioKind::Wyckoff | ScenarioKind::Range
        )
    }
}

/// Entry plus the protective levels around it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskLevels {
    pub entry: f64,
    pub stop_loss: f64,
    pub tp1: f64,
    pub tp2: f64,
    pub tp3: f64,
}

impl RiskLevels {
    /// LONG demands sl < entry < tp1 <= tp2 <= tp3; SHORT is mirrored.
    pub fn ordering_valid(&self, direction: Direction) -> bool {
        match direction {
            Direction::Long => {
                self.stop_loss < self.entry
                    && self.entry < self.tp1
                    && self.tp1 <= self.tp2
                    && self.tp2 <= self.tp3
            }
            Direction::Short => {
                self.stop_loss > self.entry
                    && self.entry > self.tp1
                    && self.tp1 >= self.tp2
                    && self.tp2 >= self.tp3
            }
        }
    }

    pub fn is_finite(&self) -> bool {
        [self.entry, self.stop_loss, self.tp1, self.tp2, self.tp3]
            .iter()
            .all(|v| v.is_finite() && *v > 0.0)
    }

    /// First-target reward over risk; 0 when risk is degenerate.
    pub fn risk_reward(&self, direction: Direction) -> f64 {
        let (reward, risk) = match direction {
            Direction::Long => (self.tp1 - self.entry, self.entry - self.stop_loss),
            Direction::Short => (self.entry - self.tp1, self.stop_loss - self.entry),
        };
        if risk > 0.0 {
            reward / risk
        } else {
            0.0
        }
    }
}

/// Why a tick was suppressed before matching.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VetoChecks {
    /// Validator reported INVALID for N consecutive cycles.
    pub validator: bool,
    /// The symbol already has an ACTIVE signal.
    pub active_signal: bool,
    /// A signal on this symbol closed inside the cooldown window.
    pub cooldown: bool,
}

impl VetoChecks {
    pub fn has_veto(&self) -> bool {
        self.validator || self.active_signal || self.cooldown
    }

    pub fn reasons(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        if self.validator {
            out.push("cross_venue_invalid");
        }
        if self.active_signal {
            out.push("active_signal_exists");
        }
        if self.cooldown {
            out.push("recent_close_cooldown");
        }
        out
    }
}

/// Justification attached to an emitted signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiMetadata {
    pub match_score: f64,
    pub relevance: f64,
    pub stability: f64,
    pub diversity: f64,
    pub composite: f64,
    pub mtf_alignment: MtfAlignment,
    pub mtf_score: f64,
    pub adx: f64,
    pub adx_multiplier: f64,
    pub regime: MarketRegime,
    pub trend_1h: TrendDirection,
    pub trend_4h: TrendDirection,
    pub trend_1d: TrendDirection,
    pub volume_ratio: f64,
    /// CVD slope label: rising, falling or flat.
    pub cvd_trend: String,
    pub risk_reward: f64,
    pub validation_status: ValidationStatus,
    pub validation_confidence: f64,
    pub fallback: bool,
}

/// One candidate after scoring, before signal assembly.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredScenario {
    pub scenario_id: String,
    pub name: String,
    pub kind: ScenarioKind,
    pub direction: Direction,
    /// Base category score after MTF and ADX multipliers, in [0, 1].
    pub match_score: f64,
    pub tier: ConfidenceTier,
    pub relevance: f64,
    pub stability: f64,
    pub diversity: f64,
    pub composite: f64,
    pub mtf_alignment: MtfAlignment,
    pub mtf_score: f64,
    pub adx_multiplier: f64,
}

/// What the core emits and the store keeps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub id: String,
    pub symbol: String,
    pub direction: Direction,
    pub scenario_id: String,
    pub scenario_name: String,
    pub scenario_kind: ScenarioKind,
    pub tier: ConfidenceTier,
    pub status: SignalStatus,
    pub created_at_ms: u64,
    pub closed_at_ms: Option<u64>,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub tp1: f64,
    pub tp2: f64,
    pub tp3: f64,
    pub ai: AiMetadata,
    /// ROI bookkeeping, updated by the store on price ticks.
    pub roi_pct: f64,
    pub tp1_hit: bool,
    pub tp2_hit: bool,
    pub tp3_hit: bool,
    pub sl_hit: bool,
    pub max_favorable_pct: f64,
    pub max_adverse_pct: f64,
}

impl Signal {
    pub fn levels(&self) -> RiskLevels {
        RiskLevels {
            entry: self.entry_price,
            stop_loss: self.stop_loss,
            tp1: self.tp1,
            tp2: self.tp2,
            tp3: self.tp3,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == SignalStatus::Active
    }
}

// ============================================================================
// Fused context
// ============================================================================

/// Everything one matcher invocation sees for a symbol, copied out of the
/// live stores so evaluation never holds a lock.
#[derive(Debug, Clone)]
pub struct FusedContext {
    pub symbol: String,
    pub ts_ms: u64,
    pub price: f64,
    pub imbalance: f64,
    pub ls_ratio: f64,
    pub stacked_imbalance_up: bool,
    pub stacked_imbalance_down: bool,
    pub cvd: CvdSnapshot,
    pub profile: Option<VolumeProfile>,
    /// Indicator digest of the 1h base series.
    pub base: IndicatorSnapshot,
    pub mtf: Option<MtfEntry>,
    pub news_score: f64,
    pub validation_status: ValidationStatus,
    pub validation_confidence: f64,
}

impl FusedContext {
    fn frame(&self, pick: fn(&MtfEntry) -> &TfAssessment) -> TfAssessment {
        self.mtf.as_ref().map(|m| *pick(m)).unwrap_or_default()
    }

    pub fn frame_1h(&self) -> TfAssessment {
        self.frame(|m| &m.h1)
    }

    pub fn frame_4h(&self) -> TfAssessment {
        self.frame(|m| &m.h4)
    }

    pub fn frame_1d(&self) -> TfAssessment {
        self.frame(|m| &m.d1)
    }

    /// Weighted TF alignment for a required direction. The 15m slot is
    /// never available, so it contributes nothing.
    pub fn mtf_alignment_score(&self, direction: Direction) -> f64 {
        MTF_WEIGHT_4H * direction.trend_factor(self.frame_4h().trend)
            + MTF_WEIGHT_1H * direction.trend_factor(self.frame_1h().trend)
    }

    /// Dominant trend across the cached timeframes by weighted vote.
    pub fn dominant_trend(&self) -> TrendDirection {
        let mut bull = 0.0;
        let mut bear = 0.0;
        for (weight, frame) in [
            (0.50, self.frame_4h()),
            (0.30, self.frame_1h()),
            (0.20, self.frame_1d()),
        ] {
            match frame.trend {
                TrendDirection::Bullish => bull += weight,
                TrendDirection::Bearish => bear += weight,
                TrendDirection::Neutral => {}
            }
        }
        if bull > bear {
            TrendDirection::Bullish
        } else if bear > bull {
            TrendDirection::Bearish
        } else {
            TrendDirection::Neutral
        }
    }
}

impl EvalContext for FusedContext {
    fn lookup(&self, ident: &str) -> Option<Value> {
        let num = Value::Num;
        Some(match ident {
            "price" => num(self.price),
            "poc" => num(self.profile?.poc),
            "vah" => num(self.profile?.vah),
            "val" => num(self.profile?.val),
            "vwap" => num(self.profile?.vwap),
            "atr" => num(self.base.atr14),
            "atr_pct" => num(self.base.atr_pct),
            "volume" => num(self.base.volume),
            "volume_ma20" => num(self.base.volume_ma20),
            "volume_ratio" => num(self.base.volume_ratio()),
            "rsi" => num(self.base.rsi),
            "adx" => num(self.base.adx),
            "plus_di" => num(self.base.plus_di),
            "minus_di" => num(self.base.minus_di),
            "ema20" => num(self.base.ema20),
            "ema50" => num(self.base.ema50),
            "macd_line" => num(self.base.macd_line),
            "macd_signal" => num(self.base.macd_signal),
            "macd_hist" => num(self.base.macd_hist),
            "bb_upper" => num(self.base.bb_upper),
            "bb_middle" => num(self.base.bb_middle),
            "bb_lower" => num(self.base.bb_lower),
            "bb_width" => num(self.base.bb_width),
            "stoch_rsi_k" => num(self.base.stoch_rsi_k),
            "stoch_rsi_d" => num(self.base.stoch_rsi_d),
            "trend_1h" => Value::Str(self.frame_1h().trend.as_str().to_string()),
            "trend_4h" => Value::Str(self.frame_4h().trend.as_str().to_string()),
            "trend_1d" => Value::Str(self.frame_1d().trend.as_str().to_string()),
            "adx_1h" => num(self.frame_1h().adx),
            "adx_4h" => num(self.frame_4h().adx),
            "adx_1d" => num(self.frame_1d().adx),
            "rsi_1h" => num(self.frame_1h().rsi),
            "rsi_4h" => num(self.frame_4h().rsi),
            "rsi_1d" => num(self.frame_1d().rsi),
            "volume_delta_1h" => num(self.frame_1h().volume_delta),
            "volume_delta_4h" => num(self.frame_4h().volume_delta),
            "volume_delta_1d" => num(self.frame_1d().volume_delta),
            "cvd_value" => num(self.cvd.cvd_15m),
            "cvd_percent" => num(self.cvd.cvd_percent),
            "cvd_slope" => num(self.cvd.slope),
            "cvd_confirms" => Value::Bool(self.cvd.confirms),
            "cluster.stacked_imbalance_up" => Value::Bool(self.stacked_imbalance_up),
            "cluster.stacked_imbalance_down" => Value::Bool(self.stacked_imbalance_down),
            "cluster.absorption_high" => Value::Bool(self.cvd.absorption_high),
            "cluster.absorption_low" => Value::Bool(self.cvd.absorption_low),
            "pullback_to_poc" => {
                Value::Bool(self.profile.is_some_and(|p| p.pullback_to_poc(self.price)))
            }
            "in_value_area" => {
                Value::Bool(self.profile.is_some_and(|p| p.in_value_area(self.price)))
            }
            "news_score" => num(self.news_score),
            "triggers.all" => Value::Bool(true),
            "imbalance" => num(self.imbalance),
            "ls_ratio" => num(self.ls_ratio),
            "whale_count" => num(self.cvd.whale_count_15m as f64),
            "whale_net_notional" => num(self.cvd.whale_net_notional_15m),
            _ => return None,
        })
    }
}
