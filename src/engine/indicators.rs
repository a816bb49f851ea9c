use crate::market::candles::Candle;
use crate::market::mtf::TrendDirection;
use serde::{Deserialize, Serialize};

pub const DEFAULT_PERIOD: usize = 14;
const MACD_FAST: usize = 12;
const MACD_SLOW: usize = 26;
const MACD_SIGNAL: usize = 9;
const BB_PERIOD: usize = 20;
const BB_K: f64 = 2.0;

/// Trend strength label from ADX.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendStrength {
    Strong,
    Moderate,
    Weak,
}

impl TrendStrength {
    pub fn from_adx(adx: f64) -> TrendStrength {
        if adx > 25.0 {
            TrendStrength::Strong
        } else if adx > 20.0 {
            TrendStrength::Moderate
        } else {
            TrendStrength::Weak
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TrendStrength::Strong => "strong",
            TrendStrength::Moderate => "moderate",
            TrendStrength::Weak => "weak",
        }
    }
}

/// Volatility band from percentage ATR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AtrBand {
    High,
    Medium,
    Low,
}

impl AtrBand {
    pub fn from_pct(atr_pct: f64) -> AtrBand {
        if atr_pct > 3.0 {
            AtrBand::High
        } else if atr_pct > 1.5 {
            AtrBand::Medium
        } else {
            AtrBand::Low
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdxResult {
    pub adx: f64,
    pub plus_di: f64,
    pub minus_di: f64,
}

impl Default for AdxResult {
    fn default() -> Self {
        AdxResult {
            adx: 0.0,
            plus_di: 0.0,
            minus_di: 0.0,
        }
    }
}

/// Everything the matcher needs from one candle series. Warmup shortfalls
/// yield the neutral values below instead of NaN.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    pub adx: f64,
    pub plus_di: f64,
    pub minus_di: f64,
    pub rsi: f64,
    pub ema20: f64,
    pub ema50: f64,
    pub macd_line: f64,
    pub macd_signal: f64,
    pub macd_hist: f64,
    pub atr14: f64,
    /// ATR / close * 100.
    pub atr_pct: f64,
    pub atr_sma20: f64,
    pub bb_upper: f64,
    pub bb_middle: f64,
    pub bb_lower: f64,
    pub bb_width: f64,
    pub stoch_rsi_k: f64,
    pub stoch_rsi_d: f64,
    pub trend: TrendDirection,
    pub strength: TrendStrength,
    pub close: f64,
    pub volume: f64,
    pub volume_ma20: f64,
}

impl Default for IndicatorSnapshot {
    fn default() -> Self {
        IndicatorSnapshot {
            adx: 0.0,
            plus_di: 0.0,
            minus_di: 0.0,
            rsi: 50.0,
            ema20: 0.0,
            ema50: 0.0,
            macd_line: 0.0,
            macd_signal: 0.0,
            macd_hist: 0.0,
            atr14: 0.0,
            atr_pct: 0.0,
            atr_sma20: 0.0,
            bb_upper: 0.0,
            bb_middle: 0.0,
            bb_lower: 0.0,
            bb_width: 0.0,
            stoch_rsi_k: 50.0,
            stoch_rsi_d: 50.0,
            trend: TrendDirection::Neutral,
            strength: TrendStrength::Weak,
            close: 0.0,
            volume: 0.0,
            volume_ma20: 0.0,
        }
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn mean_tail(values: &[f64], n: usize) -> f64 {
    let start = values.len().saturating_sub(n);
    mean(&values[start..])
}

// ============================================================================
// Moving averages
// ============================================================================

/// EMA series seeded with the SMA of the first `period` values. Output is
/// aligned so `out[0]` corresponds to input index `period - 1`.
pub fn ema_series(values: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || values.len() < period {
        return Vec::new();
    }
    let k = 2.0 / (period as f64 + 1.0);
    let mut out = Vec::with_capacity(values.len() - period + 1);
    let mut current = mean(&values[..period]);
    out.push(current);
    for &value in &values[period..] {
        current = value * k + current * (1.0 - k);
        out.push(current);
    }
    out
}

/// Latest EMA; the mean of what is available on insufficient warmup.
pub fn ema(values: &[f64], period: usize) -> f64 {
    match ema_series(values, period).last() {
        Some(&last) => last,
        None => mean(values),
    }
}

// ============================================================================
// RSI / Stochastic RSI
// ============================================================================

/// Wilder RSI series; `out[0]` corresponds to input index `period`.
pub fn rsi_series(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() < period + 1 {
        return Vec::new();
    }
    let mut gains = Vec::with_capacity(closes.len() - 1);
    let mut losses = Vec::with_capacity(closes.len() - 1);
    for pair in closes.windows(2) {
        let change = pair[1] - pair[0];
        gains.push(change.max(0.0));
        losses.push((-change).max(0.0));
    }
    let mut avg_gain = mean(&gains[..period]);
    let mut avg_loss = mean(&losses[..period]);
    let p = period as f64;
    let rsi_of = |gain: f64, loss: f64| {
        if loss <= f64::EPSILON {
            if gain <= f64::EPSILON {
                50.0
            } else {
                100.0
            }
        } else {
            100.0 - 100.0 / (1.0 + gain / loss)
        }
    };
    let mut out = Vec::with_capacity(gains.len() - period + 1);
    out.push(rsi_of(avg_gain, avg_loss));
    for i in period..gains.len() {
        avg_gain = (avg_gain * (p - 1.0) + gains[i]) / p;
        avg_loss = (avg_loss * (p - 1.0) + losses[i]) / p;
        out.push(rsi_of(avg_gain, avg_loss));
    }
    out
}

/// Latest Wilder RSI, 50 on insufficient warmup.
pub fn rsi(closes: &[f64], period: usize) -> f64 {
    rsi_series(closes, period).last().copied().unwrap_or(50.0)
}

/// Stochastic RSI %K/%D on the 0-100 scale, (50, 50) on warmup.
pub fn stoch_rsi(closes: &[f64], period: usize) -> (f64, f64) {
    let rsis = rsi_series(closes, period);
    if rsis.len() < period {
        return (50.0, 50.0);
    }
    let mut raw = Vec::with_capacity(rsis.len() - period + 1);
    for window in rsis.windows(period) {
        let lowest = window.iter().cloned().fold(f64::MAX, f64::min);
        let highest = window.iter().cloned().fold(f64::MIN, f64::max);
        let span = highest - lowest;
        if span <= f64::EPSILON {
            raw.push(50.0);
        } else {
            raw.push(100.0 * (window[period - 1] - lowest) / span);
        }
    }
    // %K smooths raw with SMA(3), %D smooths %K the same way. Partial
    // windows use what is available.
    let mut k_series = Vec::with_capacity(raw.len());
    for i in 0..raw.len() {
        k_series.push(mean_tail(&raw[..=i], 3));
    }
    let k = *k_series.last().unwrap_or(&50.0);
    let d = mean_tail(&k_series, 3);
    (k, d)
}

// ============================================================================
// MACD
// ============================================================================

/// (line, signal, histogram) for 12/26/9; zeros on insufficient warmup.
pub fn macd(closes: &[f64]) -> (f64, f64, f64) {
    if closes.len() < MACD_SLOW {
        return (0.0, 0.0, 0.0);
    }
    let fast = ema_series(closes, MACD_FAST);
    let slow = ema_series(closes, MACD_SLOW);
    // fast is longer; align both to the slow series' first index.
    let offset = fast.len() - slow.len();
    let macd_line: Vec<f64> = slow
        .iter()
        .enumerate()
        .map(|(i, &s)| fast[offset + i] - s)
        .collect();
    let line = *macd_line.last().unwrap_or(&0.0);
    let signal = if macd_line.len() >= MACD_SIGNAL {
        *ema_series(&macd_line, MACD_SIGNAL).last().unwrap_or(&0.0)
    } else {
        mean(&macd_line)
    };
    (line, signal, line - signal)
}

// ============================================================================
// Bollinger bands
// ============================================================================

/// (upper, middle, lower, width). On warmup the bands collapse to the
/// last close with zero width.
pub fn bollinger(closes: &[f64], period: usize, k: f64) -> (f64, f64, f64, f64) {
    let last = closes.last().copied().unwrap_or(0.0);
    if period == 0 || closes.len() < period {
        return (last, last, last, 0.0);
    }
    let window = &closes[closes.len() - period..];
    let middle = mean(window);
    let variance = window.iter().map(|v| (v - middle).powi(2)).sum::<f64>() / period as f64;
    let sigma = variance.sqrt();
    let upper = middle + k * sigma;
    let lower = middle - k * sigma;
    let width = if middle.abs() > f64::EPSILON {
        (upper - lower) / middle
    } else {
        0.0
    };
    (upper, middle, lower, width)
}

// ============================================================================
// ATR
// ============================================================================

fn true_ranges(candles: &[Candle]) -> Vec<f64> {
    let mut out = Vec::with_capacity(candles.len());
    for (i, candle) in candles.iter().enumerate() {
        let tr = if i == 0 {
            candle.high - candle.low
        } else {
            let prev_close = candles[i - 1].close;
            (candle.high - candle.low)
                .max((candle.high - prev_close).abs())
                .max((candle.low - prev_close).abs())
        };
        out.push(tr);
    }
    out
}

/// Wilder ATR series; `out[0]` corresponds to candle index `period - 1`.
pub fn atr_series(candles: &[Candle], period: usize) -> Vec<f64> {
    if period == 0 || candles.len() < period {
        return Vec::new();
    }
    let trs = true_ranges(candles);
    let p = period as f64;
    let mut current = mean(&trs[..period]);
    let mut out = Vec::with_capacity(trs.len() - period + 1);
    out.push(current);
    for &tr in &trs[period..] {
        current = (current * (p - 1.0) + tr) / p;
        out.push(current);
    }
    out
}

/// Latest Wilder ATR, 0 on insufficient warmup.
pub fn atr(candles: &[Candle], period: usize) -> f64 {
    atr_series(candles, period).last().copied().unwrap_or(0.0)
}

// ============================================================================
// ADX / DMI
// ============================================================================

/// Wilder ADX with +DI/-DI. TR and DM smoothing is sum-seeded (first value
/// is the sum of the first `period` raw values); the DI ratio cancels the
/// scale. The DX average is mean-seeded so ADX stays on the 0-100 scale.
pub fn adx(candles: &[Candle], period: usize) -> AdxResult {
    if period == 0 || candles.len() < period + 1 {
        return AdxResult::default();
    }
    let mut trs = Vec::with_capacity(candles.len() - 1);
    let mut plus_dm = Vec::with_capacity(candles.len() - 1);
    let mut minus_dm = Vec::with_capacity(candles.len() - 1);
    for pair in candles.windows(2) {
        let (prev, cur) = (&pair[0], &pair[1]);
        let up = cur.high - prev.high;
        let down = prev.low - cur.low;
        plus_dm.push(if up > down && up > 0.0 { up } else { 0.0 });
        minus_dm.push(if down > up && down > 0.0 { down } else { 0.0 });
        let tr = (cur.high - cur.low)
            .max((cur.high - prev.close).abs())
            .max((cur.low - prev.close).abs());
        trs.push(tr);
    }

    let p = period as f64;
    let mut s_tr: f64 = trs[..period].iter().sum();
    let mut s_plus: f64 = plus_dm[..period].iter().sum();
    let mut s_minus: f64 = minus_dm[..period].iter().sum();
    let di = |dm: f64, tr: f64| if tr > f64::EPSILON { 100.0 * dm / tr } else { 0.0 };
    let dx_of = |pdi: f64, mdi: f64| {
        let den = pdi + mdi;
        if den > f64::EPSILON {
            100.0 * (pdi - mdi).abs() / den
        } else {
            0.0
        }
    };

    let mut dx_values = Vec::with_capacity(trs.len() - period + 1);
    let mut plus_di = di(s_plus, s_tr);
    let mut minus_di = di(s_minus, s_tr);
    dx_values.push(dx_of(plus_di, minus_di));
    for i in period..trs.len() {
        s_tr = s_tr * (p - 1.0) / p + trs[i] / p;
        s_plus = s_plus * (p - 1.0) / p + plus_dm[i] / p;
        s_minus = s_minus * (p - 1.0) / p + minus_dm[i] / p;
        plus_di = di(s_plus, s_tr);
        minus_di = di(s_minus, s_tr);
        dx_values.push(dx_of(plus_di, minus_di));
    }

    let adx = if dx_values.len() < period {
        mean(&dx_values)
    } else {
        let mut current = mean(&dx_values[..period]);
        for &dx in &dx_values[period..] {
            current = (current * (p - 1.0) + dx) / p;
        }
        current
    };

    AdxResult {
        adx,
        plus_di,
        minus_di,
    }
}

// ============================================================================
// Snapshot
// ============================================================================

impl IndicatorSnapshot {
    /// Computes the full digest for the latest bar of a series.
    pub fn compute(candles: &[Candle]) -> IndicatorSnapshot {
        if candles.is_empty() {
            return IndicatorSnapshot::default();
        }
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let volumes: Vec<f64> = candles.iter().map(|c| c.volume).collect();
        let close = *closes.last().unwrap_or(&0.0);

        let adx_result = adx(candles, DEFAULT_PERIOD);
        let rsi14 = rsi(&closes, DEFAULT_PERIOD);
        let ema20 = ema(&closes, 20);
        let ema50 = ema(&closes, 50);
        let (macd_line, macd_signal, macd_hist) = macd(&closes);
        let (bb_upper, bb_middle, bb_lower, bb_width) = bollinger(&closes, BB_PERIOD, BB_K);
        let (stoch_rsi_k, stoch_rsi_d) = stoch_rsi(&closes, DEFAULT_PERIOD);
        let atrs = atr_series(candles, DEFAULT_PERIOD);
        let atr14 = atrs.last().copied().unwrap_or(0.0);
        let atr_sma20 = mean_tail(&atrs, 20);
        let atr_pct = if close > 0.0 { atr14 / close * 100.0 } else { 0.0 };

        let trend = if ema20 > ema50 && close > ema20 {
            TrendDirection::Bullish
        } else if ema20 < ema50 && close < ema20 {
            TrendDirection::Bearish
        } else {
            TrendDirection::Neutral
        };

        IndicatorSnapshot {
            adx: adx_result.adx,
            plus_di: adx_result.plus_di,
            minus_di: adx_result.minus_di,
            rsi: rsi14,
            ema20,
            ema50,
            macd_line,
            macd_signal,
            macd_hist,
            atr14,
            atr_pct,
            atr_sma20,
            bb_upper,
            bb_middle,
            bb_lower,
            bb_width,
            stoch_rsi_k,
            stoch_rsi_d,
            trend,
            strength: TrendStrength::from_adx(adx_result.adx),
            close,
            volume: *volumes.last().unwrap_or(&0.0),
            volume_ma20: mean_tail(&volumes, 20),
        }
    }

    pub fn atr_band(&self) -> AtrBand {
        AtrBand::from_pct(self.atr_pct)
    }

    /// Volume over its 20-bar mean; 1.0 when there is no history.
    pub fn volume_ratio(&self) -> f64 {
        if self.volume_ma20 > 0.0 {
            self.volume / self.volume_ma20
        } else {
            1.0
        }
    }

    pub fn is_finite(&self) -> bool {
        [
            self.adx,
            self.plus_di,
            self.minus_di,
            self.rsi,
            self.ema20,
            self.ema50,
            self.macd_line,
            self.macd_signal,
            self.macd_hist,
            self.atr14,
            self.atr_pct,
            self.atr_sma20,
            self.bb_upper,
            self.bb_middle,
            self.bb_lower,
            self.bb_width,
            self.stoch_rsi_k,
            self.stoch_rsi_d,
            self.close,
            self.volume,
            self.volume_ma20,
        ]
        .iter()
        .all(|v| v.is_finite())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_candles(n: usize, price: f64) -> Vec<Candle> {
        (0..n)
            .map(|i| Candle {
                ts_open_ms: i as u64 * 3_600_000,
                open: price,
                high: price,
                low: price,
                close: price,
                volume: 10.0,
            })
            .collect()
    }

    fn ramp_candles(n: usize, start: f64, step: f64) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let close = start + step * i as f64;
                Candle {
                    ts_open_ms: i as u64 * 3_600_000,
                    open: close - step,
                    high: close + step / 2.0,
                    low: close - step,
                    close,
                    volume: 10.0 + i as f64,
                }
            })
            .collect()
    }

    #[test]
    fn test_flat_series_is_neutral() {
        let candles = flat_candles(60, 100.0);
        let snap = IndicatorSnapshot::compute(&candles);
        assert_eq!(snap.adx, 0.0);
        assert_eq!(snap.strength, TrendStrength::Weak);
        assert_eq!(snap.rsi, 50.0);
        assert_eq!(snap.bb_width, 0.0);
        assert_eq!(snap.trend, TrendDirection::Neutral);
        assert!(snap.is_finite());
    }

    #[test]
    fn test_flat_fourteen_candles_adx_zero() {
        let candles = flat_candles(14, 100.0);
        let result = adx(&candles, DEFAULT_PERIOD);
        assert_eq!(result.adx, 0.0);
        assert_eq!(TrendStrength::from_adx(result.adx), TrendStrength::Weak);
    }

    #[test]
    fn test_warmup_yields_neutral_values() {
        let candles = ramp_candles(3, 100.0, 1.0);
        let snap = IndicatorSnapshot::compute(&candles);
        assert_eq!(snap.rsi, 50.0);
        assert_eq!(snap.adx, 0.0);
        assert_eq!(snap.macd_line, 0.0);
        assert_eq!(snap.stoch_rsi_k, 50.0);
        assert!(snap.is_finite());
    }

    #[test]
    fn test_rsi_saturates_on_pure_uptrend() {
        let closes: Vec<f64> = (0..30).map(|i| 100.0 + i as f64).collect();
        let value = rsi(&closes, DEFAULT_PERIOD);
        assert!(value > 99.0 && value <= 100.0);
    }

    #[test]
    fn test_ema_of_constant_series_is_constant() {
        let closes = vec![42.0; 40];
        assert!((ema(&closes, 20) - 42.0).abs() < 1e-12);
    }

    #[test]
    fn test_atr_constant_true_range() {
        // Every bar spans exactly 2.0 with close at the midpoint.
        let candles: Vec<Candle> = (0..30)
            .map(|i| Candle {
                ts_open_ms: i as u64,
                open: 100.0,
                high: 101.0,
                low: 99.0,
                close: 100.0,
                volume: 1.0,
            })
            .collect();
        assert!((atr(&candles, DEFAULT_PERIOD) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_adx_strong_uptrend() {
        let candles = ramp_candles(80, 100.0, 2.0);
        let result = adx(&candles, DEFAULT_PERIOD);
        assert!(result.plus_di > result.minus_di);
        assert!(result.adx > 25.0);
        assert!(result.adx <= 100.0);
    }

    #[test]
    fn test_snapshot_uptrend_is_bullish() {
        let candles = ramp_candles(80, 100.0, 1.0);
        let snap = IndicatorSnapshot::compute(&candles);
        assert_eq!(snap.trend, TrendDirection::Bullish);
        assert_eq!(snap.strength, TrendStrength::Strong);
        assert!(snap.ema20 > snap.ema50);
        assert!(snap.is_finite());
    }

    #[test]
    fn test_bollinger_brackets_the_mean() {
        let closes: Vec<f64> = (0..40).map(|i| 100.0 + (i % 5) as f64).collect();
        let (upper, middle, lower, width) = bollinger(&closes, BB_PERIOD, BB_K);
        assert!(lower < middle && middle < upper);
        assert!(width > 0.0);
    }

    #[test]
    fn test_atr_band_classification() {
        assert_eq!(AtrBand::from_pct(3.2), AtrBand::High);
        assert_eq!(AtrBand::from_pct(2.0), AtrBand::Medium);
        assert_eq!(AtrBand::from_pct(0.4), AtrBand::Low);
    }
}
