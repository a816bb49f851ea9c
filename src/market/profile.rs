use crate::market::candles::Candle;

const BIN_COUNT: usize = 24;
const VALUE_AREA_FRACTION: f64 = 0.70;
/// Price within this fraction of the POC counts as a pullback touch.
const POC_BAND: f64 = 0.003;

/// Volume-at-price structure built from a candle series. Each candle's
/// volume is assigned to the bin holding its typical price.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VolumeProfile {
    /// Price level with the most traded volume.
    pub poc: f64,
    /// Upper and lower bounds of the 70% value area.
    pub vah: f64,
    pub val: f64,
    pub vwap: f64,
    pub total_volume: f64,
}

impl VolumeProfile {
    pub fn from_candles(candles: &[Candle]) -> Option<VolumeProfile> {
        let mut low = f64::MAX;
        let mut high = f64::MIN;
        let mut total_volume = 0.0;
        let mut weighted = 0.0;
        for candle in candles {
            if candle.volume <= 0.0 || !candle.volume.is_finite() {
                continue;
            }
            low = low.min(candle.low);
            high = high.max(candle.high);
            let typical = (candle.high + candle.low + candle.close) / 3.0;
            weighted += typical * candle.volume;
            total_volume += candle.volume;
        }
        if total_volume <= 0.0 || !low.is_finite() || !high.is_finite() {
            return None;
        }
        let vwap = weighted / total_volume;
        if high <= low {
            // Degenerate range: everything traded at one price.
            return Some(VolumeProfile {
                poc: low,
                vah: low,
                val: low,
                vwap,
                total_volume,
            });
        }

        let bin_width = (high - low) / BIN_COUNT as f64;
        let mut bins = [0.0f64; BIN_COUNT];
        for candle in candles {
            if candle.volume <= 0.0 || !candle.volume.is_finite() {
                continue;
            }
            let typical = (candle.high + candle.low + candle.close) / 3.0;
            let idx = (((typical - low) / bin_width) as usize).min(BIN_COUNT - 1);
            bins[idx] += candle.volume;
        }

        let poc_idx = bins
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(i, _)| i)
            .unwrap_or(0);

        // Expand around the POC bin, taking the heavier neighbor, until the
        // value area holds the target share of volume.
        let target = VALUE_AREA_FRACTION * total_volume;
        let mut covered = bins[poc_idx];
        let mut lo_idx = poc_idx;
        let mut hi_idx = poc_idx;
        while covered < target {
            let below = lo_idx.checked_sub(1).map(|i| bins[i]);
            let above = (hi_idx + 1 < BIN_COUNT).then(|| bins[hi_idx + 1]);
            match (below, above) {
                (Some(b), Some(a)) if b >= a => {
                    lo_idx -= 1;
                    covered += b;
                }
                (_, Some(a)) => {
                    hi_idx += 1;
                    covered += a;
                }
                (Some(b), None) => {
                    lo_idx -= 1;
                    covered += b;
                }
                (None, None) => break,
            }
        }

        let center = |i: usize| low + (i as f64 + 0.5) * bin_width;
        Some(VolumeProfile {
            poc: center(poc_idx),
            vah: center(hi_idx),
            val: center(lo_idx),
            vwap,
            total_volume,
        })
    }

    pub fn pullback_to_poc(&self, price: f64) -> bool {
        self.poc > 0.0 && ((price - self.poc).abs() / self.poc) <= POC_BAND
    }

    pub fn in_value_area(&self, price: f64) -> bool {
        price >= self.val && price <= self.vah
    }
}
