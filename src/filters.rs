//! Signal-quality filters (spec.md §4.E): the "barb wire" chop detector, the
//! 20-gap overextension rule, spread/cooldown gating, and the measuring-gap /
//! breakout-mode trackers that feed the measured-move target and the TTR
//! breakout-preference rule.

use crate::constants::{
    BARB_WIRE_MAX_BODY_RATIO, BARB_WIRE_MIN_BARS, BARB_WIRE_OVERLAP_MIN, BREAKOUT_MODE_HOLD_BARS,
    CLOSE_POSITION_PCT, CONSOLIDATION_BARS, CONSOLIDATION_RANGE_ATR, GAP20_OVEREXTEND_BARS,
    GAP20_SIDE_ATR_MULT, MAX_SPREAD_MULT, MEASURING_GAP_LOOKBACK, MEASURING_GAP_MULT,
    MIN_BODY_RATIO, SIGNAL_COOLDOWN, SIGNAL_PROXIMITY_ATR, SIGNAL_PROXIMITY_RANGE_ATR,
    SPREAD_LOOKBACK, TR_CLOSE_POSITION_PCT, TR_MIN_BODY_RATIO,
};

/// Body-ratio / close-position validation for the bar that triggers a
/// pattern signal. `relaxed` is used inside a tight trading range, where
/// Brooks accepts weaker trend bars than in a trending market.
pub fn signal_bar_valid(open: f64, high: f64, low: f64, close: f64, bullish: bool, relaxed: bool) -> bool {
    let range = high - low;
    if range <= 0.0 {
        return false;
    }
    let body = (close - open).abs();
    let body_ratio = body / range;
    let close_pos = (close - low) / range;

    let (min_body, close_pct) = if relaxed {
        (TR_MIN_BODY_RATIO, TR_CLOSE_POSITION_PCT)
    } else {
        (MIN_BODY_RATIO, CLOSE_POSITION_PCT)
    };

    if body_ratio < min_body {
        return false;
    }
    if bullish {
        close_pos >= 1.0 - close_pct
    } else {
        close_pos <= close_pct
    }
}

/// "Barb wire": a run of small, heavily-overlapping bars — Brooks' signature
/// for a market too choppy to trade breakouts or reversals confidently.
pub fn is_barb_wire(highs: &[f64], lows: &[f64], opens: &[f64], closes: &[f64]) -> bool {
    let n = closes.len();
    if n < BARB_WIRE_MIN_BARS {
        return false;
    }
    let start = n - BARB_WIRE_MIN_BARS;
    let mut small_body = 0usize;
    let mut overlapped = 0usize;
    for i in start..n {
        let range = highs[i] - lows[i];
        if range <= 0.0 {
            continue;
        }
        let body_ratio = (closes[i] - opens[i]).abs() / range;
        if body_ratio <= BARB_WIRE_MAX_BODY_RATIO {
            small_body += 1;
        }
        if i > start {
            let ov_h = highs[i].min(highs[i - 1]);
            let ov_l = lows[i].max(lows[i - 1]);
            if ov_h > ov_l && (ov_h - ov_l) / range >= BARB_WIRE_OVERLAP_MIN {
                overlapped += 1;
            }
        }
    }
    small_body >= BARB_WIRE_MIN_BARS - 1 && overlapped >= BARB_WIRE_MIN_BARS - 2
}

/// The "20-gap" overextension rule: once price has run for
/// `GAP20_OVEREXTEND_BARS` bars without a `CONSOLIDATION_BARS`-bar pause
/// tighter than `CONSOLIDATION_RANGE_ATR`, new with-trend entries in that
/// direction are suppressed until a consolidation resets the counter.
#[derive(Debug, Clone, Default)]
pub struct Gap20Rule {
    bars_since_consolidation: u32,
}

impl Gap20Rule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, highs: &[f64], lows: &[f64], atr: f64) {
        let n = highs.len();
        if n < CONSOLIDATION_BARS as usize || atr <= 0.0 {
            self.bars_since_consolidation += 1;
            return;
        }
        let start = n - CONSOLIDATION_BARS as usize;
        let rh = highs[start..].iter().cloned().fold(f64::MIN, f64::max);
        let rl = lows[start..].iter().cloned().fold(f64::MAX, f64::min);
        if (rh - rl) <= atr * CONSOLIDATION_RANGE_ATR {
            self.bars_since_consolidation = 0;
        } else {
            self.bars_since_consolidation += 1;
        }
    }

    /// `true` when the directional move is overextended and the side-gap
    /// buffer beyond the last swing hasn't been respected either.
    pub fn is_overextended(&self, distance_from_origin_atr: f64) -> bool {
        self.bars_since_consolidation >= GAP20_OVEREXTEND_BARS
            && distance_from_origin_atr > GAP20_SIDE_ATR_MULT * GAP20_OVEREXTEND_BARS as f64
    }
}

/// Rejects entries when the live spread is abnormally wide relative to its
/// own rolling average — avoids paying an inflated effective stop distance.
#[derive(Debug, Clone, Default)]
pub struct SpreadFilter {
    history: Vec<f64>,
}

impl SpreadFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, spread: f64) {
        self.history.push(spread);
        if self.history.len() > SPREAD_LOOKBACK {
            self.history.remove(0);
        }
    }

    pub fn is_acceptable(&self, spread: f64) -> bool {
        if self.history.is_empty() {
            return true;
        }
        let avg = self.history.iter().sum::<f64>() / self.history.len() as f64;
        if avg <= 0.0 {
            return true;
        }
        spread <= avg * MAX_SPREAD_MULT
    }
}

/// Enforces a minimum bar gap, and a minimum price distance, between two
/// signals on the same side — prevents re-firing the same setup tick after
/// tick once a signal has already been evaluated.
#[derive(Debug, Clone, Default)]
pub struct SignalCooldown {
    last_buy_bar: Option<u64>,
    last_buy_price: Option<f64>,
    last_sell_bar: Option<u64>,
    last_sell_price: Option<f64>,
}

impl SignalCooldown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow_buy(&self, bar_index: u64, price: f64, atr: f64, range_atr: f64) -> bool {
        Self::allow(self.last_buy_bar, self.last_buy_price, bar_index, price, atr, range_atr)
    }

    pub fn allow_sell(&self, bar_index: u64, price: f64, atr: f64, range_atr: f64) -> bool {
        Self::allow(self.last_sell_bar, self.last_sell_price, bar_index, price, atr, range_atr)
    }

    fn allow(
        last_bar: Option<u64>,
        last_price: Option<f64>,
        bar_index: u64,
        price: f64,
        atr: f64,
        range_atr: f64,
    ) -> bool {
        match (last_bar, last_price) {
            (Some(lb), Some(lp)) => {
                let bars_ok = bar_index.saturating_sub(lb) >= SIGNAL_COOLDOWN as u64;
                let dist_ok = atr <= 0.0 || (price - lp).abs() >= atr * range_atr;
                bars_ok || dist_ok
            }
            _ => true,
        }
    }

    pub fn record_buy(&mut self, bar_index: u64, price: f64) {
        self.last_buy_bar = Some(bar_index);
        self.last_buy_price = Some(price);
    }

    pub fn record_sell(&mut self, bar_index: u64, price: f64) {
        self.last_sell_bar = Some(bar_index);
        self.last_sell_price = Some(price);
    }
}

pub fn signal_proximity_atr() -> f64 {
    SIGNAL_PROXIMITY_ATR
}

pub fn signal_proximity_range_atr() -> f64 {
    SIGNAL_PROXIMITY_RANGE_ATR
}

/// Detects a "measuring gap": a bar whose range clears the recent lookback
/// by a wide margin, marking the midpoint of an impulse leg for the
/// measured-move take-profit projection.
#[derive(Debug, Clone, Default)]
pub struct MeasuringGapTracker {
    pub active: bool,
    pub origin_price: f64,
    pub leg_start_price: f64,
}

impl MeasuringGapTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, highs: &[f64], lows: &[f64], closes: &[f64], atr: f64) {
        let n = closes.len();
        if n < MEASURING_GAP_LOOKBACK + 1 || atr <= 0.0 {
            return;
        }
        let start = n - MEASURING_GAP_LOOKBACK - 1;
        let mut max_prior_range = 0.0f64;
        for i in start..n - 1 {
            max_prior_range = max_prior_range.max(highs[i] - lows[i]);
        }
        let last_range = highs[n - 1] - lows[n - 1];
        if max_prior_range > 0.0 && last_range >= max_prior_range * MEASURING_GAP_MULT {
            self.active = true;
            self.leg_start_price = closes[start];
            self.origin_price = closes[n - 1];
        }
    }

    pub fn reset(&mut self) {
        self.active = false;
        self.origin_price = 0.0;
        self.leg_start_price = 0.0;
    }
}

/// Holds "breakout mode" active for a fixed number of bars after a Breakout
/// market state is first detected, during which the TTR breakout-preference
/// rule (spec.md §4.J step 3) stays in effect even if the state classifier
/// has since relocked to something else.
#[derive(Debug, Clone, Default)]
pub struct BreakoutModeTracker {
    bars_remaining: u32,
}

impl BreakoutModeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&mut self) {
        self.bars_remaining = BREAKOUT_MODE_HOLD_BARS;
    }

    pub fn tick(&mut self) {
        if self.bars_remaining > 0 {
            self.bars_remaining -= 1;
        }
    }

    pub fn is_active(&self) -> bool {
        self.bars_remaining > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_bar_requires_minimum_body() {
        assert!(!signal_bar_valid(10.0, 10.1, 9.9, 10.05, true, false));
    }

    #[test]
    fn signal_bar_bullish_trend_bar_passes() {
        assert!(signal_bar_valid(10.0, 11.0, 9.9, 10.95, true, false));
    }

    #[test]
    fn relaxed_mode_accepts_weaker_bar() {
        assert!(signal_bar_valid(10.0, 10.6, 9.9, 10.35, true, true));
    }

    #[test]
    fn barb_wire_detects_choppy_overlap() {
        let highs = vec![10.2, 10.3, 10.2, 10.3, 10.2, 10.3];
        let lows = vec![9.9, 10.0, 9.9, 10.0, 9.9, 10.0];
        let opens = vec![10.05, 10.1, 10.05, 10.1, 10.05, 10.1];
        let closes = vec![10.1, 10.15, 10.1, 10.15, 10.1, 10.15];
        assert!(is_barb_wire(&highs, &lows, &opens, &closes));
    }

    #[test]
    fn spread_filter_rejects_outlier() {
        let mut f = SpreadFilter::new();
        for _ in 0..10 {
            f.push(0.5);
        }
        assert!(f.is_acceptable(0.6));
        assert!(!f.is_acceptable(5.0));
    }

    #[test]
    fn cooldown_blocks_immediate_refire() {
        let mut cd = SignalCooldown::new();
        cd.record_buy(100, 50.0);
        assert!(!cd.allow_buy(101, 50.05, 1.0, SIGNAL_PROXIMITY_RANGE_ATR));
        assert!(cd.allow_buy(100 + SIGNAL_COOLDOWN as u64, 50.05, 1.0, SIGNAL_PROXIMITY_RANGE_ATR));
    }
}
