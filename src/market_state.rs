//! Market-state classifier with hysteresis, and the companion Always-In
//! bias (spec.md §4.D).

use crate::constants::{
    state_min_hold, AlwaysIn, MarketState, BREAKOUT_BODY_MULT, FINAL_FLAG_MAX_BARS_AFTER_CHANNEL,
    FINAL_FLAG_MIN_ATR_ON_SIDE, FINAL_FLAG_MIN_BARS_AFTER_CHANNEL, STRONG_TREND_SCORE_MIN,
    TIGHT_CHANNEL_NEW_EXTREME_RATIO, TIGHT_CHANNEL_SAME_DIR_RATIO,
    TIGHT_CHANNEL_SHALLOW_PULLBACK_RATIO, TRADING_RANGE_MIN_ATR_WIDTH,
    TRADING_RANGE_MIN_EMA_CROSSES, TRADING_RANGE_MIN_TOUCHES, TTR_LOOKBACK, TTR_MAX_OVERLAP_RATIO,
    TTR_MAX_RANGE_ATR,
};
use crate::swing_tracker::SwingTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TightChannelDir {
    None,
    Up,
    Down,
}

#[derive(Debug, Clone)]
pub struct MarketStateTracker {
    pub state: MarketState,
    pub always_in: AlwaysIn,

    pub trend_direction: Option<bool>, // Some(true)=up, Some(false)=down, None=""
    pub trend_strength: f64,

    pub tight_channel_dir: TightChannelDir,
    pub tight_channel_bars: u32,
    pub tight_channel_extreme: f64,
    pub last_tight_channel_end_bar: i64,

    pub tr_high: f64,
    pub tr_low: f64,

    locked_state: MarketState,
    hold_bars: u32,
}

impl Default for MarketStateTracker {
    fn default() -> Self {
        Self {
            state: MarketState::Channel,
            always_in: AlwaysIn::Neutral,
            trend_direction: None,
            trend_strength: 0.0,
            tight_channel_dir: TightChannelDir::None,
            tight_channel_bars: 0,
            tight_channel_extreme: 0.0,
            last_tight_channel_end_bar: -1,
            tr_high: 0.0,
            tr_low: 0.0,
            locked_state: MarketState::Channel,
            hold_bars: 0,
        }
    }
}

impl MarketStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    #[allow(clippy::too_many_arguments)]
    pub fn update(
        &mut self,
        highs: &[f64],
        lows: &[f64],
        opens: &[f64],
        closes: &[f64],
        ema: &[f64],
        atr: f64,
        swings: &SwingTracker,
    ) {
        let n = closes.len();
        if n < 12 || atr <= 0.0 {
            return;
        }

        let mut detected = MarketState::Channel;

        if self.detect_strong_trend(highs, lows, opens, closes, ema, atr, n) {
            detected = MarketState::StrongTrend;
        } else if self.detect_tight_channel(highs, lows, opens, closes, atr, n) {
            detected = MarketState::TightChannel;
            self.tight_channel_bars += 1;
            self.update_tight_channel_tracking(highs, lows);
        } else if self.detect_final_flag(closes, ema, atr) {
            detected = MarketState::FinalFlag;
            if self.tight_channel_bars > 0 {
                self.last_tight_channel_end_bar = 1;
            }
        } else if self.detect_trading_range(highs, lows, closes, ema, atr, n) {
            detected = MarketState::TradingRange;
            if self.tight_channel_bars > 0 {
                self.last_tight_channel_end_bar = 1;
            }
            self.tight_channel_bars = 0;
        } else if self.detect_breakout(highs, lows, opens, closes, ema, atr, n) {
            detected = MarketState::Breakout;
        } else {
            if self.tight_channel_bars > 0 {
                self.last_tight_channel_end_bar = 1;
            }
            self.tight_channel_bars = 0;
        }

        self.apply_inertia(detected);
        self.update_always_in(highs, lows, opens, closes, ema, atr, n, swings);
    }

    // ------------------------------------------------------------------
    // Detectors — all index against the closed-bar history with the most
    // recent closed bar at index n-1 (the "signal bar" for this update).
    // ------------------------------------------------------------------

    fn detect_strong_trend(
        &mut self,
        h: &[f64],
        l: &[f64],
        o: &[f64],
        c: &[f64],
        e: &[f64],
        atr: f64,
        n: usize,
    ) -> bool {
        let lookback = 10usize.min(n.saturating_sub(1));
        let (mut bull_streak, mut bear_streak) = (0u32, 0u32);
        let (mut cur_bull, mut cur_bear) = (0u32, 0u32);
        let (mut hh, mut ll) = (0u32, 0u32);
        let (mut above, mut below) = (0u32, 0u32);

        for i in 1..=lookback {
            let idx = n - i; // 1-based back from the end
            if idx == 0 || idx > n {
                break;
            }
            let idx = idx - 1;
            let is_bull = c[idx] > o[idx];
            let is_bear = c[idx] < o[idx];
            if is_bull {
                cur_bull += 1;
                cur_bear = 0;
            } else if is_bear {
                cur_bear += 1;
                cur_bull = 0;
            }
            bull_streak = bull_streak.max(cur_bull);
            bear_streak = bear_streak.max(cur_bear);

            if idx >= 1 {
                let idx2 = idx - 1;
                if h[idx] > h[idx2] {
                    hh += 1;
                }
                if l[idx] < l[idx2] {
                    ll += 1;
                }
            }
            if idx < e.len() {
                if c[idx] > e[idx] {
                    above += 1;
                } else {
                    below += 1;
                }
            }
        }

        let (mut up, mut down) = (0.0, 0.0);
        if bull_streak >= 3 {
            up += 0.25;
        }
        if bull_streak >= 5 {
            up += 0.25;
        }
        if hh >= 4 {
            up += 0.2;
        }
        if above >= 8 {
            up += 0.15;
        }
        if bear_streak >= 3 {
            down += 0.25;
        }
        if bear_streak >= 5 {
            down += 0.25;
        }
        if ll >= 4 {
            down += 0.2;
        }
        if below >= 8 {
            down += 0.15;
        }

        let dist = if atr > 0.0 && n >= 1 && (n - 1) < e.len() {
            (c[n - 1] - e[n - 1]) / atr
        } else {
            0.0
        };
        if dist > 1.0 {
            up += 0.15;
        }
        if dist < -1.0 {
            down += 0.15;
        }

        if up >= STRONG_TREND_SCORE_MIN && up > down {
            self.trend_direction = Some(true);
            self.trend_strength = up;
            return true;
        }
        if down >= STRONG_TREND_SCORE_MIN && down > up {
            self.trend_direction = Some(false);
            self.trend_strength = down;
            return true;
        }
        self.trend_direction = None;
        self.trend_strength = up.max(down);
        false
    }

    fn detect_tight_channel(
        &mut self,
        h: &[f64],
        l: &[f64],
        o: &[f64],
        c: &[f64],
        atr: f64,
        n: usize,
    ) -> bool {
        if n < 15 || atr <= 0.0 {
            return false;
        }
        let lookback = 12usize.min(n.saturating_sub(2));
        let (mut bull, mut bear) = (0u32, 0u32);
        let (mut new_highs, mut new_lows) = (0u32, 0u32);
        let mut shallow = 0u32;

        for i in 1..=lookback {
            if i + 1 > n {
                break;
            }
            let idx = n - 1 - i;
            let idx2 = idx.wrapping_sub(1);
            if idx == 0 {
                break;
            }
            let idx2 = idx - 1;
            if c[idx] > o[idx] {
                bull += 1;
            } else if c[idx] < o[idx] {
                bear += 1;
            }
            if h[idx] > h[idx2] {
                new_highs += 1;
            }
            if l[idx] < l[idx2] {
                new_lows += 1;
            }
            let prev_range = h[idx2] - l[idx2];
            if prev_range > 0.0 {
                if l[idx] >= l[idx2] + prev_range * 0.75 {
                    shallow += 1;
                }
                if h[idx] <= h[idx2] - prev_range * 0.75 {
                    shallow += 1;
                }
            }
        }

        let lb = lookback as f64;
        if bull as f64 >= lb * TIGHT_CHANNEL_SAME_DIR_RATIO
            && new_highs as f64 >= lb * TIGHT_CHANNEL_NEW_EXTREME_RATIO
            && shallow as f64 >= lb * TIGHT_CHANNEL_SHALLOW_PULLBACK_RATIO
        {
            self.tight_channel_dir = TightChannelDir::Up;
            return true;
        }
        if bear as f64 >= lb * TIGHT_CHANNEL_SAME_DIR_RATIO
            && new_lows as f64 >= lb * TIGHT_CHANNEL_NEW_EXTREME_RATIO
            && shallow as f64 >= lb * TIGHT_CHANNEL_SHALLOW_PULLBACK_RATIO
        {
            self.tight_channel_dir = TightChannelDir::Down;
            return true;
        }
        self.tight_channel_dir = TightChannelDir::None;
        false
    }

    fn detect_trading_range(
        &mut self,
        h: &[f64],
        l: &[f64],
        c: &[f64],
        e: &[f64],
        atr: f64,
        n: usize,
    ) -> bool {
        if n < 25 || atr <= 0.0 {
            return false;
        }
        let lookback = TRADING_RANGE_MIN_ATR_WIDTH as usize; // placeholder unused
        let _ = lookback;
        let lookback = 20usize;
        let mut rh = h[n - 1];
        let mut rl = l[n - 1];
        for i in 2..=lookback.min(n - 1) {
            let idx = n - 1 - i;
            rh = rh.max(h[idx]);
            rl = rl.min(l[idx]);
        }
        let total = rh - rl;
        if total < atr * TRADING_RANGE_MIN_ATR_WIDTH {
            return false;
        }
        let upper = rh - total * 0.2;
        let lower = rl + total * 0.2;
        let (mut touch_h, mut touch_l) = (0u32, 0u32);
        let mut crosses = 0u32;

        let first_idx = n.saturating_sub(lookback + 1);
        let mut prev_above = if n > lookback {
            c[first_idx] > e[first_idx]
        } else {
            true
        };
        for i in 1..=lookback.min(n - 1) {
            let idx = n - 1 - i;
            if h[idx] >= upper {
                touch_h += 1;
            }
            if l[idx] <= lower {
                touch_l += 1;
            }
            let cur_above = c[idx] > e[idx];
            if cur_above != prev_above {
                crosses += 1;
                prev_above = cur_above;
            }
        }

        if touch_h >= TRADING_RANGE_MIN_TOUCHES
            && touch_l >= TRADING_RANGE_MIN_TOUCHES
            && crosses >= TRADING_RANGE_MIN_EMA_CROSSES
        {
            self.tr_high = rh;
            self.tr_low = rl;
            return true;
        }
        false
    }

    fn detect_breakout(
        &mut self,
        h: &[f64],
        l: &[f64],
        o: &[f64],
        c: &[f64],
        e: &[f64],
        atr: f64,
        n: usize,
    ) -> bool {
        if n < 12 || atr <= 0.0 {
            return false;
        }
        let last = n - 1;
        let body = (c[last] - o[last]).abs();
        let rng = h[last] - l[last];
        if rng <= 0.0 {
            return false;
        }
        let mut avg_body = 0.0;
        let mut cnt = 0u32;
        for i in 2..12usize.min(n) {
            if i > last {
                break;
            }
            avg_body += (c[last - i] - o[last - i]).abs();
            cnt += 1;
        }
        if cnt > 0 {
            avg_body /= cnt as f64;
        }
        if avg_body > 0.0 && body > avg_body * BREAKOUT_BODY_MULT {
            let close = c[last];
            if close > e[last] && (close - l[last]) / rng > 0.7 {
                return true;
            }
            if close < e[last] && (h[last] - close) / rng > 0.7 {
                return true;
            }
        }
        false
    }

    fn detect_final_flag(&mut self, c: &[f64], e: &[f64], atr: f64) -> bool {
        if self.tight_channel_bars < 5 || self.last_tight_channel_end_bar < 0 {
            return false;
        }
        let bars_since = self.last_tight_channel_end_bar;
        if bars_since < FINAL_FLAG_MIN_BARS_AFTER_CHANNEL as i64
            || bars_since > FINAL_FLAG_MAX_BARS_AFTER_CHANNEL as i64
        {
            return false;
        }
        if atr <= 0.0 || c.is_empty() {
            return false;
        }
        let last = c.len() - 1;
        let dist = (c[last] - e[last]) / atr;
        match self.tight_channel_dir {
            TightChannelDir::Up => dist >= FINAL_FLAG_MIN_ATR_ON_SIDE,
            TightChannelDir::Down => dist <= -FINAL_FLAG_MIN_ATR_ON_SIDE,
            TightChannelDir::None => false,
        }
    }

    fn update_tight_channel_tracking(&mut self, h: &[f64], l: &[f64]) {
        let last = h.len() - 1;
        match self.tight_channel_dir {
            TightChannelDir::Up => {
                if self.tight_channel_extreme == 0.0 || h[last] > self.tight_channel_extreme {
                    self.tight_channel_extreme = h[last];
                }
            }
            TightChannelDir::Down => {
                if self.tight_channel_extreme == 0.0 || l[last] < self.tight_channel_extreme {
                    self.tight_channel_extreme = l[last];
                }
            }
            TightChannelDir::None => {}
        }
    }

    fn apply_inertia(&mut self, new: MarketState) {
        if self.hold_bars > 0 {
            self.hold_bars -= 1;
            self.state = self.locked_state;
            return;
        }
        if new != self.locked_state {
            let min_hold = state_min_hold(self.locked_state);
            self.locked_state = new;
            self.hold_bars = min_hold;
        }
        self.state = new;
    }

    /// Tight trading range: TradingRange, narrow relative to ATR, and low
    /// bar-overlap (prefers breakouts over reversals — spec.md §4.J step 3).
    pub fn is_ttr(&self, highs: &[f64], lows: &[f64], atr: f64) -> bool {
        if self.state != MarketState::TradingRange || atr <= 0.0 {
            return false;
        }
        if self.tr_high <= self.tr_low {
            return false;
        }
        let tr_range = self.tr_high - self.tr_low;
        if tr_range >= atr * TTR_MAX_RANGE_ATR {
            return false;
        }
        let overlap = bar_overlap_ratio(highs, lows, TTR_LOOKBACK);
        overlap < TTR_MAX_OVERLAP_RATIO
    }

    #[allow(clippy::too_many_arguments)]
    fn update_always_in(
        &mut self,
        h: &[f64],
        l: &[f64],
        o: &[f64],
        c: &[f64],
        e: &[f64],
        atr: f64,
        n: usize,
        swings: &SwingTracker,
    ) {
        if n < 20 || atr <= 0.0 {
            self.always_in = AlwaysIn::Neutral;
            return;
        }
        let last = n - 1;
        let body1 = c[last] - o[last];
        let rng1 = h[last] - l[last];
        let close_pos = if rng1 > 0.0 {
            (c[last] - l[last]) / rng1
        } else {
            0.5
        };
        let body_ratio = if rng1 > 0.0 { body1.abs() / rng1 } else { 0.0 };

        if n >= 4 {
            let prev = last - 1;
            let b1 = c[last] - o[last];
            let b2 = c[prev] - o[prev];
            let r1 = h[last] - l[last];
            let r2 = h[prev] - l[prev];
            let e2 = if e.len() > prev { e[prev] } else { e[last] };
            let bull1 = r1 > 0.0 && b1 / r1 > 0.55;
            let bear1 = r1 > 0.0 && b1 / r1 < -0.55;
            let bull2 = r2 > 0.0 && b2 / r2 > 0.55;
            let bear2 = r2 > 0.0 && b2 / r2 < -0.55;
            if bull1 && bull2 && c[last] > e[last] && c[prev] > e2 {
                self.always_in = AlwaysIn::Long;
                return;
            }
            if bear1 && bear2 && c[last] < e[last] && c[prev] < e2 {
                self.always_in = AlwaysIn::Short;
                return;
            }
        }

        if n >= 5 && rng1 > atr * 1.0 {
            let mut avg3 = 0.0;
            for k in 2..5 {
                if last >= k {
                    avg3 += (c[last - k] - o[last - k]).abs();
                }
            }
            avg3 /= 3.0;
            let body_len = body1.abs();
            let break_ema = (body1 > 0.0 && c[last] > e[last]) || (body1 < 0.0 && c[last] < e[last]);
            let sh1 = swings.recent_swing_high(1, false);
            let sl1 = swings.recent_swing_low(1, false);
            let mut break_struct = false;
            if body1 > 0.0 && sh1 > 0.0 && c[last] > sh1 {
                break_struct = true;
            }
            if body1 < 0.0 && sl1 > 0.0 && c[last] < sl1 {
                break_struct = true;
            }
            if avg3 > 0.0 && body_len > avg3 * 2.0 && body_ratio > 0.6 && (break_ema || break_struct) {
                if body1 > 0.0 && close_pos > 0.75 {
                    self.always_in = AlwaysIn::Long;
                    return;
                }
                if body1 < 0.0 && close_pos < 0.25 {
                    self.always_in = AlwaysIn::Short;
                    return;
                }
            }
        }

        if rng1 > atr * 1.2 && body_ratio > 0.65 {
            if body1 > 0.0 && close_pos > 0.75 {
                self.always_in = AlwaysIn::Long;
                return;
            }
            if body1 < 0.0 && close_pos < 0.25 {
                self.always_in = AlwaysIn::Short;
                return;
            }
        }

        let (mut bull_cnt, mut bear_cnt) = (0u32, 0u32);
        let mut overlap_pen = 0u32;
        for i in 1..6usize.min(n) {
            let idx = last + 1 - i;
            if idx == 0 {
                break;
            }
            let idx = idx - 1;
            let body = c[idx] - o[idx];
            let rng = h[idx] - l[idx];
            if rng <= 0.0 {
                continue;
            }
            let br = body.abs() / rng;
            let mut has_ov = false;
            if idx >= 1 {
                let idx2 = idx - 1;
                let ov_h = h[idx].min(h[idx2]);
                let ov_l = l[idx].max(l[idx2]);
                if ov_h > ov_l && (ov_h - ov_l) / rng > 0.6 {
                    has_ov = true;
                }
            }
            if body > 0.0 && br > 0.5 {
                bull_cnt += 1;
                if has_ov {
                    overlap_pen += 1;
                }
            }
            if body < 0.0 && br > 0.5 {
                bear_cnt += 1;
                if has_ov {
                    overlap_pen += 1;
                }
            }
        }

        let (mut hh_cnt, mut hl_cnt, mut lh_cnt, mut ll_cnt) = (0u32, 0u32, 0u32, 0u32);
        // swing history is exposed only via the cached top-2 highs/lows, so
        // we approximate the original's 4-point lookback using those.
        let sh1 = swings.cached_sh1();
        let sh2 = swings.cached_sh2();
        let sl1 = swings.cached_sl1();
        let sl2 = swings.cached_sl2();
        if sh1 > 0.0 && sh2 > 0.0 {
            if sh1 > sh2 {
                hh_cnt += 1;
            } else {
                lh_cnt += 1;
            }
        }
        if sl1 > 0.0 && sl2 > 0.0 {
            if sl1 > sl2 {
                hl_cnt += 1;
            } else {
                ll_cnt += 1;
            }
        }

        let above_ema = c[last] > e[last];
        let (mut bull_score, mut bear_score) = (0.0, 0.0);
        let cw = if overlap_pen >= 2 {
            0.25
        } else if overlap_pen >= 1 {
            0.35
        } else {
            0.4
        };
        if bull_cnt >= 3 {
            bull_score += cw;
        } else if bull_cnt >= 2 {
            bull_score += cw * 0.5;
        }
        if bear_cnt >= 3 {
            bear_score += cw;
        } else if bear_cnt >= 2 {
            bear_score += cw * 0.5;
        }
        if hh_cnt > 0 && hl_cnt > 0 {
            bull_score += 0.30;
        }
        if lh_cnt > 0 && ll_cnt > 0 {
            bear_score += 0.30;
        }
        if above_ema {
            bull_score += 0.12;
        } else {
            bear_score += 0.12;
        }
        if rng1 > atr * 1.5 {
            if body1 > 0.0 {
                bull_score += if body_ratio > 0.7 { 0.35 } else { 0.25 };
            } else {
                bear_score += if body_ratio > 0.7 { 0.35 } else { 0.25 };
            }
        }
        if close_pos > 0.8 {
            bull_score += 0.20;
        }
        if close_pos < 0.2 {
            bear_score += 0.20;
        }

        self.always_in = if bull_score >= 0.5 && bull_score > bear_score + 0.1 {
            AlwaysIn::Long
        } else if bear_score >= 0.5 && bear_score > bull_score + 0.1 {
            AlwaysIn::Short
        } else {
            AlwaysIn::Neutral
        };
    }
}

fn bar_overlap_ratio(highs: &[f64], lows: &[f64], lookback: usize) -> f64 {
    let n = highs.len();
    if n < lookback + 1 {
        return 1.0;
    }
    let last = n - 1;
    let mut rh = highs[last];
    let mut rl = lows[last];
    let mut sum_range = 0.0;
    for i in 1..=lookback.min(n - 1) {
        let idx = last - i;
        rh = rh.max(highs[idx]);
        rl = rl.min(lows[idx]);
        let br = highs[idx] - lows[idx];
        if br > 0.0 {
            sum_range += br;
        }
    }
    let total = rh - rl;
    if sum_range <= 0.0 || total <= 0.0 {
        return 1.0;
    }
    total / sum_range
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_series(n: usize, base: f64) -> (Vec<f64>, Vec<f64>, Vec<f64>, Vec<f64>, Vec<f64>) {
        let o = vec![base; n];
        let c = vec![base; n];
        let h = vec![base + 1.0; n];
        let l = vec![base - 1.0; n];
        let e = vec![base; n];
        (h, l, o, c, e)
    }

    #[test]
    fn short_history_is_noop() {
        let mut t = MarketStateTracker::new();
        let swings = SwingTracker::new();
        let (h, l, o, c, e) = flat_series(5, 100.0);
        t.update(&h, &l, &o, &c, &e, 1.0, &swings);
        assert_eq!(t.state, MarketState::Channel);
    }

    #[test]
    fn zero_atr_is_noop() {
        let mut t = MarketStateTracker::new();
        let swings = SwingTracker::new();
        let (h, l, o, c, e) = flat_series(30, 100.0);
        t.update(&h, &l, &o, &c, &e, 0.0, &swings);
        assert_eq!(t.state, MarketState::Channel);
    }

    #[test]
    fn strong_uptrend_detected() {
        let mut t = MarketStateTracker::new();
        let swings = SwingTracker::new();
        let n = 30;
        let mut o = Vec::with_capacity(n);
        let mut c = Vec::with_capacity(n);
        let mut h = Vec::with_capacity(n);
        let mut l = Vec::with_capacity(n);
        let mut e = Vec::with_capacity(n);
        for i in 0..n {
            let base = 100.0 + i as f64 * 2.0;
            o.push(base);
            c.push(base + 1.8);
            h.push(base + 2.0);
            l.push(base - 0.2);
            e.push(base - 5.0); // price well above EMA
        }
        t.update(&h, &l, &o, &c, &e, 1.0, &swings);
        assert_eq!(t.state, MarketState::StrongTrend);
        assert_eq!(t.trend_direction, Some(true));
    }
}
