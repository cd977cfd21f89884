//! Brooks "push" (H/L) counter (spec.md §4.C).
//!
//! Increments `h_count`/`l_count` when a new extremum clears the prior
//! confirmed swing by a sufficiently deep pullback, and resets on structure
//! breaks, significant new extremes, or a strong opposite reversal bar.

use crate::constants::{HL_MIN_PULLBACK_ATR, HL_RESET_NEW_EXTREME_ATR, HL_STRONG_REVERSAL_RANGE_ATR};
use crate::swing_tracker::SwingTracker;

#[derive(Debug, Clone, Default)]
pub struct HlCounter {
    pub h_count: u32,
    h_last_swing_high: f64,

    pub l_count: u32,
    l_last_swing_low: f64,
}

impl HlCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// `highs`/`lows`/`opens`/`closes` are the closed-bar history (oldest
    /// first); the signal bar referenced by the push rule is the most
    /// recently closed bar.
    pub fn update(
        &mut self,
        highs: &[f64],
        lows: &[f64],
        opens: &[f64],
        closes: &[f64],
        atr: f64,
        swings: &SwingTracker,
    ) {
        if highs.len() < 4 || atr <= 0.0 {
            return;
        }

        let sh1 = swings.cached_sh1();
        let sh2 = swings.cached_sh2();
        let sl1 = swings.cached_sl1();
        let sl2 = swings.cached_sl2();

        let reset_extreme = atr * HL_RESET_NEW_EXTREME_ATR;
        let min_pullback = atr * HL_MIN_PULLBACK_ATR;

        let n = highs.len();
        let h1 = highs[n - 1];
        let l1 = lows[n - 1];
        let o1 = opens[n - 1];
        let c1 = closes[n - 1];
        let rng = h1 - l1;
        let rng_safe = rng.max(1e-10);

        let strong_rev_down = rng > atr * HL_STRONG_REVERSAL_RANGE_ATR
            && c1 < o1
            && (h1 - c1) / rng_safe < 0.3;
        let strong_rev_up = rng > atr * HL_STRONG_REVERSAL_RANGE_ATR
            && c1 > o1
            && (c1 - l1) / rng_safe < 0.3;

        // H count.
        if sh1 > 0.0 && sh2 > 0.0 && sl1 > 0.0 {
            if h1 > sh1 && sl1 < sh2 && self.h_last_swing_high < sh1 {
                let pullback_depth = sh2 - sl1;
                if pullback_depth >= min_pullback {
                    self.h_count += 1;
                    self.h_last_swing_high = sh1;
                }
            }

            if sl1 > 0.0 && sl2 > 0.0 && l1 < sl1 && sl1 < sl2 {
                self.reset_h();
            } else if sl1 > 0.0 && l1 < sl1 - reset_extreme {
                self.reset_h();
            } else if strong_rev_down {
                self.reset_h();
            }
        }

        // L count.
        if sl1 > 0.0 && sl2 > 0.0 && sh1 > 0.0 {
            if l1 < sl1 && sh1 > sl2 && (self.l_last_swing_low == 0.0 || sl1 < self.l_last_swing_low) {
                let bounce_depth = sh1 - sl2;
                if bounce_depth >= min_pullback {
                    self.l_count += 1;
                    self.l_last_swing_low = sl1;
                }
            }

            if sh1 > 0.0 && sh2 > 0.0 && h1 > sh1 && sh1 > sh2 {
                self.reset_l();
            } else if sh1 > 0.0 && h1 > sh1 + reset_extreme {
                self.reset_l();
            } else if strong_rev_up {
                self.reset_l();
            }
        }
    }

    fn reset_h(&mut self) {
        self.h_count = 0;
        self.h_last_swing_high = 0.0;
    }

    fn reset_l(&mut self) {
        self.l_count = 0;
        self.l_last_swing_low = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_swings_is_noop() {
        let mut hl = HlCounter::new();
        let swings = SwingTracker::new();
        hl.update(&[1.0, 2.0, 3.0, 4.0], &[0.0, 1.0, 2.0, 3.0], &[0.0; 4], &[0.0; 4], 1.0, &swings);
        assert_eq!(hl.h_count, 0);
        assert_eq!(hl.l_count, 0);
    }

    #[test]
    fn zero_atr_is_noop() {
        let mut hl = HlCounter::new();
        let swings = SwingTracker::new();
        hl.update(&[1.0, 2.0, 3.0, 4.0], &[0.0, 1.0, 2.0, 3.0], &[0.0; 4], &[0.0; 4], 0.0, &swings);
        assert_eq!(hl.h_count, 0);
    }
}
