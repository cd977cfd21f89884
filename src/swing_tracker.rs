//! Swing-point tracker (spec.md §4.B).
//!
//! Maintains confirmed (depth-3) and temporary (depth-1) pivots over the
//! closed-bar timeline, aging and evicting them each bar, and caches the two
//! most recent highs/lows for O(1) lookup by detectors and the stop-loss
//! rule.

use crate::constants::{SWING_CONFIRMED_DEPTH, SWING_MAX_AGE, SWING_MAX_RETAINED};

#[derive(Debug, Clone, Copy)]
pub struct SwingPoint {
    pub price: f64,
    /// Age in bars since confirmation; 0 on the bar it was added.
    pub age: u32,
    pub is_high: bool,
}

#[derive(Debug, Clone)]
pub struct SwingTracker {
    depth: usize,
    /// Most recent first.
    swings: Vec<SwingPoint>,

    cached_sh1: f64,
    cached_sh2: f64,
    cached_sl1: f64,
    cached_sl2: f64,

    temp_swing_high: f64,
    temp_swing_low: f64,
}

impl Default for SwingTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl SwingTracker {
    pub fn new() -> Self {
        Self {
            depth: SWING_CONFIRMED_DEPTH,
            swings: Vec::new(),
            cached_sh1: 0.0,
            cached_sh2: 0.0,
            cached_sl1: 0.0,
            cached_sl2: 0.0,
            temp_swing_high: 0.0,
            temp_swing_low: 0.0,
        }
    }

    /// Feed the next closed bar's high/low, given the full closed-bar history
    /// (oldest first, including the just-closed bar as the last element).
    pub fn update(&mut self, highs: &[f64], lows: &[f64]) {
        let n = highs.len();
        if n < 4 {
            return;
        }

        for sp in &mut self.swings {
            sp.age += 1;
        }
        self.swings.retain(|sp| sp.age <= SWING_MAX_AGE);

        // Temporary depth-1 pivot: the bar two back from the newest closed
        // bar, confirmed by one newer bar on each side.
        if n >= 4 {
            let tb = n - 3; // index of the candidate bar
            if highs[n - 2] < highs[tb] && highs[n - 4] < highs[tb] {
                self.temp_swing_high = highs[tb];
            }
            if lows[n - 2] > lows[tb] && lows[n - 4] > lows[tb] {
                self.temp_swing_low = lows[tb];
            }
        }

        let depth = self.depth;
        let check_bar = depth + 1;
        let need = check_bar + depth + 1;
        if n < need {
            return;
        }

        // Candidate pivot is `check_bar` bars back from the newest bar.
        let cb = n - 1 - check_bar;

        let mut is_sh = true;
        let center_h = highs[cb];
        for i in 1..=depth {
            let left = cb + i;
            let right = match cb.checked_sub(i) {
                Some(r) => r,
                None => {
                    is_sh = false;
                    break;
                }
            };
            if left >= n || highs[left] >= center_h || highs[right] >= center_h {
                is_sh = false;
                break;
            }
        }

        let mut is_sl = true;
        let center_l = lows[cb];
        for i in 1..=depth {
            let left = cb + i;
            let right = match cb.checked_sub(i) {
                Some(r) => r,
                None => {
                    is_sl = false;
                    break;
                }
            };
            if left >= n || lows[left] <= center_l || lows[right] <= center_l {
                is_sl = false;
                break;
            }
        }

        if is_sh {
            self.add(center_h, check_bar as u32, true);
        }
        if is_sl {
            self.add(center_l, check_bar as u32, false);
        }
    }

    fn add(&mut self, price: f64, age: u32, is_high: bool) {
        if self
            .swings
            .iter()
            .any(|sp| sp.age == age && sp.is_high == is_high)
        {
            return;
        }
        if self.swings.len() >= SWING_MAX_RETAINED {
            self.swings.pop();
        }
        self.swings.insert(0, SwingPoint { price, age, is_high });
        self.update_cache();
    }

    fn update_cache(&mut self) {
        self.cached_sh1 = 0.0;
        self.cached_sh2 = 0.0;
        self.cached_sl1 = 0.0;
        self.cached_sl2 = 0.0;
        let mut sh_count = 0;
        let mut sl_count = 0;
        for sp in &self.swings {
            if sh_count >= 2 && sl_count >= 2 {
                break;
            }
            if sp.is_high && sh_count < 2 {
                if sh_count == 0 {
                    self.cached_sh1 = sp.price;
                } else {
                    self.cached_sh2 = sp.price;
                }
                sh_count += 1;
            } else if !sp.is_high && sl_count < 2 {
                if sl_count == 0 {
                    self.cached_sl1 = sp.price;
                } else {
                    self.cached_sl2 = sp.price;
                }
                sl_count += 1;
            }
        }
    }

    /// `nth`-most-recent confirmed swing high (1 or 2); falls back to the
    /// temp pivot for `nth == 1` when `allow_temp` is set and no confirmed
    /// point is cached yet.
    pub fn recent_swing_high(&self, nth: u8, allow_temp: bool) -> f64 {
        if nth == 1 && self.cached_sh1 > 0.0 {
            return self.cached_sh1;
        }
        if nth == 2 && self.cached_sh2 > 0.0 {
            return self.cached_sh2;
        }
        if nth == 1 && allow_temp && self.temp_swing_high > 0.0 {
            return self.temp_swing_high;
        }
        let mut count = 0;
        for sp in &self.swings {
            if sp.is_high {
                count += 1;
                if count == nth {
                    return sp.price;
                }
            }
        }
        0.0
    }

    pub fn recent_swing_low(&self, nth: u8, allow_temp: bool) -> f64 {
        if nth == 1 && self.cached_sl1 > 0.0 {
            return self.cached_sl1;
        }
        if nth == 2 && self.cached_sl2 > 0.0 {
            return self.cached_sl2;
        }
        if nth == 1 && allow_temp && self.temp_swing_low > 0.0 {
            return self.temp_swing_low;
        }
        let mut count = 0;
        for sp in &self.swings {
            if !sp.is_high {
                count += 1;
                if count == nth {
                    return sp.price;
                }
            }
        }
        0.0
    }

    pub fn cached_sh1(&self) -> f64 {
        self.cached_sh1
    }
    pub fn cached_sh2(&self) -> f64 {
        self.cached_sh2
    }
    pub fn cached_sl1(&self) -> f64 {
        self.cached_sl1
    }
    pub fn cached_sl2(&self) -> f64 {
        self.cached_sl2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zigzag_highs() -> Vec<f64> {
        // index 4 is a high pivot: strictly greater than its 3 neighbors on
        // each side (depth=3, need 9 bars total for confirmation).
        vec![100.0, 10.0, 11.0, 12.0, 20.0, 13.0, 12.0, 11.0, 100.0]
    }
    fn zigzag_lows() -> Vec<f64> {
        // index 4 is a low pivot, mirrored.
        vec![0.0, 8.0, 7.0, 6.0, 1.0, 7.0, 8.0, 9.0, 0.0]
    }

    #[test]
    fn too_short_history_is_noop() {
        let mut t = SwingTracker::new();
        t.update(&[1.0, 2.0], &[1.0, 2.0]);
        assert_eq!(t.recent_swing_high(1, true), 0.0);
    }

    #[test]
    fn confirms_depth3_pivot() {
        let mut t = SwingTracker::new();
        let highs = zigzag_highs();
        let lows = zigzag_lows();
        t.update(&highs, &lows);
        assert_eq!(t.recent_swing_high(1, false), 20.0);
        assert_eq!(t.recent_swing_low(1, false), 1.0);
    }

    #[test]
    fn ages_and_evicts_old_points() {
        let mut t = SwingTracker::new();
        t.update(&zigzag_highs(), &zigzag_lows());
        assert!(t.recent_swing_high(1, false) > 0.0);
        for _ in 0..45 {
            t.update(&zigzag_highs(), &zigzag_lows());
        }
        // after enough bars the original pivot should have aged out, though
        // repeated identical updates may re-confirm new points at age 4 each
        // call; the key invariant is the tracker never panics or grows
        // unbounded.
        assert!(t.swings.len() <= SWING_MAX_RETAINED);
    }

    #[test]
    fn temp_pivot_used_as_fallback() {
        let mut t = SwingTracker::new();
        // Only 4 bars: triggers the temp-pivot branch but not the depth-3
        // confirmed branch (needs depth+1+depth+1 = 8 bars).
        t.update(&[10.0, 15.0, 9.0, 11.0], &[5.0, 2.0, 6.0, 4.0]);
        assert_eq!(t.recent_swing_high(1, false), 0.0);
        assert_eq!(t.recent_swing_high(1, true), 15.0);
        assert_eq!(t.recent_swing_low(1, true), 2.0);
    }
}
