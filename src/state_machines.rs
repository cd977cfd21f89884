//! H2 / L2 pullback state machines (spec.md §4.F, H2/L2 family).
//!
//! Each machine tracks a single higher-low-low-high (or mirrored) pullback
//! cycle: wait for a pullback to start, follow it to its extreme, confirm
//! the first bounce (H1/L1), then arm on a break of that bounce's extreme
//! (H2/L2). An outside bar always resets the cycle — a failed continuation
//! takes priority over a fresh one, since Brooks treats it as an erased
//! pullback rather than a deeper one.

use crate::constants::Side;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HState {
    WaitingForPullback,
    InPullback,
    H1Detected,
    WaitingForH2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LState {
    WaitingForPullback,
    InPullback,
    L1Detected,
    WaitingForL2,
}

#[derive(Debug, Clone, Copy)]
pub struct H2Signal {
    pub entry: f64,
    pub stop: f64,
    pub h1_high: f64,
    pub pullback_low: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct L2Signal {
    pub entry: f64,
    pub stop: f64,
    pub l1_low: f64,
    pub pullback_high: f64,
}

/// Which leg of the pullback cycle fired this bar. H1/L1 fire at most once
/// per cycle (the first bounce), H2/L2 on the later break of that bounce.
#[derive(Debug, Clone, Copy)]
pub enum H2Outcome {
    H1(H2Signal),
    H2(H2Signal),
}

#[derive(Debug, Clone, Copy)]
pub enum L2Outcome {
    L1(L2Signal),
    L2(L2Signal),
}

#[derive(Debug, Clone)]
pub struct H2StateMachine {
    state: HState,
    /// Set by the caller each bar: true when the H1 regime/alignment gate
    /// (StrongTrend or TightChannel, ≥ 4 of last 5 bars aligned) is open.
    h1_gate_open: bool,
    pullback_low: f64,
    h1_high: f64,
    h1_low: f64,
    prev_high: Option<f64>,
    prev_low: Option<f64>,
}

impl Default for H2StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl H2StateMachine {
    pub fn new() -> Self {
        Self {
            state: HState::WaitingForPullback,
            h1_gate_open: false,
            pullback_low: 0.0,
            h1_high: 0.0,
            h1_low: 0.0,
            prev_high: None,
            prev_low: None,
        }
    }

    pub fn reset(&mut self) {
        self.state = HState::WaitingForPullback;
        self.pullback_low = 0.0;
        self.h1_high = 0.0;
        self.h1_low = 0.0;
    }

    pub fn set_h1_gate_open(&mut self, open: bool) {
        self.h1_gate_open = open;
    }

    pub fn state(&self) -> HState {
        self.state
    }

    fn validate(&mut self) {
        let consistent = match self.state {
            HState::WaitingForPullback => true,
            HState::InPullback => self.pullback_low > 0.0,
            HState::H1Detected | HState::WaitingForH2 => {
                self.pullback_low > 0.0 && self.h1_high > 0.0
            }
        };
        if !consistent {
            self.reset();
        }
    }

    /// Feed the next closed bar. Returns `Some(H2Outcome::H1(..))` the bar
    /// the first bounce confirms (only when `h1_gate_open`), and
    /// `Some(H2Outcome::H2(..))` the bar an armed H2 breaks above its H1
    /// high.
    pub fn update(
        &mut self,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        ema: f64,
        atr: f64,
        stop_loss: impl Fn(Side, f64, f64, f64) -> f64,
    ) -> Option<H2Outcome> {
        if atr <= 0.0 {
            return None;
        }

        let is_outside = self
            .prev_high
            .zip(self.prev_low)
            .map(|(ph, pl)| high > ph && low < pl)
            .unwrap_or(false);

        self.prev_high = Some(high);
        self.prev_low = Some(low);

        if is_outside && self.state != HState::WaitingForPullback {
            self.reset();
            return None;
        }

        let signal = match self.state {
            HState::WaitingForPullback => {
                if close < ema && low < open {
                    self.pullback_low = low;
                    self.state = HState::InPullback;
                }
                None
            }
            HState::InPullback => {
                if low < self.pullback_low {
                    self.pullback_low = low;
                }
                let is_bull = close > open;
                let pullback_depth = if ema > 0.0 { (ema - self.pullback_low).max(0.0) } else { 0.0 };
                if is_bull && close > ema.min(open) && pullback_depth >= atr * 0.1 {
                    self.h1_high = high;
                    self.h1_low = low;
                    self.state = HState::H1Detected;
                    if self.h1_gate_open {
                        let entry = self.h1_high;
                        let stop = stop_loss(Side::Buy, entry, self.pullback_low, atr);
                        Some(H2Outcome::H1(H2Signal {
                            entry,
                            stop,
                            h1_high: self.h1_high,
                            pullback_low: self.pullback_low,
                        }))
                    } else {
                        None
                    }
                } else {
                    None
                }
            }
            HState::H1Detected | HState::WaitingForH2 => {
                if low < self.pullback_low {
                    // deeper pullback before H2 triggers: this becomes the
                    // new H1 setup rather than a failure.
                    self.pullback_low = low;
                    self.state = HState::InPullback;
                    None
                } else if high > self.h1_high {
                    let entry = self.h1_high;
                    let stop = stop_loss(Side::Buy, entry, self.pullback_low, atr);
                    let sig = H2Signal {
                        entry,
                        stop,
                        h1_high: self.h1_high,
                        pullback_low: self.pullback_low,
                    };
                    self.state = HState::WaitingForH2;
                    self.h1_high = high.max(self.h1_high);
                    Some(H2Outcome::H2(sig))
                } else {
                    self.state = HState::WaitingForH2;
                    None
                }
            }
        };

        self.validate();
        signal
    }
}

#[derive(Debug, Clone)]
pub struct L2StateMachine {
    state: LState,
    /// Set by the caller each bar: true when the L1 regime/alignment gate
    /// (StrongTrend or TightChannel, ≥ 4 of last 5 bars aligned) is open.
    h1_gate_open: bool,
    pullback_high: f64,
    l1_low: f64,
    l1_high: f64,
    prev_high: Option<f64>,
    prev_low: Option<f64>,
}

impl Default for L2StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl L2StateMachine {
    pub fn new() -> Self {
        Self {
            state: LState::WaitingForPullback,
            h1_gate_open: false,
            pullback_high: 0.0,
            l1_low: 0.0,
            l1_high: 0.0,
            prev_high: None,
            prev_low: None,
        }
    }

    pub fn reset(&mut self) {
        self.state = LState::WaitingForPullback;
        self.pullback_high = 0.0;
        self.l1_low = 0.0;
        self.l1_high = 0.0;
    }

    pub fn set_h1_gate_open(&mut self, open: bool) {
        self.h1_gate_open = open;
    }

    pub fn state(&self) -> LState {
        self.state
    }

    fn validate(&mut self) {
        let consistent = match self.state {
            LState::WaitingForPullback => true,
            LState::InPullback => self.pullback_high > 0.0,
            LState::L1Detected | LState::WaitingForL2 => {
                self.pullback_high > 0.0 && self.l1_low > 0.0
            }
        };
        if !consistent {
            self.reset();
        }
    }

    pub fn update(
        &mut self,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        ema: f64,
        atr: f64,
        stop_loss: impl Fn(Side, f64, f64, f64) -> f64,
    ) -> Option<L2Outcome> {
        if atr <= 0.0 {
            return None;
        }

        let is_outside = self
            .prev_high
            .zip(self.prev_low)
            .map(|(ph, pl)| high > ph && low < pl)
            .unwrap_or(false);

        self.prev_high = Some(high);
        self.prev_low = Some(low);

        if is_outside && self.state != LState::WaitingForPullback {
            self.reset();
            return None;
        }

        let signal = match self.state {
            LState::WaitingForPullback => {
                if close > ema && high > open {
                    self.pullback_high = high;
                    self.state = LState::InPullback;
                }
                None
            }
            LState::InPullback => {
                if high > self.pullback_high {
                    self.pullback_high = high;
                }
                let is_bear = close < open;
                let bounce_depth = if ema > 0.0 { (self.pullback_high - ema).max(0.0) } else { 0.0 };
                if is_bear && close < ema.max(open) && bounce_depth >= atr * 0.1 {
                    self.l1_low = low;
                    self.l1_high = high;
                    self.state = LState::L1Detected;
                    if self.h1_gate_open {
                        let entry = self.l1_low;
                        let stop = stop_loss(Side::Sell, entry, self.pullback_high, atr);
                        Some(L2Outcome::L1(L2Signal {
                            entry,
                            stop,
                            l1_low: self.l1_low,
                            pullback_high: self.pullback_high,
                        }))
                    } else {
                        None
                    }
                } else {
                    None
                }
            }
            LState::L1Detected | LState::WaitingForL2 => {
                if high > self.pullback_high {
                    self.pullback_high = high;
                    self.state = LState::InPullback;
                    None
                } else if low < self.l1_low {
                    let entry = self.l1_low;
                    let stop = stop_loss(Side::Sell, entry, self.pullback_high, atr);
                    let sig = L2Signal {
                        entry,
                        stop,
                        l1_low: self.l1_low,
                        pullback_high: self.pullback_high,
                    };
                    self.state = LState::WaitingForL2;
                    self.l1_low = low.min(self.l1_low);
                    Some(L2Outcome::L2(sig))
                } else {
                    self.state = LState::WaitingForL2;
                    None
                }
            }
        };

        self.validate();
        signal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_stop(_side: Side, entry: f64, extreme: f64, atr: f64) -> f64 {
        let _ = atr;
        (entry + extreme) / 2.0
    }

    #[test]
    fn zero_atr_is_noop() {
        let mut m = H2StateMachine::new();
        assert!(m.update(10.0, 11.0, 9.0, 10.5, 10.0, 0.0, noop_stop).is_none());
    }

    #[test]
    fn outside_bar_resets_mid_cycle() {
        let mut m = H2StateMachine::new();
        // push into InPullback
        m.update(10.0, 10.2, 9.0, 9.2, 10.0, 1.0, noop_stop);
        assert_eq!(m.state(), HState::InPullback);
        // outside bar
        m.update(9.0, 12.0, 7.0, 8.0, 10.0, 1.0, noop_stop);
        assert_eq!(m.state(), HState::WaitingForPullback);
    }

    #[test]
    fn full_h2_cycle_emits_signal() {
        let mut m = H2StateMachine::new();
        // bar 1: pullback starts (close below ema, bearish)
        assert!(m.update(10.0, 10.1, 8.8, 9.0, 10.0, 1.0, noop_stop).is_none());
        assert_eq!(m.state(), HState::InPullback);
        // bar 2: bullish close above ema -> H1 detected
        assert!(m
            .update(9.0, 11.0, 8.9, 10.8, 10.0, 1.0, noop_stop)
            .is_none());
        assert_eq!(m.state(), HState::H1Detected);
        // bar 3: breaks h1 high -> H2 signal
        let sig = m.update(10.8, 11.5, 10.5, 11.2, 10.2, 1.0, noop_stop);
        assert!(matches!(sig, Some(H2Outcome::H2(_))));
    }

    #[test]
    fn h1_is_not_emitted_with_the_gate_closed() {
        let mut m = H2StateMachine::new();
        m.update(10.0, 10.1, 8.8, 9.0, 10.0, 1.0, noop_stop);
        let sig = m.update(9.0, 11.0, 8.9, 10.8, 10.0, 1.0, noop_stop);
        assert!(sig.is_none());
        assert_eq!(m.state(), HState::H1Detected);
    }

    #[test]
    fn h1_emits_once_the_gate_is_open() {
        let mut m = H2StateMachine::new();
        m.set_h1_gate_open(true);
        m.update(10.0, 10.1, 8.8, 9.0, 10.0, 1.0, noop_stop);
        let sig = m.update(9.0, 11.0, 8.9, 10.8, 10.0, 1.0, noop_stop);
        assert!(matches!(sig, Some(H2Outcome::H1(_))));
    }

    #[test]
    fn l1_emits_once_the_gate_is_open() {
        let mut m = L2StateMachine::new();
        m.set_h1_gate_open(true);
        // bar 1: pullback starts (close above ema, bullish)
        assert!(m.update(10.0, 11.2, 9.9, 11.0, 10.0, 1.0, noop_stop).is_none());
        assert_eq!(m.state(), LState::InPullback);
        // bar 2: bearish close below ema -> L1 detected
        let sig = m.update(11.0, 11.1, 9.0, 9.2, 10.0, 1.0, noop_stop);
        assert!(matches!(sig, Some(L2Outcome::L1(_))));
        assert_eq!(m.state(), LState::L1Detected);
    }
}
