//! Reversal-family patterns: Climax, Wedge, Major Trend Reversal (MTR),
//! Double-Top/Bottom, and the plain Reversal-Bar. All are gated to the
//! states where Brooks considers counter-trend entries viable
//! (`REVERSAL_ALLOWED_STATES`).

use super::{PatternContext, Signal};
use crate::constants::{PatternFamily, Side, SignalCycle, REVERSAL_ALLOWED_STATES};

fn allowed(ctx: &PatternContext) -> bool {
    REVERSAL_ALLOWED_STATES.contains(&ctx.market_state.state)
}

/// An exhaustion bar: range well beyond average, body closing against the
/// prevailing push after an extended H/L count — the last gasp of a trend.
pub fn detect_climax(ctx: &PatternContext, side: Side) -> Option<Signal> {
    if !allowed(ctx) {
        return None;
    }
    let last = ctx.last();
    let range = ctx.highs[last] - ctx.lows[last];
    if range <= 0.0 || ctx.atr <= 0.0 {
        return None;
    }
    if range < ctx.atr * 2.0 {
        return None;
    }
    let extended = ctx.hl.h_count >= 4 || ctx.hl.l_count >= 4;
    if !extended {
        return None;
    }
    let close_pos = (ctx.closes[last] - ctx.lows[last]) / range;
    match side {
        Side::Buy if ctx.hl.l_count >= 4 && close_pos > 0.6 => Some(Signal {
            family: PatternFamily::Climax,
            side,
            entry: ctx.closes[last],
            stop_hint: Some(ctx.lows[last]),
            cycle: SignalCycle::None,
        }),
        Side::Sell if ctx.hl.h_count >= 4 && close_pos < 0.4 => Some(Signal {
            family: PatternFamily::Climax,
            side,
            entry: ctx.closes[last],
            stop_hint: Some(ctx.highs[last]),
            cycle: SignalCycle::None,
        }),
        _ => None,
    }
}

/// Three pushes to new extremes with shrinking momentum (a rising/falling
/// wedge) — the classic Brooks three-push reversal setup.
pub fn detect_wedge(ctx: &PatternContext, side: Side) -> Option<Signal> {
    if !allowed(ctx) {
        return None;
    }
    let last = ctx.last();
    match side {
        Side::Buy => {
            let l1 = ctx.swings.recent_swing_low(1, true);
            let l2 = ctx.swings.recent_swing_low(2, false);
            if l1 <= 0.0 || l2 <= 0.0 {
                return None;
            }
            let three_pushes = l1 < l2 && ctx.hl.l_count >= 2;
            let momentum_fading = ctx.closes[last] > ctx.opens[last];
            (three_pushes && momentum_fading).then_some(Signal {
                family: PatternFamily::Wedge,
                side,
                entry: ctx.closes[last],
                stop_hint: Some(l1),
                cycle: SignalCycle::None,
            })
        }
        Side::Sell => {
            let h1 = ctx.swings.recent_swing_high(1, true);
            let h2 = ctx.swings.recent_swing_high(2, false);
            if h1 <= 0.0 || h2 <= 0.0 {
                return None;
            }
            let three_pushes = h1 > h2 && ctx.hl.h_count >= 2;
            let momentum_fading = ctx.closes[last] < ctx.opens[last];
            (three_pushes && momentum_fading).then_some(Signal {
                family: PatternFamily::Wedge,
                side,
                entry: ctx.closes[last],
                stop_hint: Some(h1),
                cycle: SignalCycle::None,
            })
        }
    }
}

/// Major trend reversal: price breaks the opposing trend line and then
/// tests back through the prior extreme without making a new one.
pub fn detect_mtr(ctx: &PatternContext, side: Side) -> Option<Signal> {
    if !allowed(ctx) {
        return None;
    }
    let last = ctx.last();
    match side {
        Side::Buy => {
            let sh1 = ctx.swings.recent_swing_high(1, true);
            let sh2 = ctx.swings.recent_swing_high(2, false);
            if sh1 <= 0.0 || sh2 <= 0.0 || sh1 >= sh2 {
                return None;
            }
            let holds_above_low = ctx.swings.recent_swing_low(1, true) > 0.0
                && ctx.closes[last] > ctx.swings.recent_swing_low(1, true);
            holds_above_low.then_some(Signal {
                family: PatternFamily::Mtr,
                side,
                entry: ctx.closes[last],
                stop_hint: Some(ctx.swings.recent_swing_low(1, true)),
                cycle: SignalCycle::None,
            })
        }
        Side::Sell => {
            let sl1 = ctx.swings.recent_swing_low(1, true);
            let sl2 = ctx.swings.recent_swing_low(2, false);
            if sl1 <= 0.0 || sl2 <= 0.0 || sl1 <= sl2 {
                return None;
            }
            let holds_below_high = ctx.swings.recent_swing_high(1, true) > 0.0
                && ctx.closes[last] < ctx.swings.recent_swing_high(1, true);
            holds_below_high.then_some(Signal {
                family: PatternFamily::Mtr,
                side,
                entry: ctx.closes[last],
                stop_hint: Some(ctx.swings.recent_swing_high(1, true)),
                cycle: SignalCycle::None,
            })
        }
    }
}

/// Two swing highs (or lows) at roughly the same level with a pullback
/// between — a double top/bottom.
pub fn detect_double_top_bottom(ctx: &PatternContext, side: Side) -> Option<Signal> {
    if !allowed(ctx) || ctx.atr <= 0.0 {
        return None;
    }
    let last = ctx.last();
    let tolerance = ctx.atr * 0.25;
    match side {
        Side::Sell => {
            let h1 = ctx.swings.recent_swing_high(1, true);
            let h2 = ctx.swings.recent_swing_high(2, false);
            if h1 <= 0.0 || h2 <= 0.0 {
                return None;
            }
            let matched = (h1 - h2).abs() <= tolerance;
            let rejecting = ctx.closes[last] < ctx.opens[last];
            (matched && rejecting).then_some(Signal {
                family: PatternFamily::DoubleTopBottom,
                side,
                entry: ctx.closes[last],
                stop_hint: Some(h1.max(h2)),
                cycle: SignalCycle::None,
            })
        }
        Side::Buy => {
            let l1 = ctx.swings.recent_swing_low(1, true);
            let l2 = ctx.swings.recent_swing_low(2, false);
            if l1 <= 0.0 || l2 <= 0.0 {
                return None;
            }
            let matched = (l1 - l2).abs() <= tolerance;
            let rejecting = ctx.closes[last] > ctx.opens[last];
            (matched && rejecting).then_some(Signal {
                family: PatternFamily::DoubleTopBottom,
                side,
                entry: ctx.closes[last],
                stop_hint: Some(l1.min(l2)),
                cycle: SignalCycle::None,
            })
        }
    }
}

/// A single bar that strongly reverses the immediately preceding bar's
/// direction, closing near the opposite extreme (a "pin bar").
pub fn detect_reversal_bar(ctx: &PatternContext, side: Side) -> Option<Signal> {
    if !allowed(ctx) {
        return None;
    }
    let n = ctx.n();
    if n < 2 {
        return None;
    }
    let last = n - 1;
    let prev = last - 1;
    let range = ctx.highs[last] - ctx.lows[last];
    if range <= 0.0 {
        return None;
    }
    let prev_bear = ctx.closes[prev] < ctx.opens[prev];
    let prev_bull = ctx.closes[prev] > ctx.opens[prev];
    let close_pos = (ctx.closes[last] - ctx.lows[last]) / range;
    match side {
        Side::Buy if prev_bear && close_pos > 0.75 && ctx.closes[last] > ctx.opens[last] => Some(Signal {
            family: PatternFamily::ReversalBar,
            side,
            entry: ctx.closes[last],
            stop_hint: Some(ctx.lows[last]),
            cycle: SignalCycle::None,
        }),
        Side::Sell if prev_bull && close_pos < 0.25 && ctx.closes[last] < ctx.opens[last] => Some(Signal {
            family: PatternFamily::ReversalBar,
            side,
            entry: ctx.closes[last],
            stop_hint: Some(ctx.highs[last]),
            cycle: SignalCycle::None,
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::MeasuringGapTracker;
    use crate::hl_counter::HlCounter;
    use crate::market_state::MarketStateTracker;
    use crate::swing_tracker::SwingTracker;

    struct Fixture {
        opens: Vec<f64>,
        highs: Vec<f64>,
        lows: Vec<f64>,
        closes: Vec<f64>,
        ema: Vec<f64>,
        swings: SwingTracker,
        hl: HlCounter,
        market_state: MarketStateTracker,
        measuring_gap: MeasuringGapTracker,
    }

    impl Fixture {
        fn new(opens: Vec<f64>, highs: Vec<f64>, lows: Vec<f64>, closes: Vec<f64>) -> Self {
            let ema = closes.clone();
            let mut market_state = MarketStateTracker::new();
            market_state.state = crate::constants::MarketState::TradingRange;
            Self {
                opens,
                highs,
                lows,
                closes,
                ema,
                swings: SwingTracker::new(),
                hl: HlCounter::new(),
                market_state,
                measuring_gap: MeasuringGapTracker::new(),
            }
        }

        fn ctx(&self, atr: f64) -> PatternContext<'_> {
            PatternContext {
                opens: &self.opens,
                highs: &self.highs,
                lows: &self.lows,
                closes: &self.closes,
                ema: &self.ema,
                atr,
                swings: &self.swings,
                hl: &self.hl,
                market_state: &self.market_state,
                measuring_gap: &self.measuring_gap,
                is_ttr: false,
                h1_signal: None,
                h2_signal: None,
                l1_signal: None,
                l2_signal: None,
            }
        }
    }

    #[test]
    fn detect_climax_fires_long_after_extended_down_push() {
        let mut fx = Fixture::new(vec![100.0], vec![101.0], vec![95.0], vec![100.5]);
        fx.hl.l_count = 5;
        let ctx = fx.ctx(1.0);
        let sig = detect_climax(&ctx, Side::Buy).expect("climax should fire");
        assert_eq!(sig.family, PatternFamily::Climax);
    }

    #[test]
    fn detect_climax_requires_extended_push() {
        let mut fx = Fixture::new(vec![100.0], vec![101.0], vec![95.0], vec![100.5]);
        fx.hl.l_count = 1;
        let ctx = fx.ctx(1.0);
        assert!(detect_climax(&ctx, Side::Buy).is_none());
    }

    #[test]
    fn detect_climax_blocked_outside_reversal_states() {
        let mut fx = Fixture::new(vec![100.0], vec![101.0], vec![95.0], vec![100.5]);
        fx.hl.l_count = 5;
        fx.market_state.state = crate::constants::MarketState::StrongTrend;
        let ctx = fx.ctx(1.0);
        assert!(detect_climax(&ctx, Side::Buy).is_none());
    }

    #[test]
    fn detect_reversal_bar_fires_as_pin_bar_long() {
        let fx = Fixture::new(
            vec![100.0, 97.5],
            vec![100.5, 101.0],
            vec![96.0, 97.0],
            vec![97.0, 100.8],
        );
        let ctx = fx.ctx(1.0);
        let sig = detect_reversal_bar(&ctx, Side::Buy).expect("reversal bar should fire");
        assert_eq!(sig.family, PatternFamily::ReversalBar);
    }

    #[test]
    fn detect_reversal_bar_rejects_without_prior_opposite_bar() {
        let fx = Fixture::new(
            vec![100.0, 97.5],
            vec![100.5, 101.0],
            vec![96.0, 97.0],
            vec![101.0, 100.8],
        );
        let ctx = fx.ctx(1.0);
        assert!(detect_reversal_bar(&ctx, Side::Buy).is_none());
    }

    #[test]
    fn detect_double_top_bottom_fires_on_matched_lows() {
        // Drive two confirmed swing lows at nearly the same level via two
        // V-shapes back to back, then a rejecting bar off the second low.
        // `SwingTracker::update` only evaluates the single candidate pivot
        // `depth` bars back from the newest bar, so it must be called
        // incrementally (once per bar added) exactly as the strategy loop
        // does, not once against the full history.
        let opens = vec![
            11.0, 10.0, 9.0, 8.0, 6.0, 6.5, 7.5, 8.5, 6.0, 7.0, 8.0, 7.5, 6.0,
        ];
        let highs = vec![
            12.0, 11.0, 10.0, 9.0, 7.0, 7.5, 8.5, 9.5, 8.0, 9.0, 10.0, 9.5, 7.0,
        ];
        let lows = vec![
            10.0, 9.0, 8.0, 7.0, 5.0, 6.0, 7.0, 8.0, 5.1, 6.0, 7.0, 6.5, 5.1,
        ];
        let closes = vec![
            11.5, 10.5, 9.5, 8.5, 6.3, 7.0, 8.0, 9.0, 7.8, 8.8, 9.5, 6.8, 6.3,
        ];
        let mut fx = Fixture::new(opens, highs, lows, closes);
        for k in 4..=fx.highs.len() {
            let highs = fx.highs[..k].to_vec();
            let lows = fx.lows[..k].to_vec();
            fx.swings.update(&highs, &lows);
        }
        let ctx = fx.ctx(1.0);
        let l1 = ctx.swings.recent_swing_low(1, true);
        let l2 = ctx.swings.recent_swing_low(2, false);
        assert!(l1 > 0.0 && l2 > 0.0, "fixture must confirm two swing lows, got {l1} {l2}");
        let sig = detect_double_top_bottom(&ctx, Side::Buy);
        assert!(sig.is_some(), "double bottom should fire for matched lows {l1} vs {l2}");
    }
}
