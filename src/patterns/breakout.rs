//! Breakout-family patterns: trading-range breakout, breakout-pullback
//! continuation, failed breakout (reversal), measured-move continuation and
//! the final-flag continuation signal.

use super::{PatternContext, Signal};
use crate::constants::{MarketState, PatternFamily, Side, SignalCycle};

/// A close beyond the trading-range boundary with a trend-bar-quality body.
pub fn detect_tr_breakout(ctx: &PatternContext, side: Side) -> Option<Signal> {
    if ctx.market_state.state != MarketState::TradingRange {
        return None;
    }
    let last = ctx.last();
    let (tr_high, tr_low) = (ctx.market_state.tr_high, ctx.market_state.tr_low);
    if tr_high <= tr_low {
        return None;
    }
    match side {
        Side::Buy if ctx.closes[last] > tr_high => Some(Signal {
            family: PatternFamily::TrBreakout,
            side,
            entry: ctx.closes[last],
            stop_hint: Some(tr_low),
            cycle: SignalCycle::TradingRange,
        }),
        Side::Sell if ctx.closes[last] < tr_low => Some(Signal {
            family: PatternFamily::TrBreakout,
            side,
            entry: ctx.closes[last],
            stop_hint: Some(tr_high),
            cycle: SignalCycle::TradingRange,
        }),
        _ => None,
    }
}

/// After a breakout, the first shallow pullback that holds beyond the prior
/// swing extreme — the classic second entry.
pub fn detect_breakout_pullback(ctx: &PatternContext, side: Side) -> Option<Signal> {
    if ctx.market_state.state != MarketState::Breakout {
        return None;
    }
    let n = ctx.n();
    if n < 3 {
        return None;
    }
    let last = n - 1;
    let prev = last - 1;
    let pullback_bar = match side {
        Side::Buy => ctx.closes[prev] < ctx.opens[prev],
        Side::Sell => ctx.closes[prev] > ctx.opens[prev],
    };
    if !pullback_bar {
        return None;
    }
    let resumes = match side {
        Side::Buy => ctx.closes[last] > ctx.highs[prev],
        Side::Sell => ctx.closes[last] < ctx.lows[prev],
    };
    if !resumes {
        return None;
    }
    let stop = match side {
        Side::Buy => ctx.lows[prev],
        Side::Sell => ctx.highs[prev],
    };
    Some(Signal {
        family: PatternFamily::BreakoutPullback,
        side,
        entry: ctx.closes[last],
        stop_hint: Some(stop),
        cycle: SignalCycle::None,
    })
}

/// A breakout beyond a swing point or trading-range edge that fails and
/// closes back inside within the same or next bar — traded as a reversal in
/// the opposite direction.
pub fn detect_failed_breakout(ctx: &PatternContext, side: Side) -> Option<Signal> {
    use crate::constants::REVERSAL_ALLOWED_STATES;
    if !REVERSAL_ALLOWED_STATES.contains(&ctx.market_state.state) {
        return None;
    }
    let last = ctx.last();
    match side {
        Side::Buy => {
            let sl1 = ctx.swings.recent_swing_low(1, true);
            if sl1 <= 0.0 {
                return None;
            }
            let broke_and_failed = ctx.lows[last] < sl1 && ctx.closes[last] > sl1;
            broke_and_failed.then_some(Signal {
                family: PatternFamily::FailedBreakout,
                side,
                entry: ctx.closes[last],
                stop_hint: Some(ctx.lows[last]),
                cycle: SignalCycle::None,
            })
        }
        Side::Sell => {
            let sh1 = ctx.swings.recent_swing_high(1, true);
            if sh1 <= 0.0 {
                return None;
            }
            let broke_and_failed = ctx.highs[last] > sh1 && ctx.closes[last] < sh1;
            broke_and_failed.then_some(Signal {
                family: PatternFamily::FailedBreakout,
                side,
                entry: ctx.closes[last],
                stop_hint: Some(ctx.highs[last]),
                cycle: SignalCycle::None,
            })
        }
    }
}

/// A fresh measuring gap continuing the direction it fired in — traded as
/// an entry for the second half of the projected leg, not just a TP target.
pub fn detect_measured_move(ctx: &PatternContext, side: Side) -> Option<Signal> {
    if !ctx.measuring_gap.active {
        return None;
    }
    let last = ctx.last();
    let leg_up = ctx.measuring_gap.origin_price > ctx.measuring_gap.leg_start_price;
    let aligned = (side == Side::Buy && leg_up) || (side == Side::Sell && !leg_up);
    if !aligned {
        return None;
    }
    Some(Signal {
        family: PatternFamily::MeasuredMove,
        side,
        entry: ctx.closes[last],
        stop_hint: None,
        cycle: SignalCycle::None,
    })
}

/// Continuation in the channel's direction while the market is in the
/// FinalFlag state — the last leg before Brooks expects the trend to
/// exhaust.
pub fn detect_final_flag(ctx: &PatternContext, side: Side) -> Option<Signal> {
    if ctx.market_state.state != MarketState::FinalFlag {
        return None;
    }
    use crate::market_state::TightChannelDir;
    let dir_ok = match (side, ctx.market_state.tight_channel_dir) {
        (Side::Buy, TightChannelDir::Up) => true,
        (Side::Sell, TightChannelDir::Down) => true,
        _ => false,
    };
    if !dir_ok {
        return None;
    }
    let last = ctx.last();
    Some(Signal {
        family: PatternFamily::FinalFlag,
        side,
        entry: ctx.closes[last],
        stop_hint: None,
        cycle: SignalCycle::FinalFlag,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::MeasuringGapTracker;
    use crate::hl_counter::HlCounter;
    use crate::market_state::{MarketStateTracker, TightChannelDir};
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
            Self {
                opens,
                highs,
                lows,
                closes,
                ema,
                swings: SwingTracker::new(),
                hl: HlCounter::new(),
                market_state: MarketStateTracker::new(),
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
    fn detect_tr_breakout_fires_on_close_beyond_range() {
        let mut fx = Fixture::new(vec![100.0], vec![101.0], vec![99.0], vec![105.0]);
        fx.market_state.state = MarketState::TradingRange;
        fx.market_state.tr_high = 104.0;
        fx.market_state.tr_low = 96.0;
        let ctx = fx.ctx(1.0);
        let sig = detect_tr_breakout(&ctx, Side::Buy).expect("tr breakout should fire");
        assert_eq!(sig.family, PatternFamily::TrBreakout);
        assert_eq!(sig.stop_hint, Some(96.0));
    }

    #[test]
    fn detect_tr_breakout_requires_trading_range_state() {
        let mut fx = Fixture::new(vec![100.0], vec![101.0], vec![99.0], vec![105.0]);
        fx.market_state.state = MarketState::StrongTrend;
        fx.market_state.tr_high = 104.0;
        fx.market_state.tr_low = 96.0;
        let ctx = fx.ctx(1.0);
        assert!(detect_tr_breakout(&ctx, Side::Buy).is_none());
    }

    #[test]
    fn detect_breakout_pullback_fires_on_resumption() {
        let mut fx = Fixture::new(
            vec![100.0, 103.0, 101.5],
            vec![104.0, 104.0, 106.0],
            vec![99.0, 101.0, 101.4],
            vec![103.5, 101.2, 105.8],
        );
        fx.market_state.state = MarketState::Breakout;
        let ctx = fx.ctx(1.0);
        let sig = detect_breakout_pullback(&ctx, Side::Buy).expect("breakout pullback should fire");
        assert_eq!(sig.family, PatternFamily::BreakoutPullback);
        assert_eq!(sig.stop_hint, Some(101.0));
    }

    #[test]
    fn detect_breakout_pullback_requires_pullback_bar() {
        let mut fx = Fixture::new(
            vec![100.0, 101.0, 101.5],
            vec![104.0, 104.0, 106.0],
            vec![99.0, 101.0, 101.4],
            vec![103.5, 103.8, 105.8],
        );
        fx.market_state.state = MarketState::Breakout;
        let ctx = fx.ctx(1.0);
        assert!(detect_breakout_pullback(&ctx, Side::Buy).is_none());
    }

    #[test]
    fn detect_failed_breakout_fires_after_break_and_reclaim() {
        // Eight-bar V-shape confirms a swing low of 5.0 at depth 3, then a
        // ninth bar breaks below it intrabar and closes back above.
        let opens = vec![11.0, 10.0, 9.0, 8.0, 6.0, 6.5, 7.5, 8.5, 4.5];
        let highs = vec![12.0, 11.0, 10.0, 9.0, 7.0, 7.5, 8.5, 9.5, 6.0];
        let lows = vec![10.0, 9.0, 8.0, 7.0, 5.0, 6.0, 7.0, 8.0, 4.0];
        let closes = vec![11.5, 10.5, 9.5, 8.5, 6.3, 7.0, 8.0, 9.0, 5.5];
        let mut fx = Fixture::new(opens, highs, lows, closes);
        fx.swings.update(&fx.highs.clone(), &fx.lows.clone());
        fx.market_state.state = MarketState::TradingRange;
        let ctx = fx.ctx(1.0);
        assert!(ctx.swings.recent_swing_low(1, true) > 0.0, "fixture must confirm a swing low");
        let sig = detect_failed_breakout(&ctx, Side::Buy).expect("failed breakout should fire");
        assert_eq!(sig.family, PatternFamily::FailedBreakout);
    }

    #[test]
    fn detect_failed_breakout_blocked_outside_reversal_states() {
        let opens = vec![11.0, 10.0, 9.0, 8.0, 6.0, 6.5, 7.5, 8.5, 4.5];
        let highs = vec![12.0, 11.0, 10.0, 9.0, 7.0, 7.5, 8.5, 9.5, 6.0];
        let lows = vec![10.0, 9.0, 8.0, 7.0, 5.0, 6.0, 7.0, 8.0, 4.0];
        let closes = vec![11.5, 10.5, 9.5, 8.5, 6.3, 7.0, 8.0, 9.0, 5.5];
        let mut fx = Fixture::new(opens, highs, lows, closes);
        fx.swings.update(&fx.highs.clone(), &fx.lows.clone());
        fx.market_state.state = MarketState::StrongTrend;
        let ctx = fx.ctx(1.0);
        assert!(detect_failed_breakout(&ctx, Side::Buy).is_none());
    }

    #[test]
    fn detect_measured_move_fires_when_aligned_with_leg() {
        let mut fx = Fixture::new(vec![100.0], vec![101.0], vec![99.0], vec![100.5]);
        fx.measuring_gap.active = true;
        fx.measuring_gap.leg_start_price = 90.0;
        fx.measuring_gap.origin_price = 100.0;
        let ctx = fx.ctx(1.0);
        let sig = detect_measured_move(&ctx, Side::Buy).expect("measured move should fire");
        assert_eq!(sig.family, PatternFamily::MeasuredMove);
    }

    #[test]
    fn detect_measured_move_rejects_opposing_side() {
        let mut fx = Fixture::new(vec![100.0], vec![101.0], vec![99.0], vec![100.5]);
        fx.measuring_gap.active = true;
        fx.measuring_gap.leg_start_price = 90.0;
        fx.measuring_gap.origin_price = 100.0;
        let ctx = fx.ctx(1.0);
        assert!(detect_measured_move(&ctx, Side::Sell).is_none());
    }

    #[test]
    fn detect_final_flag_fires_in_final_flag_state() {
        let mut fx = Fixture::new(vec![100.0], vec![101.0], vec![99.0], vec![100.5]);
        fx.market_state.state = MarketState::FinalFlag;
        fx.market_state.tight_channel_dir = TightChannelDir::Up;
        let ctx = fx.ctx(1.0);
        let sig = detect_final_flag(&ctx, Side::Buy).expect("final flag should fire");
        assert_eq!(sig.family, PatternFamily::FinalFlag);
        assert_eq!(sig.cycle, SignalCycle::FinalFlag);
    }

    #[test]
    fn detect_final_flag_rejects_wrong_direction() {
        let mut fx = Fixture::new(vec![100.0], vec![101.0], vec![99.0], vec![100.5]);
        fx.market_state.state = MarketState::FinalFlag;
        fx.market_state.tight_channel_dir = TightChannelDir::Down;
        let ctx = fx.ctx(1.0);
        assert!(detect_final_flag(&ctx, Side::Buy).is_none());
    }
}
