//! Single- and few-bar pattern families: Spike, MicroChannel, TrendBar,
//! GapBar, OutsideBar, II.

use super::{PatternContext, Signal};
use crate::constants::{PatternFamily, Side, SignalCycle};
use crate::filters::signal_bar_valid;

fn avg_range(ctx: &PatternContext, lookback: usize) -> f64 {
    let n = ctx.n();
    if n < lookback + 1 {
        return 0.0;
    }
    let start = n - 1 - lookback;
    let mut sum = 0.0;
    for i in start..n - 1 {
        sum += ctx.highs[i] - ctx.lows[i];
    }
    sum / lookback as f64
}

/// A single bar whose range and body dwarf the recent average and closes at
/// its extreme — the opening thrust of a new leg.
pub fn detect_spike(ctx: &PatternContext, side: Side) -> Option<Signal> {
    let last = ctx.last();
    let range = ctx.highs[last] - ctx.lows[last];
    if range <= 0.0 {
        return None;
    }
    let avg = avg_range(ctx, 10);
    if avg <= 0.0 || range < avg * 2.0 {
        return None;
    }
    let bullish = side == Side::Buy;
    if !signal_bar_valid(ctx.opens[last], ctx.highs[last], ctx.lows[last], ctx.closes[last], bullish, ctx.relaxed()) {
        return None;
    }
    let aligned = (bullish && ctx.closes[last] > ctx.opens[last]) || (!bullish && ctx.closes[last] < ctx.opens[last]);
    if !aligned {
        return None;
    }
    Some(Signal {
        family: PatternFamily::Spike,
        side,
        entry: ctx.closes[last],
        stop_hint: None,
        cycle: SignalCycle::None,
    })
}

/// 4-6 same-direction bars with minimal overlap and only shallow pullbacks —
/// a short channel tight enough to trade for one more push.
pub fn detect_micro_channel(ctx: &PatternContext, side: Side) -> Option<Signal> {
    const WINDOW: usize = 5;
    let n = ctx.n();
    if n < WINDOW + 1 {
        return None;
    }
    let start = n - WINDOW;
    let mut same_dir = 0usize;
    let mut shallow = 0usize;
    for i in start..n {
        let bullish = ctx.closes[i] > ctx.opens[i];
        if (side == Side::Buy && bullish) || (side == Side::Sell && !bullish) {
            same_dir += 1;
        }
        if i > start {
            let prev_range = ctx.highs[i - 1] - ctx.lows[i - 1];
            if prev_range > 0.0 {
                let pullback_ok = match side {
                    Side::Buy => ctx.lows[i] >= ctx.lows[i - 1] - prev_range * 0.25,
                    Side::Sell => ctx.highs[i] <= ctx.highs[i - 1] + prev_range * 0.25,
                };
                if pullback_ok {
                    shallow += 1;
                }
            }
        }
    }
    if same_dir < WINDOW - 1 || shallow < WINDOW - 2 {
        return None;
    }
    let last = n - 1;
    Some(Signal {
        family: PatternFamily::MicroChannel,
        side,
        entry: ctx.closes[last],
        stop_hint: None,
        cycle: SignalCycle::None,
    })
}

/// A strong with-trend bar traded for continuation on its own close.
pub fn detect_trend_bar(ctx: &PatternContext, side: Side) -> Option<Signal> {
    let last = ctx.last();
    let bullish = side == Side::Buy;
    if !signal_bar_valid(ctx.opens[last], ctx.highs[last], ctx.lows[last], ctx.closes[last], bullish, ctx.relaxed()) {
        return None;
    }
    let aligned_with_state = match ctx.market_state.trend_direction {
        Some(up) => up == bullish,
        None => true,
    };
    if !aligned_with_state {
        return None;
    }
    Some(Signal {
        family: PatternFamily::TrendBar,
        side,
        entry: ctx.closes[last],
        stop_hint: None,
        cycle: SignalCycle::None,
    })
}

/// A bar that opens beyond the prior bar's extreme in the trend direction
/// and holds — a gap confirming the move has more room to run.
pub fn detect_gap_bar(ctx: &PatternContext, side: Side) -> Option<Signal> {
    let n = ctx.n();
    if n < 2 {
        return None;
    }
    let last = n - 1;
    let prev = last - 1;
    match side {
        Side::Buy => {
            if ctx.opens[last] > ctx.highs[prev] && ctx.closes[last] > ctx.opens[last] {
                Some(Signal {
                    family: PatternFamily::GapBar,
                    side,
                    entry: ctx.closes[last],
                    stop_hint: None,
                    cycle: SignalCycle::None,
                })
            } else {
                None
            }
        }
        Side::Sell => {
            if ctx.opens[last] < ctx.lows[prev] && ctx.closes[last] < ctx.opens[last] {
                Some(Signal {
                    family: PatternFamily::GapBar,
                    side,
                    entry: ctx.closes[last],
                    stop_hint: None,
                    cycle: SignalCycle::None,
                })
            } else {
                None
            }
        }
    }
}

/// A bar whose range fully engulfs the prior bar — only valid as a
/// reversal-family entry inside a trading range or final flag (the states
/// where reversals are allowed at all).
pub fn detect_outside_bar(ctx: &PatternContext, side: Side) -> Option<Signal> {
    use crate::constants::REVERSAL_ALLOWED_STATES;
    if !REVERSAL_ALLOWED_STATES.contains(&ctx.market_state.state) {
        return None;
    }
    let n = ctx.n();
    if n < 2 {
        return None;
    }
    let last = n - 1;
    let prev = last - 1;
    let is_outside = ctx.highs[last] > ctx.highs[prev] && ctx.lows[last] < ctx.lows[prev];
    if !is_outside {
        return None;
    }
    let range = ctx.highs[last] - ctx.lows[last];
    if range <= 0.0 {
        return None;
    }
    let close_pos = (ctx.closes[last] - ctx.lows[last]) / range;
    let bullish_close = close_pos > 0.6;
    let bearish_close = close_pos < 0.4;
    match side {
        Side::Buy if bullish_close => Some(Signal {
            family: PatternFamily::OutsideBar,
            side,
            entry: ctx.closes[last],
            stop_hint: Some(ctx.lows[last]),
            cycle: SignalCycle::None,
        }),
        Side::Sell if bearish_close => Some(Signal {
            family: PatternFamily::OutsideBar,
            side,
            entry: ctx.closes[last],
            stop_hint: Some(ctx.highs[last]),
            cycle: SignalCycle::None,
        }),
        _ => None,
    }
}

/// Two consecutive inside bars (each inside the prior bar's range) followed
/// by a breakout bar in the signal direction.
pub fn detect_ii(ctx: &PatternContext, side: Side) -> Option<Signal> {
    let n = ctx.n();
    if n < 4 {
        return None;
    }
    let last = n - 1;
    let i1 = last - 1;
    let i2 = last - 2;
    let base = last - 3;
    let inside1 = ctx.highs[i2] <= ctx.highs[base] && ctx.lows[i2] >= ctx.lows[base];
    let inside2 = ctx.highs[i1] <= ctx.highs[i2] && ctx.lows[i1] >= ctx.lows[i2];
    if !(inside1 && inside2) {
        return None;
    }
    match side {
        Side::Buy if ctx.closes[last] > ctx.highs[i1] => Some(Signal {
            family: PatternFamily::Ii,
            side,
            entry: ctx.highs[i1],
            stop_hint: Some(ctx.lows[i1]),
            cycle: SignalCycle::None,
        }),
        Side::Sell if ctx.closes[last] < ctx.lows[i1] => Some(Signal {
            family: PatternFamily::Ii,
            side,
            entry: ctx.lows[i1],
            stop_hint: Some(ctx.highs[i1]),
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

        fn ctx(&self, atr: f64, is_ttr: bool) -> PatternContext<'_> {
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
                is_ttr,
                h1_signal: None,
                h2_signal: None,
                l1_signal: None,
                l2_signal: None,
            }
        }
    }

    /// Ten quiet bars followed by one bar with double the range, closing at
    /// its high with a strong body — a textbook long Spike.
    #[test]
    fn detect_spike_fires_long() {
        let mut opens = vec![100.0; 10];
        let mut highs = vec![101.0; 10];
        let mut lows = vec![99.0; 10];
        let mut closes = vec![100.5; 10];
        opens.push(100.0);
        highs.push(106.0);
        lows.push(99.0);
        closes.push(105.5);
        let fx = Fixture::new(opens, highs, lows, closes);
        let ctx = fx.ctx(1.0, false);
        let sig = detect_spike(&ctx, Side::Buy).expect("spike should fire");
        assert_eq!(sig.family, PatternFamily::Spike);
        assert_eq!(sig.side, Side::Buy);
    }

    #[test]
    fn detect_spike_rejects_quiet_bar() {
        let opens = vec![100.0; 11];
        let highs = vec![101.0; 11];
        let lows = vec![99.0; 11];
        let closes = vec![100.5; 11];
        let fx = Fixture::new(opens, highs, lows, closes);
        let ctx = fx.ctx(1.0, false);
        assert!(detect_spike(&ctx, Side::Buy).is_none());
    }

    /// Five consecutive bullish bars, each holding within 25% of the prior
    /// bar's range on pullback — a tight micro channel.
    #[test]
    fn detect_micro_channel_fires_long() {
        let opens = vec![100.0, 101.0, 102.0, 103.0, 104.0, 105.0];
        let highs = vec![101.2, 102.2, 103.2, 104.2, 105.2, 106.2];
        let lows = vec![99.8, 100.9, 101.9, 102.9, 103.9, 104.9];
        let closes = vec![101.1, 102.1, 103.1, 104.1, 105.1, 106.1];
        let fx = Fixture::new(opens, highs, lows, closes);
        let ctx = fx.ctx(1.0, false);
        let sig = detect_micro_channel(&ctx, Side::Buy).expect("micro channel should fire");
        assert_eq!(sig.family, PatternFamily::MicroChannel);
    }

    #[test]
    fn detect_micro_channel_rejects_mixed_direction() {
        let opens = vec![100.0, 101.0, 99.0, 103.0, 99.0, 105.0];
        let highs = vec![101.2, 102.2, 101.0, 104.2, 101.0, 106.2];
        let lows = vec![99.8, 100.9, 97.0, 102.9, 97.0, 104.9];
        let closes = vec![101.1, 99.0, 101.0, 99.0, 101.0, 106.1];
        let fx = Fixture::new(opens, highs, lows, closes);
        let ctx = fx.ctx(1.0, false);
        assert!(detect_micro_channel(&ctx, Side::Buy).is_none());
    }

    #[test]
    fn detect_trend_bar_fires_when_aligned_with_state() {
        let mut fx = Fixture::new(
            vec![100.0, 101.0],
            vec![101.2, 103.0],
            vec![99.8, 100.9],
            vec![101.1, 102.8],
        );
        fx.market_state.trend_direction = Some(true);
        let ctx = fx.ctx(1.0, false);
        let sig = detect_trend_bar(&ctx, Side::Buy).expect("trend bar should fire");
        assert_eq!(sig.family, PatternFamily::TrendBar);
    }

    #[test]
    fn detect_trend_bar_rejects_against_state() {
        let mut fx = Fixture::new(
            vec![100.0, 101.0],
            vec![101.2, 103.0],
            vec![99.8, 100.9],
            vec![101.1, 102.8],
        );
        fx.market_state.trend_direction = Some(false);
        let ctx = fx.ctx(1.0, false);
        assert!(detect_trend_bar(&ctx, Side::Buy).is_none());
    }

    #[test]
    fn detect_gap_bar_fires_long_on_open_above_prior_high() {
        let fx = Fixture::new(
            vec![100.0, 103.0],
            vec![101.0, 105.0],
            vec![99.0, 102.8],
            vec![100.5, 104.8],
        );
        let ctx = fx.ctx(1.0, false);
        let sig = detect_gap_bar(&ctx, Side::Buy).expect("gap bar should fire");
        assert_eq!(sig.family, PatternFamily::GapBar);
    }

    #[test]
    fn detect_gap_bar_rejects_without_gap() {
        let fx = Fixture::new(
            vec![100.0, 100.5],
            vec![101.0, 101.5],
            vec![99.0, 99.8],
            vec![100.5, 101.2],
        );
        let ctx = fx.ctx(1.0, false);
        assert!(detect_gap_bar(&ctx, Side::Buy).is_none());
    }

    #[test]
    fn detect_outside_bar_fires_in_trading_range() {
        let mut fx = Fixture::new(
            vec![100.0, 98.0],
            vec![101.0, 104.0],
            vec![99.0, 96.0],
            vec![100.5, 103.5],
        );
        fx.market_state.state = crate::constants::MarketState::TradingRange;
        let ctx = fx.ctx(1.0, false);
        let sig = detect_outside_bar(&ctx, Side::Buy).expect("outside bar should fire");
        assert_eq!(sig.family, PatternFamily::OutsideBar);
    }

    #[test]
    fn detect_outside_bar_blocked_outside_reversal_states() {
        let mut fx = Fixture::new(
            vec![100.0, 98.0],
            vec![101.0, 104.0],
            vec![99.0, 96.0],
            vec![100.5, 103.5],
        );
        fx.market_state.state = crate::constants::MarketState::StrongTrend;
        let ctx = fx.ctx(1.0, false);
        assert!(detect_outside_bar(&ctx, Side::Buy).is_none());
    }

    #[test]
    fn detect_ii_fires_on_breakout_above_two_inside_bars() {
        // base bar, then two progressively tighter inside bars, then a
        // breakout bar closing above the first inside bar's high.
        let opens = vec![100.0, 101.0, 101.2, 103.5];
        let highs = vec![105.0, 103.0, 102.5, 104.0];
        let lows = vec![95.0, 99.0, 100.0, 102.8];
        let closes = vec![101.0, 101.5, 101.8, 103.9];
        let fx = Fixture::new(opens, highs, lows, closes);
        let ctx = fx.ctx(1.0, false);
        let sig = detect_ii(&ctx, Side::Buy).expect("ii breakout should fire");
        assert_eq!(sig.family, PatternFamily::Ii);
    }

    #[test]
    fn detect_ii_rejects_without_two_inside_bars() {
        let opens = vec![100.0, 101.0, 106.0, 103.5];
        let highs = vec![105.0, 103.0, 110.0, 104.0];
        let lows = vec![95.0, 99.0, 104.0, 102.8];
        let closes = vec![101.0, 101.5, 109.0, 103.9];
        let fx = Fixture::new(opens, highs, lows, closes);
        let ctx = fx.ctx(1.0, false);
        assert!(detect_ii(&ctx, Side::Buy).is_none());
    }
}
