//! Al Brooks pattern detectors (spec.md §4.F).
//!
//! Each family exposes a `detect_<family>(ctx, side) -> Option<Signal>`
//! function. [`scan`] walks [`crate::constants::DETECTOR_PRIORITY`] in order
//! and returns the first family that fires for the requested side — the H2
//! and L2 families are resolved upstream by
//! [`crate::state_machines`] and passed in through the context rather than
//! re-derived here, since they carry their own multi-bar FSM state.

mod bar_patterns;
mod breakout;
mod reversal;

use crate::constants::{PatternFamily, Side, SignalCycle, DETECTOR_PRIORITY};
use crate::filters::MeasuringGapTracker;
use crate::hl_counter::HlCounter;
use crate::market_state::MarketStateTracker;
use crate::state_machines::{H2Signal, L2Signal};
use crate::swing_tracker::SwingTracker;

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct Signal {
    pub family: PatternFamily,
    pub side: Side,
    pub entry: f64,
    pub stop_hint: Option<f64>,
    pub cycle: SignalCycle,
}

/// Bundles every piece of state a detector might need to read. Detectors
/// never mutate this — all trackers update once per bar, upstream of the
/// scan.
pub struct PatternContext<'a> {
    pub opens: &'a [f64],
    pub highs: &'a [f64],
    pub lows: &'a [f64],
    pub closes: &'a [f64],
    pub ema: &'a [f64],
    pub atr: f64,
    pub swings: &'a SwingTracker,
    pub hl: &'a HlCounter,
    pub market_state: &'a MarketStateTracker,
    pub measuring_gap: &'a MeasuringGapTracker,
    pub is_ttr: bool,
    pub h1_signal: Option<H2Signal>,
    pub h2_signal: Option<H2Signal>,
    pub l1_signal: Option<L2Signal>,
    pub l2_signal: Option<L2Signal>,
}

impl<'a> PatternContext<'a> {
    fn n(&self) -> usize {
        self.closes.len()
    }

    fn last(&self) -> usize {
        self.n().saturating_sub(1)
    }

    fn relaxed(&self) -> bool {
        self.is_ttr
    }
}

/// Scan all families in priority order for `side`, returning the first hit.
pub fn scan(ctx: &PatternContext, side: Side) -> Option<Signal> {
    if ctx.n() < 5 || ctx.atr <= 0.0 {
        return None;
    }
    for family in DETECTOR_PRIORITY {
        let hit = match family {
            PatternFamily::Spike => bar_patterns::detect_spike(ctx, side),
            PatternFamily::MicroChannel => bar_patterns::detect_micro_channel(ctx, side),
            PatternFamily::H1 => detect_h1_h2(ctx, side),
            PatternFamily::BreakoutPullback => breakout::detect_breakout_pullback(ctx, side),
            PatternFamily::TrendBar => bar_patterns::detect_trend_bar(ctx, side),
            PatternFamily::GapBar => bar_patterns::detect_gap_bar(ctx, side),
            PatternFamily::TrBreakout => breakout::detect_tr_breakout(ctx, side),
            PatternFamily::Climax => reversal::detect_climax(ctx, side),
            PatternFamily::Wedge => reversal::detect_wedge(ctx, side),
            PatternFamily::Mtr => reversal::detect_mtr(ctx, side),
            PatternFamily::FailedBreakout => breakout::detect_failed_breakout(ctx, side),
            PatternFamily::DoubleTopBottom => reversal::detect_double_top_bottom(ctx, side),
            PatternFamily::OutsideBar => bar_patterns::detect_outside_bar(ctx, side),
            PatternFamily::ReversalBar => reversal::detect_reversal_bar(ctx, side),
            PatternFamily::Ii => bar_patterns::detect_ii(ctx, side),
            PatternFamily::MeasuredMove => breakout::detect_measured_move(ctx, side),
            // FinalFlag is evaluated separately against the market-state
            // tracker's own FinalFlag direction rather than through the
            // generic priority scan.
            PatternFamily::FinalFlag | PatternFamily::L1 | PatternFamily::L2 | PatternFamily::H2 => None,
        };
        if hit.is_some() {
            return hit;
        }
    }
    breakout::detect_final_flag(ctx, side)
}

fn detect_h1_h2(ctx: &PatternContext, side: Side) -> Option<Signal> {
    match side {
        Side::Buy => ctx
            .h2_signal
            .map(|s| Signal {
                family: PatternFamily::H2,
                side,
                entry: s.entry,
                stop_hint: Some(s.stop),
                cycle: SignalCycle::None,
            })
            .or_else(|| {
                ctx.h1_signal.map(|s| Signal {
                    family: PatternFamily::H1,
                    side,
                    entry: s.entry,
                    stop_hint: Some(s.stop),
                    cycle: SignalCycle::None,
                })
            }),
        Side::Sell => ctx
            .l2_signal
            .map(|s| Signal {
                family: PatternFamily::L2,
                side,
                entry: s.entry,
                stop_hint: Some(s.stop),
                cycle: SignalCycle::None,
            })
            .or_else(|| {
                ctx.l1_signal.map(|s| Signal {
                    family: PatternFamily::L1,
                    side,
                    entry: s.entry,
                    stop_hint: Some(s.stop),
                    cycle: SignalCycle::None,
                })
            }),
    }
}
