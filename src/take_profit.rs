//! Take-profit target computation (spec.md §4.I, §4.K).
//!
//! TP1 is always the 1:1 scalp target. TP2 prefers a measured-move
//! projection off an active measuring gap, falls back to the opposing edge
//! of a trading range, and is floored at a per-family R-multiple either way
//! so a weak measured-move leg can never shrink the second target below the
//! minimum reward the position was taken for. `resolve_tp2` layers two
//! state-dependent adjustments on top of the per-family floor: TightChannel
//! extends TP2 to at least 3R, and a climax signal bar tightens it back down
//! to at most 1.5R while pulling more size off at TP1.

use crate::constants::{
    MarketState, PatternFamily, Side, CLIMAX_SIGNAL_BAR_RANGE_MULT, CLIMAX_TP1_CLOSE_RATIO,
    CLIMAX_TP2_MAX_R, DEFAULT_TP1_CLOSE_RATIO, TIGHT_CHANNEL_TP2_MIN_R,
};
use crate::filters::MeasuringGapTracker;

pub fn tp1(side: Side, entry: f64, stop: f64) -> f64 {
    let risk = (entry - stop).abs();
    match side {
        Side::Buy => entry + risk,
        Side::Sell => entry - risk,
    }
}

/// Entry/TP2 R-multiple floor per pattern family (spec.md §4.K). Families
/// not named explicitly fall back to the default 1.5R used by the original
/// (pre-family-aware) `tp2`.
pub fn family_r_multiples(family: PatternFamily) -> (f64, f64) {
    match family {
        PatternFamily::Spike => (1.0, 2.5),
        PatternFamily::FailedBreakout => (0.8, 1.5),
        PatternFamily::Climax => (1.2, 3.0),
        PatternFamily::Wedge => (1.0, 2.5),
        PatternFamily::H2 | PatternFamily::L2 => (0.8, 2.0),
        PatternFamily::H1 | PatternFamily::L1 => (0.8, 1.8),
        _ => (1.0, 1.5),
    }
}

#[allow(clippy::too_many_arguments)]
pub fn tp2_with_r(
    side: Side,
    entry: f64,
    stop: f64,
    state: MarketState,
    measuring_gap: &MeasuringGapTracker,
    tr_high: f64,
    tr_low: f64,
    r_mult: f64,
) -> f64 {
    let risk = (entry - stop).abs();
    let floor = match side {
        Side::Buy => entry + risk * r_mult,
        Side::Sell => entry - risk * r_mult,
    };

    let candidate = if measuring_gap.active {
        let leg = (measuring_gap.origin_price - measuring_gap.leg_start_price).abs();
        match side {
            Side::Buy => measuring_gap.origin_price + leg,
            Side::Sell => measuring_gap.origin_price - leg,
        }
    } else if state == MarketState::TradingRange && tr_high > tr_low {
        match side {
            Side::Buy => tr_high,
            Side::Sell => tr_low,
        }
    } else {
        floor
    };

    match side {
        Side::Buy => candidate.max(floor),
        Side::Sell => candidate.min(floor),
    }
}

/// Legacy 1.5R-floor TP2, kept for callers that don't yet carry a pattern
/// family (e.g. manual/backtest targets).
#[allow(clippy::too_many_arguments)]
pub fn tp2(
    side: Side,
    entry: f64,
    stop: f64,
    state: MarketState,
    measuring_gap: &MeasuringGapTracker,
    tr_high: f64,
    tr_low: f64,
) -> f64 {
    tp2_with_r(side, entry, stop, state, measuring_gap, tr_high, tr_low, 1.5)
}

/// Full TP2 + TP1-close-ratio resolution for a live signal (spec.md §4.K).
///
/// Applies the family floor, then widens it to at least
/// [`TIGHT_CHANNEL_TP2_MIN_R`] when the market is in a tight channel, then
/// (independently) tightens it to at most [`CLIMAX_TP2_MAX_R`] and raises the
/// TP1 close ratio to [`CLIMAX_TP1_CLOSE_RATIO`] when the signal bar itself
/// is a climax bar (range at least [`CLIMAX_SIGNAL_BAR_RANGE_MULT`] times the
/// trailing 10-bar average range). Both adjustments can apply to the same
/// signal; the climax tightening is evaluated last since a climax entry
/// caps risk regardless of how far the channel extension would otherwise
/// push the target.
#[allow(clippy::too_many_arguments)]
pub fn resolve_tp2(
    family: PatternFamily,
    side: Side,
    entry: f64,
    stop: f64,
    state: MarketState,
    measuring_gap: &MeasuringGapTracker,
    tr_high: f64,
    tr_low: f64,
    signal_bar_range: f64,
    avg_range_10: f64,
) -> (f64, f64) {
    let (_, base_r) = family_r_multiples(family);
    let mut r_mult = base_r;

    if state == MarketState::TightChannel {
        r_mult = r_mult.max(TIGHT_CHANNEL_TP2_MIN_R);
    }

    let mut tp1_close_ratio = DEFAULT_TP1_CLOSE_RATIO;
    let is_climax_bar = avg_range_10 > 0.0 && signal_bar_range >= CLIMAX_SIGNAL_BAR_RANGE_MULT * avg_range_10;
    if is_climax_bar {
        r_mult = r_mult.min(CLIMAX_TP2_MAX_R);
        tp1_close_ratio = CLIMAX_TP1_CLOSE_RATIO;
    }

    let target = tp2_with_r(side, entry, stop, state, measuring_gap, tr_high, tr_low, r_mult);
    (target, tp1_close_ratio)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tp1_is_one_to_one() {
        assert_eq!(tp1(Side::Buy, 100.0, 98.0), 102.0);
        assert_eq!(tp1(Side::Sell, 100.0, 102.0), 98.0);
    }

    #[test]
    fn tp2_floors_at_one_point_five_r_without_structure() {
        let gap = MeasuringGapTracker::new();
        let target = tp2(Side::Buy, 100.0, 98.0, MarketState::Channel, &gap, 0.0, 0.0);
        assert_eq!(target, 103.0);
    }

    #[test]
    fn tp2_uses_trading_range_opposite_edge_when_further_than_floor() {
        let gap = MeasuringGapTracker::new();
        let target = tp2(Side::Buy, 100.0, 99.0, MarketState::TradingRange, &gap, 110.0, 95.0);
        assert_eq!(target, 110.0);
    }

    #[test]
    fn tp2_never_drops_below_floor_even_with_weak_structure() {
        let gap = MeasuringGapTracker::new();
        // trading-range high is below the 1.5R floor; floor wins.
        let target = tp2(Side::Buy, 100.0, 99.0, MarketState::TradingRange, &gap, 100.5, 95.0);
        assert_eq!(target, 101.5);
    }

    #[test]
    fn family_table_matches_spec() {
        assert_eq!(family_r_multiples(PatternFamily::Spike), (1.0, 2.5));
        assert_eq!(family_r_multiples(PatternFamily::FailedBreakout), (0.8, 1.5));
        assert_eq!(family_r_multiples(PatternFamily::Climax), (1.2, 3.0));
        assert_eq!(family_r_multiples(PatternFamily::Wedge), (1.0, 2.5));
        assert_eq!(family_r_multiples(PatternFamily::H2), (0.8, 2.0));
        assert_eq!(family_r_multiples(PatternFamily::L2), (0.8, 2.0));
        assert_eq!(family_r_multiples(PatternFamily::H1), (0.8, 1.8));
        assert_eq!(family_r_multiples(PatternFamily::L1), (0.8, 1.8));
        assert_eq!(family_r_multiples(PatternFamily::TrendBar), (1.0, 1.5));
    }

    #[test]
    fn resolve_tp2_extends_in_tight_channel() {
        let gap = MeasuringGapTracker::new();
        let (target, ratio) = resolve_tp2(
            PatternFamily::H1,
            Side::Buy,
            100.0,
            99.0,
            MarketState::TightChannel,
            &gap,
            0.0,
            0.0,
            1.0,
            1.0,
        );
        // base floor for H1 is 1.8R = 101.8; tight channel extends to >= 3R = 103.0
        assert_eq!(target, 103.0);
        assert_eq!(ratio, DEFAULT_TP1_CLOSE_RATIO);
    }

    #[test]
    fn resolve_tp2_tightens_on_climax_signal_bar() {
        let gap = MeasuringGapTracker::new();
        let (target, ratio) = resolve_tp2(
            PatternFamily::Wedge,
            Side::Buy,
            100.0,
            98.0,
            MarketState::Channel,
            &gap,
            0.0,
            0.0,
            4.0, // 4x the 10-bar average range => climax bar
            1.0,
        );
        // wedge base floor is 2.5R = 105.0, climax caps at 1.5R = 103.0
        assert_eq!(target, 103.0);
        assert_eq!(ratio, CLIMAX_TP1_CLOSE_RATIO);
    }

    #[test]
    fn resolve_tp2_climax_overrides_tight_channel_extension() {
        let gap = MeasuringGapTracker::new();
        let (target, ratio) = resolve_tp2(
            PatternFamily::H1,
            Side::Buy,
            100.0,
            99.0,
            MarketState::TightChannel,
            &gap,
            0.0,
            0.0,
            5.0,
            1.0,
        );
        // channel pushes floor to 3R, but climax then caps at 1.5R = 101.5
        assert_eq!(target, 101.5);
        assert_eq!(ratio, CLIMAX_TP1_CLOSE_RATIO);
    }
}
