//! Unified stop-loss placement rule (spec.md §4.K).
//!
//! Strong-trend entries use the last two bars' extreme (a tight, momentum
//! stop); every other market state prefers the nearest confirmed swing point
//! so the stop sits beyond genuine structure, falling back to the two-bar
//! rule when the swing is too far away. Either way the final distance from
//! entry is checked against the `MAX_STOP_ATR_MULT` hard cap: a stop still
//! beyond it rejects the signal rather than being silently clamped. A
//! soft-stop mode can additionally require a confirming close beyond the
//! level rather than an intrabar touch.

use crate::constants::{MarketState, Side, MAX_STOP_ATR_MULT, MIN_BUFFER_ATR_MULT, SOFT_STOP_CONFIRM_BARS};
use crate::swing_tracker::SwingTracker;

/// `spread` is the live bid-ask spread in price units, folded into the
/// buffer so the stop clears the spread as well as ATR noise.
pub fn compute_stop(
    side: Side,
    entry: f64,
    state: MarketState,
    highs: &[f64],
    lows: &[f64],
    swings: &SwingTracker,
    atr: f64,
    spread: f64,
) -> Option<f64> {
    if atr <= 0.0 || highs.len() < 2 {
        return Some(fallback_stop(side, entry, atr));
    }

    let buffer = stop_buffer(atr, spread);
    let n = highs.len();
    let last2_low = lows[n - 2].min(lows[n - 1]);
    let last2_high = highs[n - 2].max(highs[n - 1]);
    let two_bar_stop = match side {
        Side::Buy => last2_low - buffer,
        Side::Sell => last2_high + buffer,
    };

    let raw = if state == MarketState::StrongTrend {
        two_bar_stop
    } else {
        let swing_stop = match side {
            Side::Buy => {
                let sw = swings.recent_swing_low(1, true);
                if sw > 0.0 { Some(sw - buffer) } else { None }
            }
            Side::Sell => {
                let sw = swings.recent_swing_high(1, true);
                if sw > 0.0 { Some(sw + buffer) } else { None }
            }
        };
        match swing_stop {
            Some(s) if distance(side, entry, s) <= atr * MAX_STOP_ATR_MULT => s,
            // Swing is missing or too far away: fall back to the two-bar rule.
            _ => two_bar_stop,
        }
    };

    cap_or_reject(side, entry, raw, atr)
}

/// `max(0.3·ATR, MIN_BUFFER_ATR_MULT·ATR) + spread` (spec.md §4.K).
fn stop_buffer(atr: f64, spread: f64) -> f64 {
    (atr * 0.3).max(atr * MIN_BUFFER_ATR_MULT) + spread
}

fn fallback_stop(side: Side, entry: f64, atr: f64) -> f64 {
    let dist = if atr > 0.0 { atr } else { entry * 0.01 };
    match side {
        Side::Buy => entry - dist,
        Side::Sell => entry + dist,
    }
}

fn distance(side: Side, entry: f64, stop: f64) -> f64 {
    match side {
        Side::Buy => entry - stop,
        Side::Sell => stop - entry,
    }
}

/// Reject (`None`) rather than clamp when the stop is still beyond the hard
/// cap after the unified rule's own fallback — used both for the swing/
/// two-bar result above and for detector-supplied stop hints, which
/// otherwise never see a cap at all.
pub fn cap_or_reject(side: Side, entry: f64, raw_stop: f64, atr: f64) -> Option<f64> {
    let max_dist = atr * MAX_STOP_ATR_MULT;
    if distance(side, entry, raw_stop) > max_dist {
        None
    } else {
        Some(raw_stop)
    }
}

/// Soft-stop confirmation: rather than exiting on the first intrabar touch
/// of the stop level, require `SOFT_STOP_CONFIRM_BARS` consecutive closes
/// beyond it. `closes` is the most recent closed-bar history (oldest first).
pub fn soft_stop_confirmed(side: Side, stop: f64, closes: &[f64]) -> bool {
    if closes.len() < SOFT_STOP_CONFIRM_BARS {
        return false;
    }
    let tail = &closes[closes.len() - SOFT_STOP_CONFIRM_BARS..];
    tail.iter().all(|&c| match side {
        Side::Buy => c < stop,
        Side::Sell => c > stop,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strong_trend_uses_last_two_bars() {
        let swings = SwingTracker::new();
        let highs = vec![10.0, 10.5, 11.0, 11.5];
        let lows = vec![9.0, 9.5, 10.2, 10.6];
        let stop = compute_stop(Side::Buy, 11.5, MarketState::StrongTrend, &highs, &lows, &swings, 1.0, 0.0).unwrap();
        assert!(stop < 10.6);
        assert!(stop > 10.6 - 1.0);
    }

    #[test]
    fn stop_beyond_hard_cap_rejects_the_signal() {
        let swings = SwingTracker::new();
        let highs = vec![10.0, 100.0];
        let lows = vec![9.0, -50.0];
        let stop = compute_stop(Side::Buy, 100.0, MarketState::StrongTrend, &highs, &lows, &swings, 1.0, 0.0);
        assert_eq!(stop, None);
    }

    #[test]
    fn cap_or_reject_allows_a_stop_within_the_cap() {
        let stop = cap_or_reject(Side::Buy, 100.0, 98.0, 1.0);
        assert_eq!(stop, Some(98.0));
    }

    #[test]
    fn cap_or_reject_rejects_a_stop_beyond_the_cap() {
        let stop = cap_or_reject(Side::Buy, 100.0, 96.0, 1.0);
        assert_eq!(stop, None);
    }

    #[test]
    fn spread_widens_the_stop_buffer() {
        let swings = SwingTracker::new();
        let highs = vec![10.0, 10.5, 11.0, 11.5];
        let lows = vec![9.0, 9.5, 10.2, 10.6];
        let tight = compute_stop(Side::Buy, 11.5, MarketState::StrongTrend, &highs, &lows, &swings, 1.0, 0.0).unwrap();
        let wide = compute_stop(Side::Buy, 11.5, MarketState::StrongTrend, &highs, &lows, &swings, 1.0, 0.5).unwrap();
        assert!(wide < tight);
    }

    #[test]
    fn soft_stop_requires_confirming_closes() {
        let closes = vec![10.0, 9.4, 9.3];
        assert!(soft_stop_confirmed(Side::Buy, 9.5, &closes));
        let closes2 = vec![10.0, 9.4, 9.6];
        assert!(!soft_stop_confirmed(Side::Buy, 9.5, &closes2));
    }
}
