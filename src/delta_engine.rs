//! Order-flow delta engine (spec.md §4.H).
//!
//! Aggregates trade prints over a fixed sliding window with O(1) incremental
//! volume accounting and O(k) batch eviction, and derives a delta-ratio
//! trend label plus absorption / climax / liquidity-withdrawal anomaly
//! flags consumed by the signal pipeline's confidence scoring.

use std::collections::VecDeque;
use std::time::Duration;

use crate::constants::{
    Side, DELTA_ABSORPTION_PRICE_PCT, DELTA_ABSORPTION_RATIO, DELTA_ABSORPTION_VOLUME_MULT,
    DELTA_CLEANUP_BATCH_SIZE, DELTA_HISTORY_SIZE, DELTA_STRONG_THRESHOLD,
    DELTA_WITHDRAWAL_MISMATCH, DELTA_WITHDRAWAL_PRICE_PCT,
};

#[derive(Debug, Clone, Copy)]
pub struct Trade {
    pub price: f64,
    pub qty: f64,
    pub is_buyer_maker: bool,
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum DeltaTrend {
    StrongBuy,
    Buy,
    Neutral,
    Sell,
    StrongSell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum DeltaAnomaly {
    /// Heavy opposite-side volume absorbed with minimal price progress.
    Absorption,
    /// A sudden volume spike accompanying an extreme price move.
    Climax,
    /// Volume drying up into a stalling price — liquidity pulled before a
    /// reversal.
    LiquidityWithdrawal,
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct DeltaSnapshot {
    pub buy_volume: f64,
    pub sell_volume: f64,
    pub delta: f64,
    pub delta_ratio: f64,
    /// Delta-ratio over just the trailing window/5 slice of trades, used as
    /// a confirming (not primary) alignment signal in trend scoring.
    pub short_delta_ratio: f64,
    pub trend: DeltaTrend,
    pub acceleration: f64,
    pub anomaly: Option<DeltaAnomaly>,
}

/// Sliding window of recent trade prints keyed off the kline interval: the
/// window spans one interval's worth of trading so the delta reflects "this
/// bar's" order flow.
pub struct DeltaEngine {
    window: Duration,
    trades: VecDeque<Trade>,
    buy_volume: f64,
    sell_volume: f64,
    delta_ratio_history: VecDeque<f64>,
    price_history: VecDeque<f64>,
}

impl DeltaEngine {
    pub fn new(kline_interval_secs: u64) -> Self {
        Self {
            window: Duration::from_secs(kline_interval_secs.max(1)),
            trades: VecDeque::new(),
            buy_volume: 0.0,
            sell_volume: 0.0,
            delta_ratio_history: VecDeque::with_capacity(DELTA_HISTORY_SIZE),
            price_history: VecDeque::with_capacity(DELTA_HISTORY_SIZE),
        }
    }

    pub fn add_trade(&mut self, trade: Trade) {
        if trade.is_buyer_maker {
            // buyer is maker => aggressor sold into the bid.
            self.sell_volume += trade.qty;
        } else {
            self.buy_volume += trade.qty;
        }
        self.trades.push_back(trade);
        self.evict(trade.timestamp_ms);
    }

    pub fn add_trades_batch(&mut self, trades: impl IntoIterator<Item = Trade>) {
        for t in trades {
            self.add_trade(t);
        }
    }

    fn evict(&mut self, now_ms: i64) {
        let cutoff = now_ms - self.window.as_millis() as i64;
        let mut evicted = 0usize;
        while let Some(front) = self.trades.front() {
            if front.timestamp_ms >= cutoff {
                break;
            }
            let t = self.trades.pop_front().unwrap();
            if t.is_buyer_maker {
                self.sell_volume = (self.sell_volume - t.qty).max(0.0);
            } else {
                self.buy_volume = (self.buy_volume - t.qty).max(0.0);
            }
            evicted += 1;
            if evicted >= DELTA_CLEANUP_BATCH_SIZE {
                break;
            }
        }
    }

    /// Compute the current snapshot given the bar's current price.
    pub fn snapshot(&mut self, current_price: f64) -> DeltaSnapshot {
        let total = self.buy_volume + self.sell_volume;
        let delta = self.buy_volume - self.sell_volume;
        let delta_ratio = if total > 0.0 { delta / total } else { 0.0 };

        self.delta_ratio_history.push_back(delta_ratio);
        if self.delta_ratio_history.len() > DELTA_HISTORY_SIZE {
            self.delta_ratio_history.pop_front();
        }
        self.price_history.push_back(current_price);
        if self.price_history.len() > DELTA_HISTORY_SIZE {
            self.price_history.pop_front();
        }

        let acceleration = self.acceleration();
        let short_delta_ratio = self.short_delta_ratio();
        let trend = Self::classify_trend(delta_ratio, acceleration, short_delta_ratio);
        let anomaly = self.detect_anomaly(delta_ratio, total, current_price);

        DeltaSnapshot {
            buy_volume: self.buy_volume,
            sell_volume: self.sell_volume,
            delta,
            delta_ratio,
            short_delta_ratio,
            trend,
            acceleration,
            anomaly,
        }
    }

    /// Delta-ratio over the trailing window/5 slice, computed with a single
    /// reverse pass from the tail of the trade deque so it doesn't require a
    /// second windowed accumulator.
    fn short_delta_ratio(&self) -> f64 {
        let Some(last) = self.trades.back() else {
            return 0.0;
        };
        let short_window_ms = (self.window.as_millis() as i64 / 5).max(1);
        let cutoff = last.timestamp_ms - short_window_ms;

        let mut buy = 0.0;
        let mut sell = 0.0;
        for t in self.trades.iter().rev() {
            if t.timestamp_ms < cutoff {
                break;
            }
            if t.is_buyer_maker {
                sell += t.qty;
            } else {
                buy += t.qty;
            }
        }
        let total = buy + sell;
        if total > 0.0 {
            (buy - sell) / total
        } else {
            0.0
        }
    }

    /// Recent-5 vs prior-5 delta-ratio average — a cheap proxy for whether
    /// buying/selling pressure is building or fading.
    fn acceleration(&self) -> f64 {
        let h: Vec<f64> = self.delta_ratio_history.iter().copied().collect();
        let n = h.len();
        if n < 10 {
            return 0.0;
        }
        let recent: f64 = h[n - 5..].iter().sum::<f64>() / 5.0;
        let prior: f64 = h[n - 10..n - 5].iter().sum::<f64>() / 5.0;
        recent - prior
    }

    fn classify_trend(delta_ratio: f64, acceleration: f64, short_delta_ratio: f64) -> DeltaTrend {
        let mut score = delta_ratio;
        if acceleration.abs() > 0.1 {
            score += acceleration.signum() * 0.2;
        }
        if short_delta_ratio.signum() == delta_ratio.signum() && short_delta_ratio != 0.0 {
            score += delta_ratio.signum() * 0.1;
        }
        if score >= DELTA_STRONG_THRESHOLD {
            DeltaTrend::StrongBuy
        } else if score >= 0.3 {
            DeltaTrend::Buy
        } else if score <= -DELTA_STRONG_THRESHOLD {
            DeltaTrend::StrongSell
        } else if score <= -0.3 {
            DeltaTrend::Sell
        } else {
            DeltaTrend::Neutral
        }
    }

    fn detect_anomaly(&self, delta_ratio: f64, total_volume: f64, current_price: f64) -> Option<DeltaAnomaly> {
        let prices: Vec<f64> = self.price_history.iter().copied().collect();
        if prices.len() < 2 {
            return None;
        }
        let first = prices[0];
        if first == 0.0 {
            return None;
        }
        let price_move_pct = (current_price - first).abs() / first;

        let avg_volume = if !prices.is_empty() {
            total_volume / prices.len() as f64
        } else {
            total_volume
        };

        // Climax: an extreme volume spike with a large accompanying move.
        if avg_volume > 0.0
            && total_volume > avg_volume * DELTA_ABSORPTION_VOLUME_MULT
            && price_move_pct >= DELTA_WITHDRAWAL_PRICE_PCT
        {
            return Some(DeltaAnomaly::Climax);
        }

        // Absorption: strong one-sided delta and a volume spike, but price
        // barely moved — the opposite side absorbed it.
        if delta_ratio.abs() >= DELTA_ABSORPTION_RATIO
            && price_move_pct <= DELTA_ABSORPTION_PRICE_PCT
            && avg_volume > 0.0
            && total_volume >= avg_volume * DELTA_ABSORPTION_VOLUME_MULT
        {
            return Some(DeltaAnomaly::Absorption);
        }

        // Liquidity withdrawal: price moved meaningfully while delta stayed
        // muted — the order book thinned rather than got run over.
        if price_move_pct >= DELTA_WITHDRAWAL_PRICE_PCT && delta_ratio.abs() <= DELTA_WITHDRAWAL_MISMATCH {
            return Some(DeltaAnomaly::LiquidityWithdrawal);
        }

        None
    }
}

/// Delta-to-signal modifier (spec.md §4.I / §4.J step 8).
///
/// Folds the order-flow snapshot into a multiplier applied to a candidate
/// signal's strength, plus a short human-readable reason for the decision
/// log. A multiplier of `0.0` vetoes the signal outright.
pub fn get_signal_modifier(
    snapshot: &DeltaSnapshot,
    side: Side,
    price_change_pct: f64,
) -> (f64, &'static str) {
    let side_sign = match side {
        Side::Buy => 1.0,
        Side::Sell => -1.0,
    };
    let delta_sign = snapshot.delta_ratio.signum();
    let opposes_side = delta_sign != 0.0 && delta_sign != side_sign;

    // Extreme opposite delta accelerating further away vetoes the signal.
    if opposes_side
        && snapshot.delta_ratio.abs() > 0.5
        && snapshot.acceleration.signum() == delta_sign
        && snapshot.acceleration.abs() > 0.1
    {
        return (0.0, "extreme opposite delta accelerating against side");
    }

    if let Some(anomaly) = snapshot.anomaly {
        match anomaly {
            DeltaAnomaly::Absorption if opposes_side => {
                return (0.4, "absorption against side");
            }
            DeltaAnomaly::LiquidityWithdrawal => {
                // Withdrawal favors the side price is moving away from,
                // i.e. it is mildly bearish on the move's continuation
                // regardless of which side we're on.
                let moving_with_side = price_change_pct.signum() == side_sign;
                let mult = if moving_with_side { 0.6 } else { 0.8 };
                return (mult, "liquidity withdrawal");
            }
            _ => {}
        }
    }

    let aligned = delta_sign == side_sign;
    let mut multiplier = 1.0;
    let mut boosted = false;
    if aligned {
        multiplier *= 1.2;
        boosted = true;
    }
    if snapshot.acceleration.signum() == side_sign && snapshot.acceleration.abs() > 0.1 {
        multiplier *= 1.1;
        boosted = true;
    }

    if boosted {
        (multiplier, "aligned order flow")
    } else {
        (1.0, "neutral order flow")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trade(price: f64, qty: f64, maker: bool, ts: i64) -> Trade {
        Trade {
            price,
            qty,
            is_buyer_maker: maker,
            timestamp_ms: ts,
        }
    }

    #[test]
    fn buy_heavy_flow_classified_strong_buy() {
        let mut e = DeltaEngine::new(60);
        for i in 0..20 {
            e.add_trade(trade(100.0, 10.0, false, i * 100));
        }
        let snap = e.snapshot(100.0);
        assert_eq!(snap.trend, DeltaTrend::StrongBuy);
        assert!(snap.delta > 0.0);
    }

    #[test]
    fn eviction_clamps_to_non_negative() {
        let mut e = DeltaEngine::new(1); // 1 second window
        e.add_trade(trade(100.0, 5.0, false, 0));
        e.add_trade(trade(100.0, 5.0, false, 5000)); // far outside window, evicts first
        assert!(e.buy_volume >= 0.0);
    }

    #[test]
    fn empty_engine_neutral_snapshot() {
        let mut e = DeltaEngine::new(60);
        let snap = e.snapshot(100.0);
        assert_eq!(snap.trend, DeltaTrend::Neutral);
        assert!(snap.anomaly.is_none());
        assert_eq!(snap.short_delta_ratio, 0.0);
    }

    #[test]
    fn short_delta_ratio_reflects_trailing_slice_only() {
        // window/5 with a 100s window is 20s; trades older than that should
        // not count toward the short-window ratio even though they're still
        // inside the full window.
        let mut e = DeltaEngine::new(100);
        for i in 0..5 {
            e.add_trade(trade(100.0, 10.0, true, i * 1000)); // sells, old
        }
        for i in 0..5 {
            e.add_trade(trade(100.0, 10.0, false, 90_000 + i * 1000)); // buys, recent
        }
        let snap = e.snapshot(100.0);
        assert!(snap.short_delta_ratio > 0.9);
    }

    fn neutral_snapshot() -> DeltaSnapshot {
        DeltaSnapshot {
            buy_volume: 0.0,
            sell_volume: 0.0,
            delta: 0.0,
            delta_ratio: 0.0,
            short_delta_ratio: 0.0,
            trend: DeltaTrend::Neutral,
            acceleration: 0.0,
            anomaly: None,
        }
    }

    #[test]
    fn modifier_boosts_aligned_accelerating_trend() {
        let snap = DeltaSnapshot {
            delta_ratio: 0.6,
            acceleration: 0.2,
            trend: DeltaTrend::StrongBuy,
            ..neutral_snapshot()
        };
        let (mult, _) = get_signal_modifier(&snap, Side::Buy, 0.1);
        assert!((mult - 1.32).abs() < 1e-9);
    }

    #[test]
    fn modifier_penalizes_absorption_against_side() {
        let snap = DeltaSnapshot {
            delta_ratio: 0.45,
            anomaly: Some(DeltaAnomaly::Absorption),
            ..neutral_snapshot()
        };
        let (mult, reason) = get_signal_modifier(&snap, Side::Sell, 0.01);
        assert_eq!(mult, 0.4);
        assert_eq!(reason, "absorption against side");
    }

    #[test]
    fn modifier_vetoes_extreme_accelerating_opposite_delta() {
        let snap = DeltaSnapshot {
            delta_ratio: -0.7,
            acceleration: -0.3,
            trend: DeltaTrend::StrongSell,
            ..neutral_snapshot()
        };
        let (mult, _) = get_signal_modifier(&snap, Side::Buy, 0.2);
        assert_eq!(mult, 0.0);
    }

    #[test]
    fn modifier_neutral_when_nothing_notable() {
        let snap = neutral_snapshot();
        let (mult, reason) = get_signal_modifier(&snap, Side::Buy, 0.0);
        assert_eq!(mult, 1.0);
        assert_eq!(reason, "neutral order flow");
    }
}
