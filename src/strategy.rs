// =============================================================================
// Strategy Orchestrator — per-bar Al Brooks signal pipeline
// =============================================================================
//
// Runs once per closed bar for the engine's single tracked symbol:
//   1. Pull the latest closed candles and bail out on a data-quality gate
//      (not enough history, or ATR/EMA undefined).
//   2. Advance every Brooks tracker (swings, H/L counter, market-state
//      classifier, Gap 20, measuring gap, breakout mode, H2/L2 state
//      machines) exactly once.
//   3. Scan both directions for a pattern-family signal.
//   4. Run the signal through the gate stack: signal-bar validity, Gap 20
//      overextension, the HTF hard gate (H2/L2 only), the order-flow delta
//      modifier, signal cooldown, the reversal gate, and the insurance
//      gates.
//   5. Resolve the stop, TP1, and TP2, size the position, and hand back a
//      trade proposal the caller can route to the execution engine.
//
// Every decision — allowed or blocked — is returned as a DecisionEnvelope so
// the caller can audit it regardless of outcome.
// =============================================================================

use std::sync::Arc;

use crate::app_state::AppState;
use crate::constants::{
    MarketState, PatternFamily, Side, SignalCycle, GAP20_OVEREXTEND_BARS, MAX_STOP_ATR_MULT,
    MIN_BARS_FOR_SIGNAL, MIN_BUFFER_ATR_MULT, REVERSAL_THRESHOLD_BREAKOUT_STRONG,
    REVERSAL_THRESHOLD_DEFAULT, REVERSAL_THRESHOLD_TRADING_RANGE,
};
use crate::decision_envelope::DecisionEnvelope;
use crate::delta_engine::get_signal_modifier;
use crate::filters;
use crate::indicators::atr::calculate_atr;
use crate::indicators::ema::calculate_ema;
use crate::market_data::CandleKey;
use crate::patterns::{self, PatternContext, Signal};
use crate::runtime_config::PositionSizingPolicy;
use crate::state_machines::{H2Outcome, L2Outcome};
use crate::stop_loss::compute_stop;
use crate::take_profit::{resolve_tp2, tp1};
use crate::trade_insurance::InsuranceGate;

const STRATEGY_NAME: &str = "brooks_price_action";

/// Everything the execution engine needs to act on a signal, independent of
/// how the orchestrator arrived at it.
#[derive(Debug, Clone)]
pub struct TradeProposal {
    pub symbol: String,
    pub side: String,
    pub family: PatternFamily,
    pub entry_price: f64,
    pub quantity: f64,
    pub stop_loss: f64,
    pub take_profit_1: f64,
    pub take_profit_2: f64,
    pub tp1_close_ratio: f64,
    pub entry_strength: f64,
}

pub struct StrategyEngine;

impl StrategyEngine {
    /// Evaluate the single tracked symbol for one bar and return the
    /// resulting decision, plus a trade proposal if a signal cleared every
    /// gate.
    pub fn evaluate_symbol(state: &Arc<AppState>, symbol: &str) -> (DecisionEnvelope, Option<TradeProposal>) {
        let (interval, sizing) = {
            let config = state.runtime_config.read();
            (config.kline_interval.clone(), config.position_sizing.clone())
        };

        let key = CandleKey { symbol: symbol.to_string(), interval };
        let candles = state.candle_buffer.get_closed_candles(&key, 150);
        if candles.len() < MIN_BARS_FOR_SIGNAL as usize {
            return (
                DecisionEnvelope::blocked(
                    symbol,
                    "NONE",
                    STRATEGY_NAME,
                    "DataQuality",
                    format!("{} closed bars available, need {}", candles.len(), MIN_BARS_FOR_SIGNAL),
                ),
                None,
            );
        }

        let opens: Vec<f64> = candles.iter().map(|c| c.open).collect();
        let highs: Vec<f64> = candles.iter().map(|c| c.high).collect();
        let lows: Vec<f64> = candles.iter().map(|c| c.low).collect();
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();

        let ema_series = calculate_ema(&closes, 21);
        let atr = match calculate_atr(&candles, 14) {
            Some(a) if a > 0.0 => a,
            _ => {
                return (
                    DecisionEnvelope::blocked(symbol, "NONE", STRATEGY_NAME, "DataQuality", "ATR undefined"),
                    None,
                );
            }
        };
        if ema_series.is_empty() {
            return (
                DecisionEnvelope::blocked(symbol, "NONE", STRATEGY_NAME, "DataQuality", "EMA undefined"),
                None,
            );
        }

        // spec.md §4.E "Spread filter" / §4.J step 5: a spread blown out past
        // its own rolling average suppresses every signal this bar, before
        // any detector runs.
        if let Some(spread) = state.orderbook_manager.spread_bps(symbol) {
            if !state.spread_filter.read().is_acceptable(spread) {
                return (
                    DecisionEnvelope::blocked(symbol, "NONE", STRATEGY_NAME, "SpreadFilter", "spread abnormally wide vs rolling average"),
                    None,
                );
            }
        }

        // ── Advance every tracker exactly once for this bar ────────────
        state.swing_tracker.write().update(&highs, &lows);
        {
            let swings = state.swing_tracker.read();
            state.hl_counter.write().update(&highs, &lows, &opens, &closes, atr, &swings);
            state.market_state.write().update(&highs, &lows, &opens, &closes, &ema_series, atr, &swings);
        }
        state.gap20.write().update(&highs, &lows, atr);
        state.measuring_gap.write().update(&highs, &lows, &closes, atr);

        let (ms_state, tr_high, tr_low) = {
            let ms = state.market_state.read();
            (ms.state, ms.tr_high, ms.tr_low)
        };
        let strong_trend = ms_state == MarketState::StrongTrend;
        {
            let mut bm = state.breakout_mode.write();
            if ms_state == MarketState::Breakout {
                bm.arm();
            } else {
                bm.tick();
            }
        }

        let last = closes.len() - 1;
        let (last_open, last_high, last_low, last_close, last_ema) =
            (opens[last], highs[last], lows[last], closes[last], ema_series[last]);

        // spec.md §4.F: H1/L1 additionally require StrongTrend or
        // TightChannel with >= 4 of the last 5 bars aligned in the
        // pullback's direction.
        let regime_gate = matches!(ms_state, MarketState::StrongTrend | MarketState::TightChannel);
        let h1_gate_open = regime_gate && aligned_bar_count(&opens, &closes, true) >= 4;
        let l1_gate_open = regime_gate && aligned_bar_count(&opens, &closes, false) >= 4;

        let spread = state
            .orderbook_manager
            .get(symbol)
            .map(|b| (b.best_ask - b.best_bid).max(0.0))
            .unwrap_or(0.0);
        let pullback_stop = |side: Side, entry: f64, extreme: f64, atr: f64| {
            pullback_stop_adapter(side, entry, extreme, atr, spread)
        };

        let (h1_signal, h2_signal) = {
            let mut h2 = state.h2_machine.write();
            h2.set_h1_gate_open(h1_gate_open);
            match h2.update(last_open, last_high, last_low, last_close, last_ema, atr, pullback_stop) {
                Some(H2Outcome::H1(sig)) => (Some(sig), None),
                Some(H2Outcome::H2(sig)) => (None, Some(sig)),
                None => (None, None),
            }
        };
        let (l1_signal, l2_signal) = {
            let mut l2 = state.l2_machine.write();
            l2.set_h1_gate_open(l1_gate_open);
            match l2.update(last_open, last_high, last_low, last_close, last_ema, atr, pullback_stop) {
                Some(L2Outcome::L1(sig)) => (Some(sig), None),
                Some(L2Outcome::L2(sig)) => (None, Some(sig)),
                None => (None, None),
            }
        };

        let is_ttr = state.market_state.read().is_ttr(&highs, &lows, atr);

        let (buy_signal, sell_signal) = {
            let swings = state.swing_tracker.read();
            let hl = state.hl_counter.read();
            let ms = state.market_state.read();
            let mg = state.measuring_gap.read();
            let ctx = PatternContext {
                opens: &opens,
                highs: &highs,
                lows: &lows,
                closes: &closes,
                ema: &ema_series,
                atr,
                swings: &swings,
                hl: &hl,
                market_state: &ms,
                measuring_gap: &mg,
                is_ttr,
                h1_signal,
                h2_signal,
                l1_signal,
                l2_signal,
            };
            (patterns::scan(&ctx, Side::Buy), patterns::scan(&ctx, Side::Sell))
        };

        let bar_index = candles.len() as u64;
        let mut last_block: Option<(String, &'static str, String)> = None;

        for (side, signal) in [(Side::Buy, buy_signal), (Side::Sell, sell_signal)] {
            let Some(signal) = signal else { continue };
            match evaluate_candidate(
                state, symbol, side, signal, ms_state, tr_high, tr_low, strong_trend, atr, &highs, &lows, &opens,
                &closes, bar_index, &sizing,
            ) {
                Ok(proposal) => {
                    return (
                        DecisionEnvelope::allow(symbol, side.to_string().to_uppercase(), STRATEGY_NAME),
                        Some(proposal),
                    );
                }
                Err((layer, reason)) => {
                    last_block = Some((side.to_string().to_uppercase(), layer, reason));
                }
            }
        }

        match last_block {
            Some((side, layer, reason)) => (DecisionEnvelope::blocked(symbol, side, STRATEGY_NAME, layer, reason), None),
            None => (
                DecisionEnvelope::blocked(symbol, "NONE", STRATEGY_NAME, "NoSignal", "no pattern fired this bar"),
                None,
            ),
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn evaluate_candidate(
    state: &Arc<AppState>,
    symbol: &str,
    side: Side,
    signal: Signal,
    ms_state: MarketState,
    tr_high: f64,
    tr_low: f64,
    strong_trend: bool,
    atr: f64,
    highs: &[f64],
    lows: &[f64],
    opens: &[f64],
    closes: &[f64],
    bar_index: u64,
    sizing: &PositionSizingPolicy,
) -> Result<TradeProposal, (&'static str, String)> {
    let n = closes.len();
    let last = n - 1;
    let bullish = side == Side::Buy;
    let relaxed = signal.cycle != SignalCycle::None;

    if !filters::signal_bar_valid(opens[last], highs[last], lows[last], closes[last], bullish, relaxed) {
        return Err(("SignalBar", "signal bar failed body/close validation".to_string()));
    }
    if filters::is_barb_wire(highs, lows, opens, closes) {
        return Err(("SignalBar", "barb-wire chop detected".to_string()));
    }

    let origin_idx = n.saturating_sub(GAP20_OVEREXTEND_BARS as usize).min(n - 1);
    let distance_from_origin_atr = (signal.entry - closes[origin_idx]).abs() / atr;
    if state.gap20.read().is_overextended(distance_from_origin_atr) {
        return Err(("Gap20", "move is overextended from the last consolidation".to_string()));
    }

    if matches!(signal.family, PatternFamily::H2 | PatternFamily::L2) && !state.htf_filter.should_allow_signal(side) {
        return Err(("HtfFilter", "H2/L2 entry against the higher-timeframe trend".to_string()));
    }

    let price_change_pct = if n >= 2 && closes[n - 2] != 0.0 {
        (closes[last] - closes[n - 2]) / closes[n - 2]
    } else {
        0.0
    };
    let delta_snapshot = state.delta_engine.write().snapshot(signal.entry);
    let (delta_mult, delta_reason) = get_signal_modifier(&delta_snapshot, side, price_change_pct);
    if delta_mult <= 0.0 {
        return Err(("OrderFlow", format!("order flow veto: {delta_reason}")));
    }

    let htf_mult = state.htf_filter.signal_modifier(side);
    let entry_strength = delta_mult * htf_mult;

    let range_atr = filters::signal_proximity_range_atr();
    let cooldown_ok = {
        let cooldown = state.signal_cooldown.read();
        match side {
            Side::Buy => cooldown.allow_buy(bar_index, signal.entry, atr, range_atr),
            Side::Sell => cooldown.allow_sell(bar_index, signal.entry, atr, range_atr),
        }
    };
    if !cooldown_ok {
        return Err(("SignalCooldown", "too soon or too close to the last same-side signal".to_string()));
    }

    let threshold = match (ms_state, strong_trend) {
        (MarketState::Breakout, true) => REVERSAL_THRESHOLD_BREAKOUT_STRONG,
        (MarketState::TradingRange, _) => REVERSAL_THRESHOLD_TRADING_RANGE,
        _ => REVERSAL_THRESHOLD_DEFAULT,
    };
    let side_str = side.to_string().to_uppercase();
    if !state.position_manager.reversal_gate_allows(symbol, &side_str, entry_strength, threshold) {
        return Err(("ReversalGate", "counter-side signal too weak to flip the existing position".to_string()));
    }

    if let Some(reason) = InsuranceGate::check_all(state, symbol, &side_str) {
        return Err(("Insurance", reason));
    }

    let spread = state
        .orderbook_manager
        .get(symbol)
        .map(|b| (b.best_ask - b.best_bid).max(0.0))
        .unwrap_or(0.0);
    let stop = match signal.stop_hint {
        Some(s) => crate::stop_loss::cap_or_reject(side, signal.entry, s, atr),
        None => {
            let swings = state.swing_tracker.read();
            compute_stop(side, signal.entry, ms_state, highs, lows, &swings, atr, spread)
        }
    };
    let Some(stop) = stop else {
        return Err(("StopLoss", "stop distance exceeds the hard cap".to_string()));
    };
    let tp1_price = tp1(side, signal.entry, stop);
    let signal_bar_range = highs[last] - lows[last];
    let avg_range_10 = average_range(highs, lows, 10);
    let (tp2_price, tp1_close_ratio) = {
        let mg = state.measuring_gap.read();
        resolve_tp2(signal.family, side, signal.entry, stop, ms_state, &mg, tr_high, tr_low, signal_bar_range, avg_range_10)
    };

    {
        let mut cooldown = state.signal_cooldown.write();
        match side {
            Side::Buy => cooldown.record_buy(bar_index, signal.entry),
            Side::Sell => cooldown.record_sell(bar_index, signal.entry),
        }
    }

    let available_balance = state
        .balances
        .read()
        .iter()
        .find(|b| b.asset == "USDT")
        .map(|b| b.free)
        .unwrap_or(1000.0);
    let fraction = sizing.position_fraction(available_balance);
    let notional = available_balance * fraction * sizing.leverage as f64;
    let quantity = if signal.entry > 0.0 { notional / signal.entry } else { 0.0 };
    if quantity <= 0.0 {
        return Err(("PositionSizing", "computed position size is zero".to_string()));
    }

    Ok(TradeProposal {
        symbol: symbol.to_string(),
        side: side_str,
        family: signal.family,
        entry_price: signal.entry,
        quantity,
        stop_loss: stop,
        take_profit_1: tp1_price,
        take_profit_2: tp2_price,
        tp1_close_ratio,
        entry_strength,
    })
}

/// Count of the last 5 closed bars whose direction matches `bullish`
/// (close > open for bullish, close < open for bearish) — spec.md §4.F's
/// "≥ 4 of last 5 bars aligned" H1/L1 gate.
fn aligned_bar_count(opens: &[f64], closes: &[f64], bullish: bool) -> usize {
    let n = closes.len();
    let take = 5.min(n);
    (n - take..n)
        .filter(|&i| if bullish { closes[i] > opens[i] } else { closes[i] < opens[i] })
        .count()
}

/// Mean high-low range over the trailing `lookback` bars, used to judge
/// whether the signal bar is a climax relative to recent volatility.
fn average_range(highs: &[f64], lows: &[f64], lookback: usize) -> f64 {
    let n = highs.len();
    if n == 0 {
        return 0.0;
    }
    let take = lookback.min(n);
    let sum: f64 = (n - take..n).map(|i| highs[i] - lows[i]).sum();
    sum / take as f64
}

/// Stop-loss adapter for the H2/L2 state machines: they hand back the
/// pullback extreme rather than swing/market-state context, so this mirrors
/// `stop_loss::compute_stop`'s buffer-and-cap logic directly off that
/// extreme instead of re-deriving a swing point (the pullback low/high the
/// state machine already tracked is the structural point the swing-based
/// branch would otherwise look up).
fn pullback_stop_adapter(side: Side, entry: f64, extreme: f64, atr: f64, spread: f64) -> f64 {
    if atr <= 0.0 {
        return match side {
            Side::Buy => entry - entry * 0.01,
            Side::Sell => entry + entry * 0.01,
        };
    }
    let buffer = (atr * 0.3).max(atr * MIN_BUFFER_ATR_MULT) + spread;
    let raw = match side {
        Side::Buy => extreme - buffer,
        Side::Sell => extreme + buffer,
    };
    let max_dist = atr * MAX_STOP_ATR_MULT;
    match side {
        Side::Buy => {
            let dist = entry - raw;
            if dist > max_dist {
                entry - max_dist
            } else {
                raw
            }
        }
        Side::Sell => {
            let dist = raw - entry;
            if dist > max_dist {
                entry + max_dist
            } else {
                raw
            }
        }
    }
}
