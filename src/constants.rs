//! Numeric constants and enumerations shared across the analysis pipeline.
//!
//! These values are deliberately centralized: every detector, filter and
//! lifecycle rule references them rather than hard-coding a literal, so a
//! single tuning pass touches one file.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Swing tracker
// ---------------------------------------------------------------------------

pub const SWING_CONFIRMED_DEPTH: usize = 3;
pub const SWING_TEMP_DEPTH: usize = 1;
pub const SWING_MAX_AGE: u32 = 40;
pub const SWING_MAX_RETAINED: usize = 40;

// ---------------------------------------------------------------------------
// H/L counter
// ---------------------------------------------------------------------------

pub const HL_MIN_PULLBACK_ATR: f64 = 0.3;
pub const HL_RESET_NEW_EXTREME_ATR: f64 = 2.0;
pub const HL_STRONG_REVERSAL_RANGE_ATR: f64 = 0.8;

// ---------------------------------------------------------------------------
// Market-state classifier
// ---------------------------------------------------------------------------

pub const MARKET_STATE_LOOKBACK_TREND: usize = 10;
pub const MARKET_STATE_LOOKBACK_CHANNEL: usize = 12;
pub const MARKET_STATE_LOOKBACK_RANGE: usize = 20;
pub const MARKET_STATE_LOOKBACK_BREAKOUT: usize = 12;

pub const STRONG_TREND_SCORE_MIN: f64 = 0.5;
pub const TIGHT_CHANNEL_SAME_DIR_RATIO: f64 = 0.60;
pub const TIGHT_CHANNEL_NEW_EXTREME_RATIO: f64 = 0.50;
pub const TIGHT_CHANNEL_SHALLOW_PULLBACK_RATIO: f64 = 0.40;
pub const TRADING_RANGE_MIN_ATR_WIDTH: f64 = 2.0;
pub const TRADING_RANGE_MIN_TOUCHES: u32 = 2;
pub const TRADING_RANGE_MIN_EMA_CROSSES: u32 = 4;
pub const BREAKOUT_BODY_MULT: f64 = 1.5;
pub const FINAL_FLAG_MIN_BARS_AFTER_CHANNEL: u32 = 3;
pub const FINAL_FLAG_MAX_BARS_AFTER_CHANNEL: u32 = 8;
pub const FINAL_FLAG_MIN_ATR_ON_SIDE: f64 = 0.5;

/// Minimum number of bars a newly-detected state is held before the
/// classifier is allowed to flip again (hysteresis).
pub fn state_min_hold(state: MarketState) -> u32 {
    match state {
        MarketState::StrongTrend => 5,
        MarketState::TightChannel => 6,
        MarketState::Breakout => 3,
        MarketState::Channel => 2,
        MarketState::TradingRange => 4,
        MarketState::FinalFlag => 2,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MarketState {
    StrongTrend,
    TightChannel,
    Breakout,
    Channel,
    TradingRange,
    FinalFlag,
}

impl std::fmt::Display for MarketState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MarketState::StrongTrend => "StrongTrend",
            MarketState::TightChannel => "TightChannel",
            MarketState::Breakout => "Breakout",
            MarketState::Channel => "Channel",
            MarketState::TradingRange => "TradingRange",
            MarketState::FinalFlag => "FinalFlag",
        };
        f.write_str(s)
    }
}

/// States in which reversal-family detectors (Wedge, Climax, MTR,
/// Double-top/bottom, Outside-bar, Reversal-bar, II) are permitted to fire.
pub const REVERSAL_ALLOWED_STATES: [MarketState; 2] =
    [MarketState::TradingRange, MarketState::FinalFlag];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlwaysIn {
    Long,
    Short,
    Neutral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        })
    }
}

// ---------------------------------------------------------------------------
// Signal-bar validation / filters
// ---------------------------------------------------------------------------

pub const MIN_BODY_RATIO: f64 = 0.50;
pub const CLOSE_POSITION_PCT: f64 = 0.30;
pub const TR_MIN_BODY_RATIO: f64 = 0.40;
pub const TR_CLOSE_POSITION_PCT: f64 = 0.35;

pub const BARB_WIRE_MIN_BARS: usize = 6;
pub const BARB_WIRE_MAX_BODY_RATIO: f64 = 0.45;
pub const BARB_WIRE_OVERLAP_MIN: f64 = 0.55;

pub const GAP20_OVEREXTEND_BARS: u32 = 20;
pub const GAP20_SIDE_ATR_MULT: f64 = 0.3;
pub const CONSOLIDATION_BARS: u32 = 3;
pub const CONSOLIDATION_RANGE_ATR: f64 = 1.0;

pub const MAX_SPREAD_MULT: f64 = 3.0;
pub const SPREAD_LOOKBACK: usize = 20;

pub const SIGNAL_COOLDOWN: u32 = 5;
pub const SIGNAL_PROXIMITY_ATR: f64 = 1.5;
pub const SIGNAL_PROXIMITY_RANGE_ATR: f64 = 2.0;

pub const BREAKOUT_MODE_HOLD_BARS: u32 = 6;
pub const MEASURING_GAP_LOOKBACK: usize = 3;
pub const MEASURING_GAP_MULT: f64 = 1.8;

pub const TTR_MAX_RANGE_ATR: f64 = 2.5;
pub const TTR_MAX_OVERLAP_RATIO: f64 = 0.40;
pub const TTR_LOOKBACK: usize = 20;

// ---------------------------------------------------------------------------
// HTF filter
// ---------------------------------------------------------------------------

pub const HTF_EMA_PERIOD: usize = 20;
pub const HTF_SLOPE_THRESHOLD_PCT: f64 = 0.003;
pub const HTF_STRONG_SLOPE_THRESHOLD_PCT: f64 = 0.005;
pub const HTF_PRICE_NEAR_EMA_PCT: f64 = 0.008;
pub const HTF_SLOPE_LOOKBACK_BARS: usize = 6;
pub const HTF_TREND_BOOST_FACTOR: f64 = 1.2;
pub const HTF_COUNTER_TREND_FACTOR: f64 = 0.5;
pub const HTF_NEUTRAL_FACTOR: f64 = 1.0;
pub const HTF_UPDATE_INTERVAL_SECONDS: u64 = 300;

// ---------------------------------------------------------------------------
// Stop-loss / take-profit
// ---------------------------------------------------------------------------

pub const MAX_STOP_ATR_MULT: f64 = 3.0;
pub const MIN_BUFFER_ATR_MULT: f64 = 0.15;
pub const SOFT_STOP_CONFIRM_MODE: u8 = 0;
pub const SOFT_STOP_CONFIRM_BARS: usize = 2;

// ---------------------------------------------------------------------------
// Delta engine
// ---------------------------------------------------------------------------

pub const DELTA_CLEANUP_BATCH_SIZE: usize = 1000;
pub const DELTA_STRONG_THRESHOLD: f64 = 0.5;
/// Fraction, not percent: 0.05% (spec.md §4.I) as a fraction of price.
pub const DELTA_ABSORPTION_PRICE_PCT: f64 = 0.0005;
pub const DELTA_ABSORPTION_RATIO: f64 = 0.3;
pub const DELTA_ABSORPTION_VOLUME_MULT: f64 = 1.5;
/// Fraction, not percent: 0.2% (spec.md §4.I) as a fraction of price.
pub const DELTA_WITHDRAWAL_PRICE_PCT: f64 = 0.002;
pub const DELTA_WITHDRAWAL_MISMATCH: f64 = 0.15;
pub const DELTA_HISTORY_SIZE: usize = 30;

// ---------------------------------------------------------------------------
// Position lifecycle
// ---------------------------------------------------------------------------

pub const TRAILING_ACTIVATE_PROFIT_R: f64 = 0.8;
pub const TRAILING_DISTANCE_R: f64 = 0.5;
pub const BREAKEVEN_FEE_BUFFER_PCT: f64 = 0.001;
pub const LOSS_COOLDOWN_BARS: u32 = 3;

pub const REVERSAL_THRESHOLD_BREAKOUT_STRONG: f64 = 1.5;
pub const REVERSAL_THRESHOLD_TRADING_RANGE: f64 = 1.3;
pub const REVERSAL_THRESHOLD_DEFAULT: f64 = 1.2;

pub const RECONCILE_QTY_TOLERANCE_PCT: f64 = 0.01;

pub const DEFAULT_TP1_CLOSE_RATIO: f64 = 0.5;
pub const CLIMAX_TP1_CLOSE_RATIO: f64 = 0.75;
pub const CLIMAX_SIGNAL_BAR_RANGE_MULT: f64 = 3.0;
pub const TIGHT_CHANNEL_TP2_MIN_R: f64 = 3.0;
pub const CLIMAX_TP2_MAX_R: f64 = 1.5;

// ---------------------------------------------------------------------------
// Order executor
// ---------------------------------------------------------------------------

pub const LIMIT_ENTRY_TIMEOUT_SECS: u64 = 60;
pub const LIMIT_ENTRY_POLL_INTERVAL_SECS: u64 = 2;

// ---------------------------------------------------------------------------
// Indicators
// ---------------------------------------------------------------------------

pub const ADAPTIVE_EMA_SIGMA_LOOKBACK: usize = 50;
pub const ADAPTIVE_EMA_SIGMA_MIN: f64 = 0.5;
pub const ADAPTIVE_EMA_SIGMA_MAX: f64 = 1.5;
pub const ADAPTIVE_EMA_PERIOD_MIN: u32 = 10;
pub const ADAPTIVE_EMA_PERIOD_MAX: u32 = 35;

// ---------------------------------------------------------------------------
// Stream / history bounds
// ---------------------------------------------------------------------------

pub const MAX_BAR_HISTORY: usize = 500;
pub const MIN_BARS_FOR_SIGNAL: usize = 30;

/// All 17 pattern families, used for priority-table iteration and in
/// serialized signal types. `None` is the absence of a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PatternFamily {
    Spike,
    MicroChannel,
    H1,
    H2,
    L1,
    L2,
    TrendBar,
    GapBar,
    TrBreakout,
    BreakoutPullback,
    Climax,
    Wedge,
    Mtr,
    FailedBreakout,
    DoubleTopBottom,
    OutsideBar,
    ReversalBar,
    Ii,
    MeasuredMove,
    FinalFlag,
}

/// Scan priority within a single direction; the orchestrator stops at the
/// first family that produces a signal. Mirrors spec.md §4.F.
pub const DETECTOR_PRIORITY: [PatternFamily; 16] = [
    PatternFamily::Spike,
    PatternFamily::MicroChannel,
    PatternFamily::H1, // H/L-count family; H1/H2 (or L1/L2) resolved together
    PatternFamily::BreakoutPullback,
    PatternFamily::TrendBar,
    PatternFamily::GapBar,
    PatternFamily::TrBreakout,
    PatternFamily::Climax,
    PatternFamily::Wedge,
    PatternFamily::Mtr,
    PatternFamily::FailedBreakout,
    PatternFamily::DoubleTopBottom,
    PatternFamily::OutsideBar,
    PatternFamily::ReversalBar,
    PatternFamily::Ii,
    PatternFamily::MeasuredMove,
];

/// A signal's reversal "cycle" tag, consumed by the reversal gate and by
/// reversal-family gating (§4.F / §4.K).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalCycle {
    TradingRange,
    FinalFlag,
    SpikeCycle,
    None,
}
