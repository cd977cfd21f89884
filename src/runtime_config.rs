// =============================================================================
// Runtime Configuration — Hot-reloadable engine settings with atomic save
// =============================================================================
//
// Central configuration hub for the Brooks price-action trading engine.
// Every tunable parameter lives here so that the engine can be reconfigured
// at runtime without a restart.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.  All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
//
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::{AccountMode, TradingMode};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_symbol() -> String {
    "BTCUSDT".to_string()
}

fn default_kline_interval() -> String {
    "5m".to_string()
}

fn default_max_concurrent_positions() -> u32 {
    3
}

fn default_max_daily_loss_pct() -> f64 {
    3.0
}

fn default_max_consecutive_losses() -> u32 {
    5
}

fn default_max_trades_per_day() -> u32 {
    50
}

fn default_position_size_percent() -> f64 {
    2.0
}

fn default_large_balance_threshold() -> f64 {
    10_000.0
}

fn default_large_balance_position_pct() -> f64 {
    1.0
}

fn default_leverage() -> u32 {
    1
}

// =============================================================================
// PositionSizingPolicy
// =============================================================================

/// Position sizing policy, applied independently of the pattern-detection
/// state machine. See spec §4.K / §6 for the exact env var mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSizingPolicy {
    /// Fraction of available balance risked per position under the
    /// standard balance tier.
    #[serde(default = "default_position_size_percent")]
    pub position_size_percent: f64,

    /// Balance (in quote asset) above which the large-balance sizing tier
    /// applies instead of `position_size_percent`.
    #[serde(default = "default_large_balance_threshold")]
    pub large_balance_threshold: f64,

    /// Fraction of available balance risked per position once the balance
    /// exceeds `large_balance_threshold`.
    #[serde(default = "default_large_balance_position_pct")]
    pub large_balance_position_pct: f64,

    /// Leverage multiplier applied to the computed notional.
    #[serde(default = "default_leverage")]
    pub leverage: u32,
}

impl Default for PositionSizingPolicy {
    fn default() -> Self {
        Self {
            position_size_percent: default_position_size_percent(),
            large_balance_threshold: default_large_balance_threshold(),
            large_balance_position_pct: default_large_balance_position_pct(),
            leverage: default_leverage(),
        }
    }
}

impl PositionSizingPolicy {
    /// Fraction of available balance to commit to a new position, selecting
    /// the large-balance tier once `available_balance` clears the threshold.
    pub fn position_fraction(&self, available_balance: f64) -> f64 {
        if available_balance > self.large_balance_threshold {
            self.large_balance_position_pct / 100.0
        } else {
            self.position_size_percent / 100.0
        }
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration for the trading engine.
///
/// Every field has a serde default so that older JSON files missing new
/// fields will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Operational modes ---------------------------------------------------

    /// Current trading mode: Live, Paused, or Killed.
    #[serde(default)]
    pub trading_mode: TradingMode,

    /// Whether running against real funds or simulated: Demo or Live.
    #[serde(default)]
    pub account_mode: AccountMode,

    // --- Symbol & data -------------------------------------------------------

    /// Symbol the engine is watching and trading.
    #[serde(default = "default_symbol")]
    pub symbol: String,

    /// Candle interval consumed from the kline stream.
    #[serde(default = "default_kline_interval")]
    pub kline_interval: String,

    // --- Limits --------------------------------------------------------------

    /// Maximum number of concurrent open positions.
    #[serde(default = "default_max_concurrent_positions")]
    pub max_concurrent_positions: u32,

    /// Maximum cumulative daily loss allowed as a percentage of starting
    /// capital (e.g. 3.0 means 3 %).
    #[serde(default = "default_max_daily_loss_pct")]
    pub max_daily_loss_pct: f64,

    /// Maximum consecutive losing trades before the circuit breaker trips.
    #[serde(default = "default_max_consecutive_losses")]
    pub max_consecutive_losses: u32,

    /// Maximum total trades per day.
    #[serde(default = "default_max_trades_per_day")]
    pub max_trades_per_day: u32,

    // --- Feature flags -----------------------------------------------------

    /// Higher Time Frame EMA trend gate.
    #[serde(default = "default_true")]
    pub enable_htf_gate: bool,

    // --- Position sizing -----------------------------------------------------

    /// Balance-tiered position sizing policy.
    #[serde(default)]
    pub position_sizing: PositionSizingPolicy,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            trading_mode: TradingMode::Paused,
            account_mode: AccountMode::Demo,
            symbol: default_symbol(),
            kline_interval: default_kline_interval(),
            max_concurrent_positions: default_max_concurrent_positions(),
            max_daily_loss_pct: default_max_daily_loss_pct(),
            max_consecutive_losses: default_max_consecutive_losses(),
            max_trades_per_day: default_max_trades_per_day(),
            enable_htf_gate: true,
            position_sizing: PositionSizingPolicy::default(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbol = %config.symbol,
            trading_mode = %config.trading_mode,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    ///
    /// This prevents corruption if the process crashes mid-write.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        // Atomic write: write to a temporary sibling file, then rename.
        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.trading_mode, TradingMode::Paused);
        assert_eq!(cfg.account_mode, AccountMode::Demo);
        assert_eq!(cfg.symbol, "BTCUSDT");
        assert_eq!(cfg.kline_interval, "5m");
        assert_eq!(cfg.max_concurrent_positions, 3);
        assert!(cfg.enable_htf_gate);
        assert!((cfg.position_sizing.position_size_percent - 2.0).abs() < f64::EPSILON);
        assert!((cfg.position_sizing.large_balance_threshold - 10_000.0).abs() < f64::EPSILON);
        assert_eq!(cfg.position_sizing.leverage, 1);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.trading_mode, TradingMode::Paused);
        assert_eq!(cfg.account_mode, AccountMode::Demo);
        assert!(cfg.enable_htf_gate);
        assert_eq!(cfg.max_consecutive_losses, 5);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "trading_mode": "Live", "symbol": "ETHUSDT" }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.trading_mode, TradingMode::Live);
        assert_eq!(cfg.symbol, "ETHUSDT");
        assert_eq!(cfg.max_concurrent_positions, 3);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = RuntimeConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.symbol, cfg2.symbol);
        assert_eq!(cfg.max_concurrent_positions, cfg2.max_concurrent_positions);
        assert_eq!(cfg.trading_mode, cfg2.trading_mode);
    }

    #[test]
    fn enum_mode_assignment_compatible() {
        // Verify that trading_mode and account_mode can be assigned from
        // enum variants, matching the pattern in main.rs.
        let mut cfg = RuntimeConfig::default();
        cfg.trading_mode = TradingMode::Paused;
        cfg.account_mode = AccountMode::Demo;
        assert_eq!(cfg.trading_mode, TradingMode::Paused);
        assert_eq!(cfg.account_mode, AccountMode::Demo);
    }

    #[test]
    fn position_fraction_selects_tier_by_balance() {
        let policy = PositionSizingPolicy::default();
        assert!((policy.position_fraction(1_000.0) - 0.02).abs() < f64::EPSILON);
        assert!((policy.position_fraction(50_000.0) - 0.01).abs() < f64::EPSILON);
    }
}
