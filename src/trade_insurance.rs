// =============================================================================
// Trade Insurance — 8 mandatory gates before any trade executes
// =============================================================================
//
// Every gate must pass for a trade to proceed. If ANY gate fails, the trade
// is blocked and the blocking reason is recorded in the DecisionEnvelope.
//
// Gates:
//   1. NotKilled       — trading_mode != Killed
//   2. NotPaused       — trading_mode != Paused
//   3. NotInLossCooldown — symbol is not serving a post-loss cooldown
//   4. MaxPositions    — concurrent open positions < limit
//   5. NoDuplicateSymbol — no existing position for this symbol
//   6. SpreadOk        — bid-ask spread within acceptable range
//   7. RiskOk          — all circuit breakers clear
//   8. No-go reason    — no engine-level no-go condition is active
// =============================================================================

use std::sync::Arc;
use tracing::debug;

use crate::app_state::AppState;
use crate::types::TradingMode;

/// Maximum acceptable spread in basis points.
const MAX_SPREAD_BPS: f64 = 15.0;

pub struct InsuranceGate;

impl InsuranceGate {
    /// Run all insurance gates. Returns `None` if all pass, or `Some(reason)`
    /// if any gate blocks.
    pub fn check_all(
        state: &Arc<AppState>,
        symbol: &str,
        _side: &str,
    ) -> Option<String> {
        let config = state.runtime_config.read();

        // Gate 1: Not Killed
        if config.trading_mode == TradingMode::Killed {
            return Some("Trading mode is KILLED".to_string());
        }

        // Gate 2: Not Paused
        if config.trading_mode == TradingMode::Paused {
            return Some("Trading mode is PAUSED".to_string());
        }

        // Gate 3: Not In Loss Cooldown
        if state.position_manager.in_cooldown(symbol) {
            return Some(format!("{} is in post-loss cooldown", symbol));
        }

        // Gate 4: Max concurrent positions
        let open = state.position_manager.get_open_positions();
        let max_positions = config.max_concurrent_positions as usize;
        if open.len() >= max_positions {
            return Some(format!(
                "Max concurrent positions reached: {} >= {}",
                open.len(),
                max_positions
            ));
        }

        // Gate 5: No duplicate symbol position
        let has_symbol_position = open.iter().any(|p| p.symbol == symbol);
        if has_symbol_position {
            return Some(format!("Already have an open position for {}", symbol));
        }

        // Gate 6: Spread OK
        if let Some(spread) = state.orderbook_manager.spread_bps(symbol) {
            if spread > MAX_SPREAD_BPS {
                return Some(format!(
                    "Spread too wide: {:.1} bps > {:.1} bps limit",
                    spread, MAX_SPREAD_BPS
                ));
            }
        }

        // Gate 7: Risk engine OK (circuit breakers)
        let (allowed, reason) = state.risk_engine.can_trade();
        if !allowed {
            return Some(format!(
                "Risk engine blocked: {}",
                reason.unwrap_or_else(|| "unknown".to_string())
            ));
        }

        // Gate 8: No-go reason check
        {
            let no_go = state.no_go_reason.read();
            if let Some(reason) = no_go.as_ref() {
                return Some(format!("No-go reason active: {}", reason));
            }
        }

        debug!(symbol, "all insurance gates passed");
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position_engine::OpenPositionParams;
    use crate::runtime_config::RuntimeConfig;

    fn live_state() -> Arc<AppState> {
        let mut config = RuntimeConfig::default();
        config.trading_mode = TradingMode::Live;
        Arc::new(AppState::new(config))
    }

    fn open_params(symbol: &'static str) -> OpenPositionParams<'static> {
        OpenPositionParams {
            symbol,
            side: "LONG",
            entry_price: 100.0,
            quantity: 1.0,
            stop_loss: 98.0,
            take_profit_1: 104.0,
            take_profit_2: 108.0,
            tp1_close_ratio: 0.5,
            entry_strength: 1.0,
        }
    }

    #[test]
    fn passes_all_gates_on_a_clean_live_engine() {
        let state = live_state();
        assert_eq!(InsuranceGate::check_all(&state, "BTCUSDT", "LONG"), None);
    }

    #[test]
    fn killed_mode_blocks_before_any_other_gate() {
        let state = live_state();
        state.runtime_config.write().trading_mode = TradingMode::Killed;
        let reason = InsuranceGate::check_all(&state, "BTCUSDT", "LONG").unwrap();
        assert!(reason.contains("KILLED"));
    }

    #[test]
    fn paused_mode_blocks() {
        // Default RuntimeConfig starts Paused.
        let state = Arc::new(AppState::new(RuntimeConfig::default()));
        let reason = InsuranceGate::check_all(&state, "BTCUSDT", "LONG").unwrap();
        assert!(reason.contains("PAUSED"));
    }

    #[test]
    fn loss_cooldown_blocks_the_symbol() {
        let state = live_state();
        let id = state.position_manager.open_position(open_params("BTCUSDT"));
        // close at a loss to arm the cooldown, then the position is gone
        // from the open list so only Gate 3 (not Gate 5) should trip.
        state.position_manager.close_position(&id, "stop_loss", 90.0);

        let reason = InsuranceGate::check_all(&state, "BTCUSDT", "LONG").unwrap();
        assert!(reason.contains("cooldown"));
    }

    #[test]
    fn max_concurrent_positions_blocks_once_the_cap_is_reached() {
        let state = live_state();
        state.runtime_config.write().max_concurrent_positions = 1;
        state.position_manager.open_position(open_params("ETHUSDT"));

        let reason = InsuranceGate::check_all(&state, "BTCUSDT", "LONG").unwrap();
        assert!(reason.contains("Max concurrent positions"));
    }

    #[test]
    fn duplicate_symbol_blocks_a_second_position_on_the_same_symbol() {
        let state = live_state();
        state.runtime_config.write().max_concurrent_positions = 5;
        state.position_manager.open_position(open_params("BTCUSDT"));

        let reason = InsuranceGate::check_all(&state, "BTCUSDT", "LONG").unwrap();
        assert!(reason.contains("Already have an open position"));
    }

    #[test]
    fn wide_spread_blocks_the_trade() {
        let state = live_state();
        state
            .orderbook_manager
            .update("BTCUSDT", 100.0, 100.2, 1.0, 1.0, 1);
        // spread here is ~20 bps, above the 15 bps cap.
        let reason = InsuranceGate::check_all(&state, "BTCUSDT", "LONG").unwrap();
        assert!(reason.contains("Spread too wide"));
    }

    #[test]
    fn tight_spread_does_not_block() {
        let state = live_state();
        state
            .orderbook_manager
            .update("BTCUSDT", 100.00, 100.01, 1.0, 1.0, 1);
        assert_eq!(InsuranceGate::check_all(&state, "BTCUSDT", "LONG"), None);
    }

    #[test]
    fn tripped_risk_engine_blocks_the_trade() {
        let state = live_state();
        state.risk_engine.kill();
        let reason = InsuranceGate::check_all(&state, "BTCUSDT", "LONG").unwrap();
        assert!(reason.contains("Risk engine blocked"));
    }

    #[test]
    fn active_no_go_reason_blocks_the_trade() {
        let state = live_state();
        *state.no_go_reason.write() = Some("htf trend conflict".to_string());
        let reason = InsuranceGate::check_all(&state, "BTCUSDT", "LONG").unwrap();
        assert!(reason.contains("No-go reason active"));
    }
}
