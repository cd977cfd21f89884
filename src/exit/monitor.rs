// =============================================================================
// Exit Monitor Loop — periodic position-lifecycle evaluation
// =============================================================================
//
// Runs as a background Tokio task, waking every few seconds to:
//   1. Push the latest trade price into every open position.
//   2. Run `PositionManager::check_exits`, which applies the unified
//      TP1/TP2/trailing-stop/breakeven rules in place (spec.md §4.K).
//   3. Hand each resulting event to the execution engine so resting TP2
//      orders get placed and stop-driven closes get a market order in live
//      mode.
//   4. Feed realised PnL from full closes back into the risk engine.
//
// The monitor is designed to be spawned once at engine startup:
//
//   tokio::spawn(run_exit_monitor(Arc::clone(&state), Arc::clone(&exec_engine)));
// =============================================================================

use std::sync::Arc;

use tokio::time::{interval, Duration};
use tracing::{debug, info};

use crate::app_state::AppState;
use crate::execution::ExecutionEngine;
use crate::position_engine::PositionEvent;
use crate::types::AccountMode;

/// Interval at which the exit monitor evaluates open positions.
const MONITOR_INTERVAL_SECS: u64 = 5;

/// Run the exit monitor loop. This function runs forever and should be
/// spawned as a background Tokio task.
pub async fn run_exit_monitor(state: Arc<AppState>, exec_engine: Arc<ExecutionEngine>) {
    info!(interval_secs = MONITOR_INTERVAL_SECS, "exit monitor started");

    let mut ticker = interval(Duration::from_secs(MONITOR_INTERVAL_SECS));

    loop {
        ticker.tick().await;

        let symbol = state.runtime_config.read().symbol.clone();
        let current_price = state.trade_processor.last_price();
        if current_price <= 0.0 {
            debug!(symbol = %symbol, "exit monitor: no trade price yet, skipping tick");
            continue;
        }

        state.position_manager.update_price(&symbol, current_price);
        let events = state.position_manager.check_exits();
        if events.is_empty() {
            continue;
        }

        let is_demo = state.runtime_config.read().account_mode == AccountMode::Demo;

        for event in &events {
            exec_engine.handle_position_event(event, is_demo).await;
            if let PositionEvent::FullClose { id, realized_pnl, reason, .. } = event {
                state.risk_engine.record_trade_result(*realized_pnl);
                info!(id = %id, reason = %reason, realized_pnl, "position closed by exit monitor");
            }
            state.increment_version();
        }
    }
}
