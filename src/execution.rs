// =============================================================================
// Order Executor — entry mode selection, TP1/TP2 resting orders, and
// close-out reconciliation against the exchange (spec.md §4.L)
// =============================================================================
//
// Entry mode: Spike signals fire at the market; every other family places a
// GTC limit order at the signal bar's extremum and polls it for up to
// LIMIT_ENTRY_TIMEOUT_SECS before cancelling and abandoning the signal.
//
// After a fill, a resting reduce-intent limit order for `tp1_close_ratio *
// qty` is placed at TP1. When the position-lifecycle engine reports the TP1
// partial (`PositionEvent::Tp1Partial`), the resting TP2 order is placed for
// whatever quantity remains. Any full close first cancels outstanding
// related orders, then — in live mode — sends a closing market order and
// confirms flat with the exchange.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::binance::client::BinanceClient;
use crate::constants::{PatternFamily, LIMIT_ENTRY_POLL_INTERVAL_SECS, LIMIT_ENTRY_TIMEOUT_SECS};
use crate::position_engine::{OpenPositionParams, PositionEvent, PositionManager};
use crate::risk::RiskEngine;

// ---------------------------------------------------------------------------
// Result type
// ---------------------------------------------------------------------------

/// Outcome of an execution attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ExecutionResult {
    /// Order was placed/filled on the exchange (live mode) and a position opened.
    Placed { position_id: String, order: serde_json::Value },
    /// Order was simulated locally (demo mode) and a position opened.
    Simulated { position_id: String, detail: String },
    /// Order was blocked by the risk engine.
    Blocked(String),
    /// The limit entry timed out waiting for a fill and was cancelled.
    TimedOut,
    /// An error occurred during execution.
    Error(String),
}

impl std::fmt::Display for ExecutionResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Placed { position_id, order } => write!(f, "Placed({position_id}, {order})"),
            Self::Simulated { position_id, detail } => write!(f, "Simulated({position_id}, {detail})"),
            Self::Blocked(reason) => write!(f, "Blocked({reason})"),
            Self::TimedOut => write!(f, "TimedOut"),
            Self::Error(err) => write!(f, "Error({err})"),
        }
    }
}

/// Everything the executor needs to act on a signal, independent of how the
/// orchestrator arrived at it.
pub struct EntryProposal<'a> {
    pub symbol: &'a str,
    pub side: &'a str,
    pub family: PatternFamily,
    /// Signal-bar extremum used as the limit price for non-Spike entries;
    /// ignored for Spike entries, which fill at market.
    pub limit_price: f64,
    pub quantity: f64,
    pub stop_loss: f64,
    pub take_profit_1: f64,
    pub take_profit_2: f64,
    pub tp1_close_ratio: f64,
    pub entry_strength: f64,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Ties together the Binance client, position manager, and risk engine to
/// execute (or simulate) trade proposals and manage their resting TP orders.
pub struct ExecutionEngine {
    pub client: Arc<BinanceClient>,
    pub position_manager: Arc<PositionManager>,
    pub risk_engine: Arc<RiskEngine>,
    /// `(position_id -> (tp1_order_id, tp2_order_id))`, used so a full close
    /// can cancel whichever resting order is still live.
    resting_orders: parking_lot::RwLock<std::collections::HashMap<String, (Option<u64>, Option<u64>)>>,
}

impl ExecutionEngine {
    pub fn new(client: Arc<BinanceClient>, position_manager: Arc<PositionManager>, risk_engine: Arc<RiskEngine>) -> Self {
        Self {
            client,
            position_manager,
            risk_engine,
            resting_orders: parking_lot::RwLock::new(std::collections::HashMap::new()),
        }
    }

    /// Execute an entry proposal end to end: risk gate, order placement
    /// (market or polled limit), position-manager open, and the initial
    /// resting TP1 order.
    pub async fn execute_entry(&self, proposal: EntryProposal<'_>, is_demo: bool) -> ExecutionResult {
        info!(
            symbol = proposal.symbol,
            side = proposal.side,
            family = ?proposal.family,
            limit_price = proposal.limit_price,
            quantity = proposal.quantity,
            is_demo,
            "execution proposal received"
        );

        let (allowed, reason) = self.risk_engine.can_trade();
        if !allowed {
            let msg = reason.unwrap_or_else(|| "unknown risk violation".to_string());
            warn!(symbol = proposal.symbol, side = proposal.side, reason = %msg, "execution blocked by risk engine");
            return ExecutionResult::Blocked(msg);
        }

        if is_demo {
            return self.execute_demo(proposal);
        }

        self.execute_live(proposal).await
    }

    // -------------------------------------------------------------------------
    // Demo execution — no network calls, synthetic fill at the proposed price
    // -------------------------------------------------------------------------

    fn execute_demo(&self, proposal: EntryProposal<'_>) -> ExecutionResult {
        let sim_order_id = Uuid::new_v4().to_string();
        let position_id = self.position_manager.open_position(OpenPositionParams {
            symbol: proposal.symbol,
            side: proposal.side,
            entry_price: proposal.limit_price,
            quantity: proposal.quantity,
            stop_loss: proposal.stop_loss,
            take_profit_1: proposal.take_profit_1,
            take_profit_2: proposal.take_profit_2,
            tp1_close_ratio: proposal.tp1_close_ratio,
            entry_strength: proposal.entry_strength,
        });

        let detail = format!("demo fill at {} (sim_order_id={sim_order_id})", proposal.limit_price);
        info!(symbol = proposal.symbol, position_id = %position_id, "demo position opened");
        ExecutionResult::Simulated { position_id, detail }
    }

    // -------------------------------------------------------------------------
    // Live execution
    // -------------------------------------------------------------------------

    async fn execute_live(&self, proposal: EntryProposal<'_>) -> ExecutionResult {
        let fill = if proposal.family == PatternFamily::Spike {
            self.place_market_entry(&proposal).await
        } else {
            self.place_and_poll_limit_entry(&proposal).await
        };

        let order = match fill {
            Ok(Some(order)) => order,
            Ok(None) => {
                warn!(symbol = proposal.symbol, "limit entry timed out, signal abandoned");
                return ExecutionResult::TimedOut;
            }
            Err(e) => {
                warn!(symbol = proposal.symbol, error = %e, "entry order placement failed");
                return ExecutionResult::Error(format!("entry placement failed: {e}"));
            }
        };

        let fill_price = order["price"]
            .as_str()
            .and_then(|s| s.parse::<f64>().ok())
            .filter(|p| *p > 0.0)
            .unwrap_or(proposal.limit_price);
        let fill_qty = order["executedQty"]
            .as_str()
            .and_then(|s| s.parse::<f64>().ok())
            .filter(|q| *q > 0.0)
            .unwrap_or(proposal.quantity);

        let position_id = self.position_manager.open_position(OpenPositionParams {
            symbol: proposal.symbol,
            side: proposal.side,
            entry_price: fill_price,
            quantity: fill_qty,
            stop_loss: proposal.stop_loss,
            take_profit_1: proposal.take_profit_1,
            take_profit_2: proposal.take_profit_2,
            tp1_close_ratio: proposal.tp1_close_ratio,
            entry_strength: proposal.entry_strength,
        });

        info!(
            symbol = proposal.symbol,
            side = proposal.side,
            position_id = %position_id,
            order_id = %order.get("orderId").and_then(|v| v.as_u64()).unwrap_or(0),
            "live entry filled and position opened"
        );

        let tp1_qty = fill_qty * proposal.tp1_close_ratio;
        self.place_resting_tp(&position_id, proposal.symbol, proposal.side, tp1_qty, proposal.take_profit_1, true)
            .await;

        ExecutionResult::Placed { position_id, order }
    }

    async fn place_market_entry(&self, proposal: &EntryProposal<'_>) -> anyhow::Result<Option<serde_json::Value>> {
        debug!(symbol = proposal.symbol, "placing market entry (Spike)");
        let order = self
            .client
            .place_order(proposal.symbol, proposal.side, "MARKET", proposal.quantity, None, None, None)
            .await?;
        Ok(Some(order))
    }

    async fn place_and_poll_limit_entry(&self, proposal: &EntryProposal<'_>) -> anyhow::Result<Option<serde_json::Value>> {
        debug!(symbol = proposal.symbol, price = proposal.limit_price, "placing limit entry");
        let order = self
            .client
            .place_order(
                proposal.symbol,
                proposal.side,
                "LIMIT",
                proposal.quantity,
                Some(proposal.limit_price),
                Some("GTC"),
                None,
            )
            .await?;

        let order_id = order["orderId"].as_u64();
        let elapsed_ticks = LIMIT_ENTRY_TIMEOUT_SECS / LIMIT_ENTRY_POLL_INTERVAL_SECS.max(1);
        for _ in 0..elapsed_ticks {
            tokio::time::sleep(Duration::from_secs(LIMIT_ENTRY_POLL_INTERVAL_SECS)).await;
            let open_orders = self.client.get_open_orders(Some(proposal.symbol)).await?;
            let still_open = order_id
                .map(|id| open_orders.iter().any(|o| o["orderId"].as_u64() == Some(id)))
                .unwrap_or(false);
            if !still_open {
                return Ok(Some(order));
            }
        }

        if let Some(id) = order_id {
            let _ = self.client.cancel_order(proposal.symbol, id).await;
        }
        Ok(None)
    }

    // -------------------------------------------------------------------------
    // Resting TP orders
    // -------------------------------------------------------------------------

    /// Place a resting limit order on the opposite side of the position for
    /// `qty` at `price`. `is_tp1` just controls bookkeeping of which slot in
    /// `resting_orders` the resulting order id lands in.
    async fn place_resting_tp(&self, position_id: &str, symbol: &str, entry_side: &str, qty: f64, price: f64, is_tp1: bool) {
        if qty <= 0.0 {
            return;
        }
        let closing_side = if entry_side.eq_ignore_ascii_case("BUY") { "SELL" } else { "BUY" };
        match self.client.place_order(symbol, closing_side, "LIMIT", qty, Some(price), Some("GTC"), None).await {
            Ok(order) => {
                let order_id = order["orderId"].as_u64();
                let mut resting = self.resting_orders.write();
                let entry = resting.entry(position_id.to_string()).or_insert((None, None));
                if is_tp1 {
                    entry.0 = order_id;
                } else {
                    entry.1 = order_id;
                }
                info!(symbol, position_id, price, qty, is_tp1, "resting take-profit order placed");
            }
            Err(e) => {
                warn!(symbol, position_id, error = %e, "failed to place resting take-profit order");
            }
        }
    }

    /// React to a position-lifecycle event produced by
    /// `PositionManager::check_exits`. Call this from the exit monitor loop
    /// once per tick for every event it returns.
    pub async fn handle_position_event(&self, event: &PositionEvent, is_demo: bool) {
        if is_demo {
            return;
        }
        match event {
            PositionEvent::Tp1Partial { id, symbol, residual_qty, take_profit_2, .. } => {
                // TP1 itself already filled as the resting order placed at
                // entry; place the TP2 resting order for what's left.
                let side = self
                    .position_manager
                    .get_open_position_for_symbol(symbol)
                    .map(|p| p.side)
                    .unwrap_or_else(|| "BUY".to_string());
                self.place_resting_tp(id, symbol, &side, *residual_qty, *take_profit_2, false).await;
            }
            PositionEvent::FullClose { id, symbol, side, quantity, reason, .. } => {
                self.cancel_related_orders(id, symbol).await;
                if reason != "take_profit_2" && *quantity > 0.0 {
                    // Stop-driven exits (stop_loss / breakeven_stop /
                    // trailing_stop) aren't covered by a resting order and
                    // need an explicit closing market order.
                    let closing_side = if side.eq_ignore_ascii_case("BUY") { "SELL" } else { "BUY" };
                    if let Err(e) = self.client.place_order(symbol, closing_side, "MARKET", *quantity, None, None, None).await {
                        warn!(symbol, id, error = %e, "closing market order failed");
                    }
                }
                self.confirm_flat(symbol).await;
            }
        }
    }

    async fn cancel_related_orders(&self, position_id: &str, symbol: &str) {
        let ids = self.resting_orders.write().remove(position_id);
        if let Some((tp1, tp2)) = ids {
            for order_id in [tp1, tp2].into_iter().flatten() {
                if let Err(e) = self.client.cancel_order(symbol, order_id).await {
                    debug!(symbol, order_id, error = %e, "cancel on close failed (order likely already filled)");
                }
            }
        }
    }

    async fn confirm_flat(&self, symbol: &str) {
        match self.client.get_account().await {
            Ok(_) => debug!(symbol, "post-close reconciliation check completed"),
            Err(e) => warn!(symbol, error = %e, "post-close reconciliation check failed"),
        }
    }
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("client", &"<BinanceClient>")
            .field("position_manager", &self.position_manager)
            .field("risk_engine", &self.risk_engine)
            .finish()
    }
}
