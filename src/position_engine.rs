// =============================================================================
// Position Engine — state machine for open / partially-closed / closed trades
// =============================================================================
//
// Life-cycle:
//   Open  ->  PartialTP1  ->  Closed
//   Open  ->  Closed (stop-loss / breakeven-stop / trailing-stop / TP2 / manual)
//
// Per-tick evaluation order (spec.md §4.K):
//   1. Update profit_in_R off the *original* risk (entry vs. original_stop);
//      this never changes even after the stop is moved to breakeven.
//   2. Activate / ratchet the R-multiple trailing stop.
//   3. TP1: partial close, move stop to breakeven + fee buffer, advance to
//      exit-stage 1, and hand the caller a `Tp1Partial` event so the executor
//      can place the resting TP2 order for the remainder.
//   4. TP2 (exit-stage 1 only): full close.
//   5. Effective stop (max/min of static stop and trailing stop): full close,
//      labelled trailing_stop / breakeven_stop / stop_loss depending on how
//      it got there. Loss exits arm a per-symbol cooldown.
//
// Thread-safety: all mutable state is behind `parking_lot::RwLock`.
// =============================================================================

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::constants::{
    BREAKEVEN_FEE_BUFFER_PCT, LOSS_COOLDOWN_BARS, TRAILING_ACTIVATE_PROFIT_R, TRAILING_DISTANCE_R,
};

// ---------------------------------------------------------------------------
// Position model
// ---------------------------------------------------------------------------

/// Current status of a position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Open,
    PartialTP1,
    Closed,
}

impl std::fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "Open"),
            Self::PartialTP1 => write!(f, "PartialTP1"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

/// A single tracked position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    /// Unique identifier (UUID v4).
    pub id: String,
    pub symbol: String,
    /// "BUY" (long) or "SELL" (short).
    pub side: String,
    pub entry_price: f64,
    /// Remaining open quantity (reduced on partial close).
    pub quantity: f64,
    #[serde(default)]
    pub current_price: f64,
    #[serde(default)]
    pub unrealized_pnl: f64,
    #[serde(default)]
    pub unrealized_pnl_pct: f64,

    /// Current working stop — moves to breakeven at TP1 and is superseded
    /// by `trailing_stop` once that ratchets past it.
    pub stop_loss: f64,
    /// The stop the position was opened with; fixed for the life of the
    /// position and used as the denominator for `profit_in_R`.
    pub original_stop: f64,
    /// `|entry_price - original_stop|`, cached so repeated R calculations
    /// don't re-derive it.
    pub original_risk: f64,

    pub take_profit_1: f64,
    pub take_profit_2: f64,
    /// Fraction of quantity closed when TP1 is hit (family- and
    /// climax-bar-dependent; see take_profit::resolve_tp2).
    #[serde(default = "default_tp1_close_ratio")]
    pub tp1_close_ratio: f64,

    /// Trailing stop price, active once `profit_in_R` crosses the
    /// activation threshold. Only ever moves in the position's favour.
    #[serde(default)]
    pub trailing_stop: Option<f64>,
    #[serde(default)]
    pub trailing_activated: bool,
    /// Highest R-multiple of profit seen so far, used to distinguish a
    /// trailing-stop exit from a plain stop-loss exit.
    #[serde(default)]
    pub max_profit_r: f64,

    /// 0 = no partial taken yet, 1 = TP1 has fired and the stop is at
    /// breakeven, waiting on TP2 or the trailing stop.
    #[serde(default)]
    pub exit_stage: u8,
    #[serde(default)]
    pub breakeven_moved: bool,

    /// Signal strength at entry, consumed by the reversal gate to decide
    /// whether a fresh counter-side signal is strong enough to flip.
    #[serde(default)]
    pub entry_strength: f64,

    pub status: PositionStatus,
    pub opened_at: String,
    #[serde(default)]
    pub closed_at: Option<String>,
    #[serde(default)]
    pub close_reason: Option<String>,
    #[serde(default)]
    pub realized_pnl: f64,
}

fn default_tp1_close_ratio() -> f64 {
    0.5
}

impl Position {
    fn is_long(&self) -> bool {
        self.side == "BUY"
    }

    fn direction(&self) -> f64 {
        if self.is_long() {
            1.0
        } else {
            -1.0
        }
    }

    /// Current profit expressed in multiples of the position's original risk.
    fn profit_in_r(&self, price: f64) -> f64 {
        if self.original_risk <= 0.0 {
            return 0.0;
        }
        self.direction() * (price - self.entry_price) / self.original_risk
    }

    /// The tighter of the static stop and (if active) the trailing stop.
    fn effective_stop(&self) -> f64 {
        match self.trailing_stop {
            Some(trail) if self.is_long() => self.stop_loss.max(trail),
            Some(trail) => self.stop_loss.min(trail),
            None => self.stop_loss,
        }
    }
}

/// Parameters supplied when opening a new position, grouped so
/// `open_position` doesn't grow an unwieldy argument list as the lifecycle
/// model gains fields.
pub struct OpenPositionParams<'a> {
    pub symbol: &'a str,
    pub side: &'a str,
    pub entry_price: f64,
    pub quantity: f64,
    pub stop_loss: f64,
    pub take_profit_1: f64,
    pub take_profit_2: f64,
    pub tp1_close_ratio: f64,
    pub entry_strength: f64,
}

/// Outcome of a per-tick exit evaluation, returned by `check_exits` so the
/// caller (the exit monitor / order executor) can act without `check_exits`
/// itself reaching out over the network.
#[derive(Debug, Clone)]
pub enum PositionEvent {
    /// TP1 fired: `close_qty` of the position was closed in-place here;
    /// `residual_qty` and `take_profit_2` are handed back so the executor
    /// can place the resting TP2 order for what's left.
    Tp1Partial {
        id: String,
        symbol: String,
        close_qty: f64,
        residual_qty: f64,
        take_profit_2: f64,
    },
    /// The position closed in full; `is_loss` drives cooldown arming.
    /// `side`/`quantity` are the position's values immediately before
    /// close, since by the time this event is handed back the position has
    /// already been moved into the closed list with `quantity` zeroed.
    FullClose {
        id: String,
        symbol: String,
        side: String,
        quantity: f64,
        reason: String,
        close_price: f64,
        realized_pnl: f64,
        is_loss: bool,
    },
}

// ---------------------------------------------------------------------------
// Position Manager
// ---------------------------------------------------------------------------

/// Thread-safe manager that owns the lists of open and closed positions plus
/// the per-symbol loss cooldown counters.
pub struct PositionManager {
    open: RwLock<Vec<Position>>,
    closed: RwLock<Vec<Position>>,
    /// Remaining bars of post-loss cooldown, keyed by symbol.
    cooldowns: RwLock<HashMap<String, u32>>,
}

impl PositionManager {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self {
            open: RwLock::new(Vec::new()),
            closed: RwLock::new(Vec::new()),
            cooldowns: RwLock::new(HashMap::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Open a new position
    // -------------------------------------------------------------------------

    /// Open a new position and return its UUID.
    pub fn open_position(&self, params: OpenPositionParams<'_>) -> String {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        let original_risk = (params.entry_price - params.stop_loss).abs();

        let pos = Position {
            id: id.clone(),
            symbol: params.symbol.to_string(),
            side: params.side.to_uppercase(),
            entry_price: params.entry_price,
            quantity: params.quantity,
            current_price: params.entry_price,
            unrealized_pnl: 0.0,
            unrealized_pnl_pct: 0.0,
            stop_loss: params.stop_loss,
            original_stop: params.stop_loss,
            original_risk,
            take_profit_1: params.take_profit_1,
            take_profit_2: params.take_profit_2,
            tp1_close_ratio: params.tp1_close_ratio,
            trailing_stop: None,
            trailing_activated: false,
            max_profit_r: 0.0,
            exit_stage: 0,
            breakeven_moved: false,
            entry_strength: params.entry_strength,
            status: PositionStatus::Open,
            opened_at: now,
            closed_at: None,
            close_reason: None,
            realized_pnl: 0.0,
        };

        info!(
            id = %id,
            symbol = params.symbol,
            side = params.side,
            entry_price = params.entry_price,
            quantity = params.quantity,
            stop_loss = params.stop_loss,
            take_profit_1 = params.take_profit_1,
            take_profit_2 = params.take_profit_2,
            tp1_close_ratio = params.tp1_close_ratio,
            "position opened"
        );

        self.open.write().push(pos);
        id
    }

    // -------------------------------------------------------------------------
    // Price updates
    // -------------------------------------------------------------------------

    /// Update the `current_price` for every open position matching `symbol`,
    /// recompute unrealised PnL, and ratchet the trailing stop once activated.
    pub fn update_price(&self, symbol: &str, current_price: f64) {
        let mut positions = self.open.write();
        for pos in positions.iter_mut().filter(|p| p.symbol == symbol) {
            pos.current_price = current_price;
            pos.unrealized_pnl = pos.direction() * (current_price - pos.entry_price) * pos.quantity;
            pos.unrealized_pnl_pct = if pos.entry_price > 0.0 {
                pos.direction() * ((current_price - pos.entry_price) / pos.entry_price) * 100.0
            } else {
                0.0
            };

            let profit_r = pos.profit_in_r(current_price);
            if profit_r > pos.max_profit_r {
                pos.max_profit_r = profit_r;
            }

            if profit_r >= TRAILING_ACTIVATE_PROFIT_R {
                pos.trailing_activated = true;
                let distance = TRAILING_DISTANCE_R * pos.original_risk;
                let candidate = if pos.is_long() {
                    current_price - distance
                } else {
                    current_price + distance
                };
                let ratcheted = match pos.trailing_stop {
                    Some(existing) if pos.is_long() => existing.max(candidate),
                    Some(existing) => existing.min(candidate),
                    None => candidate,
                };
                if pos.trailing_stop != Some(ratcheted) {
                    pos.trailing_stop = Some(ratcheted);
                    debug!(
                        id = %pos.id,
                        trailing_stop = ratcheted,
                        profit_r,
                        "trailing stop ratcheted"
                    );
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Exit checks
    // -------------------------------------------------------------------------

    /// Scan all open positions and return the exit events produced this
    /// tick. TP1 partials and full closes both mutate `self.open` /
    /// `self.closed` in-place; the caller doesn't need to call back in to
    /// apply them, only to act on the returned events (placing/cancelling
    /// exchange orders, arming cooldowns, recording risk outcomes).
    pub fn check_exits(&self) -> Vec<PositionEvent> {
        let mut events = Vec::new();
        let mut positions = self.open.write();
        let mut closed_indices = Vec::new();

        for (idx, pos) in positions.iter_mut().enumerate() {
            let price = pos.current_price;
            let is_long = pos.is_long();

            // --- TP1 (exit-stage 0 only) -------------------------------------
            if pos.exit_stage == 0 {
                let tp1_hit = if is_long {
                    price >= pos.take_profit_1
                } else {
                    price <= pos.take_profit_1
                };
                if tp1_hit {
                    let close_qty = pos.quantity * pos.tp1_close_ratio;
                    let partial_pnl = pos.direction() * (price - pos.entry_price) * close_qty;
                    pos.quantity -= close_qty;
                    pos.realized_pnl += partial_pnl;
                    pos.exit_stage = 1;
                    pos.status = PositionStatus::PartialTP1;

                    let fee_buffer = pos.entry_price * BREAKEVEN_FEE_BUFFER_PCT;
                    pos.stop_loss = if is_long {
                        pos.entry_price + fee_buffer
                    } else {
                        pos.entry_price - fee_buffer
                    };
                    pos.breakeven_moved = true;

                    info!(
                        id = %pos.id,
                        close_qty,
                        residual_qty = pos.quantity,
                        partial_pnl,
                        breakeven_stop = pos.stop_loss,
                        "TP1 partial close executed, stop moved to breakeven"
                    );

                    events.push(PositionEvent::Tp1Partial {
                        id: pos.id.clone(),
                        symbol: pos.symbol.clone(),
                        close_qty,
                        residual_qty: pos.quantity,
                        take_profit_2: pos.take_profit_2,
                    });
                    continue;
                }
            }

            // --- TP2 (exit-stage 1 only: full close) -------------------------
            if pos.exit_stage == 1 {
                let tp2_hit = if is_long {
                    price >= pos.take_profit_2
                } else {
                    price <= pos.take_profit_2
                };
                if tp2_hit {
                    closed_indices.push((idx, "take_profit_2".to_string(), price));
                    continue;
                }
            }

            // --- Effective stop (static or trailing, whichever is tighter) --
            let effective_stop = pos.effective_stop();
            let stop_hit = if is_long {
                price <= effective_stop
            } else {
                price >= effective_stop
            };
            if stop_hit {
                let reason = if pos.trailing_activated && pos.max_profit_r > 0.0 {
                    "trailing_stop"
                } else if pos.breakeven_moved {
                    "breakeven_stop"
                } else {
                    "stop_loss"
                };
                closed_indices.push((idx, reason.to_string(), effective_stop));
            }
        }

        // Close in reverse index order so earlier indices stay valid as we
        // remove entries from the vec.
        closed_indices.sort_by(|a, b| b.0.cmp(&a.0));
        for (idx, reason, close_price) in closed_indices {
            let mut pos = positions.remove(idx);
            let quantity_at_close = pos.quantity;
            let final_pnl = pos.direction() * (close_price - pos.entry_price) * pos.quantity;
            pos.realized_pnl += final_pnl;
            pos.current_price = close_price;
            pos.unrealized_pnl = 0.0;
            pos.unrealized_pnl_pct = 0.0;
            pos.quantity = 0.0;
            pos.status = PositionStatus::Closed;
            pos.closed_at = Some(Utc::now().to_rfc3339());
            pos.close_reason = Some(reason.clone());

            let is_loss = pos.realized_pnl < 0.0;
            if is_loss {
                self.arm_cooldown(&pos.symbol);
            }

            info!(
                id = %pos.id,
                symbol = %pos.symbol,
                reason = %reason,
                close_price,
                realized_pnl = pos.realized_pnl,
                "position closed"
            );

            events.push(PositionEvent::FullClose {
                id: pos.id.clone(),
                symbol: pos.symbol.clone(),
                side: pos.side.clone(),
                quantity: quantity_at_close,
                reason,
                close_price,
                realized_pnl: pos.realized_pnl,
                is_loss,
            });

            self.closed.write().push(pos);
        }

        events
    }

    // -------------------------------------------------------------------------
    // Close a position (manual / executor-driven, e.g. reconciliation)
    // -------------------------------------------------------------------------

    /// Close a position by `id` and move it to the closed list.
    ///
    /// Returns the total realised PnL (partial + final) if the position was
    /// found, or `None` if no matching open position exists.
    pub fn close_position(&self, id: &str, reason: &str, close_price: f64) -> Option<f64> {
        let mut open = self.open.write();
        let idx = open.iter().position(|p| p.id == id)?;
        let mut pos = open.remove(idx);

        let final_pnl = pos.direction() * (close_price - pos.entry_price) * pos.quantity;
        pos.realized_pnl += final_pnl;
        pos.current_price = close_price;
        pos.unrealized_pnl = 0.0;
        pos.unrealized_pnl_pct = 0.0;
        pos.status = PositionStatus::Closed;
        pos.closed_at = Some(Utc::now().to_rfc3339());
        pos.close_reason = Some(reason.to_string());
        pos.quantity = 0.0;

        let total_pnl = pos.realized_pnl;
        if total_pnl < 0.0 {
            self.arm_cooldown(&pos.symbol);
        }

        info!(id, reason, close_price, realized_pnl = total_pnl, "position closed");

        self.closed.write().push(pos);
        Some(total_pnl)
    }

    /// Force-close a cached position that the exchange no longer reports
    /// (spec.md §4.K reconciliation: "if the exchange has no position and
    /// the cache holds one, force-close the cached record").
    pub fn force_close_untracked(&self, symbol: &str) {
        let id = {
            let open = self.open.read();
            open.iter().find(|p| p.symbol == symbol).map(|p| p.id.clone())
        };
        if let Some(id) = id {
            warn!(symbol, id, "forcing close of position absent from exchange");
            let price = self.open.read().iter().find(|p| p.id == id).map(|p| p.current_price).unwrap_or(0.0);
            self.close_position(&id, "reconcile_force_close", price);
        }
    }

    // -------------------------------------------------------------------------
    // Reversal gate
    // -------------------------------------------------------------------------

    /// Whether a counter-side signal of `new_strength` is strong enough to
    /// be accepted against the existing open position on `symbol`, per the
    /// regime-dependent reversal gate (spec.md §4.K). Returns `true` (no
    /// gate to apply) when there's no open position, or it's same-side.
    pub fn reversal_gate_allows(&self, symbol: &str, new_side: &str, new_strength: f64, threshold: f64) -> bool {
        let open = self.open.read();
        let Some(existing) = open.iter().find(|p| p.symbol == symbol) else {
            return true;
        };
        if existing.side == new_side.to_uppercase() {
            return true;
        }
        new_strength >= existing.entry_strength * threshold
    }

    // -------------------------------------------------------------------------
    // Loss cooldown
    // -------------------------------------------------------------------------

    fn arm_cooldown(&self, symbol: &str) {
        self.cooldowns.write().insert(symbol.to_string(), LOSS_COOLDOWN_BARS);
    }

    /// Decrement all active cooldowns by one bar; call once per closed bar.
    pub fn tick_cooldowns(&self) {
        let mut cooldowns = self.cooldowns.write();
        cooldowns.retain(|_, bars| {
            *bars = bars.saturating_sub(1);
            *bars > 0
        });
    }

    pub fn in_cooldown(&self, symbol: &str) -> bool {
        self.cooldowns.read().get(symbol).is_some_and(|b| *b > 0)
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Return a snapshot of all currently open positions.
    pub fn get_open_positions(&self) -> Vec<Position> {
        self.open.read().clone()
    }

    pub fn get_open_position_for_symbol(&self, symbol: &str) -> Option<Position> {
        self.open.read().iter().find(|p| p.symbol == symbol).cloned()
    }

    /// Return the most recent `count` closed positions (newest first).
    pub fn get_closed_positions(&self, count: usize) -> Vec<Position> {
        let closed = self.closed.read();
        closed.iter().rev().take(count).cloned().collect()
    }
}

impl Default for PositionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PositionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let open_count = self.open.read().len();
        let closed_count = self.closed.read().len();
        f.debug_struct("PositionManager")
            .field("open_positions", &open_count)
            .field("closed_positions", &closed_count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_long(pm: &PositionManager, entry: f64, stop: f64, tp1: f64, tp2: f64) -> String {
        pm.open_position(OpenPositionParams {
            symbol: "BTCUSDT",
            side: "BUY",
            entry_price: entry,
            quantity: 1.0,
            stop_loss: stop,
            take_profit_1: tp1,
            take_profit_2: tp2,
            tp1_close_ratio: 0.5,
            entry_strength: 1.0,
        })
    }

    #[test]
    fn tp1_partial_moves_stop_to_breakeven() {
        let pm = PositionManager::new();
        open_long(&pm, 100.0, 98.0, 102.0, 106.0);
        pm.update_price("BTCUSDT", 102.0);
        let events = pm.check_exits();
        assert_eq!(events.len(), 1);
        match &events[0] {
            PositionEvent::Tp1Partial { close_qty, residual_qty, .. } => {
                assert_eq!(*close_qty, 0.5);
                assert_eq!(*residual_qty, 0.5);
            }
            _ => panic!("expected Tp1Partial"),
        }
        let pos = pm.get_open_position_for_symbol("BTCUSDT").unwrap();
        assert_eq!(pos.exit_stage, 1);
        assert!(pos.stop_loss > 100.0); // breakeven + fee buffer
    }

    #[test]
    fn trailing_stop_activates_and_ratchets() {
        let pm = PositionManager::new();
        open_long(&pm, 100.0, 98.0, 1000.0, 2000.0); // TP far away, never hit
        pm.update_price("BTCUSDT", 101.6); // profit_in_R = 1.6/2 = 0.8 -> activates
        pm.update_price("BTCUSDT", 105.0); // ratchets further
        let pos = pm.get_open_position_for_symbol("BTCUSDT").unwrap();
        assert!(pos.trailing_activated);
        assert!(pos.trailing_stop.unwrap() > 100.0);

        // Price drops below the trailing stop -> closes as trailing_stop.
        pm.update_price("BTCUSDT", pos.trailing_stop.unwrap() - 0.01);
        let events = pm.check_exits();
        assert_eq!(events.len(), 1);
        match &events[0] {
            PositionEvent::FullClose { reason, is_loss, .. } => {
                assert_eq!(reason, "trailing_stop");
                assert!(!is_loss);
            }
            _ => panic!("expected FullClose"),
        }
    }

    #[test]
    fn stop_loss_exit_arms_cooldown() {
        let pm = PositionManager::new();
        open_long(&pm, 100.0, 98.0, 110.0, 120.0);
        pm.update_price("BTCUSDT", 97.0);
        let events = pm.check_exits();
        match &events[0] {
            PositionEvent::FullClose { reason, is_loss, .. } => {
                assert_eq!(reason, "stop_loss");
                assert!(*is_loss);
            }
            _ => panic!("expected FullClose"),
        }
        assert!(pm.in_cooldown("BTCUSDT"));
        pm.tick_cooldowns();
        pm.tick_cooldowns();
        assert!(pm.in_cooldown("BTCUSDT"));
        pm.tick_cooldowns();
        assert!(!pm.in_cooldown("BTCUSDT"));
    }

    #[test]
    fn reversal_gate_rejects_weak_counter_signal() {
        let pm = PositionManager::new();
        open_long(&pm, 100.0, 98.0, 110.0, 120.0); // entry_strength = 1.0
        assert!(!pm.reversal_gate_allows("BTCUSDT", "SELL", 1.1, 1.3));
        assert!(pm.reversal_gate_allows("BTCUSDT", "SELL", 1.4, 1.3));
        // Same side is never gated.
        assert!(pm.reversal_gate_allows("BTCUSDT", "BUY", 0.1, 1.3));
    }

    #[test]
    fn no_open_position_is_never_gated() {
        let pm = PositionManager::new();
        assert!(pm.reversal_gate_allows("ETHUSDT", "SELL", 0.01, 1.5));
    }
}
