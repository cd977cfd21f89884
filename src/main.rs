// =============================================================================
// Brooks Price-Action Engine — Main Entry Point
// =============================================================================
//
// The engine starts in Demo + Paused mode for safety. Users must explicitly
// switch to Live mode via the dashboard or API. It watches a single symbol
// (spec.md §4.A), so every background task below is spawned once rather than
// per-symbol.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod binance;
mod constants;
mod decision_envelope;
mod delta_engine;
mod execution;
mod exit;
mod filters;
mod hl_counter;
mod htf_filter;
mod indicators;
mod market_data;
mod market_state;
mod patterns;
mod position_engine;
mod reconcile;
mod risk;
mod runtime_config;
mod state_machines;
mod stop_loss;
mod strategy;
mod swing_tracker;
mod take_profit;
mod trade_insurance;
mod types;

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::execution::{EntryProposal, ExecutionEngine, ExecutionResult};
use crate::htf_filter::HtfFilter;
use crate::runtime_config::RuntimeConfig;
use crate::strategy::StrategyEngine;
use crate::types::AccountMode;

/// Backoff schedule for WebSocket reconnects (spec.md §5): 1s, 2s, 4s, ...
/// capped at 60s, reset to the start after each successful connection.
const RECONNECT_BACKOFF_CAP_SECS: u64 = 60;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Brooks price-action engine starting up");

    let mut config = RuntimeConfig::load("runtime_config.json").unwrap_or_else(|e| {
        warn!(error = %e, "failed to load runtime config, using defaults");
        RuntimeConfig::default()
    });

    // SAFETY: force Demo + Paused on startup regardless of the saved config.
    config.trading_mode = types::TradingMode::Paused;
    config.account_mode = AccountMode::Demo;

    if let Ok(sym) = std::env::var("SYMBOL") {
        if !sym.trim().is_empty() {
            config.symbol = sym.trim().to_uppercase();
        }
    }
    if let Ok(interval) = std::env::var("KLINE_INTERVAL") {
        if !interval.trim().is_empty() {
            config.kline_interval = interval.trim().to_string();
        }
    }

    info!(
        symbol = %config.symbol,
        interval = %config.kline_interval,
        trading_mode = %config.trading_mode,
        account_mode = %config.account_mode,
        "engine starting in SAFE mode (Demo + Paused)"
    );

    let symbol = config.symbol.clone();

    // ── 2. Build shared state ────────────────────────────────────────────
    let state = Arc::new(AppState::new(config));

    // ── 3. Build the exchange client ─────────────────────────────────────
    let api_key = std::env::var("BINANCE_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("BINANCE_API_SECRET").unwrap_or_default();
    if state.runtime_config.read().account_mode == AccountMode::Live
        && (api_key.is_empty() || api_secret.is_empty())
    {
        anyhow::bail!("live mode requires BINANCE_API_KEY and BINANCE_API_SECRET");
    }
    let binance_client = Arc::new(binance::client::BinanceClient::new(api_key, api_secret));

    // ── 4. Market data streams ───────────────────────────────────────────
    spawn_reconnecting(format!("kline[{symbol}]"), {
        let cb = state.candle_buffer.clone();
        let interval = state.runtime_config.read().kline_interval.clone();
        let sym = symbol.clone();
        move || {
            let cb = cb.clone();
            let interval = interval.clone();
            let sym = sym.clone();
            async move { market_data::candle_buffer::run_kline_stream(&sym, &interval, &cb).await }
        }
    });

    spawn_reconnecting(format!("aggtrade[{symbol}]"), {
        let processor = state.trade_processor.clone();
        let delta = state.delta_engine.clone();
        let sym = symbol.clone();
        move || {
            let processor = processor.clone();
            let delta = delta.clone();
            let sym = sym.clone();
            async move { market_data::trade_stream::run_trade_stream(&sym, &processor, &delta).await }
        }
    });

    spawn_reconnecting(format!("depth[{symbol}]"), {
        let ob = state.orderbook_manager.clone();
        let sym = symbol.clone();
        move || {
            let ob = ob.clone();
            let sym = sym.clone();
            async move { market_data::orderbook::run_depth_stream(&sym, &ob).await }
        }
    });

    // ── 5. HTF poller (spec.md §4.H) ─────────────────────────────────────
    tokio::spawn(run_htf_poller(
        binance_client.clone(),
        state.htf_filter.clone(),
        symbol.clone(),
    ));

    // ── 6. Dashboard API server ───────────────────────────────────────────
    let api_state = state.clone();
    let bind_addr = std::env::var("API_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3001".into());
    tokio::spawn(async move {
        let app = api::rest::router(api_state);
        match tokio::net::TcpListener::bind(&bind_addr).await {
            Ok(listener) => {
                info!(addr = %bind_addr, "dashboard API listening");
                if let Err(e) = axum::serve(listener, app).await {
                    error!(error = %e, "dashboard API server terminated");
                }
            }
            Err(e) => error!(addr = %bind_addr, error = %e, "failed to bind dashboard API"),
        }
    });

    // ── 7. Execution engine + exit monitor ───────────────────────────────
    let exec_engine = Arc::new(ExecutionEngine::new(
        binance_client.clone(),
        state.position_manager.clone(),
        state.risk_engine.clone(),
    ));

    tokio::spawn(exit::monitor::run_exit_monitor(state.clone(), exec_engine.clone()));

    // ── 8. Strategy loop — one evaluation per closed bar ─────────────────
    tokio::spawn(run_strategy_loop(state.clone(), exec_engine.clone(), symbol.clone()));

    // ── 9. Reconciliation loop (live mode only, spec.md §4.K) ────────────
    tokio::spawn(run_reconcile_loop(state.clone(), binance_client.clone()));

    info!("all subsystems running; press Ctrl+C to stop");

    // ── 10. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received, stopping gracefully");

    if let Err(e) = state.runtime_config.read().save("runtime_config.json") {
        error!(error = %e, "failed to save runtime config on shutdown");
    }

    info!("engine shut down complete");
    Ok(())
}

/// Spawn a task that re-runs `make_attempt` forever, applying exponential
/// backoff (1s, 2s, 4s, ... capped at 60s, up to 10 attempts before the cap
/// repeats) between failed or dropped connections (spec.md §5).
fn spawn_reconnecting<F, Fut>(label: String, make_attempt: F)
where
    F: Fn() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = anyhow::Result<()>> + Send,
{
    tokio::spawn(async move {
        let mut backoff_secs = 1u64;
        loop {
            match make_attempt().await {
                Ok(()) => {
                    warn!(stream = %label, "stream closed cleanly, reconnecting");
                    backoff_secs = 1;
                }
                Err(e) => {
                    error!(stream = %label, error = %e, backoff_secs, "stream error, reconnecting");
                }
            }
            tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
            backoff_secs = (backoff_secs * 2).min(RECONNECT_BACKOFF_CAP_SECS);
        }
    });
}

/// Poll 1h klines on the HTF filter's fixed cadence and refresh its snapshot
/// (spec.md §4.H). Failures are logged and retried on the next tick; a stale
/// snapshot degrades the HTF gate to "no opinion" rather than blocking entry.
async fn run_htf_poller(client: Arc<binance::client::BinanceClient>, htf: Arc<HtfFilter>, symbol: String) {
    let mut ticker = tokio::time::interval(HtfFilter::update_interval());
    loop {
        ticker.tick().await;
        match client.get_klines(&symbol, "1h", 100).await {
            Ok(candles) => match htf.refresh(&candles) {
                Ok(snapshot) => info!(symbol = %symbol, trend = ?snapshot.trend, "HTF snapshot refreshed"),
                Err(e) => warn!(symbol = %symbol, error = %e, "HTF refresh rejected candle window"),
            },
            Err(e) => warn!(symbol = %symbol, error = %e, "failed to fetch HTF klines"),
        }
    }
}

/// Evaluate the tracked symbol once per tick, routing any emitted trade
/// proposal to the execution engine (spec.md §4.J / §4.L).
async fn run_strategy_loop(state: Arc<AppState>, exec_engine: Arc<ExecutionEngine>, symbol: String) {
    tokio::time::sleep(Duration::from_secs(30)).await;
    info!("strategy loop starting");

    let mut ticker = tokio::time::interval(Duration::from_secs(5));
    loop {
        ticker.tick().await;

        if let Some(spread) = state.orderbook_manager.spread_bps(&symbol) {
            state.spread_filter.write().push(spread);
        }

        let (envelope, proposal) = StrategyEngine::evaluate_symbol(&state, &symbol);
        state.push_decision(envelope);

        let Some(prop) = proposal else { continue };
        let is_demo = state.runtime_config.read().account_mode == AccountMode::Demo;

        let result = exec_engine
            .execute_entry(
                EntryProposal {
                    symbol: &prop.symbol,
                    side: &prop.side,
                    family: prop.family,
                    limit_price: prop.entry_price,
                    quantity: prop.quantity,
                    stop_loss: prop.stop_loss,
                    take_profit_1: prop.take_profit_1,
                    take_profit_2: prop.take_profit_2,
                    tp1_close_ratio: prop.tp1_close_ratio,
                    entry_strength: prop.entry_strength,
                },
                is_demo,
            )
            .await;

        info!(symbol = %prop.symbol, side = %prop.side, family = ?prop.family, result = %result, "trade proposal executed");
        if matches!(result, ExecutionResult::Blocked(_) | ExecutionResult::Error(_)) {
            state.push_error(format!("{symbol}: execution not placed — {result}"));
        }
        state.increment_version();
    }
}

/// Periodically reconcile internal position/balance state against the
/// exchange (spec.md §4.K "Reconciliation"). A no-op in Demo mode, since
/// there is no exchange state to drift from.
async fn run_reconcile_loop(state: Arc<AppState>, client: Arc<binance::client::BinanceClient>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(60));
    loop {
        ticker.tick().await;

        if state.runtime_config.read().account_mode == AccountMode::Demo {
            continue;
        }

        match reconcile::reconcile_once(&client, &state.position_manager, &state.balances).await {
            Ok(result) => {
                *state.last_reconcile_ok.write() = Some(std::time::Instant::now());
                *state.last_reconcile_error.write() = None;
                info!(
                    matched = result.positions_matched,
                    orphans = result.orphan_orders,
                    balance_drift = result.balance_drift,
                    "reconciliation pass complete"
                );
            }
            Err(e) => {
                *state.last_reconcile_error.write() = Some(format!("{e}"));
                warn!(error = %e, "reconciliation failed");
            }
        }
        state.increment_version();
    }
}
