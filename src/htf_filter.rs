//! Higher-timeframe (1h) trend filter (spec.md §4.G).
//!
//! Polls 1h klines on a slow interval, classifies the EMA20 trend/slope, and
//! exposes both a hard gate (H2/L2 require a strong aligned trend and price
//! near the EMA) and a soft multiplier applied to every other signal.

use anyhow::{Context, Result};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::constants::{
    HTF_COUNTER_TREND_FACTOR, HTF_EMA_PERIOD, HTF_NEUTRAL_FACTOR, HTF_PRICE_NEAR_EMA_PCT,
    HTF_SLOPE_LOOKBACK_BARS, HTF_SLOPE_THRESHOLD_PCT, HTF_STRONG_SLOPE_THRESHOLD_PCT,
    HTF_TREND_BOOST_FACTOR, HTF_UPDATE_INTERVAL_SECONDS, Side,
};
use crate::indicators::ema::calculate_ema;
use crate::market_data::Candle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum HtfTrend {
    StrongUp,
    Up,
    Neutral,
    Down,
    StrongDown,
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct HtfSnapshot {
    pub trend: HtfTrend,
    pub ema: f64,
    pub slope_pct: f64,
    pub last_close: f64,
    pub updated_at_ms: i64,
}

impl HtfSnapshot {
    pub fn allow_buy(&self) -> bool {
        matches!(self.trend, HtfTrend::StrongUp | HtfTrend::Up)
    }

    pub fn allow_sell(&self) -> bool {
        matches!(self.trend, HtfTrend::StrongDown | HtfTrend::Down)
    }

    fn near_ema(&self) -> bool {
        if self.ema <= 0.0 {
            return false;
        }
        ((self.last_close - self.ema) / self.ema).abs() <= HTF_PRICE_NEAR_EMA_PCT
    }
}

/// Fetches 1h klines and maintains the current HTF snapshot behind a lock so
/// multiple per-symbol workers can read it without re-polling.
pub struct HtfFilter {
    symbol: String,
    snapshot: RwLock<Option<HtfSnapshot>>,
}

impl HtfFilter {
    pub fn new(symbol: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            symbol: symbol.into(),
            snapshot: RwLock::new(None),
        })
    }

    pub fn update_interval() -> std::time::Duration {
        std::time::Duration::from_secs(HTF_UPDATE_INTERVAL_SECONDS)
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn snapshot(&self) -> Option<HtfSnapshot> {
        *self.snapshot.read()
    }

    /// Recompute the HTF snapshot from a freshly fetched 1h kline window
    /// (oldest first, most recent candle last, closed bars only).
    #[instrument(skip(self, candles), fields(symbol = %self.symbol))]
    pub fn refresh(&self, candles: &[Candle]) -> Result<HtfSnapshot> {
        let need = HTF_EMA_PERIOD + HTF_SLOPE_LOOKBACK_BARS + 1;
        anyhow::ensure!(
            candles.len() >= need,
            "need at least {need} 1h candles, got {}",
            candles.len()
        );

        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let ema_now = *calculate_ema(&closes, HTF_EMA_PERIOD)
            .last()
            .context("ema calculation failed on htf candles")?;

        let prior_closes = &closes[..closes.len() - HTF_SLOPE_LOOKBACK_BARS];
        let ema_prior = *calculate_ema(prior_closes, HTF_EMA_PERIOD)
            .last()
            .context("ema calculation failed on prior htf window")?;

        let slope_pct = if ema_prior.abs() > f64::EPSILON {
            (ema_now - ema_prior) / ema_prior
        } else {
            0.0
        };

        let last_close = *closes.last().unwrap();
        let trend = classify_trend(slope_pct, last_close, ema_now);

        let snap = HtfSnapshot {
            trend,
            ema: ema_now,
            slope_pct,
            last_close,
            updated_at_ms: candles.last().map(|c| c.close_time).unwrap_or(0),
        };
        debug!(?trend, slope_pct, "htf snapshot updated");
        *self.snapshot.write() = Some(snap);
        Ok(snap)
    }

    /// Hard gate consulted before arming an H2/L2 signal.
    pub fn should_allow_signal(&self, side: Side) -> bool {
        match self.snapshot() {
            None => true, // fail-open until the first poll completes
            Some(s) => match side {
                Side::Buy => s.allow_buy() && s.near_ema(),
                Side::Sell => s.allow_sell() && s.near_ema(),
            },
        }
    }

    /// Soft multiplier applied to every non-H2/L2 signal's confidence.
    pub fn signal_modifier(&self, side: Side) -> f64 {
        match self.snapshot() {
            None => HTF_NEUTRAL_FACTOR,
            Some(s) => {
                let aligned = matches!(
                    (side, s.trend),
                    (Side::Buy, HtfTrend::StrongUp | HtfTrend::Up)
                        | (Side::Sell, HtfTrend::StrongDown | HtfTrend::Down)
                );
                let counter = matches!(
                    (side, s.trend),
                    (Side::Buy, HtfTrend::StrongDown | HtfTrend::Down)
                        | (Side::Sell, HtfTrend::StrongUp | HtfTrend::Up)
                );
                if aligned {
                    HTF_TREND_BOOST_FACTOR
                } else if counter {
                    HTF_COUNTER_TREND_FACTOR
                } else {
                    HTF_NEUTRAL_FACTOR
                }
            }
        }
    }
}

fn classify_trend(slope_pct: f64, last_close: f64, ema: f64) -> HtfTrend {
    let above = last_close > ema;
    if slope_pct >= HTF_STRONG_SLOPE_THRESHOLD_PCT && above {
        HtfTrend::StrongUp
    } else if slope_pct <= -HTF_STRONG_SLOPE_THRESHOLD_PCT && !above {
        HtfTrend::StrongDown
    } else if slope_pct >= HTF_SLOPE_THRESHOLD_PCT {
        HtfTrend::Up
    } else if slope_pct <= -HTF_SLOPE_THRESHOLD_PCT {
        HtfTrend::Down
    } else {
        HtfTrend::Neutral
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(close: f64, t: i64) -> Candle {
        Candle {
            open_time: t,
            close_time: t,
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 10.0,
            quote_volume: 10.0,
            trades_count: 5,
            taker_buy_volume: 5.0,
            taker_buy_quote_volume: 5.0,
            is_closed: true,
        }
    }

    #[test]
    fn insufficient_candles_errs() {
        let filter = HtfFilter::new("BTCUSDT");
        let candles: Vec<Candle> = (0..5).map(|i| candle(100.0 + i as f64, i)).collect();
        assert!(filter.refresh(&candles).is_err());
    }

    #[test]
    fn strong_uptrend_classified() {
        let filter = HtfFilter::new("BTCUSDT");
        let n = 40;
        let candles: Vec<Candle> = (0..n)
            .map(|i| candle(100.0 + i as f64 * 1.5, i as i64))
            .collect();
        let snap = filter.refresh(&candles).unwrap();
        assert!(matches!(snap.trend, HtfTrend::StrongUp | HtfTrend::Up));
        assert!(filter.should_allow_signal(Side::Buy) || !snap.allow_buy());
    }
}
