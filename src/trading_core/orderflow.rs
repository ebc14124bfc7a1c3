//! Order-flow delta analysis over the aggregated-trade stream.
//!
//! Price moves because the aggressive side eats the passive side's book.
//! The analyser keeps a rolling window of trades (sized from the primary
//! bar period, fixed at construction), computes signed volume and its
//! derivatives, and flags the three conditions the dispatcher cares about:
//! absorption (delta without movement), climax (extreme one-sided flow),
//! and liquidity withdrawal (movement without flow).
//!
//! The whole module is optional. Disabled, every query returns the neutral
//! multiplier and the engine behaves as if the trade stream didn't exist.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::types::{AggTrade, Side};

/// Hard cap on buffered trades regardless of window size.
const MAX_BUFFERED_TRADES: usize = 2_000_000;
/// Assumed worst-case trades-per-second when sizing the buffer.
const EXTREME_TPS: usize = 5_000;
/// Secondary window for acceleration and short-term trend.
const SHORT_WINDOW: Duration = Duration::from_secs(60);

/// Signal boost: flow confirms the signal direction.
pub const FLOW_BOOST: f64 = 1.2;
/// Signal suppression: flow strongly contradicts it. The dispatcher drops
/// any signal carrying this multiplier.
pub const FLOW_SUPPRESS: f64 = 0.3;
pub const FLOW_NEUTRAL: f64 = 1.0;

/// How the dispatcher classifies a signal for flow modulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowClass {
    /// Trend-continuation entries: boosted by confirming flow, suppressed
    /// by strong counter-flow.
    TrendContinuation,
    /// Wedge buys get the divergence boost (price pressing down while
    /// selling pressure dries up).
    WedgeBuy,
    /// Everything else: only suppressed, never boosted.
    Other,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DeltaSnapshot {
    /// Cumulative signed volume over the primary window.
    pub delta: f64,
    pub buy_volume: f64,
    pub sell_volume: f64,
    /// delta / total volume, in [-1, 1].
    pub delta_ratio: f64,
    /// Mean of recent window deltas.
    pub delta_avg: f64,
    /// Short-window delta minus its predecessor.
    pub delta_acceleration: f64,
    /// Price change over the window as a percentage.
    pub price_change_pct: f64,
    pub is_absorption: bool,
    pub is_climax_buy: bool,
    pub is_climax_sell: bool,
    pub is_liquidity_withdrawal: bool,
    pub trade_count: usize,
}

pub struct DeltaAnalyzer {
    enabled: bool,
    window: Duration,
    max_trades: usize,
    buf: VecDeque<AggTrade>,
    /// Recent short-window deltas for average / acceleration.
    delta_history: VecDeque<f64>,
    last_short_mark: Option<DateTime<Utc>>,
}

impl DeltaAnalyzer {
    /// `bar_period` fixes the primary window; it is never reconfigured
    /// after start.
    pub fn new(enabled: bool, bar_period: Duration) -> Self {
        let max_trades = (bar_period.as_secs() as usize * EXTREME_TPS).min(MAX_BUFFERED_TRADES);
        Self {
            enabled,
            window: bar_period,
            max_trades,
            buf: VecDeque::new(),
            delta_history: VecDeque::new(),
            last_short_mark: None,
        }
    }

    pub fn add_trade(&mut self, trade: AggTrade) {
        if !self.enabled {
            return;
        }
        self.buf.push_back(trade);
        if self.buf.len() > self.max_trades {
            self.buf.pop_front();
        }
        self.prune(trade.time);
        self.roll_short_window(trade.time);
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now - chrono::Duration::from_std(self.window).unwrap_or_default();
        while let Some(front) = self.buf.front() {
            if front.time < cutoff {
                self.buf.pop_front();
            } else {
                break;
            }
        }
    }

    fn roll_short_window(&mut self, now: DateTime<Utc>) {
        let due = match self.last_short_mark {
            Some(t) => (now - t).to_std().map(|d| d >= SHORT_WINDOW).unwrap_or(true),
            None => true,
        };
        if !due {
            return;
        }
        let cutoff = now - chrono::Duration::from_std(SHORT_WINDOW).unwrap_or_default();
        let short_delta: f64 = self
            .buf
            .iter()
            .rev()
            .take_while(|t| t.time >= cutoff)
            .map(|t| t.signed_qty())
            .sum();
        self.delta_history.push_back(short_delta);
        if self.delta_history.len() > 20 {
            self.delta_history.pop_front();
        }
        self.last_short_mark = Some(now);
    }

    pub fn snapshot(&self) -> DeltaSnapshot {
        if !self.enabled || self.buf.is_empty() {
            return DeltaSnapshot::default();
        }

        let mut buy = 0.0;
        let mut sell = 0.0;
        for t in &self.buf {
            if t.buyer_is_maker {
                sell += t.qty;
            } else {
                buy += t.qty;
            }
        }
        let delta = buy - sell;
        let total = buy + sell;
        let ratio = if total > 0.0 { delta / total } else { 0.0 };

        let first_px = self.buf.front().map(|t| t.price).unwrap_or(0.0);
        let last_px = self.buf.back().map(|t| t.price).unwrap_or(0.0);
        let price_change_pct = if first_px > 0.0 {
            (last_px - first_px) / first_px * 100.0
        } else {
            0.0
        };

        let delta_avg = if self.delta_history.is_empty() {
            delta
        } else {
            self.delta_history.iter().sum::<f64>() / self.delta_history.len() as f64
        };
        let delta_acceleration = match self.delta_history.len() {
            0 | 1 => 0.0,
            n => self.delta_history[n - 1] - self.delta_history[n - 2],
        };

        // Absorption: heavy one-sided flow that the price ignores.
        let is_absorption = ratio.abs() > 0.3 && price_change_pct.abs() < 0.05;
        // Climax: extreme one-sided flow.
        let is_climax_buy = ratio > 0.6 && delta > delta_avg.abs() * 2.0;
        let is_climax_sell = ratio < -0.6 && -delta > delta_avg.abs() * 2.0;
        // Liquidity withdrawal: price runs with little flow behind it.
        let is_liquidity_withdrawal = price_change_pct.abs() > 0.15 && ratio.abs() < 0.1;

        DeltaSnapshot {
            delta,
            buy_volume: buy,
            sell_volume: sell,
            delta_ratio: ratio,
            delta_avg,
            delta_acceleration,
            price_change_pct,
            is_absorption,
            is_climax_buy,
            is_climax_sell,
            is_liquidity_withdrawal,
            trade_count: self.buf.len(),
        }
    }

    /// The per-signal multiplier the dispatcher consults. Always neutral
    /// when the analyser is disabled or has seen no trades.
    pub fn modifier(&self, side: Side, class: FlowClass) -> f64 {
        if !self.enabled {
            return FLOW_NEUTRAL;
        }
        let snap = self.snapshot();
        if snap.trade_count == 0 {
            return FLOW_NEUTRAL;
        }

        let with_flow = match side {
            Side::Buy => snap.delta_ratio,
            Side::Sell => -snap.delta_ratio,
        };

        // Strong counter-flow kills the signal regardless of class.
        if with_flow < -0.3 {
            return FLOW_SUPPRESS;
        }
        // Absorption against the signal direction also kills it: someone is
        // quietly taking the other side of that flow.
        if snap.is_absorption && with_flow < 0.0 {
            return FLOW_SUPPRESS;
        }

        match class {
            FlowClass::TrendContinuation => {
                if with_flow > 0.3 {
                    FLOW_BOOST
                } else {
                    FLOW_NEUTRAL
                }
            }
            FlowClass::WedgeBuy => {
                // Divergence boost: price pressing lower while selling
                // pressure fades (delta improving).
                if snap.price_change_pct < 0.0 && snap.delta_acceleration > 0.0 {
                    FLOW_BOOST
                } else {
                    FLOW_NEUTRAL
                }
            }
            FlowClass::Other => FLOW_NEUTRAL,
        }
    }
}
