//! Price-action signal detectors.
//!
//! Each detector is a per-bar function of the snapshot plus the shared scan
//! context, returning `Option<Signal>`. Detectors are grouped the way the
//! dispatcher runs them: trend-continuation first, reversals second.

pub mod continuation;
pub mod reversal;
#[cfg(test)]
pub(crate) mod testkit;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::trading_core::bars::MarketSnapshot;
use crate::trading_core::filters::{CooldownTracker, GapTwentyRule};
use crate::trading_core::hl_counter::HlCounter;
use crate::trading_core::market_state::MarketStateTracker;
use crate::trading_core::orderflow::FlowClass;
use crate::trading_core::swings::SwingTracker;
use crate::types::{HtfDirection, Side};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalKind {
    SpikeBuy,
    SpikeSell,
    SpikeMarketBuy,
    SpikeMarketSell,
    MicroChannelBuy,
    MicroChannelSell,
    H1Buy,
    H2Buy,
    L1Sell,
    L2Sell,
    GapBarBuy,
    GapBarSell,
    TrendBarBuy,
    TrendBarSell,
    TrBreakoutBuy,
    TrBreakoutSell,
    BreakoutPullbackBuy,
    BreakoutPullbackSell,
    ClimaxBuy,
    ClimaxSell,
    WedgeBuy,
    WedgeSell,
    MtrBuy,
    MtrSell,
    FailedBreakoutBuy,
    FailedBreakoutSell,
    DoubleBottomBuy,
    DoubleTopSell,
    OutsideBarBuy,
    OutsideBarSell,
    ReversalBarBuy,
    ReversalBarSell,
    IiBuy,
    IiSell,
    MeasuredMoveBuy,
    MeasuredMoveSell,
    FinalFlagBuy,
    FinalFlagSell,
}

impl SignalKind {
    pub fn side(self) -> Side {
        use SignalKind::*;
        match self {
            SpikeBuy | SpikeMarketBuy | MicroChannelBuy | H1Buy | H2Buy | GapBarBuy
            | TrendBarBuy | TrBreakoutBuy | BreakoutPullbackBuy | ClimaxBuy | WedgeBuy | MtrBuy
            | FailedBreakoutBuy | DoubleBottomBuy | OutsideBarBuy | ReversalBarBuy | IiBuy
            | MeasuredMoveBuy | FinalFlagBuy => Side::Buy,
            _ => Side::Sell,
        }
    }

    /// Reversal signals trade against the prevailing move and face the
    /// strong-trend and Spike-cycle gates.
    pub fn is_reversal(self) -> bool {
        use SignalKind::*;
        matches!(
            self,
            ClimaxBuy
                | ClimaxSell
                | WedgeBuy
                | WedgeSell
                | MtrBuy
                | MtrSell
                | FailedBreakoutBuy
                | FailedBreakoutSell
                | DoubleBottomBuy
                | DoubleTopSell
                | OutsideBarBuy
                | OutsideBarSell
                | ReversalBarBuy
                | ReversalBarSell
                | IiBuy
                | IiSell
                | MeasuredMoveBuy
                | MeasuredMoveSell
                | FinalFlagBuy
                | FinalFlagSell
        )
    }

    /// Classification consulted by the order-flow modifier.
    pub fn flow_class(self) -> FlowClass {
        use SignalKind::*;
        match self {
            WedgeBuy => FlowClass::WedgeBuy,
            SpikeBuy | SpikeSell | SpikeMarketBuy | SpikeMarketSell | MicroChannelBuy
            | MicroChannelSell | H1Buy | H2Buy | L1Sell | L2Sell | GapBarBuy | GapBarSell
            | TrendBarBuy | TrendBarSell | TrBreakoutBuy | TrBreakoutSell | BreakoutPullbackBuy
            | BreakoutPullbackSell => FlowClass::TrendContinuation,
            _ => FlowClass::Other,
        }
    }

    /// Stable name used at the journal/log boundary.
    pub fn as_str(self) -> &'static str {
        use SignalKind::*;
        match self {
            SpikeBuy => "Spike_Buy",
            SpikeSell => "Spike_Sell",
            SpikeMarketBuy => "Spike_Market_Buy",
            SpikeMarketSell => "Spike_Market_Sell",
            MicroChannelBuy => "MicroChannel_Buy",
            MicroChannelSell => "MicroChannel_Sell",
            H1Buy => "H1_Buy",
            H2Buy => "H2_Buy",
            L1Sell => "L1_Sell",
            L2Sell => "L2_Sell",
            GapBarBuy => "GapBar_Buy",
            GapBarSell => "GapBar_Sell",
            TrendBarBuy => "TrendBar_Buy",
            TrendBarSell => "TrendBar_Sell",
            TrBreakoutBuy => "TRBreakout_Buy",
            TrBreakoutSell => "TRBreakout_Sell",
            BreakoutPullbackBuy => "BreakoutPullback_Buy",
            BreakoutPullbackSell => "BreakoutPullback_Sell",
            ClimaxBuy => "Climax_Buy",
            ClimaxSell => "Climax_Sell",
            WedgeBuy => "Wedge_Buy",
            WedgeSell => "Wedge_Sell",
            MtrBuy => "MTR_Buy",
            MtrSell => "MTR_Sell",
            FailedBreakoutBuy => "FailedBreakout_Buy",
            FailedBreakoutSell => "FailedBreakout_Sell",
            DoubleBottomBuy => "DoubleBottom_Buy",
            DoubleTopSell => "DoubleTop_Sell",
            OutsideBarBuy => "OutsideBar_Buy",
            OutsideBarSell => "OutsideBar_Sell",
            ReversalBarBuy => "ReversalBar_Buy",
            ReversalBarSell => "ReversalBar_Sell",
            IiBuy => "ii_Buy",
            IiSell => "ii_Sell",
            MeasuredMoveBuy => "MeasuredMove_Buy",
            MeasuredMoveSell => "MeasuredMove_Sell",
            FinalFlagBuy => "FinalFlag_Buy",
            FinalFlagSell => "FinalFlag_Sell",
        }
    }
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One tradeable signal, produced at most once per closed bar.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub kind: SignalKind,
    pub side: Side,
    pub technical_stop: f64,
    pub base_height: f64,
    /// Geometry of the signal bar, used for stop-order entry pricing.
    pub signal_bar_high: f64,
    pub signal_bar_low: f64,
    /// Close of the signal bar, the market-entry reference price.
    pub entry_hint: f64,
    /// Dispatcher bar counter at emission; newer signals supersede older.
    pub source_bar_index: i64,
}

/// Detector thresholds lifted out of the engine config.
#[derive(Debug, Clone, Copy)]
pub struct SignalConfig {
    pub max_stop_atr: f64,
    pub min_spike_bars: usize,
    pub spike_overlap_max: f64,
    /// Climax bar threshold in the strict (Spike-cycle) mode.
    pub strict_climax_atr_mult: f64,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            max_stop_atr: 3.0,
            min_spike_bars: 3,
            spike_overlap_max: 0.30,
            strict_climax_atr_mult: 3.0,
        }
    }
}

/// Memory of a recent trading-range breakout, consumed by the
/// breakout-pullback detector.
#[derive(Debug, Default, Clone, Copy)]
pub struct BreakoutMemory {
    pub recent: bool,
    pub direction: Option<Side>,
    pub level: f64,
    pub age_bars: usize,
}

impl BreakoutMemory {
    pub fn tick(&mut self) {
        if self.recent {
            self.age_bars += 1;
            if self.age_bars > 12 {
                self.recent = false;
            }
        }
    }

    pub fn arm(&mut self, direction: Side, level: f64) {
        self.recent = true;
        self.direction = Some(direction);
        self.level = level;
        self.age_bars = 0;
    }
}

/// Brooks: the first reversal attempt against a spike usually fails. The
/// strict Climax path only fires after a recorded attempt has failed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReversalAttempt {
    pub time: DateTime<Utc>,
    pub direction: Side,
    pub extreme_price: f64,
    pub attempt_high: f64,
    pub attempt_low: f64,
    pub failed: bool,
    pub age_bars: usize,
}

#[derive(Debug, Default)]
pub struct ReversalAttemptTracker {
    pub attempt: Option<ReversalAttempt>,
}

impl ReversalAttemptTracker {
    const MAX_AGE_BARS: usize = 10;

    /// Advance one bar: age the attempt out, mark it failed if price took
    /// out its extreme, and drop it when the regime leaves strong trend.
    pub fn on_new_bar(&mut self, snap: &MarketSnapshot, in_strong_trend: bool) {
        let Some(a) = self.attempt.as_mut() else {
            return;
        };
        a.age_bars += 1;
        if a.age_bars > Self::MAX_AGE_BARS || !in_strong_trend {
            self.attempt = None;
            return;
        }
        if snap.is_empty() {
            return;
        }
        match a.direction {
            // A bearish attempt fails when the market makes a higher high
            // past the attempt bar.
            Side::Sell => {
                if snap.high(1) > a.attempt_high {
                    a.failed = true;
                }
            }
            // A bullish attempt fails on a lower low.
            Side::Buy => {
                if snap.low(1) < a.attempt_low {
                    a.failed = true;
                }
            }
        }
    }

    pub fn record(&mut self, time: DateTime<Utc>, direction: Side, high: f64, low: f64) {
        let extreme = match direction {
            Side::Sell => low,
            Side::Buy => high,
        };
        self.attempt = Some(ReversalAttempt {
            time,
            direction,
            extreme_price: extreme,
            attempt_high: high,
            attempt_low: low,
            failed: false,
            age_bars: 0,
        });
    }

    pub fn failed_attempt(&self, direction: Side) -> bool {
        self.attempt
            .map(|a| a.direction == direction && a.failed)
            .unwrap_or(false)
    }
}

/// Everything the detector functions read and the few pieces they write
/// (cooldown stamps, H/L resets, breakout memory). Owned by the dispatcher
/// task; detectors see it for exactly one bar.
pub struct ScanCtx<'a> {
    pub snap: &'a MarketSnapshot,
    pub swings: &'a SwingTracker,
    pub hl: &'a mut HlCounter,
    pub mstate: &'a MarketStateTracker,
    pub cooldown: &'a mut CooldownTracker,
    pub gap20: &'a GapTwentyRule,
    pub htf: HtfDirection,
    pub breakout: &'a mut BreakoutMemory,
    pub reversal: &'a mut ReversalAttemptTracker,
    pub cfg: SignalConfig,
    pub bar_index: i64,
}

impl<'a> ScanCtx<'a> {
    /// Signal-bar validation plus the per-side cooldown gate, shared by the
    /// continuation detectors.
    pub fn validate_and_cool(&self, side: Side) -> bool {
        let b = self.snap.bar(1);
        crate::trading_core::filters::validate_signal_bar(b.high, b.low, b.open, b.close, side)
            && self.cooldown.allows(side, b.close, self.snap)
    }

    pub fn emit(&mut self, kind: SignalKind, technical_stop: f64, base_height: f64) -> Signal {
        let b = self.snap.bar(1);
        let side = kind.side();
        self.cooldown.record(side, b.close);
        Signal {
            kind,
            side,
            technical_stop,
            base_height,
            signal_bar_high: b.high,
            signal_bar_low: b.low,
            entry_hint: b.close,
            source_bar_index: self.bar_index,
        }
    }

    /// Stop distance budget check; detectors veto anything wider.
    pub fn within_budget(&self, side: Side, entry: f64, stop: f64) -> bool {
        let dist = match side {
            Side::Buy => entry - stop,
            Side::Sell => stop - entry,
        };
        dist > 0.0 && dist <= self.snap.atr * self.cfg.max_stop_atr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_kind_sides() {
        assert_eq!(SignalKind::H2Buy.side(), Side::Buy);
        assert_eq!(SignalKind::L2Sell.side(), Side::Sell);
        assert_eq!(SignalKind::ClimaxSell.side(), Side::Sell);
        assert_eq!(SignalKind::FinalFlagBuy.side(), Side::Buy);
    }

    #[test]
    fn test_reversal_classification() {
        assert!(SignalKind::WedgeSell.is_reversal());
        assert!(SignalKind::FailedBreakoutBuy.is_reversal());
        assert!(!SignalKind::SpikeBuy.is_reversal());
        assert!(!SignalKind::H2Buy.is_reversal());
        assert!(!SignalKind::TrBreakoutSell.is_reversal());
    }

    #[test]
    fn test_flow_classes() {
        assert_eq!(SignalKind::WedgeBuy.flow_class(), FlowClass::WedgeBuy);
        assert_eq!(
            SignalKind::SpikeBuy.flow_class(),
            FlowClass::TrendContinuation
        );
        assert_eq!(SignalKind::MtrSell.flow_class(), FlowClass::Other);
    }

    #[test]
    fn test_reversal_attempt_fails_on_higher_high() {
        use crate::trading_core::bars::BarSeries;
        use crate::types::Bar;

        let mut tracker = ReversalAttemptTracker::default();
        let t0 = Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap();
        tracker.record(t0, Side::Sell, 105.0, 103.0);
        assert!(!tracker.failed_attempt(Side::Sell));

        let mut s = BarSeries::new(64, 20, 20);
        for i in 0..21 {
            s.on_primary_bar_close(Bar {
                open_time: t0 + chrono::Duration::minutes(5 * i),
                open: 100.0,
                high: 101.0,
                low: 99.0,
                close: 100.0,
                volume: 1.0,
            });
        }
        // Price takes out the attempt bar's high: the attempt has failed.
        s.on_primary_bar_close(Bar {
            open_time: t0 + chrono::Duration::minutes(5 * 22),
            open: 104.0,
            high: 106.0,
            low: 103.9,
            close: 105.5,
            volume: 1.0,
        });
        tracker.on_new_bar(&s.snapshot(), true);
        assert!(tracker.failed_attempt(Side::Sell));
    }

    #[test]
    fn test_reversal_attempt_expires_outside_strong_trend() {
        let mut tracker = ReversalAttemptTracker::default();
        let t0 = Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap();
        tracker.record(t0, Side::Sell, 105.0, 103.0);
        tracker.on_new_bar(&crate::trading_core::bars::MarketSnapshot::empty(), false);
        assert!(tracker.attempt.is_none());
    }
}
