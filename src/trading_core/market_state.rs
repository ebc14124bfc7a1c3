//! Market regime classification.
//!
//! One tracker owns the six-state `MarketState` machine (with state
//! inertia), the derived three-state `MarketCycle`, and the `AlwaysIn`
//! direction. Detection runs once per closed bar, before any detector sees
//! the bar. The cycle is a pure per-bar mapping of the state; any
//! hysteresis it shows comes from the state inertia underneath.

use serde::{Deserialize, Serialize};

use crate::trading_core::bars::MarketSnapshot;
use crate::trading_core::swings::SwingTracker;
use crate::types::{Bar, Side};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarketState {
    StrongTrend,
    Breakout,
    Channel,
    TradingRange,
    TightChannel,
    FinalFlag,
}

impl MarketState {
    /// Minimum bars a freshly entered state is held before the classifier
    /// may report something else.
    fn min_hold(self) -> usize {
        match self {
            MarketState::StrongTrend | MarketState::TightChannel => 3,
            MarketState::TradingRange | MarketState::Breakout => 2,
            MarketState::Channel | MarketState::FinalFlag => 1,
        }
    }
}

impl std::fmt::Display for MarketState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarketCycle {
    Spike,
    Channel,
    TradingRange,
}

impl MarketCycle {
    fn from_state(state: MarketState) -> MarketCycle {
        match state {
            MarketState::Breakout => MarketCycle::Spike,
            MarketState::TradingRange => MarketCycle::TradingRange,
            _ => MarketCycle::Channel,
        }
    }
}

impl std::fmt::Display for MarketCycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AlwaysIn {
    Long,
    Short,
    #[default]
    Neutral,
}

impl AlwaysIn {
    pub fn side(self) -> Option<Side> {
        match self {
            AlwaysIn::Long => Some(Side::Buy),
            AlwaysIn::Short => Some(Side::Sell),
            AlwaysIn::Neutral => None,
        }
    }
}

/// Value snapshot of the regime, handed to lifecycle managers alongside the
/// bar snapshot.
#[derive(Debug, Clone, Copy)]
pub struct RegimeView {
    pub state: MarketState,
    pub cycle: MarketCycle,
    pub always_in: AlwaysIn,
    pub trend_direction: Option<Side>,
    pub trend_strength: f64,
    pub tight_channel_dir: Option<Side>,
    pub tight_channel_extreme: f64,
    pub tr_high: f64,
    pub tr_low: f64,
}

pub struct MarketStateTracker {
    strong_trend_score: f64,
    ttr_overlap_ratio: f64,
    ttr_range_atr_mult: f64,

    pub state: MarketState,
    pub cycle: MarketCycle,
    pub always_in: AlwaysIn,

    pub trend_direction: Option<Side>,
    pub trend_strength: f64,

    pub tight_channel_dir: Option<Side>,
    pub tight_channel_bars: usize,
    pub tight_channel_extreme: f64,
    /// Length of the last completed tight-channel run; the Final-Flag
    /// window is measured against this after the channel ends.
    last_tc_run_bars: usize,
    bars_since_tc_end: Option<usize>,

    pub tr_high: f64,
    pub tr_low: f64,

    locked_state: MarketState,
    hold_bars: usize,
}

impl MarketStateTracker {
    pub fn new(strong_trend_score: f64, ttr_overlap_ratio: f64, ttr_range_atr_mult: f64) -> Self {
        Self {
            strong_trend_score,
            ttr_overlap_ratio,
            ttr_range_atr_mult,
            state: MarketState::Channel,
            cycle: MarketCycle::Channel,
            always_in: AlwaysIn::Neutral,
            trend_direction: None,
            trend_strength: 0.0,
            tight_channel_dir: None,
            tight_channel_bars: 0,
            tight_channel_extreme: 0.0,
            last_tc_run_bars: 0,
            bars_since_tc_end: None,
            tr_high: 0.0,
            tr_low: 0.0,
            locked_state: MarketState::Channel,
            hold_bars: 0,
        }
    }

    pub fn view(&self) -> RegimeView {
        RegimeView {
            state: self.state,
            cycle: self.cycle,
            always_in: self.always_in,
            trend_direction: self.trend_direction,
            trend_strength: self.trend_strength,
            tight_channel_dir: self.tight_channel_dir,
            tight_channel_extreme: self.tight_channel_extreme,
            tr_high: self.tr_high,
            tr_low: self.tr_low,
        }
    }

    /// Regimes in which the stop computer trusts the signal bar over swing
    /// structure.
    pub fn is_strong_trend_regime(&self) -> bool {
        matches!(
            self.state,
            MarketState::StrongTrend | MarketState::Breakout | MarketState::TightChannel
        )
    }

    pub fn update(&mut self, snap: &MarketSnapshot, swings: &SwingTracker) {
        if snap.len() < 12 || snap.atr <= 0.0 {
            return;
        }

        if let Some(n) = self.bars_since_tc_end.as_mut() {
            *n += 1;
        }

        let detected = if self.detect_strong_trend(snap) {
            MarketState::StrongTrend
        } else if self.detect_tight_channel(snap) {
            if self.bars_since_tc_end.take().is_some() {
                // A fresh run, not a continuation of the old one.
                self.tight_channel_bars = 0;
                self.tight_channel_extreme = 0.0;
            }
            self.tight_channel_bars += 1;
            self.track_tight_channel_extreme(snap);
            MarketState::TightChannel
        } else {
            if self.tight_channel_bars > 0 && self.bars_since_tc_end.is_none() {
                self.bars_since_tc_end = Some(1);
                self.last_tc_run_bars = self.tight_channel_bars;
                self.tight_channel_bars = 0;
            }
            self.expire_tc_memory();
            if self.detect_final_flag(snap) {
                MarketState::FinalFlag
            } else if self.detect_trading_range(snap) {
                MarketState::TradingRange
            } else if self.detect_breakout(snap) {
                MarketState::Breakout
            } else {
                MarketState::Channel
            }
        };

        self.apply_inertia(detected);
        self.cycle = MarketCycle::from_state(self.state);
        self.update_always_in(snap, swings);
    }

    /// Direction and extreme survive for Final-Flag stop geometry until
    /// the flag window itself expires.
    fn expire_tc_memory(&mut self) {
        if self.bars_since_tc_end.map(|n| n > 8).unwrap_or(false) {
            self.tight_channel_dir = None;
            self.tight_channel_extreme = 0.0;
            self.last_tc_run_bars = 0;
            self.bars_since_tc_end = None;
        }
    }

    fn track_tight_channel_extreme(&mut self, snap: &MarketSnapshot) {
        match self.tight_channel_dir {
            Some(Side::Buy) => {
                if self.tight_channel_extreme == 0.0 || snap.high(1) > self.tight_channel_extreme {
                    self.tight_channel_extreme = snap.high(1);
                }
            }
            Some(Side::Sell) => {
                if self.tight_channel_extreme == 0.0 || snap.low(1) < self.tight_channel_extreme {
                    self.tight_channel_extreme = snap.low(1);
                }
            }
            None => {}
        }
    }

    fn detect_strong_trend(&mut self, snap: &MarketSnapshot) -> bool {
        let lookback = 10.min(snap.len() - 1);
        let mut bull_streak = 0usize;
        let mut bear_streak = 0usize;
        let mut cur_bull = 0usize;
        let mut cur_bear = 0usize;
        let mut higher_highs = 0usize;
        let mut lower_lows = 0usize;
        let mut above = 0usize;
        let mut below = 0usize;

        for i in 1..=lookback {
            let b = snap.bar(i);
            if b.is_bull() {
                cur_bull += 1;
                cur_bear = 0;
            } else if b.is_bear() {
                cur_bear += 1;
                cur_bull = 0;
            }
            bull_streak = bull_streak.max(cur_bull);
            bear_streak = bear_streak.max(cur_bear);

            if snap.high(i) > snap.high(i + 1) {
                higher_highs += 1;
            }
            if snap.low(i) < snap.low(i + 1) {
                lower_lows += 1;
            }
            if b.close > snap.ema(i) {
                above += 1;
            } else {
                below += 1;
            }
        }

        let mut up = 0.0;
        let mut down = 0.0;
        if bull_streak >= 3 {
            up += 0.25;
        }
        if bull_streak >= 5 {
            up += 0.25;
        }
        if higher_highs >= 4 {
            up += 0.2;
        }
        if above >= 8 {
            up += 0.15;
        }
        if bear_streak >= 3 {
            down += 0.25;
        }
        if bear_streak >= 5 {
            down += 0.25;
        }
        if lower_lows >= 4 {
            down += 0.2;
        }
        if below >= 8 {
            down += 0.15;
        }

        let dist = (snap.close(1) - snap.ema(1)) / snap.atr;
        if dist > 1.0 {
            up += 0.15;
        }
        if dist < -1.0 {
            down += 0.15;
        }

        if up >= self.strong_trend_score && up > down {
            self.trend_direction = Some(Side::Buy);
            self.trend_strength = up;
            return true;
        }
        if down >= self.strong_trend_score && down > up {
            self.trend_direction = Some(Side::Sell);
            self.trend_strength = down;
            return true;
        }
        self.trend_direction = None;
        self.trend_strength = up.max(down);
        false
    }

    fn detect_tight_channel(&mut self, snap: &MarketSnapshot) -> bool {
        if snap.len() < 15 {
            return false;
        }
        let lookback = 12usize;
        let mut bull = 0usize;
        let mut bear = 0usize;
        let mut new_highs = 0usize;
        let mut new_lows = 0usize;
        let mut shallow = 0usize;

        for i in 1..=lookback.min(snap.len() - 1) {
            let b = snap.bar(i);
            if b.is_bull() {
                bull += 1;
            } else if b.is_bear() {
                bear += 1;
            }
            if snap.high(i) > snap.high(i + 1) {
                new_highs += 1;
            }
            if snap.low(i) < snap.low(i + 1) {
                new_lows += 1;
            }
            let prev_range = snap.bar(i + 1).range();
            if prev_range > 0.0 {
                if snap.low(i) >= snap.low(i + 1) + prev_range * 0.75 {
                    shallow += 1;
                }
                if snap.high(i) <= snap.high(i + 1) - prev_range * 0.75 {
                    shallow += 1;
                }
            }
        }

        let lb = lookback as f64;
        if bull as f64 >= lb * 0.6 && new_highs as f64 >= lb * 0.5 && shallow as f64 >= lb * 0.4 {
            self.tight_channel_dir = Some(Side::Buy);
            return true;
        }
        if bear as f64 >= lb * 0.6 && new_lows as f64 >= lb * 0.5 && shallow as f64 >= lb * 0.4 {
            self.tight_channel_dir = Some(Side::Sell);
            return true;
        }
        false
    }

    fn detect_trading_range(&mut self, snap: &MarketSnapshot) -> bool {
        if snap.len() < 25 {
            return false;
        }
        let lookback = 20usize;
        // Bounds exclude the just-closed bar: that bar may be the breakout
        // or failed-breakout candidate the detectors measure against.
        let mut rh = f64::MIN;
        let mut rl = f64::MAX;
        for i in 2..=lookback + 1 {
            rh = rh.max(snap.high(i));
            rl = rl.min(snap.low(i));
        }
        let total = rh - rl;
        if total < snap.atr * 2.0 {
            return false;
        }
        let upper = rh - total * 0.2;
        let lower = rl + total * 0.2;

        let mut touch_h = 0usize;
        let mut touch_l = 0usize;
        let mut crosses = 0usize;
        let mut prev_above: Option<bool> = None;
        for i in (2..=lookback + 1).rev() {
            if snap.high(i) >= upper {
                touch_h += 1;
            }
            if snap.low(i) <= lower {
                touch_l += 1;
            }
            let cur_above = snap.close(i) > snap.ema(i);
            if let Some(p) = prev_above {
                if p != cur_above {
                    crosses += 1;
                }
            }
            prev_above = Some(cur_above);
        }

        if touch_h >= 2 && touch_l >= 2 && crosses >= 4 {
            self.tr_high = rh;
            self.tr_low = rl;
            return true;
        }
        false
    }

    fn detect_breakout(&mut self, snap: &MarketSnapshot) -> bool {
        if snap.len() < 12 {
            return false;
        }
        let b = snap.bar(1);
        if b.range() <= 0.0 {
            return false;
        }
        let avg_body = snap.mean_body(2, 10);
        if avg_body <= 0.0 || b.body() <= avg_body * 1.5 {
            return false;
        }
        let cp = b.close_position();
        (b.close > snap.ema(1) && cp > 0.7) || (b.close < snap.ema(1) && cp < 0.3)
    }

    fn detect_final_flag(&self, snap: &MarketSnapshot) -> bool {
        if self.last_tc_run_bars < 5 {
            return false;
        }
        let Some(bars_since) = self.bars_since_tc_end else {
            return false;
        };
        if !(3..=8).contains(&bars_since) {
            return false;
        }
        let dist = (snap.close(1) - snap.ema(1)) / snap.atr;
        match self.tight_channel_dir {
            Some(Side::Buy) => dist >= 0.5,
            Some(Side::Sell) => dist <= -0.5,
            None => false,
        }
    }

    fn apply_inertia(&mut self, detected: MarketState) {
        if self.hold_bars > 0 {
            self.hold_bars -= 1;
            self.state = self.locked_state;
            return;
        }
        if detected != self.locked_state {
            self.locked_state = detected;
            self.hold_bars = detected.min_hold().saturating_sub(1);
        }
        self.state = detected;
    }

    /// Tight trading range: too narrow and too overlapping to trade
    /// breakouts or trends inside.
    pub fn is_ttr(&self, snap: &MarketSnapshot) -> bool {
        if self.state != MarketState::TradingRange || snap.atr <= 0.0 {
            return false;
        }
        if self.tr_high <= self.tr_low {
            return false;
        }
        if self.tr_high - self.tr_low >= snap.atr * self.ttr_range_atr_mult {
            return false;
        }
        snap.overlap_ratio(20) < self.ttr_overlap_ratio
    }

    fn update_always_in(&mut self, snap: &MarketSnapshot, swings: &SwingTracker) {
        if snap.len() < 20 || snap.atr <= 0.0 {
            self.always_in = AlwaysIn::Neutral;
            return;
        }
        let atr = snap.atr;
        let b1 = snap.bar(1);
        let rng1 = b1.range();
        let close_pos = b1.close_position();
        let body_ratio = b1.body_ratio();

        // (a) Two consecutive strong bodies closing on the same side of the
        // EMA flip the direction outright.
        let b2 = snap.bar(2);
        let strong_bull = |b: &Bar| b.range() > 0.0 && b.signed_body() / b.range() > 0.55;
        let strong_bear = |b: &Bar| b.range() > 0.0 && b.signed_body() / b.range() < -0.55;
        if strong_bull(b1) && strong_bull(b2) && b1.close > snap.ema(1) && b2.close > snap.ema(2) {
            self.always_in = AlwaysIn::Long;
            return;
        }
        if strong_bear(b1) && strong_bear(b2) && b1.close < snap.ema(1) && b2.close < snap.ema(2) {
            self.always_in = AlwaysIn::Short;
            return;
        }

        // (b) One extreme bar that breaks the EMA or structure.
        if snap.len() >= 5 && rng1 > atr * 1.0 {
            let avg3 = snap.mean_body(3, 3);
            let break_ema = (b1.is_bull() && b1.close > snap.ema(1))
                || (b1.is_bear() && b1.close < snap.ema(1));
            let sh1 = swings.recent_swing_high(1, false);
            let sl1 = swings.recent_swing_low(1, false);
            let break_struct = (b1.is_bull() && sh1 > 0.0 && b1.close > sh1)
                || (b1.is_bear() && sl1 > 0.0 && b1.close < sl1);
            if avg3 > 0.0 && b1.body() > avg3 * 2.0 && body_ratio > 0.6 && (break_ema || break_struct)
            {
                if b1.is_bull() && close_pos > 0.75 {
                    self.always_in = AlwaysIn::Long;
                    return;
                }
                if b1.is_bear() && close_pos < 0.25 {
                    self.always_in = AlwaysIn::Short;
                    return;
                }
            }
        }

        // (c) A single very strong reversal bar.
        if rng1 > atr * 1.2 && body_ratio > 0.65 {
            if b1.is_bull() && close_pos > 0.75 {
                self.always_in = AlwaysIn::Long;
                return;
            }
            if b1.is_bear() && close_pos < 0.25 {
                self.always_in = AlwaysIn::Short;
                return;
            }
        }

        // (d) Scoring fallback: strong-body counts (down-weighted when bars
        // overlap heavily), swing sequence, EMA side, last-bar geometry.
        let mut bull_cnt = 0usize;
        let mut bear_cnt = 0usize;
        let mut overlap_pen = 0usize;
        for i in 1..=5.min(snap.len() - 1) {
            let b = snap.bar(i);
            let rng = b.range();
            if rng <= 0.0 {
                continue;
            }
            let br = b.body_ratio();
            let has_overlap = b.overlap_with(snap.bar(i + 1)) / rng > 0.6;
            if b.is_bull() && br > 0.5 {
                bull_cnt += 1;
                if has_overlap {
                    overlap_pen += 1;
                }
            }
            if b.is_bear() && br > 0.5 {
                bear_cnt += 1;
                if has_overlap {
                    overlap_pen += 1;
                }
            }
        }

        let mut hh = 0usize;
        let mut hl = 0usize;
        let mut lh = 0usize;
        let mut ll = 0usize;
        let sp = swings.swings();
        for i in 0..sp.len().saturating_sub(1).min(4) {
            let (a, b) = (&sp[i], &sp[i + 1]);
            if a.is_high && b.is_high {
                if a.price > b.price {
                    hh += 1;
                } else {
                    lh += 1;
                }
            }
            if !a.is_high && !b.is_high {
                if a.price > b.price {
                    hl += 1;
                } else {
                    ll += 1;
                }
            }
        }

        let above_ema = b1.close > snap.ema(1);
        let mut bull_score = 0.0;
        let mut bear_score = 0.0;
        let count_weight = if overlap_pen >= 2 {
            0.25
        } else if overlap_pen >= 1 {
            0.35
        } else {
            0.4
        };
        if bull_cnt >= 3 {
            bull_score += count_weight;
        } else if bull_cnt >= 2 {
            bull_score += count_weight * 0.5;
        }
        if bear_cnt >= 3 {
            bear_score += count_weight;
        } else if bear_cnt >= 2 {
            bear_score += count_weight * 0.5;
        }
        if hh > 0 && hl > 0 {
            bull_score += 0.30;
        }
        if lh > 0 && ll > 0 {
            bear_score += 0.30;
        }
        if above_ema {
            bull_score += 0.12;
        } else {
            bear_score += 0.12;
        }
        if rng1 > atr * 1.5 {
            let w = if body_ratio > 0.7 { 0.35 } else { 0.25 };
            if b1.is_bull() {
                bull_score += w;
            } else if b1.is_bear() {
                bear_score += w;
            }
        }
        if close_pos > 0.8 {
            bull_score += 0.20;
        }
        if close_pos < 0.2 {
            bear_score += 0.20;
        }

        self.always_in = if bull_score >= 0.5 && bull_score > bear_score + 0.1 {
            AlwaysIn::Long
        } else if bear_score >= 0.5 && bear_score > bull_score + 0.1 {
            AlwaysIn::Short
        } else {
            AlwaysIn::Neutral
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trading_core::bars::BarSeries;
    use chrono::{TimeZone, Utc};

    struct Fixture {
        series: BarSeries,
        swings: SwingTracker,
        tracker: MarketStateTracker,
        i: i64,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                series: BarSeries::new(256, 20, 20),
                swings: SwingTracker::new(),
                tracker: MarketStateTracker::new(0.5, 0.40, 2.5),
                i: 0,
            }
        }

        fn push(&mut self, open: f64, high: f64, low: f64, close: f64) {
            let b = Bar {
                open_time: Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap()
                    + chrono::Duration::minutes(5 * self.i),
                open,
                high,
                low,
                close,
                volume: 1.0,
            };
            self.i += 1;
            self.series.on_primary_bar_close(b);
            let snap = self.series.snapshot();
            self.swings.update(&snap);
            self.tracker.update(&snap, &self.swings);
        }
    }

    fn warm(f: &mut Fixture) {
        for k in 0..25 {
            let base = 100.0 + 0.02 * (k % 3) as f64;
            f.push(base, base + 1.0, base - 1.0, base);
        }
    }

    #[test]
    fn test_strong_trend_long_run_of_bull_bars() {
        let mut f = Fixture::new();
        warm(&mut f);
        let mut px = 100.0;
        for _ in 0..10 {
            f.push(px, px + 1.6, px - 0.2, px + 1.4);
            px += 1.4;
        }
        assert_eq!(f.tracker.state, MarketState::StrongTrend);
        assert_eq!(f.tracker.trend_direction, Some(Side::Buy));
        assert!(f.tracker.trend_strength >= 0.5);
        assert_eq!(f.tracker.always_in, AlwaysIn::Long);
    }

    #[test]
    fn test_trading_range_oscillation() {
        let mut f = Fixture::new();
        warm(&mut f);
        // Four-bar cycle between ~97 and ~103: repeated touches of both
        // zones, frequent EMA crossings, never more than two same-side bars
        // in a row.
        for k in 0..24 {
            match k % 4 {
                0 => f.push(97.0, 100.2, 96.8, 100.0),
                1 => f.push(100.0, 103.2, 99.8, 103.0),
                2 => f.push(103.0, 103.2, 99.8, 100.0),
                _ => f.push(100.0, 100.2, 96.8, 97.0),
            }
        }
        assert_eq!(f.tracker.state, MarketState::TradingRange);
        assert_eq!(f.tracker.cycle, MarketCycle::TradingRange);
        assert!(f.tracker.tr_high > f.tracker.tr_low);
    }

    #[test]
    fn test_cycle_mapping() {
        assert_eq!(
            MarketCycle::from_state(MarketState::Breakout),
            MarketCycle::Spike
        );
        assert_eq!(
            MarketCycle::from_state(MarketState::TradingRange),
            MarketCycle::TradingRange
        );
        assert_eq!(
            MarketCycle::from_state(MarketState::StrongTrend),
            MarketCycle::Channel
        );
        assert_eq!(
            MarketCycle::from_state(MarketState::FinalFlag),
            MarketCycle::Channel
        );
    }

    #[test]
    fn test_state_inertia_holds_fresh_state() {
        let mut t = MarketStateTracker::new(0.5, 0.4, 2.5);
        t.apply_inertia(MarketState::StrongTrend);
        assert_eq!(t.state, MarketState::StrongTrend);
        // The next two tentative changes are swallowed by the hold.
        t.apply_inertia(MarketState::Channel);
        assert_eq!(t.state, MarketState::StrongTrend);
        t.apply_inertia(MarketState::Channel);
        assert_eq!(t.state, MarketState::StrongTrend);
        // Hold elapsed: the change goes through.
        t.apply_inertia(MarketState::Channel);
        assert_eq!(t.state, MarketState::Channel);
    }

    #[test]
    fn test_final_flag_window() {
        let mut f = Fixture::new();
        warm(&mut f);
        // Drift the tape upward so the close sits well above the EMA.
        let mut px = 100.0;
        for _ in 0..8 {
            f.push(px, px + 1.6, px - 0.2, px + 1.4);
            px += 1.4;
        }
        let snap = f.series.snapshot();
        let mut t = MarketStateTracker::new(0.5, 0.4, 2.5);
        t.last_tc_run_bars = 6;
        t.tight_channel_dir = Some(Side::Buy);
        t.bars_since_tc_end = Some(4);
        assert!(t.detect_final_flag(&snap));
        // Outside the 3..=8 window the flag is gone.
        t.bars_since_tc_end = Some(9);
        assert!(!t.detect_final_flag(&snap));
        // A short channel never sets up a final flag.
        t.bars_since_tc_end = Some(4);
        t.last_tc_run_bars = 3;
        assert!(!t.detect_final_flag(&snap));
    }

    #[test]
    fn test_always_in_neutral_on_flat_market() {
        let mut f = Fixture::new();
        warm(&mut f);
        assert_eq!(f.tracker.always_in, AlwaysIn::Neutral);
    }

    #[test]
    fn test_classifier_pure_function_of_snapshot() {
        // Identical input sequences produce identical regimes: no hidden
        // state outside the tracked fields.
        let mut a = Fixture::new();
        let mut b = Fixture::new();
        warm(&mut a);
        warm(&mut b);
        let mut px = 100.0;
        for _ in 0..10 {
            a.push(px, px + 1.6, px - 0.2, px + 1.4);
            b.push(px, px + 1.6, px - 0.2, px + 1.4);
            px += 1.4;
        }
        assert_eq!(a.tracker.state, b.tracker.state);
        assert_eq!(a.tracker.always_in, b.tracker.always_in);
    }
}
