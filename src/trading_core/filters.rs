//! Regime-adjacent filters: Barb-Wire, the 20-Gap overextension machine,
//! Measuring-Gap, Breakout-Mode, the spread filter, and signal cooldown.
//!
//! Each filter is a small state machine owned by the dispatcher and stepped
//! once per closed bar. None of them hold config globally; switches come in
//! at construction.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::trading_core::bars::MarketSnapshot;
use crate::types::Side;

pub const BARB_WIRE_MIN_BARS: usize = 3;
pub const BARB_WIRE_BODY_RATIO: f64 = 0.35;
pub const BARB_WIRE_RANGE_RATIO: f64 = 0.5;
pub const MEASURING_GAP_MIN_SIZE_ATR: f64 = 0.3;
pub const BREAKOUT_MODE_BARS: usize = 5;
pub const BREAKOUT_MODE_ATR_MULT: f64 = 1.5;
/// Bars whose body sits under this fraction of range count as near-dojis.
const DOJI_BODY_RATIO: f64 = 0.15;

/// Validates the signal bar for continuation entries: directional body of at
/// least half the range, closing tail no more than a quarter of it.
pub fn validate_signal_bar(
    high: f64,
    low: f64,
    open: f64,
    close: f64,
    side: Side,
) -> bool {
    let rng = high - low;
    if rng <= 0.0 {
        return false;
    }
    let body = (close - open).abs();
    if body / rng < 0.50 {
        return false;
    }
    match side {
        Side::Buy => {
            if close <= open {
                return false;
            }
            let upper_tail = high - close.max(open);
            upper_tail / rng <= 0.25
        }
        Side::Sell => {
            if close >= open {
                return false;
            }
            let lower_tail = close.min(open) - low;
            lower_tail / rng <= 0.25
        }
    }
}

/// Barb-Wire: a cluster of small, overlapping bars with at least one
/// near-doji. While active the dispatcher refuses all signals; the
/// release bar (strong close outside the wire) is reported so Breakout-Mode
/// can arm on it.
#[derive(Debug, Default)]
pub struct BarbWireFilter {
    enabled: bool,
    pub active: bool,
    pub wire_high: f64,
    pub wire_low: f64,
    breakout_dir: Option<Side>,
}

impl BarbWireFilter {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            ..Default::default()
        }
    }

    /// Direction of the bar that broke out of the wire on the last update,
    /// if any.
    pub fn breakout_direction(&self) -> Option<Side> {
        self.breakout_dir
    }

    pub fn update(&mut self, snap: &MarketSnapshot) {
        self.breakout_dir = None;
        if !self.enabled || snap.atr <= 0.0 {
            self.active = false;
            return;
        }
        let check = BARB_WIRE_MIN_BARS + 2;
        if snap.len() < check + 1 {
            self.active = false;
            return;
        }
        let atr = snap.atr;

        let mut small = 0usize;
        let mut doji = 0usize;
        let mut overlap = 0usize;
        let mut wire_high = snap.high(1);
        let mut wire_low = snap.low(1);

        for i in 1..=check {
            let b = snap.bar(i);
            let rng = b.range();
            if rng <= 0.0 {
                continue;
            }
            wire_high = wire_high.max(b.high);
            wire_low = wire_low.min(b.low);
            if rng < atr * BARB_WIRE_RANGE_RATIO || b.body_ratio() < BARB_WIRE_BODY_RATIO {
                small += 1;
            }
            if b.body_ratio() < DOJI_BODY_RATIO {
                doji += 1;
            }
            if i > 1 {
                let prev = snap.bar(i - 1);
                if b.overlap_with(prev) / rng > 0.5 {
                    overlap += 1;
                }
            }
        }

        let heavy_overlap =
            (wire_high - wire_low) < atr * 1.5 || overlap >= BARB_WIRE_MIN_BARS - 1;

        if small >= BARB_WIRE_MIN_BARS && doji >= 1 && heavy_overlap {
            if !self.active {
                self.active = true;
                self.wire_high = wire_high;
                self.wire_low = wire_low;
                debug!(wire_high, wire_low, "barb-wire set");
            }
            self.wire_high = self.wire_high.max(snap.high(1));
            self.wire_low = self.wire_low.min(snap.low(1));
        } else if self.active {
            let b = snap.bar(1);
            let strong = b.range() > atr * 0.5 && b.body_ratio() > 0.5;
            if strong && b.close > self.wire_high && b.is_bull() {
                self.breakout_dir = Some(Side::Buy);
            } else if strong && b.close < self.wire_low && b.is_bear() {
                self.breakout_dir = Some(Side::Sell);
            }
            self.active = false;
        }
    }
}

/// The 20-Gap overextension machine.
///
/// `gap_count` counts trailing bars entirely outside the EMA on the trend
/// side. At the threshold the market is overextended and the *first*
/// pullback to the EMA is a high-failure entry: H1/L1 signals are blocked
/// until a recovery condition releases the block.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct GapTwentyRule {
    enabled: bool,
    threshold: usize,
    consolidation_bars: usize,
    consolidation_range_atr: f64,

    pub gap_count: usize,
    pub gap_extreme: f64,
    pub overextended: bool,
    pub direction: Option<Side>,
    pub first_pullback_blocked: bool,
    pub waiting_for_recovery: bool,
    pub first_pullback_complete: bool,
    pub consolidation_count: usize,
    pub pullback_extreme: f64,
}

impl GapTwentyRule {
    pub fn new(
        enabled: bool,
        threshold: usize,
        consolidation_bars: usize,
        consolidation_range_atr: f64,
    ) -> Self {
        Self {
            enabled,
            threshold,
            consolidation_bars,
            consolidation_range_atr,
            ..Default::default()
        }
    }

    /// Count trailing closed bars whose low (up) / high (down) sits entirely
    /// outside the per-bar EMA. Direction is taken from the last close
    /// relative to EMA with a 0.3 x ATR threshold.
    pub fn recount(&mut self, snap: &MarketSnapshot) -> usize {
        if snap.atr <= 0.0 || snap.len() < 2 {
            return 0;
        }
        let threshold = snap.atr * 0.3;
        let c1 = snap.close(1);
        let e1 = snap.ema(1);
        let above = c1 > e1 + threshold;
        let below = c1 < e1 - threshold;
        if !above && !below {
            self.gap_count = 0;
            self.gap_extreme = 0.0;
            return 0;
        }

        let mut extreme = if above { f64::MIN } else { f64::MAX };
        let mut count = 0usize;
        let max_lb = snap.len().min(51);
        for i in 1..max_lb {
            let bar_ema = snap.ema(i);
            if above {
                if snap.low(i) > bar_ema {
                    count += 1;
                    extreme = extreme.max(snap.high(i));
                } else {
                    break;
                }
            } else if snap.high(i) < bar_ema {
                count += 1;
                extreme = extreme.min(snap.low(i));
            } else {
                break;
            }
        }
        self.gap_count = count;
        self.gap_extreme = if count > 0 { extreme } else { 0.0 };
        count
    }

    pub fn update(&mut self, snap: &MarketSnapshot) {
        if !self.enabled || snap.atr <= 0.0 || snap.len() < 3 {
            return;
        }
        self.recount(snap);

        let atr = snap.atr;
        let threshold = atr * 0.3;
        let c1 = snap.close(1);
        let e1 = snap.ema(1);
        let above = c1 > e1 + threshold;
        let below = c1 < e1 - threshold;
        let touching = !above && !below;

        if !self.overextended && self.gap_count >= self.threshold {
            self.overextended = true;
            self.direction = Some(if above { Side::Buy } else { Side::Sell });
            self.first_pullback_blocked = false;
            self.waiting_for_recovery = false;
            self.first_pullback_complete = false;
            self.consolidation_count = 0;
            self.pullback_extreme = 0.0;
            debug!(gap_count = self.gap_count, "20-gap overextension set");
        }

        if !self.overextended {
            return;
        }

        // Reset checks run against the state carried in from the previous
        // bar, so a pullback touch (which zeroes the trailing gap count)
        // cannot clear the machine before the block has done its job.
        if self.gap_count == 0 && self.first_pullback_complete {
            self.reset();
            return;
        }
        if snap.len() >= 3 {
            let c2 = snap.close(2);
            let e2 = snap.ema(2);
            let crossed_two_bars = match self.direction {
                Some(Side::Buy) => below && c2 < e2 - threshold,
                Some(Side::Sell) => above && c2 > e2 + threshold,
                None => false,
            };
            if crossed_two_bars {
                self.reset();
                return;
            }
        }

        if !self.first_pullback_complete && touching {
            if !self.first_pullback_blocked {
                self.first_pullback_blocked = true;
                self.waiting_for_recovery = true;
                self.pullback_extreme = match self.direction {
                    Some(Side::Buy) => snap.low(1),
                    _ => snap.high(1),
                };
            }
            self.consolidation_count += 1;
        }

        if self.waiting_for_recovery {
            let mut recovered = false;

            // Consolidation: the last N bars hold inside a tight band.
            if self.consolidation_count >= self.consolidation_bars {
                let n = self.consolidation_bars.min(snap.len());
                let hi = snap.highest(n);
                let lo = snap.lowest(n);
                if hi - lo <= atr * self.consolidation_range_atr {
                    recovered = true;
                }
            }

            // Double bottom / top at the first-pullback extreme.
            if !recovered && self.pullback_extreme > 0.0 {
                let tol = atr * 0.3;
                let b = snap.bar(1);
                match self.direction {
                    Some(Side::Buy) => {
                        if (b.low - self.pullback_extreme).abs() <= tol && b.is_bull() {
                            recovered = true;
                        }
                    }
                    _ => {
                        if (b.high - self.pullback_extreme).abs() <= tol && b.is_bear() {
                            recovered = true;
                        }
                    }
                }
            }

            // Confirmed EMA cross against the overextension direction.
            if !recovered {
                match self.direction {
                    Some(Side::Buy) if below => recovered = true,
                    Some(Side::Sell) if above => recovered = true,
                    _ => {}
                }
            }

            if recovered {
                self.first_pullback_complete = true;
                self.waiting_for_recovery = false;
                debug!("20-gap first pullback released");
            }
        }
    }

    /// True when an H1/L1 entry must be blocked right now.
    pub fn blocks_first_pullback(&self) -> bool {
        self.overextended && self.first_pullback_blocked && !self.first_pullback_complete
    }

    fn reset(&mut self) {
        self.overextended = false;
        self.direction = None;
        self.first_pullback_blocked = false;
        self.waiting_for_recovery = false;
        self.first_pullback_complete = false;
        self.consolidation_count = 0;
        self.pullback_extreme = 0.0;
    }
}

/// Measuring-Gap tracker: a strong-bar gap projects a symmetric target and
/// stays valid until price retraces past the gap midpoint or 20 bars pass.
#[derive(Debug, Default, Clone)]
pub struct MeasuringGapTracker {
    enabled: bool,
    pub has_gap: bool,
    pub gap_high: f64,
    pub gap_low: f64,
    pub direction: Option<Side>,
    pub age_bars: usize,
}

impl MeasuringGapTracker {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            ..Default::default()
        }
    }

    pub fn update(&mut self, snap: &MarketSnapshot) {
        if !self.enabled || snap.atr <= 0.0 || snap.len() < 3 {
            return;
        }
        let atr = snap.atr;

        if self.has_gap {
            self.age_bars += 1;
            let mid = (self.gap_high + self.gap_low) / 2.0;
            let invalid = match self.direction {
                Some(Side::Buy) => snap.low(1) < mid,
                Some(Side::Sell) => snap.high(1) > mid,
                None => true,
            };
            if invalid || self.age_bars > 20 {
                self.has_gap = false;
                self.direction = None;
            } else {
                return;
            }
        }

        let b1 = snap.bar(1);
        let rng = b1.range();
        if rng <= 0.0 {
            return;
        }
        let gap_up = snap.low(1) - snap.high(2);
        if gap_up >= atr * MEASURING_GAP_MIN_SIZE_ATR && b1.is_bull() && b1.body_ratio() > 0.5 {
            self.has_gap = true;
            self.gap_high = snap.low(1);
            self.gap_low = snap.high(2);
            self.direction = Some(Side::Buy);
            self.age_bars = 0;
            return;
        }
        let gap_dn = snap.low(2) - snap.high(1);
        if gap_dn >= atr * MEASURING_GAP_MIN_SIZE_ATR && b1.is_bear() && b1.body_ratio() > 0.5 {
            self.has_gap = true;
            self.gap_high = snap.low(2);
            self.gap_low = snap.high(1);
            self.direction = Some(Side::Sell);
            self.age_bars = 0;
        }
    }
}

/// Breakout-Mode: armed by an unusually strong bar that breaks structure;
/// while active the dispatcher runs the breakout-pullback detector first.
#[derive(Debug, Default, Clone)]
pub struct BreakoutModeTracker {
    enabled: bool,
    pub active: bool,
    pub direction: Option<Side>,
    pub bar_count: usize,
    pub entry: f64,
    pub extreme: f64,
}

impl BreakoutModeTracker {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            ..Default::default()
        }
    }

    /// Arm from the bar that qualified (range >= 1.5 x ATR, body ratio >
    /// 0.6, close in the outer quarter, breaking the latest swing).
    pub fn arm(&mut self, direction: Side, entry: f64, extreme: f64) {
        if !self.enabled {
            return;
        }
        self.active = true;
        self.direction = Some(direction);
        self.bar_count = 0;
        self.entry = entry;
        self.extreme = extreme;
        debug!(?direction, entry, "breakout-mode armed");
    }

    /// Examine the just-closed bar: maybe arm, else advance/expire.
    pub fn update(&mut self, snap: &MarketSnapshot, last_swing_high: f64, last_swing_low: f64) {
        if !self.enabled || snap.atr <= 0.0 || snap.len() < 2 {
            return;
        }
        let atr = snap.atr;
        let b = snap.bar(1);

        if !self.active {
            if b.range() >= atr * BREAKOUT_MODE_ATR_MULT && b.body_ratio() > 0.6 {
                if b.is_bull() && b.close_position() > 0.75 && last_swing_high > 0.0
                    && b.close > last_swing_high
                {
                    self.arm(Side::Buy, b.close, b.high);
                } else if b.is_bear()
                    && b.close_position() < 0.25
                    && last_swing_low > 0.0
                    && b.close < last_swing_low
                {
                    self.arm(Side::Sell, b.close, b.low);
                }
            }
            return;
        }

        self.bar_count += 1;
        match self.direction {
            Some(Side::Buy) => self.extreme = self.extreme.max(b.high),
            Some(Side::Sell) => self.extreme = self.extreme.min(b.low),
            None => {}
        }

        let strong_reversal = b.range() > atr * 1.2
            && b.body_ratio() > 0.65
            && match self.direction {
                Some(Side::Buy) => b.is_bear() && b.close_position() < 0.25,
                Some(Side::Sell) => b.is_bull() && b.close_position() > 0.75,
                None => false,
            };

        let half_retrace = match self.direction {
            Some(Side::Buy) => {
                self.extreme > self.entry && b.close < self.entry + (self.extreme - self.entry) * 0.5
            }
            Some(Side::Sell) => {
                self.extreme < self.entry && b.close > self.entry - (self.entry - self.extreme) * 0.5
            }
            None => true,
        };

        if self.bar_count >= BREAKOUT_MODE_BARS || strong_reversal || half_retrace {
            self.active = false;
            self.direction = None;
        }
    }
}

/// Spread filter: flags when the current spread blows out past a multiple
/// of its own rolling average.
#[derive(Debug, Default)]
pub struct SpreadFilter {
    enabled: bool,
    max_mult: f64,
    lookback: usize,
    history: Vec<f64>,
    pub current: f64,
    pub average: f64,
    pub active: bool,
}

impl SpreadFilter {
    pub fn new(enabled: bool, max_mult: f64, lookback: usize) -> Self {
        Self {
            enabled,
            max_mult,
            lookback: lookback.max(1),
            ..Default::default()
        }
    }

    pub fn update(&mut self, spread: f64) {
        if !self.enabled {
            self.active = false;
            return;
        }
        self.current = spread;
        self.history.push(spread);
        if self.history.len() > self.lookback {
            let drop = self.history.len() - self.lookback;
            self.history.drain(..drop);
        }
        self.average = self.history.iter().sum::<f64>() / self.history.len() as f64;
        self.active = self.average > 0.0 && self.current > self.average * self.max_mult;
    }
}

/// Per-side entry cooldown with a movement override: a repeat entry on the
/// same side is refused until either enough bars pass, price moves 1.5 x ATR
/// from the last entry, or the recent range opens up past 2 x ATR.
#[derive(Debug)]
pub struct CooldownTracker {
    cooldown_bars: i64,
    last_bar: [i64; 2],
    last_price: [f64; 2],
    pub bar_counter: i64,
}

impl CooldownTracker {
    pub fn new(cooldown_bars: i64) -> Self {
        Self {
            cooldown_bars,
            last_bar: [i64::MIN / 2; 2],
            last_price: [0.0; 2],
            bar_counter: 0,
        }
    }

    pub fn tick(&mut self) {
        self.bar_counter += 1;
    }

    /// True when an entry on `side` is allowed right now.
    pub fn allows(&self, side: Side, current_price: f64, snap: &MarketSnapshot) -> bool {
        let idx = side.index();
        if self.bar_counter - self.last_bar[idx] < self.cooldown_bars {
            return false;
        }
        let atr = snap.atr;
        if self.last_price[idx] > 0.0 && atr > 0.0 {
            let moved = (current_price - self.last_price[idx]).abs();
            if moved < atr * 1.5 {
                let n = ((self.cooldown_bars + 2) as usize).min(snap.len());
                if n > 0 {
                    let recent_range = snap.highest(n) - snap.lowest(n);
                    if recent_range < atr * 2.0 {
                        return false;
                    }
                }
            }
        }
        true
    }

    pub fn record(&mut self, side: Side, price: f64) {
        let idx = side.index();
        self.last_bar[idx] = self.bar_counter;
        self.last_price[idx] = price;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trading_core::bars::BarSeries;
    use crate::types::Bar;
    use chrono::{TimeZone, Utc};

    fn bar_at(i: i64, open: f64, high: f64, low: f64, close: f64) -> Bar {
        Bar {
            open_time: Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap()
                + chrono::Duration::minutes(5 * i),
            open,
            high,
            low,
            close,
            volume: 1.0,
        }
    }

    fn warm_series() -> (BarSeries, i64) {
        let mut s = BarSeries::new(256, 20, 20);
        for i in 0..25 {
            s.on_primary_bar_close(bar_at(i, 100.0, 101.0, 99.0, 100.0));
        }
        (s, 25)
    }

    #[test]
    fn test_validate_signal_bar() {
        // Good bull signal bar: body 75% of range, tiny upper tail.
        assert!(validate_signal_bar(104.1, 100.0, 101.0, 104.0, Side::Buy));
        // Bear bar can never validate a buy.
        assert!(!validate_signal_bar(104.0, 100.0, 103.0, 101.0, Side::Buy));
        // Big closing tail fails.
        assert!(!validate_signal_bar(106.0, 100.0, 100.5, 103.6, Side::Buy));
        // Good bear signal bar.
        assert!(validate_signal_bar(104.0, 100.0, 103.5, 100.2, Side::Sell));
    }

    #[test]
    fn test_barb_wire_sets_and_releases() {
        let (mut s, mut i) = warm_series();
        let mut bw = BarbWireFilter::new(true);
        // Five tiny overlapping dojis (range 0.4 < 0.5 * ATR, body ~0).
        for _ in 0..5 {
            s.on_primary_bar_close(bar_at(i, 100.0, 100.2, 99.8, 100.02));
            i += 1;
            bw.update(&s.snapshot());
        }
        assert!(bw.active);

        // Strong bull bar closing above the wire releases and reports.
        s.on_primary_bar_close(bar_at(i, 100.0, 102.5, 100.0, 102.3));
        bw.update(&s.snapshot());
        assert!(!bw.active);
        assert_eq!(bw.breakout_direction(), Some(Side::Buy));
    }

    fn gap_series(n_gap_bars: i64) -> (BarSeries, i64) {
        // Rising bars whose lows never touch the (trailing) EMA.
        let mut s = BarSeries::new(256, 20, 20);
        let mut i = 0;
        for _ in 0..25 {
            s.on_primary_bar_close(bar_at(i, 100.0, 101.0, 99.0, 100.0));
            i += 1;
        }
        let mut px = 103.0;
        for _ in 0..n_gap_bars {
            s.on_primary_bar_close(bar_at(i, px, px + 1.5, px - 0.4, px + 1.2));
            px += 1.2;
            i += 1;
        }
        (s, i)
    }

    #[test]
    fn test_gap_count_counts_trailing_gap_bars() {
        let (s, _) = gap_series(10);
        let mut g = GapTwentyRule::new(true, 20, 5, 1.5);
        let n = g.recount(&s.snapshot());
        assert!(n >= 8, "gap count {n}");
    }

    #[test]
    fn test_overextension_blocks_first_pullback_then_recovers() {
        let (mut s, mut i) = gap_series(24);
        let mut g = GapTwentyRule::new(true, 20, 5, 1.5);
        g.update(&s.snapshot());
        assert!(g.overextended);
        assert_eq!(g.direction, Some(Side::Buy));
        assert!(!g.blocks_first_pullback());

        // Pull back to the EMA: close within 0.3 ATR of it.
        let snap = s.snapshot();
        let ema = snap.ema(1);
        s.on_primary_bar_close(bar_at(i, ema + 1.0, ema + 1.2, ema - 0.5, ema));
        i += 1;
        g.update(&s.snapshot());
        assert!(g.blocks_first_pullback());

        // Five bars of tight consolidation releases the block.
        for _ in 0..5 {
            let snap = s.snapshot();
            let e = snap.ema(1);
            s.on_primary_bar_close(bar_at(i, e, e + 0.4, e - 0.4, e));
            i += 1;
            g.update(&s.snapshot());
        }
        assert!(!g.blocks_first_pullback());
        assert!(g.first_pullback_complete);
    }

    #[test]
    fn test_measuring_gap_detects_and_invalidates() {
        let (mut s, mut i) = warm_series();
        let mut mg = MeasuringGapTracker::new(true);
        // Bar gapping up: low 102 vs previous high 101, gap 1.0 > 0.3 * ATR(2).
        s.on_primary_bar_close(bar_at(i, 102.2, 104.5, 102.0, 104.3));
        i += 1;
        mg.update(&s.snapshot());
        assert!(mg.has_gap);
        assert_eq!(mg.direction, Some(Side::Buy));

        // Retrace below the gap midpoint kills it.
        let mid = (mg.gap_high + mg.gap_low) / 2.0;
        s.on_primary_bar_close(bar_at(i, 103.0, 103.2, mid - 0.5, mid - 0.2));
        mg.update(&s.snapshot());
        assert!(!mg.has_gap);
    }

    #[test]
    fn test_breakout_mode_expires_after_bars() {
        let (mut s, mut i) = warm_series();
        let mut bm = BreakoutModeTracker::new(true);
        // Strong bar breaking a swing high at 101.
        s.on_primary_bar_close(bar_at(i, 100.5, 104.0, 100.4, 103.8));
        i += 1;
        bm.update(&s.snapshot(), 101.0, 99.0);
        assert!(bm.active);

        // Mildly rising bars keep it alive until the bar cap, provided no
        // 50% retrace happens.
        let mut px = 104.0;
        for _ in 0..BREAKOUT_MODE_BARS {
            s.on_primary_bar_close(bar_at(i, px, px + 0.5, px - 0.1, px + 0.4));
            px += 0.4;
            i += 1;
            bm.update(&s.snapshot(), 101.0, 99.0);
        }
        assert!(!bm.active);
    }

    #[test]
    fn test_spread_filter_trips_on_blowout() {
        let mut f = SpreadFilter::new(true, 2.0, 20);
        for _ in 0..20 {
            f.update(1.0);
        }
        assert!(!f.active);
        f.update(3.0);
        assert!(f.active);
    }

    #[test]
    fn test_cooldown_blocks_until_bars_or_movement() {
        let (s, _) = warm_series();
        let snap = s.snapshot();
        let mut cd = CooldownTracker::new(3);
        cd.tick();
        cd.record(Side::Sell, 100.0);
        // Same bar: blocked by bar count.
        assert!(!cd.allows(Side::Sell, 99.8, &snap));
        cd.tick();
        cd.tick();
        cd.tick();
        // Bars elapsed, but price barely moved and the range is tight.
        assert!(!cd.allows(Side::Sell, 99.8, &snap));
        // A large move releases it regardless of range.
        assert!(cd.allows(Side::Sell, 96.0, &snap));
        // The other side was never stamped.
        assert!(cd.allows(Side::Buy, 99.8, &snap));
    }
}
