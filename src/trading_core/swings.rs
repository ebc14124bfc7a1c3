//! Swing-point tracking.
//!
//! Confirmed swings use depth 3 (the centre bar must strictly exceed its
//! three neighbours on each side) and feed H/L counting and pattern
//! structure. A single tentative swing per side uses depth 1 so stop
//! placement doesn't wait four bars for confirmation. A secondary tracker on
//! a lower time-frame reports fresh higher-lows / lower-highs for structural
//! trailing of the Runner leg.

use serde::{Deserialize, Serialize};

use crate::trading_core::bars::MarketSnapshot;
use crate::types::Bar;

pub const SWING_CONFIRM_DEPTH: usize = 3;
const MAX_SWING_POINTS: usize = 40;
const MAX_SWING_AGE_BARS: usize = 40;
const MAX_LTF_SWINGS: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SwingPoint {
    pub price: f64,
    /// Bars since this swing's centre bar, incremented each new bar.
    pub bar_index: usize,
    pub is_high: bool,
}

/// Primary-time-frame swing tracker. Call [`SwingTracker::update`] once per
/// closed bar, after the buffer has appended it.
#[derive(Debug, Default, Clone)]
pub struct SwingTracker {
    depth: usize,
    /// Confirmed swings, newest first.
    swings: Vec<SwingPoint>,

    cached_sh1: f64,
    cached_sh2: f64,
    cached_sl1: f64,
    cached_sl2: f64,

    temp_swing_high: f64,
    temp_swing_low: f64,
}

impl SwingTracker {
    pub fn new() -> Self {
        Self {
            depth: SWING_CONFIRM_DEPTH,
            ..Default::default()
        }
    }

    pub fn swings(&self) -> &[SwingPoint] {
        &self.swings
    }

    pub fn update(&mut self, snap: &MarketSnapshot) {
        let n = snap.len();
        if n < 4 {
            return;
        }

        for sp in &mut self.swings {
            sp.bar_index += 1;
        }
        self.swings.retain(|sp| sp.bar_index <= MAX_SWING_AGE_BARS);

        // Tentative swings: centre at bar 2, depth 1.
        if snap.high(1) < snap.high(2) && snap.high(3) < snap.high(2) {
            self.temp_swing_high = snap.high(2);
        }
        if snap.low(1) > snap.low(2) && snap.low(3) > snap.low(2) {
            self.temp_swing_low = snap.low(2);
        }

        // Confirmed swing: centre at bar depth+1, strict extremum vs the
        // depth neighbours on each side.
        let check_bar = self.depth + 1;
        if n < check_bar + self.depth {
            self.refresh_cache();
            return;
        }

        let centre_h = snap.high(check_bar);
        let is_sh = (1..=self.depth)
            .all(|k| snap.high(check_bar - k) < centre_h && snap.high(check_bar + k) < centre_h);

        let centre_l = snap.low(check_bar);
        let is_sl = (1..=self.depth)
            .all(|k| snap.low(check_bar - k) > centre_l && snap.low(check_bar + k) > centre_l);

        if is_sh {
            self.add(centre_h, check_bar, true);
        }
        if is_sl {
            self.add(centre_l, check_bar, false);
        }
        self.refresh_cache();
    }

    /// Nth most recent confirmed swing high (1-based); 0.0 if absent.
    /// With `allow_tentative`, the depth-1 swing substitutes for n == 1 when
    /// no confirmed swing exists yet.
    pub fn recent_swing_high(&self, nth: usize, allow_tentative: bool) -> f64 {
        if nth == 1 && self.cached_sh1 > 0.0 {
            return self.cached_sh1;
        }
        if nth == 2 && self.cached_sh2 > 0.0 {
            return self.cached_sh2;
        }
        if nth == 1 && allow_tentative && self.temp_swing_high > 0.0 {
            return self.temp_swing_high;
        }
        self.swings
            .iter()
            .filter(|s| s.is_high)
            .nth(nth - 1)
            .map(|s| s.price)
            .unwrap_or(0.0)
    }

    pub fn recent_swing_low(&self, nth: usize, allow_tentative: bool) -> f64 {
        if nth == 1 && self.cached_sl1 > 0.0 {
            return self.cached_sl1;
        }
        if nth == 2 && self.cached_sl2 > 0.0 {
            return self.cached_sl2;
        }
        if nth == 1 && allow_tentative && self.temp_swing_low > 0.0 {
            return self.temp_swing_low;
        }
        self.swings
            .iter()
            .filter(|s| !s.is_high)
            .nth(nth - 1)
            .map(|s| s.price)
            .unwrap_or(0.0)
    }

    fn add(&mut self, price: f64, bar_index: usize, is_high: bool) {
        if self
            .swings
            .iter()
            .any(|s| s.bar_index == bar_index && s.is_high == is_high)
        {
            return;
        }
        if self.swings.len() >= MAX_SWING_POINTS {
            self.swings.pop();
        }
        self.swings.insert(
            0,
            SwingPoint {
                price,
                bar_index,
                is_high,
            },
        );
    }

    fn refresh_cache(&mut self) {
        self.cached_sh1 = 0.0;
        self.cached_sh2 = 0.0;
        self.cached_sl1 = 0.0;
        self.cached_sl2 = 0.0;
        let mut sh = 0;
        let mut sl = 0;
        for sp in &self.swings {
            if sh >= 2 && sl >= 2 {
                break;
            }
            if sp.is_high && sh < 2 {
                if sh == 0 {
                    self.cached_sh1 = sp.price;
                } else {
                    self.cached_sh2 = sp.price;
                }
                sh += 1;
            } else if !sp.is_high && sl < 2 {
                if sl == 0 {
                    self.cached_sl1 = sp.price;
                } else {
                    self.cached_sl2 = sp.price;
                }
                sl += 1;
            }
        }
    }
}

/// Lower-time-frame swing tracker used for structural trailing of the
/// Runner leg. Rebuilt from the recent LTF window on every LTF bar close.
#[derive(Debug, Default, Clone)]
pub struct LtfSwingTracker {
    /// Swing lows / highs, newest first.
    swing_lows: Vec<f64>,
    swing_highs: Vec<f64>,
}

impl LtfSwingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// `bars` is the LTF history, newest first (index 0 = last closed).
    pub fn update(&mut self, bars: &[Bar]) {
        const DEPTH: usize = 3;
        let need = DEPTH * 2 + 5;
        if bars.len() < need {
            return;
        }

        let mut lows = Vec::new();
        let mut highs = Vec::new();
        // Candidate offsets, newest candidates first.
        for cb in (DEPTH + 1)..(bars.len() - DEPTH) {
            let centre = &bars[cb];
            let is_sl = (1..=DEPTH).all(|k| bars[cb - k].low > centre.low && bars[cb + k].low > centre.low);
            if is_sl && lows.len() < MAX_LTF_SWINGS {
                lows.push(centre.low);
            }
            let is_sh =
                (1..=DEPTH).all(|k| bars[cb - k].high < centre.high && bars[cb + k].high < centre.high);
            if is_sh && highs.len() < MAX_LTF_SWINGS {
                highs.push(centre.high);
            }
        }
        self.swing_lows = lows;
        self.swing_highs = highs;
    }

    /// A fresh higher-low above entry that would tighten the current stop,
    /// returned with the trailing buffer already applied. 0.0 when none.
    pub fn structural_stop_buy(&self, entry: f64, current_sl: f64, atr: f64) -> f64 {
        if self.swing_lows.len() < 2 || atr <= 0.0 {
            return 0.0;
        }
        let buf = atr * 0.2;
        for w in self.swing_lows.windows(2) {
            let (new_low, prev_low) = (w[0], w[1]);
            if new_low > entry && new_low > prev_low && (current_sl <= 0.0 || new_low > current_sl + buf)
            {
                return new_low - buf;
            }
        }
        0.0
    }

    /// Symmetric: a fresh lower-high below entry. 0.0 when none.
    pub fn structural_stop_sell(&self, entry: f64, current_sl: f64, atr: f64) -> f64 {
        if self.swing_highs.len() < 2 || atr <= 0.0 {
            return 0.0;
        }
        let buf = atr * 0.2;
        for w in self.swing_highs.windows(2) {
            let (new_high, prev_high) = (w[0], w[1]);
            if new_high < entry
                && new_high < prev_high
                && (current_sl <= 0.0 || new_high < current_sl - buf)
            {
                return new_high + buf;
            }
        }
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trading_core::bars::BarSeries;
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

    /// Feed closes so the bar at `peak_i` is a strict swing high (depth 3).
    fn series_with_peak() -> (BarSeries, SwingTracker) {
        let mut s = BarSeries::new(256, 20, 20);
        let mut tr = SwingTracker::new();
        // 3 rising, 1 peak, 3 falling, then filler so the peak sits at
        // offset depth+1 from the newest bar at some update.
        let highs = [101.0, 102.0, 103.0, 110.0, 103.0, 102.0, 101.0, 100.5, 100.2];
        for (i, h) in highs.iter().enumerate() {
            let b = bar_at(i as i64, h - 1.0, *h, h - 2.0, h - 0.5);
            s.on_primary_bar_close(b);
            tr.update(&s.snapshot());
        }
        (s, tr)
    }

    #[test]
    fn test_confirmed_swing_high_detected() {
        let (_, tr) = series_with_peak();
        assert!((tr.recent_swing_high(1, false) - 110.0).abs() < 1e-9);
    }

    #[test]
    fn test_tentative_swing_faster_than_confirmed() {
        let mut s = BarSeries::new(256, 20, 20);
        let mut tr = SwingTracker::new();
        let highs = [101.0, 102.0, 110.0, 103.0];
        for (i, h) in highs.iter().enumerate() {
            s.on_primary_bar_close(bar_at(i as i64, h - 1.0, *h, h - 2.0, h - 0.5));
            tr.update(&s.snapshot());
        }
        // Not yet confirmable at depth 3, but the depth-1 tentative is there.
        assert_eq!(tr.recent_swing_high(1, false), 0.0);
        assert!((tr.recent_swing_high(1, true) - 110.0).abs() < 1e-9);
    }

    #[test]
    fn test_swings_age_out() {
        let (mut s, mut tr) = series_with_peak();
        for i in 9..60 {
            s.on_primary_bar_close(bar_at(i, 99.0, 100.0, 98.0, 99.5));
            tr.update(&s.snapshot());
        }
        // The 110 peak is more than 40 bars old now.
        assert!(tr.swings().iter().all(|sp| sp.bar_index <= 40));
        assert!(tr.recent_swing_high(1, false) < 110.0);
    }

    #[test]
    fn test_ltf_structural_stop_buy() {
        let mut ltf = LtfSwingTracker::new();
        // Newest-first window with two swing lows, the newer one higher
        // (higher-low) and above entry.
        let mut bars = Vec::new();
        let lows = [
            106.0, 105.5, 105.0, 104.0, 103.0, 104.0, 105.0, 103.5, 102.0, 103.0, 104.0, 105.0,
        ];
        for (i, lo) in lows.iter().enumerate() {
            bars.push(bar_at(i as i64, lo + 1.0, lo + 2.0, *lo, lo + 1.5));
        }
        ltf.update(&bars);
        let stop = ltf.structural_stop_buy(100.0, 0.0, 1.0);
        // Newer swing low 103.0 above the prior 102.0, minus the 0.2 * ATR buffer.
        assert!((stop - 102.8).abs() < 1e-9);
    }

    #[test]
    fn test_ltf_stop_requires_improvement() {
        let mut ltf = LtfSwingTracker::new();
        let mut bars = Vec::new();
        let lows = [
            106.0, 105.5, 105.0, 104.0, 103.0, 104.0, 105.0, 103.5, 102.0, 103.0, 104.0, 105.0,
        ];
        for (i, lo) in lows.iter().enumerate() {
            bars.push(bar_at(i as i64, lo + 1.0, lo + 2.0, *lo, lo + 1.5));
        }
        ltf.update(&bars);
        // Current stop already tighter than the candidate: no update.
        assert_eq!(ltf.structural_stop_buy(100.0, 102.9, 1.0), 0.0);
    }
}
