//! Brooks push counting (H1/H2, L1/L2).
//!
//! A push is counted when a fresh swing high (resp. low) exceeds the
//! previous one and the intervening pullback is deep enough to matter.
//! Counts reset on a lower low / higher high against the count, on a
//! significant new extreme beyond the previous swing, or on a strong
//! reversal bar.

use crate::trading_core::bars::MarketSnapshot;
use crate::trading_core::swings::SwingTracker;

/// Reset when price runs this far beyond the previous swing, in ATR units.
pub const HL_RESET_NEW_EXTREME_ATR: f64 = 0.5;
/// Minimum pullback depth for a push to qualify, in ATR units.
pub const HL_MIN_PULLBACK_ATR: f64 = 0.2;

#[derive(Debug, Default)]
pub struct HlCounter {
    pub h_count: usize,
    pub h_last_swing_high: f64,
    pub h_last_pullback_low: f64,

    pub l_count: usize,
    pub l_last_swing_low: f64,
    pub l_last_bounce_high: f64,
}

impl HlCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset_all(&mut self) {
        self.reset_h();
        self.reset_l();
    }

    pub fn update(&mut self, snap: &MarketSnapshot, swings: &SwingTracker) {
        if swings.swings().len() < 4 || snap.atr <= 0.0 || snap.len() < 2 {
            return;
        }
        let atr = snap.atr;
        let sh1 = swings.recent_swing_high(1, false);
        let sh2 = swings.recent_swing_high(2, false);
        let sl1 = swings.recent_swing_low(1, false);
        let sl2 = swings.recent_swing_low(2, false);

        let reset_extreme = atr * HL_RESET_NEW_EXTREME_ATR;
        let min_pullback = atr * HL_MIN_PULLBACK_ATR;

        let b = snap.bar(1);
        let rng = b.range().max(1e-10);

        let strong_rev_down = b.range() > atr * 0.8 && b.is_bear() && (b.close - b.low) / rng < 0.3;
        let strong_rev_up = b.range() > atr * 0.8 && b.is_bull() && (b.high - b.close) / rng < 0.3;

        // H side.
        if sh1 > 0.0 && sh2 > 0.0 && sl1 > 0.0 {
            if b.high > sh1 && sl1 < sh2 && self.h_last_swing_high < sh1 {
                let pullback_depth = sh2 - sl1;
                if pullback_depth >= min_pullback {
                    self.h_count += 1;
                    self.h_last_swing_high = sh1;
                    self.h_last_pullback_low = sl1;
                }
            }

            if sl2 > 0.0 && b.low < sl1 && sl1 < sl2 {
                self.reset_h();
            } else if b.low < sl1 - reset_extreme {
                self.reset_h();
            } else if strong_rev_down {
                self.reset_h();
            }
        }

        // L side.
        if sl1 > 0.0 && sl2 > 0.0 && sh1 > 0.0 {
            if b.low < sl1
                && sh1 > sl2
                && (self.l_last_swing_low == 0.0 || sl1 < self.l_last_swing_low)
            {
                let bounce_depth = sh1 - sl2;
                if bounce_depth >= min_pullback {
                    self.l_count += 1;
                    self.l_last_swing_low = sl1;
                    self.l_last_bounce_high = sh1;
                }
            }

            if sh2 > 0.0 && b.high > sh1 && sh1 > sh2 {
                self.reset_l();
            } else if b.high > sh1 + reset_extreme {
                self.reset_l();
            } else if strong_rev_up {
                self.reset_l();
            }
        }
    }

    pub fn reset_h(&mut self) {
        self.h_count = 0;
        self.h_last_swing_high = 0.0;
        self.h_last_pullback_low = 0.0;
    }

    pub fn reset_l(&mut self) {
        self.l_count = 0;
        self.l_last_swing_low = 0.0;
        self.l_last_bounce_high = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trading_core::bars::BarSeries;
    use crate::types::Bar;
    use chrono::{TimeZone, Utc};

    struct Fixture {
        series: BarSeries,
        swings: SwingTracker,
        hl: HlCounter,
        i: i64,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                series: BarSeries::new(256, 20, 20),
                swings: SwingTracker::new(),
                hl: HlCounter::new(),
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
            self.hl.update(&snap, &self.swings);
        }

        /// A small-range bar so ATR stays close to 1.
        fn quiet(&mut self, level: f64) {
            self.push(level, level + 0.5, level - 0.5, level);
        }
    }

    /// Drive price through: up-leg to H_a, pullback to L_a, up-leg past H_a
    /// (push 1), pullback to L_b > L_a, and a break above H_b (push 2).
    fn staircase() -> Fixture {
        let mut f = Fixture::new();
        // Warm ATR with unit-range bars.
        for k in 0..21 {
            f.quiet(100.0 + 0.01 * k as f64);
        }
        // Leg up to swing high 104.
        for px in [101.0, 102.0, 103.0, 104.0] {
            f.push(px - 1.0, px, px - 1.2, px - 0.2);
        }
        // Pullback to swing low 101 (deep enough: > 0.2 ATR).
        for px in [103.0, 102.0, 101.0] {
            f.push(px + 1.0, px + 1.2, px, px + 0.2);
        }
        // Leg up through 104 to 106 -> first push once swings confirm.
        for px in [102.0, 103.0, 104.5, 105.0, 106.0] {
            f.push(px - 1.0, px, px - 1.2, px - 0.2);
        }
        // Pullback to 103.5 (higher low).
        for px in [105.0, 104.0, 103.5] {
            f.push(px + 1.0, px + 1.2, px, px + 0.2);
        }
        // Break above 106.
        for px in [104.5, 105.5, 106.5, 107.0] {
            f.push(px - 1.0, px, px - 1.2, px - 0.2);
        }
        f
    }

    #[test]
    fn test_pushes_accumulate() {
        let f = staircase();
        assert!(f.hl.h_count >= 1, "h_count = {}", f.hl.h_count);
        assert!(f.hl.h_last_pullback_low > 0.0);
    }

    #[test]
    fn test_strong_reversal_bar_resets_h() {
        let mut f = staircase();
        assert!(f.hl.h_count >= 1);
        // Big bear bar closing near its low: range well above 0.8 ATR.
        let top = 107.0;
        f.push(top, top + 0.2, top - 5.0, top - 4.8);
        assert_eq!(f.hl.h_count, 0);
    }

    #[test]
    fn test_reset_all_clears_both_sides() {
        let mut f = staircase();
        f.hl.l_count = 2;
        f.hl.reset_all();
        assert_eq!(f.hl.h_count, 0);
        assert_eq!(f.hl.l_count, 0);
        assert_eq!(f.hl.h_last_swing_high, 0.0);
    }
}
