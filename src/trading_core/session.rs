//! Wall-clock session gating.
//!
//! The gate is a pure function of the current time: no new entries over the
//! weekend window, forced position review late on Friday, and an H/L count
//! reset when Monday opens with a gap.

use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};

use crate::trading_core::bars::MarketSnapshot;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStatus {
    pub is_weekend: bool,
    pub is_friday_close: bool,
    pub is_sunday_pre_open: bool,
}

impl SessionStatus {
    /// New entries are refused in any of the gated windows. Position
    /// management continues regardless.
    pub fn blocks_entries(&self) -> bool {
        self.is_weekend || self.is_friday_close || self.is_sunday_pre_open
    }
}

#[derive(Debug, Clone)]
pub struct SessionGate {
    enabled: bool,
    friday_close_hour_gmt: u32,
    sunday_open_hour_gmt: u32,
    monday_gap_reset_atr: f64,
}

impl SessionGate {
    pub fn new(
        enabled: bool,
        friday_close_hour_gmt: u32,
        sunday_open_hour_gmt: u32,
        monday_gap_reset_atr: f64,
    ) -> Self {
        Self {
            enabled,
            friday_close_hour_gmt,
            sunday_open_hour_gmt,
            monday_gap_reset_atr,
        }
    }

    pub fn status(&self, now: DateTime<Utc>) -> SessionStatus {
        if !self.enabled {
            return SessionStatus::default();
        }
        let weekday = now.weekday();
        let hour = now.hour();

        let is_friday_close = weekday == Weekday::Fri && hour >= self.friday_close_hour_gmt;
        let is_sunday_pre_open = weekday == Weekday::Sun && hour < self.sunday_open_hour_gmt;
        let is_weekend =
            weekday == Weekday::Sat || (weekday == Weekday::Sun && hour < self.sunday_open_hour_gmt);

        SessionStatus {
            is_weekend,
            is_friday_close,
            is_sunday_pre_open,
        }
    }

    /// On the first bars of a Monday, a gap between the last close and the
    /// new open of at least `monday_gap_reset_atr` x ATR invalidates carried
    /// H/L counts. Returns true when the caller should reset them.
    pub fn monday_gap_reset(&self, snap: &MarketSnapshot) -> bool {
        if !self.enabled || snap.len() < 2 || snap.atr <= 0.0 {
            return false;
        }
        let b1 = snap.bar(1);
        if b1.open_time.weekday() != Weekday::Mon {
            return false;
        }
        let gap = (b1.open - snap.close(2)).abs();
        gap >= self.monday_gap_reset_atr * snap.atr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trading_core::bars::BarSeries;
    use crate::types::Bar;
    use chrono::TimeZone;

    fn gate() -> SessionGate {
        SessionGate::new(true, 22, 0, 0.5)
    }

    #[test]
    fn test_weekday_open() {
        // Wednesday noon.
        let now = Utc.with_ymd_and_hms(2024, 3, 6, 12, 0, 0).unwrap();
        let s = gate().status(now);
        assert!(!s.blocks_entries());
    }

    #[test]
    fn test_friday_close_window() {
        let before = Utc.with_ymd_and_hms(2024, 3, 8, 21, 59, 0).unwrap();
        assert!(!gate().status(before).is_friday_close);
        let after = Utc.with_ymd_and_hms(2024, 3, 8, 22, 1, 0).unwrap();
        let s = gate().status(after);
        assert!(s.is_friday_close);
        assert!(s.blocks_entries());
    }

    #[test]
    fn test_saturday_is_weekend() {
        let sat = Utc.with_ymd_and_hms(2024, 3, 9, 10, 0, 0).unwrap();
        assert!(gate().status(sat).is_weekend);
    }

    #[test]
    fn test_disabled_gate_never_blocks() {
        let g = SessionGate::new(false, 22, 0, 0.5);
        let sat = Utc.with_ymd_and_hms(2024, 3, 9, 10, 0, 0).unwrap();
        assert!(!g.status(sat).blocks_entries());
    }

    #[test]
    fn test_monday_gap_reset() {
        let mut s = BarSeries::new(64, 20, 20);
        // Friday-ish flat bars to warm ATR (ATR = 2).
        let friday = Utc.with_ymd_and_hms(2024, 3, 8, 0, 0, 0).unwrap();
        for i in 0..21 {
            s.on_primary_bar_close(Bar {
                open_time: friday + chrono::Duration::minutes(5 * i),
                open: 100.0,
                high: 101.0,
                low: 99.0,
                close: 100.0,
                volume: 1.0,
            });
        }
        // Monday bar opening two full points away (1.0 x ATR > 0.5 x ATR).
        let monday = Utc.with_ymd_and_hms(2024, 3, 11, 0, 0, 0).unwrap();
        s.on_primary_bar_close(Bar {
            open_time: monday,
            open: 102.0,
            high: 103.0,
            low: 101.5,
            close: 102.5,
            volume: 1.0,
        });
        assert!(gate().monday_gap_reset(&s.snapshot()));

        // A flat Monday open would not reset.
        let mut s2 = BarSeries::new(64, 20, 20);
        for i in 0..21 {
            s2.on_primary_bar_close(Bar {
                open_time: friday + chrono::Duration::minutes(5 * i),
                open: 100.0,
                high: 101.0,
                low: 99.0,
                close: 100.0,
                volume: 1.0,
            });
        }
        s2.on_primary_bar_close(Bar {
            open_time: monday,
            open: 100.2,
            high: 101.0,
            low: 99.5,
            close: 100.4,
            volume: 1.0,
        });
        assert!(!gate().monday_gap_reset(&s2.snapshot()));
    }
}
