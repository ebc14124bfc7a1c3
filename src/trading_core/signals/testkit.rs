//! Shared fixture for detector tests: a bar series with all trackers wired
//! the way the dispatcher wires them, stepped once per pushed bar.

use chrono::{TimeZone, Utc};

use crate::trading_core::bars::BarSeries;
use crate::trading_core::filters::{CooldownTracker, GapTwentyRule};
use crate::trading_core::hl_counter::HlCounter;
use crate::trading_core::market_state::MarketStateTracker;
use crate::trading_core::swings::SwingTracker;
use crate::types::{Bar, HtfDirection};

use super::{BreakoutMemory, ReversalAttemptTracker, ScanCtx, SignalConfig};

pub(crate) struct Harness {
    pub series: BarSeries,
    pub swings: SwingTracker,
    pub hl: HlCounter,
    pub mstate: MarketStateTracker,
    pub cooldown: CooldownTracker,
    pub gap20: GapTwentyRule,
    pub breakout: BreakoutMemory,
    pub reversal: ReversalAttemptTracker,
    pub htf: HtfDirection,
    pub bar_index: i64,
    i: i64,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            series: BarSeries::new(256, 20, 20),
            swings: SwingTracker::new(),
            hl: HlCounter::new(),
            mstate: MarketStateTracker::new(0.5, 0.40, 2.5),
            cooldown: CooldownTracker::new(3),
            gap20: GapTwentyRule::new(true, 20, 5, 1.5),
            breakout: BreakoutMemory::default(),
            reversal: ReversalAttemptTracker::default(),
            htf: HtfDirection::Flat,
            bar_index: 0,
            i: 0,
        }
    }

    pub fn push(&mut self, open: f64, high: f64, low: f64, close: f64) {
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
        self.bar_index += 1;
        self.series.on_primary_bar_close(b);
        let snap = self.series.snapshot();
        self.swings.update(&snap);
        self.mstate.update(&snap, &self.swings);
        self.hl.update(&snap, &self.swings);
        self.cooldown.tick();
        self.breakout.tick();
        self.reversal
            .on_new_bar(&snap, self.mstate.is_strong_trend_regime());
    }

    /// Unit-range filler bars: ATR settles at 2.0, regime stays Channel.
    pub fn warm(&mut self) {
        for _ in 0..25 {
            self.push(100.0, 101.0, 99.0, 100.0);
        }
    }

    pub fn scan<F, T>(&mut self, f: F) -> T
    where
        F: FnOnce(&mut ScanCtx) -> T,
    {
        let snap = self.series.snapshot();
        let mut ctx = ScanCtx {
            snap: &snap,
            swings: &self.swings,
            hl: &mut self.hl,
            mstate: &self.mstate,
            cooldown: &mut self.cooldown,
            gap20: &self.gap20,
            htf: self.htf,
            breakout: &mut self.breakout,
            reversal: &mut self.reversal,
            cfg: SignalConfig::default(),
            bar_index: self.bar_index,
        };
        f(&mut ctx)
    }
}
