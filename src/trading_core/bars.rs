//! Bar ring buffers and derived series.
//!
//! The primary series holds closed bars newest-first; index 1 is the last
//! closed bar, matching how every detector reasons about "the signal bar".
//! Index 0 is the forming bar, which only the tick-level exit path looks at.
//! Closed bars drive EMA(20)/ATR(20) recomputation; ticks are cheap and only
//! trigger a throttled ATR refresh when the forming bar blows out past
//! 1.5x ATR, so Spike-condition stop sanity doesn't starve mid-bar.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::types::{Bar, HtfDirection, Tick, Timeframe};

/// Minimum seconds between tick-driven ATR refreshes.
const ATR_REFRESH_SECS: i64 = 5;
/// Forming-bar range that triggers a refresh, in ATR units.
const ATR_REFRESH_RANGE_MULT: f64 = 1.5;

/// Primary-time-frame bar series with EMA and ATR derived values.
pub struct BarSeries {
    capacity: usize,
    ema_period: usize,
    atr_period: usize,
    /// Closed bars, front = most recent.
    closed: VecDeque<Bar>,
    /// EMA aligned with `closed` (front = EMA at the most recent close).
    ema: VecDeque<f64>,
    /// Wilder ATR over closed bars; 0 until warm.
    atr: f64,
    tr_warmup: Vec<f64>,
    forming: Option<Bar>,
    live_atr: f64,
    last_atr_refresh: Option<DateTime<Utc>>,
    last_spread: f64,
}

impl BarSeries {
    pub fn new(capacity: usize, ema_period: usize, atr_period: usize) -> Self {
        Self {
            capacity: capacity.max(ema_period + atr_period),
            ema_period,
            atr_period,
            closed: VecDeque::with_capacity(capacity),
            ema: VecDeque::with_capacity(capacity),
            atr: 0.0,
            tr_warmup: Vec::new(),
            forming: None,
            live_atr: 0.0,
            last_atr_refresh: None,
            last_spread: 0.0,
        }
    }

    /// Append a closed bar and recompute EMA/ATR. Returns false for a
    /// duplicate open_time (replay is a no-op) or an out-of-order bar.
    pub fn on_primary_bar_close(&mut self, bar: Bar) -> bool {
        if let Some(last) = self.closed.front() {
            if bar.open_time <= last.open_time {
                return false;
            }
        }

        let prev_close = self.closed.front().map(|b| b.close);

        // EMA of close.
        let ema = match self.ema.front() {
            Some(&prev) => {
                let k = 2.0 / (self.ema_period as f64 + 1.0);
                prev + k * (bar.close - prev)
            }
            None => bar.close,
        };

        // Wilder ATR, seeded with a simple mean of the first `period` TRs.
        let tr = match prev_close {
            Some(pc) => bar
                .range()
                .max((bar.high - pc).abs())
                .max((bar.low - pc).abs()),
            None => bar.range(),
        };
        if self.atr == 0.0 {
            self.tr_warmup.push(tr);
            if self.tr_warmup.len() >= self.atr_period {
                self.atr = self.tr_warmup.iter().sum::<f64>() / self.tr_warmup.len() as f64;
                self.tr_warmup.clear();
            }
        } else {
            let n = self.atr_period as f64;
            self.atr = (self.atr * (n - 1.0) + tr) / n;
        }
        self.live_atr = self.atr;

        self.closed.push_front(bar);
        self.ema.push_front(ema);
        while self.closed.len() > self.capacity {
            self.closed.pop_back();
            self.ema.pop_back();
        }

        // A close supersedes any forming bar at or before its open_time.
        if let Some(f) = &self.forming {
            if f.open_time <= bar.open_time {
                self.forming = None;
            }
        }
        true
    }

    /// Tick path: extend the forming bar, remember the spread, and refresh
    /// ATR at most every few seconds when the forming bar's range explodes.
    /// No other recomputation happens here.
    pub fn on_tick(&mut self, tick: Tick, bar_open_time: DateTime<Utc>) {
        self.last_spread = tick.spread();
        let price = tick.mid();
        match &mut self.forming {
            Some(f) if f.open_time == bar_open_time => {
                f.high = f.high.max(price);
                f.low = f.low.min(price);
                f.close = price;
            }
            _ => {
                self.forming = Some(Bar {
                    open_time: bar_open_time,
                    open: price,
                    high: price,
                    low: price,
                    close: price,
                    volume: 0.0,
                });
            }
        }

        if self.atr > 0.0 {
            let forming_range = self.forming.as_ref().map(|f| f.range()).unwrap_or(0.0);
            if forming_range > self.atr * ATR_REFRESH_RANGE_MULT {
                let due = match self.last_atr_refresh {
                    Some(t) => (tick.time - t).num_seconds() >= ATR_REFRESH_SECS,
                    None => true,
                };
                if due {
                    let n = self.atr_period as f64;
                    self.live_atr = (self.atr * (n - 1.0) + forming_range) / n;
                    self.last_atr_refresh = Some(tick.time);
                    debug!(
                        forming_range,
                        atr = self.atr,
                        live_atr = self.live_atr,
                        "intra-bar ATR refresh"
                    );
                }
            }
        }
    }

    pub fn closed_len(&self) -> usize {
        self.closed.len()
    }

    /// Closed bar at index i (1 = last closed).
    pub fn bar(&self, i: usize) -> Option<&Bar> {
        if i == 0 {
            return self.forming.as_ref();
        }
        self.closed.get(i - 1)
    }

    pub fn ema_at(&self, i: usize) -> Option<f64> {
        if i == 0 {
            return self.ema.front().copied();
        }
        self.ema.get(i - 1).copied()
    }

    pub fn atr(&self) -> f64 {
        self.atr
    }

    pub fn live_atr(&self) -> f64 {
        self.live_atr
    }

    pub fn spread(&self) -> f64 {
        self.last_spread
    }

    pub fn last_open_time(&self) -> Option<DateTime<Utc>> {
        self.closed.front().map(|b| b.open_time)
    }

    /// Value-copied view for the dispatcher and detectors. Readers never
    /// touch the live buffer.
    pub fn snapshot(&self) -> MarketSnapshot {
        MarketSnapshot {
            bars: self.closed.iter().copied().collect(),
            ema: self.ema.iter().copied().collect(),
            atr: self.atr,
            live_atr: self.live_atr,
            spread: self.last_spread,
            forming: self.forming,
        }
    }
}

/// Immutable per-bar view consumed by the classifier and detectors.
///
/// Indexing is newest-first and mirrors the series: `bar(1)` is the signal
/// bar. Callers must check `ready(n)` before indexing deeper than they have
/// bars; an unready snapshot produces no signals by construction.
#[derive(Debug, Clone)]
pub struct MarketSnapshot {
    bars: Vec<Bar>,
    ema: Vec<f64>,
    pub atr: f64,
    pub live_atr: f64,
    pub spread: f64,
    pub forming: Option<Bar>,
}

impl MarketSnapshot {
    pub fn empty() -> Self {
        Self {
            bars: Vec::new(),
            ema: Vec::new(),
            atr: 0.0,
            live_atr: 0.0,
            spread: 0.0,
            forming: None,
        }
    }

    /// Number of closed bars available.
    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    /// True when at least `n` closed bars exist and ATR is warm.
    pub fn ready(&self, n: usize) -> bool {
        self.bars.len() >= n && self.atr > 0.0
    }

    pub fn bar(&self, i: usize) -> &Bar {
        &self.bars[i - 1]
    }

    pub fn get(&self, i: usize) -> Option<&Bar> {
        if i == 0 {
            return None;
        }
        self.bars.get(i - 1)
    }

    pub fn high(&self, i: usize) -> f64 {
        self.bars[i - 1].high
    }

    pub fn low(&self, i: usize) -> f64 {
        self.bars[i - 1].low
    }

    pub fn open(&self, i: usize) -> f64 {
        self.bars[i - 1].open
    }

    pub fn close(&self, i: usize) -> f64 {
        self.bars[i - 1].close
    }

    pub fn ema(&self, i: usize) -> f64 {
        self.ema[i - 1]
    }

    /// Highest high over bars [1, n].
    pub fn highest(&self, n: usize) -> f64 {
        self.bars
            .iter()
            .take(n)
            .map(|b| b.high)
            .fold(f64::MIN, f64::max)
    }

    /// Lowest low over bars [1, n].
    pub fn lowest(&self, n: usize) -> f64 {
        self.bars
            .iter()
            .take(n)
            .map(|b| b.low)
            .fold(f64::MAX, f64::min)
    }

    /// Mean |body| over bars [from, from+n).
    pub fn mean_body(&self, from: usize, n: usize) -> f64 {
        let slice: Vec<f64> = (from..from + n)
            .filter_map(|i| self.get(i))
            .map(|b| b.body())
            .collect();
        if slice.is_empty() {
            0.0
        } else {
            slice.iter().sum::<f64>() / slice.len() as f64
        }
    }

    /// Total-range / sum-of-bar-ranges over the last `lookback` closed bars.
    /// Low values mean heavy overlap (the bars tile very little new ground).
    pub fn overlap_ratio(&self, lookback: usize) -> f64 {
        if self.bars.len() < lookback {
            return 1.0;
        }
        let mut hi = f64::MIN;
        let mut lo = f64::MAX;
        let mut sum_range = 0.0;
        for b in self.bars.iter().take(lookback) {
            hi = hi.max(b.high);
            lo = lo.min(b.low);
            sum_range += b.range();
        }
        let total = hi - lo;
        if sum_range <= 0.0 || total <= 0.0 {
            return 1.0;
        }
        total / sum_range
    }
}

/// Higher-time-frame EMA, maintained from the HTF bar stream.
pub struct HtfSeries {
    ema_period: usize,
    ema: Option<f64>,
    last_close: Option<f64>,
    last_open_time: Option<DateTime<Utc>>,
    pub timeframe: Timeframe,
}

impl HtfSeries {
    pub fn new(ema_period: usize, timeframe: Timeframe) -> Self {
        Self {
            ema_period,
            ema: None,
            last_close: None,
            last_open_time: None,
            timeframe,
        }
    }

    pub fn on_htf_bar_close(&mut self, bar: Bar) -> bool {
        if let Some(t) = self.last_open_time {
            if bar.open_time <= t {
                return false;
            }
        }
        let ema = match self.ema {
            Some(prev) => {
                let k = 2.0 / (self.ema_period as f64 + 1.0);
                prev + k * (bar.close - prev)
            }
            None => bar.close,
        };
        self.ema = Some(ema);
        self.last_close = Some(bar.close);
        self.last_open_time = Some(bar.open_time);
        true
    }

    pub fn ema(&self) -> Option<f64> {
        self.ema
    }

    /// Direction of the last closed HTF bar relative to the HTF EMA, with a
    /// +-0.5 x ATR dead band (ATR from the primary series).
    pub fn direction(&self, primary_atr: f64) -> HtfDirection {
        let (Some(ema), Some(close)) = (self.ema, self.last_close) else {
            return HtfDirection::Flat;
        };
        if primary_atr <= 0.0 {
            return HtfDirection::Flat;
        }
        let band = primary_atr * 0.5;
        if close > ema + band {
            HtfDirection::Up
        } else if close < ema - band {
            HtfDirection::Down
        } else {
            HtfDirection::Flat
        }
    }
}
