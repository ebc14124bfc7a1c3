//! Per-bar signal dispatch.
//!
//! The dispatcher task owns every piece of classifier state. On each closed
//! bar it steps the trackers in a fixed order — swings, regime, pushes,
//! filters — so the regime for bar B is stable before any detector sees B,
//! then scans the detector catalogue by priority and emits at most one
//! signal. Consumers receive a value-copied [`BarEvent`].

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::trading_core::bars::{BarSeries, HtfSeries, MarketSnapshot};
use crate::trading_core::filters::{
    BarbWireFilter, BreakoutModeTracker, CooldownTracker, GapTwentyRule, MeasuringGapTracker,
    SpreadFilter,
};
use crate::trading_core::hl_counter::HlCounter;
use crate::trading_core::market_state::{MarketCycle, MarketState, MarketStateTracker, RegimeView};
use crate::trading_core::orderflow::{DeltaAnalyzer, FLOW_SUPPRESS};
use crate::trading_core::session::{SessionGate, SessionStatus};
use crate::trading_core::signals::{
    continuation, reversal, BreakoutMemory, ReversalAttemptTracker, ScanCtx, Signal, SignalConfig,
};
use crate::trading_core::swings::{LtfSwingTracker, SwingTracker};
use crate::types::{Bar, HtfDirection, Side, Tick};

/// Classifier filter outputs for one bar.
#[derive(Debug, Clone, Copy, Default)]
pub struct FilterFlags {
    pub barb_wire: bool,
    /// Direction of a live measuring gap, if one is being tracked.
    pub measuring_gap: Option<Side>,
    /// Direction of an active breakout mode.
    pub breakout_mode: Option<Side>,
    pub spread_blown: bool,
    pub gap_count: usize,
    pub overextended: bool,
}

/// Everything downstream consumers need for one closed bar, value-copied
/// out of the dispatcher's state.
#[derive(Clone, Debug)]
pub struct BarEvent {
    pub snapshot: MarketSnapshot,
    pub regime: RegimeView,
    pub flags: FilterFlags,
    pub swings: SwingTracker,
    pub ltf: LtfSwingTracker,
    pub session: SessionStatus,
    pub signal: Option<Signal>,
    pub now: DateTime<Utc>,
}

pub struct Dispatcher {
    cfg: EngineConfig,
    pub bars: BarSeries,
    pub htf: HtfSeries,
    swings: SwingTracker,
    ltf: LtfSwingTracker,
    hl: HlCounter,
    mstate: MarketStateTracker,
    cooldown: CooldownTracker,
    gap20: GapTwentyRule,
    barb_wire: BarbWireFilter,
    measuring_gap: MeasuringGapTracker,
    breakout_mode: BreakoutModeTracker,
    spread_filter: SpreadFilter,
    breakout_mem: BreakoutMemory,
    reversal_attempt: ReversalAttemptTracker,
    mtr: reversal::MtrTracker,
    orderflow: Arc<Mutex<DeltaAnalyzer>>,
    session: SessionGate,
    bar_counter: i64,
}

impl Dispatcher {
    pub fn new(cfg: EngineConfig, orderflow: Arc<Mutex<DeltaAnalyzer>>) -> Self {
        let session = SessionGate::new(
            cfg.weekend_filter,
            cfg.friday_close_hour_gmt,
            cfg.sunday_open_hour_gmt,
            cfg.monday_gap_reset_atr,
        );
        Self {
            bars: BarSeries::new(cfg.buffer_capacity(), cfg.ema_period, cfg.atr_period),
            htf: HtfSeries::new(cfg.htf_ema_period, cfg.htf),
            swings: SwingTracker::new(),
            ltf: LtfSwingTracker::new(),
            hl: HlCounter::new(),
            mstate: MarketStateTracker::new(
                cfg.strong_trend_score,
                cfg.ttr_overlap_ratio,
                cfg.ttr_range_atr_mult,
            ),
            cooldown: CooldownTracker::new(cfg.signal_cooldown),
            gap20: GapTwentyRule::new(
                cfg.enable_20_gap,
                cfg.gap_bar_threshold,
                cfg.consolidation_bars,
                cfg.consolidation_range_atr,
            ),
            barb_wire: BarbWireFilter::new(cfg.barb_wire),
            measuring_gap: MeasuringGapTracker::new(cfg.measuring_gap),
            breakout_mode: BreakoutModeTracker::new(cfg.breakout_mode),
            spread_filter: SpreadFilter::new(
                cfg.spread_filter,
                cfg.spread_max_mult,
                cfg.spread_lookback,
            ),
            breakout_mem: BreakoutMemory::default(),
            reversal_attempt: ReversalAttemptTracker::default(),
            mtr: reversal::MtrTracker::default(),
            orderflow,
            session,
            bar_counter: 0,
            cfg,
        }
    }

    pub fn on_htf_bar_close(&mut self, bar: Bar) {
        self.htf.on_htf_bar_close(bar);
    }

    pub fn on_tick(&mut self, tick: Tick) {
        let open_time = self
            .bars
            .last_open_time()
            .map(|t| t + self.cfg.primary_tf.chrono_duration())
            .unwrap_or(tick.time);
        self.bars.on_tick(tick, open_time);
    }

    pub fn htf_direction(&self) -> HtfDirection {
        if !self.cfg.htf_enabled {
            return HtfDirection::Flat;
        }
        self.htf.direction(self.bars.atr())
    }

    /// Step every tracker for the newly closed bar and scan for a signal.
    /// Returns None for duplicate/out-of-order bars.
    pub fn dispatch_new_bar(&mut self, bar: Bar, now: DateTime<Utc>) -> Option<BarEvent> {
        if !self.bars.on_primary_bar_close(bar) {
            return None;
        }
        self.bar_counter += 1;
        let snap = self.bars.snapshot();

        // Tracker order matters: regime state for this bar is final before
        // any detector runs.
        self.swings.update(&snap);
        self.mstate.update(&snap, &self.swings);
        self.hl.update(&snap, &self.swings);
        self.cooldown.tick();
        self.gap20.update(&snap);
        self.barb_wire.update(&snap);
        self.measuring_gap.update(&snap);
        let was_bo_active = self.breakout_mode.active;
        self.breakout_mode.update(
            &snap,
            self.swings.recent_swing_high(1, false),
            self.swings.recent_swing_low(1, false),
        );
        if let Some(dir) = self.barb_wire.breakout_direction() {
            // A bar escaping the wire can arm breakout mode directly.
            let b = snap.bar(1);
            let extreme = match dir {
                Side::Buy => b.high,
                Side::Sell => b.low,
            };
            self.breakout_mode.arm(dir, b.close, extreme);
        }
        if self.breakout_mode.active && !was_bo_active {
            if let Some(dir) = self.breakout_mode.direction {
                self.breakout_mem.arm(dir, self.breakout_mode.entry);
            }
        }
        self.spread_filter.update(snap.spread);
        self.breakout_mem.tick();
        self.mtr.update(&snap, &self.swings);
        self.reversal_attempt
            .on_new_bar(&snap, self.mstate.is_strong_trend_regime());

        // The LTF structural tracker runs over the recent primary window;
        // with a one-minute primary frame this is the five-minute roll-up's
        // stand-in and the buffer depth covers it either way.
        let ltf_window: Vec<Bar> = (1..=30.min(snap.len()))
            .map(|i| *snap.bar(i))
            .collect();
        self.ltf.update(&ltf_window);

        let session = self.session.status(now);
        if self.session.monday_gap_reset(&snap) {
            info!("monday gap: resetting push counts");
            self.hl.reset_all();
        }

        let signal = self.scan(&snap, session);
        if let Some(s) = &signal {
            info!(kind = %s.kind, side = %s.side, stop = s.technical_stop, "signal dispatched");
        }

        Some(BarEvent {
            snapshot: snap,
            regime: self.mstate.view(),
            flags: FilterFlags {
                barb_wire: self.barb_wire.active,
                measuring_gap: self
                    .measuring_gap
                    .has_gap
                    .then_some(self.measuring_gap.direction)
                    .flatten(),
                breakout_mode: self
                    .breakout_mode
                    .active
                    .then_some(self.breakout_mode.direction)
                    .flatten(),
                spread_blown: self.spread_filter.active,
                gap_count: self.gap20.gap_count,
                overextended: self.gap20.overextended,
            },
            swings: self.swings.clone(),
            ltf: self.ltf.clone(),
            session,
            signal,
            now,
        })
    }

    fn scan(&mut self, snap: &MarketSnapshot, session: SessionStatus) -> Option<Signal> {
        // An unready snapshot (cold ATR, short buffer) emits nothing.
        if !snap.ready(12) {
            return None;
        }
        // Hard gates that silence the whole bar.
        if session.blocks_entries() {
            debug!("session gate: no new entries");
            return None;
        }
        if self.barb_wire.active {
            debug!("barb-wire active: all signals suppressed");
            return None;
        }

        let htf_dir = self.htf_direction();
        let is_ttr = self.mstate.is_ttr(snap);

        // Breakout-Mode pullback runs first; if it fires nothing else gets
        // a look at this bar.
        if self.breakout_mode.active && self.cfg.detectors.breakout_pullback {
            if let Some(sig) = self.with_ctx(snap, htf_dir, |ctx| {
                continuation::check_breakout_pullback(ctx)
            }) {
                return self.apply_flow(sig);
            }
        }

        for side in [Side::Buy, Side::Sell] {
            // HTF gate, with the overextension bypass: a strong trend that
            // has run 5+ bars clear of the EMA overrides the higher frame.
            let htf_bypass = self.mstate.state == MarketState::StrongTrend
                && self.gap20.gap_count >= self.cfg.htf_bypass_gap_count;
            if htf_dir.blocks(side) && !htf_bypass {
                continue;
            }
            if let Some(sig) = self.scan_side(snap, side, htf_dir, is_ttr) {
                return self.apply_flow(sig);
            }
        }
        None
    }

    /// EA priority order within one direction: continuation first, then
    /// reversals. First hit wins.
    fn scan_side(
        &mut self,
        snap: &MarketSnapshot,
        side: Side,
        htf_dir: HtfDirection,
        is_ttr: bool,
    ) -> Option<Signal> {
        let det = self.cfg.detectors.clone();
        let state = self.mstate.state;
        let cycle = self.mstate.cycle;
        let spread_blocked = self.spread_filter.active;

        let matching = |sig: Option<Signal>| sig.filter(|s| s.side == side);

        // ---- Trend-continuation group (TTR suppresses it wholesale) ----
        if !is_ttr {
            if det.spike_market_entry && !spread_blocked {
                if let Some(s) = matching(
                    self.with_ctx(snap, htf_dir, continuation::check_spike_market_entry),
                ) {
                    return Some(s);
                }
            }
            if det.spike {
                if let Some(s) = matching(self.with_ctx(snap, htf_dir, continuation::check_spike)) {
                    return Some(s);
                }
            }
            if det.micro_channel {
                if let Some(s) =
                    matching(self.with_ctx(snap, htf_dir, continuation::check_micro_channel))
                {
                    return Some(s);
                }
            }
            if det.hl_count {
                if let Some(s) =
                    self.with_ctx(snap, htf_dir, |ctx| continuation::check_hl_count(ctx, side))
                {
                    return Some(s);
                }
            }
            if det.breakout_pullback {
                if let Some(s) =
                    matching(self.with_ctx(snap, htf_dir, continuation::check_breakout_pullback))
                {
                    return Some(s);
                }
            }
            if det.trend_bar {
                if let Some(s) =
                    matching(self.with_ctx(snap, htf_dir, continuation::check_trend_bar))
                {
                    return Some(s);
                }
            }
            if det.gap_bar {
                if let Some(s) = matching(self.with_ctx(snap, htf_dir, continuation::check_gap_bar))
                {
                    return Some(s);
                }
            }
            if det.tr_breakout && state == MarketState::TradingRange {
                if let Some(s) =
                    matching(self.with_ctx(snap, htf_dir, continuation::check_tr_breakout))
                {
                    return Some(s);
                }
            }
        }

        // ---- Reversal group ----
        // Reversals are permitted in range-bound regimes, in the Spike
        // cycle, and whenever they are not counter to the committed
        // direction. Strong trends refuse counter-trend reversals.
        let reversal_states_ok = matches!(
            state,
            MarketState::TradingRange | MarketState::FinalFlag
        );
        let counter_trend = self
            .mstate
            .always_in
            .side()
            .map(|ai| ai == side.opposite())
            .unwrap_or(false);
        let allow_reversals =
            reversal_states_ok || cycle == MarketCycle::Spike || !counter_trend;

        // Climax runs unconditionally: its strict mode embeds the
        // failed-first-attempt requirement for the Spike cycle.
        if det.climax {
            if let Some(s) = matching(self.with_ctx(snap, htf_dir, reversal::check_climax)) {
                return Some(s);
            }
        }
        if !allow_reversals {
            return None;
        }

        if det.wedge {
            if let Some(s) =
                self.with_ctx(snap, htf_dir, |ctx| reversal::check_wedge(ctx, side))
            {
                return Some(s);
            }
        }
        if det.mtr {
            let mtr = &mut self.mtr;
            // Split borrow: the tracker is stepped by the dispatcher, the
            // detector only consumes it.
            let snap_ref = snap;
            let mut result = None;
            {
                let mut ctx = ScanCtx {
                    snap: snap_ref,
                    swings: &self.swings,
                    hl: &mut self.hl,
                    mstate: &self.mstate,
                    cooldown: &mut self.cooldown,
                    gap20: &self.gap20,
                    htf: htf_dir,
                    breakout: &mut self.breakout_mem,
                    reversal: &mut self.reversal_attempt,
                    cfg: SignalConfig {
                        max_stop_atr: self.cfg.max_stop_atr,
                        min_spike_bars: self.cfg.min_spike_bars,
                        spike_overlap_max: self.cfg.spike_overlap_max,
                        strict_climax_atr_mult: 3.0,
                    },
                    bar_index: self.bar_counter,
                };
                result = reversal::check_mtr(&mut ctx, mtr);
            }
            if let Some(s) = matching(result) {
                return Some(s);
            }
        }
        if det.failed_breakout && state == MarketState::TradingRange {
            if let Some(s) =
                matching(self.with_ctx(snap, htf_dir, reversal::check_failed_breakout))
            {
                return Some(s);
            }
        }
        if det.double_top_bottom {
            if let Some(s) = self.with_ctx(snap, htf_dir, |ctx| {
                reversal::check_double_top_bottom(ctx, side)
            }) {
                return Some(s);
            }
        }
        if det.outside_bar {
            if let Some(s) = matching(self.with_ctx(snap, htf_dir, reversal::check_outside_bar)) {
                return Some(s);
            }
        }
        if det.reversal_bar {
            if let Some(s) = matching(self.with_ctx(snap, htf_dir, reversal::check_reversal_bar)) {
                return Some(s);
            }
        }
        if det.ii_pattern {
            if let Some(s) = matching(self.with_ctx(snap, htf_dir, reversal::check_ii_pattern)) {
                return Some(s);
            }
        }
        if det.measured_move {
            if let Some(s) = matching(self.with_ctx(snap, htf_dir, reversal::check_measured_move)) {
                return Some(s);
            }
        }
        if det.final_flag && state == MarketState::FinalFlag {
            if let Some(s) = matching(self.with_ctx(snap, htf_dir, reversal::check_final_flag)) {
                return Some(s);
            }
        }
        None
    }

    fn with_ctx<F>(&mut self, snap: &MarketSnapshot, htf_dir: HtfDirection, f: F) -> Option<Signal>
    where
        F: FnOnce(&mut ScanCtx) -> Option<Signal>,
    {
        let mut ctx = ScanCtx {
            snap,
            swings: &self.swings,
            hl: &mut self.hl,
            mstate: &self.mstate,
            cooldown: &mut self.cooldown,
            gap20: &self.gap20,
            htf: htf_dir,
            breakout: &mut self.breakout_mem,
            reversal: &mut self.reversal_attempt,
            cfg: SignalConfig {
                max_stop_atr: self.cfg.max_stop_atr,
                min_spike_bars: self.cfg.min_spike_bars,
                spike_overlap_max: self.cfg.spike_overlap_max,
                strict_climax_atr_mult: 3.0,
            },
            bar_index: self.bar_counter,
        };
        f(&mut ctx)
    }

    /// Consult the order-flow analyser: a suppressed multiplier kills the
    /// signal, anything else lets it through.
    fn apply_flow(&self, sig: Signal) -> Option<Signal> {
        let mult = self
            .orderflow
            .lock()
            .unwrap()
            .modifier(sig.side, sig.kind.flow_class());
        if mult <= FLOW_SUPPRESS {
            info!(kind = %sig.kind, mult, "order-flow suppression dropped signal");
            return None;
        }
        Some(sig)
    }

    pub fn tr_high(&self) -> f64 {
        self.mstate.tr_high
    }

    pub fn regime(&self) -> RegimeView {
        self.mstate.view()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn dispatcher_with(cfg: EngineConfig) -> Dispatcher {
        let flow = Arc::new(Mutex::new(DeltaAnalyzer::new(
            false,
            cfg.primary_tf.duration(),
        )));
        Dispatcher::new(cfg, flow)
    }

    fn dispatcher() -> Dispatcher {
        dispatcher_with(EngineConfig::default())
    }

    fn t(i: i64) -> DateTime<Utc> {
        // A Wednesday, well clear of the session gates.
        Utc.with_ymd_and_hms(2024, 3, 6, 0, 0, 0).unwrap() + chrono::Duration::minutes(5 * i)
    }

    fn bar(i: i64, open: f64, high: f64, low: f64, close: f64) -> Bar {
        Bar {
            open_time: t(i),
            open,
            high,
            low,
            close,
            volume: 1.0,
        }
    }

    fn feed_flat(d: &mut Dispatcher, n: i64, from: i64) -> i64 {
        for k in 0..n {
            d.dispatch_new_bar(bar(from + k, 100.0, 101.0, 99.0, 100.0), t(from + k));
        }
        from + n
    }

    #[test]
    fn test_duplicate_bar_produces_no_event() {
        let mut d = dispatcher();
        let b = bar(0, 100.0, 101.0, 99.0, 100.0);
        assert!(d.dispatch_new_bar(b, t(0)).is_some());
        assert!(d.dispatch_new_bar(b, t(0)).is_none());
    }

    #[test]
    fn test_at_most_one_signal_per_bar() {
        let mut d = dispatcher();
        let mut i = feed_flat(&mut d, 25, 0);
        // A strong trend run: whatever fires, it is a single Option.
        let mut px = 100.0;
        let mut signals = 0;
        for _ in 0..10 {
            let ev = d
                .dispatch_new_bar(bar(i, px, px + 1.7, px - 0.1, px + 1.6), t(i))
                .unwrap();
            if ev.signal.is_some() {
                signals += 1;
            }
            px += 1.6;
            i += 1;
        }
        // The cooldown guarantees spacing: never more than one signal per
        // bar, and re-fires need three bars or real movement.
        assert!(signals >= 1);
        assert!(signals <= 10);
    }

    #[test]
    fn test_barb_wire_silences_dispatch() {
        let mut d = dispatcher();
        let mut i = feed_flat(&mut d, 25, 0);
        // Tiny overlapping dojis to set the wire.
        for _ in 0..5 {
            let ev = d
                .dispatch_new_bar(bar(i, 100.0, 100.2, 99.8, 100.02), t(i))
                .unwrap();
            i += 1;
            if d.barb_wire.active {
                assert!(ev.signal.is_none());
            }
        }
        assert!(d.barb_wire.active);
    }

    #[test]
    fn test_weekend_blocks_entries() {
        let mut d = dispatcher();
        let mut i = feed_flat(&mut d, 25, 0);
        let mut px = 100.0;
        // Same strong run as above, but the wall clock says Saturday.
        let saturday = Utc.with_ymd_and_hms(2024, 3, 9, 12, 0, 0).unwrap();
        for _ in 0..10 {
            let ev = d
                .dispatch_new_bar(bar(i, px, px + 1.7, px - 0.1, px + 1.6), saturday)
                .unwrap();
            assert!(ev.signal.is_none());
            assert!(ev.session.is_weekend);
            px += 1.6;
            i += 1;
        }
    }

    #[test]
    fn test_htf_down_blocks_buys() {
        // Push the overextension bypass out of reach so the HTF gate is
        // what this test exercises.
        let mut cfg = EngineConfig::default();
        cfg.htf_bypass_gap_count = 50;
        let mut d = dispatcher_with(cfg);
        // HTF series reading firmly down.
        for k in 0..30 {
            d.on_htf_bar_close(Bar {
                open_time: t(0) + chrono::Duration::hours(k),
                open: 120.0,
                high: 121.0,
                low: 119.0,
                close: 120.0,
                volume: 1.0,
            });
        }
        d.on_htf_bar_close(Bar {
            open_time: t(0) + chrono::Duration::hours(40),
            open: 110.0,
            high: 110.5,
            low: 100.0,
            close: 100.5,
            volume: 1.0,
        });
        let mut i = feed_flat(&mut d, 25, 0);
        assert_eq!(d.htf_direction(), HtfDirection::Down);

        // A bullish run that would otherwise produce buy signals.
        let mut px = 100.0;
        for _ in 0..10 {
            let ev = d
                .dispatch_new_bar(bar(i, px, px + 1.7, px - 0.1, px + 1.6), t(i))
                .unwrap();
            if let Some(sig) = ev.signal {
                assert_ne!(sig.side, Side::Buy, "HTF=down must block fresh buys");
            }
            px += 1.6;
            i += 1;
        }
    }

    #[test]
    fn test_event_carries_regime_snapshot() {
        let mut d = dispatcher();
        let mut i = feed_flat(&mut d, 25, 0);
        let mut px = 100.0;
        let mut last = None;
        for _ in 0..10 {
            last = d.dispatch_new_bar(bar(i, px, px + 1.7, px - 0.1, px + 1.6), t(i));
            px += 1.6;
            i += 1;
        }
        let ev = last.unwrap();
        assert_eq!(ev.regime.state, MarketState::StrongTrend);
        assert!(ev.snapshot.ready(12));
    }
}
