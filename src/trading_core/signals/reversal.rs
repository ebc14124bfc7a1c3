//! Reversal detectors: Climax, Wedge three-push, MTR, Failed-Breakout,
//! Double-Top/Bottom, Outside-Bar, Reversal-Bar, ii-pattern, Measured-Move
//! and Final-Flag.

use crate::trading_core::market_state::{MarketCycle, MarketState};
use crate::trading_core::risk;
use crate::types::Side;

use super::{ScanCtx, Signal, SignalKind};

/// Retest tolerance for the MTR trendline, in ATR units. Deliberately
/// tight; widening it on very liquid symbols changes the pattern's meaning.
const MTR_RETEST_ATR: f64 = 0.2;
/// Wedge third-push proximity, in ATR units.
const WEDGE_NEAR_ATR: f64 = 0.2;

/// Climax exhaustion reversal.
///
/// The *previous* bar is the climax (range beyond the multiple of ATR in
/// trend direction); the current bar reverses beyond its close with an
/// acceptable rejection tail and a deep-enough prior move. In the strict
/// Spike-cycle mode the first attempt is only recorded — Brooks: the first
/// reversal usually fails — and the signal fires once a recorded attempt
/// has failed.
pub fn check_climax(ctx: &mut ScanCtx) -> Option<Signal> {
    let snap = ctx.snap;
    if !snap.ready(12) {
        return None;
    }
    let atr = snap.atr;
    let strict = ctx.mstate.cycle == MarketCycle::Spike;
    let mult = if strict {
        ctx.cfg.strict_climax_atr_mult
    } else {
        2.5
    };
    let min_prior = if strict { atr * 4.0 } else { atr * 2.0 };

    let climax = snap.bar(2);
    let rev = snap.bar(1);
    if rev.range() <= 0.0 || climax.body() <= 0.0 {
        return None;
    }

    // Up-climax -> sell reversal.
    if climax.range() > atr * mult && climax.is_bull() && rev.is_bear() && rev.close < climax.close
    {
        let tail_ok = rev.lower_tail() / rev.range() <= 0.25;
        let mut lb_low = snap.low(3);
        for i in 3..=10.min(snap.len()) {
            lb_low = lb_low.min(snap.low(i));
        }
        let prior_move = climax.high - lb_low;
        if tail_ok && prior_move >= min_prior && ctx.cooldown.allows(Side::Sell, rev.close, snap) {
            if strict && !ctx.reversal.failed_attempt(Side::Sell) {
                ctx.reversal
                    .record(rev.open_time, Side::Sell, rev.high, rev.low);
                return None;
            }
            let sl = risk::brooks_stop(
                Side::Sell,
                rev.close,
                snap,
                ctx.swings,
                snap.spread,
                ctx.cfg.max_stop_atr,
                ctx.mstate.is_strong_trend_regime(),
                true,
            )?;
            return Some(ctx.emit(SignalKind::ClimaxSell, sl, climax.range()));
        }
    }

    // Down-climax -> buy reversal.
    if climax.range() > atr * mult && climax.is_bear() && rev.is_bull() && rev.close > climax.close
    {
        let tail_ok = rev.upper_tail() / rev.range() <= 0.25;
        let mut lb_high = snap.high(3);
        for i in 3..=10.min(snap.len()) {
            lb_high = lb_high.max(snap.high(i));
        }
        let prior_move = lb_high - climax.low;
        if tail_ok && prior_move >= min_prior && ctx.cooldown.allows(Side::Buy, rev.close, snap) {
            if strict && !ctx.reversal.failed_attempt(Side::Buy) {
                ctx.reversal
                    .record(rev.open_time, Side::Buy, rev.high, rev.low);
                return None;
            }
            let sl = risk::brooks_stop(
                Side::Buy,
                rev.close,
                snap,
                ctx.swings,
                snap.spread,
                ctx.cfg.max_stop_atr,
                ctx.mstate.is_strong_trend_regime(),
                true,
            )?;
            return Some(ctx.emit(SignalKind::ClimaxBuy, sl, climax.range()));
        }
    }
    None
}

/// Wedge three-push reversal: three strictly lower lows (buy) or higher
/// highs (sell), qualifying retracements between them, declining impulse
/// bodies, fired when the current bar sits at the third extremum and closes
/// in the break direction.
pub fn check_wedge(ctx: &mut ScanCtx, side: Side) -> Option<Signal> {
    let snap = ctx.snap;
    if !snap.ready(10) {
        return None;
    }
    let atr = snap.atr;
    let lookback = 40.min(snap.len().saturating_sub(3));

    // Local extrema, newest first. ext[0] is the third (most recent) push.
    let mut ext: Vec<f64> = Vec::new();
    let mut ext_bars: Vec<usize> = Vec::new();

    for i in 3..=lookback {
        if i + 2 > snap.len() {
            break;
        }
        let centre = match side {
            Side::Buy => snap.low(i),
            Side::Sell => snap.high(i),
        };
        let is_local = match side {
            Side::Buy => {
                snap.low(i - 1) > centre
                    && snap.low(i - 2) > centre
                    && snap.low(i + 1) > centre
                    && snap.low(i + 2) > centre
            }
            Side::Sell => {
                snap.high(i - 1) < centre
                    && snap.high(i - 2) < centre
                    && snap.high(i + 1) < centre
                    && snap.high(i + 2) < centre
            }
        };
        if !is_local {
            continue;
        }
        // Going back in time, each older push sits on the other side of the
        // newer one: lower lows toward the present for buys.
        let in_sequence = match (ext.last(), side) {
            (None, _) => true,
            (Some(&newer), Side::Buy) => centre > newer,
            (Some(&newer), Side::Sell) => centre < newer,
        };
        if !in_sequence {
            continue;
        }
        // Retracement between this push and the newer one must be real.
        if let Some(&newer_bar) = ext_bars.last() {
            let mut opposite = centre;
            for j in newer_bar..i {
                match side {
                    Side::Buy => opposite = opposite.max(snap.high(j)),
                    Side::Sell => opposite = opposite.min(snap.low(j)),
                }
            }
            let newer_ext = *ext.last().unwrap();
            let retrace = match side {
                Side::Buy => opposite - newer_ext,
                Side::Sell => newer_ext - opposite,
            };
            if retrace < atr * 0.3 {
                continue;
            }
        }
        ext.push(centre);
        ext_bars.push(i);
        if ext.len() >= 3 {
            break;
        }
    }

    if ext.len() < 3 {
        return None;
    }

    // Declining impulse over time: the strongest directional body in the
    // leg arriving at each push must shrink from the oldest push to the
    // newest.
    let impulse_body = |from: usize, to: usize| -> f64 {
        let mut max_body = 0.0f64;
        for j in from..=to.min(snap.len()) {
            let b = snap.bar(j);
            let body = match side {
                Side::Buy => b.open - b.close,
                Side::Sell => b.close - b.open,
            };
            max_body = max_body.max(body);
        }
        max_body
    };
    let push1 = impulse_body(ext_bars[2], ext_bars[2] + 5);
    let push2 = impulse_body(ext_bars[1], ext_bars[2]);
    let push3 = impulse_body(ext_bars[0], ext_bars[1]);
    if !(push1 > push2 && push2 > push3) {
        return None;
    }

    let third = ext[0];
    let b = snap.bar(1);
    if b.range() <= 0.0 {
        return None;
    }
    let current_ext = match side {
        Side::Buy => b.low,
        Side::Sell => b.high,
    };
    if (current_ext - third).abs() > atr * WEDGE_NEAR_ATR {
        return None;
    }
    let breaks = match side {
        Side::Buy => b.is_bull() && b.close_position() >= 0.50,
        Side::Sell => b.is_bear() && b.close_position() <= 0.50,
    };
    if !breaks || !ctx.cooldown.allows(side, b.close, snap) {
        return None;
    }

    let sl = third - side.sign() * atr * 0.5;
    if !ctx.within_budget(side, b.close, sl) {
        return None;
    }
    let height = (ext[2] - ext[0]).abs();
    Some(ctx.emit(
        match side {
            Side::Buy => SignalKind::WedgeBuy,
            Side::Sell => SignalKind::WedgeSell,
        },
        sl,
        height,
    ))
}

/// State carried across bars for the Major-Trend-Reversal detector: a
/// trendline through the last two swings, its break, and the failed retest.
#[derive(Debug, Default, Clone, Copy)]
struct BrokenLine {
    level: f64,
    retested: bool,
    age_bars: usize,
}

#[derive(Debug, Default)]
pub struct MtrTracker {
    /// Broken rising support line (sets up MTR sells).
    up_line: Option<BrokenLine>,
    /// Broken falling resistance line (sets up MTR buys).
    down_line: Option<BrokenLine>,
}

impl MtrTracker {
    const MAX_AGE_BARS: usize = 20;

    pub fn update(
        &mut self,
        snap: &crate::trading_core::bars::MarketSnapshot,
        swings: &crate::trading_core::swings::SwingTracker,
    ) {
        if snap.atr <= 0.0 || snap.is_empty() {
            return;
        }
        let atr = snap.atr;
        let b = snap.bar(1);

        for line in [&mut self.up_line, &mut self.down_line].into_iter().flatten() {
            line.age_bars += 1;
        }
        if self.up_line.map(|l| l.age_bars > Self::MAX_AGE_BARS).unwrap_or(false) {
            self.up_line = None;
        }
        if self.down_line.map(|l| l.age_bars > Self::MAX_AGE_BARS).unwrap_or(false) {
            self.down_line = None;
        }

        // Rising support through the last two swing lows.
        if self.up_line.is_none() {
            if let Some(level) = extrapolate_line(swings, false) {
                if b.close < level - atr * 0.1 {
                    self.up_line = Some(BrokenLine {
                        level,
                        retested: false,
                        age_bars: 0,
                    });
                }
            }
        } else if let Some(line) = self.up_line.as_mut() {
            if !line.retested {
                let touched = b.high >= line.level - atr * MTR_RETEST_ATR;
                let rejected = b.close < line.level && b.upper_tail() > b.range() * 0.3;
                if touched && rejected {
                    line.retested = true;
                }
            }
        }

        // Falling resistance through the last two swing highs.
        if self.down_line.is_none() {
            if let Some(level) = extrapolate_line(swings, true) {
                if b.close > level + atr * 0.1 {
                    self.down_line = Some(BrokenLine {
                        level,
                        retested: false,
                        age_bars: 0,
                    });
                }
            }
        } else if let Some(line) = self.down_line.as_mut() {
            if !line.retested {
                let touched = b.low <= line.level + atr * MTR_RETEST_ATR;
                let rejected = b.close > line.level && b.lower_tail() > b.range() * 0.3;
                if touched && rejected {
                    line.retested = true;
                }
            }
        }
    }

    fn armed_sell(&self) -> bool {
        self.up_line.map(|l| l.retested).unwrap_or(false)
    }

    fn armed_buy(&self) -> bool {
        self.down_line.map(|l| l.retested).unwrap_or(false)
    }

    fn consume_sell(&mut self) {
        self.up_line = None;
    }

    fn consume_buy(&mut self) {
        self.down_line = None;
    }
}

/// Project the line through the two most recent swing lows (`highs` =
/// false) or highs onto the current bar. Requires the line to slope with
/// the trend it guards (rising support, falling resistance).
fn extrapolate_line(
    swings: &crate::trading_core::swings::SwingTracker,
    highs: bool,
) -> Option<f64> {
    let pts: Vec<_> = swings
        .swings()
        .iter()
        .filter(|s| s.is_high == highs)
        .take(2)
        .collect();
    if pts.len() < 2 {
        return None;
    }
    let (newer, older) = (pts[0], pts[1]);
    if older.bar_index <= newer.bar_index {
        return None;
    }
    let slope = (newer.price - older.price) / (older.bar_index - newer.bar_index) as f64;
    if highs && slope >= 0.0 {
        return None;
    }
    if !highs && slope <= 0.0 {
        return None;
    }
    Some(newer.price + slope * (newer.bar_index as f64 - 1.0))
}

/// Major trend reversal: broken trendline, failed retest, structural
/// lower-high (sell) or higher-low (buy), and a confirming bar closing in
/// the outer half.
pub fn check_mtr(ctx: &mut ScanCtx, mtr: &mut MtrTracker) -> Option<Signal> {
    let snap = ctx.snap;
    if !snap.ready(8) {
        return None;
    }
    let atr = snap.atr;
    let b = snap.bar(1);
    if b.range() <= 0.0 {
        return None;
    }

    if mtr.armed_sell() {
        let sh1 = ctx.swings.recent_swing_high(1, false);
        let sh2 = ctx.swings.recent_swing_high(2, false);
        let lower_high = sh1 > 0.0 && sh2 > 0.0 && sh1 < sh2;
        if lower_high
            && b.is_bear()
            && b.close_position() <= 0.5
            && ctx.validate_and_cool(Side::Sell)
        {
            let sl = sh1 + atr * 0.5;
            if ctx.within_budget(Side::Sell, b.close, sl) {
                mtr.consume_sell();
                return Some(ctx.emit(SignalKind::MtrSell, sl, atr * 2.0));
            }
        }
    }
    if mtr.armed_buy() {
        let sl1 = ctx.swings.recent_swing_low(1, false);
        let sl2 = ctx.swings.recent_swing_low(2, false);
        let higher_low = sl1 > 0.0 && sl2 > 0.0 && sl1 > sl2;
        if higher_low && b.is_bull() && b.close_position() >= 0.5 && ctx.validate_and_cool(Side::Buy)
        {
            let sl = sl1 - atr * 0.5;
            if ctx.within_budget(Side::Buy, b.close, sl) {
                mtr.consume_buy();
                return Some(ctx.emit(SignalKind::MtrBuy, sl, atr * 2.0));
            }
        }
    }
    None
}

/// Failed breakout of the trading range: the bar pokes beyond a boundary
/// and closes back inside on the same bar.
pub fn check_failed_breakout(ctx: &mut ScanCtx) -> Option<Signal> {
    let snap = ctx.snap;
    if !snap.ready(2) {
        return None;
    }
    let (tr_high, tr_low) = (ctx.mstate.tr_high, ctx.mstate.tr_low);
    if tr_high <= 0.0 || tr_low <= 0.0 {
        return None;
    }
    let atr = snap.atr;
    let tr_range = tr_high - tr_low;
    if tr_range < atr * 1.0 {
        return None;
    }
    let b = snap.bar(1);
    if b.range() <= 0.0 {
        return None;
    }

    // Poke above, close back inside -> sell.
    if b.high > tr_high && b.close < tr_high && b.is_bear() {
        let cp = (b.high - b.close) / b.range();
        if cp >= 0.60 && ctx.cooldown.allows(Side::Sell, b.close, snap) {
            let sl = b.high + atr * 0.3;
            if !ctx.within_budget(Side::Sell, b.close, sl) {
                return None;
            }
            return Some(ctx.emit(SignalKind::FailedBreakoutSell, sl, tr_range));
        }
    }
    // Poke below, close back inside -> buy.
    if b.low < tr_low && b.close > tr_low && b.is_bull() {
        let cp = (b.close - b.low) / b.range();
        if cp >= 0.60 && ctx.cooldown.allows(Side::Buy, b.close, snap) {
            let sl = b.low - atr * 0.3;
            if !ctx.within_budget(Side::Buy, b.close, sl) {
                return None;
            }
            return Some(ctx.emit(SignalKind::FailedBreakoutBuy, sl, tr_range));
        }
    }
    None
}

/// Double top (sell) / double bottom (buy): the two most recent swing
/// extremes and the current bar's extreme all within 0.3 x ATR.
pub fn check_double_top_bottom(ctx: &mut ScanCtx, side: Side) -> Option<Signal> {
    let snap = ctx.snap;
    if !snap.ready(4) || ctx.swings.swings().len() < 4 {
        return None;
    }
    let atr = snap.atr;
    let (lv1, lv2) = match side {
        Side::Buy => (
            ctx.swings.recent_swing_low(1, false),
            ctx.swings.recent_swing_low(2, false),
        ),
        Side::Sell => (
            ctx.swings.recent_swing_high(1, false),
            ctx.swings.recent_swing_high(2, false),
        ),
    };
    if lv1 <= 0.0 || lv2 <= 0.0 {
        return None;
    }
    let b = snap.bar(1);
    if b.range() <= 0.0 {
        return None;
    }
    let tol = atr * 0.3;
    if (lv1 - lv2).abs() > tol {
        return None;
    }
    let (level_ok, bar_dir, cp) = match side {
        Side::Buy => (b.low <= lv1 + tol, b.is_bull(), b.close_position()),
        Side::Sell => (b.high >= lv1 - tol, b.is_bear(), 1.0 - b.close_position()),
    };
    if !level_ok || !bar_dir || cp < 0.55 || b.body_ratio() < 0.4 {
        return None;
    }
    if !ctx.cooldown.allows(side, b.close, snap) {
        return None;
    }
    let sl = match side {
        Side::Buy => lv1.min(lv2) - atr * 0.3,
        Side::Sell => lv1.max(lv2) + atr * 0.3,
    };
    if !ctx.within_budget(side, b.close, sl) {
        return None;
    }
    Some(ctx.emit(
        match side {
            Side::Buy => SignalKind::DoubleBottomBuy,
            Side::Sell => SignalKind::DoubleTopSell,
        },
        sl,
        atr * 2.0,
    ))
}

/// Outside-bar reversal: the bar engulfs its predecessor after a stretch
/// of one-way movement and closes against it.
pub fn check_outside_bar(ctx: &mut ScanCtx) -> Option<Signal> {
    let snap = ctx.snap;
    if !snap.ready(3) {
        return None;
    }
    let atr = snap.atr;
    let b = snap.bar(1);
    if b.range() <= 0.0 {
        return None;
    }
    if !(b.high > snap.high(2) && b.low < snap.low(2)) {
        return None;
    }
    if b.body_ratio() < 0.40 {
        return None;
    }
    let mut lb_low = b.low;
    let mut lb_high = b.high;
    for i in 2..=8.min(snap.len()) {
        lb_low = lb_low.min(snap.low(i));
        lb_high = lb_high.max(snap.high(i));
    }

    if b.is_bull() {
        let drop = b.high - lb_low;
        if drop >= atr * 1.0 && ctx.cooldown.allows(Side::Buy, b.close, snap) {
            let sl = b.low - atr * 0.3;
            if !ctx.within_budget(Side::Buy, b.close, sl) {
                return None;
            }
            return Some(ctx.emit(SignalKind::OutsideBarBuy, sl, b.range()));
        }
    }
    if b.is_bear() {
        let rise = lb_high - b.low;
        if rise >= atr * 1.0 && ctx.cooldown.allows(Side::Sell, b.close, snap) {
            let sl = b.high + atr * 0.3;
            if !ctx.within_budget(Side::Sell, b.close, sl) {
                return None;
            }
            return Some(ctx.emit(SignalKind::OutsideBarSell, sl, b.range()));
        }
    }
    None
}

/// Reversal bar: a long rejection tail against a preceding extended move.
pub fn check_reversal_bar(ctx: &mut ScanCtx) -> Option<Signal> {
    let snap = ctx.snap;
    if !snap.ready(11) {
        return None;
    }
    let atr = snap.atr;
    let b = snap.bar(1);
    let rng = b.range();
    if rng <= 0.0 || rng < atr * 0.5 {
        return None;
    }
    let mut lb_low = b.low;
    let mut lb_high = b.high;
    for i in 2..=10.min(snap.len()) {
        lb_low = lb_low.min(snap.low(i));
        lb_high = lb_high.max(snap.high(i));
    }

    if b.lower_tail() > rng * 0.4 && b.is_bull() && b.lower_tail() > b.body() {
        let drop = lb_high - b.low;
        if drop >= atr * 1.5 && ctx.cooldown.allows(Side::Buy, b.close, snap) {
            let sl = b.low - atr * 0.3;
            if !ctx.within_budget(Side::Buy, b.close, sl) {
                return None;
            }
            return Some(ctx.emit(SignalKind::ReversalBarBuy, sl, rng));
        }
    }
    if b.upper_tail() > rng * 0.4 && b.is_bear() && b.upper_tail() > b.body() {
        let rise = b.high - lb_low;
        if rise >= atr * 1.5 && ctx.cooldown.allows(Side::Sell, b.close, snap) {
            let sl = b.high + atr * 0.3;
            if !ctx.within_budget(Side::Sell, b.close, sl) {
                return None;
            }
            return Some(ctx.emit(SignalKind::ReversalBarSell, sl, rng));
        }
    }
    None
}

/// ii / iii inside pattern: two or more consecutive inside bars, entered on
/// the break of the cluster.
pub fn check_ii_pattern(ctx: &mut ScanCtx) -> Option<Signal> {
    let snap = ctx.snap;
    if !snap.ready(7) {
        return None;
    }
    let atr = snap.atr;

    let mut inside = 0usize;
    let mut p_high = snap.high(2);
    let mut p_low = snap.low(2);
    for i in 2..=4.min(snap.len() - 1) {
        if snap.high(i) <= snap.high(i + 1) && snap.low(i) >= snap.low(i + 1) {
            inside += 1;
            p_high = p_high.max(snap.high(i));
            p_low = p_low.min(snap.low(i));
        } else {
            break;
        }
    }
    if inside < 2 {
        return None;
    }

    let b = snap.bar(1);
    if b.high > p_high && b.is_bull() && ctx.cooldown.allows(Side::Buy, b.close, snap) {
        let sl = p_low - atr * 0.3;
        if !ctx.within_budget(Side::Buy, b.close, sl) {
            return None;
        }
        return Some(ctx.emit(SignalKind::IiBuy, sl, p_high - p_low));
    }
    if b.low < p_low && b.is_bear() && ctx.cooldown.allows(Side::Sell, b.close, snap) {
        let sl = p_high + atr * 0.3;
        if !ctx.within_budget(Side::Sell, b.close, sl) {
            return None;
        }
        return Some(ctx.emit(SignalKind::IiSell, sl, p_high - p_low));
    }
    None
}

/// Measured-move exhaustion: the second leg of a two-legged move reaches
/// its projected target and the current bar rejects it.
pub fn check_measured_move(ctx: &mut ScanCtx) -> Option<Signal> {
    let snap = ctx.snap;
    if !snap.ready(4) || ctx.swings.swings().len() < 4 {
        return None;
    }
    let atr = snap.atr;
    let sh1 = ctx.swings.recent_swing_high(1, false);
    let sh2 = ctx.swings.recent_swing_high(2, false);
    let sl1 = ctx.swings.recent_swing_low(1, false);
    let sl2 = ctx.swings.recent_swing_low(2, false);
    if sh1 <= 0.0 || sh2 <= 0.0 || sl1 <= 0.0 || sl2 <= 0.0 {
        return None;
    }
    let tol = atr * 0.5;
    let b = snap.bar(1);

    // Rising structure: project the first leg up from the latest pullback
    // low; a rejection there sells the exhaustion.
    if sl2 < sl1 && sh2 < sh1 {
        let leg = sh2 - sl2;
        let target = sl1 + leg;
        if leg > 0.0
            && b.high >= target - tol
            && b.high <= target + tol
            && b.is_bear()
            && ctx.cooldown.allows(Side::Sell, b.close, snap)
        {
            let sl = b.high + atr * 0.3;
            if !ctx.within_budget(Side::Sell, b.close, sl) {
                return None;
            }
            return Some(ctx.emit(SignalKind::MeasuredMoveSell, sl, leg));
        }
    }
    // Falling structure: symmetric buy.
    if sh2 > sh1 && sl2 > sl1 {
        let leg = sh2 - sl2;
        let target = sh1 - leg;
        if leg > 0.0
            && b.low <= target + tol
            && b.low >= target - tol
            && b.is_bull()
            && ctx.cooldown.allows(Side::Buy, b.close, snap)
        {
            let sl = b.low - atr * 0.3;
            if !ctx.within_budget(Side::Buy, b.close, sl) {
                return None;
            }
            return Some(ctx.emit(SignalKind::MeasuredMoveBuy, sl, leg));
        }
    }
    None
}

/// Final-Flag reversal: only in the FinalFlag regime, a bar counter to the
/// prior tight-channel direction closing decisively.
pub fn check_final_flag(ctx: &mut ScanCtx) -> Option<Signal> {
    let snap = ctx.snap;
    if ctx.mstate.state != MarketState::FinalFlag || !snap.ready(2) {
        return None;
    }
    let atr = snap.atr;
    let b = snap.bar(1);
    if b.range() <= 0.0 {
        return None;
    }
    let tc_ext = ctx.mstate.tight_channel_extreme;

    match ctx.mstate.tight_channel_dir {
        Some(Side::Buy) if b.is_bear() => {
            let cp = (b.high - b.close) / b.range();
            if cp >= 0.60 && ctx.validate_and_cool(Side::Sell) {
                let mut sl = if tc_ext > 0.0 {
                    tc_ext + atr * 0.5
                } else {
                    b.high + atr * 0.5
                };
                if !ctx.within_budget(Side::Sell, b.close, sl) {
                    sl = b.high + atr * 0.5;
                }
                if !ctx.within_budget(Side::Sell, b.close, sl) {
                    return None;
                }
                return Some(ctx.emit(SignalKind::FinalFlagSell, sl, atr * 2.0));
            }
        }
        Some(Side::Sell) if b.is_bull() => {
            let cp = b.close_position();
            if cp >= 0.60 && ctx.validate_and_cool(Side::Buy) {
                let mut sl = if tc_ext > 0.0 {
                    tc_ext - atr * 0.5
                } else {
                    b.low - atr * 0.5
                };
                if !ctx.within_budget(Side::Buy, b.close, sl) {
                    sl = b.low - atr * 0.5;
                }
                if !ctx.within_budget(Side::Buy, b.close, sl) {
                    return None;
                }
                return Some(ctx.emit(SignalKind::FinalFlagBuy, sl, atr * 2.0));
            }
        }
        _ => {}
    }
    None
}
