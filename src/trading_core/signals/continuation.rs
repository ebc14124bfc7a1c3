//! Trend-continuation detectors: Spike, Micro-Channel, H/L count, Gap-Bar,
//! Trend-Bar, TR-Breakout, Breakout-Pullback, and the Spike-cycle
//! market-entry path.

use crate::trading_core::market_state::{AlwaysIn, MarketCycle, MarketState};
use crate::types::Side;

use super::{ScanCtx, Signal, SignalKind};

/// Count consecutive spike bars in `side`'s direction, starting from the
/// bar before the confirmation bar. A spike bar has a directional body over
/// half its range (or an extreme close on a real-range bar), and overlaps
/// the previous bar's midpoint by no more than the configured fraction.
fn count_spike_bars(ctx: &ScanCtx, side: Side) -> usize {
    let snap = ctx.snap;
    let n = snap.len();
    let atr = snap.atr;
    let mut count = 0usize;
    let max_i = (n - 1).min(20);
    for i in 2..=max_i {
        let b = snap.bar(i);
        let rng = b.range();
        if rng <= 0.0 {
            break;
        }
        let directional = match side {
            Side::Buy => b.is_bull() && b.body_ratio() > 0.50,
            Side::Sell => b.is_bear() && b.body_ratio() > 0.50,
        };
        let extreme_close = match side {
            Side::Buy => b.close_position() > 0.6 && rng > atr * 0.5,
            Side::Sell => b.close_position() < 0.4 && rng > atr * 0.5,
        };
        if !directional && !extreme_close {
            break;
        }
        if i > 2 {
            // Bar i is the older of the pair; the newer bar must not dip
            // past the older bar's midpoint by more than the allowance.
            let newer = snap.bar(i - 1);
            let overlap = match side {
                Side::Buy => b.midpoint() - newer.low,
                Side::Sell => newer.high - b.midpoint(),
            };
            if rng > 0.0 && overlap / rng > ctx.cfg.spike_overlap_max {
                break;
            }
        }
        count += 1;
    }
    count
}

pub fn check_spike(ctx: &mut ScanCtx) -> Option<Signal> {
    let snap = ctx.snap;
    if !snap.ready(8) {
        return None;
    }
    let atr = snap.atr;
    let ai = ctx.mstate.always_in;

    let bull = count_spike_bars(ctx, Side::Buy);
    if bull >= ctx.cfg.min_spike_bars
        && !(ai == AlwaysIn::Short && bull < 5)
        && ctx.validate_and_cool(Side::Buy)
        && snap.bar(1).is_bull()
    {
        let region_top = snap.highest(bull + 1);
        let mut region_low = snap.low(1);
        for i in 1..=(bull + 1).min(snap.len()) {
            region_low = region_low.min(snap.low(i));
        }
        let mut sl = region_low - atr * 0.3;
        let entry = snap.close(1);
        if !ctx.within_budget(Side::Buy, entry, sl) {
            let rsl = ctx.swings.recent_swing_low(1, false);
            if rsl > 0.0 {
                sl = rsl - atr * 0.3;
            }
            if !ctx.within_budget(Side::Buy, entry, sl) {
                return None;
            }
        }
        return Some(ctx.emit(SignalKind::SpikeBuy, sl, region_top - region_low));
    }

    let bear = count_spike_bars(ctx, Side::Sell);
    if bear >= ctx.cfg.min_spike_bars {
        if ai == AlwaysIn::Long && bear < 5 {
            return None;
        }
        if ctx.validate_and_cool(Side::Sell) && snap.bar(1).is_bear() {
            let region_low = snap.lowest(bear + 1);
            let mut region_top = snap.high(1);
            for i in 1..=(bear + 1).min(snap.len()) {
                region_top = region_top.max(snap.high(i));
            }
            let mut sl = region_top + atr * 0.3;
            let entry = snap.close(1);
            if !ctx.within_budget(Side::Sell, entry, sl) {
                let rsh = ctx.swings.recent_swing_high(1, false);
                if rsh > 0.0 {
                    sl = rsh + atr * 0.3;
                }
                if !ctx.within_budget(Side::Sell, entry, sl) {
                    return None;
                }
            }
            return Some(ctx.emit(SignalKind::SpikeSell, sl, region_top - region_low));
        }
    }
    None
}

/// Emergency entry during the Spike cycle: in a breakout phase the close
/// itself is the signal, so a strong trend bar enters at market without
/// waiting for a pullback.
pub fn check_spike_market_entry(ctx: &mut ScanCtx) -> Option<Signal> {
    let snap = ctx.snap;
    if ctx.mstate.cycle != MarketCycle::Spike || !snap.ready(4) {
        return None;
    }
    let b = snap.bar(1);
    if b.range() <= 0.0 || b.body_ratio() < 0.60 {
        return None;
    }
    let atr = snap.atr;
    let ema = snap.ema(1);

    if b.is_bull() && b.close > ema && b.close_position() >= 0.75 {
        if !ctx.cooldown.allows(Side::Buy, b.close, snap) {
            return None;
        }
        let sl = b.low - atr * 0.3;
        if !ctx.within_budget(Side::Buy, b.close, sl) {
            return None;
        }
        return Some(ctx.emit(SignalKind::SpikeMarketBuy, sl, atr * 2.0));
    }
    if b.is_bear() && b.close < ema && b.close_position() <= 0.25 {
        if !ctx.cooldown.allows(Side::Sell, b.close, snap) {
            return None;
        }
        let sl = b.high + atr * 0.3;
        if !ctx.within_budget(Side::Sell, b.close, sl) {
            return None;
        }
        return Some(ctx.emit(SignalKind::SpikeMarketSell, sl, atr * 2.0));
    }
    None
}

pub fn check_micro_channel(ctx: &mut ScanCtx) -> Option<Signal> {
    let snap = ctx.snap;
    if !snap.ready(8) {
        return None;
    }
    let atr = snap.atr;
    let ai = ctx.mstate.always_in;

    // Count bars where every bar makes a higher high AND higher low with a
    // pullback of no more than a quarter of the previous bar's range.
    let mut up = 0usize;
    for i in 2..=10.min(snap.len() - 1) {
        if snap.high(i) <= snap.high(i + 1) || snap.low(i) < snap.low(i + 1) {
            break;
        }
        let prev_range = snap.bar(i + 1).range();
        if prev_range > 0.0 && snap.low(i) < snap.low(i + 1) + prev_range * 0.75 {
            break;
        }
        up += 1;
    }
    if up >= 5 && ai == AlwaysIn::Long && snap.high(1) > snap.high(2) && snap.bar(1).is_bull() {
        if ctx.validate_and_cool(Side::Buy) {
            let mut channel_low = snap.low(2);
            for i in 2..=(up + 1).min(snap.len()) {
                channel_low = channel_low.min(snap.low(i));
            }
            let entry = snap.close(1);
            let mut sl = channel_low - atr * 0.3;
            if !ctx.within_budget(Side::Buy, entry, sl) {
                sl = snap.low(1).min(snap.low(2)) - atr * 0.3;
            }
            if !ctx.within_budget(Side::Buy, entry, sl) {
                return None;
            }
            return Some(ctx.emit(SignalKind::MicroChannelBuy, sl, snap.high(1) - channel_low));
        }
        return None;
    }

    let mut down = 0usize;
    for i in 2..=10.min(snap.len() - 1) {
        if snap.low(i) >= snap.low(i + 1) || snap.high(i) > snap.high(i + 1) {
            break;
        }
        let prev_range = snap.bar(i + 1).range();
        if prev_range > 0.0 && snap.high(i) > snap.high(i + 1) - prev_range * 0.75 {
            break;
        }
        down += 1;
    }
    if down >= 5 && ai == AlwaysIn::Short && snap.low(1) < snap.low(2) && snap.bar(1).is_bear() {
        if ctx.validate_and_cool(Side::Sell) {
            let mut channel_high = snap.high(2);
            for i in 2..=(down + 1).min(snap.len()) {
                channel_high = channel_high.max(snap.high(i));
            }
            let entry = snap.close(1);
            let mut sl = channel_high + atr * 0.3;
            if !ctx.within_budget(Side::Sell, entry, sl) {
                sl = snap.high(1).max(snap.high(2)) + atr * 0.3;
            }
            if !ctx.within_budget(Side::Sell, entry, sl) {
                return None;
            }
            return Some(ctx.emit(SignalKind::MicroChannelSell, sl, channel_high - snap.low(1)));
        }
    }
    None
}

/// H/L push entries. H2/L2 (count == 2) are the mainstay; H1/L1 require an
/// extremely strong regime with four of the last five bars in trend
/// direction, and honour the 20-gap first-pullback block.
pub fn check_hl_count(ctx: &mut ScanCtx, side: Side) -> Option<Signal> {
    let snap = ctx.snap;
    if !snap.ready(8) {
        return None;
    }
    let atr = snap.atr;

    let need_ai = match side {
        Side::Buy => AlwaysIn::Long,
        Side::Sell => AlwaysIn::Short,
    };
    if ctx.mstate.always_in != need_ai {
        return None;
    }
    if ctx.mstate.state == MarketState::TradingRange {
        return None;
    }

    let count = match side {
        Side::Buy => ctx.hl.h_count,
        Side::Sell => ctx.hl.l_count,
    };
    let extreme = match side {
        Side::Buy => ctx.hl.h_last_pullback_low,
        Side::Sell => ctx.hl.l_last_bounce_high,
    };
    if extreme <= 0.0 {
        return None;
    }
    let sl = extreme - side.sign() * atr * 0.3;
    let entry = snap.close(1);
    if !ctx.within_budget(side, entry, sl) {
        return None;
    }

    let kind = if count == 1 {
        let very_strong = (ctx.mstate.state == MarketState::StrongTrend
            && ctx.mstate.trend_strength >= 0.65)
            || ctx.mstate.state == MarketState::TightChannel;
        let mut same = 0usize;
        for i in 1..=5.min(snap.len()) {
            let b = snap.bar(i);
            let with_trend = match side {
                Side::Buy => b.is_bull(),
                Side::Sell => b.is_bear(),
            };
            if with_trend {
                same += 1;
            }
        }
        if !very_strong || same < 4 {
            return None;
        }
        if ctx.gap20.blocks_first_pullback() {
            return None;
        }
        match side {
            Side::Buy => SignalKind::H1Buy,
            Side::Sell => SignalKind::L1Sell,
        }
    } else if count >= 2 {
        match side {
            Side::Buy => SignalKind::H2Buy,
            Side::Sell => SignalKind::L2Sell,
        }
    } else {
        return None;
    };

    if !ctx.validate_and_cool(side) {
        return None;
    }
    match side {
        Side::Buy => ctx.hl.reset_h(),
        Side::Sell => ctx.hl.reset_l(),
    }
    Some(ctx.emit(kind, sl, atr * 2.0))
}

/// A bar whose open gaps clear of the previous bar's extreme by at least
/// 0.3 x ATR, in the Always-In direction.
pub fn check_gap_bar(ctx: &mut ScanCtx) -> Option<Signal> {
    let snap = ctx.snap;
    if !snap.ready(3) {
        return None;
    }
    let atr = snap.atr;
    let gap_threshold = atr * 0.3;
    let b = snap.bar(1);

    let gap_up = b.open - snap.high(2);
    if gap_up >= gap_threshold
        && b.is_bull()
        && ctx.mstate.always_in == AlwaysIn::Long
        && ctx.validate_and_cool(Side::Buy)
    {
        let sl = b.low.min(snap.high(2)) - atr * 0.3;
        if !ctx.within_budget(Side::Buy, b.close, sl) {
            return None;
        }
        return Some(ctx.emit(SignalKind::GapBarBuy, sl, atr * 2.0));
    }

    let gap_down = snap.low(2) - b.open;
    if gap_down >= gap_threshold
        && b.is_bear()
        && ctx.mstate.always_in == AlwaysIn::Short
        && ctx.validate_and_cool(Side::Sell)
    {
        let sl = b.high.max(snap.low(2)) + atr * 0.3;
        if !ctx.within_budget(Side::Sell, b.close, sl) {
            return None;
        }
        return Some(ctx.emit(SignalKind::GapBarSell, sl, atr * 2.0));
    }
    None
}

/// A single dominant trend bar closing at its extreme, with the market
/// already committed in that direction.
pub fn check_trend_bar(ctx: &mut ScanCtx) -> Option<Signal> {
    let snap = ctx.snap;
    if !snap.ready(2) {
        return None;
    }
    let atr = snap.atr;
    let b = snap.bar(1);
    let rng = b.range();
    if rng <= 0.0 || rng < atr * 0.8 || b.body_ratio() < 0.70 {
        return None;
    }

    if b.is_bull()
        && ctx.mstate.always_in == AlwaysIn::Long
        && b.close_position() >= 0.75
        && ctx.cooldown.allows(Side::Buy, b.close, snap)
    {
        let sl = b.low - atr * 0.3;
        if !ctx.within_budget(Side::Buy, b.close, sl) {
            return None;
        }
        return Some(ctx.emit(SignalKind::TrendBarBuy, sl, rng));
    }
    if b.is_bear()
        && ctx.mstate.always_in == AlwaysIn::Short
        && b.close_position() <= 0.25
        && ctx.cooldown.allows(Side::Sell, b.close, snap)
    {
        let sl = b.high + atr * 0.3;
        if !ctx.within_budget(Side::Sell, b.close, sl) {
            return None;
        }
        return Some(ctx.emit(SignalKind::TrendBarSell, sl, rng));
    }
    None
}

/// Close beyond the tracked trading-range boundary on a directional bar.
/// Arms the breakout memory for the pullback detector.
pub fn check_tr_breakout(ctx: &mut ScanCtx) -> Option<Signal> {
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
    if tr_range < atr * 1.5 {
        return None;
    }
    let b = snap.bar(1);
    if b.range() <= 0.0 || b.body_ratio() < 0.50 {
        return None;
    }

    if b.close > tr_high
        && b.is_bull()
        && ctx.mstate.always_in != AlwaysIn::Short
        && ctx.validate_and_cool(Side::Buy)
    {
        let mut sl = b.low.max(tr_high - tr_range * 0.3) - atr * 0.2;
        if !ctx.within_budget(Side::Buy, b.close, sl) {
            sl = b.low - atr * 0.3;
        }
        if !ctx.within_budget(Side::Buy, b.close, sl) {
            return None;
        }
        ctx.breakout.arm(Side::Buy, tr_high);
        return Some(ctx.emit(SignalKind::TrBreakoutBuy, sl, tr_range));
    }
    if b.close < tr_low
        && b.is_bear()
        && ctx.mstate.always_in != AlwaysIn::Long
        && ctx.validate_and_cool(Side::Sell)
    {
        let mut sl = b.high.min(tr_low + tr_range * 0.3) + atr * 0.2;
        if !ctx.within_budget(Side::Sell, b.close, sl) {
            sl = b.high + atr * 0.3;
        }
        if !ctx.within_budget(Side::Sell, b.close, sl) {
            return None;
        }
        ctx.breakout.arm(Side::Sell, tr_low);
        return Some(ctx.emit(SignalKind::TrBreakoutSell, sl, tr_range));
    }
    None
}

/// First orderly pullback to a recently broken level, 2 to 8 bars after
/// the break.
pub fn check_breakout_pullback(ctx: &mut ScanCtx) -> Option<Signal> {
    let snap = ctx.snap;
    if !snap.ready(2) || !ctx.breakout.recent || ctx.breakout.level <= 0.0 {
        return None;
    }
    if ctx.breakout.age_bars < 2 || ctx.breakout.age_bars > 8 {
        return None;
    }
    let atr = snap.atr;
    let tol = atr * 0.5;
    let level = ctx.breakout.level;
    let b = snap.bar(1);

    match ctx.breakout.direction {
        Some(Side::Buy) => {
            if b.low <= level + tol
                && b.is_bull()
                && b.close > level
                && ctx.cooldown.allows(Side::Buy, b.close, snap)
            {
                let sl = b.low.min(level) - atr * 0.3;
                if !ctx.within_budget(Side::Buy, b.close, sl) {
                    return None;
                }
                ctx.breakout.recent = false;
                return Some(ctx.emit(SignalKind::BreakoutPullbackBuy, sl, atr * 2.0));
            }
        }
        Some(Side::Sell) => {
            if b.high >= level - tol
                && b.is_bear()
                && b.close < level
                && ctx.cooldown.allows(Side::Sell, b.close, snap)
            {
                let sl = b.high.max(level) + atr * 0.3;
                if !ctx.within_budget(Side::Sell, b.close, sl) {
                    return None;
                }
                ctx.breakout.recent = false;
                return Some(ctx.emit(SignalKind::BreakoutPullbackSell, sl, atr * 2.0));
            }
        }
        None => {}
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trading_core::signals::testkit::Harness;

    #[test]
    fn test_spike_buy_fires_on_consecutive_trend_bars() {
        let mut h = Harness::new();
        h.warm();
        // Three strong bull bars with low overlap, then a bull confirmation
        // bar closing near its high. Kept shallow so the structural stop
        // stays inside the MaxStopATR budget.
        let mut px = 100.0;
        for _ in 0..3 {
            h.push(px, px + 1.1, px - 0.1, px + 1.0);
            px += 1.0;
        }
        h.push(px, px + 0.9, px - 0.1, px + 0.8);

        let sig = h.scan(|ctx| check_spike(ctx));
        let sig = sig.expect("spike should fire");
        assert_eq!(sig.kind, SignalKind::SpikeBuy);
        assert_eq!(sig.side, Side::Buy);
        assert!(sig.technical_stop < sig.entry_hint);
        assert!(sig.base_height > 0.0);
    }

    #[test]
    fn test_spike_needs_min_bars() {
        let mut h = Harness::new();
        h.warm();
        // Only two trend bars before the confirmation bar.
        let mut px = 100.0;
        for _ in 0..2 {
            h.push(px, px + 1.7, px - 0.1, px + 1.6);
            px += 1.6;
        }
        h.push(px, px + 1.4, px - 0.1, px + 1.3);
        assert!(h.scan(|ctx| check_spike(ctx)).is_none());
    }

    #[test]
    fn test_trend_bar_requires_always_in() {
        let mut h = Harness::new();
        h.warm();
        // A qualifying trend bar on an otherwise flat tape: geometry passes
        // but AlwaysIn is still Neutral, so nothing fires.
        h.push(100.0, 101.8, 100.0, 101.7);
        assert!(h.scan(|ctx| check_trend_bar(ctx)).is_none());
    }

    #[test]
    fn test_trend_bar_fires_in_established_trend() {
        let mut h = Harness::new();
        h.warm();
        let mut px = 100.0;
        for _ in 0..6 {
            h.push(px, px + 1.8, px - 0.1, px + 1.7);
            px += 1.7;
        }
        let sig = h.scan(|ctx| check_trend_bar(ctx));
        let sig = sig.expect("trend bar should fire");
        assert_eq!(sig.kind, SignalKind::TrendBarBuy);
        assert!(sig.technical_stop < sig.entry_hint);
    }

    #[test]
    fn test_gap_bar_buy() {
        let mut h = Harness::new();
        h.warm();
        // Establish AlwaysIn long.
        let mut px = 100.0;
        for _ in 0..5 {
            h.push(px, px + 1.8, px - 0.1, px + 1.7);
            px += 1.7;
        }
        // Bar opening a full point above the previous high.
        let prev_high = px + 0.1;
        let open = prev_high + 1.0;
        h.push(open, open + 1.6, open - 0.2, open + 1.5);
        // Rebuild the gap against the *previous* bar: push() already ran
        // the trackers, so only the detector remains.
        let sig = h.scan(|ctx| check_gap_bar(ctx));
        let sig = sig.expect("gap bar should fire");
        assert_eq!(sig.kind, SignalKind::GapBarBuy);
    }

    #[test]
    fn test_breakout_pullback_age_window() {
        let mut h = Harness::new();
        h.warm();
        h.breakout.arm(Side::Buy, 101.0);
        // Age 0: too fresh.
        assert!(h.scan(|ctx| check_breakout_pullback(ctx)).is_none());
        // Two quiet bars age the memory into the window; then a bull bar
        // pulls back to the level and holds above it.
        h.push(102.5, 103.0, 102.0, 102.8);
        h.push(102.8, 103.2, 102.2, 103.0);
        h.push(101.6, 102.6, 101.2, 102.4);
        let sig = h.scan(|ctx| check_breakout_pullback(ctx));
        let sig = sig.expect("pullback should fire");
        assert_eq!(sig.kind, SignalKind::BreakoutPullbackBuy);
        assert!(!h.breakout.recent);
    }

    #[test]
    fn test_hl_count_requires_always_in() {
        let mut h = Harness::new();
        h.warm();
        h.hl.h_count = 2;
        h.hl.h_last_pullback_low = 99.0;
        // Flat tape: AlwaysIn is Neutral, so no H2.
        assert!(h.scan(|ctx| check_hl_count(ctx, Side::Buy)).is_none());
    }

    #[test]
    fn test_h2_fires_with_trend_and_count() {
        let mut h = Harness::new();
        h.warm();
        let mut px = 100.0;
        for _ in 0..6 {
            h.push(px, px + 1.8, px - 0.1, px + 1.7);
            px += 1.7;
        }
        // Pretend the counter saw two pushes with a pullback low close by.
        h.hl.h_count = 2;
        h.hl.h_last_pullback_low = px - 2.0;
        let sig = h.scan(|ctx| check_hl_count(ctx, Side::Buy));
        let sig = sig.expect("H2 should fire");
        assert_eq!(sig.kind, SignalKind::H2Buy);
        // The counter is consumed on emission.
        assert_eq!(h.hl.h_count, 0);
    }

    #[test]
    fn test_h1_blocked_by_gap20() {
        let mut h = Harness::new();
        h.warm();
        let mut px = 100.0;
        for _ in 0..6 {
            h.push(px, px + 1.8, px - 0.1, px + 1.7);
            px += 1.7;
        }
        h.hl.h_count = 1;
        h.hl.h_last_pullback_low = px - 2.0;
        h.gap20.overextended = true;
        h.gap20.first_pullback_blocked = true;
        h.gap20.first_pullback_complete = false;
        assert!(h.scan(|ctx| check_hl_count(ctx, Side::Buy)).is_none());
    }
}
