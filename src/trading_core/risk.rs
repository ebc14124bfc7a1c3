//! Stop and take-profit computation.
//!
//! The technical stop is the structural level the strategy believes in; the
//! hard stop is the widened disaster line the broker actually holds. Both
//! legs of a twin entry share them. TP1 pays the Scalp leg at exactly 1R;
//! TP2 is the Runner's measured-move target.

use crate::trading_core::bars::MarketSnapshot;
use crate::trading_core::market_state::RegimeView;
use crate::trading_core::swings::SwingTracker;
use crate::types::{Side, SymbolInfo};

/// Unified technical stop ("Brooks stop").
///
/// Preference order: the most recent swing on the loss side (tentative
/// allowed per call) when it sits within the MaxStopATR budget, else the
/// two-bar extremum, each padded by `0.3 x ATR + spread`. In strong-trend
/// regimes the tighter of signal-bar stop and swing stop wins. The result
/// is clamped to MaxStopATR x ATR from entry.
///
/// Returns None only when the buffer is cold (ATR = 0) or no sane level
/// exists on the loss side.
#[allow(clippy::too_many_arguments)]
pub fn brooks_stop(
    side: Side,
    entry: f64,
    snap: &MarketSnapshot,
    swings: &SwingTracker,
    spread: f64,
    max_stop_atr: f64,
    strong_regime: bool,
    allow_tentative: bool,
) -> Option<f64> {
    let atr = snap.atr;
    if atr <= 0.0 || snap.len() < 2 {
        return None;
    }
    let buffer = (atr * 0.3).max(atr * 0.2) + spread.max(0.0);
    let max_dist = atr * max_stop_atr;

    let swing_candidate = match side {
        Side::Buy => {
            let sw = swings.recent_swing_low(1, allow_tentative);
            (sw > 0.0 && sw < entry && entry - sw <= max_dist).then(|| sw - buffer)
        }
        Side::Sell => {
            let sw = swings.recent_swing_high(1, allow_tentative);
            (sw > 0.0 && sw > entry && sw - entry <= max_dist).then(|| sw + buffer)
        }
    };

    let bar_candidate = match side {
        Side::Buy => {
            let lo = snap.low(1).min(snap.low(2));
            let mut sl = lo - buffer;
            if sl >= entry {
                sl = entry - atr * 0.3;
            }
            sl
        }
        Side::Sell => {
            let hi = snap.high(1).max(snap.high(2));
            let mut sl = hi + buffer;
            if sl <= entry {
                sl = entry + atr * 0.3;
            }
            sl
        }
    };

    let mut stop = if strong_regime {
        // Tighter (closer to entry) of the two, when both are valid.
        match swing_candidate {
            Some(sw) => match side {
                Side::Buy => sw.max(bar_candidate),
                Side::Sell => sw.min(bar_candidate),
            },
            None => bar_candidate,
        }
    } else {
        swing_candidate.unwrap_or(bar_candidate)
    };

    // Clamp to the risk budget.
    match side {
        Side::Buy => {
            if entry - stop > max_dist {
                stop = entry - max_dist;
            }
            (stop < entry).then_some(stop)
        }
        Side::Sell => {
            if stop - entry > max_dist {
                stop = entry + max_dist;
            }
            (stop > entry).then_some(stop)
        }
    }
}

/// Broker-side hard stop: the technical stop widened by the configured
/// buffer, floored at the larger of the exchange's minimum stop distance
/// and the configured tick floor.
pub fn hard_stop(
    side: Side,
    entry: f64,
    technical_stop: f64,
    hard_stop_buffer: f64,
    symbol: &SymbolInfo,
    min_stops_level_points: u32,
) -> f64 {
    let risk = (entry - technical_stop).abs();
    let widen = risk * (hard_stop_buffer - 1.0).max(0.0);
    let floor = symbol
        .min_stop_distance()
        .max(min_stops_level_points as f64 * symbol.tick_size);

    let mut hard = technical_stop - side.sign() * widen;
    if (entry - hard).abs() < floor {
        hard = entry - side.sign() * floor;
    }
    symbol.round_price(hard)
}

/// TP1 (Scalp) and TP2 (Runner).
///
/// TP1 is exactly `tp1_r` R from entry. TP2 prefers a direction-compatible
/// tight-channel extreme, else projects two times the recent two-bar height
/// (floored at half an ATR); either way it ends at least
/// `tp2_min_atr x ATR` away from entry.
pub fn take_profits(
    side: Side,
    entry: f64,
    technical_stop: f64,
    snap: &MarketSnapshot,
    regime: &RegimeView,
    tp1_r: f64,
    tp2_min_atr: f64,
) -> (f64, f64) {
    let risk = (entry - technical_stop).abs();
    let tp1 = entry + side.sign() * risk * tp1_r;

    let channel_target = match (side, regime.tight_channel_dir) {
        (Side::Buy, Some(Side::Buy)) if regime.tight_channel_extreme > entry => {
            Some(regime.tight_channel_extreme)
        }
        (Side::Sell, Some(Side::Sell))
            if regime.tight_channel_extreme > 0.0 && regime.tight_channel_extreme < entry =>
        {
            Some(regime.tight_channel_extreme)
        }
        _ => None,
    };

    let mut tp2 = channel_target.unwrap_or_else(|| {
        let two_bar_height = if snap.len() >= 2 {
            snap.high(1).max(snap.high(2)) - snap.low(1).min(snap.low(2))
        } else {
            0.0
        };
        let leg = 2.0 * two_bar_height.max(snap.atr * 0.5);
        entry + side.sign() * leg
    });

    let min_dist = snap.atr * tp2_min_atr;
    if (tp2 - entry).abs() < min_dist {
        tp2 = entry + side.sign() * min_dist;
    }
    (tp1, tp2)
}
