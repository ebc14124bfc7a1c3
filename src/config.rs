//! Engine configuration.
//!
//! Every key is optional in the environment; defaults match the documented
//! parameter set. The config is built once at startup and cloned down into
//! the components that need it — no component reaches back into the
//! environment after construction.

use serde::{Deserialize, Serialize};

use crate::types::Timeframe;

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

fn env_tf(key: &str, default: Timeframe) -> Timeframe {
    std::env::var(key)
        .ok()
        .and_then(|v| Timeframe::parse(&v))
        .unwrap_or(default)
}

/// Per-detector enable switches. All default on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorToggles {
    pub spike: bool,
    pub micro_channel: bool,
    pub hl_count: bool,
    pub gap_bar: bool,
    pub trend_bar: bool,
    pub reversal_bar: bool,
    pub ii_pattern: bool,
    pub outside_bar: bool,
    pub measured_move: bool,
    pub tr_breakout: bool,
    pub breakout_pullback: bool,
    pub wedge: bool,
    pub climax: bool,
    pub mtr: bool,
    pub failed_breakout: bool,
    pub double_top_bottom: bool,
    pub final_flag: bool,
    pub spike_market_entry: bool,
}

impl Default for DetectorToggles {
    fn default() -> Self {
        Self {
            spike: true,
            micro_channel: true,
            hl_count: true,
            gap_bar: true,
            trend_bar: true,
            reversal_bar: true,
            ii_pattern: true,
            outside_bar: true,
            measured_move: true,
            tr_breakout: true,
            breakout_pullback: true,
            wedge: true,
            climax: true,
            mtr: true,
            failed_breakout: true,
            double_top_bottom: true,
            final_flag: true,
            spike_market_entry: true,
        }
    }
}

impl DetectorToggles {
    fn from_env() -> Self {
        let d = Self::default();
        Self {
            spike: env_bool("ENABLE_SPIKE", d.spike),
            micro_channel: env_bool("ENABLE_MICRO_CHANNEL", d.micro_channel),
            hl_count: env_bool("ENABLE_H2L2", d.hl_count),
            gap_bar: env_bool("ENABLE_GAP_BAR", d.gap_bar),
            trend_bar: env_bool("ENABLE_TREND_BAR", d.trend_bar),
            reversal_bar: env_bool("ENABLE_REV_BAR", d.reversal_bar),
            ii_pattern: env_bool("ENABLE_II_PATTERN", d.ii_pattern),
            outside_bar: env_bool("ENABLE_OUTSIDE_BAR", d.outside_bar),
            measured_move: env_bool("ENABLE_MEASURED_MOVE", d.measured_move),
            tr_breakout: env_bool("ENABLE_TR_BREAKOUT", d.tr_breakout),
            breakout_pullback: env_bool("ENABLE_BO_PULLBACK", d.breakout_pullback),
            wedge: env_bool("ENABLE_WEDGE", d.wedge),
            climax: env_bool("ENABLE_CLIMAX", d.climax),
            mtr: env_bool("ENABLE_MTR", d.mtr),
            failed_breakout: env_bool("ENABLE_FAILED_BO", d.failed_breakout),
            double_top_bottom: env_bool("ENABLE_DTDB", d.double_top_bottom),
            final_flag: env_bool("ENABLE_FINAL_FLAG", d.final_flag),
            spike_market_entry: env_bool("ENABLE_SPIKE_MARKET_ENTRY", d.spike_market_entry),
        }
    }
}

/// Flat engine configuration, handed down by value at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub symbol: String,
    pub primary_tf: Timeframe,
    pub htf: Timeframe,

    // Indicators
    pub ema_period: usize,
    pub atr_period: usize,
    pub lookback: usize,

    // Signals
    pub signal_cooldown: i64,
    pub max_stop_atr: f64,
    pub min_spike_bars: usize,
    pub spike_overlap_max: f64,
    pub strong_trend_score: f64,

    // HTF filter
    pub htf_enabled: bool,
    pub htf_ema_period: usize,
    pub htf_bypass_gap_count: usize,

    // 20-gap overextension
    pub enable_20_gap: bool,
    pub gap_bar_threshold: usize,
    pub consolidation_bars: usize,
    pub consolidation_range_atr: f64,

    // Stops
    pub hard_stop: bool,
    pub hard_stop_buffer: f64,
    pub soft_stop: bool,
    pub soft_stop_mode: u8,
    pub soft_stop_bars: usize,
    pub min_stops_level_points: u32,

    // Take-profits
    pub tp1_scalp_r: f64,
    pub tp1_close_pct: f64,
    pub runner_tp2_min_atr: f64,
    pub breakeven_atr_mult: f64,
    pub breakeven_points: u32,

    // Regime filters
    pub barb_wire: bool,
    pub measuring_gap: bool,
    pub breakout_mode: bool,
    pub ttr_overlap_ratio: f64,
    pub ttr_range_atr_mult: f64,

    // Spread filter
    pub spread_filter: bool,
    pub spread_max_mult: f64,
    pub spread_lookback: usize,

    // Session
    pub weekend_filter: bool,
    pub friday_close_hour_gmt: u32,
    pub sunday_open_hour_gmt: u32,
    pub friday_min_r_to_hold: f64,
    pub monday_gap_reset_atr: f64,

    // Sizing
    pub sizing_small_bal_pct: f64,
    pub sizing_large_bal_pct: f64,
    pub large_bal_threshold: f64,
    pub leverage: f64,
    pub max_positions_per_user: usize,

    // Order flow
    pub orderflow_enabled: bool,

    pub detectors: DetectorToggles,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            symbol: "BTCUSDT".into(),
            primary_tf: Timeframe::M5,
            htf: Timeframe::H1,
            ema_period: 20,
            atr_period: 20,
            lookback: 20,
            signal_cooldown: 3,
            max_stop_atr: 3.0,
            min_spike_bars: 3,
            spike_overlap_max: 0.30,
            strong_trend_score: 0.5,
            htf_enabled: true,
            htf_ema_period: 20,
            htf_bypass_gap_count: 5,
            enable_20_gap: true,
            gap_bar_threshold: 20,
            consolidation_bars: 5,
            consolidation_range_atr: 1.5,
            hard_stop: true,
            hard_stop_buffer: 1.5,
            soft_stop: true,
            soft_stop_mode: 0,
            soft_stop_bars: 2,
            min_stops_level_points: 30,
            tp1_scalp_r: 1.0,
            tp1_close_pct: 50.0,
            runner_tp2_min_atr: 1.5,
            breakeven_atr_mult: 0.1,
            breakeven_points: 5,
            barb_wire: true,
            measuring_gap: true,
            breakout_mode: true,
            ttr_overlap_ratio: 0.40,
            ttr_range_atr_mult: 2.5,
            spread_filter: true,
            spread_max_mult: 2.0,
            spread_lookback: 20,
            weekend_filter: true,
            friday_close_hour_gmt: 22,
            sunday_open_hour_gmt: 0,
            friday_min_r_to_hold: 1.5,
            monday_gap_reset_atr: 0.5,
            sizing_small_bal_pct: 100.0,
            sizing_large_bal_pct: 50.0,
            large_bal_threshold: 1000.0,
            leverage: 20.0,
            max_positions_per_user: 2,
            orderflow_enabled: true,
            detectors: DetectorToggles::default(),
        }
    }
}

impl EngineConfig {
    /// Build from the process environment. Unset keys take defaults.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            symbol: std::env::var("SYMBOL").unwrap_or(d.symbol),
            primary_tf: env_tf("INTERVAL", d.primary_tf),
            htf: env_tf("HTF_TIMEFRAME", d.htf),
            ema_period: env_usize("EMA_PERIOD", d.ema_period),
            atr_period: env_usize("ATR_PERIOD", d.atr_period),
            lookback: env_usize("LOOKBACK", d.lookback),
            signal_cooldown: env_u32("SIGNAL_COOLDOWN", d.signal_cooldown as u32) as i64,
            max_stop_atr: env_f64("MAX_STOP_ATR", d.max_stop_atr),
            min_spike_bars: env_usize("MIN_SPIKE_BARS", d.min_spike_bars),
            spike_overlap_max: env_f64("SPIKE_OVERLAP_MAX", d.spike_overlap_max),
            strong_trend_score: env_f64("STRONG_TREND_SCORE", d.strong_trend_score),
            htf_enabled: env_bool("HTF_ENABLED", d.htf_enabled),
            htf_ema_period: env_usize("HTF_EMA_PERIOD", d.htf_ema_period),
            htf_bypass_gap_count: env_usize("HTF_BYPASS_GAP_COUNT", d.htf_bypass_gap_count),
            enable_20_gap: env_bool("ENABLE_20GAP", d.enable_20_gap),
            gap_bar_threshold: env_usize("GAP_BAR_THRESHOLD", d.gap_bar_threshold),
            consolidation_bars: env_usize("CONSOLIDATION_BARS", d.consolidation_bars),
            consolidation_range_atr: env_f64("CONSOLIDATION_RANGE", d.consolidation_range_atr),
            hard_stop: env_bool("HARD_STOP", d.hard_stop),
            hard_stop_buffer: env_f64("HARD_STOP_BUFFER", d.hard_stop_buffer),
            soft_stop: env_bool("SOFT_STOP", d.soft_stop),
            soft_stop_mode: env_u32("SOFT_STOP_MODE", d.soft_stop_mode as u32) as u8,
            soft_stop_bars: env_usize("SOFT_STOP_BARS", d.soft_stop_bars),
            min_stops_level_points: env_u32("MIN_STOPS_LEVEL_POINTS", d.min_stops_level_points),
            tp1_scalp_r: env_f64("TP1_SCALP_R", d.tp1_scalp_r),
            tp1_close_pct: env_f64("TP1_CLOSE_PCT", d.tp1_close_pct),
            runner_tp2_min_atr: env_f64("RUNNER_TP2_MIN_ATR", d.runner_tp2_min_atr),
            breakeven_atr_mult: env_f64("BREAKEVEN_ATR_MULT", d.breakeven_atr_mult),
            breakeven_points: env_u32("BREAKEVEN_POINTS", d.breakeven_points),
            barb_wire: env_bool("BARB_WIRE", d.barb_wire),
            measuring_gap: env_bool("MEASURING_GAP", d.measuring_gap),
            breakout_mode: env_bool("BREAKOUT_MODE", d.breakout_mode),
            ttr_overlap_ratio: env_f64("TTR_OVERLAP_RATIO", d.ttr_overlap_ratio),
            ttr_range_atr_mult: env_f64("TTR_RANGE_ATR_MULT", d.ttr_range_atr_mult),
            spread_filter: env_bool("SPREAD_FILTER", d.spread_filter),
            spread_max_mult: env_f64("SPREAD_MAX_MULT", d.spread_max_mult),
            spread_lookback: env_usize("SPREAD_LOOKBACK", d.spread_lookback),
            weekend_filter: env_bool("WEEKEND_FILTER", d.weekend_filter),
            friday_close_hour_gmt: env_u32("FRIDAY_CLOSE_HOUR_GMT", d.friday_close_hour_gmt),
            sunday_open_hour_gmt: env_u32("SUNDAY_OPEN_HOUR_GMT", d.sunday_open_hour_gmt),
            friday_min_r_to_hold: env_f64("FRIDAY_MIN_R_TO_HOLD", d.friday_min_r_to_hold),
            monday_gap_reset_atr: env_f64("MONDAY_GAP_RESET_ATR", d.monday_gap_reset_atr),
            sizing_small_bal_pct: env_f64("SIZING_SMALL_BAL_PCT", d.sizing_small_bal_pct),
            sizing_large_bal_pct: env_f64("SIZING_LARGE_BAL_PCT", d.sizing_large_bal_pct),
            large_bal_threshold: env_f64("LARGE_BAL_THRESHOLD", d.large_bal_threshold),
            leverage: env_f64("LEVERAGE", d.leverage),
            max_positions_per_user: env_usize("MAX_POSITIONS_PER_USER", d.max_positions_per_user),
            orderflow_enabled: env_bool("ORDERFLOW_ENABLED", d.orderflow_enabled),
            detectors: DetectorToggles::from_env(),
        }
    }

    /// Ring buffer capacity: >= 50 + lookback, rounded up generously so the
    /// deepest detector lookback (40 bars) plus indicator warmup always fits.
    pub fn buffer_capacity(&self) -> usize {
        (50 + self.lookback).max(256)
    }
}
