//! Position sizing.
//!
//! Quantity is a fixed fraction of balance, levered, rounded down onto the
//! exchange's step grid. Small accounts run full sizing; past the balance
//! threshold the fraction halves.

use tracing::warn;

use crate::config::EngineConfig;
use crate::types::SymbolInfo;

/// Sizing fraction (percent) for the given balance.
pub fn position_size_pct(cfg: &EngineConfig, balance: f64) -> f64 {
    if balance <= cfg.large_bal_threshold {
        cfg.sizing_small_bal_pct
    } else {
        cfg.sizing_large_bal_pct
    }
}

/// Order quantity for a new entry, or None when the exchange's minimums
/// cannot be met (the signal is dropped with a warning).
pub fn order_quantity(
    cfg: &EngineConfig,
    symbol: &SymbolInfo,
    balance: f64,
    entry_price: f64,
) -> Option<f64> {
    if entry_price <= 0.0 || balance <= 0.0 {
        return None;
    }
    let pct = position_size_pct(cfg, balance) / 100.0;
    let notional = balance * pct * cfg.leverage;
    let qty = symbol.round_qty(notional / entry_price);

    if qty < symbol.min_qty {
        warn!(
            qty,
            min_qty = symbol.min_qty,
            "computed quantity below exchange minimum; dropping signal"
        );
        return None;
    }
    if qty * entry_price < symbol.min_notional {
        warn!(
            notional = qty * entry_price,
            min_notional = symbol.min_notional,
            "computed notional below exchange minimum; dropping signal"
        );
        return None;
    }
    Some(qty)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn symbol() -> SymbolInfo {
        SymbolInfo {
            symbol: "BTCUSDT".into(),
            tick_size: 0.1,
            step_size: 0.001,
            min_qty: 0.001,
            min_notional: 5.0,
            min_stops_level_points: 30,
        }
    }

    #[test]
    fn test_small_balance_uses_full_sizing() {
        let cfg = EngineConfig::default();
        assert!((position_size_pct(&cfg, 500.0) - 100.0).abs() < 1e-9);
        assert!((position_size_pct(&cfg, 5000.0) - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_quantity_rounds_down_to_step() {
        let cfg = EngineConfig::default();
        // balance 500, 100% x20 leverage at price 64000: 0.15625 -> 0.156.
        let qty = order_quantity(&cfg, &symbol(), 500.0, 64_000.0).unwrap();
        assert!((qty - 0.156).abs() < 1e-9);
    }

    #[test]
    fn test_dust_balance_dropped() {
        let cfg = EngineConfig::default();
        assert!(order_quantity(&cfg, &symbol(), 0.05, 64_000.0).is_none());
    }
}
