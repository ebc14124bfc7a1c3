use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Trade direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// +1.0 for buys, -1.0 for sells. Lets stop/target arithmetic stay
    /// direction-neutral: `entry + side.sign() * distance`.
    pub fn sign(self) -> f64 {
        match self {
            Side::Buy => 1.0,
            Side::Sell => -1.0,
        }
    }

    pub fn index(self) -> usize {
        match self {
            Side::Buy => 0,
            Side::Sell => 1,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "buy"),
            Side::Sell => write!(f, "sell"),
        }
    }
}

/// One OHLCV candle. `open_time` identifies the bar; replaying a bar with
/// the same open_time is a no-op upstream.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    pub fn range(&self) -> f64 {
        self.high - self.low
    }

    pub fn body(&self) -> f64 {
        (self.close - self.open).abs()
    }

    /// Signed body: positive for bull bars, negative for bear bars.
    pub fn signed_body(&self) -> f64 {
        self.close - self.open
    }

    pub fn is_bull(&self) -> bool {
        self.close > self.open
    }

    pub fn is_bear(&self) -> bool {
        self.close < self.open
    }

    /// |body| / range, 0 when the bar has no range.
    pub fn body_ratio(&self) -> f64 {
        let r = self.range();
        if r > 0.0 {
            self.body() / r
        } else {
            0.0
        }
    }

    /// Close position within the bar, 0 = at the low, 1 = at the high.
    pub fn close_position(&self) -> f64 {
        let r = self.range();
        if r > 0.0 {
            (self.close - self.low) / r
        } else {
            0.5
        }
    }

    pub fn upper_tail(&self) -> f64 {
        self.high - self.close.max(self.open)
    }

    pub fn lower_tail(&self) -> f64 {
        self.close.min(self.open) - self.low
    }

    pub fn midpoint(&self) -> f64 {
        (self.high + self.low) / 2.0
    }

    /// Overlap with another bar as an absolute price distance (>= 0).
    pub fn overlap_with(&self, other: &Bar) -> f64 {
        (self.high.min(other.high) - self.low.max(other.low)).max(0.0)
    }
}

/// One aggregated trade from the per-trade stream.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AggTrade {
    pub price: f64,
    pub qty: f64,
    /// true = the passive side was the buyer, i.e. an aggressive sell.
    pub buyer_is_maker: bool,
    pub time: DateTime<Utc>,
}

impl AggTrade {
    /// Signed volume contribution: aggressive buys positive.
    pub fn signed_qty(&self) -> f64 {
        if self.buyer_is_maker {
            -self.qty
        } else {
            self.qty
        }
    }
}

/// Best bid/ask observed by the tick monitor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tick {
    pub bid: f64,
    pub ask: f64,
    pub time: DateTime<Utc>,
}

impl Tick {
    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }

    pub fn spread(&self) -> f64 {
        (self.ask - self.bid).max(0.0)
    }
}

/// Higher-time-frame trend read from the HTF EMA with a dead band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HtfDirection {
    Up,
    Down,
    #[default]
    Flat,
}

impl HtfDirection {
    /// True when this HTF read forbids entries on `side`.
    pub fn blocks(self, side: Side) -> bool {
        matches!(
            (self, side),
            (HtfDirection::Down, Side::Buy) | (HtfDirection::Up, Side::Sell)
        )
    }
}

/// Exchange trading rules for the instrument, fetched once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolInfo {
    pub symbol: String,
    pub tick_size: f64,
    pub step_size: f64,
    pub min_qty: f64,
    pub min_notional: f64,
    /// Minimum distance (in ticks) the exchange accepts between price and
    /// an attached stop/limit.
    pub min_stops_level_points: u32,
}

impl SymbolInfo {
    pub fn min_stop_distance(&self) -> f64 {
        self.min_stops_level_points as f64 * self.tick_size
    }

    /// Round a quantity down onto the step grid.
    pub fn round_qty(&self, qty: f64) -> f64 {
        if self.step_size <= 0.0 {
            return qty;
        }
        (qty / self.step_size).floor() * self.step_size
    }

    /// Round a price onto the tick grid (nearest).
    pub fn round_price(&self, price: f64) -> f64 {
        if self.tick_size <= 0.0 {
            return price;
        }
        (price / self.tick_size).round() * self.tick_size
    }
}

/// Primary / higher time-frame, fixed at engine start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Timeframe {
    pub seconds: u64,
}

impl Timeframe {
    pub const M1: Timeframe = Timeframe { seconds: 60 };
    pub const M5: Timeframe = Timeframe { seconds: 300 };
    pub const H1: Timeframe = Timeframe { seconds: 3600 };

    pub fn duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.seconds)
    }

    pub fn chrono_duration(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.seconds as i64)
    }

    /// Parse "1m", "5m", "15m", "1h", "4h", "1d".
    pub fn parse(s: &str) -> Option<Timeframe> {
        let s = s.trim();
        if s.len() < 2 {
            return None;
        }
        let (num, unit) = s.split_at(s.len() - 1);
        let n: u64 = num.parse().ok()?;
        let mult = match unit {
            "m" => 60,
            "h" => 3600,
            "d" => 86400,
            _ => return None,
        };
        Some(Timeframe { seconds: n * mult })
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.seconds % 86400 == 0 {
            write!(f, "{}d", self.seconds / 86400)
        } else if self.seconds % 3600 == 0 {
            write!(f, "{}h", self.seconds / 3600)
        } else {
            write!(f, "{}m", self.seconds / 60)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn bar(open: f64, high: f64, low: f64, close: f64) -> Bar {
        Bar {
            open_time: Utc.with_ymd_and_hms(2024, 3, 4, 12, 0, 0).unwrap(),
            open,
            high,
            low,
            close,
            volume: 1.0,
        }
    }

    #[test]
    fn test_bar_geometry() {
        let b = bar(100.0, 110.0, 99.0, 108.0);
        assert!((b.range() - 11.0).abs() < 1e-9);
        assert!((b.body() - 8.0).abs() < 1e-9);
        assert!(b.is_bull());
        assert!((b.body_ratio() - 8.0 / 11.0).abs() < 1e-9);
        assert!((b.close_position() - 9.0 / 11.0).abs() < 1e-9);
        assert!((b.upper_tail() - 2.0).abs() < 1e-9);
        assert!((b.lower_tail() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_zero_range_bar_is_safe() {
        let b = bar(100.0, 100.0, 100.0, 100.0);
        assert_eq!(b.body_ratio(), 0.0);
        assert_eq!(b.close_position(), 0.5);
    }

    #[test]
    fn test_side_sign_and_opposite() {
        assert_eq!(Side::Buy.opposite(), Side::Sell);
        assert_eq!(Side::Buy.sign(), 1.0);
        assert_eq!(Side::Sell.sign(), -1.0);
    }

    #[test]
    fn test_htf_blocks() {
        assert!(HtfDirection::Down.blocks(Side::Buy));
        assert!(HtfDirection::Up.blocks(Side::Sell));
        assert!(!HtfDirection::Flat.blocks(Side::Buy));
        assert!(!HtfDirection::Up.blocks(Side::Buy));
    }

    #[test]
    fn test_symbol_rounding() {
        let info = SymbolInfo {
            symbol: "BTCUSDT".into(),
            tick_size: 0.1,
            step_size: 0.001,
            min_qty: 0.001,
            min_notional: 5.0,
            min_stops_level_points: 30,
        };
        assert!((info.round_qty(0.12345) - 0.123).abs() < 1e-9);
        assert!((info.round_price(100.04) - 100.0).abs() < 1e-9);
        assert!((info.min_stop_distance() - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_timeframe_parse() {
        assert_eq!(Timeframe::parse("5m"), Some(Timeframe::M5));
        assert_eq!(Timeframe::parse("1h"), Some(Timeframe::H1));
        assert_eq!(Timeframe::parse("bogus"), None);
        assert_eq!(Timeframe::M5.to_string(), "5m");
        assert_eq!(Timeframe::H1.to_string(), "1h");
    }
}
