//! Broker-agnostic strategy core.
//!
//! Everything in here is pure market logic: buffers and derived series,
//! swing and push tracking, regime classification, the detector catalogue,
//! the dispatcher that fuses them, and the risk arithmetic. No I/O, no
//! broker calls — the execution layer consumes value snapshots from here.

pub mod bars;
pub mod dispatcher;
pub mod filters;
pub mod hl_counter;
pub mod market_state;
pub mod orderflow;
pub mod risk;
pub mod session;
pub mod signals;
pub mod swings;

pub use bars::{BarSeries, HtfSeries, MarketSnapshot};
pub use dispatcher::{BarEvent, Dispatcher};
pub use market_state::{AlwaysIn, MarketCycle, MarketState, RegimeView};
pub use signals::{Signal, SignalKind};
pub use swings::{LtfSwingTracker, SwingPoint, SwingTracker};
