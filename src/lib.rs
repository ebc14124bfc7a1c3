//! Price-action trading engine for a single perpetual-futures instrument,
//! in the Al Brooks methodology.
//!
//! The crate splits into a broker-agnostic strategy core
//! ([`trading_core`]), an execution layer ([`execution`]) driving the
//! abstract [`broker::BrokerAdapter`], stream producers ([`streams`]), and
//! the wiring in [`engine`].

pub mod broker;
pub mod config;
pub mod engine;
pub mod execution;
pub mod journal;
pub mod streams;
pub mod trading_core;
pub mod types;

pub use config::EngineConfig;
pub use trading_core::{BarEvent, Dispatcher, MarketSnapshot, Signal, SignalKind};
pub use types::{Bar, Side, SymbolInfo, Timeframe};
