//! Broker-adapter contract.
//!
//! The engine is exchange-agnostic: everything it needs from a venue is the
//! narrow async trait below. Any futures gateway with server-side stop and
//! limit orders and per-order magic tagging satisfies it. Errors carry a
//! transient/permanent classification so the retry policy can be applied
//! uniformly at the call sites.

pub mod paper;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use thiserror::Error;
use tracing::warn;

use crate::types::{AggTrade, Bar, Side, SymbolInfo, Tick, Timeframe};

pub type OrderId = u64;
pub type PositionId = u64;

/// Spacing between retries of transient broker errors.
pub const RETRY_SPACING: std::time::Duration = std::time::Duration::from_millis(100);
/// Total attempts (first try + retries).
pub const RETRY_ATTEMPTS: u32 = 4;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("requote")]
    Requote,
    #[error("price changed")]
    PriceChanged,
    #[error("trading context locked")]
    Locked,
    #[error("context busy")]
    ContextBusy,
    #[error("request timed out")]
    Timeout,
    #[error("invalid stops: {0}")]
    InvalidStops(String),
    #[error("order rejected: {0}")]
    Rejected(String),
    #[error("unknown order or position: {0}")]
    NotFound(String),
    #[error("transport error: {0}")]
    Transport(String),
}

impl BrokerError {
    /// Errors worth retrying with short spacing; everything else surfaces
    /// to the caller.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BrokerError::Requote
                | BrokerError::PriceChanged
                | BrokerError::Locked
                | BrokerError::ContextBusy
                | BrokerError::Timeout
        )
    }
}

/// A live position as the exchange reports it.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerPosition {
    pub id: PositionId,
    pub side: Side,
    pub qty: f64,
    pub entry_price: f64,
    pub sl: Option<f64>,
    pub tp: Option<f64>,
    pub magic: u32,
    pub open_time: DateTime<Utc>,
}

/// A pending stop/limit order as the exchange reports it.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerOrder {
    pub id: OrderId,
    pub side: Side,
    pub trigger_price: f64,
    pub qty: f64,
    pub sl: Option<f64>,
    pub tp: Option<f64>,
    pub expiry: Option<DateTime<Utc>>,
    pub magic: u32,
}

#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    async fn symbol_info(&self) -> Result<SymbolInfo, BrokerError>;
    async fn best_bid_ask(&self) -> Result<(f64, f64), BrokerError>;
    async fn account_balance(&self) -> Result<f64, BrokerError>;

    /// Bar stream for the given time-frame; one subscription per frame.
    async fn stream_bars(&self, tf: Timeframe) -> Result<BoxStream<'static, Bar>, BrokerError>;
    async fn stream_trades(&self) -> Result<BoxStream<'static, AggTrade>, BrokerError>;
    async fn stream_ticks(&self) -> Result<BoxStream<'static, Tick>, BrokerError>;
    /// Closed bars from `from` onward, for gap backfill after a reconnect.
    async fn fetch_bars(
        &self,
        tf: Timeframe,
        from: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Bar>, BrokerError>;

    async fn place_market(
        &self,
        side: Side,
        qty: f64,
        sl: Option<f64>,
        tp: Option<f64>,
        magic: u32,
    ) -> Result<BrokerPosition, BrokerError>;

    #[allow(clippy::too_many_arguments)]
    async fn place_stop(
        &self,
        side: Side,
        stop_price: f64,
        qty: f64,
        expiry: Option<DateTime<Utc>>,
        sl: Option<f64>,
        tp: Option<f64>,
        magic: u32,
    ) -> Result<OrderId, BrokerError>;

    #[allow(clippy::too_many_arguments)]
    async fn place_limit(
        &self,
        side: Side,
        limit_price: f64,
        qty: f64,
        expiry: Option<DateTime<Utc>>,
        sl: Option<f64>,
        tp: Option<f64>,
        magic: u32,
    ) -> Result<OrderId, BrokerError>;

    async fn modify_position(
        &self,
        id: PositionId,
        sl: Option<f64>,
        tp: Option<f64>,
    ) -> Result<(), BrokerError>;
    /// Close the full position at market; returns the exit price.
    async fn close_position(&self, id: PositionId) -> Result<f64, BrokerError>;
    /// Close part of a position at market; returns the exit price.
    async fn close_partial(&self, id: PositionId, qty: f64) -> Result<f64, BrokerError>;
    async fn cancel_order(&self, id: OrderId) -> Result<(), BrokerError>;

    async fn list_positions(&self, magic: Option<u32>) -> Result<Vec<BrokerPosition>, BrokerError>;
    async fn list_pending_orders(&self, magic: Option<u32>)
        -> Result<Vec<BrokerOrder>, BrokerError>;
}

/// Run a broker call with the standard transient-error retry policy:
/// up to [`RETRY_ATTEMPTS`] tries spaced [`RETRY_SPACING`] apart.
pub async fn with_retry<T, F, Fut>(op: &str, mut call: F) -> Result<T, BrokerError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, BrokerError>>,
{
    let mut attempt = 1;
    loop {
        match call().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < RETRY_ATTEMPTS => {
                warn!(op, attempt, error = %e, "transient broker error, retrying");
                tokio::time::sleep(RETRY_SPACING).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_transient_classification() {
        assert!(BrokerError::Requote.is_transient());
        assert!(BrokerError::PriceChanged.is_transient());
        assert!(BrokerError::Locked.is_transient());
        assert!(BrokerError::ContextBusy.is_transient());
        assert!(BrokerError::Timeout.is_transient());
        assert!(!BrokerError::Rejected("margin".into()).is_transient());
        assert!(!BrokerError::InvalidStops("too close".into()).is_transient());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_from_transient_errors() {
        let calls = AtomicU32::new(0);
        let result = with_retry("test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(BrokerError::Requote)
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up_after_budget() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(BrokerError::ContextBusy) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), RETRY_ATTEMPTS);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(BrokerError::Rejected("disabled symbol".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
