//! In-memory broker for tests and observe mode.
//!
//! Fills are driven by [`PaperBroker::tick`]: pending stop orders trigger on
//! touch, attached SL/TP levels close positions server-side, and expired
//! pendings are cancelled, mirroring how the live exchange behaves. Streams
//! are fed through channels the caller pushes into.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use tokio::sync::mpsc;

use crate::types::{AggTrade, Bar, Side, SymbolInfo, Tick, Timeframe};

use super::{BrokerAdapter, BrokerError, BrokerOrder, BrokerPosition, OrderId, PositionId};

/// A completed round-trip, for assertions and the observe log.
#[derive(Debug, Clone, PartialEq)]
pub struct ClosedTrade {
    pub position: BrokerPosition,
    pub exit_price: f64,
    pub reason: ClosedReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosedReason {
    StopLoss,
    TakeProfit,
    Manual,
}

#[derive(Default)]
struct PaperState {
    bid: f64,
    ask: f64,
    balance: f64,
    positions: Vec<BrokerPosition>,
    pendings: Vec<BrokerOrder>,
    closed: Vec<ClosedTrade>,
    bar_rxs: Vec<(Timeframe, mpsc::UnboundedReceiver<Bar>)>,
    trade_rx: Option<mpsc::UnboundedReceiver<AggTrade>>,
    tick_rx: Option<mpsc::UnboundedReceiver<Tick>>,
    history: Vec<Bar>,
}

pub struct PaperBroker {
    info: SymbolInfo,
    next_id: AtomicU64,
    state: Mutex<PaperState>,
    bar_txs: Mutex<Vec<(Timeframe, mpsc::UnboundedSender<Bar>)>>,
    trade_tx: mpsc::UnboundedSender<AggTrade>,
    tick_tx: mpsc::UnboundedSender<Tick>,
}

impl PaperBroker {
    pub fn new(info: SymbolInfo, balance: f64) -> Self {
        let (trade_tx, trade_rx) = mpsc::unbounded_channel();
        let (tick_tx, tick_rx) = mpsc::unbounded_channel();
        let state = PaperState {
            balance,
            trade_rx: Some(trade_rx),
            tick_rx: Some(tick_rx),
            ..Default::default()
        };
        Self {
            info,
            next_id: AtomicU64::new(1),
            state: Mutex::new(state),
            bar_txs: Mutex::new(Vec::new()),
            trade_tx,
            tick_tx,
        }
    }

    fn id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn set_quote(&self, bid: f64, ask: f64) {
        let mut s = self.state.lock().unwrap();
        s.bid = bid;
        s.ask = ask;
    }

    /// Register a bar feed for a time-frame; push bars through the returned
    /// sender and they also land in the backfill history.
    pub fn bar_feed(&self, tf: Timeframe) -> mpsc::UnboundedSender<Bar> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().unwrap().bar_rxs.push((tf, rx));
        self.bar_txs.lock().unwrap().push((tf, tx.clone()));
        tx
    }

    pub fn push_history(&self, bar: Bar) {
        self.state.lock().unwrap().history.push(bar);
    }

    pub fn trade_feed(&self) -> mpsc::UnboundedSender<AggTrade> {
        self.trade_tx.clone()
    }

    pub fn tick_feed(&self) -> mpsc::UnboundedSender<Tick> {
        self.tick_tx.clone()
    }

    pub fn closed_trades(&self) -> Vec<ClosedTrade> {
        self.state.lock().unwrap().closed.clone()
    }

    pub fn open_position_count(&self) -> usize {
        self.state.lock().unwrap().positions.len()
    }

    /// Advance the simulated market to `price` at `now`: fill touched
    /// pendings, trigger server-side SL/TP, cancel expired orders.
    pub fn tick(&self, price: f64, now: DateTime<Utc>) {
        let mut s = self.state.lock().unwrap();
        s.bid = price;
        s.ask = price;

        // Expire pendings first: an order that was never touched dies.
        s.pendings.retain(|o| match o.expiry {
            Some(t) => now < t,
            None => true,
        });

        // Fill stop orders on touch.
        let mut filled = Vec::new();
        s.pendings.retain(|o| {
            let touched = match o.side {
                Side::Buy => price >= o.trigger_price,
                Side::Sell => price <= o.trigger_price,
            };
            if touched {
                filled.push(o.clone());
                false
            } else {
                true
            }
        });
        for o in filled {
            let pos = BrokerPosition {
                id: o.id,
                side: o.side,
                qty: o.qty,
                entry_price: o.trigger_price,
                sl: o.sl,
                tp: o.tp,
                magic: o.magic,
                open_time: now,
            };
            s.positions.push(pos);
        }

        // Server-side SL/TP.
        let mut closed = Vec::new();
        s.positions.retain(|p| {
            let sl_hit = p.sl.map(|sl| match p.side {
                Side::Buy => price <= sl,
                Side::Sell => price >= sl,
            });
            let tp_hit = p.tp.map(|tp| match p.side {
                Side::Buy => price >= tp,
                Side::Sell => price <= tp,
            });
            if sl_hit == Some(true) {
                closed.push(ClosedTrade {
                    position: p.clone(),
                    exit_price: p.sl.unwrap(),
                    reason: ClosedReason::StopLoss,
                });
                false
            } else if tp_hit == Some(true) {
                closed.push(ClosedTrade {
                    position: p.clone(),
                    exit_price: p.tp.unwrap(),
                    reason: ClosedReason::TakeProfit,
                });
                false
            } else {
                true
            }
        });
        s.closed.extend(closed);
    }

    fn market_price(&self, side: Side) -> Result<f64, BrokerError> {
        let s = self.state.lock().unwrap();
        let px = match side {
            Side::Buy => s.ask,
            Side::Sell => s.bid,
        };
        if px <= 0.0 {
            return Err(BrokerError::Transport("no market data".into()));
        }
        Ok(px)
    }
}

#[async_trait]
impl BrokerAdapter for PaperBroker {
    async fn symbol_info(&self) -> Result<SymbolInfo, BrokerError> {
        Ok(self.info.clone())
    }

    async fn best_bid_ask(&self) -> Result<(f64, f64), BrokerError> {
        let s = self.state.lock().unwrap();
        if s.bid <= 0.0 || s.ask <= 0.0 {
            return Err(BrokerError::Transport("no market data".into()));
        }
        Ok((s.bid, s.ask))
    }

    async fn account_balance(&self) -> Result<f64, BrokerError> {
        Ok(self.state.lock().unwrap().balance)
    }

    async fn stream_bars(&self, tf: Timeframe) -> Result<BoxStream<'static, Bar>, BrokerError> {
        let mut s = self.state.lock().unwrap();
        let idx = s
            .bar_rxs
            .iter()
            .position(|(t, _)| *t == tf)
            .ok_or_else(|| BrokerError::Transport(format!("no bar feed for {tf}")))?;
        let (_, mut rx) = s.bar_rxs.remove(idx);
        Ok(Box::pin(futures::stream::poll_fn(move |cx| {
            rx.poll_recv(cx)
        })))
    }

    async fn stream_trades(&self) -> Result<BoxStream<'static, AggTrade>, BrokerError> {
        let mut rx = self
            .state
            .lock()
            .unwrap()
            .trade_rx
            .take()
            .ok_or_else(|| BrokerError::Transport("trade stream already taken".into()))?;
        Ok(Box::pin(futures::stream::poll_fn(move |cx| {
            rx.poll_recv(cx)
        })))
    }

    async fn stream_ticks(&self) -> Result<BoxStream<'static, Tick>, BrokerError> {
        let mut rx = self
            .state
            .lock()
            .unwrap()
            .tick_rx
            .take()
            .ok_or_else(|| BrokerError::Transport("tick stream already taken".into()))?;
        Ok(Box::pin(futures::stream::poll_fn(move |cx| {
            rx.poll_recv(cx)
        })))
    }

    async fn fetch_bars(
        &self,
        _tf: Timeframe,
        from: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Bar>, BrokerError> {
        let s = self.state.lock().unwrap();
        Ok(s.history
            .iter()
            .filter(|b| b.open_time >= from)
            .take(limit)
            .copied()
            .collect())
    }

    async fn place_market(
        &self,
        side: Side,
        qty: f64,
        sl: Option<f64>,
        tp: Option<f64>,
        magic: u32,
    ) -> Result<BrokerPosition, BrokerError> {
        if qty < self.info.min_qty {
            return Err(BrokerError::Rejected(format!("qty {qty} below minimum")));
        }
        let price = self.market_price(side)?;
        let pos = BrokerPosition {
            id: self.id(),
            side,
            qty,
            entry_price: price,
            sl,
            tp,
            magic,
            open_time: Utc::now(),
        };
        self.state.lock().unwrap().positions.push(pos.clone());
        Ok(pos)
    }

    async fn place_stop(
        &self,
        side: Side,
        stop_price: f64,
        qty: f64,
        expiry: Option<DateTime<Utc>>,
        sl: Option<f64>,
        tp: Option<f64>,
        magic: u32,
    ) -> Result<OrderId, BrokerError> {
        if qty < self.info.min_qty {
            return Err(BrokerError::Rejected(format!("qty {qty} below minimum")));
        }
        let market = self.market_price(side)?;
        let dist = (stop_price - market).abs();
        if dist < self.info.min_stop_distance() {
            return Err(BrokerError::InvalidStops(format!(
                "stop {stop_price} too close to market {market}"
            )));
        }
        let id = self.id();
        self.state.lock().unwrap().pendings.push(BrokerOrder {
            id,
            side,
            trigger_price: stop_price,
            qty,
            sl,
            tp,
            expiry,
            magic,
        });
        Ok(id)
    }

    async fn place_limit(
        &self,
        side: Side,
        limit_price: f64,
        qty: f64,
        expiry: Option<DateTime<Utc>>,
        sl: Option<f64>,
        tp: Option<f64>,
        magic: u32,
    ) -> Result<OrderId, BrokerError> {
        if qty < self.info.min_qty {
            return Err(BrokerError::Rejected(format!("qty {qty} below minimum")));
        }
        let id = self.id();
        self.state.lock().unwrap().pendings.push(BrokerOrder {
            id,
            side,
            trigger_price: limit_price,
            qty,
            sl,
            tp,
            expiry,
            magic,
        });
        Ok(id)
    }

    async fn modify_position(
        &self,
        id: PositionId,
        sl: Option<f64>,
        tp: Option<f64>,
    ) -> Result<(), BrokerError> {
        let mut s = self.state.lock().unwrap();
        let pos = s
            .positions
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| BrokerError::NotFound(format!("position {id}")))?;
        if sl.is_some() {
            pos.sl = sl;
        }
        if tp.is_some() {
            pos.tp = tp;
        }
        Ok(())
    }

    async fn close_position(&self, id: PositionId) -> Result<f64, BrokerError> {
        let mut s = self.state.lock().unwrap();
        let idx = s
            .positions
            .iter()
            .position(|p| p.id == id)
            .ok_or_else(|| BrokerError::NotFound(format!("position {id}")))?;
        let pos = s.positions.remove(idx);
        let exit = match pos.side {
            Side::Buy => s.bid,
            Side::Sell => s.ask,
        };
        s.closed.push(ClosedTrade {
            position: pos,
            exit_price: exit,
            reason: ClosedReason::Manual,
        });
        Ok(exit)
    }

    async fn close_partial(&self, id: PositionId, qty: f64) -> Result<f64, BrokerError> {
        if qty < self.info.min_qty {
            return Err(BrokerError::Rejected(format!(
                "partial qty {qty} below minimum"
            )));
        }
        let mut s = self.state.lock().unwrap();
        let pos = s
            .positions
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| BrokerError::NotFound(format!("position {id}")))?;
        if qty >= pos.qty {
            return Err(BrokerError::Rejected("partial exceeds position".into()));
        }
        pos.qty -= qty;
        let side = pos.side;
        let snapshot = pos.clone();
        let exit = match side {
            Side::Buy => s.bid,
            Side::Sell => s.ask,
        };
        s.closed.push(ClosedTrade {
            position: BrokerPosition {
                qty,
                ..snapshot
            },
            exit_price: exit,
            reason: ClosedReason::Manual,
        });
        Ok(exit)
    }

    async fn cancel_order(&self, id: OrderId) -> Result<(), BrokerError> {
        let mut s = self.state.lock().unwrap();
        let before = s.pendings.len();
        s.pendings.retain(|o| o.id != id);
        if s.pendings.len() == before {
            return Err(BrokerError::NotFound(format!("order {id}")));
        }
        Ok(())
    }

    async fn list_positions(&self, magic: Option<u32>) -> Result<Vec<BrokerPosition>, BrokerError> {
        let s = self.state.lock().unwrap();
        Ok(s.positions
            .iter()
            .filter(|p| magic.map(|m| p.magic == m).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn list_pending_orders(
        &self,
        magic: Option<u32>,
    ) -> Result<Vec<BrokerOrder>, BrokerError> {
        let s = self.state.lock().unwrap();
        Ok(s.pendings
            .iter()
            .filter(|o| magic.map(|m| o.magic == m).unwrap_or(true))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn info() -> SymbolInfo {
        SymbolInfo {
            symbol: "BTCUSDT".into(),
            tick_size: 0.1,
            step_size: 0.001,
            min_qty: 0.001,
            min_notional: 5.0,
            min_stops_level_points: 30,
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_market_order_fills_at_quote() {
        let b = PaperBroker::new(info(), 10_000.0);
        b.set_quote(99.9, 100.1);
        let pos = b
            .place_market(Side::Buy, 0.5, Some(98.0), Some(104.0), 1001)
            .await
            .unwrap();
        assert!((pos.entry_price - 100.1).abs() < 1e-9);
        assert_eq!(b.open_position_count(), 1);
    }

    #[tokio::test]
    async fn test_stop_order_fills_on_touch() {
        let b = PaperBroker::new(info(), 10_000.0);
        b.set_quote(100.0, 100.0);
        let id = b
            .place_stop(Side::Buy, 105.0, 0.5, None, Some(101.0), None, 1001)
            .await
            .unwrap();
        assert_eq!(b.list_pending_orders(None).await.unwrap().len(), 1);
        b.tick(105.2, t0());
        assert!(b.list_pending_orders(None).await.unwrap().is_empty());
        let pos = &b.list_positions(None).await.unwrap()[0];
        assert_eq!(pos.id, id);
        assert!((pos.entry_price - 105.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_pending_expires_untouched() {
        let b = PaperBroker::new(info(), 10_000.0);
        b.set_quote(100.0, 100.0);
        b.place_stop(
            Side::Buy,
            105.0,
            0.5,
            Some(t0() + chrono::Duration::minutes(5)),
            None,
            None,
            1001,
        )
        .await
        .unwrap();
        // A tick after expiry removes the order without filling it.
        b.tick(104.0, t0() + chrono::Duration::minutes(6));
        assert!(b.list_pending_orders(None).await.unwrap().is_empty());
        assert!(b.list_positions(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_server_side_tp_closes_position() {
        let b = PaperBroker::new(info(), 10_000.0);
        b.set_quote(100.0, 100.0);
        b.place_market(Side::Buy, 0.5, Some(98.0), Some(103.0), 1001)
            .await
            .unwrap();
        b.tick(103.5, t0());
        assert_eq!(b.open_position_count(), 0);
        let closed = b.closed_trades();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].reason, ClosedReason::TakeProfit);
        assert!((closed[0].exit_price - 103.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_min_stop_distance_enforced() {
        let b = PaperBroker::new(info(), 10_000.0);
        b.set_quote(100.0, 100.0);
        // 30 ticks of 0.1 = 3.0 minimum distance.
        let err = b
            .place_stop(Side::Buy, 101.0, 0.5, None, None, None, 1001)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::InvalidStops(_)));
    }

    #[tokio::test]
    async fn test_partial_close_reduces_qty() {
        let b = PaperBroker::new(info(), 10_000.0);
        b.set_quote(100.0, 100.0);
        let pos = b
            .place_market(Side::Buy, 1.0, None, None, 1001)
            .await
            .unwrap();
        b.close_partial(pos.id, 0.4).await.unwrap();
        let open = b.list_positions(None).await.unwrap();
        assert!((open[0].qty - 0.6).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_magic_filter() {
        let b = PaperBroker::new(info(), 10_000.0);
        b.set_quote(100.0, 100.0);
        b.place_market(Side::Buy, 0.5, None, None, 1001).await.unwrap();
        b.place_market(Side::Buy, 0.5, None, None, 1002).await.unwrap();
        assert_eq!(b.list_positions(Some(1001)).await.unwrap().len(), 1);
        assert_eq!(b.list_positions(None).await.unwrap().len(), 2);
    }
}
