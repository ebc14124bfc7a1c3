//! Per-user position lifecycle.
//!
//! One signal becomes two legs — Scalp and Runner — tagged by distinct
//! magic numbers so the exchange can close them independently. The broker
//! only ever sees the hard (disaster) stop; the technical stop is enforced
//! here, on bar close and as a tick-level safety net. The Runner trails
//! structure on the lower time-frame once the Scalp has paid.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::{with_retry, BrokerAdapter, BrokerError, OrderId, PositionId};
use crate::config::EngineConfig;
use crate::journal::{ExitReason, TradeJournal, TradeRecord, TradeStatus};
use crate::trading_core::bars::MarketSnapshot;
use crate::trading_core::market_state::{MarketState, RegimeView};
use crate::trading_core::risk;
use crate::trading_core::session::SessionStatus;
use crate::trading_core::signals::{Signal, SignalKind};
use crate::trading_core::swings::{LtfSwingTracker, SwingTracker};
use crate::types::{Side, SymbolInfo, Tick};

/// Magic numbers tagging the two legs at the exchange. They ARE the
/// cross-leg contract; internally legs also share a parent signal id.
pub const SCALP_MAGIC: u32 = 7301;
pub const RUNNER_MAGIC: u32 = 7302;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Magic {
    Scalp,
    Runner,
}

impl Magic {
    pub fn number(self) -> u32 {
        match self {
            Magic::Scalp => SCALP_MAGIC,
            Magic::Runner => RUNNER_MAGIC,
        }
    }

    pub fn from_number(n: u32) -> Option<Magic> {
        match n {
            SCALP_MAGIC => Some(Magic::Scalp),
            RUNNER_MAGIC => Some(Magic::Runner),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ManagedPosition {
    pub id: PositionId,
    pub signal_id: Uuid,
    pub kind: SignalKind,
    pub side: Side,
    pub magic: Magic,
    pub entry_price: f64,
    pub qty: f64,
    pub technical_stop: f64,
    pub hard_stop: f64,
    pub tp1: Option<f64>,
    pub tp2: Option<f64>,
    pub open_time: DateTime<Utc>,
    pub scalp_closed: bool,
    pub breakeven_applied: bool,
    /// Single-leg fallback: TP1 is taken by a manual partial close.
    pub single_leg: bool,
    pub partial_done: bool,
    pub atr_at_entry: f64,
    /// |entry - technical_stop| at fill time; the hard stop stays widened
    /// by this amount as the technical stop trails.
    pub initial_risk: f64,
    soft_stop_breaches: usize,
}

impl ManagedPosition {
    pub fn risk(&self) -> f64 {
        (self.entry_price - self.technical_stop).abs()
    }

    fn unrealised_r(&self, price: f64) -> f64 {
        let risk = self.risk();
        if risk <= 0.0 {
            return 0.0;
        }
        (price - self.entry_price) * self.side.sign() / risk
    }
}

/// A stop-order entry waiting for its fill or its one-bar expiry.
#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub order_id: OrderId,
    pub signal_id: Uuid,
    pub kind: SignalKind,
    pub side: Side,
    pub magic: Magic,
    pub stop_price: f64,
    pub technical_stop: f64,
    pub hard_stop: f64,
    /// Exchange-attached take-profit (TP1 for the Scalp leg, TP2
    /// otherwise).
    pub tp: Option<f64>,
    /// TP1 taken by manual partial close (single-leg fallback only).
    pub tp1_manual: Option<f64>,
    pub single_leg: bool,
    pub qty: f64,
    pub created_bar: i64,
}

pub struct PositionManager {
    cfg: EngineConfig,
    symbol: SymbolInfo,
    broker: Arc<dyn BrokerAdapter>,
    journal: Arc<dyn TradeJournal>,
    user_id: String,
    positions: Vec<ManagedPosition>,
    pendings: Vec<PendingEntry>,
    bar_counter: i64,
    pub last_entry_bar: [i64; 2],
    pub last_entry_price: [f64; 2],
}

impl PositionManager {
    pub fn new(
        cfg: EngineConfig,
        symbol: SymbolInfo,
        broker: Arc<dyn BrokerAdapter>,
        journal: Arc<dyn TradeJournal>,
        user_id: String,
    ) -> Self {
        Self {
            cfg,
            symbol,
            broker,
            journal,
            user_id,
            positions: Vec::new(),
            pendings: Vec::new(),
            bar_counter: 0,
            last_entry_bar: [i64::MIN / 2; 2],
            last_entry_price: [0.0; 2],
        }
    }

    pub fn positions(&self) -> &[ManagedPosition] {
        &self.positions
    }

    pub fn pendings(&self) -> &[PendingEntry] {
        &self.pendings
    }

    pub fn has_opposing_position(&self, side: Side) -> bool {
        self.positions.iter().any(|p| p.side == side.opposite())
    }

    pub fn open_count(&self, side: Side) -> usize {
        self.positions.iter().filter(|p| p.side == side).count()
    }

    // ------------------------------------------------------------------
    // Submission
    // ------------------------------------------------------------------

    /// Submit a signal as a twin (or fallback single-leg) entry.
    /// Returns true when at least one order reached the broker.
    pub async fn submit(
        &mut self,
        signal: &Signal,
        qty: f64,
        snap: &MarketSnapshot,
        regime: &RegimeView,
        now: DateTime<Utc>,
    ) -> Result<bool, BrokerError> {
        if self.has_opposing_position(signal.side) {
            info!(
                user = %self.user_id, kind = %signal.kind,
                "opposing position open; signal dropped"
            );
            return Ok(false);
        }
        if self.open_count(signal.side) >= self.cfg.max_positions_per_user {
            info!(user = %self.user_id, kind = %signal.kind, "position cap reached; signal dropped");
            return Ok(false);
        }

        let market_entry = matches!(
            signal.kind,
            SignalKind::SpikeMarketBuy | SignalKind::SpikeMarketSell
        );

        let (bid, ask) = self.broker.best_bid_ask().await?;
        let entry_price = if market_entry {
            match signal.side {
                Side::Buy => ask,
                Side::Sell => bid,
            }
        } else {
            match signal.side {
                Side::Buy => signal.signal_bar_high + self.symbol.tick_size,
                Side::Sell => signal.signal_bar_low - self.symbol.tick_size,
            }
        };

        let technical_stop = signal.technical_stop;
        let hard = risk::hard_stop(
            signal.side,
            entry_price,
            technical_stop,
            self.cfg.hard_stop_buffer,
            &self.symbol,
            self.cfg.min_stops_level_points,
        );
        let (tp1, tp2) = risk::take_profits(
            signal.side,
            entry_price,
            technical_stop,
            snap,
            regime,
            self.cfg.tp1_scalp_r,
            self.cfg.runner_tp2_min_atr,
        );

        if !market_entry {
            // Never chase: the entry trigger must clear the market and the
            // attached levels by the exchange minimum, or the signal is
            // skipped outright.
            let min_dist = self
                .symbol
                .min_stop_distance()
                .max(self.cfg.min_stops_level_points as f64 * self.symbol.tick_size);
            let market = match signal.side {
                Side::Buy => ask,
                Side::Sell => bid,
            };
            if (entry_price - market).abs() < min_dist
                || (entry_price - hard).abs() < min_dist
                || (entry_price - tp1).abs() < min_dist
            {
                info!(
                    user = %self.user_id, kind = %signal.kind, entry_price, market,
                    "entry too close to market or levels; skipping (no chasing)"
                );
                return Ok(false);
            }
        }

        let leg_qty = self.symbol.round_qty(qty / 2.0);
        let twin_possible =
            leg_qty >= self.symbol.min_qty && leg_qty * entry_price >= self.symbol.min_notional;

        let signal_id = Uuid::new_v4();
        let sl_for_broker = self.cfg.hard_stop.then_some(hard);
        let expiry = (!market_entry).then(|| now + self.cfg.primary_tf.chrono_duration());

        let placed = if twin_possible {
            self.submit_twin(
                signal,
                signal_id,
                entry_price,
                leg_qty,
                technical_stop,
                hard,
                tp1,
                tp2,
                sl_for_broker,
                expiry,
                market_entry,
                now,
            )
            .await?
        } else {
            self.submit_single(
                signal,
                signal_id,
                entry_price,
                qty,
                technical_stop,
                hard,
                tp1,
                tp2,
                sl_for_broker,
                expiry,
                market_entry,
                now,
            )
            .await?
        };

        if placed {
            self.last_entry_bar[signal.side.index()] = self.bar_counter;
            self.last_entry_price[signal.side.index()] = entry_price;
        }
        Ok(placed)
    }

    #[allow(clippy::too_many_arguments)]
    async fn submit_twin(
        &mut self,
        signal: &Signal,
        signal_id: Uuid,
        entry_price: f64,
        leg_qty: f64,
        technical_stop: f64,
        hard: f64,
        tp1: f64,
        tp2: f64,
        sl_for_broker: Option<f64>,
        expiry: Option<DateTime<Utc>>,
        market_entry: bool,
        now: DateTime<Utc>,
    ) -> Result<bool, BrokerError> {
        if market_entry {
            let broker = &self.broker;
            let scalp = with_retry("place_market scalp", || {
                broker.place_market(signal.side, leg_qty, sl_for_broker, Some(tp1), SCALP_MAGIC)
            })
            .await?;
            let runner = match with_retry("place_market runner", || {
                broker.place_market(signal.side, leg_qty, sl_for_broker, Some(tp2), RUNNER_MAGIC)
            })
            .await
            {
                Ok(p) => p,
                Err(e) => {
                    // Twin contract: both legs or neither.
                    warn!(user = %self.user_id, error = %e, "runner leg failed; rolling back scalp");
                    let _ = self.broker.close_position(scalp.id).await;
                    return Err(e);
                }
            };
            for (pos, magic, tp) in [(scalp, Magic::Scalp, tp1), (runner, Magic::Runner, tp2)] {
                self.adopt_fill(
                    pos.id,
                    signal_id,
                    signal.kind,
                    magic,
                    pos.entry_price,
                    leg_qty,
                    technical_stop,
                    hard,
                    tp,
                    false,
                    now,
                )
                .await;
            }
            return Ok(true);
        }

        let broker = &self.broker;
        let scalp_id = with_retry("place_stop scalp", || {
            broker.place_stop(
                signal.side,
                entry_price,
                leg_qty,
                expiry,
                sl_for_broker,
                Some(tp1),
                SCALP_MAGIC,
            )
        })
        .await?;
        let runner_id = match with_retry("place_stop runner", || {
            broker.place_stop(
                signal.side,
                entry_price,
                leg_qty,
                expiry,
                sl_for_broker,
                Some(tp2),
                RUNNER_MAGIC,
            )
        })
        .await
        {
            Ok(id) => id,
            Err(e) => {
                warn!(user = %self.user_id, error = %e, "runner order failed; cancelling scalp order");
                let _ = self.broker.cancel_order(scalp_id).await;
                return Err(e);
            }
        };

        for (order_id, magic, tp) in [
            (scalp_id, Magic::Scalp, Some(tp1)),
            (runner_id, Magic::Runner, Some(tp2)),
        ] {
            self.pendings.push(PendingEntry {
                order_id,
                signal_id,
                kind: signal.kind,
                side: signal.side,
                magic,
                stop_price: entry_price,
                technical_stop,
                hard_stop: hard,
                tp,
                tp1_manual: None,
                single_leg: false,
                qty: leg_qty,
                created_bar: self.bar_counter,
            });
        }
        info!(
            user = %self.user_id, kind = %signal.kind, entry_price, technical_stop, hard_stop = hard,
            tp1, tp2, "twin stop orders placed"
        );
        Ok(true)
    }

    #[allow(clippy::too_many_arguments)]
    async fn submit_single(
        &mut self,
        signal: &Signal,
        signal_id: Uuid,
        entry_price: f64,
        qty: f64,
        technical_stop: f64,
        hard: f64,
        tp1: f64,
        tp2: f64,
        sl_for_broker: Option<f64>,
        expiry: Option<DateTime<Utc>>,
        market_entry: bool,
        now: DateTime<Utc>,
    ) -> Result<bool, BrokerError> {
        let qty = self.symbol.round_qty(qty);
        if qty < self.symbol.min_qty {
            warn!(user = %self.user_id, qty, "quantity below minimum; signal dropped");
            return Ok(false);
        }
        // One leg only: the broker carries TP2; TP1 becomes a manual
        // partial close handled on bar close.
        if market_entry {
            let broker = &self.broker;
            let pos = with_retry("place_market single", || {
                broker.place_market(signal.side, qty, sl_for_broker, Some(tp2), RUNNER_MAGIC)
            })
            .await?;
            self.adopt_fill(
                pos.id,
                signal_id,
                signal.kind,
                Magic::Runner,
                pos.entry_price,
                qty,
                technical_stop,
                hard,
                tp2,
                true,
                now,
            )
            .await;
            // Remember TP1 on the managed position for the manual partial.
            if let Some(p) = self.positions.last_mut() {
                p.tp1 = Some(tp1);
            }
            return Ok(true);
        }
        let broker = &self.broker;
        let order_id = with_retry("place_stop single", || {
            broker.place_stop(
                signal.side,
                entry_price,
                qty,
                expiry,
                sl_for_broker,
                Some(tp2),
                RUNNER_MAGIC,
            )
        })
        .await?;
        self.pendings.push(PendingEntry {
            order_id,
            signal_id,
            kind: signal.kind,
            side: signal.side,
            magic: Magic::Runner,
            stop_price: entry_price,
            technical_stop,
            hard_stop: hard,
            tp: Some(tp2),
            tp1_manual: Some(tp1),
            single_leg: true,
            qty,
            created_bar: self.bar_counter,
        });
        Ok(true)
    }

    /// Register a confirmed fill as a managed position, re-deriving the
    /// technical stop against the actual fill price and tightening the
    /// broker-side hard stop when that helps.
    #[allow(clippy::too_many_arguments)]
    async fn adopt_fill(
        &mut self,
        id: PositionId,
        signal_id: Uuid,
        kind: SignalKind,
        magic: Magic,
        fill_price: f64,
        qty: f64,
        technical_stop: f64,
        hard_stop: f64,
        tp: f64,
        single_leg: bool,
        now: DateTime<Utc>,
    ) {
        let pos = ManagedPosition {
            id,
            signal_id,
            kind,
            side: kind.side(),
            magic,
            entry_price: fill_price,
            qty,
            technical_stop,
            hard_stop,
            tp1: (magic == Magic::Scalp).then_some(tp),
            tp2: (magic == Magic::Runner).then_some(tp),
            open_time: now,
            scalp_closed: false,
            breakeven_applied: false,
            single_leg,
            partial_done: false,
            atr_at_entry: 0.0,
            initial_risk: (fill_price - technical_stop).abs(),
            soft_stop_breaches: 0,
        };
        self.journal
            .record(&TradeRecord {
                signal_id,
                user_id: self.user_id.clone(),
                signal_kind: kind.as_str().to_string(),
                side: pos.side,
                entry_price: fill_price,
                qty,
                technical_stop,
                hard_stop,
                tp1: pos.tp1,
                tp2: pos.tp2,
                exit_price: None,
                exit_reason: None,
                pnl_realised: None,
                status: TradeStatus::Open,
                open_time: now,
                close_time: None,
            })
            .await;
        self.positions.push(pos);
    }

    // ------------------------------------------------------------------
    // Per-bar pipeline
    // ------------------------------------------------------------------

    /// The per-bar order of work: broker sync, climax exit, breakeven and
    /// trailing, soft-stop evaluation, pending expiry, fill adoption.
    /// Signal submission happens afterwards, from the orchestrator.
    pub async fn on_new_bar(
        &mut self,
        snap: &MarketSnapshot,
        regime: &RegimeView,
        ltf: &LtfSwingTracker,
        swings: &SwingTracker,
        session: SessionStatus,
        now: DateTime<Utc>,
    ) {
        self.bar_counter += 1;

        self.sync_with_broker(snap, swings, now).await;
        self.climax_exit(snap, regime, now).await;
        self.breakeven_and_trailing(snap, ltf, now).await;
        self.soft_stop_on_close(snap, now).await;
        self.cancel_expired_pendings().await;
        self.adopt_pending_fills(snap, swings, now).await;

        if session.is_friday_close {
            self.friday_close(snap, regime, now).await;
        }
    }

    /// Tick safety net: close on a best-price breach of the technical
    /// stop. No structural updates happen here.
    pub async fn on_tick(&mut self, tick: Tick, now: DateTime<Utc>) {
        let breached: Vec<PositionId> = self
            .positions
            .iter()
            .filter(|p| match p.side {
                Side::Buy => tick.bid < p.technical_stop,
                Side::Sell => tick.ask > p.technical_stop,
            })
            .map(|p| p.id)
            .collect();
        for id in breached {
            self.close_managed(id, ExitReason::SoftStop, now).await;
        }
    }

    async fn sync_with_broker(
        &mut self,
        snap: &MarketSnapshot,
        swings: &SwingTracker,
        now: DateTime<Utc>,
    ) {
        let live = match self.broker.list_positions(None).await {
            Ok(v) => v,
            Err(e) => {
                warn!(user = %self.user_id, error = %e, "position sync failed; keeping local view");
                return;
            }
        };

        // Tracked positions the broker no longer has were closed
        // server-side (TP/hard stop). Infer the reason from the bar.
        let gone: Vec<ManagedPosition> = self
            .positions
            .iter()
            .filter(|p| !live.iter().any(|l| l.id == p.id))
            .cloned()
            .collect();
        for p in &gone {
            let (reason, exit) = self.infer_server_close(p, snap);
            self.journal_close(p, exit, reason, p.qty, now).await;
            info!(user = %self.user_id, kind = %p.kind, ?reason, exit, "position closed server-side");
        }
        self.positions.retain(|p| live.iter().any(|l| l.id == p.id));

        // Scalp leg gone while its Runner lives: stage two begins.
        let closed_scalps: Vec<Uuid> = gone
            .iter()
            .filter(|p| p.magic == Magic::Scalp)
            .map(|p| p.signal_id)
            .collect();
        for p in self.positions.iter_mut() {
            if p.magic == Magic::Runner && closed_scalps.contains(&p.signal_id) {
                p.scalp_closed = true;
            }
        }

        // Adopt unknown broker positions carrying our magics (restart
        // recovery): reconstruct the stops from current structure.
        let unknown: Vec<_> = live
            .iter()
            .filter(|l| {
                Magic::from_number(l.magic).is_some()
                    && !self.positions.iter().any(|p| p.id == l.id)
                    && !self.pendings.iter().any(|o| o.order_id == l.id)
            })
            .cloned()
            .collect();
        for l in unknown {
            let magic = Magic::from_number(l.magic).unwrap();
            let tech = risk::brooks_stop(
                l.side,
                l.entry_price,
                snap,
                swings,
                snap.spread,
                self.cfg.max_stop_atr,
                false,
                true,
            )
            .unwrap_or_else(|| l.entry_price - l.side.sign() * snap.atr.max(1e-9));
            let hard = risk::hard_stop(
                l.side,
                l.entry_price,
                tech,
                self.cfg.hard_stop_buffer,
                &self.symbol,
                self.cfg.min_stops_level_points,
            );
            info!(user = %self.user_id, id = l.id, ?magic, "adopting unmanaged position from broker");
            self.positions.push(ManagedPosition {
                id: l.id,
                signal_id: Uuid::new_v4(),
                kind: match l.side {
                    Side::Buy => SignalKind::H2Buy,
                    Side::Sell => SignalKind::L2Sell,
                },
                side: l.side,
                magic,
                entry_price: l.entry_price,
                qty: l.qty,
                technical_stop: tech,
                hard_stop: hard,
                tp1: (magic == Magic::Scalp).then_some(l.tp.unwrap_or(0.0)),
                tp2: (magic == Magic::Runner).then(|| l.tp.unwrap_or(0.0)),
                open_time: l.open_time,
                scalp_closed: false,
                breakeven_applied: false,
                single_leg: false,
                partial_done: false,
                atr_at_entry: snap.atr,
                initial_risk: (l.entry_price - tech).abs(),
                soft_stop_breaches: 0,
            });
        }
    }

    fn infer_server_close(&self, p: &ManagedPosition, snap: &MarketSnapshot) -> (ExitReason, f64) {
        if snap.is_empty() {
            return (ExitReason::Manual, p.entry_price);
        }
        let b = snap.bar(1);
        let tp = p.tp1.or(p.tp2);
        if let Some(tp) = tp {
            let hit = match p.side {
                Side::Buy => b.high >= tp,
                Side::Sell => b.low <= tp,
            };
            if hit {
                let reason = if p.magic == Magic::Scalp {
                    ExitReason::Tp1Partial
                } else {
                    ExitReason::Tp2
                };
                return (reason, tp);
            }
        }
        (ExitReason::StopLoss, p.hard_stop)
    }

    /// Runner climax exit: inside a tight channel, an outsized body
    /// touching the channel extreme is taken as terminal — pay the Runner.
    async fn climax_exit(&mut self, snap: &MarketSnapshot, regime: &RegimeView, now: DateTime<Utc>) {
        if regime.state != MarketState::TightChannel || snap.len() < 7 {
            return;
        }
        let b = snap.bar(1);
        let mean_body = snap.mean_body(2, 5);
        if mean_body <= 0.0 || b.body() <= mean_body * 3.0 {
            return;
        }
        let extreme = regime.tight_channel_extreme;
        if extreme <= 0.0 {
            return;
        }
        let touches = match regime.tight_channel_dir {
            Some(Side::Buy) => b.high >= extreme,
            Some(Side::Sell) => b.low <= extreme,
            None => false,
        };
        if !touches {
            return;
        }
        let runners: Vec<PositionId> = self
            .positions
            .iter()
            .filter(|p| p.magic == Magic::Runner)
            .map(|p| p.id)
            .collect();
        for id in runners {
            info!(user = %self.user_id, id, "climax bar at channel extreme; closing runner");
            self.close_managed(id, ExitReason::ClimaxExit, now).await;
        }
    }

    async fn breakeven_and_trailing(
        &mut self,
        snap: &MarketSnapshot,
        ltf: &LtfSwingTracker,
        now: DateTime<Utc>,
    ) {
        if snap.atr <= 0.0 {
            // Cold buffers: no trailing decisions.
            return;
        }
        let atr = snap.atr;
        let price = snap.bar(1).close;

        // Manual TP1 partial for single-leg fallbacks.
        let partials: Vec<(PositionId, f64, f64)> = self
            .positions
            .iter()
            .filter(|p| p.single_leg && !p.partial_done)
            .filter_map(|p| {
                let tp1 = p.tp1?;
                let hit = match p.side {
                    Side::Buy => snap.bar(1).high >= tp1,
                    Side::Sell => snap.bar(1).low <= tp1,
                };
                hit.then(|| {
                    let part = self.symbol.round_qty(p.qty * self.cfg.tp1_close_pct / 100.0);
                    (p.id, part, tp1)
                })
            })
            .collect();
        for (id, part_qty, tp1) in partials {
            if part_qty < self.symbol.min_qty {
                // Too small to split legally; wait for the full exit.
                debug!(user = %self.user_id, id, part_qty, "partial below min qty; deferred");
                continue;
            }
            match self.broker.close_partial(id, part_qty).await {
                Ok(exit) => {
                    if let Some(p) = self.positions.iter_mut().find(|p| p.id == id) {
                        p.partial_done = true;
                        p.qty -= part_qty;
                        p.scalp_closed = true;
                    }
                    let p = self.positions.iter().find(|p| p.id == id).cloned();
                    if let Some(p) = p {
                        self.journal_close(&p, exit, ExitReason::Tp1Partial, part_qty, now)
                            .await;
                    }
                    info!(user = %self.user_id, id, tp1, "manual TP1 partial executed");
                }
                Err(e) => warn!(user = %self.user_id, id, error = %e, "partial close failed"),
            }
        }

        let mut updates: Vec<(PositionId, f64)> = Vec::new();
        for p in &self.positions {
            if p.magic != Magic::Runner {
                continue;
            }

            // Breakeven promotion: once the Scalp has paid (or, single-leg,
            // once profit reaches 1.2R), the Runner cannot be allowed to
            // turn into a loss.
            if !p.breakeven_applied {
                let promote = if p.single_leg {
                    p.unrealised_r(price) >= 1.2
                } else {
                    p.scalp_closed
                };
                if promote {
                    let be = p.entry_price;
                    let improves = match p.side {
                        Side::Buy => be > p.technical_stop,
                        Side::Sell => be < p.technical_stop,
                    };
                    if improves {
                        updates.push((p.id, be));
                        continue;
                    }
                }
                // No trailing before breakeven.
                continue;
            }

            // Structural trailing on the lower time-frame.
            let structural = match p.side {
                Side::Buy => ltf.structural_stop_buy(p.entry_price, p.technical_stop, atr),
                Side::Sell => ltf.structural_stop_sell(p.entry_price, p.technical_stop, atr),
            };
            if structural > 0.0 {
                updates.push((p.id, structural));
            }
        }

        for (id, new_tech) in updates {
            self.apply_stop_update(id, new_tech).await;
        }
    }

    async fn apply_stop_update(&mut self, id: PositionId, new_tech: f64) {
        let Some(p) = self.positions.iter_mut().find(|p| p.id == id) else {
            return;
        };
        let was_breakeven_target = (new_tech - p.entry_price).abs() < f64::EPSILON;
        p.technical_stop = new_tech;
        // Re-widen from the trailed technical stop by the entry-time risk
        // buffer; the entry-distance floor only applies at submission.
        let widen = p.initial_risk * (self.cfg.hard_stop_buffer - 1.0).max(0.0);
        let new_hard = self.symbol.round_price(new_tech - p.side.sign() * widen);
        p.hard_stop = new_hard;
        if was_breakeven_target {
            p.breakeven_applied = true;
        }
        let side = p.side;
        let hard_enabled = self.cfg.hard_stop;
        debug!(user = %self.user_id, id, new_tech, new_hard, ?side, "stop updated");
        if hard_enabled {
            let broker = &self.broker;
            match with_retry("modify_position", || {
                broker.modify_position(id, Some(new_hard), None)
            })
            .await
            {
                Ok(()) => {}
                Err(BrokerError::InvalidStops(_)) => {
                    // Exit-side stop too close for the exchange: widen to
                    // the minimum legal distance and retry once.
                    if let Ok((bid, ask)) = self.broker.best_bid_ask().await {
                        let price = match side {
                            Side::Buy => bid,
                            Side::Sell => ask,
                        };
                        let widened = self
                            .symbol
                            .round_price(price - side.sign() * self.symbol.min_stop_distance());
                        if let Err(e) = self.broker.modify_position(id, Some(widened), None).await {
                            warn!(user = %self.user_id, id, error = %e, "widened stop modify failed");
                        } else if let Some(p) = self.positions.iter_mut().find(|p| p.id == id) {
                            p.hard_stop = widened;
                        }
                    }
                }
                Err(e) => warn!(user = %self.user_id, id, error = %e, "hard stop modify failed"),
            }
        }
    }

    async fn soft_stop_on_close(&mut self, snap: &MarketSnapshot, now: DateTime<Utc>) {
        if !self.cfg.soft_stop || snap.is_empty() {
            return;
        }
        let b = *snap.bar(1);
        let mode = self.cfg.soft_stop_mode;
        let need = self.cfg.soft_stop_bars.max(1);

        let mut to_close = Vec::new();
        for p in self.positions.iter_mut() {
            let breached = match mode {
                // Mode 1: the bar's body extends beyond the stop.
                1 => match p.side {
                    Side::Buy => b.open.min(b.close) < p.technical_stop,
                    Side::Sell => b.open.max(b.close) > p.technical_stop,
                },
                // Modes 0 and 2: close beyond the stop.
                _ => match p.side {
                    Side::Buy => b.close < p.technical_stop,
                    Side::Sell => b.close > p.technical_stop,
                },
            };
            if mode == 2 {
                if breached {
                    p.soft_stop_breaches += 1;
                } else {
                    p.soft_stop_breaches = 0;
                }
                if p.soft_stop_breaches >= need {
                    to_close.push(p.id);
                }
            } else if breached {
                to_close.push(p.id);
            }
        }
        for id in to_close {
            info!(user = %self.user_id, id, "soft stop triggered on bar close");
            self.close_managed(id, ExitReason::SoftStop, now).await;
        }
    }

    async fn cancel_expired_pendings(&mut self) {
        // One bar of life: an untouched stop order is stale by the next
        // close. The exchange-side expiry is the first line; this is the
        // local double-enforcement. Orders that already left the broker's
        // book stay tracked here so the fill-adoption step can resolve
        // them.
        if self.pendings.is_empty() {
            return;
        }
        let live = match self.broker.list_pending_orders(None).await {
            Ok(v) => v,
            Err(e) => {
                warn!(user = %self.user_id, error = %e, "pending sync failed; expiry deferred");
                return;
            }
        };
        let mut keep = Vec::new();
        for o in std::mem::take(&mut self.pendings) {
            let expired = self.bar_counter > o.created_bar;
            let still_live = live.iter().any(|l| l.id == o.order_id);
            if expired && still_live {
                match self.broker.cancel_order(o.order_id).await {
                    Ok(()) => {
                        info!(user = %self.user_id, order = o.order_id, "expired entry order cancelled")
                    }
                    Err(BrokerError::NotFound(_)) => {}
                    Err(e) => {
                        warn!(user = %self.user_id, order = o.order_id, error = %e, "cancel failed")
                    }
                }
            } else {
                keep.push(o);
            }
        }
        self.pendings = keep;
    }

    async fn adopt_pending_fills(
        &mut self,
        snap: &MarketSnapshot,
        swings: &SwingTracker,
        now: DateTime<Utc>,
    ) {
        if self.pendings.is_empty() {
            return;
        }
        let live_orders = match self.broker.list_pending_orders(None).await {
            Ok(v) => v,
            Err(e) => {
                warn!(user = %self.user_id, error = %e, "pending sync failed");
                return;
            }
        };
        let live_positions = match self.broker.list_positions(None).await {
            Ok(v) => v,
            Err(e) => {
                warn!(user = %self.user_id, error = %e, "position sync failed");
                return;
            }
        };

        let filled: Vec<PendingEntry> = self
            .pendings
            .iter()
            .filter(|o| !live_orders.iter().any(|l| l.id == o.order_id))
            .cloned()
            .collect();
        self.pendings
            .retain(|o| live_orders.iter().any(|l| l.id == o.order_id));

        for o in filled {
            let Some(pos) = live_positions.iter().find(|p| p.id == o.order_id) else {
                // Cancelled or expired server-side without a fill.
                debug!(user = %self.user_id, order = o.order_id, "pending order gone without fill");
                continue;
            };
            // Re-derive the technical stop against the actual fill price;
            // take it only when it tightens.
            let mut tech = o.technical_stop;
            if let Some(refit) = risk::brooks_stop(
                o.side,
                pos.entry_price,
                snap,
                swings,
                snap.spread,
                self.cfg.max_stop_atr,
                false,
                true,
            ) {
                let tighter = match o.side {
                    Side::Buy => refit > tech,
                    Side::Sell => refit < tech,
                };
                if tighter {
                    tech = refit;
                }
            }
            let hard = risk::hard_stop(
                o.side,
                pos.entry_price,
                tech,
                self.cfg.hard_stop_buffer,
                &self.symbol,
                self.cfg.min_stops_level_points,
            );
            if self.cfg.hard_stop && (hard - o.hard_stop).abs() > self.symbol.tick_size {
                let broker = &self.broker;
                let id = pos.id;
                if let Err(e) = with_retry("modify_position fill", || {
                    broker.modify_position(id, Some(hard), None)
                })
                .await
                {
                    warn!(user = %self.user_id, id, error = %e, "post-fill stop modify failed");
                }
            }
            info!(
                user = %self.user_id, kind = %o.kind, fill = pos.entry_price, tech,
                "stop order filled"
            );
            self.adopt_fill(
                pos.id,
                o.signal_id,
                o.kind,
                o.magic,
                pos.entry_price,
                o.qty,
                tech,
                hard,
                o.tp.unwrap_or(0.0),
                o.single_leg,
                now,
            )
            .await;
            if o.single_leg {
                if let Some(p) = self.positions.last_mut() {
                    p.tp1 = o.tp1_manual;
                }
            }
        }
    }

    /// Friday review: anything without enough open profit, or sitting in a
    /// weak regime, is flattened; strong winners get a breakeven stop and
    /// ride the weekend.
    async fn friday_close(&mut self, snap: &MarketSnapshot, regime: &RegimeView, now: DateTime<Utc>) {
        if snap.is_empty() {
            return;
        }
        let price = snap.bar(1).close;
        let tr_narrow = regime.tr_high > regime.tr_low
            && snap.atr > 0.0
            && (regime.tr_high - regime.tr_low) < snap.atr * 2.0;

        let mut to_close = Vec::new();
        let mut to_breakeven = Vec::new();
        for p in &self.positions {
            let r = p.unrealised_r(price);
            let strong = regime.state == MarketState::StrongTrend;
            if r < self.cfg.friday_min_r_to_hold || !strong || tr_narrow {
                to_close.push(p.id);
            } else {
                let be_dist = (snap.atr * self.cfg.breakeven_atr_mult)
                    .max(self.cfg.breakeven_points as f64 * self.symbol.tick_size);
                to_breakeven.push((p.id, p.entry_price + p.side.sign() * be_dist));
            }
        }
        for id in to_close {
            info!(user = %self.user_id, id, "friday close-out");
            self.close_managed(id, ExitReason::WeekendClose, now).await;
        }
        for (id, stop) in to_breakeven {
            self.apply_stop_update(id, stop).await;
        }
        // Entry orders don't survive the weekend either.
        for o in std::mem::take(&mut self.pendings) {
            let _ = self.broker.cancel_order(o.order_id).await;
        }
    }

    async fn close_managed(&mut self, id: PositionId, reason: ExitReason, now: DateTime<Utc>) {
        let Some(idx) = self.positions.iter().position(|p| p.id == id) else {
            return;
        };
        let p = self.positions.remove(idx);
        let broker = &self.broker;
        match with_retry("close_position", || broker.close_position(id)).await {
            Ok(exit) => {
                self.journal_close(&p, exit, reason, p.qty, now).await;
            }
            Err(BrokerError::NotFound(_)) => {
                // Already gone server-side; tracking entry removed.
                debug!(user = %self.user_id, id, "close raced a server-side exit");
            }
            Err(e) => {
                warn!(user = %self.user_id, id, error = %e, "close failed; restoring tracking");
                self.positions.push(p);
            }
        }
    }

    async fn journal_close(
        &self,
        p: &ManagedPosition,
        exit_price: f64,
        reason: ExitReason,
        qty: f64,
        now: DateTime<Utc>,
    ) {
        let pnl = (exit_price - p.entry_price) * p.side.sign() * qty;
        let status = if reason == ExitReason::Tp1Partial && p.single_leg {
            TradeStatus::Partial
        } else {
            TradeStatus::Closed
        };
        self.journal
            .record(&TradeRecord {
                signal_id: p.signal_id,
                user_id: self.user_id.clone(),
                signal_kind: p.kind.as_str().to_string(),
                side: p.side,
                entry_price: p.entry_price,
                qty,
                technical_stop: p.technical_stop,
                hard_stop: p.hard_stop,
                tp1: p.tp1,
                tp2: p.tp2,
                exit_price: Some(exit_price),
                exit_reason: Some(reason),
                pnl_realised: Some(pnl),
                status,
                open_time: p.open_time,
                close_time: Some(now),
            })
            .await;
    }

    /// Close every open position and cancel every pending entry. Used for
    /// engine-level close requests and shutdown.
    pub async fn flatten_all(&mut self, reason: ExitReason, now: DateTime<Utc>) {
        let ids: Vec<PositionId> = self.positions.iter().map(|p| p.id).collect();
        for id in ids {
            self.close_managed(id, reason, now).await;
        }
        for o in std::mem::take(&mut self.pendings) {
            if let Err(e) = self.broker.cancel_order(o.order_id).await {
                if !matches!(e, BrokerError::NotFound(_)) {
                    warn!(user = %self.user_id, order = o.order_id, error = %e, "cancel failed");
                }
            }
        }
    }

    /// Cooldown gate consulted by the orchestrator before submission:
    /// bars-since-entry plus the movement override.
    pub fn entry_cooldown_passed(&self, side: Side, price: f64, snap: &MarketSnapshot) -> bool {
        let idx = side.index();
        if self.bar_counter - self.last_entry_bar[idx] >= self.cfg.signal_cooldown {
            return true;
        }
        if self.last_entry_price[idx] <= 0.0 || snap.atr <= 0.0 {
            return false;
        }
        let moved = (price - self.last_entry_price[idx]).abs();
        if moved >= snap.atr * 1.5 {
            return true;
        }
        let n = ((self.cfg.signal_cooldown + 2) as usize).min(snap.len());
        if n == 0 {
            return false;
        }
        snap.highest(n) - snap.lowest(n) >= snap.atr * 2.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::paper::{ClosedReason, PaperBroker};
    use crate::journal::MemoryJournal;
    use crate::trading_core::bars::BarSeries;
    use crate::trading_core::market_state::{AlwaysIn, MarketCycle};
    use crate::types::Bar;
    use chrono::TimeZone;

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

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 12, 0, 0).unwrap()
    }

    fn regime(state: MarketState) -> RegimeView {
        RegimeView {
            state,
            cycle: MarketCycle::Channel,
            always_in: AlwaysIn::Neutral,
            trend_direction: None,
            trend_strength: 0.0,
            tight_channel_dir: None,
            tight_channel_extreme: 0.0,
            tr_high: 0.0,
            tr_low: 0.0,
        }
    }

    fn warm_series() -> BarSeries {
        let mut s = BarSeries::new(256, 20, 20);
        for i in 0..25 {
            s.on_primary_bar_close(Bar {
                open_time: t0() + chrono::Duration::minutes(5 * i),
                open: 100.0,
                high: 101.0,
                low: 99.0,
                close: 100.0,
                volume: 1.0,
            });
        }
        s
    }

    fn signal(kind: SignalKind, stop: f64) -> Signal {
        Signal {
            kind,
            side: kind.side(),
            technical_stop: stop,
            base_height: 2.0,
            signal_bar_high: 101.0,
            signal_bar_low: 99.0,
            entry_hint: 100.0,
            source_bar_index: 1,
        }
    }

    struct Fixture {
        broker: Arc<PaperBroker>,
        journal: Arc<MemoryJournal>,
        pm: PositionManager,
        series: BarSeries,
        ltf: LtfSwingTracker,
        swings: SwingTracker,
    }

    fn fixture() -> Fixture {
        let broker = Arc::new(PaperBroker::new(symbol(), 10_000.0));
        broker.set_quote(100.0, 100.0);
        let journal = Arc::new(MemoryJournal::default());
        let pm = PositionManager::new(
            EngineConfig::default(),
            symbol(),
            broker.clone(),
            journal.clone(),
            "alice".into(),
        );
        Fixture {
            broker,
            journal,
            pm,
            series: warm_series(),
            ltf: LtfSwingTracker::new(),
            swings: SwingTracker::new(),
        }
    }

    async fn step_bar(f: &mut Fixture, state: MarketState) {
        let snap = f.series.snapshot();
        f.pm.on_new_bar(
            &snap,
            &regime(state),
            &f.ltf,
            &f.swings,
            SessionStatus::default(),
            t0(),
        )
        .await;
    }

    #[tokio::test]
    async fn test_twin_submission_places_two_stop_orders() {
        let mut f = fixture();
        // Market well below the trigger so the exchange minimum distance
        // (30 ticks) is honoured.
        f.broker.set_quote(95.0, 95.0);
        let snap = f.series.snapshot();
        let sig = signal(SignalKind::H2Buy, 97.0);
        let placed = f
            .pm
            .submit(&sig, 1.0, &snap, &regime(MarketState::Channel), t0())
            .await
            .unwrap();
        assert!(placed);
        let orders = f.broker.list_pending_orders(None).await.unwrap();
        assert_eq!(orders.len(), 2);
        let magics: Vec<u32> = orders.iter().map(|o| o.magic).collect();
        assert!(magics.contains(&SCALP_MAGIC));
        assert!(magics.contains(&RUNNER_MAGIC));
        // Both triggered at the signal-bar high plus one tick.
        for o in &orders {
            assert!((o.trigger_price - 101.1).abs() < 1e-9);
        }
        // Cooldown stamped.
        assert!(f.pm.last_entry_price[Side::Buy.index()] > 0.0);
    }

    #[tokio::test]
    async fn test_market_entry_opens_both_legs() {
        let mut f = fixture();
        let snap = f.series.snapshot();
        let sig = signal(SignalKind::SpikeMarketBuy, 97.0);
        f.pm.submit(&sig, 1.0, &snap, &regime(MarketState::Breakout), t0())
            .await
            .unwrap();
        assert_eq!(f.broker.open_position_count(), 2);
        assert_eq!(f.pm.positions().len(), 2);
        // Scalp carries tp1, runner carries tp2, and tp2 sits farther.
        let scalp = f.pm.positions().iter().find(|p| p.magic == Magic::Scalp).unwrap();
        let runner = f.pm.positions().iter().find(|p| p.magic == Magic::Runner).unwrap();
        assert!(scalp.tp1.unwrap() < runner.tp2.unwrap());
        assert!((scalp.technical_stop - runner.technical_stop).abs() < 1e-9);
        // Invariant: hard stop beyond technical, technical below entry.
        assert!(scalp.hard_stop < scalp.technical_stop);
        assert!(scalp.technical_stop < scalp.entry_price);
    }

    #[tokio::test]
    async fn test_opposing_position_rejected() {
        let mut f = fixture();
        let snap = f.series.snapshot();
        f.pm.submit(
            &signal(SignalKind::SpikeMarketBuy, 97.0),
            1.0,
            &snap,
            &regime(MarketState::Breakout),
            t0(),
        )
        .await
        .unwrap();
        let placed = f
            .pm
            .submit(
                &signal(SignalKind::SpikeMarketSell, 103.0),
                1.0,
                &snap,
                &regime(MarketState::Breakout),
                t0(),
            )
            .await
            .unwrap();
        assert!(!placed);
    }

    #[tokio::test]
    async fn test_no_price_chasing_when_too_close() {
        let mut f = fixture();
        // Market sits just one tick under the trigger: min distance (3.0)
        // cannot be honoured, so the entry is skipped.
        f.broker.set_quote(101.0, 101.0);
        let snap = f.series.snapshot();
        let placed = f
            .pm
            .submit(
                &signal(SignalKind::H2Buy, 97.0),
                1.0,
                &snap,
                &regime(MarketState::Channel),
                t0(),
            )
            .await
            .unwrap();
        assert!(!placed);
        assert!(f.broker.list_pending_orders(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pending_expires_after_one_bar() {
        let mut f = fixture();
        f.broker.set_quote(95.0, 95.0);
        let snap = f.series.snapshot();
        f.pm.submit(
            &signal(SignalKind::H2Buy, 97.0),
            1.0,
            &snap,
            &regime(MarketState::Channel),
            t0(),
        )
        .await
        .unwrap();
        assert_eq!(f.pm.pendings().len(), 2);
        // Next bar: untouched orders are cancelled locally.
        step_bar(&mut f, MarketState::Channel).await;
        assert!(f.pm.pendings().is_empty());
        assert!(f.broker.list_pending_orders(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stop_fill_adopted_as_position() {
        let mut f = fixture();
        f.broker.set_quote(95.0, 95.0);
        let snap = f.series.snapshot();
        f.pm.submit(
            &signal(SignalKind::H2Buy, 97.0),
            1.0,
            &snap,
            &regime(MarketState::Channel),
            t0(),
        )
        .await
        .unwrap();
        // Price trades through the trigger before the bar ends.
        f.broker.tick(101.2, t0());
        step_bar(&mut f, MarketState::Channel).await;
        assert_eq!(f.pm.positions().len(), 2);
        assert!(f.pm.pendings().is_empty());
        // Entry journal records exist for both legs.
        let records = f.journal.records.lock().unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.status == TradeStatus::Open));
    }

    #[tokio::test]
    async fn test_scalp_tp_promotes_runner_to_breakeven() {
        let mut f = fixture();
        let snap = f.series.snapshot();
        f.pm.submit(
            &signal(SignalKind::SpikeMarketBuy, 97.0),
            1.0,
            &snap,
            &regime(MarketState::Breakout),
            t0(),
        )
        .await
        .unwrap();
        let scalp_tp = f
            .pm
            .positions()
            .iter()
            .find(|p| p.magic == Magic::Scalp)
            .unwrap()
            .tp1
            .unwrap();
        // The exchange fills the scalp TP intra-bar; the next closed bar
        // reflects the excursion so the close can be attributed.
        f.broker.tick(scalp_tp + 0.2, t0());
        f.series.on_primary_bar_close(Bar {
            open_time: t0() + chrono::Duration::minutes(5 * 26),
            open: 102.0,
            high: scalp_tp + 0.5,
            low: 101.8,
            close: scalp_tp + 0.3,
            volume: 1.0,
        });
        step_bar(&mut f, MarketState::Channel).await;

        let runner = f
            .pm
            .positions()
            .iter()
            .find(|p| p.magic == Magic::Runner)
            .expect("runner survives");
        assert!(runner.scalp_closed);
        assert!(runner.breakeven_applied);
        assert!((runner.technical_stop - runner.entry_price).abs() < 1e-9);
        // Closed scalp journalled as the TP1 stage.
        let records = f.journal.records.lock().unwrap();
        assert!(records
            .iter()
            .any(|r| r.exit_reason == Some(ExitReason::Tp1Partial)));
    }

    #[tokio::test]
    async fn test_soft_stop_close_beyond_technical() {
        let mut f = fixture();
        let snap = f.series.snapshot();
        f.pm.submit(
            &signal(SignalKind::SpikeMarketBuy, 97.0),
            1.0,
            &snap,
            &regime(MarketState::Breakout),
            t0(),
        )
        .await
        .unwrap();
        // A bar closing below the technical stop (97) but above the hard
        // stop: only the soft stop reacts.
        f.series.on_primary_bar_close(Bar {
            open_time: t0() + chrono::Duration::minutes(5 * 26),
            open: 98.0,
            high: 98.2,
            low: 96.6,
            close: 96.8,
            volume: 1.0,
        });
        f.broker.set_quote(96.8, 96.8);
        step_bar(&mut f, MarketState::Channel).await;
        assert!(f.pm.positions().is_empty());
        assert_eq!(f.broker.open_position_count(), 0);
        let closed = f.broker.closed_trades();
        assert!(closed.iter().all(|c| c.reason == ClosedReason::Manual));
    }

    #[tokio::test]
    async fn test_tick_soft_stop_safety_net() {
        let mut f = fixture();
        let snap = f.series.snapshot();
        f.pm.submit(
            &signal(SignalKind::SpikeMarketBuy, 97.0),
            1.0,
            &snap,
            &regime(MarketState::Breakout),
            t0(),
        )
        .await
        .unwrap();
        f.broker.set_quote(96.5, 96.6);
        f.pm.on_tick(
            Tick {
                bid: 96.5,
                ask: 96.6,
                time: t0(),
            },
            t0(),
        )
        .await;
        assert!(f.pm.positions().is_empty());
    }

    #[tokio::test]
    async fn test_runner_trails_ltf_structure() {
        let mut f = fixture();
        let snap = f.series.snapshot();
        f.pm.submit(
            &signal(SignalKind::SpikeMarketBuy, 97.0),
            1.0,
            &snap,
            &regime(MarketState::Breakout),
            t0(),
        )
        .await
        .unwrap();
        // Scalp pays; runner promoted to breakeven (entry 100).
        let scalp_tp = f
            .pm
            .positions()
            .iter()
            .find(|p| p.magic == Magic::Scalp)
            .unwrap()
            .tp1
            .unwrap();
        f.broker.tick(scalp_tp + 0.2, t0());
        f.series.on_primary_bar_close(Bar {
            open_time: t0() + chrono::Duration::minutes(5 * 26),
            open: 102.0,
            high: scalp_tp + 0.5,
            low: 101.8,
            close: scalp_tp + 0.3,
            volume: 1.0,
        });
        step_bar(&mut f, MarketState::Channel).await;

        // Price runs on; the primary series must sit above any trailed
        // stop before the LTF structure is consulted.
        f.series.on_primary_bar_close(Bar {
            open_time: t0() + chrono::Duration::minutes(5 * 27),
            open: 106.0,
            high: 107.5,
            low: 105.5,
            close: 107.0,
            volume: 1.0,
        });
        // LTF structure: a fresh higher-low above entry at 103.
        let mut bars = Vec::new();
        let lows = [
            106.0, 105.5, 105.0, 104.0, 103.0, 104.0, 105.0, 103.5, 102.0, 103.0, 104.0, 105.0,
        ];
        for (i, lo) in lows.iter().enumerate() {
            bars.push(Bar {
                open_time: t0() + chrono::Duration::minutes(i as i64),
                open: lo + 1.0,
                high: lo + 2.0,
                low: *lo,
                close: lo + 1.5,
                volume: 1.0,
            });
        }
        f.ltf.update(&bars);
        step_bar(&mut f, MarketState::Channel).await;

        let runner = f
            .pm
            .positions()
            .iter()
            .find(|p| p.magic == Magic::Runner)
            .unwrap();
        // Trailed to the fresh 103 higher-low minus the 0.2 x ATR buffer.
        let expected = 103.0 - 0.2 * f.series.atr();
        assert!((runner.technical_stop - expected).abs() < 1e-6);
        assert!(runner.technical_stop > runner.entry_price);
        assert!(runner.hard_stop < runner.technical_stop);
    }

    #[tokio::test]
    async fn test_friday_close_flattens_weak_positions() {
        let mut f = fixture();
        let snap = f.series.snapshot();
        f.pm.submit(
            &signal(SignalKind::SpikeMarketBuy, 97.0),
            1.0,
            &snap,
            &regime(MarketState::Breakout),
            t0(),
        )
        .await
        .unwrap();
        let session = SessionStatus {
            is_weekend: false,
            is_friday_close: true,
            is_sunday_pre_open: false,
        };
        let snap = f.series.snapshot();
        let ltf = LtfSwingTracker::new();
        let swings = SwingTracker::new();
        // Price barely above entry: R < 1.5, flatten.
        f.pm.on_new_bar(&snap, &regime(MarketState::Channel), &ltf, &swings, session, t0())
            .await;
        assert!(f.pm.positions().is_empty());
        let records = f.journal.records.lock().unwrap();
        assert!(records
            .iter()
            .any(|r| r.exit_reason == Some(ExitReason::WeekendClose)));
    }
}
