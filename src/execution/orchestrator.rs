//! Per-user orchestration.
//!
//! One task per user. Close requests outrank everything; ticks outrank bar
//! work; a bar's signal is only submitted after the lifecycle pipeline for
//! that bar has run, and a signal is abandoned the moment a newer bar event
//! is already waiting — the older signal must never be acted on after the
//! newer one exists.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use crate::broker::BrokerAdapter;
use crate::config::EngineConfig;
use crate::execution::lifecycle::PositionManager;
use crate::execution::sizing;
use crate::journal::{ExitReason, TradeJournal};
use crate::trading_core::dispatcher::BarEvent;
use crate::types::Tick;

/// Engine-level request to flatten a user's book.
#[derive(Debug, Clone)]
pub struct CloseRequest {
    pub reason: ExitReason,
}

pub struct UserChannels {
    pub bar_rx: broadcast::Receiver<BarEvent>,
    pub tick_rx: broadcast::Receiver<Tick>,
    pub close_rx: mpsc::Receiver<CloseRequest>,
}

/// The per-user task body. Runs until the bar-event channel closes.
pub async fn run_user(
    name: String,
    cfg: EngineConfig,
    broker: Arc<dyn BrokerAdapter>,
    journal: Arc<dyn TradeJournal>,
    mut ch: UserChannels,
) -> Result<()> {
    let symbol = broker.symbol_info().await?;
    let mut pm = PositionManager::new(cfg.clone(), symbol, broker.clone(), journal, name.clone());
    info!(user = %name, "orchestrator started");

    // A bar event pulled ahead of its turn while draining for supersession.
    let mut queued: Option<BarEvent> = None;

    loop {
        let event = if let Some(ev) = queued.take() {
            Some(UserEvent::Bar(Box::new(ev)))
        } else {
            tokio::select! {
                biased;
                req = ch.close_rx.recv() => req.map(UserEvent::Close),
                tick = ch.tick_rx.recv() => match tick {
                    Ok(t) => Some(UserEvent::Tick(t)),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(user = %name, missed = n, "tick stream lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => None,
                },
                bar = ch.bar_rx.recv() => match bar {
                    Ok(ev) => Some(UserEvent::Bar(Box::new(ev))),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(user = %name, missed = n, "bar stream lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => None,
                },
            }
        };

        let Some(event) = event else {
            info!(user = %name, "channels closed; orchestrator stopping");
            return Ok(());
        };

        match event {
            UserEvent::Close(req) => {
                info!(user = %name, reason = ?req.reason, "close request");
                pm.flatten_all(req.reason, Utc::now()).await;
            }
            UserEvent::Tick(t) => {
                pm.on_tick(t, Utc::now()).await;
            }
            UserEvent::Bar(ev) => {
                pm.on_new_bar(&ev.snapshot, &ev.regime, &ev.ltf, &ev.swings, ev.session, ev.now)
                    .await;

                let Some(signal) = ev.signal else {
                    continue;
                };

                // Newer signal wins: if another bar event is already
                // queued, this signal is stale and must be dropped.
                match ch.bar_rx.try_recv() {
                    Ok(next) => {
                        info!(user = %name, kind = %signal.kind, "superseded by newer bar; signal dropped");
                        queued = Some(next);
                        continue;
                    }
                    Err(broadcast::error::TryRecvError::Empty) => {}
                    Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                    Err(broadcast::error::TryRecvError::Closed) => {}
                }

                if !pm.entry_cooldown_passed(signal.side, signal.entry_hint, &ev.snapshot) {
                    info!(user = %name, kind = %signal.kind, "entry cooldown; signal skipped");
                    continue;
                }

                let balance = match broker.account_balance().await {
                    Ok(b) => b,
                    Err(e) => {
                        warn!(user = %name, error = %e, "balance unavailable; signal skipped");
                        continue;
                    }
                };
                let Some(qty) = sizing::order_quantity(
                    &cfg,
                    &broker.symbol_info().await?,
                    balance,
                    signal.entry_hint,
                ) else {
                    continue;
                };

                match pm
                    .submit(&signal, qty, &ev.snapshot, &ev.regime, ev.now)
                    .await
                {
                    Ok(true) => info!(user = %name, kind = %signal.kind, qty, "entry submitted"),
                    Ok(false) => {}
                    Err(e) => warn!(user = %name, kind = %signal.kind, error = %e, "submission failed"),
                }
            }
        }
    }
}

enum UserEvent {
    Close(CloseRequest),
    Tick(Tick),
    Bar(Box<BarEvent>),
}
