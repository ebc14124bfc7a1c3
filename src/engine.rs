//! Engine wiring: producers in, dispatcher in the middle, per-user
//! orchestrators out.
//!
//! The dispatcher and every piece of classifier state live on a single
//! task; producers and users only exchange messages and value snapshots,
//! so the engine is correct under a single-threaded runtime.

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use crate::broker::BrokerAdapter;
use crate::config::EngineConfig;
use crate::execution::orchestrator::{run_user, CloseRequest, UserChannels};
use crate::journal::TradeJournal;
use crate::streams::{run_bar_producer, run_tick_producer, run_trade_producer, EngineMsg};
use crate::trading_core::orderflow::DeltaAnalyzer;
use crate::trading_core::Dispatcher;

/// Handle for requesting a user's book be flattened.
pub struct UserHandle {
    pub name: String,
    pub close_tx: mpsc::Sender<CloseRequest>,
}

/// Run the engine until every stream has closed. Fatal startup errors
/// (symbol info unavailable) surface immediately.
pub async fn run(
    cfg: EngineConfig,
    broker: Arc<dyn BrokerAdapter>,
    journal: Arc<dyn TradeJournal>,
    users: Vec<String>,
) -> Result<()> {
    let info = broker
        .symbol_info()
        .await
        .context("symbol info unavailable at startup")?;
    info!(symbol = %info.symbol, tick = info.tick_size, "engine starting");

    let orderflow = Arc::new(Mutex::new(DeltaAnalyzer::new(
        cfg.orderflow_enabled,
        cfg.primary_tf.duration(),
    )));
    let mut dispatcher = Dispatcher::new(cfg.clone(), orderflow.clone());

    let (engine_tx, mut engine_rx) = mpsc::channel::<EngineMsg>(1024);
    let (bar_event_tx, _) = broadcast::channel(64);
    let (tick_tx, _) = broadcast::channel(1024);

    // Producers: primary bars, HTF bars, trades, ticks.
    tokio::spawn(run_bar_producer(
        broker.clone(),
        cfg.primary_tf,
        true,
        engine_tx.clone(),
    ));
    tokio::spawn(run_bar_producer(
        broker.clone(),
        cfg.htf,
        false,
        engine_tx.clone(),
    ));
    tokio::spawn(run_trade_producer(broker.clone(), orderflow));
    tokio::spawn(run_tick_producer(broker.clone(), engine_tx.clone()));
    drop(engine_tx);

    // One orchestrator per user.
    let mut handles = Vec::new();
    for name in users {
        let channels = UserChannels {
            bar_rx: bar_event_tx.subscribe(),
            tick_rx: tick_tx.subscribe(),
            close_rx: {
                let (close_tx, close_rx) = mpsc::channel(8);
                handles.push(UserHandle {
                    name: name.clone(),
                    close_tx,
                });
                close_rx
            },
        };
        tokio::spawn(run_user(
            name,
            cfg.clone(),
            broker.clone(),
            journal.clone(),
            channels,
        ));
    }

    // Periodic status line.
    let mut status = tokio::time::interval(std::time::Duration::from_secs(60));
    status.tick().await; // immediate first tick consumed

    loop {
        tokio::select! {
            msg = engine_rx.recv() => {
                let Some(msg) = msg else {
                    info!("all producers finished; engine stopping");
                    return Ok(());
                };
                match msg {
                    EngineMsg::PrimaryBar(bar) => {
                        if let Some(event) = dispatcher.dispatch_new_bar(bar, Utc::now()) {
                            if bar_event_tx.send(event).is_err() {
                                warn!("no live orchestrators for bar event");
                            }
                        }
                    }
                    EngineMsg::HtfBar(bar) => dispatcher.on_htf_bar_close(bar),
                    EngineMsg::Tick(tick) => {
                        dispatcher.on_tick(tick);
                        let _ = tick_tx.send(tick);
                    }
                }
            }
            _ = status.tick() => {
                let regime = dispatcher.regime();
                info!(
                    state = %regime.state,
                    cycle = %regime.cycle,
                    always_in = ?regime.always_in,
                    atr = dispatcher.bars.atr(),
                    "engine status"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::paper::PaperBroker;
    use crate::journal::MemoryJournal;
    use crate::types::{Bar, SymbolInfo};
    use chrono::TimeZone;

    #[tokio::test]
    async fn test_engine_runs_and_stops_with_streams() {
        let info = SymbolInfo {
            symbol: "BTCUSDT".into(),
            tick_size: 0.1,
            step_size: 0.001,
            min_qty: 0.001,
            min_notional: 5.0,
            min_stops_level_points: 30,
        };
        let cfg = EngineConfig::default();
        let broker = Arc::new(PaperBroker::new(info, 10_000.0));
        broker.set_quote(100.0, 100.0);
        let primary = broker.bar_feed(cfg.primary_tf);
        let _htf = broker.bar_feed(cfg.htf);
        let journal = Arc::new(MemoryJournal::default());

        let engine = tokio::spawn(run(
            cfg,
            broker.clone() as Arc<dyn BrokerAdapter>,
            journal,
            vec!["alice".into()],
        ));

        for i in 0..5 {
            primary
                .send(Bar {
                    open_time: Utc.with_ymd_and_hms(2024, 3, 6, 0, 0, 0).unwrap()
                        + chrono::Duration::minutes(5 * i),
                    open: 100.0,
                    high: 101.0,
                    low: 99.0,
                    close: 100.0,
                    volume: 1.0,
                })
                .unwrap();
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(!engine.is_finished());
        engine.abort();
    }
}
