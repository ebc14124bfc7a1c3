//! Market-data producers.
//!
//! Each producer owns one broker stream and forwards items into the engine
//! loop. A stalled or dropped stream reconnects with capped exponential
//! backoff; on reconnect the bar producers backfill everything missed by
//! open_time so no gap ever reaches the classifier. Open positions keep
//! being managed through the tick monitor in the interim.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::broker::BrokerAdapter;
use crate::trading_core::orderflow::DeltaAnalyzer;
use crate::types::{Bar, Tick, Timeframe};

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(60);
const MAX_BACKFILL_BARS: usize = 500;

/// Messages into the engine loop.
#[derive(Debug, Clone)]
pub enum EngineMsg {
    PrimaryBar(Bar),
    HtfBar(Bar),
    Tick(Tick),
}

fn backoff(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE.saturating_mul(2u32.saturating_pow(attempt.min(16)));
    exp.min(BACKOFF_CAP)
}

/// A bar stream is considered stalled when nothing arrives for
/// max(2 x period, 30 s).
fn stall_timeout(tf: Timeframe) -> Duration {
    (tf.duration() * 2).max(Duration::from_secs(30))
}

/// Stream closed bars for one time-frame into the engine, reconnecting and
/// backfilling forever. Returns only when the engine side hangs up.
pub async fn run_bar_producer(
    broker: Arc<dyn BrokerAdapter>,
    tf: Timeframe,
    is_primary: bool,
    tx: mpsc::Sender<EngineMsg>,
) {
    let mut last_open_time: Option<DateTime<Utc>> = None;
    let mut attempt: u32 = 0;

    loop {
        let mut stream = match broker.stream_bars(tf).await {
            Ok(s) => s,
            Err(e) => {
                warn!(%tf, error = %e, "bar stream connect failed");
                tokio::time::sleep(backoff(attempt)).await;
                attempt = attempt.saturating_add(1);
                continue;
            }
        };
        info!(%tf, "bar stream connected");

        // Backfill anything missed while disconnected.
        if let Some(from) = last_open_time {
            match broker.fetch_bars(tf, from, MAX_BACKFILL_BARS).await {
                Ok(bars) => {
                    let threshold = last_open_time;
                    let missed = bars
                        .into_iter()
                        .filter(|b| Some(b.open_time) > threshold);
                    for b in missed {
                        last_open_time = Some(b.open_time);
                        if send_bar(&tx, tf, is_primary, b).await.is_err() {
                            return;
                        }
                    }
                }
                Err(e) => warn!(%tf, error = %e, "backfill failed; relying on stream"),
            }
        }
        attempt = 0;

        loop {
            match tokio::time::timeout(stall_timeout(tf), stream.next()).await {
                Ok(Some(bar)) => {
                    last_open_time = Some(bar.open_time);
                    if send_bar(&tx, tf, is_primary, bar).await.is_err() {
                        return;
                    }
                }
                Ok(None) => {
                    warn!(%tf, "bar stream ended; reconnecting");
                    break;
                }
                Err(_) => {
                    warn!(%tf, "bar stream stalled; reconnecting");
                    break;
                }
            }
        }
        tokio::time::sleep(backoff(attempt)).await;
        attempt = attempt.saturating_add(1);
    }
}

async fn send_bar(
    tx: &mpsc::Sender<EngineMsg>,
    _tf: Timeframe,
    is_primary: bool,
    bar: Bar,
) -> Result<(), ()> {
    let msg = if is_primary {
        EngineMsg::PrimaryBar(bar)
    } else {
        EngineMsg::HtfBar(bar)
    };
    tx.send(msg).await.map_err(|_| ())
}

/// Feed the order-flow analyser from the per-trade stream. The analyser is
/// the single consumer-facing summary; this task is its single producer.
pub async fn run_trade_producer(
    broker: Arc<dyn BrokerAdapter>,
    analyzer: Arc<Mutex<DeltaAnalyzer>>,
) {
    let mut attempt: u32 = 0;
    loop {
        let mut stream = match broker.stream_trades().await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "trade stream connect failed");
                tokio::time::sleep(backoff(attempt)).await;
                attempt = attempt.saturating_add(1);
                continue;
            }
        };
        info!("trade stream connected");
        attempt = 0;
        while let Some(trade) = stream.next().await {
            analyzer.lock().unwrap().add_trade(trade);
        }
        warn!("trade stream ended; reconnecting");
        tokio::time::sleep(backoff(attempt)).await;
        attempt = attempt.saturating_add(1);
    }
}

/// Forward best bid/ask ticks into the engine. Only the cheap exit path
/// hangs off these.
pub async fn run_tick_producer(broker: Arc<dyn BrokerAdapter>, tx: mpsc::Sender<EngineMsg>) {
    let mut attempt: u32 = 0;
    loop {
        let mut stream = match broker.stream_ticks().await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "tick stream connect failed");
                tokio::time::sleep(backoff(attempt)).await;
                attempt = attempt.saturating_add(1);
                continue;
            }
        };
        info!("tick stream connected");
        attempt = 0;
        while let Some(tick) = stream.next().await {
            if tx.send(EngineMsg::Tick(tick)).await.is_err() {
                return;
            }
        }
        warn!("tick stream ended; reconnecting");
        tokio::time::sleep(backoff(attempt)).await;
        attempt = attempt.saturating_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::paper::PaperBroker;
    use crate::types::SymbolInfo;
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

    fn bar(i: i64) -> Bar {
        Bar {
            open_time: Utc.with_ymd_and_hms(2024, 3, 6, 0, 0, 0).unwrap()
                + chrono::Duration::minutes(5 * i),
            open: 100.0,
            high: 101.0,
            low: 99.0,
            close: 100.0,
            volume: 1.0,
        }
    }

    #[test]
    fn test_backoff_is_capped() {
        assert_eq!(backoff(0), Duration::from_secs(1));
        assert_eq!(backoff(3), Duration::from_secs(8));
        assert_eq!(backoff(20), BACKOFF_CAP);
    }

    #[test]
    fn test_stall_timeout_floor() {
        assert_eq!(stall_timeout(Timeframe::M1), Duration::from_secs(120));
        assert_eq!(stall_timeout(Timeframe::M5), Duration::from_secs(600));
        // Very short frames still wait at least 30 seconds.
        assert_eq!(
            stall_timeout(Timeframe { seconds: 5 }),
            Duration::from_secs(30)
        );
    }

    #[tokio::test]
    async fn test_bar_producer_forwards_bars() {
        let broker = Arc::new(PaperBroker::new(info(), 10_000.0));
        let feed = broker.bar_feed(Timeframe::M5);
        let (tx, mut rx) = mpsc::channel(16);
        let handle = tokio::spawn(run_bar_producer(
            broker.clone() as Arc<dyn BrokerAdapter>,
            Timeframe::M5,
            true,
            tx,
        ));

        feed.send(bar(0)).unwrap();
        feed.send(bar(1)).unwrap();
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(matches!(first, EngineMsg::PrimaryBar(b) if b.open_time == bar(0).open_time));
        assert!(matches!(second, EngineMsg::PrimaryBar(b) if b.open_time == bar(1).open_time));

        drop(rx);
        feed.send(bar(2)).unwrap();
        let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;
    }

    #[tokio::test]
    async fn test_trade_producer_feeds_analyzer() {
        let broker = Arc::new(PaperBroker::new(info(), 10_000.0));
        let feed = broker.trade_feed();
        let analyzer = Arc::new(Mutex::new(DeltaAnalyzer::new(
            true,
            Duration::from_secs(300),
        )));
        let _handle = tokio::spawn(run_trade_producer(
            broker.clone() as Arc<dyn BrokerAdapter>,
            analyzer.clone(),
        ));
        feed.send(crate::types::AggTrade {
            price: 100.0,
            qty: 2.0,
            buyer_is_maker: false,
            time: Utc.with_ymd_and_hms(2024, 3, 6, 0, 0, 0).unwrap(),
        })
        .unwrap();
        // Wait for the producer to drain the channel.
        for _ in 0..50 {
            if analyzer.lock().unwrap().snapshot().trade_count > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(analyzer.lock().unwrap().snapshot().trade_count, 1);
    }
}
