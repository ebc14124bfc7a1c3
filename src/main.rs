use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use brooksquant::broker::paper::PaperBroker;
use brooksquant::broker::BrokerAdapter;
use brooksquant::config::EngineConfig;
use brooksquant::journal::{JsonlJournal, NullJournal, TradeJournal};
use brooksquant::types::SymbolInfo;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Trading users (comma-separated); one orchestrator task each.
    #[arg(short, long, default_value = "default", env = "USERS")]
    users: String,

    /// Trade journal path (line-delimited JSON). Empty disables it.
    #[arg(short, long, default_value = "trades.jsonl", env = "JOURNAL_PATH")]
    journal: String,

    /// Paper balance used in observe mode.
    #[arg(long, default_value = "10000", env = "OBSERVE_BALANCE")]
    balance: f64,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present.
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("brooksquant=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();
    let cfg = EngineConfig::from_env();

    info!(
        symbol = %cfg.symbol,
        tf = %cfg.primary_tf,
        htf = %cfg.htf,
        "starting price-action engine"
    );

    let users: Vec<String> = args
        .users
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    let journal: Arc<dyn TradeJournal> = if args.journal.is_empty() {
        Arc::new(NullJournal)
    } else {
        Arc::new(JsonlJournal::open(&args.journal)?)
    };

    // The engine only ever talks to the BrokerAdapter trait. The in-tree
    // venue is the paper broker; an exchange gateway implementing the same
    // trait slots in here without touching the core.
    let info = SymbolInfo {
        symbol: cfg.symbol.clone(),
        tick_size: 0.1,
        step_size: 0.001,
        min_qty: 0.001,
        min_notional: 5.0,
        min_stops_level_points: cfg.min_stops_level_points,
    };
    let paper = PaperBroker::new(info, args.balance);
    // Register feeds up front so the producers can subscribe; the senders
    // stay alive for the life of the process (an external harness or a
    // replay driver pushes into them).
    let _primary_feed = paper.bar_feed(cfg.primary_tf);
    let _htf_feed = paper.bar_feed(cfg.htf);
    let broker: Arc<dyn BrokerAdapter> = Arc::new(paper);

    tokio::select! {
        result = brooksquant::engine::run(cfg, broker, journal, users) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received; shutting down");
            Ok(())
        }
    }
}
