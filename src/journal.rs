//! Append-only trade journal.
//!
//! Every significant position event produces one record. Writes are
//! best-effort: a failed write logs once and the engine carries on.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::types::Side;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeStatus {
    Open,
    Partial,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    Tp1Partial,
    Tp2,
    StopLoss,
    SoftStop,
    ClimaxExit,
    WeekendClose,
    Manual,
}

/// One journal line. `signal_id` links the two legs of a twin entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub signal_id: Uuid,
    pub user_id: String,
    pub signal_kind: String,
    pub side: Side,
    pub entry_price: f64,
    pub qty: f64,
    pub technical_stop: f64,
    pub hard_stop: f64,
    pub tp1: Option<f64>,
    pub tp2: Option<f64>,
    pub exit_price: Option<f64>,
    pub exit_reason: Option<ExitReason>,
    pub pnl_realised: Option<f64>,
    pub status: TradeStatus,
    pub open_time: DateTime<Utc>,
    pub close_time: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait TradeJournal: Send + Sync {
    /// Best-effort append; must never fail the caller.
    async fn record(&self, rec: &TradeRecord);
}

/// Line-delimited JSON journal on local disk.
pub struct JsonlJournal {
    path: PathBuf,
    file: Mutex<Option<std::fs::File>>,
    write_failed: Mutex<bool>,
}

impl JsonlJournal {
    pub fn open(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(Some(file)),
            write_failed: Mutex::new(false),
        })
    }
}

#[async_trait]
impl TradeJournal for JsonlJournal {
    async fn record(&self, rec: &TradeRecord) {
        let line = match serde_json::to_string(rec) {
            Ok(l) => l,
            Err(e) => {
                warn!(error = %e, "journal serialisation failed");
                return;
            }
        };
        let mut guard = self.file.lock().unwrap();
        let result = guard
            .as_mut()
            .map(|f| writeln!(f, "{line}").and_then(|_| f.flush()));
        if let Some(Err(e)) = result {
            // Coalesce: complain once, then stay quiet.
            let mut failed = self.write_failed.lock().unwrap();
            if !*failed {
                warn!(path = %self.path.display(), error = %e, "journal write failed; continuing without journal");
                *failed = true;
            }
        }
    }
}

/// Journal that drops everything; used when journalling is disabled.
pub struct NullJournal;

#[async_trait]
impl TradeJournal for NullJournal {
    async fn record(&self, _rec: &TradeRecord) {}
}

/// In-memory journal for tests.
#[derive(Default)]
pub struct MemoryJournal {
    pub records: Mutex<Vec<TradeRecord>>,
}

#[async_trait]
impl TradeJournal for MemoryJournal {
    async fn record(&self, rec: &TradeRecord) {
        self.records.lock().unwrap().push(rec.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record() -> TradeRecord {
        TradeRecord {
            signal_id: Uuid::new_v4(),
            user_id: "alice".into(),
            signal_kind: "H2_Buy".into(),
            side: Side::Buy,
            entry_price: 100.0,
            qty: 0.5,
            technical_stop: 98.0,
            hard_stop: 97.0,
            tp1: Some(102.0),
            tp2: Some(105.0),
            exit_price: None,
            exit_reason: None,
            pnl_realised: None,
            status: TradeStatus::Open,
            open_time: Utc.with_ymd_and_hms(2024, 3, 4, 12, 0, 0).unwrap(),
            close_time: None,
        }
    }

    #[tokio::test]
    async fn test_jsonl_round_trip() {
        let dir = std::env::temp_dir().join(format!("journal-test-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("trades.jsonl");
        let journal = JsonlJournal::open(&path).unwrap();
        journal.record(&record()).await;
        journal.record(&record()).await;

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: TradeRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed.user_id, "alice");
        assert_eq!(parsed.status, TradeStatus::Open);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_memory_journal_collects() {
        let j = MemoryJournal::default();
        j.record(&record()).await;
        assert_eq!(j.records.lock().unwrap().len(), 1);
    }
}
