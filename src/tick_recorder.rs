//! Tick Recorder: buffers CLOB book updates per token in a ring buffer
//! and batch-persists them on a flush cadence, with a drop-oldest
//! policy on overflow.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::models::{BookSnapshot, TokenId};
use crate::persistence::Persistence;

const BUFFER_CAP: usize = 5000;
const FLUSH_BATCH_SIZE: usize = 200;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickRow {
    pub token_id: TokenId,
    pub recorded_at: DateTime<Utc>,
    pub best_bid: Option<f64>,
    pub best_ask: Option<f64>,
    pub mid: Option<f64>,
    pub bid_depth_1pct: f64,
    pub ask_depth_1pct: f64,
    /// Top 5 levels per side, price/size pairs flattened for storage.
    pub top_bids: Vec<(f64, f64)>,
    pub top_asks: Vec<(f64, f64)>,
}

impl TickRow {
    pub fn from_snapshot(snapshot: &BookSnapshot, recorded_at: DateTime<Utc>) -> Self {
        Self {
            token_id: snapshot.token_id.clone(),
            recorded_at,
            best_bid: snapshot.best_bid,
            best_ask: snapshot.best_ask,
            mid: snapshot.mid,
            bid_depth_1pct: snapshot.bid_depth_1pct,
            ask_depth_1pct: snapshot.ask_depth_1pct,
            top_bids: snapshot
                .bids
                .iter()
                .take(5)
                .map(|l| (l.price, l.size))
                .collect(),
            top_asks: snapshot
                .asks
                .iter()
                .take(5)
                .map(|l| (l.price, l.size))
                .collect(),
        }
    }
}

#[derive(Default)]
struct TokenBuffer {
    rows: VecDeque<TickRow>,
    dropped: u64,
}

/// Per-token ring buffer with batched flush: capped at `BUFFER_CAP`,
/// dropping the oldest 10% on overflow, flushed in batches of
/// `FLUSH_BATCH_SIZE` rows, plus a final flush on stop.
pub struct TickRecorder {
    buffers: Mutex<HashMap<TokenId, TokenBuffer>>,
    rows_flushed: AtomicU64,
    rows_dropped: AtomicU64,
}

impl Default for TickRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl TickRecorder {
    pub fn new() -> Self {
        Self {
            buffers: Mutex::new(HashMap::new()),
            rows_flushed: AtomicU64::new(0),
            rows_dropped: AtomicU64::new(0),
        }
    }

    pub fn record(&self, row: TickRow) {
        let mut guard = self.buffers.lock();
        let buf = guard.entry(row.token_id.clone()).or_default();
        buf.rows.push_back(row);
        if buf.rows.len() > BUFFER_CAP {
            let drop_count = (BUFFER_CAP / 10).max(1);
            for _ in 0..drop_count {
                if buf.rows.pop_front().is_some() {
                    buf.dropped += 1;
                    self.rows_dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// Drains all non-empty buffers in batches of <= 200 rows and persists
    /// them. Returns the number of rows flushed.
    pub fn flush(&self, store: &Persistence) -> anyhow::Result<usize> {
        let mut flushed = 0;
        let token_ids: Vec<TokenId> = {
            let guard = self.buffers.lock();
            guard
                .iter()
                .filter(|(_, b)| !b.rows.is_empty())
                .map(|(k, _)| k.clone())
                .collect()
        };

        for token_id in token_ids {
            loop {
                let batch: Vec<TickRow> = {
                    let mut guard = self.buffers.lock();
                    let Some(buf) = guard.get_mut(&token_id) else {
                        break;
                    };
                    let n = buf.rows.len().min(FLUSH_BATCH_SIZE);
                    if n == 0 {
                        break;
                    }
                    buf.rows.drain(0..n).collect()
                };
                if batch.is_empty() {
                    break;
                }
                persist_batch(store, &batch)?;
                flushed += batch.len();
            }
        }

        self.rows_flushed.fetch_add(flushed as u64, Ordering::Relaxed);
        Ok(flushed)
    }

    pub fn buffered_len(&self, token_id: &str) -> usize {
        self.buffers
            .lock()
            .get(token_id)
            .map(|b| b.rows.len())
            .unwrap_or(0)
    }

    pub fn dropped_count(&self, token_id: &str) -> u64 {
        self.buffers
            .lock()
            .get(token_id)
            .map(|b| b.dropped)
            .unwrap_or(0)
    }

    pub fn total_rows_flushed(&self) -> u64 {
        self.rows_flushed.load(Ordering::Relaxed)
    }

    pub fn total_rows_dropped(&self) -> u64 {
        self.rows_dropped.load(Ordering::Relaxed)
    }
}

fn persist_batch(store: &Persistence, batch: &[TickRow]) -> anyhow::Result<()> {
    for row in batch {
        let top_bids_json = serde_json::to_string(&row.top_bids)?;
        let top_asks_json = serde_json::to_string(&row.top_asks)?;
        store.run(
            "INSERT INTO ticks (token_id, recorded_at, best_bid, best_ask, mid, bid_depth_1pct, ask_depth_1pct, top_bids, top_asks) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)",
            &[
                &row.token_id,
                &row.recorded_at.to_rfc3339(),
                &row.best_bid,
                &row.best_ask,
                &row.mid,
                &row.bid_depth_1pct,
                &row.ask_depth_1pct,
                &top_bids_json,
                &top_asks_json,
            ],
        )?;
    }
    Ok(())
}

pub const TICKS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS ticks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    token_id TEXT NOT NULL,
    recorded_at TEXT NOT NULL,
    best_bid REAL,
    best_ask REAL,
    mid REAL,
    bid_depth_1pct REAL NOT NULL,
    ask_depth_1pct REAL NOT NULL,
    top_bids TEXT NOT NULL,
    top_asks TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_ticks_token_time ON ticks(token_id, recorded_at);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_row(token_id: &str) -> TickRow {
        TickRow {
            token_id: token_id.to_string(),
            recorded_at: Utc::now(),
            best_bid: Some(0.5),
            best_ask: Some(0.51),
            mid: Some(0.505),
            bid_depth_1pct: 10.0,
            ask_depth_1pct: 8.0,
            top_bids: vec![(0.5, 10.0)],
            top_asks: vec![(0.51, 8.0)],
        }
    }

    #[test]
    fn overflow_drops_oldest_10_percent() {
        let recorder = TickRecorder::new();
        for _ in 0..(BUFFER_CAP + 1) {
            recorder.record(sample_row("tok"));
        }
        assert!(recorder.buffered_len("tok") <= BUFFER_CAP);
        assert!(recorder.dropped_count("tok") > 0);
    }

    #[test]
    fn flush_persists_and_drains_in_batches() {
        let recorder = TickRecorder::new();
        for _ in 0..450 {
            recorder.record(sample_row("tok"));
        }
        let db = Persistence::open_in_memory().unwrap();
        db.exec(TICKS_SCHEMA).unwrap();
        let flushed = recorder.flush(&db).unwrap();
        assert_eq!(flushed, 450);
        assert_eq!(recorder.buffered_len("tok"), 0);

        let rows = db.all("SELECT id FROM ticks", &[]).unwrap();
        assert_eq!(rows.len(), 450);
    }

    #[test]
    fn flush_is_noop_on_empty_buffers() {
        let recorder = TickRecorder::new();
        let db = Persistence::open_in_memory().unwrap();
        db.exec(TICKS_SCHEMA).unwrap();
        assert_eq!(recorder.flush(&db).unwrap(), 0);
    }
}
