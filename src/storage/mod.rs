//! Relational time-series store.
//!
//! SQLite behind a mutexed connection. The schema is installed from a
//! single idempotent batch; candle-shape invariants are enforced a second
//! time at the storage level so a validator bug cannot corrupt the
//! warehouse. Repository operations are grouped by concern:
//! candles, tracked symbols, job records, and append-only logs.

mod audit;
mod candles;
mod jobs;
mod symbols;

pub use candles::UpsertOutcome;

use crate::error::{IngestError, IngestResult};
use crate::models::Timeframe;
use anyhow::Context;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Serializes schema installation across threads in this process.
static SCHEMA_LOCK: Mutex<()> = Mutex::new(());

const SCHEMA_SQL: &str = r#"
-- Enable optimizations
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

-- Candle store. Identity is (symbol, timeframe, ts); value columns are
-- replaced on re-ingestion. Shape constraints apply to validated rows only:
-- rows the validator rejected are stored flagged for reporting.
CREATE TABLE IF NOT EXISTS candles (
    symbol TEXT NOT NULL,
    timeframe TEXT NOT NULL CHECK (timeframe IN ('5m','15m','30m','1h','4h','1d','1w')),
    ts INTEGER NOT NULL,
    open REAL NOT NULL,
    high REAL NOT NULL,
    low REAL NOT NULL,
    close REAL NOT NULL,
    volume REAL NOT NULL,
    source TEXT NOT NULL,
    validated INTEGER NOT NULL,
    quality_score REAL NOT NULL CHECK (quality_score >= 0.0 AND quality_score <= 1.0),
    validation_notes TEXT,
    gap_detected INTEGER NOT NULL DEFAULT 0,
    volume_anomaly INTEGER NOT NULL DEFAULT 0,
    ingested_at INTEGER NOT NULL,
    PRIMARY KEY (symbol, timeframe, ts),
    CHECK (validated = 0 OR (high >= low AND high >= open AND high >= close
                             AND low <= open AND low <= close
                             AND open > 0 AND high > 0 AND low > 0 AND close > 0
                             AND volume >= 0))
);

CREATE INDEX IF NOT EXISTS idx_candles_symbol_ts
    ON candles(symbol, ts DESC);

-- Tracked instrument universe. active = 0 is a soft delete.
CREATE TABLE IF NOT EXISTS tracked_symbols (
    symbol TEXT PRIMARY KEY,
    asset_class TEXT NOT NULL CHECK (asset_class IN ('stock','crypto','etf')),
    active INTEGER NOT NULL DEFAULT 1,
    timeframes TEXT NOT NULL,
    date_added INTEGER NOT NULL,
    last_backfill INTEGER,
    backfill_status TEXT NOT NULL DEFAULT 'pending',
    backfill_error TEXT
);

-- Durable job records; jobs survive a restart.
CREATE TABLE IF NOT EXISTS backfill_jobs (
    id TEXT PRIMARY KEY,
    symbols TEXT NOT NULL,
    timeframes TEXT NOT NULL,
    start_date TEXT NOT NULL,
    end_date TEXT NOT NULL,
    status TEXT NOT NULL,
    progress_pct REAL NOT NULL DEFAULT 0,
    symbols_completed INTEGER NOT NULL DEFAULT 0,
    symbols_total INTEGER NOT NULL DEFAULT 0,
    current_symbol TEXT,
    total_records_inserted INTEGER NOT NULL DEFAULT 0,
    error TEXT,
    created_at INTEGER NOT NULL,
    started_at INTEGER,
    completed_at INTEGER
);

CREATE TABLE IF NOT EXISTS backfill_job_details (
    job_id TEXT NOT NULL,
    symbol TEXT NOT NULL,
    timeframe TEXT NOT NULL,
    status TEXT NOT NULL,
    records_fetched INTEGER NOT NULL DEFAULT 0,
    records_inserted INTEGER NOT NULL DEFAULT 0,
    duration_ms INTEGER NOT NULL DEFAULT 0,
    error TEXT,
    PRIMARY KEY (job_id, symbol, timeframe)
);

-- Per-job completeness matrix, persisted with the job record.
CREATE TABLE IF NOT EXISTS job_completeness (
    job_id TEXT NOT NULL,
    symbol TEXT NOT NULL,
    timeframe TEXT NOT NULL,
    complete INTEGER NOT NULL,
    gaps_detected INTEGER NOT NULL DEFAULT 0,
    gaps_retried INTEGER NOT NULL DEFAULT 0,
    gaps_filled INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (job_id, symbol, timeframe)
);

-- Append-only upstream call outcomes.
CREATE TABLE IF NOT EXISTS upstream_audit_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    symbol TEXT NOT NULL,
    timeframe TEXT,
    endpoint TEXT NOT NULL,
    fetched_at INTEGER NOT NULL,
    records_fetched INTEGER NOT NULL DEFAULT 0,
    records_inserted INTEGER NOT NULL DEFAULT 0,
    records_updated INTEGER NOT NULL DEFAULT 0,
    response_time_ms INTEGER NOT NULL DEFAULT 0,
    success INTEGER NOT NULL,
    error TEXT,
    remaining_quota INTEGER
);

CREATE INDEX IF NOT EXISTS idx_audit_symbol_fetched
    ON upstream_audit_log(symbol, fetched_at);

-- Append-only per-batch validation outcomes.
CREATE TABLE IF NOT EXISTS validation_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    symbol TEXT NOT NULL,
    timeframe TEXT NOT NULL,
    logged_at INTEGER NOT NULL,
    total INTEGER NOT NULL,
    passed INTEGER NOT NULL,
    failed INTEGER NOT NULL,
    gaps_flagged INTEGER NOT NULL,
    volume_anomalies INTEGER NOT NULL
);
"#;

/// Shared handle to the warehouse store.
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create the store at `path` and ensure the schema.
    pub fn open(path: &str) -> anyhow::Result<Self> {
        let p = Path::new(path);
        if let Some(parent) = p.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(path, flags)
            .with_context(|| format!("Failed to open database: {path}"))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.ensure_schema()?;
        info!(path = %path, "Warehouse store opened");
        Ok(db)
    }

    /// In-memory store for tests.
    pub fn open_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.ensure_schema()?;
        Ok(db)
    }

    /// Install or verify the schema. Idempotent; safe to call again when a
    /// schema-missing error is observed mid-job. Holds a process-wide lock
    /// so concurrent startups run the migration once.
    pub fn ensure_schema(&self) -> anyhow::Result<()> {
        let _guard = SCHEMA_LOCK.lock();
        let conn = self.conn.lock();
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to ensure schema")?;
        Ok(())
    }

    pub(crate) fn conn(&self) -> &Arc<Mutex<Connection>> {
        &self.conn
    }
}

// =============================================================================
// Column codecs shared by the store modules
// =============================================================================

pub(crate) fn ts_to_col(ts: DateTime<Utc>) -> i64 {
    ts.timestamp()
}

pub(crate) fn ts_from_col(secs: i64) -> IngestResult<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| IngestError::StorageTransient(format!("bad timestamp column: {secs}")))
}

pub(crate) fn opt_ts_from_col(secs: Option<i64>) -> IngestResult<Option<DateTime<Utc>>> {
    secs.map(ts_from_col).transpose()
}

/// Comma-separated timeframe column. Unknown entries are dropped silently
/// so an old row with a retired timeframe still reads.
pub(crate) fn timeframes_from_col(raw: &str) -> Vec<Timeframe> {
    raw.split(',')
        .filter_map(|s| s.trim().parse::<Timeframe>().ok())
        .collect()
}

pub(crate) fn timeframes_to_col(tfs: &[Timeframe]) -> String {
    tfs.iter()
        .map(|t| t.as_str())
        .collect::<Vec<_>>()
        .join(",")
}
