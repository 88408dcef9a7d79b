//! Core domain types shared across the ingestion engine.
//!
//! Everything here is plain data: candles as fetched and as validated,
//! the tracked-symbol universe, backfill job records and their per-unit
//! progress, and the small report types the orchestrator emits.

use chrono::{DateTime, Datelike, NaiveDate, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// =============================================================================
// Timeframes
// =============================================================================

/// Candle bucket width. Closed set; anything else is rejected at the edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    M5,
    M15,
    M30,
    H1,
    H4,
    D1,
    W1,
}

impl Timeframe {
    /// All supported timeframes, ascending by bucket width.
    pub const ALL: [Timeframe; 7] = [
        Timeframe::M5,
        Timeframe::M15,
        Timeframe::M30,
        Timeframe::H1,
        Timeframe::H4,
        Timeframe::D1,
        Timeframe::W1,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::M30 => "30m",
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
            Timeframe::D1 => "1d",
            Timeframe::W1 => "1w",
        }
    }

    /// Bucket width in seconds.
    pub fn duration_secs(&self) -> i64 {
        match self {
            Timeframe::M5 => 300,
            Timeframe::M15 => 900,
            Timeframe::M30 => 1_800,
            Timeframe::H1 => 3_600,
            Timeframe::H4 => 14_400,
            Timeframe::D1 => 86_400,
            Timeframe::W1 => 604_800,
        }
    }

    /// Whether a timestamp sits on this timeframe's bucket boundary.
    ///
    /// Intraday buckets align to epoch multiples of the bucket width;
    /// daily buckets to midnight UTC; weekly buckets to Monday midnight UTC.
    pub fn is_aligned(&self, ts: DateTime<Utc>) -> bool {
        match self {
            Timeframe::D1 => ts.num_seconds_from_midnight() == 0,
            Timeframe::W1 => {
                ts.num_seconds_from_midnight() == 0 && ts.weekday() == Weekday::Mon
            }
            _ => ts.timestamp() % self.duration_secs() == 0,
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "5m" => Ok(Timeframe::M5),
            "15m" => Ok(Timeframe::M15),
            "30m" => Ok(Timeframe::M30),
            "1h" => Ok(Timeframe::H1),
            "4h" => Ok(Timeframe::H4),
            "1d" => Ok(Timeframe::D1),
            "1w" => Ok(Timeframe::W1),
            other => Err(format!("unsupported timeframe: {other}")),
        }
    }
}

// =============================================================================
// Asset classes
// =============================================================================

/// Instrument category. Selects the upstream route and the trading calendar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetClass {
    Stock,
    Crypto,
    Etf,
}

impl AssetClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetClass::Stock => "stock",
            AssetClass::Crypto => "crypto",
            AssetClass::Etf => "etf",
        }
    }

    /// Crypto trades every calendar day; stocks and ETFs Monday through Friday.
    pub fn is_trading_day(&self, date: NaiveDate) -> bool {
        match self {
            AssetClass::Crypto => true,
            AssetClass::Stock | AssetClass::Etf => {
                !matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
            }
        }
    }
}

impl fmt::Display for AssetClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssetClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stock" => Ok(AssetClass::Stock),
            "crypto" => Ok(AssetClass::Crypto),
            "etf" => Ok(AssetClass::Etf),
            other => Err(format!("unknown asset class: {other}")),
        }
    }
}

// =============================================================================
// Candles
// =============================================================================

/// A candle exactly as the upstream provider returned it, before validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawCandle {
    pub ts: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// A candle after validation, ready for persistence.
///
/// Identity is `(symbol, timeframe, ts)`; the store enforces uniqueness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatedCandle {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub ts: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub source: String,
    pub validated: bool,
    /// Rational in [0, 1]; hard-check passes minus anomaly penalties.
    pub quality_score: f64,
    pub validation_notes: Vec<String>,
    pub gap_detected: bool,
    pub volume_anomaly: bool,
    pub ingested_at: DateTime<Utc>,
}

/// Per-batch validation summary, emitted alongside the validated candles.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub gaps_flagged: usize,
    pub volume_anomalies: usize,
}

// =============================================================================
// Tracked symbols
// =============================================================================

/// Per-symbol backfill state, written only by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackfillStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl BackfillStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackfillStatus::Pending => "pending",
            BackfillStatus::InProgress => "in_progress",
            BackfillStatus::Completed => "completed",
            BackfillStatus::Failed => "failed",
        }
    }
}

impl FromStr for BackfillStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(BackfillStatus::Pending),
            "in_progress" => Ok(BackfillStatus::InProgress),
            "completed" => Ok(BackfillStatus::Completed),
            "failed" => Ok(BackfillStatus::Failed),
            other => Err(format!("unknown backfill status: {other}")),
        }
    }
}

/// One instrument in the active universe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedSymbol {
    pub symbol: String,
    pub asset_class: AssetClass,
    pub active: bool,
    pub timeframes: Vec<Timeframe>,
    pub date_added: DateTime<Utc>,
    pub last_backfill: Option<DateTime<Utc>>,
    pub backfill_status: BackfillStatus,
    pub backfill_error: Option<String>,
}

// =============================================================================
// Backfill jobs
// =============================================================================

/// Overall job state. Transitions are monotonic; `Failed` means the job
/// itself could not run, never that individual units failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// A request to run a backfill, before defaults are applied.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobRequest {
    /// Explicit symbols, or `None` for every active symbol in the registry.
    pub symbols: Option<Vec<String>>,
    /// Explicit timeframes, or `None` for each symbol's configured set.
    pub timeframes: Option<Vec<Timeframe>>,
    /// Defaults to `end - DEFAULT_HISTORY_DAYS`.
    pub start: Option<NaiveDate>,
    /// Defaults to today (UTC).
    pub end: Option<NaiveDate>,
}

/// Durable job record; survives process restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillJob {
    pub id: Uuid,
    pub symbols: Vec<String>,
    pub timeframes: Vec<Timeframe>,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub status: JobStatus,
    pub progress_pct: f64,
    pub symbols_completed: usize,
    pub symbols_total: usize,
    pub current_symbol: Option<String>,
    pub total_records_inserted: u64,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Per-unit status inside a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl UnitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitStatus::Pending => "pending",
            UnitStatus::Running => "running",
            UnitStatus::Completed => "completed",
            UnitStatus::Failed => "failed",
        }
    }
}

impl FromStr for UnitStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(UnitStatus::Pending),
            "running" => Ok(UnitStatus::Running),
            "completed" => Ok(UnitStatus::Completed),
            "failed" => Ok(UnitStatus::Failed),
            other => Err(format!("unknown unit status: {other}")),
        }
    }
}

/// Progress detail for one `(job, symbol, timeframe)` unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobUnitDetail {
    pub job_id: Uuid,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub status: UnitStatus,
    pub records_fetched: u64,
    pub records_inserted: u64,
    pub duration_ms: u64,
    pub error: Option<String>,
}

// =============================================================================
// Reports
// =============================================================================

/// An inclusive span of business days with no candle stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
    /// Business days covered by the span.
    pub days: u32,
}

/// One row of the per-job completeness matrix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletenessEntry {
    pub symbol: String,
    pub timeframe: Timeframe,
    /// No remaining gaps inside the job's date range.
    pub complete: bool,
    pub gaps_detected: u32,
    pub gaps_retried: u32,
    pub gaps_filled: u32,
}

/// Append-only record of one upstream call attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub symbol: String,
    pub timeframe: Option<Timeframe>,
    pub endpoint: String,
    pub fetched_at: DateTime<Utc>,
    pub records_fetched: u64,
    pub records_inserted: u64,
    pub records_updated: u64,
    pub response_time_ms: u64,
    pub success: bool,
    pub error: Option<String>,
    /// Remaining upstream quota as reported by the provider, when known.
    pub remaining_quota: Option<i64>,
}

/// Aggregate store statistics for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolStats {
    pub symbol: String,
    pub record_count: u64,
    pub first_ts: Option<DateTime<Utc>>,
    pub last_ts: Option<DateTime<Utc>>,
    /// Fraction of stored candles with `validated = true`.
    pub validation_rate: f64,
    pub gaps_detected: u64,
}

/// Registry row plus store statistics, served to the query side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolSummary {
    pub symbol: String,
    pub asset_class: AssetClass,
    pub active: bool,
    pub timeframes: Vec<Timeframe>,
    pub backfill_status: BackfillStatus,
    pub last_backfill: Option<DateTime<Utc>>,
    pub backfill_error: Option<String>,
    pub record_count: u64,
    pub validation_rate: f64,
}
