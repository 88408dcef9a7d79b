//! Job planning: submission validation, defaulting, and work enumeration.

use crate::calendar;
use crate::config::Config;
use crate::error::{IngestError, IngestResult};
use crate::models::{AssetClass, BackfillJob, JobRequest, JobStatus, Timeframe};
use crate::registry::SymbolRegistry;
use chrono::{DateTime, Days, NaiveDate, Utc};
use uuid::Uuid;

/// Hard cap on a single submission.
pub const MAX_SYMBOLS_PER_JOB: usize = 100;

/// One symbol's share of a job.
#[derive(Debug, Clone)]
pub struct SymbolPlan {
    pub symbol: String,
    pub asset_class: AssetClass,
    /// Processed sequentially within the symbol.
    pub timeframes: Vec<Timeframe>,
}

/// Fully-resolved work enumeration for one job.
#[derive(Debug, Clone)]
pub struct JobPlan {
    pub job: BackfillJob,
    pub symbols: Vec<SymbolPlan>,
    /// Date-range chunks shared by every `(symbol, timeframe)` pair,
    /// ascending; no upstream call spans more than one chunk.
    pub chunks: Vec<(NaiveDate, NaiveDate)>,
}

impl JobPlan {
    /// Total `(symbol, timeframe, chunk)` units, the progress denominator.
    pub fn units_total(&self) -> usize {
        let per_chunk: usize = self.symbols.iter().map(|s| s.timeframes.len()).sum();
        per_chunk * self.chunks.len()
    }
}

/// Validate a submission and enumerate its work.
///
/// Defaults: all active symbols, each symbol's configured timeframes, and
/// `[today - DEFAULT_HISTORY_DAYS, today]`.
pub fn build_plan(
    registry: &SymbolRegistry,
    config: &Config,
    request: &JobRequest,
    now: DateTime<Utc>,
) -> IngestResult<JobPlan> {
    let end = request.end.unwrap_or_else(|| now.date_naive());
    let start = match request.start {
        Some(s) => s,
        None => end
            .checked_sub_days(Days::new(config.default_history_days as u64))
            .ok_or_else(|| IngestError::Validation {
                context: "date_range".to_string(),
                message: "history window underflows the calendar".to_string(),
            })?,
    };
    if start > end {
        return Err(IngestError::Validation {
            context: "date_range".to_string(),
            message: format!("start {start} is after end {end}"),
        });
    }

    let tracked = match &request.symbols {
        Some(list) => {
            if list.is_empty() {
                return Err(IngestError::Validation {
                    context: "symbols".to_string(),
                    message: "explicit symbol list is empty".to_string(),
                });
            }
            registry.resolve(list)?
        }
        None => registry.list_active()?,
    };
    // The cap binds however the symbol set was produced; a registry grown
    // past it must not slip through the daily default scope.
    if tracked.len() > MAX_SYMBOLS_PER_JOB {
        return Err(IngestError::Validation {
            context: "symbols".to_string(),
            message: format!(
                "{} symbols exceeds the {MAX_SYMBOLS_PER_JOB} per-job cap",
                tracked.len()
            ),
        });
    }

    let mut symbols = Vec::with_capacity(tracked.len());
    for t in tracked {
        let timeframes = match &request.timeframes {
            Some(explicit) => explicit.clone(),
            None => t.timeframes.clone(),
        };
        // A symbol whose stored configuration decayed to nothing has no
        // enumerable work.
        if timeframes.is_empty() {
            continue;
        }
        symbols.push(SymbolPlan {
            symbol: t.symbol,
            asset_class: t.asset_class,
            timeframes,
        });
    }

    let chunks = calendar::chunk_range(start, end, config.chunk_days);

    let mut requested_timeframes: Vec<Timeframe> = symbols
        .iter()
        .flat_map(|s| s.timeframes.iter().copied())
        .collect();
    requested_timeframes.sort();
    requested_timeframes.dedup();

    let job = BackfillJob {
        id: Uuid::new_v4(),
        symbols: symbols.iter().map(|s| s.symbol.clone()).collect(),
        timeframes: requested_timeframes,
        start,
        end,
        status: JobStatus::Queued,
        progress_pct: 0.0,
        symbols_completed: 0,
        symbols_total: symbols.len(),
        current_symbol: None,
        total_records_inserted: 0,
        error: None,
        created_at: now,
        started_at: None,
        completed_at: None,
    };

    Ok(JobPlan {
        job,
        symbols,
        chunks,
    })
}
