//! The backfill orchestrator.
//!
//! Drives a planned job end to end: releases symbols in staggered groups
//! under the concurrency cap, runs the fetch-validate-persist pipeline per
//! `(symbol, timeframe, chunk)` unit, absorbs unit failures into per-unit
//! and per-symbol status, then sweeps remaining gaps with a bounded retry
//! loop and persists the completeness matrix.
//!
//! Error policy: a failed unit never fails the job. The job itself fails
//! only when it cannot run at all (deadline exceeded, cancellation).

use super::plan::{build_plan, JobPlan, SymbolPlan};
use crate::config::Config;
use crate::error::{IngestError, IngestResult};
use crate::models::{
    BackfillJob, BackfillStatus, CompletenessEntry, DateRange, JobRequest, JobStatus,
    JobUnitDetail, Timeframe, UnitStatus,
};
use crate::observability::{LogLevel, ObservabilitySink};
use crate::registry::SymbolRegistry;
use crate::storage::Database;
use crate::upstream::MarketDataProvider;
use crate::validate::validate_batch;
use chrono::{NaiveDate, Utc};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

const SYMBOL_ERROR_MAX_LEN: usize = 500;
const GAP_RETRY_BASE_DELAY: Duration = Duration::from_secs(2);

pub struct Orchestrator {
    config: Config,
    db: Arc<Database>,
    registry: SymbolRegistry,
    provider: Arc<dyn MarketDataProvider>,
    sink: Arc<dyn ObservabilitySink>,
}

/// Shared per-job progress counters; each unit transition coalesces into
/// one job-row update.
struct JobState {
    units_total: usize,
    units_done: AtomicUsize,
    symbols_completed: AtomicUsize,
    total_inserted: AtomicU64,
}

impl JobState {
    fn progress_pct(&self) -> f64 {
        if self.units_total == 0 {
            return 100.0;
        }
        (self.units_done.load(Ordering::SeqCst) as f64 / self.units_total as f64 * 100.0)
            .min(100.0)
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct UnitCounts {
    fetched: u64,
    inserted: u64,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        db: Arc<Database>,
        provider: Arc<dyn MarketDataProvider>,
        sink: Arc<dyn ObservabilitySink>,
    ) -> Self {
        let registry = SymbolRegistry::new(db.clone());
        Self {
            config,
            db,
            registry,
            provider,
            sink,
        }
    }

    pub fn registry(&self) -> &SymbolRegistry {
        &self.registry
    }

    /// Validate a submission and create the durable job record, without
    /// running it. Submission validation errors reject the request before
    /// any record exists; afterwards the job id is stable and queryable.
    pub fn prepare(&self, request: &JobRequest) -> IngestResult<JobPlan> {
        let plan = build_plan(&self.registry, &self.config, request, Utc::now())?;
        self.db.create_job(&plan.job)?;
        Ok(plan)
    }

    /// Validate a submission, create the durable job record, and run it.
    /// Once created, the job always reaches a terminal status.
    pub async fn execute(
        self: &Arc<Self>,
        request: JobRequest,
        cancel: &CancellationToken,
    ) -> IngestResult<BackfillJob> {
        let plan = self.prepare(&request)?;
        self.run_prepared(plan, cancel).await
    }

    /// Run a previously prepared job to a terminal status.
    pub async fn run_prepared(
        self: &Arc<Self>,
        plan: JobPlan,
        cancel: &CancellationToken,
    ) -> IngestResult<BackfillJob> {
        let job_id = plan.job.id;
        let trace = job_id.to_string();
        let started = Instant::now();

        self.db.mark_job_running(job_id, Utc::now())?;
        self.sink.event(
            &trace,
            "orchestrator",
            "job_started",
            LogLevel::Info,
            &[
                ("symbols", plan.job.symbols.len().to_string()),
                ("start", plan.job.start.to_string()),
                ("end", plan.job.end.to_string()),
            ],
        );
        self.sink.counter("warehouse_jobs_total", 1, &[]);

        let state = Arc::new(JobState {
            units_total: plan.units_total(),
            units_done: AtomicUsize::new(0),
            symbols_completed: AtomicUsize::new(0),
            total_inserted: AtomicU64::new(0),
        });

        // Per-job deadline: cancels every in-flight unit and fails the job.
        let job_cancel = cancel.child_token();
        let deadline_hit = Arc::new(AtomicBool::new(false));
        let watchdog = {
            let token = job_cancel.clone();
            let flag = deadline_hit.clone();
            let deadline = self.config.job_deadline();
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                flag.store(true, Ordering::SeqCst);
                token.cancel();
            })
        };

        let chunks = Arc::new(plan.chunks.clone());
        let cap = self.config.max_concurrent_symbols;

        'groups: for (group_idx, group) in plan.symbols.chunks(cap).enumerate() {
            if group_idx > 0
                && !sleep_cancellable(
                    Duration::from_secs(self.config.inter_group_pause_secs),
                    &job_cancel,
                )
                .await
            {
                break 'groups;
            }

            let mut handles = Vec::with_capacity(group.len());
            for (slot, sp) in group.iter().enumerate() {
                let this = Arc::clone(self);
                let sp = sp.clone();
                let chunks = chunks.clone();
                let state = state.clone();
                let trace = trace.clone();
                let token = job_cancel.clone();
                let stagger =
                    Duration::from_secs(self.config.inter_symbol_stagger_secs * slot as u64);
                handles.push(tokio::spawn(async move {
                    if !stagger.is_zero() && !sleep_cancellable(stagger, &token).await {
                        return;
                    }
                    this.process_symbol(job_id, &trace, &sp, &chunks, &state, &token)
                        .await;
                }));
            }
            for handle in handles {
                // Symbol tasks absorb their own errors; a panic is a bug
                // worth surfacing.
                if let Err(e) = handle.await {
                    warn!(error = %e, "Symbol task aborted");
                }
            }
            if job_cancel.is_cancelled() {
                break 'groups;
            }
        }

        watchdog.abort();

        if job_cancel.is_cancelled() {
            let message = if deadline_hit.load(Ordering::SeqCst) {
                format!(
                    "job deadline of {}s exceeded",
                    self.config.job_deadline_secs
                )
            } else {
                "job cancelled".to_string()
            };
            self.sink.event(
                &trace,
                "orchestrator",
                "job_failed",
                LogLevel::Error,
                &[("reason", message.clone())],
            );
            self.sink.counter(
                "warehouse_jobs_failed_total",
                1,
                &[("reason", "deadline_or_cancel".to_string())],
            );
            self.db
                .finish_job(job_id, JobStatus::Failed, Some(&message), Utc::now())?;
            return self.load_finished(job_id);
        }

        // Gap sweep and bounded retry, then the completeness matrix.
        let completeness = self
            .gap_retry_pass(job_id, &trace, &plan, &job_cancel)
            .await?;
        self.db.store_completeness(job_id, &completeness)?;
        let incomplete = completeness.iter().filter(|e| !e.complete).count();
        self.sink.event(
            &trace,
            "orchestrator",
            "completeness_emitted",
            LogLevel::Info,
            &[
                ("pairs", completeness.len().to_string()),
                ("incomplete", incomplete.to_string()),
            ],
        );

        self.db.update_job_progress(
            job_id,
            100.0,
            state.symbols_completed.load(Ordering::SeqCst),
            None,
            state.total_inserted.load(Ordering::SeqCst),
        )?;
        self.db
            .finish_job(job_id, JobStatus::Completed, None, Utc::now())?;
        self.sink.event(
            &trace,
            "orchestrator",
            "job_completed",
            LogLevel::Info,
            &[(
                "records_inserted",
                state.total_inserted.load(Ordering::SeqCst).to_string(),
            )],
        );
        self.sink
            .timer("warehouse_job_duration_seconds", started.elapsed(), &[]);

        self.load_finished(job_id)
    }

    fn load_finished(&self, job_id: Uuid) -> IngestResult<BackfillJob> {
        self.db.load_job(job_id)?.ok_or_else(|| {
            IngestError::StorageTransient(format!("job {job_id} vanished from the store"))
        })
    }

    /// Run every `(timeframe, chunk)` unit of one symbol sequentially, then
    /// settle the symbol's terminal status.
    async fn process_symbol(
        self: &Arc<Self>,
        job_id: Uuid,
        trace: &str,
        sp: &SymbolPlan,
        chunks: &[(NaiveDate, NaiveDate)],
        state: &JobState,
        cancel: &CancellationToken,
    ) {
        self.sink.event(
            trace,
            "orchestrator",
            "symbol_started",
            LogLevel::Info,
            &[("symbol", sp.symbol.clone())],
        );
        if let Err(e) =
            self.db
                .update_symbol_status(&sp.symbol, BackfillStatus::InProgress, None, Utc::now())
        {
            warn!(symbol = %sp.symbol, error = %e, "Failed to mark symbol in progress");
        }
        self.sink.counter(
            "warehouse_symbol_transitions_total",
            1,
            &[("status", "in_progress".to_string())],
        );

        let mut symbol_errors: Vec<String> = Vec::new();

        for tf in &sp.timeframes {
            let unit_started = Instant::now();
            let mut detail = JobUnitDetail {
                job_id,
                symbol: sp.symbol.clone(),
                timeframe: *tf,
                status: UnitStatus::Running,
                records_fetched: 0,
                records_inserted: 0,
                duration_ms: 0,
                error: None,
            };
            if let Err(e) = self.db.append_job_detail(&detail) {
                warn!(symbol = %sp.symbol, error = %e, "Failed to record unit start");
            }

            let mut unit_errors: Vec<String> = Vec::new();
            for (chunk_start, chunk_end) in chunks {
                if cancel.is_cancelled() {
                    unit_errors.push("cancelled before completion".to_string());
                    break;
                }
                match self
                    .run_unit_with_schema_recovery(sp, *tf, *chunk_start, *chunk_end, cancel)
                    .await
                {
                    Ok(counts) => {
                        detail.records_fetched += counts.fetched;
                        detail.records_inserted += counts.inserted;
                        state
                            .total_inserted
                            .fetch_add(counts.inserted, Ordering::SeqCst);
                    }
                    Err(e) => {
                        self.sink.counter(
                            "warehouse_unit_errors_total",
                            1,
                            &[("kind", e.kind().to_string())],
                        );
                        unit_errors.push(format!("{chunk_start}..{chunk_end}: {e}"));
                        if matches!(e, IngestError::Cancelled) {
                            break;
                        }
                    }
                }
                state.units_done.fetch_add(1, Ordering::SeqCst);
                if let Err(e) = self.db.update_job_progress(
                    job_id,
                    state.progress_pct(),
                    state.symbols_completed.load(Ordering::SeqCst),
                    Some(&sp.symbol),
                    state.total_inserted.load(Ordering::SeqCst),
                ) {
                    warn!(error = %e, "Failed to update job progress");
                }
            }

            detail.duration_ms = unit_started.elapsed().as_millis() as u64;
            let unit_failed = !unit_errors.is_empty();
            detail.status = if unit_failed {
                UnitStatus::Failed
            } else {
                UnitStatus::Completed
            };
            detail.error = if unit_failed {
                Some(truncate(&unit_errors.join("; "), SYMBOL_ERROR_MAX_LEN))
            } else {
                None
            };
            if let Err(e) = self.db.append_job_detail(&detail) {
                warn!(symbol = %sp.symbol, error = %e, "Failed to record unit result");
            }

            self.sink.event(
                trace,
                "orchestrator",
                if unit_failed { "unit_failed" } else { "unit_completed" },
                if unit_failed { LogLevel::Warn } else { LogLevel::Info },
                &[
                    ("symbol", sp.symbol.clone()),
                    ("timeframe", tf.to_string()),
                    ("records_inserted", detail.records_inserted.to_string()),
                ],
            );
            self.sink.counter(
                "warehouse_units_total",
                1,
                &[(
                    "status",
                    if unit_failed { "failed" } else { "completed" }.to_string(),
                )],
            );
            self.sink.timer(
                "warehouse_unit_duration_seconds",
                unit_started.elapsed(),
                &[("timeframe", tf.to_string())],
            );

            symbol_errors.extend(unit_errors);
        }

        let success = symbol_errors.is_empty();
        let (status, error) = if success {
            (BackfillStatus::Completed, None)
        } else {
            (
                BackfillStatus::Failed,
                Some(truncate(&symbol_errors.join("; "), SYMBOL_ERROR_MAX_LEN)),
            )
        };
        if let Err(e) =
            self.db
                .update_symbol_status(&sp.symbol, status, error.as_deref(), Utc::now())
        {
            warn!(symbol = %sp.symbol, error = %e, "Failed to settle symbol status");
        }
        if success {
            state.symbols_completed.fetch_add(1, Ordering::SeqCst);
        }
        self.sink.event(
            trace,
            "orchestrator",
            if success { "symbol_completed" } else { "symbol_failed" },
            if success { LogLevel::Info } else { LogLevel::Warn },
            &[("symbol", sp.symbol.clone())],
        );
        self.sink.counter(
            "warehouse_symbol_transitions_total",
            1,
            &[("status", status.as_str().to_string())],
        );
    }

    /// One unit: discover what is actually missing inside the chunk, then
    /// fetch-validate-persist each missing span. A chunk whose days are all
    /// present issues no upstream calls, which is what makes re-runs cheap
    /// and crash resume work.
    async fn run_unit(
        &self,
        sp: &SymbolPlan,
        timeframe: Timeframe,
        chunk_start: NaiveDate,
        chunk_end: NaiveDate,
        cancel: &CancellationToken,
    ) -> IngestResult<UnitCounts> {
        let mut counts = UnitCounts::default();
        let gaps = self
            .db
            .find_gaps(&sp.symbol, sp.asset_class, timeframe, chunk_start, chunk_end)?;

        for gap in gaps {
            counts = self
                .fill_range(sp, timeframe, gap, cancel, counts)
                .await?;
        }
        Ok(counts)
    }

    async fn fill_range(
        &self,
        sp: &SymbolPlan,
        timeframe: Timeframe,
        range: DateRange,
        cancel: &CancellationToken,
        mut counts: UnitCounts,
    ) -> IngestResult<UnitCounts> {
        let raw = self
            .provider
            .fetch_candles(
                cancel,
                &sp.symbol,
                sp.asset_class,
                timeframe,
                range.start,
                range.end,
            )
            .await?;
        counts.fetched += raw.len() as u64;
        if raw.is_empty() {
            // The provider has nothing for this window; the audit entry is
            // already recorded and the unit still succeeds.
            return Ok(counts);
        }

        let now = Utc::now();
        let (validated, summary) =
            validate_batch(&sp.symbol, timeframe, self.provider.source_tag(), &raw, now);
        self.db
            .append_validation_log(&sp.symbol, timeframe, &summary, now)?;
        if summary.failed > 0 {
            self.sink.counter(
                "warehouse_validation_failures_total",
                summary.failed as u64,
                &[],
            );
        }

        let outcome = match self.db.upsert_candles(&validated, timeframe) {
            Ok(o) => o,
            Err(e @ IngestError::StorageIntegrity(_)) => {
                // Defense in depth caught a validator bug.
                self.sink
                    .alert("storage_integrity", &format!("{}/{}: {e}", sp.symbol, timeframe));
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        counts.inserted += outcome.touched();
        self.sink
            .counter("warehouse_candles_inserted_total", outcome.inserted, &[]);
        Ok(counts)
    }

    async fn run_unit_with_schema_recovery(
        &self,
        sp: &SymbolPlan,
        timeframe: Timeframe,
        chunk_start: NaiveDate,
        chunk_end: NaiveDate,
        cancel: &CancellationToken,
    ) -> IngestResult<UnitCounts> {
        match self
            .run_unit(sp, timeframe, chunk_start, chunk_end, cancel)
            .await
        {
            Err(IngestError::SchemaMissing(msg)) => {
                warn!(symbol = %sp.symbol, error = %msg, "Schema missing mid-job, re-running ensure");
                self.db
                    .ensure_schema()
                    .map_err(|e| IngestError::SchemaMissing(e.to_string()))?;
                self.run_unit(sp, timeframe, chunk_start, chunk_end, cancel)
                    .await
            }
            other => other,
        }
    }

    /// Gap pass: sweep the whole job range per `(symbol, timeframe)`,
    /// retry each remaining gap with exponential backoff, and report what
    /// stayed open. Unfilled gaps downgrade nothing; they only show in the
    /// matrix.
    async fn gap_retry_pass(
        &self,
        _job_id: Uuid,
        trace: &str,
        plan: &JobPlan,
        cancel: &CancellationToken,
    ) -> IngestResult<Vec<CompletenessEntry>> {
        let mut entries = Vec::new();

        for sp in &plan.symbols {
            for tf in &sp.timeframes {
                let gaps =
                    self.db
                        .find_gaps(&sp.symbol, sp.asset_class, *tf, plan.job.start, plan.job.end)?;
                let detected = gaps.len() as u32;
                let mut retried = 0u32;
                let mut filled = 0u32;

                for gap in &gaps {
                    if cancel.is_cancelled() {
                        break;
                    }
                    retried += 1;
                    self.sink.event(
                        trace,
                        "orchestrator",
                        "gap_retry",
                        LogLevel::Info,
                        &[
                            ("symbol", sp.symbol.clone()),
                            ("timeframe", tf.to_string()),
                            ("start", gap.start.to_string()),
                            ("end", gap.end.to_string()),
                        ],
                    );

                    let mut gap_filled = false;
                    for attempt in 1..=self.config.gap_retry_max_attempts {
                        let delay = GAP_RETRY_BASE_DELAY
                            .saturating_mul(1 << attempt.saturating_sub(1).min(16));
                        if !sleep_cancellable(delay, cancel).await {
                            break;
                        }
                        match self.fill_range(sp, *tf, *gap, cancel, UnitCounts::default()).await
                        {
                            Ok(_) => {}
                            Err(e) => {
                                warn!(symbol = %sp.symbol, timeframe = %tf, attempt = attempt,
                                      error = %e, "Gap refetch failed");
                                continue;
                            }
                        }
                        let remaining = self.db.find_gaps(
                            &sp.symbol,
                            sp.asset_class,
                            *tf,
                            gap.start,
                            gap.end,
                        )?;
                        if remaining.is_empty() {
                            gap_filled = true;
                            break;
                        }
                    }
                    if gap_filled {
                        filled += 1;
                    }
                }

                let complete = self
                    .db
                    .find_gaps(&sp.symbol, sp.asset_class, *tf, plan.job.start, plan.job.end)?
                    .is_empty();

                self.sink.counter(
                    "warehouse_gaps_detected_total",
                    detected as u64,
                    &[],
                );
                self.sink
                    .counter("warehouse_gaps_filled_total", filled as u64, &[]);

                entries.push(CompletenessEntry {
                    symbol: sp.symbol.clone(),
                    timeframe: *tf,
                    complete,
                    gaps_detected: detected,
                    gaps_retried: retried,
                    gaps_filled: filled,
                });
            }
        }
        Ok(entries)
    }
}

/// Sleep that observes cancellation; `false` means the token fired first.
async fn sleep_cancellable(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = cancel.cancelled() => false,
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &s[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AssetClass;
    use crate::observability::RecordingSink;
    use crate::upstream::mock::{MockProvider, ScriptedFailure};

    fn test_config() -> Config {
        Config {
            upstream_api_key: "k".to_string(),
            database_url: ":memory:".to_string(),
            upstream_base_url: "http://localhost".to_string(),
            schedule_hour: 2,
            schedule_minute: 0,
            misfire_grace_secs: 600,
            max_concurrent_symbols: 3,
            inter_group_pause_secs: 15,
            inter_symbol_stagger_secs: 5,
            chunk_days: 365,
            default_history_days: 365,
            gap_retry_max_attempts: 2,
            upstream_call_timeout_secs: 30,
            job_deadline_secs: 14_400,
            rate_limit: 60,
            rate_window_secs: 60,
            rate_burst: 10,
            metrics_port: 0,
        }
    }

    struct Harness {
        orchestrator: Arc<Orchestrator>,
        db: Arc<Database>,
        provider: Arc<MockProvider>,
        sink: Arc<RecordingSink>,
    }

    fn harness(config: Config) -> Harness {
        let db = Arc::new(Database::open_memory().unwrap());
        let provider = Arc::new(MockProvider::new());
        let sink = Arc::new(RecordingSink::default());
        let orchestrator = Arc::new(Orchestrator::new(
            config,
            db.clone(),
            provider.clone(),
            sink.clone(),
        ));
        Harness {
            orchestrator,
            db,
            provider,
            sink,
        }
    }

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn week_request(symbols: &[&str]) -> JobRequest {
        JobRequest {
            symbols: Some(symbols.iter().map(|s| s.to_string()).collect()),
            timeframes: Some(vec![Timeframe::D1]),
            start: Some(d(2024, 1, 1)),
            end: Some(d(2024, 1, 5)),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_symbol_job_completes() {
        let h = harness(test_config());
        h.orchestrator
            .registry()
            .add_symbol("AAPL", AssetClass::Stock, &[Timeframe::D1])
            .unwrap();
        h.provider
            .push_daily_candles("AAPL", AssetClass::Stock, d(2024, 1, 1), d(2024, 1, 5), 100.0);

        let cancel = CancellationToken::new();
        let job = h
            .orchestrator
            .execute(week_request(&["AAPL"]), &cancel)
            .await
            .unwrap();

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress_pct, 100.0);
        assert_eq!(job.symbols_completed, 1);
        assert_eq!(job.total_records_inserted, 5);

        let sym = h.db.get_symbol("AAPL").unwrap().unwrap();
        assert_eq!(sym.backfill_status, BackfillStatus::Completed);
        assert!(sym.backfill_error.is_none());

        let details = h.db.load_job_details(job.id).unwrap();
        assert_eq!(details.len(), 1);
        assert_eq!(details[0].status, UnitStatus::Completed);
        assert_eq!(details[0].records_inserted, 5);

        let matrix = h.db.load_completeness(job.id).unwrap();
        assert_eq!(matrix.len(), 1);
        assert!(matrix[0].complete);
        assert_eq!(matrix[0].gaps_detected, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_symbols_start_within_stagger() {
        let mut config = test_config();
        config.max_concurrent_symbols = 2;
        let h = harness(config);
        for s in ["BTC", "ETH"] {
            h.orchestrator
                .registry()
                .add_symbol(s, AssetClass::Crypto, &[Timeframe::D1])
                .unwrap();
            h.provider
                .push_daily_candles(s, AssetClass::Crypto, d(2024, 1, 1), d(2024, 1, 5), 100.0);
        }

        let cancel = CancellationToken::new();
        let job = h
            .orchestrator
            .execute(week_request(&["BTC", "ETH"]), &cancel)
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.symbols_completed, 2);

        let first = h.provider.first_call_instant("BTC").unwrap();
        let second = h.provider.first_call_instant("ETH").unwrap();
        let skew = if second > first {
            second - first
        } else {
            first - second
        };
        assert!(skew <= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_symbol_does_not_fail_job() {
        let h = harness(test_config());
        for s in ["AAPL", "MSFT"] {
            h.orchestrator
                .registry()
                .add_symbol(s, AssetClass::Stock, &[Timeframe::D1])
                .unwrap();
        }
        h.provider
            .push_daily_candles("AAPL", AssetClass::Stock, d(2024, 1, 1), d(2024, 1, 5), 100.0);
        // MSFT: not-found on the primary fetch and on both gap retries.
        h.provider.script_failures(
            "MSFT",
            &[
                ScriptedFailure::NotFound,
                ScriptedFailure::NotFound,
                ScriptedFailure::NotFound,
            ],
        );

        let cancel = CancellationToken::new();
        let job = h
            .orchestrator
            .execute(week_request(&["AAPL", "MSFT"]), &cancel)
            .await
            .unwrap();

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.symbols_completed, 1);

        let aapl = h.db.get_symbol("AAPL").unwrap().unwrap();
        assert_eq!(aapl.backfill_status, BackfillStatus::Completed);
        let msft = h.db.get_symbol("MSFT").unwrap().unwrap();
        assert_eq!(msft.backfill_status, BackfillStatus::Failed);
        assert!(msft.backfill_error.is_some());

        let details = h.db.load_job_details(job.id).unwrap();
        let msft_detail = details.iter().find(|u| u.symbol == "MSFT").unwrap();
        assert_eq!(msft_detail.status, UnitStatus::Failed);
        assert!(msft_detail.error.as_deref().unwrap().contains("404"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_complete_data_issues_no_upstream_calls() {
        let h = harness(test_config());
        h.orchestrator
            .registry()
            .add_symbol("AAPL", AssetClass::Stock, &[Timeframe::D1])
            .unwrap();
        h.provider
            .push_daily_candles("AAPL", AssetClass::Stock, d(2024, 1, 1), d(2024, 1, 5), 100.0);

        let cancel = CancellationToken::new();
        let first = h
            .orchestrator
            .execute(week_request(&["AAPL"]), &cancel)
            .await
            .unwrap();
        assert_eq!(first.status, JobStatus::Completed);
        let calls_after_first = h.provider.calls_for("AAPL");
        assert!(calls_after_first > 0);

        // Same range again: discovery finds no gaps, so no fetches.
        let second = h
            .orchestrator
            .execute(week_request(&["AAPL"]), &cancel)
            .await
            .unwrap();
        assert_eq!(second.status, JobStatus::Completed);
        assert_eq!(h.provider.calls_for("AAPL"), calls_after_first);

        let count = h
            .db
            .count_candles_in_range("AAPL", Timeframe::D1, d(2024, 1, 1), d(2024, 1, 5))
            .unwrap();
        assert_eq!(count, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_gap_surfaces_in_matrix_only() {
        let h = harness(test_config());
        h.orchestrator
            .registry()
            .add_symbol("AAPL", AssetClass::Stock, &[Timeframe::D1])
            .unwrap();
        // Provider is missing Wednesday Jan 3 forever.
        for day in [1, 2, 4, 5] {
            let date = d(2024, 1, day);
            h.provider
                .push_daily_candles("AAPL", AssetClass::Stock, date, date, 100.0);
        }

        let cancel = CancellationToken::new();
        let job = h
            .orchestrator
            .execute(week_request(&["AAPL"]), &cancel)
            .await
            .unwrap();

        // Primary pass succeeded, so the symbol is completed even though a
        // gap stayed open.
        assert_eq!(job.status, JobStatus::Completed);
        let sym = h.db.get_symbol("AAPL").unwrap().unwrap();
        assert_eq!(sym.backfill_status, BackfillStatus::Completed);

        let matrix = h.db.load_completeness(job.id).unwrap();
        assert_eq!(matrix.len(), 1);
        assert!(!matrix[0].complete);
        assert_eq!(matrix[0].gaps_detected, 1);
        assert_eq!(matrix[0].gaps_retried, 1);
        assert_eq!(matrix[0].gaps_filled, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gap_filled_by_retry() {
        let h = harness(test_config());
        h.orchestrator
            .registry()
            .add_symbol("AAPL", AssetClass::Stock, &[Timeframe::D1])
            .unwrap();
        h.provider
            .push_daily_candles("AAPL", AssetClass::Stock, d(2024, 1, 1), d(2024, 1, 5), 100.0);
        // Primary fetch fails transiently through the whole retry budget of
        // the (mock) client path, then the gap pass succeeds.
        h.provider
            .script_failures("AAPL", &[ScriptedFailure::Transient]);

        let cancel = CancellationToken::new();
        let job = h
            .orchestrator
            .execute(week_request(&["AAPL"]), &cancel)
            .await
            .unwrap();

        assert_eq!(job.status, JobStatus::Completed);
        // Unit failed in the primary pass, so the symbol failed...
        let sym = h.db.get_symbol("AAPL").unwrap().unwrap();
        assert_eq!(sym.backfill_status, BackfillStatus::Failed);
        // ...but the retry loop still filled the range.
        let matrix = h.db.load_completeness(job.id).unwrap();
        assert!(matrix[0].complete);
        assert_eq!(matrix[0].gaps_filled, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_fails_job() {
        let mut config = test_config();
        config.max_concurrent_symbols = 1;
        config.job_deadline_secs = 10;
        config.inter_group_pause_secs = 15;
        let h = harness(config);
        for s in ["AAPL", "MSFT"] {
            h.orchestrator
                .registry()
                .add_symbol(s, AssetClass::Stock, &[Timeframe::D1])
                .unwrap();
            h.provider
                .push_daily_candles(s, AssetClass::Stock, d(2024, 1, 1), d(2024, 1, 5), 100.0);
        }

        let cancel = CancellationToken::new();
        let job = h
            .orchestrator
            .execute(week_request(&["AAPL", "MSFT"]), &cancel)
            .await
            .unwrap();

        // The inter-group pause outlives the 10s deadline.
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.as_deref().unwrap().contains("deadline"));
        // The second group never fetched.
        assert_eq!(h.provider.calls_for("MSFT"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_window_unit_succeeds() {
        let h = harness(test_config());
        h.orchestrator
            .registry()
            .add_symbol("AAPL", AssetClass::Stock, &[Timeframe::D1])
            .unwrap();
        // No fixtures at all: provider returns empty for every window.

        let cancel = CancellationToken::new();
        let job = h
            .orchestrator
            .execute(week_request(&["AAPL"]), &cancel)
            .await
            .unwrap();

        assert_eq!(job.status, JobStatus::Completed);
        let sym = h.db.get_symbol("AAPL").unwrap().unwrap();
        // Empty result is not a failure.
        assert_eq!(sym.backfill_status, BackfillStatus::Completed);
        assert_eq!(job.total_records_inserted, 0);

        // The range stays incomplete; that is the matrix's business.
        let matrix = h.db.load_completeness(job.id).unwrap();
        assert!(!matrix[0].complete);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unit_events_reach_the_sink() {
        let h = harness(test_config());
        h.orchestrator
            .registry()
            .add_symbol("AAPL", AssetClass::Stock, &[Timeframe::D1])
            .unwrap();
        h.provider
            .push_daily_candles("AAPL", AssetClass::Stock, d(2024, 1, 1), d(2024, 1, 5), 100.0);

        let cancel = CancellationToken::new();
        let job = h
            .orchestrator
            .execute(week_request(&["AAPL"]), &cancel)
            .await
            .unwrap();

        let events = h.sink.events.lock();
        let names: Vec<&str> = events.iter().map(|(_, _, e)| e.as_str()).collect();
        assert!(names.contains(&"job_started"));
        assert!(names.contains(&"symbol_started"));
        assert!(names.contains(&"unit_completed"));
        assert!(names.contains(&"symbol_completed"));
        assert!(names.contains(&"completeness_emitted"));
        assert!(names.contains(&"job_completed"));
        // Trace id is the job id on every orchestrator event.
        assert!(events
            .iter()
            .filter(|(_, c, _)| c == "orchestrator")
            .all(|(t, _, _)| t == &job.id.to_string()));
    }
}
