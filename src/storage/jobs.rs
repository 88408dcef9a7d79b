//! Durable backfill-job records and per-unit progress.
//!
//! Written only by the orchestrator; progress writes are coalesced to one
//! update per unit transition, so the row churn stays bounded.

use super::{opt_ts_from_col, timeframes_from_col, timeframes_to_col, ts_to_col, Database};
use crate::error::{IngestError, IngestResult};
use crate::models::{
    BackfillJob, CompletenessEntry, JobStatus, JobUnitDetail, Timeframe, UnitStatus,
};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

impl Database {
    pub fn create_job(&self, job: &BackfillJob) -> IngestResult<()> {
        let conn = self.conn().lock();
        conn.execute(
            r#"
            INSERT INTO backfill_jobs (
                id, symbols, timeframes, start_date, end_date, status,
                progress_pct, symbols_completed, symbols_total, current_symbol,
                total_records_inserted, error, created_at, started_at, completed_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            "#,
            params![
                job.id.to_string(),
                job.symbols.join(","),
                timeframes_to_col(&job.timeframes),
                job.start.to_string(),
                job.end.to_string(),
                job.status.as_str(),
                job.progress_pct,
                job.symbols_completed as i64,
                job.symbols_total as i64,
                job.current_symbol,
                job.total_records_inserted as i64,
                job.error,
                ts_to_col(job.created_at),
                job.started_at.map(ts_to_col),
                job.completed_at.map(ts_to_col),
            ],
        )?;
        Ok(())
    }

    pub fn mark_job_running(&self, id: Uuid, started_at: DateTime<Utc>) -> IngestResult<()> {
        let conn = self.conn().lock();
        conn.execute(
            "UPDATE backfill_jobs SET status = 'running', started_at = ?2 WHERE id = ?1",
            params![id.to_string(), ts_to_col(started_at)],
        )?;
        Ok(())
    }

    /// Coalesced progress write; one call per unit transition.
    pub fn update_job_progress(
        &self,
        id: Uuid,
        progress_pct: f64,
        symbols_completed: usize,
        current_symbol: Option<&str>,
        total_records_inserted: u64,
    ) -> IngestResult<()> {
        let conn = self.conn().lock();
        conn.execute(
            r#"
            UPDATE backfill_jobs
            SET progress_pct = ?2, symbols_completed = ?3, current_symbol = ?4,
                total_records_inserted = ?5
            WHERE id = ?1
            "#,
            params![
                id.to_string(),
                progress_pct,
                symbols_completed as i64,
                current_symbol,
                total_records_inserted as i64,
            ],
        )?;
        Ok(())
    }

    pub fn finish_job(
        &self,
        id: Uuid,
        status: JobStatus,
        error: Option<&str>,
        completed_at: DateTime<Utc>,
    ) -> IngestResult<()> {
        let conn = self.conn().lock();
        conn.execute(
            r#"
            UPDATE backfill_jobs
            SET status = ?2, error = ?3, completed_at = ?4, current_symbol = NULL
            WHERE id = ?1
            "#,
            params![
                id.to_string(),
                status.as_str(),
                error,
                ts_to_col(completed_at),
            ],
        )?;
        Ok(())
    }

    /// Upsert one `(job, symbol, timeframe)` progress row.
    pub fn append_job_detail(&self, detail: &JobUnitDetail) -> IngestResult<()> {
        let conn = self.conn().lock();
        conn.execute(
            r#"
            INSERT INTO backfill_job_details (
                job_id, symbol, timeframe, status, records_fetched,
                records_inserted, duration_ms, error
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(job_id, symbol, timeframe) DO UPDATE SET
                status = excluded.status,
                records_fetched = excluded.records_fetched,
                records_inserted = excluded.records_inserted,
                duration_ms = excluded.duration_ms,
                error = excluded.error
            "#,
            params![
                detail.job_id.to_string(),
                detail.symbol,
                detail.timeframe.as_str(),
                detail.status.as_str(),
                detail.records_fetched as i64,
                detail.records_inserted as i64,
                detail.duration_ms as i64,
                detail.error,
            ],
        )?;
        Ok(())
    }

    pub fn load_job(&self, id: Uuid) -> IngestResult<Option<BackfillJob>> {
        let conn = self.conn().lock();
        let row = conn
            .query_row(
                r#"
                SELECT id, symbols, timeframes, start_date, end_date, status,
                       progress_pct, symbols_completed, symbols_total, current_symbol,
                       total_records_inserted, error, created_at, started_at, completed_at
                FROM backfill_jobs WHERE id = ?1
                "#,
                params![id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, f64>(6)?,
                        row.get::<_, i64>(7)?,
                        row.get::<_, i64>(8)?,
                        row.get::<_, Option<String>>(9)?,
                        row.get::<_, i64>(10)?,
                        row.get::<_, Option<String>>(11)?,
                        row.get::<_, i64>(12)?,
                        row.get::<_, Option<i64>>(13)?,
                        row.get::<_, Option<i64>>(14)?,
                    ))
                },
            )
            .optional()?;

        let Some((
            id,
            symbols,
            tfs,
            start,
            end,
            status,
            progress_pct,
            symbols_completed,
            symbols_total,
            current_symbol,
            total_records_inserted,
            error,
            created_at,
            started_at,
            completed_at,
        )) = row
        else {
            return Ok(None);
        };

        Ok(Some(BackfillJob {
            id: parse_uuid(&id)?,
            symbols: if symbols.is_empty() {
                Vec::new()
            } else {
                symbols.split(',').map(String::from).collect()
            },
            timeframes: timeframes_from_col(&tfs),
            start: parse_date(&start)?,
            end: parse_date(&end)?,
            status: status
                .parse::<JobStatus>()
                .map_err(IngestError::StorageIntegrity)?,
            progress_pct,
            symbols_completed: symbols_completed as usize,
            symbols_total: symbols_total as usize,
            current_symbol,
            total_records_inserted: total_records_inserted as u64,
            error,
            created_at: super::ts_from_col(created_at)?,
            started_at: opt_ts_from_col(started_at)?,
            completed_at: opt_ts_from_col(completed_at)?,
        }))
    }

    pub fn load_job_details(&self, id: Uuid) -> IngestResult<Vec<JobUnitDetail>> {
        let conn = self.conn().lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT symbol, timeframe, status, records_fetched, records_inserted,
                   duration_ms, error
            FROM backfill_job_details
            WHERE job_id = ?1
            ORDER BY symbol ASC, timeframe ASC
            "#,
        )?;
        let rows = stmt.query_map(params![id.to_string()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, Option<String>>(6)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (symbol, tf, status, fetched, inserted, duration_ms, error) = row?;
            out.push(JobUnitDetail {
                job_id: id,
                symbol,
                timeframe: tf
                    .parse::<Timeframe>()
                    .map_err(IngestError::StorageIntegrity)?,
                status: status
                    .parse::<UnitStatus>()
                    .map_err(IngestError::StorageIntegrity)?,
                records_fetched: fetched as u64,
                records_inserted: inserted as u64,
                duration_ms: duration_ms as u64,
                error,
            });
        }
        Ok(out)
    }

    /// Persist the completeness matrix alongside the job record.
    pub fn store_completeness(
        &self,
        job_id: Uuid,
        entries: &[CompletenessEntry],
    ) -> IngestResult<()> {
        let mut conn = self.conn().lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO job_completeness (
                    job_id, symbol, timeframe, complete,
                    gaps_detected, gaps_retried, gaps_filled
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ON CONFLICT(job_id, symbol, timeframe) DO UPDATE SET
                    complete = excluded.complete,
                    gaps_detected = excluded.gaps_detected,
                    gaps_retried = excluded.gaps_retried,
                    gaps_filled = excluded.gaps_filled
                "#,
            )?;
            for e in entries {
                stmt.execute(params![
                    job_id.to_string(),
                    e.symbol,
                    e.timeframe.as_str(),
                    e.complete as i32,
                    e.gaps_detected as i64,
                    e.gaps_retried as i64,
                    e.gaps_filled as i64,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn load_completeness(&self, job_id: Uuid) -> IngestResult<Vec<CompletenessEntry>> {
        let conn = self.conn().lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT symbol, timeframe, complete, gaps_detected, gaps_retried, gaps_filled
            FROM job_completeness WHERE job_id = ?1
            ORDER BY symbol ASC, timeframe ASC
            "#,
        )?;
        let rows = stmt.query_map(params![job_id.to_string()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, i64>(5)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (symbol, tf, complete, detected, retried, filled) = row?;
            out.push(CompletenessEntry {
                symbol,
                timeframe: tf
                    .parse::<Timeframe>()
                    .map_err(IngestError::StorageIntegrity)?,
                complete: complete != 0,
                gaps_detected: detected as u32,
                gaps_retried: retried as u32,
                gaps_filled: filled as u32,
            });
        }
        Ok(out)
    }

    /// Settle state a crashed process left behind: running jobs and
    /// in-progress symbols are marked failed so nothing rests mid-flight.
    /// Invoked once at startup, before the scheduler takes over.
    pub fn recover_interrupted(&self, at: DateTime<Utc>) -> IngestResult<(u64, u64)> {
        let conn = self.conn().lock();
        let jobs = conn.execute(
            r#"
            UPDATE backfill_jobs
            SET status = 'failed', error = 'interrupted by process restart',
                completed_at = ?1, current_symbol = NULL
            WHERE status = 'running'
            "#,
            params![ts_to_col(at)],
        )?;
        let symbols = conn.execute(
            r#"
            UPDATE tracked_symbols
            SET backfill_status = 'failed',
                backfill_error = 'interrupted by process restart'
            WHERE backfill_status = 'in_progress'
            "#,
            [],
        )?;
        Ok((jobs as u64, symbols as u64))
    }

    /// Whether any job is still marked running; the scheduler's overlap guard.
    pub fn has_running_job(&self) -> IngestResult<bool> {
        let conn = self.conn().lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM backfill_jobs WHERE status = 'running'",
            [],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}

fn parse_uuid(raw: &str) -> IngestResult<Uuid> {
    Uuid::parse_str(raw)
        .map_err(|e| IngestError::StorageIntegrity(format!("bad job id {raw:?}: {e}")))
}

fn parse_date(raw: &str) -> IngestResult<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|e| IngestError::StorageIntegrity(format!("bad date column {raw:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> Database {
        Database::open_memory().unwrap()
    }

    fn make_job() -> BackfillJob {
        BackfillJob {
            id: Uuid::new_v4(),
            symbols: vec!["AAPL".to_string(), "BTC".to_string()],
            timeframes: vec![Timeframe::D1],
            start: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            end: NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
            status: JobStatus::Queued,
            progress_pct: 0.0,
            symbols_completed: 0,
            symbols_total: 2,
            current_symbol: None,
            total_records_inserted: 0,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    #[test]
    fn test_job_round_trip() {
        let db = db();
        let job = make_job();
        db.create_job(&job).unwrap();

        let loaded = db.load_job(job.id).unwrap().unwrap();
        assert_eq!(loaded.id, job.id);
        assert_eq!(loaded.symbols, job.symbols);
        assert_eq!(loaded.timeframes, job.timeframes);
        assert_eq!(loaded.status, JobStatus::Queued);
        assert_eq!(loaded.start, job.start);
    }

    #[test]
    fn test_job_lifecycle_transitions() {
        let db = db();
        let job = make_job();
        db.create_job(&job).unwrap();

        db.mark_job_running(job.id, Utc::now()).unwrap();
        assert!(db.has_running_job().unwrap());

        db.update_job_progress(job.id, 50.0, 1, Some("BTC"), 123)
            .unwrap();
        let loaded = db.load_job(job.id).unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Running);
        assert_eq!(loaded.symbols_completed, 1);
        assert_eq!(loaded.current_symbol.as_deref(), Some("BTC"));
        assert_eq!(loaded.total_records_inserted, 123);

        db.finish_job(job.id, JobStatus::Completed, None, Utc::now())
            .unwrap();
        let loaded = db.load_job(job.id).unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Completed);
        assert!(loaded.current_symbol.is_none());
        assert!(loaded.completed_at.is_some());
        assert!(!db.has_running_job().unwrap());
    }

    #[test]
    fn test_unit_detail_upsert() {
        let db = db();
        let job = make_job();
        db.create_job(&job).unwrap();

        let mut detail = JobUnitDetail {
            job_id: job.id,
            symbol: "AAPL".to_string(),
            timeframe: Timeframe::D1,
            status: UnitStatus::Running,
            records_fetched: 0,
            records_inserted: 0,
            duration_ms: 0,
            error: None,
        };
        db.append_job_detail(&detail).unwrap();

        detail.status = UnitStatus::Completed;
        detail.records_fetched = 250;
        detail.records_inserted = 250;
        detail.duration_ms = 1800;
        db.append_job_detail(&detail).unwrap();

        let details = db.load_job_details(job.id).unwrap();
        assert_eq!(details.len(), 1);
        assert_eq!(details[0].status, UnitStatus::Completed);
        assert_eq!(details[0].records_inserted, 250);
    }

    #[test]
    fn test_recover_interrupted_settles_mid_flight_state() {
        let db = db();
        let job = make_job();
        db.create_job(&job).unwrap();
        db.mark_job_running(job.id, Utc::now()).unwrap();
        db.upsert_symbol(
            "AAPL",
            crate::models::AssetClass::Stock,
            &[Timeframe::D1],
            Utc::now(),
        )
        .unwrap();
        db.update_symbol_status(
            "AAPL",
            crate::models::BackfillStatus::InProgress,
            None,
            Utc::now(),
        )
        .unwrap();

        let (jobs, symbols) = db.recover_interrupted(Utc::now()).unwrap();
        assert_eq!(jobs, 1);
        assert_eq!(symbols, 1);

        let loaded = db.load_job(job.id).unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Failed);
        let sym = db.get_symbol("AAPL").unwrap().unwrap();
        assert_eq!(sym.backfill_status, crate::models::BackfillStatus::Failed);
        assert!(!db.has_running_job().unwrap());
    }

    #[test]
    fn test_completeness_round_trip() {
        let db = db();
        let job = make_job();
        db.create_job(&job).unwrap();

        let entries = vec![
            CompletenessEntry {
                symbol: "AAPL".to_string(),
                timeframe: Timeframe::D1,
                complete: true,
                gaps_detected: 0,
                gaps_retried: 0,
                gaps_filled: 0,
            },
            CompletenessEntry {
                symbol: "BTC".to_string(),
                timeframe: Timeframe::D1,
                complete: false,
                gaps_detected: 2,
                gaps_retried: 2,
                gaps_filled: 1,
            },
        ];
        db.store_completeness(job.id, &entries).unwrap();

        let loaded = db.load_completeness(job.id).unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(loaded[0].complete);
        assert_eq!(loaded[1].gaps_detected, 2);
        assert_eq!(loaded[1].gaps_filled, 1);
    }
}
