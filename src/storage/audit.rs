//! Append-only logs: upstream call audit and per-batch validation outcomes.
//!
//! The orchestrator and client only ever write here; the read side belongs
//! to observability tooling.

use super::{ts_to_col, Database};
use crate::error::IngestResult;
use crate::models::{AuditEntry, BatchSummary, Timeframe};
use chrono::{DateTime, Utc};
use rusqlite::params;

impl Database {
    pub fn append_audit_entry(&self, entry: &AuditEntry) -> IngestResult<()> {
        let conn = self.conn().lock();
        conn.execute(
            r#"
            INSERT INTO upstream_audit_log (
                symbol, timeframe, endpoint, fetched_at, records_fetched,
                records_inserted, records_updated, response_time_ms,
                success, error, remaining_quota
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            params![
                entry.symbol,
                entry.timeframe.map(|t| t.as_str()),
                entry.endpoint,
                ts_to_col(entry.fetched_at),
                entry.records_fetched as i64,
                entry.records_inserted as i64,
                entry.records_updated as i64,
                entry.response_time_ms as i64,
                entry.success as i32,
                entry.error,
                entry.remaining_quota,
            ],
        )?;
        Ok(())
    }

    pub fn append_validation_log(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        summary: &BatchSummary,
        at: DateTime<Utc>,
    ) -> IngestResult<()> {
        let conn = self.conn().lock();
        conn.execute(
            r#"
            INSERT INTO validation_log (
                symbol, timeframe, logged_at, total, passed, failed,
                gaps_flagged, volume_anomalies
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                symbol,
                timeframe.as_str(),
                ts_to_col(at),
                summary.total as i64,
                summary.passed as i64,
                summary.failed as i64,
                summary.gaps_flagged as i64,
                summary.volume_anomalies as i64,
            ],
        )?;
        Ok(())
    }

    /// Audit rows recorded for a symbol; used by tests and the verify tool.
    pub fn count_audit_entries(&self, symbol: &str) -> IngestResult<u64> {
        let conn = self.conn().lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM upstream_audit_log WHERE symbol = ?1",
            params![symbol],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audit_log_appends() {
        let db = Database::open_memory().unwrap();
        let entry = AuditEntry {
            symbol: "AAPL".to_string(),
            timeframe: Some(Timeframe::D1),
            endpoint: "candles".to_string(),
            fetched_at: Utc::now(),
            records_fetched: 250,
            records_inserted: 250,
            records_updated: 0,
            response_time_ms: 120,
            success: true,
            error: None,
            remaining_quota: Some(940),
        };
        db.append_audit_entry(&entry).unwrap();
        db.append_audit_entry(&entry).unwrap();
        assert_eq!(db.count_audit_entries("AAPL").unwrap(), 2);
        assert_eq!(db.count_audit_entries("MSFT").unwrap(), 0);
    }

    #[test]
    fn test_validation_log_appends() {
        let db = Database::open_memory().unwrap();
        let summary = BatchSummary {
            total: 5,
            passed: 4,
            failed: 1,
            gaps_flagged: 1,
            volume_anomalies: 0,
        };
        db.append_validation_log("AAPL", Timeframe::D1, &summary, Utc::now())
            .unwrap();
    }
}
