//! Candle persistence: batched upserts, gap discovery, per-symbol stats.

use super::{ts_from_col, ts_to_col, Database};
use crate::calendar;
use crate::error::{IngestError, IngestResult};
use crate::models::{AssetClass, DateRange, SymbolStats, Timeframe, ValidatedCandle};
use chrono::NaiveDate;
use rusqlite::params;
use std::collections::HashSet;
use tracing::error;

/// Rows touched by one upsert batch, split by disposition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub inserted: u64,
    pub updated: u64,
}

impl UpsertOutcome {
    pub fn touched(&self) -> u64 {
        self.inserted + self.updated
    }
}

impl Database {
    /// Upsert one validated batch for a single `(symbol, timeframe)`.
    ///
    /// The whole batch commits in one transaction or not at all. Re-running
    /// the same batch is idempotent: existing identities have their value
    /// columns replaced. A constraint violation means the validator let a
    /// bad row through; it is logged at critical severity and re-raised.
    pub fn upsert_candles(
        &self,
        batch: &[ValidatedCandle],
        timeframe: Timeframe,
    ) -> IngestResult<UpsertOutcome> {
        let Some(first) = batch.first() else {
            return Ok(UpsertOutcome::default());
        };
        let symbol = first.symbol.as_str();

        for c in batch {
            if c.symbol != symbol || c.timeframe != timeframe {
                return Err(IngestError::StorageIntegrity(format!(
                    "mixed identities in batch: expected {symbol}/{timeframe}, got {}/{}",
                    c.symbol, c.timeframe
                )));
            }
            if !timeframe.is_aligned(c.ts) {
                return Err(IngestError::StorageIntegrity(format!(
                    "timestamp {} not aligned to {timeframe} boundary for {symbol}",
                    c.ts
                )));
            }
        }

        let mut conn = self.conn().lock();
        let tx = conn.transaction().map_err(IngestError::from)?;

        let outcome = (|| -> IngestResult<UpsertOutcome> {
            // Which identities already exist, to split inserted vs updated.
            let min_ts = batch.iter().map(|c| ts_to_col(c.ts)).min().unwrap_or(0);
            let max_ts = batch.iter().map(|c| ts_to_col(c.ts)).max().unwrap_or(0);
            let existing: HashSet<i64> = {
                let mut stmt = tx.prepare(
                    "SELECT ts FROM candles
                     WHERE symbol = ?1 AND timeframe = ?2 AND ts BETWEEN ?3 AND ?4",
                )?;
                let rows = stmt.query_map(
                    params![symbol, timeframe.as_str(), min_ts, max_ts],
                    |row| row.get::<_, i64>(0),
                )?;
                rows.collect::<Result<_, _>>()?
            };

            let mut outcome = UpsertOutcome::default();
            let mut seen: HashSet<i64> = HashSet::with_capacity(batch.len());
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO candles (
                    symbol, timeframe, ts, open, high, low, close, volume,
                    source, validated, quality_score, validation_notes,
                    gap_detected, volume_anomaly, ingested_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
                ON CONFLICT(symbol, timeframe, ts) DO UPDATE SET
                    open = excluded.open,
                    high = excluded.high,
                    low = excluded.low,
                    close = excluded.close,
                    volume = excluded.volume,
                    source = excluded.source,
                    validated = excluded.validated,
                    quality_score = excluded.quality_score,
                    validation_notes = excluded.validation_notes,
                    gap_detected = excluded.gap_detected,
                    volume_anomaly = excluded.volume_anomaly,
                    ingested_at = excluded.ingested_at
                "#,
            )?;

            for c in batch {
                let ts = ts_to_col(c.ts);
                stmt.execute(params![
                    c.symbol,
                    c.timeframe.as_str(),
                    ts,
                    c.open,
                    c.high,
                    c.low,
                    c.close,
                    c.volume,
                    c.source,
                    c.validated as i32,
                    c.quality_score,
                    c.validation_notes.join("; "),
                    c.gap_detected as i32,
                    c.volume_anomaly as i32,
                    ts_to_col(c.ingested_at),
                ])?;
                if existing.contains(&ts) || !seen.insert(ts) {
                    outcome.updated += 1;
                } else {
                    outcome.inserted += 1;
                }
            }
            drop(stmt);
            tx.commit()?;
            Ok(outcome)
        })();

        if let Err(IngestError::StorageIntegrity(msg)) = &outcome {
            error!(symbol = %symbol, timeframe = %timeframe, error = %msg,
                   "Candle batch violated storage invariants");
        }
        outcome
    }

    /// Ordered business-day subranges of `[start, end]` with no candle
    /// stored for `(symbol, timeframe)`. Ready for batched refetch.
    pub fn find_gaps(
        &self,
        symbol: &str,
        asset_class: AssetClass,
        timeframe: Timeframe,
        start: NaiveDate,
        end: NaiveDate,
    ) -> IngestResult<Vec<DateRange>> {
        if start > end {
            return Ok(Vec::new());
        }

        let range_start = ts_to_col(
            start
                .and_hms_opt(0, 0, 0)
                .expect("midnight exists")
                .and_utc(),
        );
        let range_end = ts_to_col(
            end.and_hms_opt(23, 59, 59)
                .expect("end of day exists")
                .and_utc(),
        );

        let covered: HashSet<NaiveDate> = {
            let conn = self.conn().lock();
            let mut stmt = conn.prepare(
                "SELECT DISTINCT ts FROM candles
                 WHERE symbol = ?1 AND timeframe = ?2 AND ts BETWEEN ?3 AND ?4",
            )?;
            let rows = stmt.query_map(
                params![symbol, timeframe.as_str(), range_start, range_end],
                |row| row.get::<_, i64>(0),
            )?;
            let mut dates = HashSet::new();
            for ts in rows {
                dates.insert(ts_from_col(ts?)?.date_naive());
            }
            dates
        };

        let missing: Vec<NaiveDate> = calendar::business_days(asset_class, start, end)
            .into_iter()
            .filter(|d| !covered.contains(d))
            .collect();

        Ok(calendar::group_missing_days(asset_class, &missing))
    }

    /// Aggregate statistics over every timeframe of one symbol.
    pub fn get_symbol_stats(&self, symbol: &str) -> IngestResult<SymbolStats> {
        let conn = self.conn().lock();
        let (count, min_ts, max_ts, validated, gaps) = conn.query_row(
            r#"
            SELECT COUNT(*), MIN(ts), MAX(ts),
                   COALESCE(SUM(validated), 0), COALESCE(SUM(gap_detected), 0)
            FROM candles WHERE symbol = ?1
            "#,
            params![symbol],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Option<i64>>(1)?,
                    row.get::<_, Option<i64>>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            },
        )?;

        Ok(SymbolStats {
            symbol: symbol.to_string(),
            record_count: count as u64,
            first_ts: super::opt_ts_from_col(min_ts)?,
            last_ts: super::opt_ts_from_col(max_ts)?,
            validation_rate: if count > 0 {
                validated as f64 / count as f64
            } else {
                0.0
            },
            gaps_detected: gaps as u64,
        })
    }

    /// Candle count for one `(symbol, timeframe)` inside a date range.
    pub fn count_candles_in_range(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: NaiveDate,
        end: NaiveDate,
    ) -> IngestResult<u64> {
        let range_start = ts_to_col(start.and_hms_opt(0, 0, 0).expect("midnight").and_utc());
        let range_end = ts_to_col(end.and_hms_opt(23, 59, 59).expect("eod").and_utc());
        let conn = self.conn().lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM candles
             WHERE symbol = ?1 AND timeframe = ?2 AND ts BETWEEN ?3 AND ?4",
            params![symbol, timeframe.as_str(), range_start, range_end],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Load a window of candles ascending by timestamp. Read primitive for
    /// the query side and the verify tool.
    pub fn load_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: NaiveDate,
        end: NaiveDate,
    ) -> IngestResult<Vec<ValidatedCandle>> {
        let range_start = ts_to_col(start.and_hms_opt(0, 0, 0).expect("midnight").and_utc());
        let range_end = ts_to_col(end.and_hms_opt(23, 59, 59).expect("eod").and_utc());
        let conn = self.conn().lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT symbol, timeframe, ts, open, high, low, close, volume,
                   source, validated, quality_score, validation_notes,
                   gap_detected, volume_anomaly, ingested_at
            FROM candles
            WHERE symbol = ?1 AND timeframe = ?2 AND ts BETWEEN ?3 AND ?4
            ORDER BY ts ASC
            "#,
        )?;
        let rows = stmt.query_map(
            params![symbol, timeframe.as_str(), range_start, range_end],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, f64>(3)?,
                    row.get::<_, f64>(4)?,
                    row.get::<_, f64>(5)?,
                    row.get::<_, f64>(6)?,
                    row.get::<_, f64>(7)?,
                    row.get::<_, String>(8)?,
                    row.get::<_, i64>(9)?,
                    row.get::<_, f64>(10)?,
                    row.get::<_, Option<String>>(11)?,
                    row.get::<_, i64>(12)?,
                    row.get::<_, i64>(13)?,
                    row.get::<_, i64>(14)?,
                ))
            },
        )?;

        let mut out = Vec::new();
        for row in rows {
            let (
                symbol,
                tf,
                ts,
                open,
                high,
                low,
                close,
                volume,
                source,
                validated,
                quality_score,
                notes,
                gap_detected,
                volume_anomaly,
                ingested_at,
            ) = row?;
            let timeframe = tf.parse::<Timeframe>().map_err(|e| {
                IngestError::StorageIntegrity(format!("bad timeframe column: {e}"))
            })?;
            out.push(ValidatedCandle {
                symbol,
                timeframe,
                ts: ts_from_col(ts)?,
                open,
                high,
                low,
                close,
                volume,
                source,
                validated: validated != 0,
                quality_score,
                validation_notes: notes
                    .filter(|s| !s.is_empty())
                    .map(|s| s.split("; ").map(String::from).collect())
                    .unwrap_or_default(),
                gap_detected: gap_detected != 0,
                volume_anomaly: volume_anomaly != 0,
                ingested_at: ts_from_col(ingested_at)?,
            });
        }
        Ok(out)
    }
}
