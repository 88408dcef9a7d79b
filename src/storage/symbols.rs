//! Tracked-symbol persistence: admin writes, status updates, read-through.

use super::{opt_ts_from_col, timeframes_from_col, timeframes_to_col, ts_from_col, ts_to_col, Database};
use crate::error::{IngestError, IngestResult};
use crate::models::{AssetClass, BackfillStatus, SymbolSummary, Timeframe, TrackedSymbol};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

impl Database {
    /// Insert or update one tracked symbol. Symbols are stored uppercase.
    pub fn upsert_symbol(
        &self,
        symbol: &str,
        asset_class: AssetClass,
        timeframes: &[Timeframe],
        added_at: DateTime<Utc>,
    ) -> IngestResult<()> {
        if timeframes.is_empty() {
            return Err(IngestError::Config(format!(
                "symbol {symbol} needs at least one timeframe"
            )));
        }
        let conn = self.conn().lock();
        conn.execute(
            r#"
            INSERT INTO tracked_symbols (symbol, asset_class, active, timeframes, date_added)
            VALUES (?1, ?2, 1, ?3, ?4)
            ON CONFLICT(symbol) DO UPDATE SET
                asset_class = excluded.asset_class,
                timeframes = excluded.timeframes,
                active = 1
            "#,
            params![
                symbol.to_uppercase(),
                asset_class.as_str(),
                timeframes_to_col(timeframes),
                ts_to_col(added_at),
            ],
        )?;
        Ok(())
    }

    /// Soft delete / reactivate.
    pub fn set_symbol_active(&self, symbol: &str, active: bool) -> IngestResult<()> {
        let conn = self.conn().lock();
        conn.execute(
            "UPDATE tracked_symbols SET active = ?2 WHERE symbol = ?1",
            params![symbol.to_uppercase(), active as i32],
        )?;
        Ok(())
    }

    /// Replace a symbol's configured timeframes, leaving every other column
    /// untouched.
    pub fn update_symbol_timeframes(
        &self,
        symbol: &str,
        timeframes: &[Timeframe],
    ) -> IngestResult<()> {
        if timeframes.is_empty() {
            return Err(IngestError::Config(format!(
                "symbol {symbol} needs at least one timeframe"
            )));
        }
        let conn = self.conn().lock();
        conn.execute(
            "UPDATE tracked_symbols SET timeframes = ?2 WHERE symbol = ?1",
            params![symbol.to_uppercase(), timeframes_to_col(timeframes)],
        )?;
        Ok(())
    }

    /// Atomic status write: status, error (cleared on success), and the
    /// last-backfill stamp in one row update.
    pub fn update_symbol_status(
        &self,
        symbol: &str,
        status: BackfillStatus,
        error: Option<&str>,
        at: DateTime<Utc>,
    ) -> IngestResult<()> {
        let conn = self.conn().lock();
        conn.execute(
            r#"
            UPDATE tracked_symbols
            SET backfill_status = ?2, backfill_error = ?3, last_backfill = ?4
            WHERE symbol = ?1
            "#,
            params![
                symbol.to_uppercase(),
                status.as_str(),
                error,
                ts_to_col(at),
            ],
        )?;
        Ok(())
    }

    pub fn get_symbol(&self, symbol: &str) -> IngestResult<Option<TrackedSymbol>> {
        let conn = self.conn().lock();
        let row = conn
            .query_row(
                r#"
                SELECT symbol, asset_class, active, timeframes, date_added,
                       last_backfill, backfill_status, backfill_error
                FROM tracked_symbols WHERE symbol = ?1
                "#,
                params![symbol.to_uppercase()],
                map_symbol_row,
            )
            .optional()?;
        row.map(finish_symbol_row).transpose()
    }

    /// Every active symbol ordered by name; the registry's read path.
    pub fn list_active_symbols(&self) -> IngestResult<Vec<TrackedSymbol>> {
        let conn = self.conn().lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT symbol, asset_class, active, timeframes, date_added,
                   last_backfill, backfill_status, backfill_error
            FROM tracked_symbols WHERE active = 1
            ORDER BY symbol ASC
            "#,
        )?;
        let rows = stmt.query_map([], map_symbol_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(finish_symbol_row(row?)?);
        }
        Ok(out)
    }

    /// Registry rows joined with candle statistics, for the query side.
    pub fn get_symbols_detailed(&self) -> IngestResult<Vec<SymbolSummary>> {
        let conn = self.conn().lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT s.symbol, s.asset_class, s.active, s.timeframes,
                   s.backfill_status, s.last_backfill, s.backfill_error,
                   COUNT(c.ts), COALESCE(SUM(c.validated), 0)
            FROM tracked_symbols s
            LEFT JOIN candles c ON c.symbol = s.symbol
            GROUP BY s.symbol
            ORDER BY s.symbol ASC
            "#,
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, Option<i64>>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, i64>(7)?,
                row.get::<_, i64>(8)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (symbol, class, active, tfs, status, last_backfill, error, count, validated) =
                row?;
            out.push(SymbolSummary {
                symbol,
                asset_class: parse_class(&class)?,
                active: active != 0,
                timeframes: timeframes_from_col(&tfs),
                backfill_status: parse_status(&status)?,
                last_backfill: opt_ts_from_col(last_backfill)?,
                backfill_error: error,
                record_count: count as u64,
                validation_rate: if count > 0 {
                    validated as f64 / count as f64
                } else {
                    0.0
                },
            });
        }
        Ok(out)
    }
}

type SymbolRow = (
    String,
    String,
    i64,
    String,
    i64,
    Option<i64>,
    String,
    Option<String>,
);

fn map_symbol_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SymbolRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn finish_symbol_row(row: SymbolRow) -> IngestResult<TrackedSymbol> {
    let (symbol, class, active, tfs, date_added, last_backfill, status, error) = row;
    Ok(TrackedSymbol {
        symbol,
        asset_class: parse_class(&class)?,
        active: active != 0,
        timeframes: timeframes_from_col(&tfs),
        date_added: ts_from_col(date_added)?,
        last_backfill: opt_ts_from_col(last_backfill)?,
        backfill_status: parse_status(&status)?,
        backfill_error: error,
    })
}

fn parse_class(raw: &str) -> IngestResult<AssetClass> {
    raw.parse()
        .map_err(|e: String| IngestError::StorageIntegrity(e))
}

fn parse_status(raw: &str) -> IngestResult<BackfillStatus> {
    raw.parse()
        .map_err(|e: String| IngestError::StorageIntegrity(e))
}
