//! Symbol registry: source of truth for the active instrument universe.
//!
//! A read-through of the store. Symbols are normalized to uppercase on the
//! write path; unknown timeframes in stored configuration are dropped when
//! read (the column codec handles that), never errors.

use crate::error::{IngestError, IngestResult};
use crate::models::{AssetClass, Timeframe, TrackedSymbol};
use crate::storage::Database;
use chrono::Utc;
use std::sync::Arc;

pub struct SymbolRegistry {
    db: Arc<Database>,
}

impl SymbolRegistry {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// The active universe, ordered by symbol. Read by the orchestrator on
    /// every run.
    pub fn list_active(&self) -> IngestResult<Vec<TrackedSymbol>> {
        self.db.list_active_symbols()
    }

    /// Admin write: register or reconfigure an instrument.
    pub fn add_symbol(
        &self,
        symbol: &str,
        asset_class: AssetClass,
        timeframes: &[Timeframe],
    ) -> IngestResult<()> {
        self.db
            .upsert_symbol(symbol, asset_class, timeframes, Utc::now())
    }

    /// Soft delete; the symbol and its candles stay in the store.
    pub fn set_active(&self, symbol: &str, active: bool) -> IngestResult<()> {
        self.db.set_symbol_active(symbol, active)
    }

    /// Admin write: replace a symbol's configured timeframes.
    pub fn set_timeframes(&self, symbol: &str, timeframes: &[Timeframe]) -> IngestResult<()> {
        self.db.update_symbol_timeframes(symbol, timeframes)
    }

    /// Resolve explicit job symbols against the registry. Unknown symbols
    /// reject the submission.
    pub fn resolve(&self, symbols: &[String]) -> IngestResult<Vec<TrackedSymbol>> {
        let mut out = Vec::with_capacity(symbols.len());
        for raw in symbols {
            let upper = raw.to_uppercase();
            match self.db.get_symbol(&upper)? {
                Some(s) => out.push(s),
                None => {
                    return Err(IngestError::Validation {
                        context: upper,
                        message: "symbol not in registry".to_string(),
                    })
                }
            }
        }
        Ok(out)
    }
}
