//! Scriptable in-memory provider for tests.
//!
//! Fixtures are keyed by `(symbol, timeframe)`; per-symbol failure scripts
//! let tests drive the retry and error paths without a network.

use super::{Dividend, Earnings, MarketDataProvider, OptionsSnapshot, Split};
use crate::calendar;
use crate::error::{IngestError, IngestResult};
use crate::models::{AssetClass, RawCandle, Timeframe};
use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use tokio_util::sync::CancellationToken;

/// Error kinds a script can inject, one per upcoming call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedFailure {
    Transient,
    RateLimited,
    NotFound,
    Forbidden,
}

impl ScriptedFailure {
    fn into_error(self) -> IngestError {
        match self {
            ScriptedFailure::Transient => {
                IngestError::UpstreamTransient("scripted transient failure".into())
            }
            ScriptedFailure::RateLimited => {
                IngestError::UpstreamRateLimited("scripted 429".into())
            }
            ScriptedFailure::NotFound => IngestError::UpstreamNotFound("scripted 404".into()),
            ScriptedFailure::Forbidden => IngestError::UpstreamForbidden("scripted 403".into()),
        }
    }
}

/// One recorded candle fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRecord {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub start: NaiveDate,
    pub end: NaiveDate,
}

#[derive(Default)]
pub struct MockProvider {
    candles: Mutex<HashMap<(String, Timeframe), Vec<RawCandle>>>,
    failures: Mutex<HashMap<String, VecDeque<ScriptedFailure>>>,
    calls: Mutex<Vec<CallRecord>>,
    first_call_at: Mutex<HashMap<String, tokio::time::Instant>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed clean daily candles over the asset class's trading days.
    pub fn push_daily_candles(
        &self,
        symbol: &str,
        asset_class: AssetClass,
        start: NaiveDate,
        end: NaiveDate,
        base_price: f64,
    ) {
        let candles: Vec<RawCandle> = calendar::business_days(asset_class, start, end)
            .into_iter()
            .enumerate()
            .map(|(i, day)| {
                let price = base_price + i as f64 * 0.5;
                RawCandle {
                    ts: day.and_hms_opt(0, 0, 0).expect("midnight").and_utc(),
                    open: price,
                    high: price + 1.0,
                    low: price - 1.0,
                    close: price + 0.5,
                    volume: 1_000.0 + i as f64,
                }
            })
            .collect();
        self.push_candles(symbol, Timeframe::D1, candles);
    }

    pub fn push_candles(&self, symbol: &str, timeframe: Timeframe, candles: Vec<RawCandle>) {
        self.candles
            .lock()
            .entry((symbol.to_uppercase(), timeframe))
            .or_default()
            .extend(candles);
    }

    /// Queue failures returned (in order) before any data for `symbol`.
    pub fn script_failures(&self, symbol: &str, failures: &[ScriptedFailure]) {
        self.failures
            .lock()
            .entry(symbol.to_uppercase())
            .or_default()
            .extend(failures.iter().copied());
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        self.calls.lock().clone()
    }

    pub fn calls_for(&self, symbol: &str) -> usize {
        let symbol = symbol.to_uppercase();
        self.calls
            .lock()
            .iter()
            .filter(|c| c.symbol == symbol)
            .count()
    }

    /// Instant of the first candle fetch per symbol; drives the stagger
    /// assertions in the concurrency tests.
    pub fn first_call_instant(&self, symbol: &str) -> Option<tokio::time::Instant> {
        self.first_call_at.lock().get(&symbol.to_uppercase()).copied()
    }

    fn record_call(&self, symbol: &str, timeframe: Timeframe, start: NaiveDate, end: NaiveDate) {
        let symbol = symbol.to_uppercase();
        self.first_call_at
            .lock()
            .entry(symbol.clone())
            .or_insert_with(tokio::time::Instant::now);
        self.calls.lock().push(CallRecord {
            symbol,
            timeframe,
            start,
            end,
        });
    }

    fn next_failure(&self, symbol: &str) -> Option<ScriptedFailure> {
        self.failures
            .lock()
            .get_mut(&symbol.to_uppercase())
            .and_then(|q| q.pop_front())
    }
}

#[async_trait]
impl MarketDataProvider for MockProvider {
    async fn fetch_candles(
        &self,
        cancel: &CancellationToken,
        symbol: &str,
        _asset_class: AssetClass,
        timeframe: Timeframe,
        start: NaiveDate,
        end: NaiveDate,
    ) -> IngestResult<Vec<RawCandle>> {
        if cancel.is_cancelled() {
            return Err(IngestError::Cancelled);
        }
        self.record_call(symbol, timeframe, start, end);
        if let Some(failure) = self.next_failure(symbol) {
            return Err(failure.into_error());
        }

        let key = (symbol.to_uppercase(), timeframe);
        let range_start = start.and_hms_opt(0, 0, 0).expect("midnight").and_utc();
        let range_end = end.and_hms_opt(23, 59, 59).expect("eod").and_utc();
        let mut out: Vec<RawCandle> = self
            .candles
            .lock()
            .get(&key)
            .map(|v| {
                v.iter()
                    .filter(|c| c.ts >= range_start && c.ts <= range_end)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        out.sort_by_key(|c| c.ts);
        Ok(out)
    }

    async fn fetch_adjusted_candles(
        &self,
        cancel: &CancellationToken,
        symbol: &str,
        timeframe: Timeframe,
        start: NaiveDate,
        end: NaiveDate,
    ) -> IngestResult<Vec<RawCandle>> {
        self.fetch_candles(cancel, symbol, AssetClass::Stock, timeframe, start, end)
            .await
    }

    async fn fetch_dividends(
        &self,
        _cancel: &CancellationToken,
        _symbol: &str,
        _start: NaiveDate,
        _end: NaiveDate,
    ) -> IngestResult<Vec<Dividend>> {
        Ok(Vec::new())
    }

    async fn fetch_splits(
        &self,
        _cancel: &CancellationToken,
        _symbol: &str,
        _start: NaiveDate,
        _end: NaiveDate,
    ) -> IngestResult<Vec<Split>> {
        Ok(Vec::new())
    }

    async fn fetch_earnings(
        &self,
        _cancel: &CancellationToken,
        _symbol: &str,
        _start: NaiveDate,
        _end: NaiveDate,
    ) -> IngestResult<Vec<Earnings>> {
        Ok(Vec::new())
    }

    async fn fetch_options_chain_snapshot(
        &self,
        _cancel: &CancellationToken,
        symbol: &str,
        as_of: NaiveDate,
    ) -> IngestResult<OptionsSnapshot> {
        Ok(OptionsSnapshot {
            symbol: symbol.to_uppercase(),
            as_of: as_of.and_hms_opt(0, 0, 0).expect("midnight").and_utc(),
            contracts: Vec::new(),
        })
    }

    fn source_tag(&self) -> &str {
        "mock"
    }
}
