//! Upstream market-data provider adapter.
//!
//! The `MarketDataProvider` trait is the seam the orchestrator works
//! against; the HTTP implementation hides per-asset-class routing, rate
//! limiting, retry, and audit. The mock implementation backs the test
//! suites.

mod client;
pub mod mock;
mod retry;
mod types;

pub use client::HttpMarketDataClient;
pub use retry::{with_retry, RetryPolicy};
pub use types::{
    Dividend, Earnings, OptionContract, OptionKind, OptionsSnapshot, Split,
};

use crate::error::IngestResult;
use crate::models::{AssetClass, RawCandle, Timeframe};
use async_trait::async_trait;
use chrono::NaiveDate;
use tokio_util::sync::CancellationToken;

/// Stateless adapter over the provider's HTTP surface.
///
/// Candle lists come back ascending by timestamp; an empty window is an
/// empty list, never an error.
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    async fn fetch_candles(
        &self,
        cancel: &CancellationToken,
        symbol: &str,
        asset_class: AssetClass,
        timeframe: Timeframe,
        start: NaiveDate,
        end: NaiveDate,
    ) -> IngestResult<Vec<RawCandle>>;

    /// Split/dividend-adjusted series; stock route only.
    async fn fetch_adjusted_candles(
        &self,
        cancel: &CancellationToken,
        symbol: &str,
        timeframe: Timeframe,
        start: NaiveDate,
        end: NaiveDate,
    ) -> IngestResult<Vec<RawCandle>>;

    async fn fetch_dividends(
        &self,
        cancel: &CancellationToken,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> IngestResult<Vec<Dividend>>;

    async fn fetch_splits(
        &self,
        cancel: &CancellationToken,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> IngestResult<Vec<Split>>;

    async fn fetch_earnings(
        &self,
        cancel: &CancellationToken,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> IngestResult<Vec<Earnings>>;

    async fn fetch_options_chain_snapshot(
        &self,
        cancel: &CancellationToken,
        symbol: &str,
        as_of: NaiveDate,
    ) -> IngestResult<OptionsSnapshot>;

    /// Tag written into every candle's `source` column.
    fn source_tag(&self) -> &str;
}
