//! HTTP implementation of the provider adapter.
//!
//! Stocks and ETFs share one route family, crypto another; the adapter
//! hides the difference. Every HTTP attempt acquires one rate-limiter
//! token, observes the call timeout, and records one audit entry.

use super::retry::{with_retry, RetryPolicy};
use super::types::{
    CandlesPayload, DividendsPayload, EarningsPayload, SplitsPayload, WireCandle,
};
use super::{Dividend, Earnings, MarketDataProvider, OptionsSnapshot, Split};
use crate::config::Config;
use crate::error::{IngestError, IngestResult};
use crate::models::{AssetClass, AuditEntry, RawCandle, Timeframe};
use crate::observability::ObservabilitySink;
use crate::ratelimit::RateLimiter;
use anyhow::Context;
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

const QUOTA_HEADER: &str = "x-ratelimit-remaining";
const SOURCE_TAG: &str = "tickerfeed";

pub struct HttpMarketDataClient {
    http: reqwest::Client,
    base_url: String,
    limiter: Arc<RateLimiter>,
    sink: Arc<dyn ObservabilitySink>,
    retry: RetryPolicy,
}

impl HttpMarketDataClient {
    pub fn new(
        config: &Config,
        limiter: Arc<RateLimiter>,
        sink: Arc<dyn ObservabilitySink>,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.upstream_call_timeout())
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .default_headers({
                let mut headers = reqwest::header::HeaderMap::new();
                headers.insert(
                    reqwest::header::AUTHORIZATION,
                    format!("Bearer {}", config.upstream_api_key)
                        .parse()
                        .context("Invalid upstream api key")?,
                );
                headers
            })
            .build()
            .context("Failed to build upstream HTTP client")?;

        Ok(Self {
            http,
            base_url: config.upstream_base_url.trim_end_matches('/').to_string(),
            limiter,
            sink,
            retry: RetryPolicy::default(),
        })
    }

    fn route(asset_class: AssetClass) -> &'static str {
        match asset_class {
            AssetClass::Crypto => "crypto",
            AssetClass::Stock | AssetClass::Etf => "stocks",
        }
    }

    /// One rate-limited, audited GET per attempt, retried per policy.
    async fn get_json<T>(
        &self,
        cancel: &CancellationToken,
        symbol: &str,
        timeframe: Option<Timeframe>,
        endpoint: &'static str,
        url: &str,
        query: &[(&str, String)],
        count_records: fn(&T) -> u64,
    ) -> IngestResult<T>
    where
        T: DeserializeOwned,
    {
        with_retry(self.retry, cancel, endpoint, |_attempt| {
            let cancel = cancel.clone();
            async move {
                self.limiter.acquire(&cancel).await?;

                let started = Instant::now();
                let outcome = self.issue::<T>(url, query, &cancel).await;
                let response_time_ms = started.elapsed().as_millis() as u64;

                let (success, error, remaining_quota, records_fetched) = match &outcome {
                    Ok((value, quota)) => (true, None, *quota, count_records(value)),
                    Err(e) => (false, Some(e.to_string()), None, 0),
                };
                self.sink.audit(&AuditEntry {
                    symbol: symbol.to_string(),
                    timeframe,
                    endpoint: endpoint.to_string(),
                    fetched_at: Utc::now(),
                    records_fetched,
                    records_inserted: 0,
                    records_updated: 0,
                    response_time_ms,
                    success,
                    error,
                    remaining_quota,
                });

                outcome.map(|(value, _)| value)
            }
        })
        .await
    }

    async fn issue<T>(
        &self,
        url: &str,
        query: &[(&str, String)],
        cancel: &CancellationToken,
    ) -> IngestResult<(T, Option<i64>)>
    where
        T: DeserializeOwned,
    {
        let request = self.http.get(url).query(query);
        let response = tokio::select! {
            r = request.send() => r.map_err(IngestError::from)?,
            _ = cancel.cancelled() => return Err(IngestError::Cancelled),
        };

        let remaining_quota = response
            .headers()
            .get(QUOTA_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<i64>().ok());

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_status(status, &body));
        }

        let value = response
            .json::<T>()
            .await
            .map_err(|e| IngestError::UpstreamTransient(format!("malformed response: {e}")))?;
        Ok((value, remaining_quota))
    }

    async fn candles_request(
        &self,
        cancel: &CancellationToken,
        symbol: &str,
        route: &str,
        endpoint: &'static str,
        timeframe: Timeframe,
        start: NaiveDate,
        end: NaiveDate,
        adjusted: bool,
    ) -> IngestResult<Vec<RawCandle>> {
        let url = format!("{}/{}/candles/{}", self.base_url, route, symbol);
        let mut query = vec![
            ("timeframe", timeframe.as_str().to_string()),
            ("start", start.to_string()),
            ("end", end.to_string()),
        ];
        if adjusted {
            query.push(("adjusted", "true".to_string()));
        }

        let payload: CandlesPayload = self
            .get_json(cancel, symbol, Some(timeframe), endpoint, &url, &query, |p: &CandlesPayload| {
                p.candles.len() as u64
            })
            .await?;

        let mut candles: Vec<RawCandle> = payload
            .candles
            .into_iter()
            .filter_map(WireCandle::into_raw)
            .collect();
        // The provider does not guarantee ordering.
        candles.sort_by_key(|c| c.ts);
        Ok(candles)
    }
}

#[async_trait]
impl MarketDataProvider for HttpMarketDataClient {
    async fn fetch_candles(
        &self,
        cancel: &CancellationToken,
        symbol: &str,
        asset_class: AssetClass,
        timeframe: Timeframe,
        start: NaiveDate,
        end: NaiveDate,
    ) -> IngestResult<Vec<RawCandle>> {
        self.candles_request(
            cancel,
            symbol,
            Self::route(asset_class),
            "candles",
            timeframe,
            start,
            end,
            false,
        )
        .await
    }

    async fn fetch_adjusted_candles(
        &self,
        cancel: &CancellationToken,
        symbol: &str,
        timeframe: Timeframe,
        start: NaiveDate,
        end: NaiveDate,
    ) -> IngestResult<Vec<RawCandle>> {
        self.candles_request(
            cancel,
            symbol,
            "stocks",
            "adjusted_candles",
            timeframe,
            start,
            end,
            true,
        )
        .await
    }

    async fn fetch_dividends(
        &self,
        cancel: &CancellationToken,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> IngestResult<Vec<Dividend>> {
        let url = format!("{}/stocks/dividends/{}", self.base_url, symbol);
        let query = vec![("start", start.to_string()), ("end", end.to_string())];
        let payload: DividendsPayload = self
            .get_json(cancel, symbol, None, "dividends", &url, &query, |p: &DividendsPayload| {
                p.dividends.len() as u64
            })
            .await?;
        Ok(payload.dividends)
    }

    async fn fetch_splits(
        &self,
        cancel: &CancellationToken,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> IngestResult<Vec<Split>> {
        let url = format!("{}/stocks/splits/{}", self.base_url, symbol);
        let query = vec![("start", start.to_string()), ("end", end.to_string())];
        let payload: SplitsPayload = self
            .get_json(cancel, symbol, None, "splits", &url, &query, |p: &SplitsPayload| {
                p.splits.len() as u64
            })
            .await?;
        Ok(payload.splits)
    }

    async fn fetch_earnings(
        &self,
        cancel: &CancellationToken,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> IngestResult<Vec<Earnings>> {
        let url = format!("{}/stocks/earnings/{}", self.base_url, symbol);
        let query = vec![("start", start.to_string()), ("end", end.to_string())];
        let payload: EarningsPayload = self
            .get_json(cancel, symbol, None, "earnings", &url, &query, |p: &EarningsPayload| {
                p.earnings.len() as u64
            })
            .await?;
        Ok(payload.earnings)
    }

    async fn fetch_options_chain_snapshot(
        &self,
        cancel: &CancellationToken,
        symbol: &str,
        as_of: NaiveDate,
    ) -> IngestResult<OptionsSnapshot> {
        let url = format!("{}/stocks/options/{}", self.base_url, symbol);
        let query = vec![("as_of", as_of.to_string())];
        self.get_json(cancel, symbol, None, "options", &url, &query, |p: &OptionsSnapshot| {
            p.contracts.len() as u64
        })
        .await
    }

    fn source_tag(&self) -> &str {
        SOURCE_TAG
    }
}

/// Non-success status mapping. Bodies are truncated; credentials and raw
/// stack traces never reach an error message.
fn map_status(status: StatusCode, body: &str) -> IngestError {
    let detail = truncate(body, 200);
    match status {
        StatusCode::TOO_MANY_REQUESTS => {
            IngestError::UpstreamRateLimited(format!("429: {detail}"))
        }
        StatusCode::NOT_FOUND => IngestError::UpstreamNotFound(format!("404: {detail}")),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            IngestError::UpstreamForbidden(format!("{}: {detail}", status.as_u16()))
        }
        s if s.is_client_error() => {
            IngestError::UpstreamBadRequest(format!("{}: {detail}", s.as_u16()))
        }
        s => IngestError::UpstreamTransient(format!("{}: {detail}", s.as_u16())),
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

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            map_status(StatusCode::TOO_MANY_REQUESTS, "slow down").kind(),
            "upstream_rate_limited"
        );
        assert_eq!(
            map_status(StatusCode::NOT_FOUND, "no such symbol").kind(),
            "upstream_not_found"
        );
        assert_eq!(
            map_status(StatusCode::FORBIDDEN, "bad key").kind(),
            "upstream_forbidden"
        );
        assert_eq!(
            map_status(StatusCode::UNPROCESSABLE_ENTITY, "bad range").kind(),
            "upstream_bad_request"
        );
        assert_eq!(
            map_status(StatusCode::BAD_GATEWAY, "upstream down").kind(),
            "upstream_transient"
        );
    }

    #[test]
    fn test_retryable_statuses_feed_the_retry_loop() {
        assert!(map_status(StatusCode::TOO_MANY_REQUESTS, "").is_retryable_upstream());
        assert!(map_status(StatusCode::SERVICE_UNAVAILABLE, "").is_retryable_upstream());
        assert!(!map_status(StatusCode::NOT_FOUND, "").is_retryable_upstream());
    }

    #[test]
    fn test_route_by_asset_class() {
        assert_eq!(HttpMarketDataClient::route(AssetClass::Stock), "stocks");
        assert_eq!(HttpMarketDataClient::route(AssetClass::Etf), "stocks");
        assert_eq!(HttpMarketDataClient::route(AssetClass::Crypto), "crypto");
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let s = "héllo wörld, this body is long enough to cut";
        let t = truncate(s, 10);
        assert!(t.ends_with("..."));
        assert!(t.len() <= 13);
        assert_eq!(truncate("short", 200), "short");
    }
}
