//! backfill-run - one-shot backfill CLI.
//!
//! Runs a single backfill job over explicit symbols, timeframes, and date
//! range, then prints the per-unit outcome and the completeness matrix.
//!
//! Exit codes: 0 success, 2 configuration invalid, 3 schema unavailable,
//! 4 upstream unauthorized.

use anyhow::Result;
use candle_warehouse::error::IngestError;
use candle_warehouse::models::{JobRequest, JobStatus, Timeframe};
use candle_warehouse::observability::EngineSink;
use candle_warehouse::ratelimit::{RateLimitConfig, RateLimiter};
use candle_warehouse::upstream::HttpMarketDataClient;
use candle_warehouse::{Config, Database, Orchestrator};
use chrono::NaiveDate;
use clap::Parser;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::error;

#[derive(Parser, Debug)]
#[command(name = "backfill-run", about = "Run one backfill job and exit")]
struct Args {
    /// Comma-separated symbols; defaults to every active symbol.
    #[arg(long, value_delimiter = ',')]
    symbols: Option<Vec<String>>,

    /// Comma-separated timeframes (5m,15m,30m,1h,4h,1d,1w); defaults to
    /// each symbol's configured set.
    #[arg(long, value_delimiter = ',')]
    timeframes: Option<Vec<Timeframe>>,

    /// ISO start date; defaults to the configured history window.
    #[arg(long)]
    start: Option<NaiveDate>,

    /// ISO end date; defaults to today (UTC).
    #[arg(long)]
    end: Option<NaiveDate>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Configuration invalid");
            std::process::exit(2);
        }
    };
    let db = match Database::open(&config.database_url) {
        Ok(db) => Arc::new(db),
        Err(e) => {
            error!(error = %e, "Schema unavailable");
            std::process::exit(3);
        }
    };

    let sink = Arc::new(EngineSink::new(db.clone()));
    let limiter = Arc::new(RateLimiter::new(RateLimitConfig {
        rate: config.rate_limit,
        window: config.rate_window(),
        burst: config.rate_burst,
    }));
    let client = Arc::new(HttpMarketDataClient::new(&config, limiter, sink.clone())?);
    let orchestrator = Arc::new(Orchestrator::new(config, db.clone(), client, sink));

    let request = JobRequest {
        symbols: args.symbols,
        timeframes: args.timeframes,
        start: args.start,
        end: args.end,
    };

    let cancel = CancellationToken::new();
    let job = match orchestrator.execute(request, &cancel).await {
        Ok(job) => job,
        Err(e @ IngestError::UpstreamForbidden(_)) => {
            error!(error = %e, "Upstream rejected our credentials");
            std::process::exit(4);
        }
        Err(e @ IngestError::SchemaMissing(_)) => {
            error!(error = %e, "Schema unavailable");
            std::process::exit(3);
        }
        Err(e) => return Err(e.into()),
    };

    println!(
        "job {} {} | {}/{} symbols completed | {} records inserted",
        job.id,
        job.status.as_str(),
        job.symbols_completed,
        job.symbols_total,
        job.total_records_inserted
    );

    let details = db.load_job_details(job.id)?;
    let mut saw_forbidden = false;
    for d in &details {
        match &d.error {
            Some(err) => {
                saw_forbidden |= err.contains("forbidden") || err.contains("403");
                println!(
                    "  {} {} {} | {}",
                    d.symbol,
                    d.timeframe,
                    d.status.as_str(),
                    err
                );
            }
            None => println!(
                "  {} {} {} | fetched {} inserted {} in {}ms",
                d.symbol,
                d.timeframe,
                d.status.as_str(),
                d.records_fetched,
                d.records_inserted,
                d.duration_ms
            ),
        }
    }

    let matrix = db.load_completeness(job.id)?;
    for e in &matrix {
        println!(
            "  {} {} complete={} gaps detected={} retried={} filled={}",
            e.symbol, e.timeframe, e.complete, e.gaps_detected, e.gaps_retried, e.gaps_filled
        );
    }

    if job.status != JobStatus::Completed {
        std::process::exit(1);
    }
    if saw_forbidden {
        std::process::exit(4);
    }
    Ok(())
}
