//! warehouse-verify - read-only store inspection.
//!
//! Prints per-symbol statistics, scans a date range for gaps, and sweeps
//! stored candles for shape violations that should be impossible. Never
//! writes.

use anyhow::Result;
use candle_warehouse::{Config, Database};
use chrono::NaiveDate;
use clap::Parser;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "warehouse-verify", about = "Inspect the candle store")]
struct Args {
    /// Limit the report to one symbol.
    #[arg(long)]
    symbol: Option<String>,

    /// Gap scan start (ISO date). Both bounds required to scan.
    #[arg(long)]
    start: Option<NaiveDate>,

    /// Gap scan end (ISO date).
    #[arg(long)]
    end: Option<NaiveDate>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let args = Args::parse();
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("configuration invalid: {e}");
            std::process::exit(2);
        }
    };
    let db = match Database::open(&config.database_url) {
        Ok(db) => Arc::new(db),
        Err(e) => {
            eprintln!("schema unavailable: {e}");
            std::process::exit(3);
        }
    };

    let summaries = db.get_symbols_detailed()?;
    let mut violations = 0usize;

    for summary in summaries
        .iter()
        .filter(|s| args.symbol.as_deref().map_or(true, |want| s.symbol.eq_ignore_ascii_case(want)))
    {
        let stats = db.get_symbol_stats(&summary.symbol)?;
        println!(
            "{} [{}] active={} status={} records={} validation_rate={:.3} gaps_flagged={}",
            summary.symbol,
            summary.asset_class,
            summary.active,
            summary.backfill_status.as_str(),
            stats.record_count,
            stats.validation_rate,
            stats.gaps_detected,
        );
        if let Some(err) = &summary.backfill_error {
            println!("  last error: {err}");
        }

        let (Some(start), Some(end)) = (args.start, args.end) else {
            continue;
        };

        for tf in &summary.timeframes {
            let gaps = db.find_gaps(&summary.symbol, summary.asset_class, *tf, start, end)?;
            if gaps.is_empty() {
                println!("  {tf}: no gaps in {start}..{end}");
            }
            for g in gaps {
                println!("  {tf}: gap {}..{} ({} business days)", g.start, g.end, g.days);
            }

            // Shape sweep: every validated row must satisfy the OHLCV
            // invariants the schema also enforces.
            for c in db.load_candles(&summary.symbol, *tf, start, end)? {
                if !c.validated {
                    continue;
                }
                let shape_ok = c.high >= c.low
                    && c.high >= c.open.max(c.close)
                    && c.low <= c.open.min(c.close)
                    && c.open > 0.0
                    && c.volume >= 0.0
                    && c.timeframe.is_aligned(c.ts);
                if !shape_ok {
                    violations += 1;
                    println!("  VIOLATION {} {} at {}", c.symbol, c.timeframe, c.ts);
                }
            }
        }
    }

    if violations > 0 {
        eprintln!("{violations} invariant violations found");
        std::process::exit(1);
    }
    Ok(())
}
