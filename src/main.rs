//! warehoused - the candle warehouse daemon.
//!
//! Loads configuration, ensures the store schema, wires the ingestion
//! engine together, and hands control to the scheduler until SIGINT.

use anyhow::{Context, Result};
use candle_warehouse::observability::EngineSink;
use candle_warehouse::ratelimit::{RateLimitConfig, RateLimiter};
use candle_warehouse::upstream::HttpMarketDataClient;
use candle_warehouse::{Config, Database, Orchestrator, Scheduler};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,candle_warehouse=debug".into()),
        )
        .init();

    // Invalid configuration is fatal before anything touches the store.
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Configuration invalid");
            std::process::exit(2);
        }
    };

    if config.metrics_port != 0 {
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.metrics_port));
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("Failed to install Prometheus exporter")?;
        info!(port = config.metrics_port, "Metrics exporter listening");
    }

    let db = match Database::open(&config.database_url) {
        Ok(db) => Arc::new(db),
        Err(e) => {
            error!(error = %e, "Store unavailable");
            std::process::exit(3);
        }
    };

    match db.recover_interrupted(chrono::Utc::now()) {
        Ok((0, 0)) => {}
        Ok((jobs, symbols)) => {
            info!(jobs, symbols, "Settled state left by an interrupted run")
        }
        Err(e) => error!(error = %e, "Could not settle interrupted state"),
    }

    let sink = Arc::new(EngineSink::new(db.clone()));
    let limiter = Arc::new(RateLimiter::new(RateLimitConfig {
        rate: config.rate_limit,
        window: config.rate_window(),
        burst: config.rate_burst,
    }));
    let client = Arc::new(HttpMarketDataClient::new(&config, limiter, sink.clone())?);
    let orchestrator = Arc::new(Orchestrator::new(
        config.clone(),
        db.clone(),
        client,
        sink.clone(),
    ));
    let scheduler = Arc::new(Scheduler::new(config, orchestrator, db, sink));

    info!("Candle warehouse daemon started");

    let cancel = CancellationToken::new();
    let runner = {
        let scheduler = scheduler.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { scheduler.run(cancel).await })
    };

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received, draining");
    cancel.cancel();
    runner.await.ok();

    Ok(())
}
