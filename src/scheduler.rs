//! Job scheduling.
//!
//! One serial runner: the daily job fires at a configured UTC wall-clock
//! time, manual submissions queue behind it, and at most one job executes
//! at a time (global concurrency 1, to keep the upstream budget sane).
//! A daily fire that cannot start within the misfire grace is skipped, not
//! caught up, and a fire that lands while the previous run is still live
//! is skipped with an alert.

use crate::backfill::{JobPlan, Orchestrator};
use crate::config::Config;
use crate::error::{IngestError, IngestResult};
use crate::models::JobRequest;
use crate::observability::{LogLevel, ObservabilitySink};
use crate::storage::Database;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

const SCHEDULER_COMPONENT: &str = "scheduler";

/// What to do with a daily fire, given when it actually got to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FireDisposition {
    Run,
    /// Started later than the misfire grace allows; skip, never catch up.
    SkipLate,
    /// The previous run is still live; skip and alert.
    SkipBusy,
}

fn fire_disposition(
    now: DateTime<Utc>,
    fire_at: DateTime<Utc>,
    grace: Duration,
    previous_running: bool,
) -> FireDisposition {
    if previous_running {
        return FireDisposition::SkipBusy;
    }
    let late = now - fire_at;
    if late > ChronoDuration::seconds(grace.as_secs() as i64) {
        return FireDisposition::SkipLate;
    }
    FireDisposition::Run
}

/// Next wall-clock fire strictly after `now`.
fn next_fire_after(now: DateTime<Utc>, hour: u32, minute: u32) -> DateTime<Utc> {
    let today = now
        .date_naive()
        .and_hms_opt(hour, minute, 0)
        .expect("validated schedule time")
        .and_utc();
    if today > now {
        today
    } else {
        today + ChronoDuration::days(1)
    }
}

pub struct Scheduler {
    config: Config,
    orchestrator: Arc<Orchestrator>,
    db: Arc<Database>,
    sink: Arc<dyn ObservabilitySink>,
    tx: mpsc::UnboundedSender<JobPlan>,
    rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<JobPlan>>>,
}

impl Scheduler {
    pub fn new(
        config: Config,
        orchestrator: Arc<Orchestrator>,
        db: Arc<Database>,
        sink: Arc<dyn ObservabilitySink>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            config,
            orchestrator,
            db,
            sink,
            tx,
            rx: parking_lot::Mutex::new(Some(rx)),
        }
    }

    /// Manual trigger. Validates and records the job immediately; execution
    /// queues behind whatever the runner is doing.
    pub fn submit(&self, request: &JobRequest) -> IngestResult<Uuid> {
        let plan = self.orchestrator.prepare(request)?;
        let id = plan.job.id;
        self.tx
            .send(plan)
            .map_err(|_| IngestError::Cancelled)?;
        self.sink.event(
            &id.to_string(),
            SCHEDULER_COMPONENT,
            "job_submitted",
            LogLevel::Info,
            &[],
        );
        self.sink.counter("warehouse_jobs_submitted_total", 1, &[]);
        Ok(id)
    }

    /// Serial run loop. Owns the daily timer and the submission queue until
    /// `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut rx = self
            .rx
            .lock()
            .take()
            .expect("scheduler run loop started twice");

        let mut next_fire =
            next_fire_after(Utc::now(), self.config.schedule_hour, self.config.schedule_minute);
        info!(next_fire = %next_fire, "Scheduler started");

        loop {
            let until_fire = (next_fire - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO);

            tokio::select! {
                _ = tokio::time::sleep(until_fire) => {
                    self.daily_tick(next_fire, &cancel).await;
                    next_fire = next_fire_after(
                        Utc::now().max(next_fire),
                        self.config.schedule_hour,
                        self.config.schedule_minute,
                    );
                }
                maybe_plan = rx.recv() => {
                    match maybe_plan {
                        Some(plan) => self.run_queued(plan, &cancel).await,
                        None => break,
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
        info!("Scheduler stopped");
    }

    async fn daily_tick(&self, fire_at: DateTime<Utc>, cancel: &CancellationToken) {
        let previous_running = match self.db.has_running_job() {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "Could not check for a running job; skipping fire");
                return;
            }
        };

        match fire_disposition(
            Utc::now(),
            fire_at,
            Duration::from_secs(self.config.misfire_grace_secs),
            previous_running,
        ) {
            FireDisposition::Run => {
                self.sink.event(
                    "daily",
                    SCHEDULER_COMPONENT,
                    "daily_fire",
                    LogLevel::Info,
                    &[("fire_at", fire_at.to_string())],
                );
                self.sink.counter("warehouse_daily_fires_total", 1, &[]);
                match self.orchestrator.execute(JobRequest::default(), cancel).await {
                    Ok(job) => {
                        info!(job_id = %job.id, status = %job.status.as_str(), "Daily job finished")
                    }
                    Err(e) => warn!(error = %e, "Daily job could not run"),
                }
            }
            FireDisposition::SkipLate => {
                self.sink.alert(
                    "scheduler_misfire",
                    &format!("daily fire at {fire_at} missed the grace window; skipped"),
                );
            }
            FireDisposition::SkipBusy => {
                self.sink.alert(
                    "scheduler_liveness",
                    &format!("previous job still running at {fire_at}; daily fire skipped"),
                );
            }
        }
    }

    async fn run_queued(&self, plan: JobPlan, cancel: &CancellationToken) {
        let id = plan.job.id;
        match self.orchestrator.run_prepared(plan, cancel).await {
            Ok(job) => {
                info!(job_id = %id, status = %job.status.as_str(), "Queued job finished")
            }
            Err(e) => warn!(job_id = %id, error = %e, "Queued job could not run"),
        }
    }
}
