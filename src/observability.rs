//! Observability sink consumed by every component.
//!
//! One trait covers the three channels the engine emits on: structured log
//! events (tracing), counters/timers/gauges (the `metrics` facade), and
//! alerts. Upstream-call audit entries also flow through here so the client
//! stays decoupled from the store.

use crate::models::AuditEntry;
use crate::storage::Database;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Critical,
}

/// Interface every component logs, counts, and alerts through.
///
/// Contract: every upstream call, unit transition, symbol status transition,
/// and alert crossing emits exactly one `event` and bumps one counter.
pub trait ObservabilitySink: Send + Sync {
    /// Structured log event. `attrs` are flattened into the log line.
    fn event(
        &self,
        trace_id: &str,
        component: &str,
        event: &str,
        level: LogLevel,
        attrs: &[(&str, String)],
    );

    fn counter(&self, name: &'static str, value: u64, labels: &[(&'static str, String)]);

    fn timer(&self, name: &'static str, elapsed: Duration, labels: &[(&'static str, String)]);

    fn gauge(&self, name: &'static str, value: f64);

    /// Threshold crossing. Also one log event + one counter, per contract.
    fn alert(&self, rule: &str, message: &str);

    /// Append-only upstream-call audit. Failures are logged, never raised.
    fn audit(&self, entry: &AuditEntry);
}

// =============================================================================
// Production sink
// =============================================================================

/// Sink used by the daemon and CLI binaries: tracing for events, the
/// `metrics` facade for counters, the store for audit rows.
pub struct EngineSink {
    db: Arc<Database>,
}

impl EngineSink {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

impl ObservabilitySink for EngineSink {
    fn event(
        &self,
        trace_id: &str,
        component: &str,
        event: &str,
        level: LogLevel,
        attrs: &[(&str, String)],
    ) {
        let attrs_fmt = format_attrs(attrs);
        match level {
            LogLevel::Debug => {
                debug!(trace_id = %trace_id, component = %component, attrs = %attrs_fmt, "{event}")
            }
            LogLevel::Info => {
                info!(trace_id = %trace_id, component = %component, attrs = %attrs_fmt, "{event}")
            }
            LogLevel::Warn => {
                warn!(trace_id = %trace_id, component = %component, attrs = %attrs_fmt, "{event}")
            }
            LogLevel::Error => {
                error!(trace_id = %trace_id, component = %component, attrs = %attrs_fmt, "{event}")
            }
            LogLevel::Critical => {
                error!(trace_id = %trace_id, component = %component, attrs = %attrs_fmt, critical = true, "{event}")
            }
        }
    }

    fn counter(&self, name: &'static str, value: u64, labels: &[(&'static str, String)]) {
        let labels: Vec<metrics::Label> = labels
            .iter()
            .map(|(k, v)| metrics::Label::new(*k, v.clone()))
            .collect();
        metrics::counter!(name, value, labels);
    }

    fn timer(&self, name: &'static str, elapsed: Duration, labels: &[(&'static str, String)]) {
        let labels: Vec<metrics::Label> = labels
            .iter()
            .map(|(k, v)| metrics::Label::new(*k, v.clone()))
            .collect();
        metrics::histogram!(name, elapsed.as_secs_f64(), labels);
    }

    fn gauge(&self, name: &'static str, value: f64) {
        metrics::gauge!(name, value);
    }

    fn alert(&self, rule: &str, message: &str) {
        error!(rule = %rule, alert = true, "{message}");
        metrics::counter!(
            "warehouse_alerts_total",
            1,
            vec![metrics::Label::new("rule", rule.to_string())]
        );
    }

    fn audit(&self, entry: &AuditEntry) {
        if let Err(e) = self.db.append_audit_entry(entry) {
            warn!(symbol = %entry.symbol, error = %e, "Failed to append audit entry");
        }
        metrics::counter!(
            "warehouse_upstream_calls_total",
            1,
            vec![metrics::Label::new(
                "outcome",
                if entry.success { "success" } else { "error" }.to_string(),
            )]
        );
    }
}

// =============================================================================
// Test sink
// =============================================================================

/// Records everything in memory; used by unit and integration tests.
#[derive(Default)]
pub struct RecordingSink {
    pub events: parking_lot::Mutex<Vec<(String, String, String)>>,
    pub counters: parking_lot::Mutex<Vec<(&'static str, u64)>>,
    pub alerts: parking_lot::Mutex<Vec<(String, String)>>,
    pub audits: parking_lot::Mutex<Vec<AuditEntry>>,
}

impl ObservabilitySink for RecordingSink {
    fn event(
        &self,
        trace_id: &str,
        component: &str,
        event: &str,
        _level: LogLevel,
        _attrs: &[(&str, String)],
    ) {
        self.events
            .lock()
            .push((trace_id.to_string(), component.to_string(), event.to_string()));
    }

    fn counter(&self, name: &'static str, value: u64, _labels: &[(&'static str, String)]) {
        self.counters.lock().push((name, value));
    }

    fn timer(&self, _name: &'static str, _elapsed: Duration, _labels: &[(&'static str, String)]) {}

    fn gauge(&self, _name: &'static str, _value: f64) {}

    fn alert(&self, rule: &str, message: &str) {
        self.alerts.lock().push((rule.to_string(), message.to_string()));
    }

    fn audit(&self, entry: &AuditEntry) {
        self.audits.lock().push(entry.clone());
    }
}

fn format_attrs(attrs: &[(&str, String)]) -> String {
    let mut out = String::new();
    for (i, (k, v)) in attrs.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        out.push_str(k);
        out.push('=');
        out.push_str(v);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_sink_captures_events() {
        let sink = RecordingSink::default();
        sink.event("t1", "orchestrator", "unit_completed", LogLevel::Info, &[]);
        sink.counter("warehouse_units_total", 1, &[]);
        sink.alert("scheduler_liveness", "daily job overran midnight");

        assert_eq!(sink.events.lock().len(), 1);
        assert_eq!(sink.counters.lock()[0], ("warehouse_units_total", 1));
        assert_eq!(sink.alerts.lock()[0].0, "scheduler_liveness");
    }

    #[test]
    fn test_attr_formatting() {
        let s = format_attrs(&[("symbol", "AAPL".to_string()), ("tf", "1d".to_string())]);
        assert_eq!(s, "symbol=AAPL tf=1d");
    }
}
