//! Backfill engine: work enumeration, the concurrent per-unit pipeline,
//! gap retry, and per-job state.

mod orchestrator;
mod plan;

pub use orchestrator::Orchestrator;
pub use plan::{build_plan, JobPlan, SymbolPlan, MAX_SYMBOLS_PER_JOB};
