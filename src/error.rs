//! Typed error sum for the ingestion engine.
//!
//! The orchestrator matches on these kinds to decide what fails a unit,
//! what fails a symbol, and what (rarely) fails a whole job. Only `Config`
//! and `SchemaMissing` are allowed to reach the process boundary.

pub type IngestResult<T> = Result<T, IngestError>;

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// Upstream failure that survived the client's retry budget.
    #[error("upstream transient failure: {0}")]
    UpstreamTransient(String),

    /// HTTP 429 after retries were exhausted.
    #[error("upstream rate limited: {0}")]
    UpstreamRateLimited(String),

    /// Symbol or window unknown to the provider (HTTP 404).
    #[error("upstream has no data: {0}")]
    UpstreamNotFound(String),

    /// Authorization or quota failure (HTTP 401/403).
    #[error("upstream forbidden: {0}")]
    UpstreamForbidden(String),

    /// Request the provider rejected outright (other 4xx).
    #[error("upstream rejected request: {0}")]
    UpstreamBadRequest(String),

    /// Connection, lock, or I/O failure in the store.
    #[error("storage transient failure: {0}")]
    StorageTransient(String),

    /// The store rejected a row the validator let through.
    #[error("storage integrity violation: {0}")]
    StorageIntegrity(String),

    /// A required table is absent; schema ensure must run.
    #[error("schema missing: {0}")]
    SchemaMissing(String),

    /// Request or batch rejected before any work ran (unknown symbol, bad
    /// date range, oversized submission).
    #[error("validation failure ({context}): {message}")]
    Validation { context: String, message: String },

    /// Invalid configuration. Fatal at process start.
    #[error("configuration invalid: {0}")]
    Config(String),

    /// The job ran past its deadline.
    #[error("job deadline exceeded after {elapsed_secs}s")]
    Deadline { elapsed_secs: u64 },

    /// Cooperative cancellation observed.
    #[error("operation cancelled")]
    Cancelled,
}

impl IngestError {
    /// Transient upstream failures are the only kind the client retries.
    pub fn is_retryable_upstream(&self) -> bool {
        matches!(
            self,
            IngestError::UpstreamTransient(_) | IngestError::UpstreamRateLimited(_)
        )
    }

    /// Errors that abort the whole job rather than a single unit.
    pub fn is_job_fatal(&self) -> bool {
        matches!(
            self,
            IngestError::Config(_) | IngestError::Deadline { .. } | IngestError::Cancelled
        )
    }

    /// Stable kind tag for counters and audit rows.
    pub fn kind(&self) -> &'static str {
        match self {
            IngestError::UpstreamTransient(_) => "upstream_transient",
            IngestError::UpstreamRateLimited(_) => "upstream_rate_limited",
            IngestError::UpstreamNotFound(_) => "upstream_not_found",
            IngestError::UpstreamForbidden(_) => "upstream_forbidden",
            IngestError::UpstreamBadRequest(_) => "upstream_bad_request",
            IngestError::StorageTransient(_) => "storage_transient",
            IngestError::StorageIntegrity(_) => "storage_integrity",
            IngestError::SchemaMissing(_) => "schema_missing",
            IngestError::Validation { .. } => "validation",
            IngestError::Config(_) => "config",
            IngestError::Deadline { .. } => "deadline",
            IngestError::Cancelled => "cancelled",
        }
    }
}

impl From<rusqlite::Error> for IngestError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(f, _)
                if f.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                IngestError::StorageIntegrity(e.to_string())
            }
            rusqlite::Error::SqliteFailure(_, Some(msg)) if msg.contains("no such table") => {
                IngestError::SchemaMissing(msg.clone())
            }
            _ => IngestError::StorageTransient(e.to_string()),
        }
    }
}

impl From<reqwest::Error> for IngestError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() {
            return IngestError::UpstreamTransient(e.to_string());
        }
        match e.status() {
            Some(s) if s.as_u16() == 429 => IngestError::UpstreamRateLimited(e.to_string()),
            Some(s) if s.as_u16() == 404 => IngestError::UpstreamNotFound(e.to_string()),
            Some(s) if s.as_u16() == 401 || s.as_u16() == 403 => {
                IngestError::UpstreamForbidden(e.to_string())
            }
            Some(s) if s.is_client_error() => IngestError::UpstreamBadRequest(e.to_string()),
            _ => IngestError::UpstreamTransient(e.to_string()),
        }
    }
}
