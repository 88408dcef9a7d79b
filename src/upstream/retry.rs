//! Bounded retry with exponential backoff for upstream calls.
//!
//! The policy is data, not decoration: attempts, base delay, and cap live
//! in one struct the client threads through every endpoint.

use crate::error::{IngestError, IngestResult};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `n` (1-based): base * 2^(n-1), capped.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u32 << retry.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

/// Run `op` until it succeeds, fails non-retryably, or exhausts the policy.
/// Only transient upstream kinds are retried; the last error bubbles up.
pub async fn with_retry<T, F, Fut>(
    policy: RetryPolicy,
    cancel: &CancellationToken,
    context: &str,
    mut op: F,
) -> IngestResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = IngestResult<T>>,
{
    let mut attempt = 1u32;
    loop {
        if cancel.is_cancelled() {
            return Err(IngestError::Cancelled);
        }
        match op(attempt).await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable_upstream() && attempt < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(
                    context = %context,
                    attempt = attempt,
                    delay_secs = delay.as_secs(),
                    error = %e,
                    "Upstream call failed, backing off"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(IngestError::Cancelled),
                }
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn test_two_transient_failures_then_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let start = Instant::now();

        let calls_ref = calls.clone();
        let result = with_retry(RetryPolicy::default(), &cancel, "candles", move |_| {
            let calls = calls_ref.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(IngestError::UpstreamRateLimited("429".into()))
                } else {
                    Ok(42u32)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 2s + 4s of backoff before the third attempt.
        assert!(start.elapsed() >= Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_fails_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();

        let calls_ref = calls.clone();
        let result: IngestResult<()> =
            with_retry(RetryPolicy::default(), &cancel, "candles", move |_| {
                let calls = calls_ref.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(IngestError::UpstreamNotFound("404".into()))
                }
            })
            .await;

        assert_eq!(result.unwrap_err().kind(), "upstream_not_found");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_bubble_last_error() {
        let cancel = CancellationToken::new();
        let result: IngestResult<()> =
            with_retry(RetryPolicy::default(), &cancel, "candles", |_| async {
                Err(IngestError::UpstreamTransient("connection reset".into()))
            })
            .await;
        assert_eq!(result.unwrap_err().kind(), "upstream_transient");
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_growth_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 6,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(10),
        };
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
        assert_eq!(policy.delay_for(4), Duration::from_secs(10));
        assert_eq!(policy.delay_for(5), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_backoff() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: IngestResult<()> =
            with_retry(RetryPolicy::default(), &cancel, "candles", |_| async {
                Err(IngestError::UpstreamTransient("slow".into()))
            })
            .await;
        assert_eq!(result.unwrap_err().kind(), "cancelled");
    }
}
