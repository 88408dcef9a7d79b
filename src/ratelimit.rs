//! Upstream rate limiting.
//!
//! Token bucket over a fixed window with burst headroom. Every upstream
//! call acquires exactly one token before issuing its HTTP request; the
//! limiter is process-wide, so the contracted provider budget holds across
//! all concurrent work units. Waiters are served in FIFO order.

use crate::error::{IngestError, IngestResult};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Tokens issued per window.
    pub rate: u32,
    pub window: Duration,
    /// Extra tokens above `rate` before a hard wait.
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            rate: 60,
            window: Duration::from_secs(60),
            burst: 10,
        }
    }
}

struct Bucket {
    issued: u32,
    window_start: Instant,
}

pub struct RateLimiter {
    config: RateLimitConfig,
    bucket: parking_lot::Mutex<Bucket>,
    /// Tokio's mutex queues waiters fairly; holding it across the wait
    /// keeps token hand-out FIFO.
    line: tokio::sync::Mutex<()>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            bucket: parking_lot::Mutex::new(Bucket {
                issued: 0,
                window_start: Instant::now(),
            }),
            line: tokio::sync::Mutex::new(()),
        }
    }

    fn capacity(&self) -> u32 {
        self.config.rate + self.config.burst
    }

    /// Block cooperatively until a token is issued or `cancel` fires.
    pub async fn acquire(&self, cancel: &CancellationToken) -> IngestResult<()> {
        let _line = tokio::select! {
            guard = self.line.lock() => guard,
            _ = cancel.cancelled() => return Err(IngestError::Cancelled),
        };

        loop {
            let wait = {
                let mut bucket = self.bucket.lock();
                let now = Instant::now();
                if now.duration_since(bucket.window_start) >= self.config.window {
                    bucket.window_start = now;
                    bucket.issued = 0;
                }
                if bucket.issued < self.capacity() {
                    bucket.issued += 1;
                    return Ok(());
                }
                self.config.window - now.duration_since(bucket.window_start)
            };

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = cancel.cancelled() => return Err(IngestError::Cancelled),
            }
        }
    }

    /// Tokens still available in the current window.
    pub fn available(&self) -> u32 {
        let mut bucket = self.bucket.lock();
        let now = Instant::now();
        if now.duration_since(bucket.window_start) >= self.config.window {
            bucket.window_start = now;
            bucket.issued = 0;
        }
        self.capacity().saturating_sub(bucket.issued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_acquire_within_budget_is_immediate() {
        let limiter = RateLimiter::new(RateLimitConfig {
            rate: 5,
            window: Duration::from_secs(60),
            burst: 0,
        });
        let cancel = CancellationToken::new();

        for _ in 0..5 {
            limiter.acquire(&cancel).await.unwrap();
        }
        assert_eq!(limiter.available(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_bucket_waits_for_window() {
        let limiter = RateLimiter::new(RateLimitConfig {
            rate: 2,
            window: Duration::from_secs(60),
            burst: 0,
        });
        let cancel = CancellationToken::new();

        limiter.acquire(&cancel).await.unwrap();
        limiter.acquire(&cancel).await.unwrap();

        let start = Instant::now();
        limiter.acquire(&cancel).await.unwrap();
        // Paused clock advances only through the limiter's own sleep.
        assert!(start.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_extends_capacity() {
        let limiter = RateLimiter::new(RateLimitConfig {
            rate: 2,
            window: Duration::from_secs(60),
            burst: 3,
        });
        let cancel = CancellationToken::new();

        for _ in 0..5 {
            limiter.acquire(&cancel).await.unwrap();
        }
        assert_eq!(limiter.available(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_acquire_returns_cancelled() {
        let limiter = RateLimiter::new(RateLimitConfig {
            rate: 1,
            window: Duration::from_secs(60),
            burst: 0,
        });
        let cancel = CancellationToken::new();
        limiter.acquire(&cancel).await.unwrap();

        cancel.cancel();
        let err = limiter.acquire(&cancel).await.unwrap_err();
        assert!(matches!(err, IngestError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiters_are_fifo() {
        use std::sync::Arc;

        let limiter = Arc::new(RateLimiter::new(RateLimitConfig {
            rate: 1,
            window: Duration::from_secs(10),
            burst: 0,
        }));
        let cancel = CancellationToken::new();
        limiter.acquire(&cancel).await.unwrap();

        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..3 {
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                limiter.acquire(&cancel).await.unwrap();
                order.lock().push(i);
            }));
            // Let the waiter park before spawning the next one.
            tokio::task::yield_now().await;
        }

        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }
}
