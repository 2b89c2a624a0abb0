use std::fmt;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ApiError, RetryError};

pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(30);
pub const DEFAULT_READ_BASE_WAIT: Duration = Duration::from_millis(500);
pub const DEFAULT_WRITE_BASE_WAIT: Duration = Duration::from_secs(1);

/// Which base backoff a retried call uses. Reads outnumber writes by a wide
/// margin, so they back off from a shorter base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpClass {
    Read,
    Write,
}

impl fmt::Display for OpClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpClass::Read => f.write_str("read"),
            OpClass::Write => f.write_str("write"),
        }
    }
}

/// Retry wrapper for remote calls that may come back rate limited.
///
/// Only the remote API's 429 shape is retried. Permanent per-repo conditions
/// are suppressed to success; every other failure is returned untouched.
pub struct RateLimiter {
    max_retries: u32,
    max_wait: Duration,
    read_base_wait: Duration,
    write_base_wait: Duration,
}

impl RateLimiter {
    /// `max_retries == 0` disables the attempt ceiling; the wait ceiling
    /// still bounds the loop.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            max_wait: DEFAULT_MAX_WAIT,
            read_base_wait: DEFAULT_READ_BASE_WAIT,
            write_base_wait: DEFAULT_WRITE_BASE_WAIT,
        }
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    pub fn with_base_waits(mut self, read: Duration, write: Duration) -> Self {
        self.read_base_wait = read;
        self.write_base_wait = write;
        self
    }

    /// Run `work`, retrying rate-limited failures until it succeeds or a
    /// ceiling fires.
    pub async fn with_retry<F, Fut>(
        &self,
        cancel: &CancellationToken,
        class: OpClass,
        name: &str,
        mut work: F,
    ) -> anyhow::Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let mut attempt: u32 = 0;
        loop {
            let err = match work().await {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };

            let reset = match err.downcast_ref::<ApiError>() {
                // Not a remote-API failure: nothing rate-limit shaped to do.
                None => return Err(err),
                Some(api) if api.is_suppressed() => {
                    debug!(op = name, class = %class, error = %api, "suppressed remote error");
                    return Ok(());
                }
                Some(ApiError::RateLimited { reset }) => *reset,
                // Only the 429 shape is retryable.
                Some(_) => return Err(err),
            };

            let wait = self.computed_wait(reset, attempt, class);
            let api = ApiError::RateLimited { reset };
            attempt += 1;

            if self.max_retries > 0 && attempt >= self.max_retries {
                let terminal = RetryError::AttemptsExhausted {
                    class,
                    name: name.to_string(),
                    attempts: self.max_retries,
                    source: api,
                };
                warn!(op = name, class = %class, max_retries = self.max_retries, "retries exhausted");
                return Err(terminal.into());
            }
            if wait > self.max_wait {
                let terminal = RetryError::WaitExhausted {
                    class,
                    name: name.to_string(),
                    max_wait: self.max_wait,
                    source: api,
                };
                warn!(op = name, class = %class, max_wait = ?self.max_wait, computed_wait = ?wait, "retry wait ceiling reached");
                return Err(terminal.into());
            }

            warn!(
                op = name,
                class = %class,
                wait = ?wait,
                attempt,
                max_retries = self.max_retries,
                "rate limit exceeded, backing off"
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(RetryError::Cancelled {
                        class,
                        name: name.to_string(),
                        source: api,
                    }
                    .into());
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Wait before the next attempt: the server's reset deadline when it
    /// supplied one, otherwise exponential backoff split by operation class.
    /// The returned value is uncapped; the caller treats anything above the
    /// ceiling as terminal.
    fn computed_wait(&self, reset: Option<DateTime<Utc>>, attempt: u32, class: OpClass) -> Duration {
        if let Some(reset) = reset {
            // A zero-value timestamp means the header was absent upstream.
            if reset.timestamp() != 0 {
                return (reset - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            }
        }

        let base = match class {
            OpClass::Read => self.read_base_wait,
            OpClass::Write => self.write_base_wait,
        };
        // 2^n backoff: 1st retry waits the base, then doubles.
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        base.saturating_mul(factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    use anyhow::anyhow;

    const OP_NAME: &str = "test";

    fn rate_limited(reset: Option<DateTime<Utc>>) -> anyhow::Error {
        ApiError::RateLimited { reset }.into()
    }

    #[tokio::test]
    async fn succeeds_without_retry() {
        let limiter = RateLimiter::new(3);
        let calls = AtomicU32::new(0);
        let result = limiter
            .with_retry(&CancellationToken::new(), OpClass::Read, OP_NAME, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_once_with_reset_deadline() {
        let limiter = RateLimiter::new(3);
        let calls = AtomicU32::new(0);
        let result = limiter
            .with_retry(&CancellationToken::new(), OpClass::Read, OP_NAME, || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n <= 1 {
                        Err(rate_limited(Some(Utc::now() + chrono::Duration::milliseconds(5))))
                    } else {
                        Ok(())
                    }
                }
            })
            .await;
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn retries_once_with_backoff() {
        let limiter = RateLimiter::new(3)
            .with_base_waits(Duration::from_millis(1), Duration::from_millis(2));
        let calls = AtomicU32::new(0);
        let result = limiter
            .with_retry(&CancellationToken::new(), OpClass::Read, OP_NAME, || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n <= 1 {
                        Err(rate_limited(None))
                    } else {
                        Ok(())
                    }
                }
            })
            .await;
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn default_limits() {
        let limiter = RateLimiter::new(crate::config::DEFAULT_MAX_RETRIES);
        assert_eq!(limiter.max_retries, 3);
        assert_eq!(limiter.max_wait, DEFAULT_MAX_WAIT);
        assert_eq!(limiter.read_base_wait, DEFAULT_READ_BASE_WAIT);
        assert_eq!(limiter.write_base_wait, DEFAULT_WRITE_BASE_WAIT);
    }

    #[tokio::test]
    async fn max_retries_exceeded() {
        let limiter = RateLimiter::new(2);
        let calls = AtomicU32::new(0);
        let result = limiter
            .with_retry(&CancellationToken::new(), OpClass::Read, OP_NAME, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(rate_limited(Some(
                        Utc::now() + chrono::Duration::milliseconds(2),
                    )))
                }
            })
            .await;
        let err = result.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(
            err.to_string().contains("failed after 2 retries"),
            "unexpected message: {err}"
        );
        assert!(matches!(
            err.downcast_ref::<RetryError>(),
            Some(RetryError::AttemptsExhausted { attempts: 2, .. })
        ));
    }

    #[tokio::test]
    async fn cancelled_mid_wait_stops_promptly() {
        let limiter = RateLimiter::new(3);
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let result = limiter
            .with_retry(&cancel, OpClass::Read, OP_NAME, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(rate_limited(Some(Utc::now() + chrono::Duration::seconds(5))))
                }
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(matches!(
            err.downcast_ref::<RetryError>(),
            Some(RetryError::Cancelled { .. })
        ));
    }

    #[tokio::test]
    async fn reset_deadline_takes_precedence_over_backoff() {
        // Backoff base is huge; only the server deadline can explain a fast run.
        let limiter = RateLimiter::new(3)
            .with_base_waits(Duration::from_secs(10), Duration::from_secs(10));
        let calls = AtomicU32::new(0);
        let start = Instant::now();
        let result = limiter
            .with_retry(&CancellationToken::new(), OpClass::Read, OP_NAME, || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n <= 1 {
                        Err(rate_limited(Some(
                            Utc::now() + chrono::Duration::milliseconds(30),
                        )))
                    } else {
                        Ok(())
                    }
                }
            })
            .await;
        assert!(result.is_ok());
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(20), "waited {elapsed:?}");
        assert!(elapsed < Duration::from_secs(5), "waited {elapsed:?}");
    }

    #[tokio::test]
    async fn past_reset_deadline_waits_zero() {
        let limiter = RateLimiter::new(3);
        let calls = AtomicU32::new(0);
        let start = Instant::now();
        let result = limiter
            .with_retry(&CancellationToken::new(), OpClass::Write, OP_NAME, || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n <= 1 {
                        Err(rate_limited(Some(
                            Utc::now() - chrono::Duration::seconds(10),
                        )))
                    } else {
                        Ok(())
                    }
                }
            })
            .await;
        assert!(result.is_ok());
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn read_backoff_doubles_up_to_wait_ceiling() {
        let limiter = RateLimiter::new(0)
            .with_max_wait(Duration::from_millis(50))
            .with_base_waits(Duration::from_millis(1), Duration::from_millis(2));
        let calls = AtomicU32::new(0);
        let start = Instant::now();
        let err = limiter
            .with_retry(&CancellationToken::new(), OpClass::Read, OP_NAME, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(rate_limited(None)) }
            })
            .await
            .unwrap_err();

        // Waits 1+2+4+8+16+32ms, then the next doubling crosses the ceiling.
        assert_eq!(calls.load(Ordering::SeqCst), 7);
        assert!(start.elapsed() >= Duration::from_millis(60));
        assert!(
            err.to_string().contains("reaching max wait"),
            "unexpected message: {err}"
        );
        assert!(matches!(
            err.downcast_ref::<RetryError>(),
            Some(RetryError::WaitExhausted { .. })
        ));
    }

    #[tokio::test]
    async fn write_backoff_doubles_up_to_wait_ceiling() {
        let limiter = RateLimiter::new(0)
            .with_max_wait(Duration::from_millis(50))
            .with_base_waits(Duration::from_millis(1), Duration::from_millis(2));
        let calls = AtomicU32::new(0);
        let err = limiter
            .with_retry(&CancellationToken::new(), OpClass::Write, OP_NAME, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(rate_limited(None)) }
            })
            .await
            .unwrap_err();

        // Waits 2+4+8+16+32ms before 64ms crosses the ceiling.
        assert_eq!(calls.load(Ordering::SeqCst), 6);
        assert!(matches!(
            err.downcast_ref::<RetryError>(),
            Some(RetryError::WaitExhausted { .. })
        ));
    }

    #[tokio::test]
    async fn attempt_ceiling_fires_before_wait_ceiling() {
        let limiter = RateLimiter::new(5)
            .with_max_wait(Duration::from_secs(1))
            .with_base_waits(Duration::from_millis(1), Duration::from_millis(2));
        let calls = AtomicU32::new(0);
        let err = limiter
            .with_retry(&CancellationToken::new(), OpClass::Write, OP_NAME, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(rate_limited(None)) }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert!(
            err.to_string().contains("failed after 5 retries"),
            "unexpected message: {err}"
        );
    }

    #[tokio::test]
    async fn suppressed_errors_return_ok_without_retry() {
        for suppressed in [
            ApiError::RepoNotFound,
            ApiError::RepoDeactivated,
            ApiError::RepoTakendown,
        ] {
            let limiter = RateLimiter::new(3);
            let calls = AtomicU32::new(0);
            let failure = suppressed.clone();
            let result = limiter
                .with_retry(&CancellationToken::new(), OpClass::Read, OP_NAME, || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    let failure = failure.clone();
                    async move { Err(failure.into()) }
                })
                .await;
            assert!(result.is_ok(), "{suppressed:?} should be suppressed");
            assert_eq!(calls.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn non_api_errors_pass_through_unmodified() {
        let limiter = RateLimiter::new(3);
        let calls = AtomicU32::new(0);
        let err = limiter
            .with_retry(&CancellationToken::new(), OpClass::Read, OP_NAME, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(anyhow!("decoder blew up")) }
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.to_string(), "decoder blew up");
    }

    #[tokio::test]
    async fn non_rate_limit_api_errors_pass_through() {
        let limiter = RateLimiter::new(3);
        let calls = AtomicU32::new(0);
        let err = limiter
            .with_retry(&CancellationToken::new(), OpClass::Read, OP_NAME, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(ApiError::Status {
                        status: 500,
                        message: "internal".into(),
                    }
                    .into())
                }
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(
            err.downcast_ref::<ApiError>(),
            Some(ApiError::Status { status: 500, .. })
        ));
    }
}
