use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::FetchError;
use crate::metrics_consts::RETRIES_TOTAL;

/// Decides whether a failed attempt may be retried.
pub type RetryClassifier = fn(&FetchError) -> bool;

#[derive(Copy, Clone)]
/// The retry policy wrapped around every remote call: bounded attempts with exponential backoff.
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    max_attempts: u32,
    /// The backoff interval before the first retry.
    base_delay: time::Duration,
    /// The maximum possible backoff between retries.
    max_delay: time::Duration,
    /// Which failures are worth another attempt.
    is_retryable: RetryClassifier,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: time::Duration, max_delay: time::Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            is_retryable: FetchError::is_transient,
        }
    }

    pub fn with_classifier(mut self, is_retryable: RetryClassifier) -> Self {
        self.is_retryable = is_retryable;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Calculate the backoff after a failed `attempt` (1-based): `base_delay * 2^(attempt - 1)`,
    /// raised to the server's preferred interval when one is given, and capped at `max_delay`.
    pub fn delay_after(
        &self,
        attempt: u32,
        preferred_retry_interval: Option<time::Duration>,
    ) -> time::Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let candidate_interval = self
            .base_delay
            .checked_mul(2u32.pow(exponent))
            .unwrap_or(self.max_delay);

        match preferred_retry_interval {
            Some(duration) => std::cmp::max(candidate_interval, duration).min(self.max_delay),
            None => candidate_interval.min(self.max_delay),
        }
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error, runs out of attempts,
    /// or `cancel` fires. The operation receives the 1-based attempt number.
    ///
    /// Every retry increments `retries`. Cancellation is observed both while an attempt is in
    /// flight and while backing off, and always surfaces as `FetchError::Cancelled`.
    pub async fn execute<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        retries: &AtomicU64,
        mut operation: F,
    ) -> Result<T, FetchError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let mut attempt = 1;

        loop {
            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                result = operation(attempt) => result,
            };

            let error = match result {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if !(self.is_retryable)(&error) {
                return Err(error);
            }

            if attempt >= self.max_attempts {
                return Err(FetchError::RetryExhausted {
                    attempts: attempt,
                    last: Box::new(error),
                });
            }

            let delay = self.delay_after(attempt, error.retry_after());
            warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                "retrying after transient failure: {}",
                error
            );
            retries.fetch_add(1, Ordering::Relaxed);
            metrics::counter!(RETRIES_TOTAL).increment(1);

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }

            attempt += 1;
        }
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .finish_non_exhaustive()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, time::Duration::from_secs(1), time::Duration::from_secs(30))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use http::StatusCode;
    use tokio::time::Instant;

    use super::*;

    fn transient() -> FetchError {
        FetchError::Transient {
            api: "test".to_owned(),
            status: Some(StatusCode::SERVICE_UNAVAILABLE),
            reason: "service unavailable".to_owned(),
            retry_after: None,
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::new(
            4,
            time::Duration::from_millis(100),
            time::Duration::from_millis(500),
        )
    }

    #[test]
    fn test_delay_progression_and_cap() {
        let p = policy();

        let cases = vec![(1, 100), (2, 200), (3, 400), (4, 500), (40, 500)];
        for (attempt, expected_ms) in cases {
            assert_eq!(
                p.delay_after(attempt, None).as_millis(),
                expected_ms,
                "attempt {attempt}"
            );
        }
    }

    #[test]
    fn test_delay_honours_preferred_interval_within_cap() {
        let p = policy();

        assert_eq!(
            p.delay_after(1, Some(time::Duration::from_millis(300))),
            time::Duration::from_millis(300)
        );
        assert_eq!(
            p.delay_after(3, Some(time::Duration::from_millis(50))),
            time::Duration::from_millis(400)
        );
        assert_eq!(
            p.delay_after(1, Some(time::Duration::from_secs(120))),
            time::Duration::from_millis(500)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_on_kth_attempt() {
        let p = policy();
        let cancel = CancellationToken::new();
        let retries = AtomicU64::new(0);
        let calls = AtomicU32::new(0);

        let result = p
            .execute(&cancel, &retries, |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(transient())
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(retries.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_transient_exhausts_attempts() {
        let p = policy();
        let cancel = CancellationToken::new();
        let retries = AtomicU64::new(0);
        let calls = AtomicU32::new(0);
        let started = Instant::now();

        let result: Result<(), _> = p
            .execute(&cancel, &retries, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(transient()) }
            })
            .await;

        match result {
            Err(FetchError::RetryExhausted { attempts, last }) => {
                assert_eq!(attempts, 4);
                assert!(last.is_transient());
            }
            other => panic!("expected RetryExhausted, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(retries.load(Ordering::SeqCst), 3);
        // 100 + 200 + 400 of backoff between the four attempts.
        assert_eq!(started.elapsed(), time::Duration::from_millis(700));
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_is_not_retried() {
        let p = policy();
        let cancel = CancellationToken::new();
        let retries = AtomicU64::new(0);
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = p
            .execute(&cancel, &retries, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(FetchError::Permanent {
                        api: "test".to_owned(),
                        status: Some(StatusCode::NOT_FOUND),
                        reason: "not found".to_owned(),
                    })
                }
            })
            .await;

        assert!(matches!(result, Err(FetchError::Permanent { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(retries.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_classifier() {
        let p = policy().with_classifier(|_| false);
        let cancel = CancellationToken::new();
        let retries = AtomicU64::new(0);

        let result: Result<(), _> = p
            .execute(&cancel, &retries, |_| async { Err(transient()) })
            .await;

        assert!(result.unwrap_err().is_transient());
        assert_eq!(retries.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_during_backoff_stops_retrying() {
        let p = RetryPolicy::new(
            5,
            time::Duration::from_secs(10),
            time::Duration::from_secs(60),
        );
        let cancel = CancellationToken::new();
        let retries = AtomicU64::new(0);
        let calls = AtomicU32::new(0);

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(time::Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let result: Result<(), _> = p
            .execute(&cancel, &retries, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(transient()) }
            })
            .await;

        assert!(matches!(result, Err(FetchError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_already_cancelled_never_calls() {
        let p = policy();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let retries = AtomicU64::new(0);
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = p
            .execute(&cancel, &retries, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;

        assert!(matches!(result, Err(FetchError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
