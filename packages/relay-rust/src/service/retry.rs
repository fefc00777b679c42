//! Bounded retry with linear backoff for fallible async actions.
//!
//! Attempt `n` (1-based) that fails is followed by a sleep of
//! `base_delay * n` before attempt `n + 1`. There is no sleep after the last
//! attempt. Errors whose [`Retryable::is_retryable`] returns `false` end the
//! run immediately.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use super::error::{HandlerError, RelayError};
use crate::traits::BridgeError;

/// Retry policy: attempt budget and backoff base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included. Values below 1 act as 1.
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    #[must_use]
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }

    /// Sleep after the failed attempt number `attempt` (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
        }
    }
}

/// Classifies whether an error is worth another attempt.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for RelayError {
    fn is_retryable(&self) -> bool {
        RelayError::is_retryable(self)
    }
}

impl Retryable for BridgeError {
    fn is_retryable(&self) -> bool {
        self.class() == opsbridge_core::ErrorClass::Transient
    }
}

impl Retryable for HandlerError {
    fn is_retryable(&self) -> bool {
        self.class() == opsbridge_core::ErrorClass::Transient
    }
}

impl Retryable for anyhow::Error {
    fn is_retryable(&self) -> bool {
        if let Some(err) = self.downcast_ref::<RelayError>() {
            return err.is_retryable();
        }
        if let Some(err) = self.downcast_ref::<BridgeError>() {
            return Retryable::is_retryable(err);
        }
        if let Some(err) = self.downcast_ref::<HandlerError>() {
            return Retryable::is_retryable(err);
        }
        true
    }
}

/// Failure of a retried action. Displays as the underlying error.
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    /// Every attempt failed; `last` is the final attempt's error.
    #[error("{last}")]
    Exhausted { attempts: u32, last: E },
    /// A non-retryable error ended the run early.
    #[error("{error}")]
    Aborted { attempt: u32, error: E },
}

impl<E> RetryError<E> {
    /// Attempts made before giving up.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { attempts, .. } => *attempts,
            Self::Aborted { attempt, .. } => *attempt,
        }
    }

    #[must_use]
    pub fn inner(&self) -> &E {
        match self {
            Self::Exhausted { last, .. } => last,
            Self::Aborted { error, .. } => error,
        }
    }

    #[must_use]
    pub fn into_inner(self) -> E {
        match self {
            Self::Exhausted { last, .. } => last,
            Self::Aborted { error, .. } => error,
        }
    }
}

/// Runs an action until it succeeds or the policy's budget is spent.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryingActionRunner {
    policy: RetryPolicy,
}

impl RetryingActionRunner {
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    #[must_use]
    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Run `action`, retrying retryable failures with linear backoff.
    ///
    /// # Errors
    ///
    /// Returns [`RetryError::Exhausted`] with the last error once every
    /// attempt failed, or [`RetryError::Aborted`] on a non-retryable error.
    pub async fn run<T, E, F, Fut>(&self, label: &str, mut action: F) -> Result<T, RetryError<E>>
    where
        E: fmt::Display + Retryable,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match action().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(%label, attempt, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(error) if !error.is_retryable() => {
                    warn!(%label, attempt, %error, "non-retryable failure");
                    return Err(RetryError::Aborted { attempt, error });
                }
                Err(last) if attempt >= max_attempts => {
                    warn!(%label, attempts = attempt, error = %last, "retries exhausted");
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last,
                    });
                }
                Err(error) => {
                    let delay = self.policy.delay_for(attempt);
                    warn!(
                        %label,
                        attempt,
                        max_attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        %error,
                        "attempt failed, retrying"
                    );
                    metrics::counter!("opsbridge_retry_attempts_total").increment(1);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Run `action` up to `max_attempts` times with a `base_delay_ms * attempt`
/// pause between failures.
///
/// # Errors
///
/// See [`RetryingActionRunner::run`].
pub async fn run_with_retry<T, E, F, Fut>(
    action: F,
    max_attempts: u32,
    base_delay_ms: u64,
) -> Result<T, RetryError<E>>
where
    E: fmt::Display + Retryable,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    RetryingActionRunner::new(RetryPolicy::new(
        max_attempts,
        Duration::from_millis(base_delay_ms),
    ))
    .run("action", action)
    .await
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use tokio::time::Instant;

    use super::*;

    fn flaky(calls: &Arc<AtomicU32>, succeed_on: u32) -> impl FnMut() -> std::pin::Pin<Box<dyn Future<Output = Result<u32, BridgeError>> + Send>> {
        let calls = Arc::clone(calls);
        move || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            Box::pin(async move {
                if n >= succeed_on {
                    Ok(n)
                } else {
                    Err(BridgeError::Transient(format!("attempt {n}")))
                }
            })
        }
    }

    #[test]
    fn backoff_is_linear() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(3), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn success_after_failures_sleeps_between_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let start = Instant::now();
        let value = run_with_retry(flaky(&calls, 3), 3, 100).await.unwrap();

        assert_eq!(value, 3);
        // 100ms after attempt 1, 200ms after attempt 2.
        assert!(start.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_returns_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let start = Instant::now();
        let err = run_with_retry(flaky(&calls, u32::MAX), 3, 100)
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(err.attempts(), 3);
        assert_eq!(err.inner(), &BridgeError::Transient("attempt 3".into()));
        // The caller sees the last error's own text.
        assert_eq!(err.to_string(), "attempt 3");
        // No sleep after the final attempt.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(300));
        assert!(elapsed < Duration::from_millis(600));
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let err = RetryingActionRunner::new(RetryPolicy::new(5, Duration::from_millis(10)))
            .run("sign", move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(BridgeError::PermissionDenied("SIGN_TRANSACTION".into())) }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, RetryError::Aborted { attempt: 1, .. }));
        assert_eq!(err.to_string(), "Permission denied: SIGN_TRANSACTION");
    }

    #[tokio::test(start_paused = true)]
    async fn zero_attempts_still_runs_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let err = run_with_retry(flaky(&calls, u32::MAX), 0, 10).await.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.attempts(), 1);
    }

    #[test]
    fn anyhow_errors_classify_through_downcast() {
        let permanent = anyhow::Error::new(BridgeError::NotDetected);
        let opaque = anyhow::anyhow!("network hiccup");
        assert!(!Retryable::is_retryable(&permanent));
        assert!(Retryable::is_retryable(&opaque));
    }
}
