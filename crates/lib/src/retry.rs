//! Bounded retry with backoff for async operations.
//!
//! Transient failures are retried; permanent failures and cancellation return immediately.
//! Every retry is logged with the operation name, subject, attempt number, and delay.

use crate::error::{Classify, FailureClass};
use crate::event::SubjectId;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Attempts made by the default policy.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Default exponential base in seconds (delays 2s, 4s, 8s, ...).
pub const DEFAULT_BASE_SECS: f64 = 2.0;

/// Delay schedule between attempts. `attempt` is the 1-based number of the attempt that just failed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    /// `base_secs ^ attempt` seconds.
    Exponential { base_secs: f64 },
    /// `step * attempt`.
    Linear { step: Duration },
}

impl Backoff {
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Exponential { base_secs } => {
                let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
                Duration::try_from_secs_f64(base_secs.powi(exp)).unwrap_or(Duration::MAX)
            }
            Backoff::Linear { step } => step.saturating_mul(attempt),
        }
    }
}

/// Diagnostic context of one retried operation.
#[derive(Debug, Clone)]
pub struct RetryContext {
    pub operation: &'static str,
    pub subject: Option<SubjectId>,
}

impl RetryContext {
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            subject: None,
        }
    }

    pub fn for_subject(operation: &'static str, subject: SubjectId) -> Self {
        Self {
            operation,
            subject: Some(subject),
        }
    }
}

impl fmt::Display for RetryContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.subject {
            Some(s) => write!(f, "{} (subject {})", self.operation, s),
            None => f.write_str(self.operation),
        }
    }
}

/// Why a retried operation did not produce a value.
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error("operation cancelled")]
    Cancelled,
    #[error("permanent failure: {0}")]
    Permanent(E),
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },
}

impl<E> RetryError<E> {
    /// The underlying error, when one was observed.
    pub fn into_inner(self) -> Option<E> {
        match self {
            RetryError::Cancelled => None,
            RetryError::Permanent(e) | RetryError::Exhausted { last: e, .. } => Some(e),
        }
    }
}

impl<E> Classify for RetryError<E> {
    fn failure_class(&self) -> FailureClass {
        match self {
            RetryError::Cancelled => FailureClass::Cancelled,
            RetryError::Permanent(_) => FailureClass::Permanent,
            RetryError::Exhausted { .. } => FailureClass::Transient,
        }
    }
}

/// Retry policy: attempt count plus backoff schedule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(DEFAULT_MAX_ATTEMPTS, DEFAULT_BASE_SECS)
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    pub fn exponential(max_attempts: u32, base_secs: f64) -> Self {
        Self::new(max_attempts, Backoff::Exponential { base_secs })
    }

    pub fn linear(max_attempts: u32, step: Duration) -> Self {
        Self::new(max_attempts, Backoff::Linear { step })
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn backoff(&self) -> Backoff {
        self.backoff
    }

    /// Run `op` until it succeeds, fails permanently, is cancelled, or attempts run out.
    pub async fn execute<T, E, F, Fut>(
        &self,
        ctx: RetryContext,
        ct: &CancellationToken,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + fmt::Display,
    {
        let mut attempt = 0;
        loop {
            if ct.is_cancelled() {
                log::info!("retry: {} cancelled before attempt {}", ctx, attempt + 1);
                return Err(RetryError::Cancelled);
            }
            attempt += 1;
            let result = tokio::select! {
                biased;
                _ = ct.cancelled() => {
                    log::info!("retry: {} cancelled during attempt {}", ctx, attempt);
                    return Err(RetryError::Cancelled);
                }
                r = op() => r,
            };
            let err = match result {
                Ok(v) => return Ok(v),
                Err(e) => e,
            };
            match err.failure_class() {
                FailureClass::Cancelled => {
                    log::info!("retry: {} cancelled: {}", ctx, err);
                    return Err(RetryError::Cancelled);
                }
                FailureClass::Permanent => {
                    log::warn!("retry: {} failed permanently, not retrying: {}", ctx, err);
                    return Err(RetryError::Permanent(err));
                }
                FailureClass::Transient if attempt >= self.max_attempts => {
                    log::error!("retry: {} failed after {} attempts: {}", ctx, attempt, err);
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last: err,
                    });
                }
                FailureClass::Transient => {
                    let delay = self.backoff.delay(attempt);
                    log::warn!(
                        "retry: {} failed (attempt {}/{}), retrying in {:?}: {}",
                        ctx,
                        attempt,
                        self.max_attempts,
                        delay,
                        err
                    );
                    tokio::select! {
                        biased;
                        _ = ct.cancelled() => {
                            log::info!("retry: {} cancelled while backing off", ctx);
                            return Err(RetryError::Cancelled);
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{PlatformError, PlatformErrorKind};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn transient() -> PlatformError {
        PlatformError::new(PlatformErrorKind::Network, "connection reset")
    }

    #[test]
    fn exponential_delays_grow_by_base() {
        let b = Backoff::Exponential { base_secs: 2.0 };
        assert_eq!(b.delay(1), Duration::from_secs(2));
        assert_eq!(b.delay(2), Duration::from_secs(4));
        assert_eq!(b.delay(3), Duration::from_secs(8));
    }

    #[test]
    fn linear_delays_grow_by_step() {
        let b = Backoff::Linear {
            step: Duration::from_millis(100),
        };
        assert_eq!(b.delay(1), Duration::from_millis(100));
        assert_eq!(b.delay(2), Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn two_failures_then_success_takes_three_attempts() {
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();
        let result = RetryPolicy::default()
            .execute(RetryContext::new("test"), &CancellationToken::new(), || async {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(transient())
                } else {
                    Ok(n)
                }
            })
            .await;
        assert_eq!(result.ok(), Some(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn always_failing_exhausts_three_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = RetryPolicy::default()
            .execute(RetryContext::new("test"), &CancellationToken::new(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(transient())
            })
            .await;
        assert!(matches!(result, Err(RetryError::Exhausted { attempts: 3, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failure_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = RetryPolicy::default()
            .execute(
                RetryContext::for_subject("send", SubjectId(9)),
                &CancellationToken::new(),
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(PlatformError::new(PlatformErrorKind::Blocked, "bot was blocked"))
                },
            )
            .await;
        assert!(matches!(result, Err(RetryError::Permanent(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_backoff_stops_retrying() {
        let calls = AtomicU32::new(0);
        let ct = CancellationToken::new();
        let canceller = ct.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });
        let result: Result<(), _> = RetryPolicy::default()
            .execute(RetryContext::new("test"), &ct, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(transient())
            })
            .await;
        assert!(matches!(result, Err(RetryError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn already_cancelled_never_runs() {
        let calls = AtomicU32::new(0);
        let ct = CancellationToken::new();
        ct.cancel();
        let result = RetryPolicy::default()
            .execute(RetryContext::new("test"), &ct, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<(), PlatformError>(())
            })
            .await;
        assert!(matches!(result, Err(RetryError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
