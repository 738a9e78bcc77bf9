//! Retry policy with exponential backoff

use std::fmt::Display;
use std::future::Future;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Classifies errors as worth retrying or not
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for io::Error {
    fn is_retryable(&self) -> bool {
        !matches!(
            self.kind(),
            io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData | io::ErrorKind::Unsupported
        )
    }
}

/// Retry errors
#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("Max retry attempts reached ({attempts}): {last}")]
    Exhausted { attempts: u32, last: E },

    #[error("Non-retryable error: {0}")]
    Permanent(E),

    #[error("Retry cancelled")]
    Cancelled,
}

impl<E> RetryError<E> {
    pub fn is_exhausted(&self) -> bool {
        matches!(self, RetryError::Exhausted { .. })
    }
}

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay after the first failed attempt
    pub initial_backoff: Duration,
    /// Upper bound for any single delay
    pub max_backoff: Duration,
    /// Backoff multiplier
    pub multiplier: f64,
    /// Total attempts allowed, including the first one
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            multiplier: 2.0,
            max_attempts: 10_000,
        }
    }
}

impl RetryPolicy {
    /// Delay slept after failed attempt `attempt` (1-based):
    /// `initial_backoff * multiplier^(attempt - 1)`, capped at `max_backoff`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let multiplier = self.multiplier.max(1.0);

        let delay = if multiplier.fract() == 0.0 && multiplier <= u32::MAX as f64 {
            (multiplier as u32)
                .checked_pow(exponent)
                .and_then(|factor| self.initial_backoff.checked_mul(factor))
        } else {
            let exponent = exponent.min(i32::MAX as u32) as i32;
            let secs = self.initial_backoff.as_secs_f64() * multiplier.powi(exponent);
            Duration::try_from_secs_f64(secs).ok()
        };

        match delay {
            Some(delay) => delay.min(self.max_backoff),
            None => self.max_backoff,
        }
    }

    /// Stateful backoff tracker following this policy
    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.clone())
    }

    /// Run `op` until it succeeds, using [`Retryable`] to classify failures
    pub async fn run<T, E, F, Fut>(
        &self,
        label: &str,
        cancel: &CancellationToken,
        op: F,
    ) -> Result<T, RetryError<E>>
    where
        E: Retryable + Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run_if(label, cancel, op, E::is_retryable).await
    }

    /// Run `op` until it succeeds, using `is_retryable` to classify failures
    ///
    /// Non-retryable errors return immediately. After `max_attempts` failed
    /// attempts the last error is returned as [`RetryError::Exhausted`].
    pub async fn run_if<T, E, F, Fut, P>(
        &self,
        label: &str,
        cancel: &CancellationToken,
        mut op: F,
        is_retryable: P,
    ) -> Result<T, RetryError<E>>
    where
        E: Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        let mut backoff = self.backoff();

        loop {
            let attempt = backoff.attempt() + 1;

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                result = op() => result,
            };

            let err = match result {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(label, attempt, "Succeeded after retrying");
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            if !is_retryable(&err) {
                warn!(label, attempt, error = %err, "Non-retryable error");
                return Err(RetryError::Permanent(err));
            }

            let Some(delay) = backoff.next_delay() else {
                error!(
                    label,
                    attempts = attempt,
                    error = %err,
                    "Max retry attempts reached"
                );
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: err,
                });
            };

            warn!(
                label,
                attempt,
                max_attempts = self.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Attempt failed, retrying"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                _ = sleep(delay) => {}
            }
        }
    }
}

/// Tracks failed attempts and hands out the delay before the next one
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Record a failed attempt and return the delay before the next one,
    /// or `None` when the attempt budget is spent
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.attempt = self.attempt.saturating_add(1);
        if self.attempt >= self.policy.max_attempts.max(1) {
            return None;
        }
        Some(self.policy.delay_for(self.attempt))
    }

    /// Reset after a successful attempt
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Number of failed attempts recorded so far
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(100),
            multiplier: 2.0,
            max_attempts,
        }
    }

    fn refused() -> io::Error {
        io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused")
    }

    #[test]
    fn test_delay_growth_and_cap() {
        let policy = policy(10);

        assert_eq!(policy.delay_for(1), Duration::from_millis(10));
        assert_eq!(policy.delay_for(2), Duration::from_millis(20));
        assert_eq!(policy.delay_for(3), Duration::from_millis(40));
        assert_eq!(policy.delay_for(4), Duration::from_millis(80));
        // Should cap at max_backoff
        assert_eq!(policy.delay_for(5), Duration::from_millis(100));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_millis(100));
    }

    #[test]
    fn test_fractional_multiplier() {
        let policy = RetryPolicy {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            multiplier: 1.5,
            max_attempts: 5,
        };

        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert!(policy.delay_for(2) > Duration::from_millis(149));
        assert!(policy.delay_for(2) < Duration::from_millis(151));
    }

    #[test]
    fn test_backoff_budget_and_reset() {
        let mut backoff = policy(3).backoff();

        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(10)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(20)));
        assert_eq!(backoff.next_delay(), None);
        assert_eq!(backoff.attempt(), 3);

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(10)));
    }

    #[test]
    fn test_io_error_classification() {
        assert!(refused().is_retryable());
        assert!(io::Error::from(io::ErrorKind::TimedOut).is_retryable());
        assert!(io::Error::from(io::ErrorKind::ConnectionReset).is_retryable());
        assert!(!io::Error::from(io::ErrorKind::InvalidInput).is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_is_deterministic() {
        let attempts = Arc::new(Mutex::new(Vec::new()));
        let start = Instant::now();

        let recorded = attempts.clone();
        let result: Result<(), RetryError<io::Error>> = policy(3)
            .run("dial", &CancellationToken::new(), || {
                recorded.lock().unwrap().push(start.elapsed());
                async { Err(refused()) }
            })
            .await;

        match result {
            Err(RetryError::Exhausted { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert_eq!(last.kind(), io::ErrorKind::ConnectionRefused);
            }
            other => panic!("expected exhaustion, got {:?}", other),
        }

        // Attempt k is followed by a delay of base * factor^(k-1)
        let attempts = attempts.lock().unwrap();
        assert_eq!(
            *attempts,
            vec![
                Duration::ZERO,
                Duration::from_millis(10),
                Duration::from_millis(30),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_failures() {
        let calls = AtomicU32::new(0);

        let result = policy(10)
            .run("dial", &CancellationToken::new(), || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 4 {
                        Err(refused())
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(result, 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_skips_budget() {
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = policy(10)
            .run("dial", &CancellationToken::new(), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(io::Error::from(io::ErrorKind::InvalidInput)) }
            })
            .await;

        assert!(matches!(result, Err(RetryError::Permanent(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_predicate() {
        let calls = AtomicU32::new(0);

        let result: Result<(), RetryError<String>> = policy(5)
            .run_if(
                "custom",
                &CancellationToken::new(),
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err("always".to_string()) }
                },
                |_| true,
            )
            .await;

        assert!(result.unwrap_err().is_exhausted());
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let cancel = CancellationToken::new();
        let policy = RetryPolicy {
            initial_backoff: Duration::from_secs(30),
            max_backoff: Duration::from_secs(60),
            ..policy(10)
        };

        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(5)).await;
            trigger.cancel();
        });

        let result: Result<(), RetryError<io::Error>> =
            policy.run("dial", &cancel, || async { Err(refused()) }).await;

        assert!(matches!(result, Err(RetryError::Cancelled)));
    }
}
