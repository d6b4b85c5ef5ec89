//! Backoff for executors that fail after their undo window.
//!
//! Nothing is retried by default: `[undo.retry] max_attempts = 1`. When more
//! attempts are configured, only failures that a rerun could fix are retried
//! (see [`ActionError::is_retryable`](crate::error::ActionError::is_retryable)).
//! A panicking executor or a key missing from a bulk response fails at once.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first. Never below 1.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    pub backoff_factor: f64,
    /// Jitter as a fraction of each delay (0.1 = ±10%).
    pub jitter_percent: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::once()
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new(
        max_attempts: u32,
        initial_delay: Duration,
        max_delay: Duration,
        backoff_factor: f64,
        jitter_percent: f64,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            max_delay: max_delay.max(initial_delay),
            backoff_factor: if backoff_factor.is_nan() {
                1.0
            } else {
                backoff_factor.max(1.0)
            },
            jitter_percent: if jitter_percent.is_nan() {
                0.0
            } else {
                jitter_percent.clamp(0.0, 1.0)
            },
        }
    }

    /// A single attempt.
    #[must_use]
    pub fn once() -> Self {
        Self::new(1, Duration::from_millis(250), Duration::from_secs(5), 2.0, 0.1)
    }

    pub fn retries_enabled(&self) -> bool {
        self.max_attempts > 1
    }

    /// Delays between attempts, one per retry.
    pub fn backoff(&self) -> Backoff<'_> {
        Backoff {
            policy: self,
            next: self.initial_delay,
            remaining: self.max_attempts - 1,
        }
    }

    fn jittered(&self, base: Duration) -> Duration {
        if self.jitter_percent <= 0.0 || base.is_zero() {
            return base;
        }
        let spread = base.as_secs_f64() * self.jitter_percent;
        let offset = rand::rng().random_range(-spread..=spread);
        Duration::try_from_secs_f64((base.as_secs_f64() + offset).max(0.0)).unwrap_or(base)
    }

    /// `delay * backoff_factor`, saturating at `max_delay`.
    fn grow(&self, delay: Duration) -> Duration {
        Duration::try_from_secs_f64(delay.as_secs_f64() * self.backoff_factor)
            .map_or(self.max_delay, |next| next.min(self.max_delay))
    }
}

/// Iterator over retry delays of a [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct Backoff<'a> {
    policy: &'a RetryPolicy,
    next: Duration,
    remaining: u32,
}

impl Iterator for Backoff<'_> {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let base = self.next.min(self.policy.max_delay);
        self.next = self.policy.grow(self.next);
        Some(self.policy.jittered(base))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.remaining as usize;
        (n, Some(n))
    }
}

/// Run `operation`, retrying every failure per `policy`.
pub async fn with_retry<T, E, F, Fut>(policy: &RetryPolicy, operation: F) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    with_retry_if(policy, operation, |_| true).await
}

/// Run `operation`, retrying only failures for which `retryable` holds.
///
/// Returns the last error once attempts run out or a failure is not
/// retryable.
pub async fn with_retry_if<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    mut operation: F,
    retryable: P,
) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let mut delays = policy.backoff();
    let mut attempt = 1_u32;
    loop {
        let err = match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt, "Executor succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        if !retryable(&err) {
            debug!(attempt, error = %err, "Failure is not retryable");
            return Err(err);
        }
        let Some(delay) = delays.next() else {
            if policy.retries_enabled() {
                warn!(attempt, error = %err, "Executor failed on every attempt");
            }
            return Err(err);
        };
        debug!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Executor failed; retrying"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, ms(10), ms(100), 2.0, 0.0)
    }

    fn failing(calls: &Arc<AtomicU32>, succeed_on: u32) -> impl FnMut() -> std::future::Ready<Result<u32, String>> {
        let calls = Arc::clone(calls);
        move || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            std::future::ready(if n >= succeed_on {
                Ok(n)
            } else {
                Err(format!("attempt {n} failed"))
            })
        }
    }

    #[test]
    fn backoff_doubles_then_caps() {
        let policy = RetryPolicy::new(6, ms(20), ms(100), 2.0, 0.0);
        let delays: Vec<Duration> = policy.backoff().collect();
        assert_eq!(delays, vec![ms(20), ms(40), ms(80), ms(100), ms(100)]);
    }

    #[test]
    fn single_attempt_has_no_backoff() {
        assert_eq!(RetryPolicy::once().backoff().count(), 0);
        assert!(!RetryPolicy::default().retries_enabled());
    }

    #[test]
    fn jitter_stays_within_spread() {
        let policy = RetryPolicy::new(2, Duration::from_secs(1), Duration::from_secs(1), 1.0, 0.1);
        for _ in 0..100 {
            let delay = policy.backoff().next().unwrap().as_millis();
            assert!((900..=1100).contains(&delay), "delay out of range: {delay}");
        }
    }

    #[test]
    fn constructor_normalizes_inputs() {
        let policy = RetryPolicy::new(0, ms(50), ms(10), 0.5, 3.0);
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.max_delay, ms(50));
        assert!((policy.backoff_factor - 1.0).abs() < f64::EPSILON);
        assert!((policy.jitter_percent - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn huge_factor_saturates_at_max_delay() {
        let policy = RetryPolicy::new(4, ms(250), ms(5_000), 1e20, 0.0);
        let delays: Vec<Duration> = policy.backoff().collect();
        assert_eq!(delays, vec![ms(250), ms(5_000), ms(5_000)]);

        let policy = RetryPolicy::new(3, ms(250), ms(5_000), f64::INFINITY, 0.0);
        assert_eq!(policy.backoff().last(), Some(ms(5_000)));
    }

    #[test]
    fn nan_inputs_fall_back_to_plain_backoff() {
        let policy = RetryPolicy::new(3, ms(10), ms(100), f64::NAN, f64::NAN);
        assert!((policy.backoff_factor - 1.0).abs() < f64::EPSILON);
        assert!(policy.jitter_percent.abs() < f64::EPSILON);
        assert_eq!(policy.backoff().collect::<Vec<_>>(), vec![ms(10), ms(10)]);
    }

    #[tokio::test(start_paused = true)]
    async fn single_attempt_returns_first_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let result = with_retry(&policy(1), failing(&calls, 5)).await;
        assert_eq!(result, Err("attempt 1 failed".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_from_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let started = tokio::time::Instant::now();
        let result = with_retry(&policy(5), failing(&calls, 3)).await;
        assert_eq!(result, Ok(3));
        assert_eq!(started.elapsed(), ms(30));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_last_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let result = with_retry(&policy(3), failing(&calls, 10)).await;
        assert_eq!(result, Err("attempt 3 failed".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failures_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let result = with_retry_if(&policy(5), failing(&calls, 10), |err: &String| {
            !err.starts_with("attempt 2")
        })
        .await;
        assert_eq!(result, Err("attempt 2 failed".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
