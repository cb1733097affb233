//! Retry with jittered exponential backoff.
//!
//! Three named policies are used across the pipeline: `S` (engine connect),
//! `R` (result publish) and `Q` (job publish). Each is a plain [`RetryPolicy`]
//! value; see the `policies` module for the concrete configurations.

use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::sync::watch;

use crate::circuit::Attempt;

#[derive(Copy, Clone, Debug)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first), never exceeded (I5).
    pub max_attempts: u32,
    /// Delay before the first retry (attempt 0).
    pub initial: Duration,
    /// Ceiling applied to the un-jittered backoff.
    pub cap: Duration,
    /// Multiplicative growth applied per attempt.
    pub growth: u32,
    /// Symmetric jitter fraction, e.g. `0.2` for +/-20%.
    pub jitter: f64,
}

impl RetryPolicy {
    /// The un-jittered backoff for 0-indexed `attempt`: `min(initial * growth^attempt, cap)`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = self.growth.saturating_pow(attempt);
        let candidate = self.initial.saturating_mul(factor);
        std::cmp::min(candidate, self.cap)
    }

    /// The actual delay for 0-indexed `attempt`, with symmetric jitter applied.
    /// Falls back to `initial` if jitter would otherwise produce a negative delay.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter <= 0.0 {
            return base;
        }
        let offset = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        let scaled = base.as_secs_f64() * (1.0 + offset);
        if scaled <= 0.0 {
            self.initial
        } else {
            Duration::from_secs_f64(scaled)
        }
    }
}

pub mod policies {
    use super::RetryPolicy;
    use std::time::Duration;

    /// Processor -> engine TCP dial.
    pub const ENGINE_CONNECT: RetryPolicy = RetryPolicy {
        max_attempts: 3,
        initial: Duration::from_millis(100),
        cap: Duration::from_secs(5),
        growth: 2,
        jitter: 0.2,
    };

    /// Processor -> queue push of a result.
    pub const RESULT_PUBLISH: RetryPolicy = RetryPolicy {
        max_attempts: 3,
        initial: Duration::from_millis(100),
        cap: Duration::from_secs(5),
        growth: 2,
        jitter: 0.2,
    };

    /// Front-End -> queue push of a job.
    pub const JOB_PUBLISH: RetryPolicy = RetryPolicy {
        max_attempts: 2,
        initial: Duration::from_millis(50),
        cap: Duration::from_millis(50),
        growth: 1,
        jitter: 0.0,
    };
}

#[derive(Error, Debug)]
pub enum RetryError<E> {
    #[error("retries exhausted: {0}")]
    Exhausted(E),
    #[error("cancelled while waiting to retry")]
    Cancelled,
}

/// Run `operation` under `policy`, sleeping with jittered backoff between
/// attempts. `labels` is `(service, operation_name)`, used to increment a
/// retry counter on every attempt after the first. `cancel` is watched
/// between attempts; a `true` value aborts the wait and returns
/// [`RetryError::Cancelled`].
pub async fn retry_with_backoff<F, Fut, T, E>(
    policy: RetryPolicy,
    labels: (&str, &str),
    cancel: &watch::Receiver<bool>,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
{
    let mut last_error = None;

    for attempt in 0..policy.max_attempts {
        if attempt > 0 {
            metrics::counter!(
                "retry_attempts_total",
                "service" => labels.0.to_owned(),
                "operation" => labels.1.to_owned(),
                "attempt" => attempt.to_string(),
            )
            .increment(1);

            let delay = policy.delay_for_attempt(attempt - 1);
            let mut cancel = cancel.clone();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        return Err(RetryError::Cancelled);
                    }
                }
            }
        }

        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => last_error = Some(error),
        }
    }

    Err(RetryError::Exhausted(last_error.expect(
        "max_attempts >= 1 guarantees at least one recorded error",
    )))
}

/// Run `operation` through a breaker-guarded `attempt`: a single bare try
/// with no backoff when `attempt` is the HalfOpen probe (a half-open probe
/// is one attempt), otherwise the full `policy` retry loop.
pub async fn retry_unless_probe<F, Fut, T, E>(
    attempt: &Attempt<'_>,
    policy: RetryPolicy,
    labels: (&str, &str),
    cancel: &watch::Receiver<bool>,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
{
    if attempt.is_probe() {
        operation(0).await.map_err(RetryError::Exhausted)
    } else {
        retry_with_backoff(policy, labels, cancel, operation).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::CircuitBreaker;

    #[test]
    fn base_delay_grows_and_caps() {
        let policy = policies::ENGINE_CONNECT;
        assert_eq!(policy.base_delay(0), Duration::from_millis(100));
        assert_eq!(policy.base_delay(1), Duration::from_millis(200));
        assert_eq!(policy.base_delay(2), Duration::from_millis(400));
        // Large attempt counts must clamp to the cap, not overflow or panic.
        assert_eq!(policy.base_delay(40), Duration::from_secs(5));
    }

    #[test]
    fn jittered_delay_stays_within_bounds() {
        let policy = policies::ENGINE_CONNECT;
        for attempt in 0..5 {
            let base = policy.base_delay(attempt).as_secs_f64();
            let lower = base * (1.0 - policy.jitter);
            let upper = base * (1.0 + policy.jitter);
            for _ in 0..200 {
                let actual = policy.delay_for_attempt(attempt).as_secs_f64();
                assert!(
                    actual >= lower - f64::EPSILON && actual <= upper + f64::EPSILON,
                    "attempt {attempt}: {actual} not in [{lower}, {upper}]"
                );
            }
        }
    }

    #[test]
    fn zero_jitter_policy_is_exact() {
        let policy = policies::JOB_PUBLISH;
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(50));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(50));
    }

    #[tokio::test]
    async fn retries_exhaust_and_wrap_last_error() {
        let (_tx, rx) = watch::channel(false);
        let mut calls = 0;
        let result: Result<(), RetryError<&'static str>> = retry_with_backoff(
            RetryPolicy {
                max_attempts: 3,
                initial: Duration::from_millis(1),
                cap: Duration::from_millis(1),
                growth: 1,
                jitter: 0.0,
            },
            ("worker", "engine_connect"),
            &rx,
            |_attempt| {
                calls += 1;
                async move { Err("boom") }
            },
        )
        .await;

        assert_eq!(calls, 3);
        assert!(matches!(result, Err(RetryError::Exhausted("boom"))));
    }

    #[tokio::test]
    async fn succeeds_without_exhausting_attempts() {
        let (_tx, rx) = watch::channel(false);
        let mut calls = 0;
        let result = retry_with_backoff(
            RetryPolicy {
                max_attempts: 3,
                initial: Duration::from_millis(1),
                cap: Duration::from_millis(1),
                growth: 1,
                jitter: 0.0,
            },
            ("worker", "engine_connect"),
            &rx,
            |attempt| {
                calls += 1;
                async move {
                    if attempt < 1 {
                        Err("transient")
                    } else {
                        Ok(42)
                    }
                }
            },
        )
        .await;

        assert_eq!(calls, 2);
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn cancellation_aborts_wait() {
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        let result: Result<(), RetryError<&'static str>> = retry_with_backoff(
            RetryPolicy {
                max_attempts: 3,
                initial: Duration::from_secs(30),
                cap: Duration::from_secs(30),
                growth: 1,
                jitter: 0.0,
            },
            ("worker", "engine_connect"),
            &rx,
            |_attempt| async move { Err("transient") },
        )
        .await;

        assert!(matches!(result, Err(RetryError::Cancelled)));
    }

    #[tokio::test]
    async fn probe_attempt_does_not_retry_on_failure() {
        let breaker = CircuitBreaker::new("worker", "engine", 1, Duration::from_millis(1));
        breaker.guard().unwrap().failed();
        std::thread::sleep(Duration::from_millis(5));
        let attempt = breaker.guard().expect("half-open probe admitted");

        let (_tx, rx) = watch::channel(false);
        let mut calls = 0;
        let result: Result<(), RetryError<&'static str>> = retry_unless_probe(
            &attempt,
            RetryPolicy {
                max_attempts: 3,
                initial: Duration::from_millis(1),
                cap: Duration::from_millis(1),
                growth: 1,
                jitter: 0.0,
            },
            ("worker", "engine_connect"),
            &rx,
            |_attempt| {
                calls += 1;
                async move { Err("boom") }
            },
        )
        .await;

        assert_eq!(calls, 1, "a half-open probe is one attempt");
        assert!(matches!(result, Err(RetryError::Exhausted("boom"))));
    }

    #[tokio::test]
    async fn closed_attempt_retries_normally_through_helper() {
        let breaker = CircuitBreaker::new("worker", "engine", 5, Duration::from_secs(30));
        let attempt = breaker.guard().unwrap();

        let (_tx, rx) = watch::channel(false);
        let mut calls = 0;
        let result = retry_unless_probe(
            &attempt,
            RetryPolicy {
                max_attempts: 3,
                initial: Duration::from_millis(1),
                cap: Duration::from_millis(1),
                growth: 1,
                jitter: 0.0,
            },
            ("worker", "engine_connect"),
            &rx,
            |attempt| {
                calls += 1;
                async move { if attempt < 1 { Err("transient") } else { Ok(42) } }
            },
        )
        .await;

        assert_eq!(calls, 2);
        assert_eq!(result.unwrap(), 42);
    }
}
