//! Retry utilities with exponential backoff and jitter.
//!
//! Two entry points:
//! - [`retry_with_backoff`] retries every error until success or `max_attempts`.
//! - [`retry_until`] additionally honours an overall deadline and a predicate
//!   that separates retryable errors from permanent ones. Workers use it to poll
//!   the credential channel while the control plane is still booting.
//!
//! Deadlines are measured with `tokio::time::Instant`, so tests can drive the
//! backoff with paused time.
//!
//! # Example
//!
//! ```ignore
//! use keel_common::retry::{retry_until, RetryConfig};
//!
//! let token = retry_until(
//!     &RetryConfig::with_timeout(Duration::from_secs(600)),
//!     "fetch_worker_token",
//!     |e: &ChannelError| e.is_retryable(),
//!     || async { channel.get(WORKER_TOKEN_KEY).await },
//! )
//! .await?;
//! ```

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::{error, warn};

/// Shortest pause between attempts, whatever the configuration says
pub const MIN_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Configuration for operations that may fail transiently.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = unbounded)
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Overall deadline across all attempts (None = no deadline)
    pub timeout: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0, // unbounded
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            timeout: None,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Create a config that gives up once `timeout` has elapsed
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Default::default()
        }
    }

    /// Compute the next (un-jittered) delay after `delay`, never below
    /// [`MIN_RETRY_DELAY`]
    fn next_delay(&self, delay: Duration) -> Duration {
        Duration::from_secs_f64(
            (delay.as_secs_f64() * self.backoff_multiplier).min(self.max_delay.as_secs_f64()),
        )
        .max(MIN_RETRY_DELAY)
    }
}

/// Why [`retry_until`] stopped without a result
#[derive(Debug, PartialEq)]
pub enum RetryError<E> {
    /// The operation returned an error the predicate marked as permanent
    Permanent(E),
    /// `max_attempts` was reached
    Exhausted {
        /// Attempts made
        attempts: u32,
        /// The last error returned
        last: E,
    },
    /// The overall deadline passed
    TimedOut {
        /// Time spent retrying
        elapsed: Duration,
        /// The last error returned
        last: E,
    },
}

impl<E> RetryError<E> {
    /// The error that ended the retry loop
    pub fn into_inner(self) -> E {
        match self {
            Self::Permanent(e) => e,
            Self::Exhausted { last, .. } | Self::TimedOut { last, .. } => last,
        }
    }
}

/// Apply 0.5x to 1.5x jitter to a delay
fn jittered(delay: Duration) -> Duration {
    let jitter = rand::thread_rng().gen_range(0.5..1.5);
    Duration::from_secs_f64(delay.as_secs_f64() * jitter)
}

/// Execute an async operation with exponential backoff and jitter.
///
/// Retries every error until success or until `max_attempts` is reached (if
/// set). Uses exponential backoff with jitter to avoid thundering herd when a
/// whole fleet boots at once.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_until(config, operation_name, |_| true, operation)
        .await
        .map_err(RetryError::into_inner)
}

/// Execute an async operation with backoff until success, a permanent error,
/// exhausted attempts, or the overall deadline.
///
/// A sleep is never scheduled past the deadline: the final attempt happens at
/// the deadline at the latest, so a value that appears just before it is still
/// observed.
pub async fn retry_until<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    mut is_retryable: P,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: FnMut(&E) -> bool,
{
    let started = Instant::now();
    let deadline = config.timeout.map(|t| started + t);
    let mut attempt = 0u32;
    let mut delay = config.initial_delay.max(MIN_RETRY_DELAY);

    loop {
        attempt += 1;

        let e = match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };

        if !is_retryable(&e) {
            error!(
                operation = %operation_name,
                attempt = attempt,
                error = %e,
                "Operation failed with a permanent error"
            );
            return Err(RetryError::Permanent(e));
        }

        if config.max_attempts > 0 && attempt >= config.max_attempts {
            error!(
                operation = %operation_name,
                attempt = attempt,
                error = %e,
                "Operation failed after max retries"
            );
            return Err(RetryError::Exhausted { attempts: attempt, last: e });
        }

        let mut sleep_for = jittered(delay);
        if let Some(deadline) = deadline {
            let now = Instant::now();
            if now >= deadline {
                let elapsed = now.duration_since(started);
                error!(
                    operation = %operation_name,
                    attempt = attempt,
                    elapsed_ms = elapsed.as_millis(),
                    error = %e,
                    "Operation did not succeed before its deadline"
                );
                return Err(RetryError::TimedOut { elapsed, last: e });
            }
            sleep_for = sleep_for.min(deadline - now);
        }

        warn!(
            operation = %operation_name,
            attempt = attempt,
            error = %e,
            delay_ms = sleep_for.as_millis(),
            "Operation failed, retrying"
        );

        tokio::time::sleep(sleep_for).await;
        delay = config.next_delay(delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            backoff_multiplier: 2.0,
            timeout: None,
        }
    }

    #[tokio::test]
    async fn test_succeeds_immediately() {
        let config = RetryConfig::with_max_attempts(3);
        let result: Result<i32, &str> =
            retry_with_backoff(&config, "op", || async { Ok(42) }).await;
        assert_eq!(result, Ok(42));
    }

    #[tokio::test]
    async fn test_succeeds_after_failures() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<i32, &str> = retry_with_backoff(&fast_config(5), "op", || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("fail")
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausts_max_attempts() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<i32, &str> = retry_with_backoff(&fast_config(3), "op", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err("always fails")
            }
        })
        .await;

        assert_eq!(result, Err("always fails"));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_stops_immediately() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<i32, RetryError<&str>> = retry_until(
            &fast_config(0),
            "op",
            |e: &&str| *e != "denied",
            || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err("denied")
                }
            },
        )
        .await;

        assert_eq!(result, Err(RetryError::Permanent("denied")));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_ends_unbounded_retries() {
        let config = RetryConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            ..RetryConfig::with_timeout(Duration::from_secs(60))
        };

        let result: Result<(), RetryError<&str>> =
            retry_until(&config, "op", |_| true, || async { Err("not yet") }).await;

        match result {
            Err(RetryError::TimedOut { elapsed, last }) => {
                assert_eq!(last, "not yet");
                assert!(elapsed >= Duration::from_secs(60));
                // The last sleep is clamped to the deadline
                assert!(elapsed < Duration::from_secs(61));
            }
            other => panic!("expected TimedOut, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_value_appearing_before_deadline_is_observed() {
        let started = Instant::now();
        let config = RetryConfig {
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(20),
            ..RetryConfig::with_timeout(Duration::from_secs(120))
        };

        let result: Result<&str, RetryError<&str>> = retry_until(&config, "op", |_| true, || {
            let ready = started.elapsed() >= Duration::from_secs(45);
            async move {
                if ready {
                    Ok("token")
                } else {
                    Err("not found")
                }
            }
        })
        .await;

        assert_eq!(result, Ok("token"));
    }

    #[test]
    fn test_next_delay_is_capped() {
        let config = RetryConfig {
            initial_delay: Duration::from_secs(8),
            max_delay: Duration::from_secs(10),
            ..Default::default()
        };
        assert_eq!(config.next_delay(Duration::from_secs(8)), Duration::from_secs(10));
        assert_eq!(config.next_delay(Duration::from_secs(2)), Duration::from_secs(4));
    }

    #[test]
    fn test_next_delay_has_floor() {
        let config = RetryConfig {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            ..Default::default()
        };
        assert_eq!(config.next_delay(Duration::ZERO), MIN_RETRY_DELAY);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_delays_do_not_spin() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let config = RetryConfig {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            ..RetryConfig::with_timeout(Duration::from_secs(1))
        };

        let result: Result<(), RetryError<&str>> = retry_until(&config, "op", |_| true, || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err("not yet")
            }
        })
        .await;

        assert!(matches!(result, Err(RetryError::TimedOut { .. })));
        // Jitter can halve the 10ms floor, so at most ~200 sleeps fit in 1s
        let attempts = count.load(Ordering::SeqCst);
        assert!(attempts <= 202, "{attempts} attempts");
    }
}
