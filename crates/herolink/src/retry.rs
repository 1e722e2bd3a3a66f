//! Bounded exponential-backoff retry with cooperative cancellation.

use std::{fmt, future::Future, time::Duration};

use rand::Rng;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Default number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default delay before the first retry.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1000);

/// Upper bound on a single call-retry delay.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Exponential backoff parameters shared by call retries and the opt-in
/// exponential reconnect strategy.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Backoff {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    pub jitter: f64,
}

impl Backoff {
    pub fn validate(&self) -> Result<(), String> {
        if self.initial_delay.is_zero() {
            return Err("Initial delay must be > 0".to_string());
        }
        if self.max_delay < self.initial_delay {
            return Err("Max delay must be >= initial delay".to_string());
        }
        if self.factor < 1.0 || !self.factor.is_finite() {
            return Err("Backoff factor must be >= 1.0".to_string());
        }
        if !(0.0..=1.0).contains(&self.jitter) || !self.jitter.is_finite() {
            return Err("Jitter must be between 0.0 and 1.0".to_string());
        }
        Ok(())
    }

    /// Delay before retry `attempt` (1-indexed): `initial * factor^(attempt-1)`,
    /// capped at `max_delay`, then blended with a random value in `[0, delay]`
    /// by the jitter weight.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let initial = self.initial_delay.as_secs_f64();
        let max = self.max_delay.as_secs_f64();
        let base = (initial * self.factor.powi(exponent)).min(max);

        let delay = if self.jitter == 0.0 {
            base
        } else {
            let randomized = rand::rng().random_range(0.0..=base);
            base * (1.0 - self.jitter) + randomized * self.jitter
        };
        Duration::try_from_secs_f64(delay).unwrap_or(self.max_delay)
    }
}

/// Retry parameters for one call invocation.
///
/// The delay before retry *n* is `base_delay * 2^(n-1)`; the default policy
/// waits 1s, 2s and 4s before its three retries.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Retries permitted after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    /// Jitter weight in `[0, 1]`; zero keeps the schedule exact.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
            jitter: 0.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            jitter: 0.0,
        }
    }

    #[must_use]
    pub fn jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        self.backoff().validate()
    }

    /// Delay before retry `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.backoff().delay_for_attempt(attempt)
    }

    fn backoff(&self) -> Backoff {
        Backoff {
            initial_delay: self.base_delay,
            max_delay: MAX_RETRY_DELAY.max(self.base_delay),
            factor: 2.0,
            jitter: self.jitter,
        }
    }
}

/// Terminal outcome of a failed retry loop.
#[derive(Debug)]
pub enum RetryError<E> {
    /// A retryable error persisted through every permitted attempt.
    Exhausted { attempts: u32, last: E },
    /// The predicate declared the error permanent.
    Rejected { attempts: u32, error: E },
    /// The token fired before the loop finished.
    Cancelled,
}

impl<E> RetryError<E> {
    /// Attempts made before giving up; zero when cancelled.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { attempts, .. } | Self::Rejected { attempts, .. } => *attempts,
            Self::Cancelled => 0,
        }
    }
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exhausted { attempts, last } => {
                write!(f, "gave up after {attempts} attempts: {last}")
            }
            Self::Rejected { error, .. } => write!(f, "{error}"),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Runs asynchronous work under a [`RetryPolicy`].
#[derive(Clone, Copy, Debug, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `work` until it succeeds, fails permanently, exhausts the policy,
    /// or `cancel` fires.
    ///
    /// Cancellation drops the in-flight attempt or backoff sleep, so a
    /// result that arrives afterwards is never observed.
    pub async fn run<T, E, F, Fut, P>(
        &self,
        mut work: F,
        is_retryable: P,
        cancel: &CancellationToken,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: fmt::Display,
    {
        let mut attempt: u32 = 0;

        loop {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                outcome = work() => outcome,
            };

            let error = match outcome {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };
            attempt += 1;

            if !is_retryable(&error) {
                tracing::debug!(attempt, error = %error, "Permanent failure, not retrying");
                return Err(RetryError::Rejected {
                    attempts: attempt,
                    error,
                });
            }
            if attempt > self.policy.max_retries {
                tracing::warn!(attempts = attempt, error = %error, "Retries exhausted");
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: error,
                });
            }

            let delay = self.policy.delay_for_attempt(attempt);
            tracing::info!(
                attempt,
                max_retries = self.policy.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying request"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                _ = sleep(delay) => {}
            }
        }
    }
}
