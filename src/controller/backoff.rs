//! Bounded exponential backoff with jitter
//!
//! The only place in the reconcile path that waits. Sleeping and jitter are
//! injected so tests can record delays without waiting. The wait is a plain
//! future, so an enclosing `tokio::time::timeout` cancels it.

use crate::controller::clock::{JitterSource, Sleeper, ThreadRngJitter, TokioSleeper};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(100);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(3);
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_JITTER: f64 = 0.2;

/// Result of a retried operation
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    /// Number of times the action ran (>= 1)
    pub attempts: u32,
    pub result: Result<T, E>,
}

#[derive(Clone)]
pub struct BackoffStrategy {
    base_delay: Duration,
    max_delay: Duration,
    max_attempts: u32,
    jitter: f64,
    sleeper: Arc<dyn Sleeper>,
    jitter_source: Arc<dyn JitterSource>,
}

impl std::fmt::Debug for BackoffStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackoffStrategy")
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("max_attempts", &self.max_attempts)
            .field("jitter", &self.jitter)
            .finish()
    }
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::new(
            DEFAULT_BASE_DELAY,
            DEFAULT_MAX_DELAY,
            DEFAULT_MAX_ATTEMPTS,
            DEFAULT_JITTER,
        )
    }
}

impl BackoffStrategy {
    /// Zero delays, zero attempts and negative jitter are replaced by usable values
    pub fn new(base_delay: Duration, max_delay: Duration, max_attempts: u32, jitter: f64) -> Self {
        let base_delay = if base_delay.is_zero() {
            DEFAULT_BASE_DELAY
        } else {
            base_delay
        };
        let max_delay = if max_delay.is_zero() {
            Duration::from_secs(1)
        } else {
            max_delay
        };

        Self {
            base_delay,
            max_delay: max_delay.max(base_delay),
            max_attempts: max_attempts.max(1),
            jitter: if jitter.is_finite() { jitter.max(0.0) } else { 0.0 },
            sleeper: Arc::new(TokioSleeper),
            jitter_source: Arc::new(ThreadRngJitter),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_jitter_source(mut self, jitter_source: Arc<dyn JitterSource>) -> Self {
        self.jitter_source = jitter_source;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before the attempt following `attempt` (1-based), before jitter:
    /// `min(base * 2^(attempt-1), max)`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        let fraction = self.jitter_source.next_fraction().clamp(0.0, 1.0);
        delay + delay.mul_f64(self.jitter * fraction)
    }

    /// Run `action` until it succeeds, `should_retry` rejects the error, or
    /// the attempt budget is spent
    pub async fn retry<T, E, F, Fut, P>(&self, mut action: F, should_retry: P) -> RetryOutcome<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        let mut attempt = 1;
        loop {
            match action().await {
                Ok(value) => {
                    return RetryOutcome {
                        attempts: attempt,
                        result: Ok(value),
                    }
                }
                Err(err) if attempt >= self.max_attempts || !should_retry(&err) => {
                    return RetryOutcome {
                        attempts: attempt,
                        result: Err(err),
                    }
                }
                Err(_) => {
                    let delay = self.jittered(self.delay_for(attempt));
                    debug!(attempt, delay_ms = delay.as_millis() as u64, "Retrying after failure");
                    self.sleeper.sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
