//! Time sources for the reconcile path
//!
//! `Clock` supplies the wall-clock time used for condition timestamps,
//! `Sleeper` performs the waits between retry attempts and `JitterSource`
//! supplies the random fraction added to each wait. Production code uses
//! `SystemClock`, `TokioSleeper` and `ThreadRngJitter`; tests swap in
//! `MockClock`, `RecordingSleeper` and `FixedJitter`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Trait for getting the current time
///
/// Injected via `Context` to allow tests to control time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock that delegates to `chrono::Utc::now()`
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Suspends the current task between retry attempts
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Returns a value in `[0.0, 1.0)` scaling the jitter added to a delay
pub trait JitterSource: Send + Sync {
    fn next_fraction(&self) -> f64;
}

pub struct ThreadRngJitter;

impl JitterSource for ThreadRngJitter {
    fn next_fraction(&self) -> f64 {
        rand::random::<f64>()
    }
}

/// Mock clock for testing with controllable time
#[cfg(test)]
#[allow(clippy::expect_used)]
pub struct MockClock {
    now: std::sync::Mutex<DateTime<Utc>>,
}

#[cfg(test)]
#[allow(clippy::expect_used)]
impl MockClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: std::sync::Mutex::new(now),
        }
    }

    #[allow(dead_code)]
    pub fn advance(&self, duration: chrono::Duration) {
        let mut now = self.now.lock().expect("MockClock lock poisoned");
        *now += duration;
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("MockClock lock poisoned")
    }
}

/// Sleeper that returns immediately and records every requested delay
#[cfg(test)]
#[derive(Default)]
pub struct RecordingSleeper {
    delays: std::sync::Mutex<Vec<Duration>>,
}

#[cfg(test)]
#[allow(clippy::expect_used)]
impl RecordingSleeper {
    pub fn delays(&self) -> Vec<Duration> {
        self.delays.lock().expect("RecordingSleeper lock poisoned").clone()
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.delays
            .lock()
            .expect("RecordingSleeper lock poisoned")
            .push(duration);
    }
}

/// Jitter source that always yields the same fraction
#[cfg(test)]
pub struct FixedJitter(pub f64);

#[cfg(test)]
impl JitterSource for FixedJitter {
    fn next_fraction(&self) -> f64 {
        self.0
    }
}
