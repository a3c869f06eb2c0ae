//! Controller settings read from the environment at start-up

use crate::controller::dispatch::DispatchSettings;
use crate::controller::propagation::DEFAULT_BATCH_SIZE;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

pub const HEALTH_PORT_ENV: &str = "CONFIGPROP_HEALTH_PORT";
pub const BATCH_SIZE_ENV: &str = "BATCH_SIZE";
pub const RECONCILE_TIMEOUT_ENV: &str = "CONFIGPROP_RECONCILE_TIMEOUT_SECONDS";
pub const ERROR_REQUEUE_ENV: &str = "CONFIGPROP_ERROR_REQUEUE_SECONDS";

const DEFAULT_HEALTH_PORT: u16 = 8081;
const DEFAULT_RECONCILE_TIMEOUT_SECONDS: u64 = 60;
const DEFAULT_ERROR_REQUEUE_SECONDS: u64 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    pub health_port: u16,
    /// Rolling batch size for specs that leave it unset
    pub default_batch_size: i32,
    pub reconcile_timeout: Duration,
    pub error_requeue: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            health_port: DEFAULT_HEALTH_PORT,
            default_batch_size: DEFAULT_BATCH_SIZE,
            reconcile_timeout: Duration::from_secs(DEFAULT_RECONCILE_TIMEOUT_SECONDS),
            error_requeue: Duration::from_secs(DEFAULT_ERROR_REQUEUE_SECONDS),
        }
    }
}

impl ControllerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup
    ///
    /// Unset variables take the default. Unparsable or out-of-range values
    /// are logged and also take the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let health_port = parse_or(&lookup, HEALTH_PORT_ENV, defaults.health_port, |p| *p > 0);
        let default_batch_size = parse_or(
            &lookup,
            BATCH_SIZE_ENV,
            defaults.default_batch_size,
            |n| *n >= 1,
        );
        let reconcile_timeout = parse_or(
            &lookup,
            RECONCILE_TIMEOUT_ENV,
            DEFAULT_RECONCILE_TIMEOUT_SECONDS,
            |s| *s > 0,
        );
        let error_requeue = parse_or(
            &lookup,
            ERROR_REQUEUE_ENV,
            DEFAULT_ERROR_REQUEUE_SECONDS,
            |s| *s > 0,
        );

        Self {
            health_port,
            default_batch_size,
            reconcile_timeout: Duration::from_secs(reconcile_timeout),
            error_requeue: Duration::from_secs(error_requeue),
        }
    }

    pub fn dispatch_settings(&self) -> DispatchSettings {
        DispatchSettings {
            reconcile_timeout: self.reconcile_timeout,
            error_requeue: self.error_requeue,
        }
    }
}

fn parse_or<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
    valid: impl Fn(&T) -> bool,
) -> T
where
    T: FromStr + std::fmt::Display + Copy,
{
    let Some(raw) = lookup(key) else {
        return default;
    };
    match raw.trim().parse::<T>() {
        Ok(value) if valid(&value) => value,
        _ => {
            warn!(variable = key, value = %raw, default = %default, "Invalid setting, using default");
            default
        }
    }
}
