//! HTTP endpoints, metrics and process lifecycle
//!
//! - `/healthz`, `/readyz` probes and `/metrics` scraping on one port
//! - `ControllerMetrics`, the Prometheus registry shared with reconcile
//! - SIGTERM/SIGINT driven graceful shutdown

mod health;
pub mod metrics;
pub mod shutdown;

pub use health::{run_health_server, ReadinessState};
pub use metrics::{create_metrics, ControllerMetrics, SharedMetrics};
pub use shutdown::{shutdown_channel, wait_for_signal, ShutdownController, ShutdownSignal};

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[path = "health_test.rs"]
mod health_tests;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[path = "shutdown_test.rs"]
mod shutdown_tests;
