//! Prometheus metrics for the propagation controller
//!
//! `ControllerMetrics` owns its own `Registry`. It is created once in `main`
//! and shared by `Arc` with the reconcile context and the HTTP server.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

pub type SharedMetrics = Arc<ControllerMetrics>;

/// Target actions counted by `configpropagator_propagations_total`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropagationAction {
    Create,
    Update,
    Skip,
    Prune,
    Detach,
}

impl PropagationAction {
    pub fn as_str(self) -> &'static str {
        match self {
            PropagationAction::Create => "create",
            PropagationAction::Update => "update",
            PropagationAction::Skip => "skip",
            PropagationAction::Prune => "prune",
            PropagationAction::Detach => "detach",
        }
    }
}

pub struct ControllerMetrics {
    registry: Registry,
    propagations_total: IntCounterVec,
    targets: IntGauge,
    out_of_sync: IntGauge,
    reconcile_duration: Histogram,
    errors_total: IntCounterVec,
}

impl ControllerMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let propagations_total = IntCounterVec::new(
            Opts::new(
                "configpropagator_propagations_total",
                "Target actions taken, by action",
            ),
            &["action"],
        )?;
        let targets = IntGauge::new(
            "configpropagator_targets_gauge",
            "Selected target namespaces in the last reconciled propagation",
        )?;
        let out_of_sync = IntGauge::new(
            "configpropagator_out_of_sync_gauge",
            "Selected namespaces not holding current content in the last reconciled propagation",
        )?;
        let reconcile_duration = Histogram::with_opts(
            HistogramOpts::new(
                "configpropagator_reconcile_duration_seconds",
                "Duration of reconciliation passes",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        )?;
        let errors_total = IntCounterVec::new(
            Opts::new(
                "configpropagator_errors_total",
                "Reconciliation errors, by stage",
            ),
            &["stage"],
        )?;

        registry.register(Box::new(propagations_total.clone()))?;
        registry.register(Box::new(targets.clone()))?;
        registry.register(Box::new(out_of_sync.clone()))?;
        registry.register(Box::new(reconcile_duration.clone()))?;
        registry.register(Box::new(errors_total.clone()))?;

        Ok(Self {
            registry,
            propagations_total,
            targets,
            out_of_sync,
            reconcile_duration,
            errors_total,
        })
    }

    pub fn record_action(&self, action: PropagationAction, count: u64) {
        if count > 0 {
            self.propagations_total
                .with_label_values(&[action.as_str()])
                .inc_by(count);
        }
    }

    pub fn set_target_counts(&self, targets: i64, out_of_sync: i64) {
        self.targets.set(targets);
        self.out_of_sync.set(out_of_sync);
    }

    pub fn observe_duration(&self, seconds: f64) {
        self.reconcile_duration.observe(seconds);
    }

    pub fn record_error(&self, stage: &str) {
        self.errors_total.with_label_values(&[stage]).inc();
    }

    /// Render every metric in the Prometheus text exposition format
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    #[cfg(test)]
    pub fn action_count(&self, action: PropagationAction) -> u64 {
        self.propagations_total
            .with_label_values(&[action.as_str()])
            .get()
    }

    #[cfg(test)]
    pub fn error_count(&self, stage: &str) -> u64 {
        self.errors_total.with_label_values(&[stage]).get()
    }

    #[cfg(test)]
    pub fn gauges(&self) -> (i64, i64) {
        (self.targets.get(), self.out_of_sync.get())
    }
}

/// Build the shared metrics handle used by `main`
pub fn create_metrics() -> Result<SharedMetrics, prometheus::Error> {
    Ok(Arc::new(ControllerMetrics::new()?))
}
