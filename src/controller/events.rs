//! Kubernetes Events for propagation activity
//!
//! Publishing is best effort: a failed publish is logged and never fails
//! the reconcile that produced it.

use crate::crd::propagation::ConfigPropagation;
use async_trait::async_trait;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropagationEvent {
    TargetCreated {
        namespace: String,
        /// Size-guard note for payloads close to the limit
        warning: Option<String>,
    },
    TargetUpdated {
        namespace: String,
        warning: Option<String>,
    },
    TargetSkipped { namespace: String, reason: String },
    TargetPruned { namespace: String },
    TargetDetached { namespace: String },
    ReconcileError { message: String },
}

impl PropagationEvent {
    pub fn reason(&self) -> &'static str {
        match self {
            PropagationEvent::TargetCreated { .. } => "TargetCreated",
            PropagationEvent::TargetUpdated { .. } => "TargetUpdated",
            PropagationEvent::TargetSkipped { .. } => "TargetSkipped",
            PropagationEvent::TargetPruned { .. } => "TargetPruned",
            PropagationEvent::TargetDetached { .. } => "TargetDetached",
            PropagationEvent::ReconcileError { .. } => "ReconcileError",
        }
    }

    pub fn is_warning(&self) -> bool {
        matches!(
            self,
            PropagationEvent::TargetSkipped { .. } | PropagationEvent::ReconcileError { .. }
        )
    }

    /// Short verb recorded as the event action
    pub fn action(&self) -> &'static str {
        match self {
            PropagationEvent::TargetCreated { .. } => "Create",
            PropagationEvent::TargetUpdated { .. } => "Update",
            PropagationEvent::TargetSkipped { .. } => "Skip",
            PropagationEvent::TargetPruned { .. } => "Prune",
            PropagationEvent::TargetDetached { .. } => "Detach",
            PropagationEvent::ReconcileError { .. } => "Reconcile",
        }
    }

    pub fn note(&self) -> String {
        match self {
            PropagationEvent::TargetCreated { namespace, warning } => {
                with_warning(format!("created target in namespace {namespace}"), warning)
            }
            PropagationEvent::TargetUpdated { namespace, warning } => {
                with_warning(format!("updated target in namespace {namespace}"), warning)
            }
            PropagationEvent::TargetSkipped { namespace, reason } => {
                format!("skipped target in namespace {namespace}: {reason}")
            }
            PropagationEvent::TargetPruned { namespace } => {
                format!("deleted target in deselected namespace {namespace}")
            }
            PropagationEvent::TargetDetached { namespace } => {
                format!("released target in deselected namespace {namespace}")
            }
            PropagationEvent::ReconcileError { message } => message.clone(),
        }
    }
}

fn with_warning(note: String, warning: &Option<String>) -> String {
    match warning {
        Some(warning) => format!("{note} ({warning})"),
        None => note,
    }
}

/// Destination for propagation events
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, propagation: &ConfigPropagation, event: PropagationEvent);
}

/// Publishes through the cluster's Events API
pub struct KubeEventSink {
    recorder: Recorder,
}

impl KubeEventSink {
    pub fn new(client: Client, controller: &str) -> Self {
        let reporter = Reporter {
            controller: controller.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventSink for KubeEventSink {
    async fn publish(&self, propagation: &ConfigPropagation, event: PropagationEvent) {
        let kube_event = Event {
            type_: if event.is_warning() {
                EventType::Warning
            } else {
                EventType::Normal
            },
            reason: event.reason().to_string(),
            note: Some(event.note()),
            action: event.action().to_string(),
            secondary: None,
        };

        let reference = propagation.object_ref(&());
        if let Err(e) = self.recorder.publish(&kube_event, &reference).await {
            warn!(
                error = ?e,
                reason = event.reason(),
                "Failed to publish event (non-fatal)"
            );
        }
    }
}

/// Mock event sink for testing - stores events in memory
#[cfg(test)]
#[derive(Default)]
pub struct MockEventSink {
    events: std::sync::Mutex<Vec<PropagationEvent>>,
}

#[cfg(test)]
impl MockEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    #[allow(clippy::unwrap_used)]
    pub fn events(&self) -> Vec<PropagationEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn reasons(&self) -> Vec<&'static str> {
        self.events().iter().map(PropagationEvent::reason).collect()
    }
}

#[cfg(test)]
#[async_trait]
impl EventSink for MockEventSink {
    async fn publish(&self, _propagation: &ConfigPropagation, event: PropagationEvent) {
        #[allow(clippy::unwrap_used)]
        self.events.lock().unwrap().push(event);
    }
}
