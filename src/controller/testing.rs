//! In-memory cluster for reconcile tests
//!
//! `FakeClusterClient` keeps namespaces and ConfigMaps in maps, evaluates
//! label selectors locally, records every write, and can be told to fail
//! a given operation in a given namespace.
#![allow(clippy::unwrap_used, clippy::expect_used)]

use crate::controller::backoff::BackoffStrategy;
use crate::controller::client::{ClientError, ClusterClient, PropagationStore, TargetObject};
use crate::controller::clock::{FixedJitter, MockClock, RecordingSleeper};
use crate::controller::errors::ErrorCategory;
use crate::controller::events::MockEventSink;
use crate::controller::planner::PropagationKey;
use crate::controller::propagation::Context;
use crate::crd::propagation::{
    ConfigPropagation, ConfigPropagationSpec, ConfigPropagationStatus, ObjectRef, FINALIZER,
};
use crate::server::metrics::{ControllerMetrics, SharedMetrics};
use async_trait::async_trait;
use chrono::TimeZone;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    GetSource,
    ListNamespaces,
    GetTarget,
    Upsert,
    ListManaged,
    Delete,
    UpdateMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Write {
    Upsert { namespace: String, name: String },
    Delete { namespace: String, name: String },
    UpdateMetadata { namespace: String, name: String },
}

#[derive(Default)]
struct FakeState {
    namespaces: BTreeMap<String, BTreeMap<String, String>>,
    config_maps: BTreeMap<(String, String), TargetObject>,
    /// Remaining injected failures per (operation, namespace); `None` = forever
    failures: HashMap<(Op, String), (ErrorCategory, Option<usize>)>,
    calls: HashMap<(Op, String), usize>,
    writes: Vec<Write>,
    /// Namespaces reported as managed although their ConfigMap is gone
    stale_managed: Vec<String>,
}

#[derive(Default)]
pub struct FakeClusterClient {
    state: Mutex<FakeState>,
}

impl FakeClusterClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_namespace(&self, name: &str, labels: &[(&str, &str)]) {
        let labels = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.state
            .lock()
            .unwrap()
            .namespaces
            .insert(name.to_string(), labels);
    }

    pub fn remove_namespace_label(&self, name: &str, label: &str) {
        if let Some(labels) = self.state.lock().unwrap().namespaces.get_mut(name) {
            labels.remove(label);
        }
    }

    pub fn put_config_map(&self, namespace: &str, name: &str, object: TargetObject) {
        self.state
            .lock()
            .unwrap()
            .config_maps
            .insert((namespace.to_string(), name.to_string()), object);
    }

    pub fn put_source(&self, namespace: &str, name: &str, data: &[(&str, &str)]) {
        let object = TargetObject {
            data: data
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Default::default()
        };
        self.put_config_map(namespace, name, object);
    }

    /// Report `namespace` from `list_managed_targets` even without a ConfigMap,
    /// like a list answered just before a concurrent delete
    pub fn list_as_managed(&self, namespace: &str) {
        self.state
            .lock()
            .unwrap()
            .stale_managed
            .push(namespace.to_string());
    }

    pub fn config_map(&self, namespace: &str, name: &str) -> Option<TargetObject> {
        self.state
            .lock()
            .unwrap()
            .config_maps
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Fail `op` in `namespace` the next `times` calls
    pub fn fail(&self, op: Op, namespace: &str, category: ErrorCategory, times: usize) {
        self.state
            .lock()
            .unwrap()
            .failures
            .insert((op, namespace.to_string()), (category, Some(times)));
    }

    pub fn fail_always(&self, op: Op, namespace: &str, category: ErrorCategory) {
        self.state
            .lock()
            .unwrap()
            .failures
            .insert((op, namespace.to_string()), (category, None));
    }

    pub fn writes(&self) -> Vec<Write> {
        self.state.lock().unwrap().writes.clone()
    }

    pub fn calls(&self, op: Op, namespace: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .get(&(op, namespace.to_string()))
            .copied()
            .unwrap_or(0)
    }

    fn enter(&self, op: Op, namespace: &str) -> Result<(), ClientError> {
        let mut state = self.state.lock().unwrap();
        *state.calls.entry((op, namespace.to_string())).or_default() += 1;

        let key = (op, namespace.to_string());
        let Some((category, remaining)) = state.failures.get_mut(&key) else {
            return Ok(());
        };
        let category = *category;
        match remaining {
            Some(0) => return Ok(()),
            Some(n) => *n -= 1,
            None => {}
        }
        Err(ClientError::tagged(
            category,
            format!("injected {category:?} failure for {op:?} in {namespace}"),
        ))
    }
}

/// Local evaluation of a label selector
pub fn selector_matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> bool {
    let labels_match = selector
        .match_labels
        .iter()
        .flatten()
        .all(|(k, v)| labels.get(k) == Some(v));

    let expressions_match = selector.match_expressions.iter().flatten().all(|expr| {
        let values = expr.values.clone().unwrap_or_default();
        let value = labels.get(&expr.key);
        match expr.operator.as_str() {
            "In" => value.is_some_and(|v| values.contains(v)),
            "NotIn" => !value.is_some_and(|v| values.contains(v)),
            "Exists" => value.is_some(),
            "DoesNotExist" => value.is_none(),
            _ => false,
        }
    });

    labels_match && expressions_match
}

#[async_trait]
impl ClusterClient for FakeClusterClient {
    async fn get_source(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BTreeMap<String, String>, ClientError> {
        self.enter(Op::GetSource, namespace)?;
        self.config_map(namespace, name)
            .map(|cm| cm.data)
            .ok_or_else(|| {
                ClientError::tagged(
                    ErrorCategory::Permanent,
                    format!("configmaps \"{name}\" not found in {namespace}"),
                )
            })
    }

    async fn list_namespaces(&self, selector: &LabelSelector) -> Result<Vec<String>, ClientError> {
        self.enter(Op::ListNamespaces, "")?;
        let state = self.state.lock().unwrap();
        Ok(state
            .namespaces
            .iter()
            .filter(|(_, labels)| selector_matches(selector, labels))
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn get_target(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<TargetObject>, ClientError> {
        self.enter(Op::GetTarget, namespace)?;
        Ok(self.config_map(namespace, name))
    }

    async fn upsert_target(
        &self,
        namespace: &str,
        name: &str,
        target: &TargetObject,
    ) -> Result<(), ClientError> {
        self.enter(Op::Upsert, namespace)?;
        let mut state = self.state.lock().unwrap();
        state.writes.push(Write::Upsert {
            namespace: namespace.to_string(),
            name: name.to_string(),
        });
        let entry = state
            .config_maps
            .entry((namespace.to_string(), name.to_string()))
            .or_default();
        entry.data = target.data.clone();
        entry.labels.extend(target.labels.clone());
        entry.annotations.extend(target.annotations.clone());
        Ok(())
    }

    async fn list_managed_targets(
        &self,
        source_identity: &str,
        name: &str,
    ) -> Result<Vec<String>, ClientError> {
        self.enter(Op::ListManaged, "")?;
        let state = self.state.lock().unwrap();
        let mut managed: Vec<String> = state
            .config_maps
            .iter()
            .filter(|((_, cm_name), cm)| {
                cm_name == name
                    && cm.labels.get(crate::crd::propagation::MANAGED_LABEL).map(String::as_str)
                        == Some("true")
                    && cm
                        .annotations
                        .get(crate::crd::propagation::SOURCE_ANNOTATION)
                        .map(String::as_str)
                        == Some(source_identity)
            })
            .map(|((ns, _), _)| ns.clone())
            .collect();
        managed.extend(state.stale_managed.iter().cloned());
        Ok(managed)
    }

    async fn delete_target(&self, namespace: &str, name: &str) -> Result<(), ClientError> {
        self.enter(Op::Delete, namespace)?;
        let mut state = self.state.lock().unwrap();
        state.writes.push(Write::Delete {
            namespace: namespace.to_string(),
            name: name.to_string(),
        });
        state
            .config_maps
            .remove(&(namespace.to_string(), name.to_string()));
        Ok(())
    }

    async fn update_target_metadata(
        &self,
        namespace: &str,
        name: &str,
        labels: &BTreeMap<String, String>,
        annotations: &BTreeMap<String, String>,
    ) -> Result<(), ClientError> {
        self.enter(Op::UpdateMetadata, namespace)?;
        let mut state = self.state.lock().unwrap();
        state.writes.push(Write::UpdateMetadata {
            namespace: namespace.to_string(),
            name: name.to_string(),
        });
        if let Some(cm) = state
            .config_maps
            .get_mut(&(namespace.to_string(), name.to_string()))
        {
            cm.labels = labels.clone();
            cm.annotations = annotations.clone();
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct FakePropagationStore {
    finalizers: Mutex<Vec<(PropagationKey, Vec<String>)>>,
    statuses: Mutex<Vec<(PropagationKey, Option<String>, ConfigPropagationStatus)>>,
    conflict_next_status: Mutex<bool>,
}

impl FakePropagationStore {
    pub fn conflict_next_status(&self) {
        *self.conflict_next_status.lock().unwrap() = true;
    }

    pub fn finalizer_updates(&self) -> Vec<(PropagationKey, Vec<String>)> {
        self.finalizers.lock().unwrap().clone()
    }

    pub fn statuses(&self) -> Vec<(PropagationKey, Option<String>, ConfigPropagationStatus)> {
        self.statuses.lock().unwrap().clone()
    }

    pub fn last_status(&self) -> Option<ConfigPropagationStatus> {
        self.statuses().last().map(|(_, _, s)| s.clone())
    }
}

#[async_trait]
impl PropagationStore for FakePropagationStore {
    async fn set_finalizers(
        &self,
        key: &PropagationKey,
        finalizers: Vec<String>,
    ) -> Result<(), ClientError> {
        self.finalizers
            .lock()
            .unwrap()
            .push((key.clone(), finalizers));
        Ok(())
    }

    async fn patch_status(
        &self,
        key: &PropagationKey,
        resource_version: Option<&str>,
        status: &ConfigPropagationStatus,
    ) -> Result<(), ClientError> {
        let mut conflict = self.conflict_next_status.lock().unwrap();
        if *conflict {
            *conflict = false;
            return Err(ClientError::Conflict(format!("configpropagation {key}")));
        }
        self.statuses.lock().unwrap().push((
            key.clone(),
            resource_version.map(str::to_string),
            status.clone(),
        ));
        Ok(())
    }
}

/// Context wired to fakes, with handles for assertions
pub struct Harness {
    pub ctx: Arc<Context>,
    pub client: Arc<FakeClusterClient>,
    pub store: Arc<FakePropagationStore>,
    pub events: Arc<MockEventSink>,
    pub sleeper: Arc<RecordingSleeper>,
    pub clock: Arc<MockClock>,
    pub metrics: SharedMetrics,
}

impl Harness {
    pub fn new() -> Self {
        let client = Arc::new(FakeClusterClient::new());
        let store = Arc::new(FakePropagationStore::default());
        let events = Arc::new(MockEventSink::new());
        let sleeper = Arc::new(RecordingSleeper::default());
        let clock = Arc::new(MockClock::new(
            chrono::Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
        ));
        let metrics: SharedMetrics = Arc::new(ControllerMetrics::new().unwrap());

        let backoff = BackoffStrategy::new(Duration::from_millis(100), Duration::from_secs(3), 5, 0.2)
            .with_sleeper(sleeper.clone())
            .with_jitter_source(Arc::new(FixedJitter(0.0)));

        let ctx = Context::new(
            client.clone(),
            store.clone(),
            events.clone(),
            clock.clone(),
            5,
            Some(metrics.clone()),
        )
        .with_backoff(backoff);

        Self {
            ctx: Arc::new(ctx),
            client,
            store,
            events,
            sleeper,
            clock,
            metrics,
        }
    }
}

/// A ConfigPropagation `platform/shared` propagating `platform/settings`
/// to namespaces labelled `team=payments`, with the finalizer present
pub fn propagation(configure: impl FnOnce(&mut ConfigPropagationSpec)) -> ConfigPropagation {
    let mut spec = ConfigPropagationSpec {
        source_ref: ObjectRef {
            namespace: "platform".to_string(),
            name: "settings".to_string(),
        },
        namespace_selector: LabelSelector {
            match_labels: Some(BTreeMap::from([(
                "team".to_string(),
                "payments".to_string(),
            )])),
            match_expressions: None,
        },
        data_keys: Vec::new(),
        strategy: None,
        conflict_policy: None,
        prune: None,
        resync_period_seconds: None,
    };
    configure(&mut spec);

    let mut cp = ConfigPropagation::new("shared", spec);
    cp.metadata.namespace = Some("platform".to_string());
    cp.metadata.finalizers = Some(vec![FINALIZER.to_string()]);
    cp.metadata.resource_version = Some("42".to_string());
    cp.metadata.generation = Some(3);
    cp
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelectorRequirement;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_selector_matching() {
        let selector = LabelSelector {
            match_labels: Some(labels(&[("team", "payments")])),
            match_expressions: Some(vec![
                LabelSelectorRequirement {
                    key: "env".into(),
                    operator: "In".into(),
                    values: Some(vec!["prod".into(), "staging".into()]),
                },
                LabelSelectorRequirement {
                    key: "frozen".into(),
                    operator: "DoesNotExist".into(),
                    values: None,
                },
            ]),
        };

        assert!(selector_matches(
            &selector,
            &labels(&[("team", "payments"), ("env", "prod")])
        ));
        assert!(!selector_matches(
            &selector,
            &labels(&[("team", "payments"), ("env", "dev")])
        ));
        assert!(!selector_matches(
            &selector,
            &labels(&[("team", "payments"), ("env", "prod"), ("frozen", "1")])
        ));
        assert!(selector_matches(&LabelSelector::default(), &labels(&[])));
    }

    #[tokio::test]
    async fn test_injected_failures_run_out() {
        let client = FakeClusterClient::new();
        client.fail(Op::GetTarget, "a", ErrorCategory::Transient, 1);

        assert!(client.get_target("a", "x").await.is_err());
        assert!(client.get_target("a", "x").await.is_ok());
        assert_eq!(client.calls(Op::GetTarget, "a"), 2);
    }
}
