use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// API group shared by the CRD and every marker the controller writes
pub const API_GROUP: &str = "configpropagator.platform.example.com";

/// Label marking a target ConfigMap as owned by this controller (value "true")
pub const MANAGED_LABEL: &str = "configpropagator.platform.example.com/managed";

/// Annotation holding the `namespace/name` of the source ConfigMap
pub const SOURCE_ANNOTATION: &str = "configpropagator.platform.example.com/source";

/// Annotation holding the content hash written with the target data
pub const HASH_ANNOTATION: &str = "configpropagator.platform.example.com/hash";

/// Finalizer that guarantees managed targets are released on deletion
pub const FINALIZER: &str = "configpropagator.platform.example.com/finalizer";

/// ConfigPropagation keeps one source ConfigMap synchronized into every
/// namespace matched by a label selector.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    group = "configpropagator.platform.example.com",
    version = "v1alpha1",
    kind = "ConfigPropagation",
    namespaced,
    status = "ConfigPropagationStatus",
    shortname = "cprop",
    printcolumn = r#"{"name":"Source", "type":"string", "jsonPath":".spec.sourceRef.name"}"#,
    printcolumn = r#"{"name":"Targets", "type":"integer", "jsonPath":".status.targetCount"}"#,
    printcolumn = r#"{"name":"Synced", "type":"integer", "jsonPath":".status.syncedCount"}"#,
    printcolumn = r#"{"name":"OutOfSync", "type":"integer", "jsonPath":".status.outOfSyncCount"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct ConfigPropagationSpec {
    /// The ConfigMap whose data is propagated
    #[serde(rename = "sourceRef")]
    pub source_ref: ObjectRef,

    /// Selects the namespaces that receive a copy
    #[serde(rename = "namespaceSelector")]
    pub namespace_selector: LabelSelector,

    /// Restricts propagation to these keys (empty = all keys)
    #[serde(rename = "dataKeys", default, skip_serializing_if = "Vec::is_empty")]
    pub data_keys: Vec<String>,

    /// Rollout strategy (defaults to rolling with the controller batch size)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<UpdateStrategy>,

    /// What to do with targets that are not managed by this propagation
    #[serde(rename = "conflictPolicy", skip_serializing_if = "Option::is_none")]
    pub conflict_policy: Option<ConflictPolicy>,

    /// Delete (true) or detach (false) targets whose namespace falls out of selection.
    /// Defaults to true.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prune: Option<bool>,

    /// Periodic resync interval in seconds (minimum 10)
    #[serde(
        rename = "resyncPeriodSeconds",
        skip_serializing_if = "Option::is_none"
    )]
    pub resync_period_seconds: Option<i32>,
}

impl ConfigPropagationSpec {
    /// Strategy type after defaulting; rolling when unset
    pub fn strategy_type(&self) -> StrategyType {
        self.strategy
            .as_ref()
            .and_then(|s| s.strategy_type.clone())
            .unwrap_or_default()
    }

    /// Batch size for the rolling strategy, `None` when unset
    pub fn batch_size(&self) -> Option<i32> {
        self.strategy.as_ref().and_then(|s| s.batch_size)
    }

    pub fn conflict_policy(&self) -> ConflictPolicy {
        self.conflict_policy.clone().unwrap_or_default()
    }

    pub fn prune(&self) -> bool {
        self.prune.unwrap_or(true)
    }

    /// `namespace/name` of the source, as written into the source annotation
    pub fn source_identity(&self) -> String {
        format!("{}/{}", self.source_ref.namespace, self.source_ref.name)
    }
}

/// Reference to a namespaced object
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct ObjectRef {
    pub namespace: String,
    pub name: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct UpdateStrategy {
    /// immediate or rolling
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub strategy_type: Option<StrategyType>,

    /// Namespaces touched per pass for the rolling strategy (>= 1)
    #[serde(rename = "batchSize", skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<i32>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, Hash, JsonSchema)]
pub enum StrategyType {
    /// Every selected namespace is processed on every pass
    #[serde(rename = "immediate")]
    Immediate,
    /// Namespaces are processed in batches; progress is kept per content hash
    #[default]
    #[serde(rename = "rolling")]
    Rolling,
}

impl StrategyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyType::Immediate => "immediate",
            StrategyType::Rolling => "rolling",
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum ConflictPolicy {
    /// Replace drifted managed targets
    #[default]
    #[serde(rename = "overwrite")]
    Overwrite,
    /// Leave existing targets untouched and report them out of sync
    #[serde(rename = "skip")]
    Skip,
}

/// Observed state of a ConfigPropagation
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ConfigPropagationStatus {
    /// Ready, Progressing and Degraded conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Number of selected target namespaces
    #[serde(rename = "targetCount", default)]
    pub target_count: i32,

    /// Number of target namespaces holding the current content
    #[serde(rename = "syncedCount", default)]
    pub synced_count: i32,

    /// Number of selected namespaces not yet holding the current content
    #[serde(rename = "outOfSyncCount", default)]
    pub out_of_sync_count: i32,

    /// Per-namespace details for conflicts and failures, ordered by namespace
    ///
    /// Always serialized: an empty list has to reach the API server so a
    /// merge patch clears entries left by an earlier pass.
    #[serde(rename = "outOfSync", default)]
    pub out_of_sync: Vec<OutOfSyncItem>,

    /// Time of the last reconciliation pass (RFC3339)
    #[serde(rename = "lastSyncTime", skip_serializing_if = "Option::is_none")]
    pub last_sync_time: Option<String>,

    /// Generation of the spec the status was computed from
    #[serde(rename = "observedGeneration", skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl ConfigPropagationStatus {
    pub fn condition(&self, condition_type: ConditionType) -> Option<&Condition> {
        self.conditions
            .iter()
            .find(|c| c.condition_type == condition_type)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: ConditionType,

    pub status: ConditionStatus,

    pub reason: String,

    #[serde(default)]
    pub message: String,

    /// Last time (status, reason, message) changed (RFC3339)
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: String,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, JsonSchema)]
pub enum ConditionType {
    Ready,
    Progressing,
    Degraded,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> Self {
        if value {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        }
    }
}

/// A selected namespace that does not hold the current content
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub struct OutOfSyncItem {
    pub namespace: String,
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

#[cfg(test)]
#[path = "propagation_test.rs"]
mod tests;
