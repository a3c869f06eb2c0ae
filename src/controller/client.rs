//! Cluster access used by the reconcile path
//!
//! `ClusterClient` covers the ConfigMaps and Namespaces the controller reads
//! and writes; `PropagationStore` covers the ConfigPropagation object itself.
//! Both are traits so the reconcile logic runs against in-memory fakes in
//! tests and against `kube::Api` in production.

use crate::controller::errors::ErrorCategory;
use crate::controller::planner::PropagationKey;
use crate::crd::propagation::{
    ConfigPropagationStatus, HASH_ANNOTATION, MANAGED_LABEL, SOURCE_ANNOTATION,
};
use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use std::collections::BTreeMap;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Error whose category is known where it is raised
    #[error("{message}")]
    Tagged {
        category: ErrorCategory,
        message: String,
    },

    /// Optimistic write rejected because the object changed (HTTP 409)
    #[error("write conflict on {0}")]
    Conflict(String),

    #[error("invalid label selector: {0}")]
    InvalidSelector(String),
}

impl ClientError {
    pub fn tagged(category: ErrorCategory, message: impl Into<String>) -> Self {
        ClientError::Tagged {
            category,
            message: message.into(),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ClientError::Conflict(_))
    }
}

/// Data and metadata of a target ConfigMap
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetObject {
    pub data: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

impl TargetObject {
    /// Target as written for `source_identity`: the payload plus the three markers
    pub fn managed(source_identity: &str, data: BTreeMap<String, String>, hash: &str) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());

        let mut annotations = BTreeMap::new();
        annotations.insert(SOURCE_ANNOTATION.to_string(), source_identity.to_string());
        annotations.insert(HASH_ANNOTATION.to_string(), hash.to_string());

        Self {
            data,
            labels,
            annotations,
        }
    }

    /// Managed means naming `source_identity` in the source annotation, or
    /// carrying the managed label with no source annotation naming another
    pub fn is_managed_by(&self, source_identity: &str) -> bool {
        match self.annotations.get(SOURCE_ANNOTATION) {
            Some(source) => source == source_identity,
            None => self.labels.get(MANAGED_LABEL).map(String::as_str) == Some("true"),
        }
    }

    pub fn stored_hash(&self) -> Option<&str> {
        self.annotations.get(HASH_ANNOTATION).map(String::as_str)
    }

    /// Labels and annotations with the ownership markers removed
    pub fn without_markers(&self) -> (BTreeMap<String, String>, BTreeMap<String, String>) {
        let mut labels = self.labels.clone();
        labels.remove(MANAGED_LABEL);

        let mut annotations = self.annotations.clone();
        annotations.remove(SOURCE_ANNOTATION);
        annotations.remove(HASH_ANNOTATION);

        (labels, annotations)
    }
}

#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Data of the source ConfigMap
    async fn get_source(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BTreeMap<String, String>, ClientError>;

    /// Names of namespaces matching `selector`, sorted
    async fn list_namespaces(&self, selector: &LabelSelector) -> Result<Vec<String>, ClientError>;

    async fn get_target(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<TargetObject>, ClientError>;

    /// Create or replace the target
    ///
    /// `target.data` replaces the existing data. `target.labels` and
    /// `target.annotations` are merged over the existing metadata.
    async fn upsert_target(
        &self,
        namespace: &str,
        name: &str,
        target: &TargetObject,
    ) -> Result<(), ClientError>;

    /// Namespaces holding a managed `name` ConfigMap for `source_identity`, sorted
    async fn list_managed_targets(
        &self,
        source_identity: &str,
        name: &str,
    ) -> Result<Vec<String>, ClientError>;

    /// Delete the target; a missing target is not an error
    async fn delete_target(&self, namespace: &str, name: &str) -> Result<(), ClientError>;

    /// Replace the target's labels and annotations, leaving data alone;
    /// a missing target is not an error
    async fn update_target_metadata(
        &self,
        namespace: &str,
        name: &str,
        labels: &BTreeMap<String, String>,
        annotations: &BTreeMap<String, String>,
    ) -> Result<(), ClientError>;
}

/// Writes to the ConfigPropagation object itself
#[async_trait]
pub trait PropagationStore: Send + Sync {
    async fn set_finalizers(
        &self,
        key: &PropagationKey,
        finalizers: Vec<String>,
    ) -> Result<(), ClientError>;

    /// Patch status, failing with `ClientError::Conflict` when
    /// `resource_version` is set and no longer current
    async fn patch_status(
        &self,
        key: &PropagationKey,
        resource_version: Option<&str>,
        status: &ConfigPropagationStatus,
    ) -> Result<(), ClientError>;
}

/// Render a label selector in the API server's query syntax
///
/// An empty selector renders as `""`, which matches every namespace.
pub fn render_selector(selector: &LabelSelector) -> Result<String, ClientError> {
    let mut parts = Vec::new();

    if let Some(labels) = &selector.match_labels {
        for (key, value) in labels {
            parts.push(format!("{key}={value}"));
        }
    }

    for expr in selector.match_expressions.iter().flatten() {
        let values = expr.values.clone().unwrap_or_default();
        let part = match expr.operator.as_str() {
            "In" | "NotIn" if values.is_empty() => {
                return Err(ClientError::InvalidSelector(format!(
                    "operator {} on key {} requires values",
                    expr.operator, expr.key
                )))
            }
            "In" => format!("{} in ({})", expr.key, values.join(",")),
            "NotIn" => format!("{} notin ({})", expr.key, values.join(",")),
            "Exists" => expr.key.clone(),
            "DoesNotExist" => format!("!{}", expr.key),
            other => {
                return Err(ClientError::InvalidSelector(format!(
                    "unknown operator {other} on key {}",
                    expr.key
                )))
            }
        };
        parts.push(part);
    }

    Ok(parts.join(","))
}
