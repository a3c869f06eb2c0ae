//! `ClusterClient` and `PropagationStore` backed by the Kubernetes API

use crate::controller::client::{
    render_selector, ClientError, ClusterClient, PropagationStore, TargetObject,
};
use crate::controller::planner::PropagationKey;
use crate::crd::propagation::{
    ConfigPropagation, ConfigPropagationStatus, MANAGED_LABEL, SOURCE_ANNOTATION,
};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::Client;
use std::collections::BTreeMap;
use tracing::debug;

#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn config_maps(&self, namespace: &str) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

/// Map a kube error, turning 409 into `ClientError::Conflict`
fn write_error(err: kube::Error, what: String) -> ClientError {
    match err {
        kube::Error::Api(status) if status.code == 409 => ClientError::Conflict(what),
        other => ClientError::Kube(other),
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get_source(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BTreeMap<String, String>, ClientError> {
        let cm = self.config_maps(namespace).get(name).await?;
        Ok(cm.data.unwrap_or_default())
    }

    async fn list_namespaces(&self, selector: &LabelSelector) -> Result<Vec<String>, ClientError> {
        let selector = render_selector(selector)?;
        let api: Api<Namespace> = Api::all(self.client.clone());

        let mut params = ListParams::default();
        if !selector.is_empty() {
            params = params.labels(&selector);
        }

        let mut names: Vec<String> = api
            .list(&params)
            .await?
            .items
            .into_iter()
            .filter_map(|ns| ns.metadata.name)
            .collect();
        names.sort();
        Ok(names)
    }

    async fn get_target(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<TargetObject>, ClientError> {
        let existing = self.config_maps(namespace).get_opt(name).await?;
        Ok(existing.map(|cm| TargetObject {
            data: cm.data.unwrap_or_default(),
            labels: cm.metadata.labels.unwrap_or_default(),
            annotations: cm.metadata.annotations.unwrap_or_default(),
        }))
    }

    async fn upsert_target(
        &self,
        namespace: &str,
        name: &str,
        target: &TargetObject,
    ) -> Result<(), ClientError> {
        let api = self.config_maps(namespace);
        let what = format!("configmap {namespace}/{name}");

        match api.get_opt(name).await? {
            Some(mut existing) => {
                let labels = existing.metadata.labels.get_or_insert_with(BTreeMap::new);
                labels.extend(target.labels.clone());
                let annotations = existing
                    .metadata
                    .annotations
                    .get_or_insert_with(BTreeMap::new);
                annotations.extend(target.annotations.clone());
                existing.data = Some(target.data.clone());

                // resourceVersion from the read makes this an optimistic replace
                api.replace(name, &PostParams::default(), &existing)
                    .await
                    .map_err(|e| write_error(e, what))?;
                debug!(namespace = %namespace, name = %name, "Replaced target ConfigMap");
            }
            None => {
                let cm = ConfigMap {
                    metadata: ObjectMeta {
                        name: Some(name.to_string()),
                        namespace: Some(namespace.to_string()),
                        labels: Some(target.labels.clone()),
                        annotations: Some(target.annotations.clone()),
                        ..Default::default()
                    },
                    data: Some(target.data.clone()),
                    ..Default::default()
                };
                api.create(&PostParams::default(), &cm)
                    .await
                    .map_err(|e| write_error(e, what))?;
                debug!(namespace = %namespace, name = %name, "Created target ConfigMap");
            }
        }
        Ok(())
    }

    async fn list_managed_targets(
        &self,
        source_identity: &str,
        name: &str,
    ) -> Result<Vec<String>, ClientError> {
        let api: Api<ConfigMap> = Api::all(self.client.clone());
        let params = ListParams::default().labels(&format!("{MANAGED_LABEL}=true"));

        let mut namespaces: Vec<String> = api
            .list(&params)
            .await?
            .items
            .into_iter()
            .filter(|cm| cm.metadata.name.as_deref() == Some(name))
            .filter(|cm| {
                cm.metadata
                    .annotations
                    .as_ref()
                    .and_then(|a| a.get(SOURCE_ANNOTATION))
                    .map(String::as_str)
                    == Some(source_identity)
            })
            .filter_map(|cm| cm.metadata.namespace)
            .collect();
        namespaces.sort();
        Ok(namespaces)
    }

    async fn delete_target(&self, namespace: &str, name: &str) -> Result<(), ClientError> {
        match self
            .config_maps(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(err)) if err.code == 404 => Ok(()),
            Err(e) => Err(ClientError::Kube(e)),
        }
    }

    async fn update_target_metadata(
        &self,
        namespace: &str,
        name: &str,
        labels: &BTreeMap<String, String>,
        annotations: &BTreeMap<String, String>,
    ) -> Result<(), ClientError> {
        let api = self.config_maps(namespace);
        let Some(mut existing) = api.get_opt(name).await? else {
            return Ok(());
        };

        existing.metadata.labels = Some(labels.clone());
        existing.metadata.annotations = Some(annotations.clone());

        match api.replace(name, &PostParams::default(), &existing).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(err)) if err.code == 404 => Ok(()),
            Err(e) => Err(write_error(e, format!("configmap {namespace}/{name}"))),
        }
    }
}

#[derive(Clone)]
pub struct KubePropagationStore {
    client: Client,
}

impl KubePropagationStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, key: &PropagationKey) -> Api<ConfigPropagation> {
        Api::namespaced(self.client.clone(), &key.namespace)
    }
}

/// Merge patch body replacing the status, guarded by `resource_version`
pub fn status_patch(
    resource_version: Option<&str>,
    status: &ConfigPropagationStatus,
) -> serde_json::Value {
    let mut patch = serde_json::json!({ "status": status });
    if let Some(rv) = resource_version {
        patch["metadata"] = serde_json::json!({ "resourceVersion": rv });
    }
    patch
}

#[async_trait]
impl PropagationStore for KubePropagationStore {
    async fn set_finalizers(
        &self,
        key: &PropagationKey,
        finalizers: Vec<String>,
    ) -> Result<(), ClientError> {
        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers
            }
        });
        self.api(key)
            .patch(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| write_error(e, format!("configpropagation {key}")))?;
        Ok(())
    }

    async fn patch_status(
        &self,
        key: &PropagationKey,
        resource_version: Option<&str>,
        status: &ConfigPropagationStatus,
    ) -> Result<(), ClientError> {
        let patch = status_patch(resource_version, status);
        self.api(key)
            .patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| write_error(e, format!("configpropagation {key} status")))?;
        Ok(())
    }
}
