use super::reconcile::ReconcileError;
use crate::controller::backoff::BackoffStrategy;
use crate::controller::client::{ClientError, ClusterClient};
use crate::controller::errors::classify;
use std::collections::BTreeSet;
use tracing::info;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupResult {
    pub pruned: Vec<String>,
    pub detached: Vec<String>,
}

fn should_retry(err: &ClientError) -> bool {
    classify(Some(err)).is_retryable()
}

/// Release managed targets in namespaces that are no longer selected
///
/// `prune` deletes them; otherwise only the ownership markers are removed
/// and every other label, annotation and data key stays in place. The first
/// failure aborts the pass.
pub async fn cleanup_deselected(
    client: &dyn ClusterClient,
    backoff: &BackoffStrategy,
    name: &str,
    source_identity: &str,
    selected: &[String],
    prune: bool,
) -> Result<CleanupResult, ReconcileError> {
    let managed = backoff
        .retry(
            || client.list_managed_targets(source_identity, name),
            should_retry,
        )
        .await
        .result
        .map_err(ReconcileError::ListManaged)?;

    let selected: BTreeSet<&str> = selected.iter().map(String::as_str).collect();
    let mut result = CleanupResult::default();

    for namespace in managed
        .iter()
        .filter(|ns| !selected.contains(ns.as_str()))
    {
        let target = format!("{namespace}/{name}");
        if prune {
            backoff
                .retry(|| client.delete_target(namespace, name), should_retry)
                .await
                .result
                .map_err(|error| ReconcileError::Prune {
                    target: target.clone(),
                    error,
                })?;
            info!(namespace = %namespace, name = %name, "Pruned deselected target");
            result.pruned.push(namespace.clone());
        } else {
            let existing = backoff
                .retry(|| client.get_target(namespace, name), should_retry)
                .await
                .result
                .map_err(|error| ReconcileError::Detach {
                    target: target.clone(),
                    error,
                })?;
            let Some(existing) = existing else {
                continue;
            };

            let (labels, annotations) = existing.without_markers();
            backoff
                .retry(
                    || client.update_target_metadata(namespace, name, &labels, &annotations),
                    should_retry,
                )
                .await
                .result
                .map_err(|error| ReconcileError::Detach {
                    target: target.clone(),
                    error,
                })?;
            info!(namespace = %namespace, name = %name, "Detached deselected target");
            result.detached.push(namespace.clone());
        }
    }

    Ok(result)
}

/// Release every managed target regardless of the current selector
pub async fn finalize(
    client: &dyn ClusterClient,
    backoff: &BackoffStrategy,
    name: &str,
    source_identity: &str,
    prune: bool,
) -> Result<CleanupResult, ReconcileError> {
    cleanup_deselected(client, backoff, name, source_identity, &[], prune).await
}
