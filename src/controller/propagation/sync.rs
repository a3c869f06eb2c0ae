use super::result::{FailureReason, OutcomeKind, SkipReason, SyncAction, TargetOutcome};
use crate::controller::backoff::BackoffStrategy;
use crate::controller::client::{ClientError, ClusterClient, TargetObject};
use crate::controller::errors::classify;
use crate::controller::limits::check_payload_size;
use crate::crd::propagation::ConflictPolicy;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Content to write into each planned namespace
pub struct SyncRequest<'a> {
    /// Namespaces to process, in order
    pub targets: &'a [String],
    /// Target ConfigMap name (same as the source)
    pub name: &'a str,
    /// `namespace/name` of the source
    pub source_identity: &'a str,
    pub payload: &'a BTreeMap<String, String>,
    pub hash: &'a str,
    pub conflict_policy: &'a ConflictPolicy,
}

fn should_retry(err: &ClientError) -> bool {
    classify(Some(err)).is_retryable()
}

/// Bring every planned target to the requested content
///
/// Each target is handled on its own: a failure is recorded in its outcome
/// and the remaining targets are still processed. One outcome is returned
/// per target, in target order.
pub async fn sync_targets(
    client: &dyn ClusterClient,
    backoff: &BackoffStrategy,
    request: &SyncRequest<'_>,
) -> Vec<TargetOutcome> {
    let size = check_payload_size(request.payload);
    if size.block {
        warn!(
            source = %request.source_identity,
            bytes = size.bytes,
            "Payload exceeds size limit, no targets written"
        );
        let message = size.block_message();
        return request
            .targets
            .iter()
            .map(|namespace| TargetOutcome {
                namespace: namespace.clone(),
                kind: OutcomeKind::Failed {
                    reason: FailureReason::PayloadTooLarge,
                    message: message.clone(),
                },
                attempts: 0,
                warning: None,
            })
            .collect();
    }

    let warning = size.warning();
    if warning.is_some() {
        warn!(
            source = %request.source_identity,
            bytes = size.bytes,
            "Payload is close to the size limit"
        );
    }

    let mut outcomes = Vec::with_capacity(request.targets.len());
    for namespace in request.targets {
        let (kind, attempts) = sync_target(client, backoff, request, namespace).await;
        outcomes.push(TargetOutcome {
            namespace: namespace.clone(),
            kind,
            attempts,
            warning: warning.clone(),
        });
    }
    outcomes
}

async fn sync_target(
    client: &dyn ClusterClient,
    backoff: &BackoffStrategy,
    request: &SyncRequest<'_>,
    namespace: &str,
) -> (OutcomeKind, u32) {
    let lookup = backoff
        .retry(|| client.get_target(namespace, request.name), should_retry)
        .await;
    let existing = match lookup.result {
        Ok(existing) => existing,
        Err(e) => return (failure(namespace, "lookup", &e), lookup.attempts),
    };

    let action = match &existing {
        Some(target) if !target.is_managed_by(request.source_identity) => {
            let reason = match request.conflict_policy {
                ConflictPolicy::Skip => SkipReason::Conflict,
                ConflictPolicy::Overwrite => SkipReason::NotManaged,
            };
            info!(
                namespace = %namespace,
                reason = reason.as_str(),
                "Existing ConfigMap is not managed, leaving it unchanged"
            );
            return (OutcomeKind::Skipped(reason), lookup.attempts);
        }
        Some(target) if target.stored_hash() == Some(request.hash) => {
            debug!(namespace = %namespace, "Target already in sync");
            return (OutcomeKind::Synced(SyncAction::AlreadyInSync), lookup.attempts);
        }
        Some(_) if *request.conflict_policy == ConflictPolicy::Skip => {
            info!(
                namespace = %namespace,
                "Managed target has drifted, conflictPolicy=skip leaves it unchanged"
            );
            return (OutcomeKind::Skipped(SkipReason::Conflict), lookup.attempts);
        }
        Some(_) => SyncAction::Updated,
        None => SyncAction::Created,
    };

    let desired = TargetObject::managed(request.source_identity, request.payload.clone(), request.hash);
    let write = backoff
        .retry(
            || client.upsert_target(namespace, request.name, &desired),
            should_retry,
        )
        .await;

    match write.result {
        Ok(()) => {
            info!(namespace = %namespace, action = ?action, "Target written");
            (OutcomeKind::Synced(action), write.attempts)
        }
        Err(e) => (failure(namespace, "write", &e), write.attempts),
    }
}

fn failure(namespace: &str, operation: &str, err: &ClientError) -> OutcomeKind {
    let category = classify(Some(err));
    warn!(
        namespace = %namespace,
        operation = operation,
        category = category.as_str(),
        error = %err,
        "Target sync failed"
    );
    OutcomeKind::Failed {
        reason: FailureReason::from(category),
        message: format!("{operation} failed: {err}"),
    }
}
