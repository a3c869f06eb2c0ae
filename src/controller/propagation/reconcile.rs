use crate::controller::backoff::BackoffStrategy;
use crate::controller::client::{ClientError, ClusterClient, PropagationStore};
use crate::controller::clock::Clock;
use crate::controller::errors::{classify, ErrorCategory};
use crate::controller::events::{EventSink, PropagationEvent};
use crate::controller::hash::content_hash;
use crate::controller::planner::{PropagationKey, RolloutPlanner};
use crate::crd::propagation::{ConfigPropagation, OutOfSyncItem, StrategyType, FINALIZER};
use crate::server::metrics::{PropagationAction, SharedMetrics};
use kube::{Resource, ResourceExt};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::cleanup::{cleanup_deselected, finalize, CleanupResult};
use super::result::{
    OutcomeKind, RolloutResult, SyncAction, REASON_PENDING_ROLLOUT, REASON_PENDING_SYNC,
};
use super::status::compute_status;
use super::sync::{sync_targets, SyncRequest};
use super::validation::{default_spec, effective_payload, validate_spec};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("ConfigPropagation missing namespace")]
    MissingNamespace,

    #[error("Invalid ConfigPropagation spec: {0}")]
    ValidationError(String),

    #[error("get source {source_ref}: {error}")]
    SourceFetch {
        source_ref: String,
        #[source]
        error: ClientError,
    },

    #[error("list namespaces: {0}")]
    NamespaceList(#[source] ClientError),

    #[error("list managed targets: {0}")]
    ListManaged(#[source] ClientError),

    #[error("delete {target}: {error}")]
    Prune {
        target: String,
        #[source]
        error: ClientError,
    },

    #[error("detach {target}: {error}")]
    Detach {
        target: String,
        #[source]
        error: ClientError,
    },

    #[error("update finalizers: {0}")]
    Finalizer(#[source] ClientError),

    #[error("update status: {0}")]
    StatusUpdate(#[source] ClientError),

    #[error("reconcile deadline exceeded")]
    DeadlineExceeded(#[from] tokio::time::error::Elapsed),
}

impl ReconcileError {
    /// Stage label for `configpropagator_errors_total`
    pub fn stage(&self) -> &'static str {
        match self {
            ReconcileError::MissingNamespace | ReconcileError::ValidationError(_) => "validation",
            ReconcileError::SourceFetch { .. } => "source_fetch",
            ReconcileError::NamespaceList(_) => "namespace_list",
            ReconcileError::ListManaged(_) => "list_managed",
            ReconcileError::Prune { .. } => "prune",
            ReconcileError::Detach { .. } => "detach",
            ReconcileError::Finalizer(_) => "finalizer",
            ReconcileError::StatusUpdate(_) => "status",
            ReconcileError::DeadlineExceeded(_) => "deadline",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            ReconcileError::MissingNamespace | ReconcileError::ValidationError(_) => {
                ErrorCategory::Permanent
            }
            other => classify(Some(other)),
        }
    }
}

/// Revisit delay for a rolling propagation with batches left and no resync period
pub const NEXT_BATCH_DELAY: Duration = Duration::from_secs(10);

/// What the dispatcher should do with the key after a reconcile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileAction {
    pub requeue_after: Option<Duration>,
}

impl ReconcileAction {
    /// Wait for the next watch event
    pub fn await_change() -> Self {
        Self { requeue_after: None }
    }

    pub fn requeue(after: Duration) -> Self {
        Self {
            requeue_after: Some(after),
        }
    }
}

pub struct Context {
    pub client: Arc<dyn ClusterClient>,
    pub store: Arc<dyn PropagationStore>,
    pub events: Arc<dyn EventSink>,
    pub clock: Arc<dyn Clock>,
    pub planner: RolloutPlanner,
    pub backoff: BackoffStrategy,
    /// Batch size applied when a rolling spec sets none
    pub default_batch_size: i32,
    /// Optional controller metrics for Prometheus
    pub metrics: Option<SharedMetrics>,
}

impl Context {
    pub fn new(
        client: Arc<dyn ClusterClient>,
        store: Arc<dyn PropagationStore>,
        events: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
        default_batch_size: i32,
        metrics: Option<SharedMetrics>,
    ) -> Self {
        Context {
            client,
            store,
            events,
            clock,
            planner: RolloutPlanner::new(),
            backoff: BackoffStrategy::default(),
            default_batch_size,
            metrics,
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn record_error(&self, error: &ReconcileError) {
        if let Some(ref metrics) = self.metrics {
            metrics.record_error(error.stage());
        }
    }
}

/// Identity of a ConfigPropagation object
pub fn propagation_key(propagation: &ConfigPropagation) -> Result<PropagationKey, ReconcileError> {
    let namespace = propagation
        .namespace()
        .ok_or(ReconcileError::MissingNamespace)?;
    Ok(PropagationKey::new(namespace, propagation.name_any()))
}

fn should_retry(err: &ClientError) -> bool {
    classify(Some(err)).is_retryable()
}

/// Run one propagation pass for a ConfigPropagation
///
/// 1. Defaults and validates the spec
/// 2. Reads the source and derives the effective payload and its hash
/// 3. Lists the selected namespaces and plans this pass's batch
/// 4. Syncs the batch, recording per-target outcomes
/// 5. Prunes or detaches targets in deselected namespaces
///
/// Failures reading the source, listing namespaces or cleaning up abort the
/// pass. Per-target failures are recorded in the result.
pub async fn run_pass(
    propagation: &ConfigPropagation,
    ctx: &Context,
) -> Result<RolloutResult, ReconcileError> {
    let key = propagation_key(propagation)?;

    let mut spec = propagation.spec.clone();
    default_spec(&mut spec, ctx.default_batch_size);
    if let Err(validation_error) = validate_spec(&spec) {
        error!(
            propagation = %key,
            error = %validation_error,
            "ConfigPropagation spec validation failed"
        );
        return Err(ReconcileError::ValidationError(validation_error));
    }

    let source_identity = spec.source_identity();
    let name = spec.source_ref.name.as_str();

    let source = ctx
        .backoff
        .retry(
            || ctx.client.get_source(&spec.source_ref.namespace, name),
            should_retry,
        )
        .await
        .result
        .map_err(|error| ReconcileError::SourceFetch {
            source_ref: source_identity.clone(),
            error,
        })?;

    let payload = effective_payload(&source, &spec.data_keys);
    let hash = content_hash(&payload);

    let mut targets = ctx
        .backoff
        .retry(
            || ctx.client.list_namespaces(&spec.namespace_selector),
            should_retry,
        )
        .await
        .result
        .map_err(ReconcileError::NamespaceList)?;
    // The source itself is never a target
    targets.retain(|ns| *ns != spec.source_ref.namespace);
    targets.sort();
    targets.dedup();

    let strategy = spec.strategy_type();
    let batch_size = spec.batch_size().unwrap_or(ctx.default_batch_size);
    let plan = ctx
        .planner
        .plan(&key, &hash, &strategy, batch_size, &targets);

    info!(
        propagation = %key,
        strategy = strategy.as_str(),
        targets = targets.len(),
        planned = plan.batch.len(),
        completed = plan.completed,
        "Planned propagation pass"
    );

    let conflict_policy = spec.conflict_policy();
    let outcomes = sync_targets(
        ctx.client.as_ref(),
        &ctx.backoff,
        &SyncRequest {
            targets: &plan.batch,
            name,
            source_identity: &source_identity,
            payload: &payload,
            hash: &hash,
            conflict_policy: &conflict_policy,
        },
    )
    .await;

    let synced: Vec<String> = outcomes
        .iter()
        .filter(|o| o.is_synced())
        .map(|o| o.namespace.clone())
        .collect();

    let mut out_of_sync: Vec<OutOfSyncItem> =
        outcomes.iter().filter_map(|o| o.out_of_sync_item()).collect();
    let reported: BTreeSet<String> = out_of_sync.iter().map(|i| i.namespace.clone()).collect();

    let (completed_count, completed, pending_reason, pending_message) = match strategy {
        StrategyType::Rolling => {
            let count = ctx.planner.mark_completed(&key, &hash, &synced);
            let completed: BTreeSet<String> = ctx
                .planner
                .completed_namespaces(&key, &hash)
                .into_iter()
                .collect();
            (
                count,
                completed,
                REASON_PENDING_ROLLOUT,
                "namespace awaiting rollout batch",
            )
        }
        StrategyType::Immediate => {
            // No progress is carried between immediate passes
            ctx.planner.forget(&key);
            (
                synced.len(),
                synced.iter().cloned().collect(),
                REASON_PENDING_SYNC,
                "namespace not synchronized",
            )
        }
    };

    out_of_sync.extend(
        targets
            .iter()
            .filter(|ns| !completed.contains(*ns) && !reported.contains(*ns))
            .map(|ns| OutOfSyncItem {
                namespace: ns.clone(),
                reason: pending_reason.to_string(),
                message: pending_message.to_string(),
            }),
    );
    out_of_sync.sort_by(|a, b| a.namespace.cmp(&b.namespace));

    let CleanupResult { pruned, detached } = cleanup_deselected(
        ctx.client.as_ref(),
        &ctx.backoff,
        name,
        &source_identity,
        &targets,
        spec.prune(),
    )
    .await?;

    Ok(RolloutResult {
        strategy,
        hash,
        planned: plan.batch,
        total_targets: targets.len(),
        completed_count,
        outcomes,
        out_of_sync,
        pruned,
        detached,
    })
}

/// Publish events and action counters for a finished pass
async fn record_result(propagation: &ConfigPropagation, result: &RolloutResult, ctx: &Context) {
    for outcome in &result.outcomes {
        let event = match &outcome.kind {
            OutcomeKind::Synced(SyncAction::Created) => PropagationEvent::TargetCreated {
                namespace: outcome.namespace.clone(),
                warning: outcome.warning.clone(),
            },
            OutcomeKind::Synced(SyncAction::Updated) => PropagationEvent::TargetUpdated {
                namespace: outcome.namespace.clone(),
                warning: outcome.warning.clone(),
            },
            OutcomeKind::Synced(SyncAction::AlreadyInSync) => continue,
            OutcomeKind::Skipped(reason) => PropagationEvent::TargetSkipped {
                namespace: outcome.namespace.clone(),
                reason: reason.as_str().to_string(),
            },
            OutcomeKind::Failed { reason, message } => PropagationEvent::TargetSkipped {
                namespace: outcome.namespace.clone(),
                reason: format!("{}: {}", reason.as_str(), message),
            },
        };
        ctx.events.publish(propagation, event).await;
    }
    for namespace in &result.pruned {
        ctx.events
            .publish(
                propagation,
                PropagationEvent::TargetPruned {
                    namespace: namespace.clone(),
                },
            )
            .await;
    }
    for namespace in &result.detached {
        ctx.events
            .publish(
                propagation,
                PropagationEvent::TargetDetached {
                    namespace: namespace.clone(),
                },
            )
            .await;
    }

    if let Some(ref metrics) = ctx.metrics {
        let count = |n: usize| u64::try_from(n).unwrap_or(u64::MAX);
        metrics.record_action(
            PropagationAction::Create,
            count(result.count_action(SyncAction::Created)),
        );
        metrics.record_action(
            PropagationAction::Update,
            count(result.count_action(SyncAction::Updated)),
        );
        metrics.record_action(
            PropagationAction::Skip,
            count(result.count_action(SyncAction::AlreadyInSync) + result.skipped_count()),
        );
        metrics.record_action(PropagationAction::Prune, count(result.pruned.len()));
        metrics.record_action(PropagationAction::Detach, count(result.detached.len()));
    }
}

/// Point the target gauges at the propagation that just reconciled
fn record_target_gauges(result: &RolloutResult, ctx: &Context) {
    if let Some(ref metrics) = ctx.metrics {
        metrics.set_target_counts(
            i64::try_from(result.total_targets).unwrap_or(i64::MAX),
            i64::try_from(result.out_of_sync.len()).unwrap_or(i64::MAX),
        );
    }
}

/// Reconcile a ConfigPropagation resource
///
/// Handles the finalizer lifecycle around `run_pass` and writes the
/// resulting status back:
/// - a live object without the finalizer gets it first, then requeues
/// - a deleting object releases every managed target, forgets rollout
///   progress and drops the finalizer
/// - otherwise the pass runs and the computed status is patched with the
///   object's resourceVersion; a conflicting write requeues immediately
///
/// # Returns
/// * `Ok(ReconcileAction)` - when to look at the object again
/// * `Err(ReconcileError)` - hard failure; the error status was written best effort
pub async fn reconcile(
    propagation: Arc<ConfigPropagation>,
    ctx: Arc<Context>,
) -> Result<ReconcileAction, ReconcileError> {
    let start_time = Instant::now();
    let key = propagation_key(&propagation)?;
    let has_finalizer = propagation.finalizers().iter().any(|f| f == FINALIZER);

    if propagation.meta().deletion_timestamp.is_some() {
        if has_finalizer {
            finalize_propagation(&propagation, &key, &ctx).await?;
        }
        return Ok(ReconcileAction::await_change());
    }

    if !has_finalizer {
        let mut finalizers = propagation.finalizers().to_vec();
        finalizers.push(FINALIZER.to_string());
        ctx.store
            .set_finalizers(&key, finalizers)
            .await
            .map_err(ReconcileError::Finalizer)?;
        debug!(propagation = %key, "Added finalizer");
        return Ok(ReconcileAction::requeue(Duration::ZERO));
    }

    info!(propagation = %key, "Reconciling ConfigPropagation");

    let previous = propagation.status.clone().unwrap_or_default();
    let generation = propagation.meta().generation;
    let resource_version = propagation.resource_version();

    let pass = run_pass(&propagation, &ctx).await;
    if let Some(ref metrics) = ctx.metrics {
        metrics.observe_duration(start_time.elapsed().as_secs_f64());
    }

    let result = match pass {
        Ok(result) => result,
        Err(err) => {
            ctx.record_error(&err);
            error!(propagation = %key, error = %err, stage = err.stage(), "Reconcile failed");
            ctx.events
                .publish(
                    &propagation,
                    PropagationEvent::ReconcileError {
                        message: err.to_string(),
                    },
                )
                .await;

            let status = compute_status(&previous, None, Some(&err), generation, ctx.clock.now());
            if let Err(status_err) = ctx
                .store
                .patch_status(&key, resource_version.as_deref(), &status)
                .await
            {
                warn!(
                    propagation = %key,
                    error = %status_err,
                    "Failed to write error status (non-fatal)"
                );
            }
            return Err(err);
        }
    };

    record_result(&propagation, &result, &ctx).await;
    record_target_gauges(&result, &ctx);

    let status = compute_status(&previous, Some(&result), None, generation, ctx.clock.now());
    match ctx
        .store
        .patch_status(&key, resource_version.as_deref(), &status)
        .await
    {
        Ok(()) => {}
        Err(e) if e.is_conflict() => {
            debug!(propagation = %key, "Status write conflicted, requeueing");
            return Ok(ReconcileAction::requeue(Duration::ZERO));
        }
        Err(e) => {
            let err = ReconcileError::StatusUpdate(e);
            ctx.record_error(&err);
            return Err(err);
        }
    }

    info!(
        propagation = %key,
        targets = status.target_count,
        synced = status.synced_count,
        out_of_sync = status.out_of_sync_count,
        pruned = result.pruned.len(),
        detached = result.detached.len(),
        "Reconcile completed"
    );

    let resync = propagation
        .spec
        .resync_period_seconds
        .filter(|seconds| *seconds > 0)
        .map(|seconds| Duration::from_secs(u64::from(seconds.unsigned_abs())));
    Ok(match resync {
        Some(period) => ReconcileAction::requeue(period),
        // Status writes do not trigger a pass, so remaining batches need a timer
        None if result.strategy == StrategyType::Rolling && result.pending_count() > 0 => {
            ReconcileAction::requeue(NEXT_BATCH_DELAY)
        }
        None => ReconcileAction::await_change(),
    })
}

async fn finalize_propagation(
    propagation: &ConfigPropagation,
    key: &PropagationKey,
    ctx: &Context,
) -> Result<(), ReconcileError> {
    let mut spec = propagation.spec.clone();
    default_spec(&mut spec, ctx.default_batch_size);

    let released = finalize(
        ctx.client.as_ref(),
        &ctx.backoff,
        &spec.source_ref.name,
        &spec.source_identity(),
        spec.prune(),
    )
    .await;
    let released = match released {
        Ok(released) => released,
        Err(err) => {
            ctx.record_error(&err);
            error!(propagation = %key, error = %err, "Finalization failed");
            return Err(err);
        }
    };

    let result = RolloutResult {
        pruned: released.pruned,
        detached: released.detached,
        ..Default::default()
    };
    // The target gauges describe live propagations, so finalizing leaves them alone
    record_result(propagation, &result, ctx).await;
    ctx.planner.forget(key);

    let finalizers: Vec<String> = propagation
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != FINALIZER)
        .cloned()
        .collect();
    ctx.store
        .set_finalizers(key, finalizers)
        .await
        .map_err(ReconcileError::Finalizer)?;

    info!(
        propagation = %key,
        pruned = result.pruned.len(),
        detached = result.detached.len(),
        "Finalized ConfigPropagation"
    );
    Ok(())
}
