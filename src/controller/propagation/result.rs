use crate::controller::errors::ErrorCategory;
use crate::crd::propagation::{OutOfSyncItem, StrategyType};
use std::collections::BTreeMap;

/// Reason reported for namespaces the rolling strategy has not reached yet
pub const REASON_PENDING_ROLLOUT: &str = "PendingRollout";
/// Reason reported for namespaces the immediate strategy did not converge
pub const REASON_PENDING_SYNC: &str = "PendingSync";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    Created,
    Updated,
    AlreadyInSync,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Existing target left alone under `conflictPolicy: skip`
    Conflict,
    /// Existing target not owned by this propagation
    NotManaged,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            SkipReason::Conflict => "Conflict",
            SkipReason::NotManaged => "NotManaged",
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            SkipReason::Conflict => "existing ConfigMap left unchanged (conflictPolicy=skip)",
            SkipReason::NotManaged => "existing ConfigMap is not managed by this propagation",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    PayloadTooLarge,
    RbacDenied,
    TransientError,
    PermanentError,
}

impl FailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureReason::PayloadTooLarge => "PayloadTooLarge",
            FailureReason::RbacDenied => "RBACDenied",
            FailureReason::TransientError => "TransientError",
            FailureReason::PermanentError => "PermanentError",
        }
    }
}

impl From<ErrorCategory> for FailureReason {
    fn from(category: ErrorCategory) -> Self {
        match category {
            ErrorCategory::Rbac => FailureReason::RbacDenied,
            ErrorCategory::Transient => FailureReason::TransientError,
            ErrorCategory::Permanent | ErrorCategory::None => FailureReason::PermanentError,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutcomeKind {
    Synced(SyncAction),
    Skipped(SkipReason),
    Failed {
        reason: FailureReason,
        message: String,
    },
}

/// Result of syncing one target namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetOutcome {
    pub namespace: String,
    pub kind: OutcomeKind,
    /// Attempts spent on the last API call for this target
    pub attempts: u32,
    /// Advisory note, set when the payload is close to the size limit
    pub warning: Option<String>,
}

impl TargetOutcome {
    pub fn is_synced(&self) -> bool {
        matches!(self.kind, OutcomeKind::Synced(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.kind, OutcomeKind::Failed { .. })
    }

    /// Status entry for targets that did not converge
    pub fn out_of_sync_item(&self) -> Option<OutOfSyncItem> {
        match &self.kind {
            OutcomeKind::Synced(_) => None,
            OutcomeKind::Skipped(reason) => Some(OutOfSyncItem {
                namespace: self.namespace.clone(),
                reason: reason.as_str().to_string(),
                message: reason.message().to_string(),
            }),
            OutcomeKind::Failed { reason, message } => Some(OutOfSyncItem {
                namespace: self.namespace.clone(),
                reason: reason.as_str().to_string(),
                message: message.clone(),
            }),
        }
    }
}

/// Aggregate of one reconciliation pass
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RolloutResult {
    pub strategy: StrategyType,
    pub hash: String,
    /// Namespaces processed this pass
    pub planned: Vec<String>,
    /// Namespaces currently selected
    pub total_targets: usize,
    /// Selected namespaces holding the current content
    pub completed_count: usize,
    pub outcomes: Vec<TargetOutcome>,
    /// Every selected namespace not holding the current content, by namespace
    pub out_of_sync: Vec<OutOfSyncItem>,
    pub pruned: Vec<String>,
    pub detached: Vec<String>,
}

impl RolloutResult {
    pub fn synced(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|o| o.is_synced())
            .map(|o| o.namespace.as_str())
            .collect()
    }

    pub fn failed(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|o| o.is_failed())
            .map(|o| o.namespace.as_str())
            .collect()
    }

    pub fn warnings(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter_map(|o| o.warning.as_deref())
            .collect()
    }

    /// Namespaces that needed more than one attempt, with the retries spent
    pub fn retries(&self) -> BTreeMap<String, u32> {
        self.outcomes
            .iter()
            .filter(|o| o.attempts > 1)
            .map(|o| (o.namespace.clone(), o.attempts - 1))
            .collect()
    }

    pub fn count_action(&self, action: SyncAction) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.kind == OutcomeKind::Synced(action))
            .count()
    }

    pub fn skipped_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.kind, OutcomeKind::Skipped(_)))
            .count()
    }

    pub fn has_failures(&self) -> bool {
        self.outcomes.iter().any(TargetOutcome::is_failed)
    }

    /// Entries that are only waiting for a later pass
    pub fn pending_count(&self) -> usize {
        self.out_of_sync.iter().filter(|item| is_pending(item)).count()
    }

    /// Entries caused by conflicts or failures
    pub fn blocked_count(&self) -> usize {
        self.out_of_sync.len() - self.pending_count()
    }
}

pub fn is_pending(item: &OutOfSyncItem) -> bool {
    item.reason == REASON_PENDING_ROLLOUT || item.reason == REASON_PENDING_SYNC
}
