use super::result::RolloutResult;
use crate::crd::propagation::{
    Condition, ConditionStatus, ConditionType, ConfigPropagationStatus, StrategyType,
};
use chrono::{DateTime, SecondsFormat, Utc};

struct Desired {
    status: ConditionStatus,
    reason: &'static str,
    message: String,
}

impl Desired {
    fn new(status: bool, reason: &'static str, message: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            reason,
            message: message.into(),
        }
    }
}

/// Fold a pass into the status of a ConfigPropagation
///
/// Counters and the out-of-sync list come from `result` when present and
/// are kept from `previous` otherwise. Conditions follow the first
/// matching rule: error, then conflicts or failures, then pending work,
/// then fully synced. A condition keeps its previous `lastTransitionTime`
/// while its (status, reason, message) is unchanged.
pub fn compute_status(
    previous: &ConfigPropagationStatus,
    result: Option<&RolloutResult>,
    reconcile_error: Option<&dyn std::fmt::Display>,
    observed_generation: Option<i64>,
    now: DateTime<Utc>,
) -> ConfigPropagationStatus {
    let timestamp = now.to_rfc3339_opts(SecondsFormat::Secs, true);
    let mut status = previous.clone();
    status.last_sync_time = Some(timestamp.clone());
    if observed_generation.is_some() {
        status.observed_generation = observed_generation;
    }

    if let Some(result) = result {
        status.target_count = to_i32(result.total_targets);
        status.synced_count = to_i32(result.completed_count);
        status.out_of_sync_count = to_i32(result.out_of_sync.len());

        let mut items = result.out_of_sync.clone();
        items.sort_by(|a, b| a.namespace.cmp(&b.namespace));
        status.out_of_sync = items;
    }

    let [ready, progressing, degraded] = desired_conditions(result, reconcile_error);
    status.conditions = vec![
        merge(previous, ConditionType::Ready, ready, &timestamp),
        merge(previous, ConditionType::Progressing, progressing, &timestamp),
        merge(previous, ConditionType::Degraded, degraded, &timestamp),
    ];
    status
}

fn to_i32(n: usize) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

fn desired_conditions(
    result: Option<&RolloutResult>,
    reconcile_error: Option<&dyn std::fmt::Display>,
) -> [Desired; 3] {
    if let Some(err) = reconcile_error {
        let message = format!("reconciliation failed: {err}");
        return [
            Desired::new(false, "Error", message.clone()),
            Desired::new(false, "Error", "paused due to error"),
            Desired::new(true, "Error", message),
        ];
    }

    let Some(result) = result else {
        return [
            Desired::new(true, "Reconciled", "propagation succeeded"),
            Desired::new(false, "Completed", "all namespaces in sync"),
            Desired::new(false, "NoIssues", "no errors"),
        ];
    };

    let pending = result.pending_count();
    let blocked = result.blocked_count();
    let progress_reason = match result.strategy {
        StrategyType::Rolling => "RollingUpdate",
        StrategyType::Immediate => "InProgress",
    };

    if blocked > 0 {
        let progressing = if pending > 0 {
            Desired::new(
                true,
                progress_reason,
                format!("{pending} namespaces awaiting rollout"),
            )
        } else {
            Desired::new(false, "Blocked", "remaining namespaces need intervention")
        };
        let degraded = if result.has_failures() {
            Desired::new(
                true,
                "OutOfSync",
                format!("{} namespaces failed to sync", result.failed().len()),
            )
        } else {
            Desired::new(false, "NoIssues", "no errors")
        };
        return [
            Desired::new(
                false,
                "OutOfSync",
                format!("{} namespaces out of sync", result.out_of_sync.len()),
            ),
            progressing,
            degraded,
        ];
    }

    if pending > 0 {
        return [
            Desired::new(
                false,
                "InProgress",
                format!(
                    "synced {} of {} namespaces",
                    result.completed_count, result.total_targets
                ),
            ),
            Desired::new(
                true,
                progress_reason,
                format!("{pending} namespaces awaiting rollout"),
            ),
            Desired::new(false, "NoIssues", "no errors"),
        ];
    }

    [
        Desired::new(
            true,
            "Reconciled",
            format!("propagated to {} namespaces", result.total_targets),
        ),
        Desired::new(false, "Completed", "all namespaces in sync"),
        Desired::new(false, "NoIssues", "no errors"),
    ]
}

fn merge(
    previous: &ConfigPropagationStatus,
    condition_type: ConditionType,
    desired: Desired,
    timestamp: &str,
) -> Condition {
    let last_transition_time = match previous.condition(condition_type) {
        Some(prev)
            if prev.status == desired.status
                && prev.reason == desired.reason
                && prev.message == desired.message =>
        {
            prev.last_transition_time.clone()
        }
        _ => timestamp.to_string(),
    };

    Condition {
        condition_type,
        status: desired.status,
        reason: desired.reason.to_string(),
        message: desired.message,
        last_transition_time,
    }
}
