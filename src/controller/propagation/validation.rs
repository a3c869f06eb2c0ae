use crate::crd::propagation::{ConfigPropagationSpec, ConflictPolicy, StrategyType, UpdateStrategy};
use std::collections::BTreeMap;

/// Batch size used when neither the spec nor the environment sets one
pub const DEFAULT_BATCH_SIZE: i32 = 5;

/// Smallest accepted resync period
pub const MIN_RESYNC_PERIOD_SECONDS: i32 = 10;

/// Fill unset spec fields
///
/// Values already present in the spec are never replaced.
pub fn default_spec(spec: &mut ConfigPropagationSpec, default_batch_size: i32) {
    let strategy = spec.strategy.get_or_insert_with(UpdateStrategy::default);
    strategy.strategy_type.get_or_insert(StrategyType::Rolling);
    strategy.batch_size.get_or_insert(default_batch_size);

    spec.conflict_policy.get_or_insert(ConflictPolicy::Overwrite);
    spec.prune.get_or_insert(true);
}

/// Validate ConfigPropagation specification
///
/// Checks constraints the CRD schema cannot express.
///
/// # Validation Rules
/// - `sourceRef.namespace` and `sourceRef.name` are required
/// - `strategy.batchSize` must be >= 1
/// - `resyncPeriodSeconds` must be >= 10
/// - selector operators are In, NotIn, Exists or DoesNotExist; In/NotIn
///   need values, Exists/DoesNotExist take none
pub fn validate_spec(spec: &ConfigPropagationSpec) -> Result<(), String> {
    if spec.source_ref.namespace.is_empty() {
        return Err("spec.sourceRef.namespace cannot be empty".to_string());
    }
    if spec.source_ref.name.is_empty() {
        return Err("spec.sourceRef.name cannot be empty".to_string());
    }

    if let Some(batch_size) = spec.batch_size() {
        if batch_size < 1 {
            return Err(format!(
                "spec.strategy.batchSize must be >= 1, got {}",
                batch_size
            ));
        }
    }

    if let Some(resync) = spec.resync_period_seconds {
        if resync < MIN_RESYNC_PERIOD_SECONDS {
            return Err(format!(
                "spec.resyncPeriodSeconds must be >= {}, got {}",
                MIN_RESYNC_PERIOD_SECONDS, resync
            ));
        }
    }

    let expressions = spec
        .namespace_selector
        .match_expressions
        .iter()
        .flatten();
    for (i, expr) in expressions.enumerate() {
        let has_values = expr.values.as_ref().is_some_and(|v| !v.is_empty());
        match expr.operator.as_str() {
            "In" | "NotIn" if !has_values => {
                return Err(format!(
                    "namespaceSelector.matchExpressions[{}]: operator {} requires values",
                    i, expr.operator
                ));
            }
            "Exists" | "DoesNotExist" if has_values => {
                return Err(format!(
                    "namespaceSelector.matchExpressions[{}]: operator {} must not have values",
                    i, expr.operator
                ));
            }
            "In" | "NotIn" | "Exists" | "DoesNotExist" => {}
            other => {
                return Err(format!(
                    "namespaceSelector.matchExpressions[{}]: unsupported operator {}",
                    i, other
                ));
            }
        }
    }

    Ok(())
}

/// Keys of `source` selected by `data_keys` (all keys when empty)
///
/// Keys named in `data_keys` but absent from the source are ignored.
pub fn effective_payload(
    source: &BTreeMap<String, String>,
    data_keys: &[String],
) -> BTreeMap<String, String> {
    if data_keys.is_empty() {
        return source.clone();
    }

    data_keys
        .iter()
        .filter_map(|key| source.get(key).map(|value| (key.clone(), value.clone())))
        .collect()
}
