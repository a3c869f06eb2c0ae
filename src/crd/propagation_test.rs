#![allow(clippy::unwrap_used)] // Tests can use unwrap for brevity
#![allow(clippy::expect_used)] // Tests can use expect for better error messages

use super::*;
use kube::CustomResourceExt;

#[test]
fn test_propagation_deserialize_from_yaml() {
    let yaml = r#"
apiVersion: configpropagator.platform.example.com/v1alpha1
kind: ConfigPropagation
metadata:
  name: shared-settings
  namespace: platform
spec:
  sourceRef:
    namespace: platform
    name: settings
  namespaceSelector:
    matchLabels:
      team: payments
    matchExpressions:
    - key: env
      operator: In
      values: [prod, staging]
  dataKeys: [a, b]
  strategy:
    type: rolling
    batchSize: 3
  conflictPolicy: skip
  prune: false
  resyncPeriodSeconds: 120
"#;

    let cp: ConfigPropagation =
        serde_yaml::from_str(yaml).expect("Failed to deserialize ConfigPropagation");

    assert_eq!(cp.metadata.name.as_deref(), Some("shared-settings"));
    assert_eq!(cp.spec.source_ref.namespace, "platform");
    assert_eq!(cp.spec.source_ref.name, "settings");
    assert_eq!(cp.spec.data_keys, vec!["a".to_string(), "b".to_string()]);
    assert_eq!(cp.spec.strategy_type(), StrategyType::Rolling);
    assert_eq!(cp.spec.batch_size(), Some(3));
    assert_eq!(cp.spec.conflict_policy(), ConflictPolicy::Skip);
    assert!(!cp.spec.prune());
    assert_eq!(cp.spec.resync_period_seconds, Some(120));

    let labels = cp.spec.namespace_selector.match_labels.as_ref().unwrap();
    assert_eq!(labels.get("team").map(String::as_str), Some("payments"));
    let exprs = cp.spec.namespace_selector.match_expressions.as_ref().unwrap();
    assert_eq!(exprs[0].operator, "In");
}

#[test]
fn test_minimal_spec_uses_defaults() {
    let yaml = r#"
apiVersion: configpropagator.platform.example.com/v1alpha1
kind: ConfigPropagation
metadata:
  name: minimal
  namespace: default
spec:
  sourceRef:
    namespace: default
    name: app-config
  namespaceSelector: {}
"#;

    let cp: ConfigPropagation = serde_yaml::from_str(yaml).unwrap();

    assert!(cp.spec.data_keys.is_empty());
    assert_eq!(cp.spec.strategy_type(), StrategyType::Rolling);
    assert_eq!(cp.spec.batch_size(), None);
    assert_eq!(cp.spec.conflict_policy(), ConflictPolicy::Overwrite);
    assert!(cp.spec.prune());
    assert_eq!(cp.spec.source_identity(), "default/app-config");
    assert!(cp.status.is_none());
}

#[test]
fn test_immediate_strategy_deserializes() {
    let json = serde_json::json!({
        "type": "immediate"
    });
    let strategy: UpdateStrategy = serde_json::from_value(json).unwrap();
    assert_eq!(strategy.strategy_type, Some(StrategyType::Immediate));
    assert_eq!(strategy.batch_size, None);
}

#[test]
fn test_status_serializes_camel_case() {
    let status = ConfigPropagationStatus {
        conditions: vec![Condition {
            condition_type: ConditionType::Ready,
            status: ConditionStatus::True,
            reason: "Reconciled".to_string(),
            message: "all targets in sync".to_string(),
            last_transition_time: "2026-01-01T00:00:00Z".to_string(),
        }],
        target_count: 3,
        synced_count: 2,
        out_of_sync_count: 1,
        out_of_sync: vec![OutOfSyncItem {
            namespace: "team-b".to_string(),
            reason: "Conflict".to_string(),
            message: String::new(),
        }],
        last_sync_time: Some("2026-01-01T00:00:00Z".to_string()),
        observed_generation: Some(4),
    };

    let value = serde_json::to_value(&status).unwrap();

    assert_eq!(value["targetCount"], 3);
    assert_eq!(value["syncedCount"], 2);
    assert_eq!(value["outOfSyncCount"], 1);
    assert_eq!(value["observedGeneration"], 4);
    assert_eq!(value["conditions"][0]["type"], "Ready");
    assert_eq!(value["conditions"][0]["status"], "True");
    assert_eq!(
        value["conditions"][0]["lastTransitionTime"],
        "2026-01-01T00:00:00Z"
    );
    assert_eq!(value["outOfSync"][0]["namespace"], "team-b");
    // Empty message is omitted
    assert!(value["outOfSync"][0].get("message").is_none());
}

#[test]
fn test_empty_out_of_sync_is_serialized() {
    let value = serde_json::to_value(ConfigPropagationStatus::default()).unwrap();
    assert_eq!(value["outOfSync"], serde_json::json!([]));
}

#[test]
fn test_status_condition_lookup() {
    let status = ConfigPropagationStatus {
        conditions: vec![Condition {
            condition_type: ConditionType::Degraded,
            status: ConditionStatus::False,
            reason: "NoIssues".to_string(),
            message: String::new(),
            last_transition_time: "2026-01-01T00:00:00Z".to_string(),
        }],
        ..Default::default()
    };

    assert!(status.condition(ConditionType::Ready).is_none());
    assert_eq!(
        status.condition(ConditionType::Degraded).map(|c| c.status),
        Some(ConditionStatus::False)
    );
}

#[test]
fn test_crd_metadata() {
    let crd = ConfigPropagation::crd();

    assert_eq!(
        crd.metadata.name.as_deref(),
        Some("configpropagations.configpropagator.platform.example.com")
    );
    assert_eq!(crd.spec.group, API_GROUP);
    assert_eq!(crd.spec.names.kind, "ConfigPropagation");
    assert_eq!(crd.spec.scope, "Namespaced");
    assert_eq!(
        crd.spec.names.short_names.as_deref(),
        Some(&["cprop".to_string()][..])
    );
    assert!(crd.spec.versions.iter().any(|v| v.name == "v1alpha1"));
}

#[test]
fn test_marker_keys_share_api_group() {
    for key in [MANAGED_LABEL, SOURCE_ANNOTATION, HASH_ANNOTATION, FINALIZER] {
        assert!(key.starts_with(API_GROUP), "{key} should be under {API_GROUP}");
    }
}
