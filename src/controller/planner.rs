//! Rolling batch planner
//!
//! Keeps, per ConfigPropagation, the set of namespaces that already hold
//! the content identified by a hash. A new hash always discards the old
//! progress: completion marks recorded for one payload are never credited
//! to another.
//!
//! All state sits behind one mutex. Reconciles run one at a time, so
//! contention is not a concern.

use crate::crd::propagation::StrategyType;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Mutex, MutexGuard};

/// Identity of a ConfigPropagation (`namespace/name`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PropagationKey {
    pub namespace: String,
    pub name: String,
}

impl PropagationKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for PropagationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Default)]
struct RolloutState {
    hash: String,
    completed: BTreeSet<String>,
}

/// Namespaces to process this pass, plus how many were already done
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub batch: Vec<String>,
    pub completed: usize,
}

#[derive(Debug, Default)]
pub struct RolloutPlanner {
    states: Mutex<HashMap<PropagationKey, RolloutState>>,
}

impl RolloutPlanner {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PropagationKey, RolloutState>> {
        // State is rebuilt from the cluster on the next passes if a holder panicked
        self.states
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Choose the namespaces to touch for this pass
    ///
    /// Immediate: every target, reported as all completed, no state kept.
    /// Rolling: up to `batch_size` (at least 1) targets not yet completed for
    /// `hash`, in the order given. Completed namespaces that are no longer
    /// targeted are dropped so they are revisited when selected again.
    pub fn plan(
        &self,
        key: &PropagationKey,
        hash: &str,
        strategy: &StrategyType,
        batch_size: i32,
        targets: &[String],
    ) -> Plan {
        if *strategy == StrategyType::Immediate {
            return Plan {
                batch: targets.to_vec(),
                completed: targets.len(),
            };
        }

        let batch_size = usize::try_from(batch_size.max(1)).unwrap_or(1);

        let mut states = self.lock();
        let state = states.entry(key.clone()).or_default();
        if state.hash != hash {
            state.hash = hash.to_string();
            state.completed.clear();
        }

        state.completed.retain(|ns| targets.contains(ns));
        let completed = state.completed.len();

        let batch = targets
            .iter()
            .filter(|ns| !state.completed.contains(*ns))
            .take(batch_size)
            .cloned()
            .collect();

        Plan { batch, completed }
    }

    /// Record namespaces that now hold `hash`; returns the completed count
    ///
    /// With no namespaces this only reads: 0 unless state for `hash` exists.
    pub fn mark_completed(&self, key: &PropagationKey, hash: &str, namespaces: &[String]) -> usize {
        let mut states = self.lock();

        if namespaces.is_empty() {
            return match states.get(key) {
                Some(state) if state.hash == hash => state.completed.len(),
                _ => 0,
            };
        }

        let state = states.entry(key.clone()).or_default();
        if state.hash != hash {
            state.hash = hash.to_string();
            state.completed.clear();
        }
        state.completed.extend(namespaces.iter().cloned());
        state.completed.len()
    }

    /// Namespaces completed for `hash`, sorted; empty when the hash is stale
    pub fn completed_namespaces(&self, key: &PropagationKey, hash: &str) -> Vec<String> {
        match self.lock().get(key) {
            Some(state) if state.hash == hash => state.completed.iter().cloned().collect(),
            _ => Vec::new(),
        }
    }

    pub fn forget(&self, key: &PropagationKey) {
        self.lock().remove(key);
    }

    /// Number of propagations with stored progress
    pub fn tracked(&self) -> usize {
        self.lock().len()
    }
}
