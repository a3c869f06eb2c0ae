//! Watch streams feeding a single reconcile worker
//!
//! ConfigPropagation, ConfigMap and Namespace watches turn into keys on a
//! deduplicating [`WorkQueue`]. One worker drains the queue, so at most one
//! reconcile runs at a time.

use crate::controller::planner::PropagationKey;
use crate::controller::propagation::{reconcile, Context, ReconcileError};
use crate::controller::queue::WorkQueue;
use crate::crd::propagation::{ConfigPropagation, FINALIZER};
use crate::server::{ReadinessState, ShutdownSignal};
use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::{ConfigMap, Namespace};
use kube::runtime::reflector::{ObjectRef as StoreRef, Store};
use kube::runtime::{reflector, watcher, WatchStreamExt};
use kube::{Api, Client, Resource, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchSettings {
    /// Deadline for one reconcile, retries included
    pub reconcile_timeout: Duration,
    /// Delay before retrying a key whose reconcile failed
    pub error_requeue: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            reconcile_timeout: Duration::from_secs(60),
            error_requeue: Duration::from_secs(10),
        }
    }
}

/// Keys of every propagation whose source is `namespace/name`
pub fn keys_for_source(
    propagations: &[Arc<ConfigPropagation>],
    namespace: &str,
    name: &str,
) -> Vec<PropagationKey> {
    propagations
        .iter()
        .filter(|cp| cp.spec.source_ref.namespace == namespace && cp.spec.source_ref.name == name)
        .filter_map(|cp| key_of(cp))
        .collect()
}

/// Keys of every known propagation
pub fn all_keys(propagations: &[Arc<ConfigPropagation>]) -> Vec<PropagationKey> {
    propagations.iter().filter_map(|cp| key_of(cp)).collect()
}

/// Whether a ConfigPropagation watch event calls for a reconcile
///
/// Status and finalizer writes leave `metadata.generation` alone, so an
/// object whose status already reflects its generation is only revisited
/// on its requeue schedule.
pub fn needs_reconcile(propagation: &ConfigPropagation) -> bool {
    if propagation.meta().deletion_timestamp.is_some()
        || !propagation.finalizers().iter().any(|f| f == FINALIZER)
    {
        return true;
    }
    let observed = propagation
        .status
        .as_ref()
        .and_then(|status| status.observed_generation);
    match (propagation.meta().generation, observed) {
        (Some(generation), Some(observed)) => generation != observed,
        _ => true,
    }
}

fn key_of(propagation: &ConfigPropagation) -> Option<PropagationKey> {
    Some(PropagationKey::new(
        propagation.namespace()?,
        propagation.name_any(),
    ))
}

#[derive(Clone)]
pub struct Dispatcher {
    ctx: Arc<Context>,
    queue: Arc<WorkQueue<PropagationKey>>,
    notify: Arc<Notify>,
    settings: DispatchSettings,
}

impl Dispatcher {
    pub fn new(ctx: Arc<Context>, settings: DispatchSettings) -> Self {
        Self {
            ctx,
            queue: Arc::new(WorkQueue::new()),
            notify: Arc::new(Notify::new()),
            settings,
        }
    }

    pub fn enqueue(&self, key: PropagationKey) {
        if self.queue.add(key) {
            self.notify.notify_one();
        }
    }

    fn enqueue_all(&self, keys: Vec<PropagationKey>) {
        for key in keys {
            self.enqueue(key);
        }
    }

    /// Re-enqueue `key` once `delay` has passed
    fn schedule(&self, key: PropagationKey, delay: Duration) {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            dispatcher.enqueue(key);
        });
    }

    /// Watch the cluster and reconcile until `shutdown` fires
    ///
    /// `readiness` flips to ready once the ConfigPropagation cache has synced.
    pub async fn run(self, client: Client, readiness: ReadinessState, mut shutdown: ShutdownSignal) {
        let (reader, writer) = reflector::store::<ConfigPropagation>();

        let propagations = reflector(
            writer,
            watcher(
                Api::<ConfigPropagation>::all(client.clone()),
                watcher::Config::default(),
            ),
        )
        .default_backoff()
        .touched_objects();
        let config_maps = watcher(Api::<ConfigMap>::all(client.clone()), watcher::Config::default())
            .default_backoff()
            .touched_objects();
        let namespaces = watcher(Api::<Namespace>::all(client), watcher::Config::default())
            .default_backoff()
            .touched_objects();

        let watches = [
            self.spawn_watch("configpropagations", propagations, reader.clone(), |_, cp: ConfigPropagation| {
                if needs_reconcile(&cp) {
                    key_of(&cp).into_iter().collect()
                } else {
                    Vec::new()
                }
            }),
            self.spawn_watch("configmaps", config_maps, reader.clone(), |store, cm: ConfigMap| {
                keys_for_source(
                    &store.state(),
                    cm.namespace().as_deref().unwrap_or_default(),
                    &cm.name_any(),
                )
            }),
            // Any namespace change may change which namespaces are selected
            self.spawn_watch("namespaces", namespaces, reader.clone(), |store, _: Namespace| {
                all_keys(&store.state())
            }),
        ];

        if self.wait_for_cache(&reader, &readiness, &mut shutdown).await {
            self.work(&reader, &mut shutdown).await;
        }

        for handle in &watches {
            handle.abort();
        }
        info!("Dispatcher stopped");
    }

    /// Wait for the initial ConfigPropagation list, mark ready and queue
    /// every known propagation
    ///
    /// Returns false when shutdown fires first or the cache can never sync.
    async fn wait_for_cache(
        &self,
        store: &Store<ConfigPropagation>,
        readiness: &ReadinessState,
        shutdown: &mut ShutdownSignal,
    ) -> bool {
        tokio::select! {
            ready = store.wait_until_ready() => {
                if let Err(e) = ready {
                    error!(error = ?e, "ConfigPropagation store closed before initial sync");
                    return false;
                }
            }
            _ = shutdown.wait() => return false,
        }

        readiness.set_ready();
        // Rollout progress is not persisted, so every propagation gets a pass
        let keys = all_keys(&store.state());
        info!(propagations = keys.len(), "Initial sync complete, starting worker");
        self.enqueue_all(keys);
        true
    }

    fn spawn_watch<K, S, F>(
        &self,
        kind: &'static str,
        stream: S,
        store: Store<ConfigPropagation>,
        keys: F,
    ) -> tokio::task::JoinHandle<()>
    where
        K: Send + 'static,
        S: Stream<Item = Result<K, watcher::Error>> + Send + 'static,
        F: Fn(&Store<ConfigPropagation>, K) -> Vec<PropagationKey> + Send + 'static,
    {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            let mut stream = stream.boxed();
            while let Some(item) = stream.next().await {
                match item {
                    Ok(object) => dispatcher.enqueue_all(keys(&store, object)),
                    Err(e) => warn!(kind, error = %e, "Watch error"),
                }
            }
            debug!(kind, "Watch stream ended");
        })
    }

    /// Drain the queue one key at a time
    async fn work(&self, store: &Store<ConfigPropagation>, shutdown: &mut ShutdownSignal) {
        loop {
            if shutdown.is_shutdown() {
                return;
            }
            let Some(key) = self.queue.get() else {
                tokio::select! {
                    _ = self.notify.notified() => continue,
                    _ = shutdown.wait() => return,
                }
            };
            self.process(store, key).await;
        }
    }

    /// Reconcile one key and schedule its next visit
    pub async fn process(&self, store: &Store<ConfigPropagation>, key: PropagationKey) {
        let object_ref = StoreRef::new(&key.name).within(&key.namespace);
        let Some(propagation) = store.get(&object_ref) else {
            debug!(propagation = %key, "ConfigPropagation gone, dropping rollout progress");
            self.ctx.planner.forget(&key);
            return;
        };

        let outcome = tokio::time::timeout(
            self.settings.reconcile_timeout,
            reconcile(propagation, self.ctx.clone()),
        )
        .await;

        let delay = match outcome {
            Ok(Ok(action)) => action.requeue_after,
            Ok(Err(err)) => {
                // Reconcile already logged and recorded the failure
                debug!(propagation = %key, category = err.category().as_str(), "Requeueing after error");
                Some(self.settings.error_requeue)
            }
            Err(elapsed) => {
                let err = ReconcileError::from(elapsed);
                self.ctx.record_error(&err);
                warn!(
                    propagation = %key,
                    timeout_secs = self.settings.reconcile_timeout.as_secs(),
                    "Reconcile deadline exceeded"
                );
                Some(self.settings.error_requeue)
            }
        };

        if let Some(delay) = delay {
            self.schedule(key, delay);
        }
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::controller::testing::{propagation, Harness};
    use crate::crd::propagation::ConfigPropagationStatus;
    use crate::server::shutdown_channel;

    fn store_with(objects: Vec<ConfigPropagation>) -> Store<ConfigPropagation> {
        let (reader, mut writer) = reflector::store::<ConfigPropagation>();
        for object in objects {
            writer.apply_watcher_event(&watcher::Event::Apply(object));
        }
        reader
    }

    fn named(name: &str, source: &str) -> ConfigPropagation {
        let mut cp = propagation(|spec| spec.source_ref.name = source.to_string());
        cp.metadata.name = Some(name.to_string());
        cp
    }

    fn key(name: &str) -> PropagationKey {
        PropagationKey::new("platform", name)
    }

    #[test]
    fn test_status_only_changes_do_not_need_reconcile() {
        // Builder objects carry the finalizer at generation 3
        let mut cp = propagation(|_| {});
        assert!(needs_reconcile(&cp), "never reconciled");

        cp.status = Some(ConfigPropagationStatus {
            observed_generation: Some(3),
            last_sync_time: Some("2026-01-01T00:00:01Z".to_string()),
            ..Default::default()
        });
        assert!(!needs_reconcile(&cp), "status write of the current generation");

        cp.metadata.generation = Some(4);
        assert!(needs_reconcile(&cp), "spec edit");

        let mut unfinalized = cp.clone();
        unfinalized.metadata.generation = Some(3);
        unfinalized.metadata.finalizers = None;
        assert!(needs_reconcile(&unfinalized));

        let mut deleting = cp.clone();
        deleting.metadata.generation = Some(3);
        deleting.metadata.deletion_timestamp =
            serde_json::from_value(serde_json::json!("2026-01-01T00:00:00Z")).unwrap();
        assert!(needs_reconcile(&deleting));
    }

    #[tokio::test]
    async fn test_ready_and_queued_after_initial_sync() {
        let h = Harness::new();
        let dispatcher = Dispatcher::new(h.ctx.clone(), DispatchSettings::default());
        let readiness = ReadinessState::new();
        let (_controller, mut shutdown) = shutdown_channel();
        let (reader, mut writer) = reflector::store::<ConfigPropagation>();

        let waiting = {
            let dispatcher = dispatcher.clone();
            let readiness = readiness.clone();
            tokio::spawn(async move {
                dispatcher
                    .wait_for_cache(&reader, &readiness, &mut shutdown)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!readiness.is_ready());

        writer.apply_watcher_event(&watcher::Event::Init);
        writer.apply_watcher_event(&watcher::Event::InitApply(named("one", "settings")));
        writer.apply_watcher_event(&watcher::Event::InitApply(named("two", "flags")));
        writer.apply_watcher_event(&watcher::Event::InitDone);

        assert!(waiting.await.unwrap());
        assert!(readiness.is_ready());
        assert_eq!(dispatcher.queued(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_before_sync_stays_not_ready() {
        let h = Harness::new();
        let dispatcher = Dispatcher::new(h.ctx.clone(), DispatchSettings::default());
        let readiness = ReadinessState::new();
        let (controller, mut shutdown) = shutdown_channel();
        let (reader, _writer) = reflector::store::<ConfigPropagation>();

        controller.shutdown();
        let synced = dispatcher
            .wait_for_cache(&reader, &readiness, &mut shutdown)
            .await;

        assert!(!synced);
        assert!(!readiness.is_ready());
        assert_eq!(dispatcher.queued(), 0);
    }

    #[test]
    fn test_keys_for_source_matches_namespace_and_name() {
        let propagations = vec![
            Arc::new(named("one", "settings")),
            Arc::new(named("two", "flags")),
            Arc::new(named("three", "settings")),
        ];

        let mut keys = keys_for_source(&propagations, "platform", "settings");
        keys.sort();
        assert_eq!(keys, vec![key("one"), key("three")]);

        assert!(keys_for_source(&propagations, "other", "settings").is_empty());
        assert_eq!(all_keys(&propagations).len(), 3);
    }

    #[tokio::test]
    async fn test_enqueue_deduplicates() {
        let h = Harness::new();
        let dispatcher = Dispatcher::new(h.ctx.clone(), DispatchSettings::default());

        dispatcher.enqueue(key("shared"));
        dispatcher.enqueue(key("shared"));
        dispatcher.enqueue(key("other"));

        assert_eq!(dispatcher.queued(), 2);
    }

    #[tokio::test]
    async fn test_missing_object_forgets_progress() {
        let h = Harness::new();
        h.client.put_source("platform", "settings", &[("a", "1")]);
        h.client.add_namespace("team-a", &[("team", "payments")]);
        let cp = propagation(|_| {});
        run_pass_once(&h, &cp).await;
        assert_eq!(h.ctx.planner.tracked(), 1);

        let dispatcher = Dispatcher::new(h.ctx.clone(), DispatchSettings::default());
        dispatcher.process(&store_with(vec![]), key("shared")).await;

        assert_eq!(h.ctx.planner.tracked(), 0);
        assert_eq!(dispatcher.queued(), 0);
    }

    async fn run_pass_once(h: &Harness, cp: &ConfigPropagation) {
        crate::controller::propagation::run_pass(cp, &h.ctx)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_process_reconciles_and_schedules_requeue() {
        let h = Harness::new();
        h.client.put_source("platform", "settings", &[("a", "1")]);
        h.client.add_namespace("team-a", &[("team", "payments")]);
        let mut cp = propagation(|_| {});
        // Missing finalizer: reconcile adds it and asks for an immediate requeue
        cp.metadata.finalizers = None;

        let dispatcher = Dispatcher::new(h.ctx.clone(), DispatchSettings::default());
        dispatcher.process(&store_with(vec![cp]), key("shared")).await;
        assert_eq!(h.store.finalizer_updates().len(), 1);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(dispatcher.queued(), 1);
    }

    #[tokio::test]
    async fn test_error_requeues_after_delay() {
        let h = Harness::new();
        // No source ConfigMap: the pass fails
        let cp = propagation(|_| {});
        let settings = DispatchSettings {
            reconcile_timeout: Duration::from_secs(5),
            error_requeue: Duration::from_millis(30),
        };

        let dispatcher = Dispatcher::new(h.ctx.clone(), settings);
        dispatcher.process(&store_with(vec![cp]), key("shared")).await;
        assert_eq!(dispatcher.queued(), 0);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(dispatcher.queued(), 1);
        assert_eq!(h.metrics.error_count("source_fetch"), 1);
    }
}
