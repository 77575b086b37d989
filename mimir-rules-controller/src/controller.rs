use std::{collections::HashSet, sync::Arc, time::Duration};

use futures::future::join_all;
use kube::ResourceExt;
use mimir_rules_controller_apis::MimirRule;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    cache::{CacheEvent, NamespacedName, RuleCache},
    errors::ControllerError,
    queue::WorkQueue,
    reconciler::{Reconciler, SyncAction},
};

/// Feeds cache notifications into the work queue and, while leading, runs
/// the worker pool which drains it through the [`Reconciler`].
pub(crate) struct RuleController {
    reconciler: Arc<Reconciler>,
    cache: RuleCache,
    queue: WorkQueue<String>,
    /// `None` means all namespaces.
    watch_namespaces: Option<HashSet<String>>,
    workers: usize,
    resync_period: Duration,
    cache_sync_timeout: Duration,
}

impl RuleController {
    pub fn new(
        reconciler: Arc<Reconciler>,
        cache: RuleCache,
        watch_namespaces: Option<HashSet<String>>,
        workers: usize,
        resync_period: Duration,
        cache_sync_timeout: Duration,
    ) -> Self {
        Self {
            reconciler,
            cache,
            queue: WorkQueue::new(),
            watch_namespaces,
            workers: workers.max(1),
            resync_period,
            cache_sync_timeout,
        }
    }

    fn is_watched(&self, rule: &MimirRule) -> bool {
        match (&self.watch_namespaces, rule.namespace()) {
            (None, _) => true,
            (Some(namespaces), Some(ns)) => namespaces.contains(&ns),
            (Some(_), None) => false,
        }
    }

    fn enqueue(&self, rule: &MimirRule) {
        if self.is_watched(rule) {
            let key = NamespacedName::from(rule).to_string();
            debug!("enqueue MimirRule {}", key);
            self.queue.add(key);
        }
    }

    /// Enqueue the key of every changed object, on all replicas so that a new
    /// leader starts with a filled queue.
    pub async fn dispatch(
        self: Arc<Self>,
        mut notifications: mpsc::UnboundedReceiver<CacheEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = notifications.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            match &event {
                CacheEvent::Added(o) | CacheEvent::Deleted(o) => self.enqueue(o),
                CacheEvent::Updated { new, .. } => self.enqueue(new),
            }
        }
        debug!("stopped dispatching cache notifications");
    }

    /// Periodically enqueue every cached object.
    pub async fn resync(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.resync_period);
        // the first tick completes immediately
        interval.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if self.cache.has_synced() {
                        for rule in self.cache.list(|o| self.is_watched(o)) {
                            self.queue.add(NamespacedName::from(rule.as_ref()).to_string());
                        }
                    }
                }
            }
        }
    }

    async fn process(&self, key: &String) {
        match self.reconciler.sync(key).await.into_result() {
            Ok(action) => {
                match action {
                    SyncAction::NotFound | SyncAction::UpToDate => {
                        debug!("MimirRule {}: {:?}", key, action)
                    }
                    _ => info!("synced MimirRule {}: {:?}", key, action),
                }
                self.queue.forget(key);
            }
            Err(e) if e.is_temporary() => {
                error!(
                    "failed to sync MimirRule {} (attempt {}): {}",
                    key,
                    self.queue.num_requeues(key) + 1,
                    e
                );
                self.queue.add_rate_limited(key.clone());
            }
            Err(e) => {
                error!("dropping MimirRule {}: {}", key, e);
                self.queue.forget(key);
            }
        }
    }

    async fn worker(self: Arc<Self>, id: usize, cancel: CancellationToken) {
        info!("worker {} started", id);
        while let Some(key) = self.queue.get().await {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.queue.done(&key);
                    break;
                }
                _ = self.process(&key) => self.queue.done(&key),
            }
        }
        info!("worker {} stopped", id);
    }

    /// Wait for the cache to sync, then run the workers until `cancel` fires.
    ///
    /// Fails if the cache does not sync within the configured timeout.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<(), ControllerError> {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            synced = tokio::time::timeout(self.cache_sync_timeout, self.cache.wait_for_sync()) => {
                synced.map_err(|_| {
                    ControllerError::CacheSync(format!(
                        "initial listing not complete after {:?}",
                        self.cache_sync_timeout
                    ))
                })??
            }
        }
        info!("starting {} workers", self.workers);
        let workers = (0..self.workers).map(|id| self.clone().worker(id, cancel.clone()));
        let shutdown = async {
            cancel.cancelled().await;
            self.queue.shutdown();
        };
        tokio::join!(join_all(workers), shutdown);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cache::{CacheWriter, cache},
        lint::DelimiterLinter,
        testing::{FakeRuleClient, FakeRuleStore, RecordingMetrics, rule},
    };
    use kube_runtime::watcher;
    use mimir_rules_controller_apis::READY;

    struct Fixture {
        controller: Arc<RuleController>,
        client: Arc<FakeRuleClient>,
        store: Arc<FakeRuleStore>,
        notifications: Option<mpsc::UnboundedReceiver<CacheEvent>>,
    }

    fn fixture(watch_namespaces: Option<HashSet<String>>) -> Fixture {
        let (mut writer, cache, notifications) = cache();
        sync(&mut writer);
        let client = Arc::new(FakeRuleClient::default());
        let store = Arc::new(FakeRuleStore::with_cache(writer));
        let reconciler = Arc::new(Reconciler::new(
            "cluster".to_string(),
            cache.clone(),
            client.clone(),
            store.clone(),
            Arc::new(DelimiterLinter),
            Arc::new(RecordingMetrics::default()),
        ));
        let controller = Arc::new(RuleController::new(
            reconciler,
            cache,
            watch_namespaces,
            2,
            Duration::from_secs(30),
            Duration::from_secs(5),
        ));
        Fixture {
            controller,
            client,
            store,
            notifications: Some(notifications),
        }
    }

    fn sync(writer: &mut CacheWriter) {
        writer.apply(watcher::Event::Init);
        writer.apply(watcher::Event::InitDone);
    }

    async fn settle() {
        for _ in 0..100 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn converges_all_watched_rules() {
        let mut f = fixture(Some(["ns".to_string()].into()));
        let cancel = CancellationToken::new();
        tokio::spawn(
            f.controller
                .clone()
                .dispatch(f.notifications.take().unwrap(), cancel.clone()),
        );
        let run = tokio::spawn(f.controller.clone().run(cancel.clone()));

        f.store.insert(rule("ns", "r1", 1));
        f.store.insert(rule("ns", "r2", 1));
        f.store.insert(rule("other", "r3", 1));
        tokio::time::sleep(Duration::from_secs(1)).await;

        for name in ["ns/r1", "ns/r2"] {
            let obj = f.store.get(name).unwrap();
            assert!(obj.has_finalizer(), "{name}");
            assert!(obj.condition(READY).unwrap().is_true(), "{name}");
        }
        assert!(!f.store.get("other/r3").unwrap().has_finalizer());
        assert_eq!(vec!["g1"], f.client.groups("cluster:ns:r1"));
        assert_eq!(vec!["g1"], f.client.groups("cluster:ns:r2"));
        assert_eq!(2, f.client.calls().len());

        cancel.cancel();
        run.await.unwrap().unwrap();
        assert!(f.controller.queue.is_shutting_down());
    }

    #[tokio::test(start_paused = true)]
    async fn failures_are_retried_with_backoff() {
        let mut f = fixture(None);
        let cancel = CancellationToken::new();
        tokio::spawn(
            f.controller
                .clone()
                .dispatch(f.notifications.take().unwrap(), cancel.clone()),
        );
        let run = tokio::spawn(f.controller.clone().run(cancel.clone()));
        f.client.fail_group("g1");
        f.store.insert(rule("ns", "r1", 1));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(f.controller.queue.num_requeues(&"ns/r1".to_string()) >= 2);

        f.client.heal();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(0, f.controller.queue.num_requeues(&"ns/r1".to_string()));
        assert!(f.store.get("ns/r1").unwrap().condition(READY).unwrap().is_true());
        cancel.cancel();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn invalid_keys_are_dropped() {
        let f = fixture(None);
        f.controller.process(&"a/b/c".to_string()).await;
        assert_eq!(0, f.controller.queue.num_requeues(&"a/b/c".to_string()));
        assert_eq!(0, f.controller.queue.len());
    }

    #[tokio::test(start_paused = true)]
    async fn resync_enqueues_cached_rules() {
        let f = fixture(Some(["ns".to_string()].into()));
        f.store.insert(rule("ns", "r1", 1));
        f.store.insert(rule("other", "r2", 1));
        let cancel = CancellationToken::new();
        tokio::spawn(f.controller.clone().resync(cancel.clone()));
        settle().await;
        assert_eq!(0, f.controller.queue.len());
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(1, f.controller.queue.len());
        assert_eq!(Some("ns/r1".to_string()), f.controller.queue.get().await);
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn cache_never_syncs() {
        let (_writer, cache, _notifications) = cache();
        let reconciler = Arc::new(Reconciler::new(
            "cluster".to_string(),
            cache.clone(),
            Arc::new(FakeRuleClient::default()),
            Arc::new(FakeRuleStore::default()),
            Arc::new(DelimiterLinter),
            Arc::new(RecordingMetrics::default()),
        ));
        let controller = Arc::new(RuleController::new(
            reconciler,
            cache,
            None,
            1,
            Duration::from_secs(30),
            Duration::from_secs(5),
        ));
        let err = controller.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ControllerError::CacheSync(_)));
    }
}
