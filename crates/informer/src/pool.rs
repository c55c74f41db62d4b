use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::Result;
use ksync_core::{InformerKey, InformerState, PoolEvent, PoolStatistics, Resource, WatchOptions};
use ksync_kubehub::WatchProvider;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::hub::{EventHub, SubscriptionId};
use crate::task::{InformerShared, InformerTask};
use crate::PoolConfig;

struct Informer {
    shared: Arc<InformerShared>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    hub: Arc<EventHub>,
}

impl Drop for Informer {
    fn drop(&mut self) {
        // Closed through the hub: once this returns the task cannot publish again.
        self.hub.close(&self.cancel);
        self.handle.abort();
    }
}

/// Owns one watch task and resource cache per (context, resourceType).
pub struct InformerPool {
    provider: Arc<dyn WatchProvider>,
    config: PoolConfig,
    informers: Mutex<FxHashMap<InformerKey, Informer>>,
    hub: Arc<EventHub>,
}

impl InformerPool {
    pub fn new(provider: Arc<dyn WatchProvider>, config: PoolConfig) -> Self {
        Self { provider, config, informers: Mutex::new(FxHashMap::default()), hub: Arc::new(EventHub::default()) }
    }

    fn informers(&self) -> std::sync::MutexGuard<'_, FxHashMap<InformerKey, Informer>> {
        self.informers.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn publish_gauge(&self, n: usize) {
        metrics::gauge!("informer_active", n as f64);
    }

    /// Start watching `resource_type` in `options.context_name`. A second call for a running key
    /// is a no-op. Errors resolving the context or resource type are returned to the caller.
    pub async fn start_informer(&self, resource_type: &str, options: WatchOptions) -> Result<()> {
        let key = InformerKey::new(options.context_name.clone(), resource_type);
        if self.informers().contains_key(&key) {
            debug!(key = %key, "pool: informer already running");
            return Ok(());
        }
        let t0 = Instant::now();
        let session = self.provider.session(&key, &options).await?;

        let mut informers = self.informers();
        if informers.contains_key(&key) {
            debug!(key = %key, "pool: concurrent start discarded");
            return Ok(());
        }
        let shared = Arc::new(InformerShared::new());
        let cancel = CancellationToken::new();
        let task = InformerTask {
            key: key.clone(),
            session,
            shared: shared.clone(),
            hub: self.hub.clone(),
            cancel: cancel.clone(),
            config: self.config,
        };
        let handle = tokio::spawn(task.run());
        informers.insert(key.clone(), Informer { shared, cancel, handle, hub: self.hub.clone() });
        let n = informers.len();
        drop(informers);
        self.publish_gauge(n);
        info!(
            key = %key,
            ns = ?options.namespace,
            labels = ?options.label_selector,
            took_ms = %t0.elapsed().as_millis(),
            "pool: informer started"
        );
        Ok(())
    }

    /// Returns whether an informer existed for the key.
    pub fn stop_informer(&self, context_name: &str, resource_type: &str) -> bool {
        let key = InformerKey::new(context_name, resource_type);
        let (removed, n) = {
            let mut informers = self.informers();
            let removed = informers.remove(&key);
            (removed, informers.len())
        };
        let stopped = removed.is_some();
        drop(removed);
        if stopped {
            self.publish_gauge(n);
            info!(key = %key, "pool: informer stopped");
        }
        stopped
    }

    pub fn stop_context_informers(&self, context_name: &str) -> usize {
        let (removed, n) = {
            let mut informers = self.informers();
            let keys: Vec<InformerKey> =
                informers.keys().filter(|k| k.context_name == context_name).cloned().collect();
            let removed: Vec<Informer> = keys.iter().filter_map(|k| informers.remove(k)).collect();
            (removed, informers.len())
        };
        let count = removed.len();
        drop(removed);
        self.publish_gauge(n);
        info!(context = %context_name, count, "pool: context informers stopped");
        count
    }

    pub fn stop_all(&self) -> usize {
        let removed: Vec<Informer> = self.informers().drain().map(|(_, i)| i).collect();
        let count = removed.len();
        drop(removed);
        self.publish_gauge(0);
        info!(count, "pool: all informers stopped");
        count
    }

    fn shared(&self, context_name: &str, resource_type: &str) -> Option<Arc<InformerShared>> {
        self.informers().get(&InformerKey::new(context_name, resource_type)).map(|i| i.shared.clone())
    }

    /// Cached resources in first-seen order; empty for an unknown key.
    pub fn get_resources(&self, context_name: &str, resource_type: &str) -> Vec<Resource> {
        self.shared(context_name, resource_type).map(|s| s.read_cache(|c| c.ordered())).unwrap_or_default()
    }

    pub fn get_resource(&self, context_name: &str, resource_type: &str, uid: &str) -> Option<Resource> {
        self.shared(context_name, resource_type).and_then(|s| s.read_cache(|c| c.get(uid)))
    }

    pub fn get_informer_state(&self, context_name: &str, resource_type: &str) -> Option<InformerState> {
        self.shared(context_name, resource_type).map(|s| s.snapshot())
    }

    pub fn get_all_states(&self) -> BTreeMap<InformerKey, InformerState> {
        self.informers().iter().map(|(k, i)| (k.clone(), i.shared.snapshot())).collect()
    }

    pub fn get_statistics(&self) -> PoolStatistics {
        let states: Vec<InformerState> = self.informers().values().map(|i| i.shared.snapshot()).collect();
        PoolStatistics {
            total_informers: states.len(),
            running_informers: states.iter().filter(|s| s.running).count(),
            total_resources: states.iter().map(|s| s.resource_count).sum(),
            total_errors: states.iter().map(|s| s.error_count).sum(),
        }
    }

    /// Receive every resource and error event from all informers, in per-key order.
    pub fn subscribe(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<PoolEvent>) {
        self.hub.subscribe()
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.hub.unsubscribe(id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.hub.len()
    }
}
