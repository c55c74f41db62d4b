use std::sync::{Arc, RwLock};

use arc_swap::ArcSwap;
use futures::StreamExt;
use ksync_core::{
    now_millis, ConnectionPhase, EventType, InformerError, InformerKey, InformerState, PoolEvent, Resource,
    ResourceEvent, Uid,
};
use ksync_kubehub::{WatchEvent, WatchSession};
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value as Json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::hub::EventHub;
use crate::PoolConfig;

/// Resources keyed by uid, remembering first-seen order.
#[derive(Default)]
pub(crate) struct ResourceCache {
    items: FxHashMap<Uid, (u64, Resource)>,
    next_seq: u64,
}

impl ResourceCache {
    /// Insert or replace; returns true when the uid was new.
    fn upsert(&mut self, uid: Uid, r: Resource) -> bool {
        match self.items.get_mut(&uid) {
            Some(slot) => {
                slot.1 = r;
                false
            }
            None => {
                self.items.insert(uid, (self.next_seq, r));
                self.next_seq += 1;
                true
            }
        }
    }

    fn remove(&mut self, uid: &str) -> Option<Resource> {
        self.items.remove(uid).map(|(_, r)| r)
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    pub(crate) fn get(&self, uid: &str) -> Option<Resource> {
        self.items.get(uid).map(|(_, r)| r.clone())
    }

    pub(crate) fn ordered(&self) -> Vec<Resource> {
        let mut v: Vec<&(u64, Resource)> = self.items.values().collect();
        v.sort_by_key(|(seq, _)| *seq);
        v.into_iter().map(|(_, r)| r.clone()).collect()
    }
}

/// State and cache of one informer. The informer task is the only writer; readers copy out.
pub(crate) struct InformerShared {
    pub(crate) state: ArcSwap<InformerState>,
    pub(crate) cache: RwLock<ResourceCache>,
}

impl InformerShared {
    pub(crate) fn new() -> Self {
        Self { state: ArcSwap::from_pointee(InformerState::started()), cache: RwLock::new(ResourceCache::default()) }
    }

    pub(crate) fn update(&self, f: impl FnOnce(&mut InformerState)) {
        let mut next = (**self.state.load()).clone();
        f(&mut next);
        self.state.store(Arc::new(next));
    }

    pub(crate) fn snapshot(&self) -> InformerState {
        (**self.state.load()).clone()
    }

    pub(crate) fn read_cache<R>(&self, f: impl FnOnce(&ResourceCache) -> R) -> R {
        f(&self.cache.read().unwrap_or_else(|p| p.into_inner()))
    }

    fn write_cache<R>(&self, f: impl FnOnce(&mut ResourceCache) -> R) -> R {
        f(&mut self.cache.write().unwrap_or_else(|p| p.into_inner()))
    }
}

pub(crate) struct InformerTask {
    pub(crate) key: InformerKey,
    pub(crate) session: Arc<dyn WatchSession>,
    pub(crate) shared: Arc<InformerShared>,
    pub(crate) hub: Arc<EventHub>,
    pub(crate) cancel: CancellationToken,
    pub(crate) config: PoolConfig,
}

impl InformerTask {
    pub(crate) async fn run(self) {
        let mut attempt: u32 = 0;
        loop {
            self.shared.update(|s| s.connection = ConnectionPhase::Connecting);
            let started = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                r = self.session.start() => r,
            };
            match started {
                Ok(mut stream) => {
                    self.shared.update(|s| {
                        s.connected = true;
                        s.connection = ConnectionPhase::Connected;
                    });
                    info!(key = %self.key, "informer: connected");
                    let mut healthy = false;
                    loop {
                        let next = tokio::select! {
                            biased;
                            _ = self.cancel.cancelled() => return,
                            ev = stream.next() => ev,
                        };
                        match next {
                            Some(WatchEvent::Error(msg)) => self.record_error(msg),
                            Some(ev) => {
                                healthy = true;
                                self.apply(ev);
                            }
                            None => break,
                        }
                    }
                    if healthy {
                        attempt = 0;
                    }
                    self.shared.update(|s| {
                        s.connected = false;
                        s.connection = ConnectionPhase::Disconnected;
                    });
                    warn!(key = %self.key, "informer: disconnected");
                }
                Err(e) => {
                    self.shared.update(|s| s.connection = ConnectionPhase::Disconnected);
                    self.record_error(format!("{:#}", e));
                }
            }
            let delay = self.config.backoff(attempt);
            attempt = attempt.saturating_add(1);
            self.shared.update(|s| s.reconnect_attempts += 1);
            debug!(key = %self.key, delay_ms = %delay.as_millis(), attempt, "informer: reconnect scheduled");
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        debug!(key = %self.key, "informer: task stopped");
    }

    fn record_error(&self, message: String) {
        warn!(key = %self.key, error = %message, "informer: watch error");
        metrics::counter!("informer_errors_total", 1u64);
        self.shared.update(|s| {
            s.error_count += 1;
            s.last_error = Some(message.clone());
        });
        self.hub.emit_live(
            &self.cancel,
            PoolEvent::Error(InformerError {
                context_name: self.key.context_name.clone(),
                resource_type: self.key.resource_type.clone(),
                message,
            }),
        );
    }

    fn emit(&self, event_type: EventType, resource: Resource) {
        let ev = PoolEvent::Resource(ResourceEvent {
            event_type,
            resource,
            context_name: self.key.context_name.clone(),
        });
        if self.hub.emit_live(&self.cancel, ev) {
            metrics::counter!("informer_events_total", 1u64);
        }
    }

    fn synced(&self, count: usize) {
        self.shared.update(|s| {
            s.resource_count = count;
            s.last_sync_time = Some(now_millis());
        });
    }

    fn apply(&self, ev: WatchEvent) {
        match ev {
            WatchEvent::Added(raw) => self.upsert(raw, Some(EventType::Added)),
            WatchEvent::Updated(raw) => self.upsert(raw, Some(EventType::Modified)),
            WatchEvent::Deleted(raw) => {
                let r = Resource::from_value(raw);
                let Some(uid) = r.uid().map(|u| u.to_string()) else {
                    debug!(key = %self.key, "informer: delete without uid ignored");
                    return;
                };
                let count = self.shared.write_cache(|c| {
                    c.remove(&uid);
                    c.len()
                });
                self.synced(count);
                self.emit(EventType::Deleted, r);
            }
            WatchEvent::Relisted(items) => self.relist(items),
            WatchEvent::Error(msg) => self.record_error(msg),
        }
    }

    /// `fixed` forces the event type; `None` derives it from cache membership.
    fn upsert(&self, raw: Json, fixed: Option<EventType>) {
        let r = Resource::from_value(raw);
        let Some(uid) = r.uid().map(|u| u.to_string()) else {
            debug!(key = %self.key, "informer: object without uid ignored");
            return;
        };
        let (fresh, count) = self.shared.write_cache(|c| {
            let fresh = c.upsert(uid, r.clone());
            (fresh, c.len())
        });
        self.synced(count);
        let event_type = fixed.unwrap_or(if fresh { EventType::Added } else { EventType::Modified });
        self.emit(event_type, r);
    }

    /// Replace the cache with a full listing, reporting objects that vanished as deleted.
    fn relist(&self, items: Vec<Json>) {
        let mut listed: FxHashSet<Uid> = FxHashSet::default();
        for raw in items {
            if let Some(uid) = raw.pointer("/metadata/uid").and_then(|u| u.as_str()) {
                listed.insert(uid.to_string());
            }
            self.upsert(raw, None);
        }
        let gone: Vec<Resource> = self.shared.write_cache(|c| {
            let stale: Vec<Uid> = c.items.keys().filter(|u| !listed.contains(*u)).cloned().collect();
            stale.iter().filter_map(|u| c.remove(u)).collect()
        });
        let count = self.shared.read_cache(|c| c.len());
        self.synced(count);
        info!(key = %self.key, listed = listed.len(), removed = gone.len(), "informer: relist applied");
        for r in gone {
            self.emit(EventType::Deleted, r);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn res(uid: &str, name: &str) -> Resource {
        Resource::from_value(serde_json::json!({ "metadata": { "uid": uid, "name": name } }))
    }

    #[test]
    fn cache_keeps_first_seen_order() {
        let mut c = ResourceCache::default();
        assert!(c.upsert("b".into(), res("b", "b")));
        assert!(c.upsert("a".into(), res("a", "a")));
        assert!(!c.upsert("b".into(), res("b", "b2")));
        let names: Vec<String> = c.ordered().iter().map(|r| r.name().to_string()).collect();
        assert_eq!(names, vec!["b2", "a"]);
        assert!(c.remove("b").is_some());
        assert!(c.remove("b").is_none());
        assert_eq!(c.len(), 1);
    }
}
