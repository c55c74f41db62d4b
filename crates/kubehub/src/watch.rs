use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use futures::StreamExt;
use kube::{
    api::Api,
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    runtime::watcher::{self, Event},
    Client,
};
use ksync_core::{kinds, InformerKey, WatchOptions};
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value as Json;
use tracing::{debug, info, warn};

use crate::{ConfigLoader, WatchEvent, WatchSession, WatchStream};

/// kube-rs backed watch provider. Caches one client per context.
pub struct KubeWatchProvider {
    loader: Arc<dyn ConfigLoader>,
    clients: Mutex<FxHashMap<String, Client>>,
}

impl KubeWatchProvider {
    pub fn new(loader: Arc<dyn ConfigLoader>) -> Self {
        Self { loader, clients: Mutex::new(FxHashMap::default()) }
    }

    async fn client_for(&self, context: &str) -> Result<Client> {
        if let Some(c) = self.clients.lock().unwrap_or_else(|p| p.into_inner()).get(context).cloned() {
            return Ok(c);
        }
        let client = self.loader.make_client(context).await?;
        self.clients
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(context.to_string(), client.clone());
        Ok(client)
    }
}

/// Resolve a resource type ("Pod", "pods", "Certificate") to its API resource and scope.
/// Built-ins resolve without a round trip; everything else goes through discovery.
async fn find_api_resource(client: Client, resource_type: &str) -> Result<(ApiResource, bool)> {
    if let Some(b) = kinds::lookup(resource_type) {
        let gvk = GroupVersionKind::gvk(b.group, b.version, b.kind);
        return Ok((ApiResource::from_gvk_with_plural(&gvk, b.plural), b.namespaced));
    }
    let discovery = Discovery::new(client).run().await.context("running API discovery")?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.kind.eq_ignore_ascii_case(resource_type) || ar.plural.eq_ignore_ascii_case(resource_type) {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(anyhow!("resource type not served by cluster: {}", resource_type))
}

#[async_trait::async_trait]
impl crate::WatchProvider for KubeWatchProvider {
    async fn session(&self, key: &InformerKey, opts: &WatchOptions) -> Result<Arc<dyn WatchSession>> {
        let client = self.client_for(&key.context_name).await?;
        let (ar, namespaced) = find_api_resource(client.clone(), &key.resource_type).await?;
        let api: Api<DynamicObject> = match (namespaced, opts.namespace.as_deref()) {
            (true, Some(ns)) => Api::namespaced_with(client, ns, &ar),
            _ => Api::all_with(client, &ar),
        };
        let mut config = watcher::Config::default();
        if let Some(l) = opts.label_selector.as_deref() {
            config = config.labels(l);
        }
        if let Some(f) = opts.field_selector.as_deref() {
            config = config.fields(f);
        }
        info!(key = %key, kind = %ar.kind, ns = ?opts.namespace, "kubehub: session resolved");
        Ok(Arc::new(KubeWatchSession {
            api,
            config,
            api_version: ar.api_version.clone(),
            kind: ar.kind.clone(),
            resync: opts.resync_period_secs.filter(|s| *s > 0).map(Duration::from_secs),
        }))
    }
}

struct KubeWatchSession {
    api: Api<DynamicObject>,
    config: watcher::Config,
    api_version: String,
    kind: String,
    resync: Option<Duration>,
}

#[async_trait::async_trait]
impl WatchSession for KubeWatchSession {
    async fn start(&self) -> Result<WatchStream> {
        let classifier = Classifier::new(self.api_version.clone(), self.kind.clone());
        let stream = watcher::watcher(self.api.clone(), self.config.clone())
            .scan(classifier, |c, ev| futures::future::ready(c.classify(ev)))
            .flat_map(futures::stream::iter);
        debug!(kind = %self.kind, "kubehub: watch stream opened");
        match self.resync {
            // Ending the stream forces the informer to reconnect, which relists.
            Some(period) => Ok(stream.take_until(tokio::time::sleep(period)).boxed()),
            None => Ok(stream.boxed()),
        }
    }
}

/// Turns kube watcher events into add/update/delete by tracking uids seen on this connection.
/// Ends the stream after the first watcher error so reconnection is driven by the informer.
struct Classifier {
    api_version: String,
    kind: String,
    seen: FxHashSet<String>,
    failed: bool,
}

impl Classifier {
    fn new(api_version: String, kind: String) -> Self {
        Self { api_version, kind, seen: FxHashSet::default(), failed: false }
    }

    fn to_json(&self, obj: &DynamicObject) -> Option<Json> {
        let mut v = match serde_json::to_value(obj) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "kubehub: serializing DynamicObject failed");
                return None;
            }
        };
        // list items come back without type meta
        if let Some(map) = v.as_object_mut() {
            map.entry("apiVersion").or_insert_with(|| Json::String(self.api_version.clone()));
            map.entry("kind").or_insert_with(|| Json::String(self.kind.clone()));
        }
        Some(v)
    }

    fn classify(&mut self, ev: Result<Event<DynamicObject>, watcher::Error>) -> Option<Vec<WatchEvent>> {
        if self.failed {
            return None;
        }
        let out = match ev {
            Ok(Event::Applied(o)) => {
                let fresh = o.metadata.uid.as_ref().map(|u| self.seen.insert(u.clone())).unwrap_or(true);
                self.to_json(&o)
                    .map(|v| if fresh { WatchEvent::Added(v) } else { WatchEvent::Updated(v) })
                    .into_iter()
                    .collect()
            }
            Ok(Event::Deleted(o)) => {
                if let Some(u) = o.metadata.uid.as_ref() {
                    self.seen.remove(u);
                }
                self.to_json(&o).map(WatchEvent::Deleted).into_iter().collect()
            }
            Ok(Event::Restarted(list)) => {
                debug!(kind = %self.kind, count = list.len(), "kubehub: watch relisted");
                self.seen = list.iter().filter_map(|o| o.metadata.uid.clone()).collect();
                vec![WatchEvent::Relisted(list.iter().filter_map(|o| self.to_json(o)).collect())]
            }
            Err(e) => {
                self.failed = true;
                metrics::counter!("kubehub_watch_errors_total", 1u64);
                vec![WatchEvent::Error(e.to_string())]
            }
        };
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(uid: &str, name: &str) -> DynamicObject {
        let mut o = DynamicObject {
            types: None,
            metadata: Default::default(),
            data: serde_json::json!({ "status": { "phase": "Running" } }),
        };
        o.metadata.uid = Some(uid.to_string());
        o.metadata.name = Some(name.to_string());
        o
    }

    #[test]
    fn applied_is_added_then_updated() {
        let mut c = Classifier::new("v1".into(), "Pod".into());
        let first = c.classify(Ok(Event::Applied(obj("u1", "a")))).unwrap();
        assert!(matches!(&first[..], [WatchEvent::Added(v)] if v["kind"] == "Pod" && v["apiVersion"] == "v1"));
        let second = c.classify(Ok(Event::Applied(obj("u1", "a")))).unwrap();
        assert!(matches!(&second[..], [WatchEvent::Updated(_)]));
        let del = c.classify(Ok(Event::Deleted(obj("u1", "a")))).unwrap();
        assert!(matches!(&del[..], [WatchEvent::Deleted(_)]));
        let again = c.classify(Ok(Event::Applied(obj("u1", "a")))).unwrap();
        assert!(matches!(&again[..], [WatchEvent::Added(_)]));
    }

    #[test]
    fn restart_resets_seen_set() {
        let mut c = Classifier::new("v1".into(), "Pod".into());
        let out = c.classify(Ok(Event::Restarted(vec![obj("u1", "a"), obj("u2", "b")]))).unwrap();
        match &out[..] {
            [WatchEvent::Relisted(items)] => assert_eq!(items.len(), 2),
            other => panic!("unexpected {:?}", other),
        }
        let upd = c.classify(Ok(Event::Applied(obj("u2", "b")))).unwrap();
        assert!(matches!(&upd[..], [WatchEvent::Updated(_)]));
    }
}
