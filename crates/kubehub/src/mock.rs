//! In-memory stand-ins for the cluster, used by tests and demos.

use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use futures::channel::mpsc;
use futures::StreamExt;
use kube::Client;
use ksync_core::{InformerKey, K8sContextInfo, WatchOptions};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::{ConfigLoader, K8sContext, LoadedContexts, WatchEvent, WatchProvider, WatchSession, WatchStream};

#[derive(Default)]
struct Feed {
    current: Option<mpsc::UnboundedSender<WatchEvent>>,
    /// Events sent while no connection is open; delivered on the next `start()`.
    backlog: Vec<WatchEvent>,
    starts: usize,
    fail_starts: usize,
}

#[derive(Default)]
struct MockState {
    feeds: FxHashMap<InformerKey, Feed>,
    bad_contexts: FxHashSet<String>,
    sessions: usize,
}

/// Scriptable watch provider: tests push [`WatchEvent`]s per key and can drop connections.
#[derive(Clone, Default)]
pub struct MockWatchProvider {
    state: Arc<Mutex<MockState>>,
}

impl MockWatchProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        let mut g = self.state.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut g)
    }

    /// `session()` fails for this context, like a context missing from kubeconfig.
    pub fn reject_context(&self, context: &str) {
        self.with(|s| s.bad_contexts.insert(context.to_string()));
    }

    /// The next `n` calls to `start()` for `key` fail.
    pub fn fail_next_starts(&self, key: &InformerKey, n: usize) {
        self.with(|s| s.feeds.entry(key.clone()).or_default().fail_starts = n);
    }

    pub fn send(&self, key: &InformerKey, ev: WatchEvent) {
        self.with(|s| {
            let feed = s.feeds.entry(key.clone()).or_default();
            match &feed.current {
                Some(tx) if !tx.is_closed() => {
                    let _ = tx.unbounded_send(ev);
                }
                _ => feed.backlog.push(ev),
            }
        });
    }

    /// End the open stream for `key`, as if the server closed the connection.
    pub fn disconnect(&self, key: &InformerKey) {
        self.with(|s| {
            if let Some(feed) = s.feeds.get_mut(key) {
                feed.current = None;
            }
        });
    }

    /// Whether a consumer currently holds an open stream for `key`.
    pub fn is_connected(&self, key: &InformerKey) -> bool {
        self.with(|s| s.feeds.get(key).and_then(|f| f.current.as_ref()).map(|tx| !tx.is_closed()).unwrap_or(false))
    }

    /// Number of `start()` calls seen for `key`, failed ones included.
    pub fn starts(&self, key: &InformerKey) -> usize {
        self.with(|s| s.feeds.get(key).map(|f| f.starts).unwrap_or(0))
    }

    /// Number of sessions resolved across all keys.
    pub fn sessions(&self) -> usize {
        self.with(|s| s.sessions)
    }
}

#[async_trait::async_trait]
impl WatchProvider for MockWatchProvider {
    async fn session(&self, key: &InformerKey, _opts: &WatchOptions) -> Result<Arc<dyn WatchSession>> {
        self.with(|s| {
            if s.bad_contexts.contains(&key.context_name) {
                return Err(anyhow!("context not found: {}", key.context_name));
            }
            s.sessions += 1;
            Ok(())
        })?;
        Ok(Arc::new(MockSession { provider: self.clone(), key: key.clone() }))
    }
}

struct MockSession {
    provider: MockWatchProvider,
    key: InformerKey,
}

#[async_trait::async_trait]
impl WatchSession for MockSession {
    async fn start(&self) -> Result<WatchStream> {
        self.provider.with(|s| {
            let feed = s.feeds.entry(self.key.clone()).or_default();
            feed.starts += 1;
            if feed.fail_starts > 0 {
                feed.fail_starts -= 1;
                return Err(anyhow!("connection refused"));
            }
            let (tx, rx) = mpsc::unbounded();
            for ev in feed.backlog.drain(..) {
                let _ = tx.unbounded_send(ev);
            }
            feed.current = Some(tx);
            Ok(rx.boxed())
        })
    }
}

/// Fixed set of contexts; clients cannot be built.
pub struct MockConfigLoader {
    contexts: Vec<K8sContext>,
    current: Mutex<Option<String>>,
    reachable: FxHashSet<String>,
}

impl MockConfigLoader {
    pub fn new(names: &[&str], current: Option<&str>) -> Self {
        let contexts = names
            .iter()
            .map(|n| K8sContext {
                name: n.to_string(),
                cluster: format!("{}-cluster", n),
                user: Some(format!("{}-user", n)),
                namespace: None,
                server: Some(format!("https://{}.local:6443", n)),
            })
            .collect();
        Self {
            contexts,
            current: Mutex::new(current.map(|s| s.to_string())),
            reachable: names.iter().map(|n| n.to_string()).collect(),
        }
    }

    pub fn unreachable(mut self, name: &str) -> Self {
        self.reachable.remove(name);
        self
    }
}

#[async_trait::async_trait]
impl ConfigLoader for MockConfigLoader {
    fn load_contexts(&self) -> Result<LoadedContexts> {
        let current_context = self.current.lock().unwrap_or_else(|p| p.into_inner()).clone();
        let contexts = self
            .contexts
            .iter()
            .map(|c| K8sContextInfo {
                name: c.name.clone(),
                cluster: c.cluster.clone(),
                user: c.user.clone(),
                namespace: c.namespace.clone(),
                is_current: current_context.as_deref() == Some(c.name.as_str()),
            })
            .collect();
        Ok(LoadedContexts { contexts, current_context })
    }

    fn context_detail(&self, name: &str) -> Option<K8sContext> {
        self.contexts.iter().find(|c| c.name == name).cloned()
    }

    fn set_current_context(&self, name: &str) -> bool {
        if self.context_detail(name).is_none() {
            return false;
        }
        *self.current.lock().unwrap_or_else(|p| p.into_inner()) = Some(name.to_string());
        true
    }

    async fn validate_context(&self, name: &str) -> bool {
        self.context_detail(name).is_some() && self.reachable.contains(name)
    }

    async fn make_client(&self, name: &str) -> Result<Client> {
        Err(anyhow!("mock loader cannot build a client for {}", name))
    }
}
