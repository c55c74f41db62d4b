//! ksync control surface (in-process).
//!
//! [`Manager`] is the single object frontends talk to: context discovery and switching through a
//! [`ConfigLoader`], and start/stop of watches through an [`InformerPool`]. It holds no global
//! state; the application owns it and hands it to whatever drives the UI transport.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use ksync_core::{InformerKey, InformerState, K8sContextInfo, PoolStatistics, Resource, WatchOptions};
use ksync_informer::InformerPool;
use ksync_kubehub::{ConfigLoader, K8sContext};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Errors callers branch on.
#[derive(Debug, thiserror::Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum ManagerError {
    #[error("unknown context: {0}")]
    UnknownContext(String),
    #[error("config: {0}")]
    Config(String),
}

pub type ManagerResult<T> = Result<T, ManagerError>;

/// Outcome of [`Manager::start_watching`], one entry per requested type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchReport {
    pub started: Vec<String>,
    /// (resource type, error message)
    pub failed: Vec<(String, String)>,
}

impl WatchReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Default)]
struct Discovered {
    contexts: Vec<K8sContextInfo>,
    current: Option<String>,
}

pub struct Manager {
    loader: Arc<dyn ConfigLoader>,
    pool: Arc<InformerPool>,
    discovered: RwLock<Discovered>,
}

impl Manager {
    pub fn new(loader: Arc<dyn ConfigLoader>, pool: Arc<InformerPool>) -> Self {
        Self { loader, pool, discovered: RwLock::new(Discovered::default()) }
    }

    pub fn pool(&self) -> Arc<InformerPool> {
        self.pool.clone()
    }

    fn discovered(&self) -> std::sync::RwLockReadGuard<'_, Discovered> {
        self.discovered.read().unwrap_or_else(|p| p.into_inner())
    }

    fn discovered_mut(&self) -> std::sync::RwLockWriteGuard<'_, Discovered> {
        self.discovered.write().unwrap_or_else(|p| p.into_inner())
    }

    /// Load contexts from the loader and cache their summaries.
    pub fn initialize(&self) -> ManagerResult<Vec<K8sContextInfo>> {
        let t0 = Instant::now();
        let loaded = self.loader.load_contexts().map_err(|e| ManagerError::Config(format!("{:#}", e)))?;
        info!(
            count = loaded.contexts.len(),
            current = ?loaded.current_context,
            took_ms = %t0.elapsed().as_millis(),
            "manager: contexts loaded"
        );
        let mut d = self.discovered_mut();
        d.contexts = loaded.contexts.clone();
        d.current = loaded.current_context;
        Ok(loaded.contexts)
    }

    pub fn reload(&self) -> ManagerResult<Vec<K8sContextInfo>> {
        self.initialize()
    }

    pub fn get_contexts(&self) -> Vec<K8sContextInfo> {
        self.discovered().contexts.clone()
    }

    pub fn get_current_context(&self) -> Option<String> {
        self.discovered().current.clone()
    }

    pub fn get_context_detail(&self, name: &str) -> Option<K8sContext> {
        self.loader.context_detail(name)
    }

    pub fn switch_context(&self, name: &str) -> ManagerResult<()> {
        if !self.loader.set_current_context(name) {
            warn!(context = %name, "manager: switch to unknown context");
            return Err(ManagerError::UnknownContext(name.to_string()));
        }
        let mut d = self.discovered_mut();
        for c in d.contexts.iter_mut() {
            c.is_current = c.name == name;
        }
        d.current = Some(name.to_string());
        info!(context = %name, "manager: context switched");
        Ok(())
    }

    pub async fn validate_context(&self, name: &str) -> bool {
        let ok = self.loader.validate_context(name).await;
        info!(context = %name, ok, "manager: context validated");
        ok
    }

    /// Start one informer per type. A failure for one type is reported and does not stop the rest.
    /// `options.context_name` is replaced by `context_name`.
    pub async fn start_watching<S: AsRef<str>>(
        &self,
        context_name: &str,
        resource_types: &[S],
        options: Option<WatchOptions>,
    ) -> WatchReport {
        let mut opts = options.unwrap_or_default();
        opts.context_name = context_name.to_string();
        let mut report = WatchReport::default();
        for t in resource_types {
            let t = t.as_ref();
            match self.pool.start_informer(t, opts.clone()).await {
                Ok(()) => report.started.push(t.to_string()),
                Err(e) => {
                    let msg = format!("{:#}", e);
                    warn!(context = %context_name, resource_type = %t, error = %msg, "manager: watch failed to start");
                    report.failed.push((t.to_string(), msg));
                }
            }
        }
        info!(
            context = %context_name,
            started = report.started.len(),
            failed = report.failed.len(),
            "manager: start watching"
        );
        report
    }

    pub fn stop_watching(&self, context_name: &str) -> usize {
        self.pool.stop_context_informers(context_name)
    }

    pub fn get_resources(&self, context_name: &str, resource_type: &str) -> Vec<Resource> {
        self.pool.get_resources(context_name, resource_type)
    }

    pub fn get_informer_statistics(&self) -> PoolStatistics {
        self.pool.get_statistics()
    }

    pub fn get_informer_states(&self) -> BTreeMap<InformerKey, InformerState> {
        self.pool.get_all_states()
    }

    /// Stop every informer and forget discovered contexts.
    pub fn cleanup(&self) {
        let stopped = self.pool.stop_all();
        *self.discovered_mut() = Discovered::default();
        info!(stopped, "manager: cleaned up");
    }
}
