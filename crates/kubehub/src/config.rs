use std::path::PathBuf;
use std::sync::RwLock;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Client;
use ksync_core::K8sContextInfo;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{debug, info, warn};

const VALIDATE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadedContexts {
    pub contexts: Vec<K8sContextInfo>,
    pub current_context: Option<String>,
}

/// Full detail of one context, resolved against its cluster entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct K8sContext {
    pub name: String,
    pub cluster: String,
    pub user: Option<String>,
    pub namespace: Option<String>,
    pub server: Option<String>,
}

/// Context discovery and per-context client construction.
#[async_trait::async_trait]
pub trait ConfigLoader: Send + Sync {
    fn load_contexts(&self) -> Result<LoadedContexts>;
    fn context_detail(&self, name: &str) -> Option<K8sContext>;
    /// Select `name` as current; false when the context does not exist.
    fn set_current_context(&self, name: &str) -> bool;
    /// True when a client can be built for `name` and the API server answers.
    async fn validate_context(&self, name: &str) -> bool;
    async fn make_client(&self, name: &str) -> Result<Client>;
}

/// Kubeconfig-backed loader. Reads `$KUBECONFIG` / `~/.kube/config` unless given a path.
///
/// Switching contexts only changes this process' selection; the kubeconfig file is never written.
pub struct KubeconfigLoader {
    path: Option<PathBuf>,
    current_override: RwLock<Option<String>>,
}

impl KubeconfigLoader {
    pub fn new() -> Self {
        Self { path: None, current_override: RwLock::new(None) }
    }

    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self { path: Some(path.into()), current_override: RwLock::new(None) }
    }

    fn read(&self) -> Result<Kubeconfig> {
        match &self.path {
            Some(p) => Kubeconfig::read_from(p).with_context(|| format!("reading kubeconfig at {}", p.display())),
            None => Kubeconfig::read().context("reading kubeconfig"),
        }
    }

    fn current(&self, kc: &Kubeconfig) -> Option<String> {
        let over = self.current_override.read().unwrap_or_else(|p| p.into_inner()).clone();
        over.or_else(|| kc.current_context.clone())
    }
}

impl Default for KubeconfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

// Kubeconfig entries are read through their serde form so optional fields stay optional
// across kube releases.
fn str_at(v: &Json, ptr: &str) -> Option<String> {
    v.pointer(ptr).and_then(|s| s.as_str()).filter(|s| !s.is_empty()).map(|s| s.to_string())
}

fn summarize(kc: &Kubeconfig, current: Option<&str>) -> Vec<K8sContextInfo> {
    kc.contexts
        .iter()
        .filter_map(|nc| serde_json::to_value(nc).ok())
        .filter_map(|v| {
            let name = str_at(&v, "/name")?;
            Some(K8sContextInfo {
                is_current: current == Some(name.as_str()),
                cluster: str_at(&v, "/context/cluster").unwrap_or_default(),
                user: str_at(&v, "/context/user"),
                namespace: str_at(&v, "/context/namespace"),
                name,
            })
        })
        .collect()
}

fn cluster_server(kc: &Kubeconfig, cluster: &str) -> Option<String> {
    kc.clusters
        .iter()
        .filter_map(|c| serde_json::to_value(c).ok())
        .find(|v| str_at(v, "/name").as_deref() == Some(cluster))
        .and_then(|v| str_at(&v, "/cluster/server"))
}

#[async_trait::async_trait]
impl ConfigLoader for KubeconfigLoader {
    fn load_contexts(&self) -> Result<LoadedContexts> {
        let kc = self.read()?;
        let current_context = self.current(&kc);
        let contexts = summarize(&kc, current_context.as_deref());
        info!(count = contexts.len(), current = ?current_context, "kubeconfig: contexts loaded");
        Ok(LoadedContexts { contexts, current_context })
    }

    fn context_detail(&self, name: &str) -> Option<K8sContext> {
        let kc = match self.read() {
            Ok(kc) => kc,
            Err(e) => {
                warn!(error = %e, "kubeconfig: read failed");
                return None;
            }
        };
        let info = summarize(&kc, None).into_iter().find(|c| c.name == name)?;
        let server = cluster_server(&kc, &info.cluster);
        Some(K8sContext { name: info.name, cluster: info.cluster, user: info.user, namespace: info.namespace, server })
    }

    fn set_current_context(&self, name: &str) -> bool {
        if self.context_detail(name).is_none() {
            return false;
        }
        *self.current_override.write().unwrap_or_else(|p| p.into_inner()) = Some(name.to_string());
        info!(context = %name, "kubeconfig: current context switched");
        true
    }

    async fn validate_context(&self, name: &str) -> bool {
        let client = match self.make_client(name).await {
            Ok(c) => c,
            Err(e) => {
                debug!(context = %name, error = %e, "kubeconfig: context invalid");
                return false;
            }
        };
        match tokio::time::timeout(VALIDATE_TIMEOUT, client.apiserver_version()).await {
            Ok(Ok(v)) => {
                debug!(context = %name, version = %v.git_version, "kubeconfig: context reachable");
                true
            }
            Ok(Err(e)) => {
                debug!(context = %name, error = %e, "kubeconfig: api server error");
                false
            }
            Err(_) => {
                debug!(context = %name, "kubeconfig: api server timed out");
                false
            }
        }
    }

    async fn make_client(&self, name: &str) -> Result<Client> {
        let kc = self.read()?;
        if !kc.contexts.iter().any(|c| c.name == name) {
            return Err(anyhow!("context not found in kubeconfig: {}", name));
        }
        let opts = KubeConfigOptions { context: Some(name.to_string()), cluster: None, user: None };
        let cfg = kube::Config::from_custom_kubeconfig(kc, &opts)
            .await
            .with_context(|| format!("building config for context {}", name))?;
        Client::try_from(cfg).with_context(|| format!("building client for context {}", name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KUBECONFIG: &str = r#"
apiVersion: v1
kind: Config
current-context: dev
clusters:
- name: dev-cluster
  cluster:
    server: https://127.0.0.1:6443
- name: prod-cluster
  cluster:
    server: https://prod.example.com
contexts:
- name: dev
  context:
    cluster: dev-cluster
    user: dev-user
    namespace: apps
- name: prod
  context:
    cluster: prod-cluster
    user: prod-user
users:
- name: dev-user
  user:
    token: abc
- name: prod-user
  user:
    token: def
"#;

    fn loader(tag: &str) -> (KubeconfigLoader, PathBuf) {
        let path = std::env::temp_dir().join(format!("ksync-kubeconfig-{}-{}.yaml", tag, std::process::id()));
        std::fs::write(&path, KUBECONFIG).unwrap();
        (KubeconfigLoader::from_path(&path), path)
    }

    #[test]
    fn loads_contexts_and_detail() {
        let (l, path) = loader("load");
        let loaded = l.load_contexts().unwrap();
        assert_eq!(loaded.current_context.as_deref(), Some("dev"));
        assert_eq!(loaded.contexts.len(), 2);
        let dev = loaded.contexts.iter().find(|c| c.name == "dev").unwrap();
        assert!(dev.is_current);
        assert_eq!(dev.cluster, "dev-cluster");
        assert_eq!(dev.namespace.as_deref(), Some("apps"));

        let prod = l.context_detail("prod").unwrap();
        assert_eq!(prod.server.as_deref(), Some("https://prod.example.com"));
        assert!(l.context_detail("nope").is_none());
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn switch_context_is_in_memory() {
        let (l, path) = loader("switch");
        assert!(!l.set_current_context("missing"));
        assert!(l.set_current_context("prod"));
        let loaded = l.load_contexts().unwrap();
        assert_eq!(loaded.current_context.as_deref(), Some("prod"));
        assert!(std::fs::read_to_string(&path).unwrap().contains("current-context: dev"));
        let _ = std::fs::remove_file(path);
    }
}
