//! ksync kubehub – kubeconfig contexts and the list+watch primitive.
//!
//! Everything that talks to a cluster sits behind two traits so the informer layer can be
//! driven by kube-rs in production and by [`mock`] in tests:
//! - [`ConfigLoader`] discovers contexts and builds per-context clients.
//! - [`WatchProvider`] resolves a (context, resourceType) pair into a restartable [`WatchSession`].

#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Result;
use futures::stream::BoxStream;
use ksync_core::{InformerKey, WatchOptions};
use serde_json::Value as Json;

mod config;
pub mod mock;
mod watch;

pub use config::{ConfigLoader, K8sContext, KubeconfigLoader, LoadedContexts};
pub use watch::KubeWatchProvider;

/// One item of a watch connection.
///
/// A successful [`WatchSession::start`] is the connect signal; the end of the stream is the
/// disconnect signal.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    Added(Json),
    Updated(Json),
    Deleted(Json),
    /// Full state after a (re)list; objects missing from it were deleted meanwhile.
    Relisted(Vec<Json>),
    Error(String),
}

pub type WatchStream = BoxStream<'static, WatchEvent>;

/// A resolved watch target that can be connected any number of times.
#[async_trait::async_trait]
pub trait WatchSession: Send + Sync {
    /// Open one connection. Dropping the returned stream stops it.
    async fn start(&self) -> Result<WatchStream>;
}

#[async_trait::async_trait]
pub trait WatchProvider: Send + Sync {
    /// Resolve context and resource type. Configuration problems (unknown context, unknown kind)
    /// surface here rather than as stream errors.
    async fn session(&self, key: &InformerKey, opts: &WatchOptions) -> Result<Arc<dyn WatchSession>>;
}
