//! ksync core types: resource envelopes, pool events, deltas and informer state.

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

pub mod kinds;
pub mod sanitize;

pub use kinds::{is_known_kind, BuiltinKind, KNOWN_RESOURCE_TYPES};
pub use sanitize::sanitize;

/// Resource identity within a (context, resourceType) scope.
pub type Uid = String;

/// Identity and bookkeeping fields lifted out of `metadata`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceMeta {
    pub uid: Option<Uid>,
    pub name: String,
    pub namespace: Option<String>,
    pub resource_version: Option<String>,
}

/// A cluster object: typed identity fields plus the untouched JSON document.
///
/// Serializes as `raw`, so a resource round-trips through any JSON transport unchanged.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    pub kind: Option<String>,
    pub meta: Option<ResourceMeta>,
    pub raw: Json,
}

impl Resource {
    pub fn from_value(raw: Json) -> Self {
        let kind = raw.get("kind").and_then(|v| v.as_str()).map(|s| s.to_string());
        let meta = raw.get("metadata").and_then(|m| m.as_object()).map(|m| {
            let s = |k: &str| m.get(k).and_then(|v| v.as_str()).map(|s| s.to_string());
            ResourceMeta {
                uid: s("uid").filter(|u| !u.is_empty()),
                name: s("name").unwrap_or_default(),
                namespace: s("namespace"),
                resource_version: s("resourceVersion"),
            }
        });
        Self { kind, meta, raw }
    }

    pub fn uid(&self) -> Option<&str> {
        self.meta.as_ref().and_then(|m| m.uid.as_deref())
    }

    pub fn name(&self) -> &str {
        self.meta.as_ref().map(|m| m.name.as_str()).unwrap_or("")
    }

    pub fn namespace(&self) -> Option<&str> {
        self.meta.as_ref().and_then(|m| m.namespace.as_deref())
    }

    pub fn kind(&self) -> Option<&str> {
        self.kind.as_deref()
    }
}

impl From<Json> for Resource {
    fn from(raw: Json) -> Self {
        Self::from_value(raw)
    }
}

impl Serialize for Resource {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.raw.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Resource {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Json::deserialize(deserializer).map(Resource::from_value)
    }
}

/// Watch event classification as emitted by the informer pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    Added,
    Modified,
    Deleted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub resource: Resource,
    pub context_name: String,
}

impl ResourceEvent {
    pub fn new(event_type: EventType, resource: impl Into<Resource>, context_name: impl Into<String>) -> Self {
        Self { event_type, resource: resource.into(), context_name: context_name.into() }
    }
}

/// Session failure reported by one informer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InformerError {
    pub context_name: String,
    pub resource_type: String,
    pub message: String,
}

/// Everything the pool publishes to its subscribers.
#[derive(Debug, Clone)]
pub enum PoolEvent {
    Resource(ResourceEvent),
    Error(InformerError),
}

/// (context, resourceType) pair that scopes an informer and a calculator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InformerKey {
    pub context_name: String,
    pub resource_type: String,
}

impl InformerKey {
    pub fn new(context_name: impl Into<String>, resource_type: impl Into<String>) -> Self {
        Self { context_name: context_name.into(), resource_type: resource_type.into() }
    }
}

impl fmt::Display for InformerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.context_name, self.resource_type)
    }
}

/// Scope of a single watch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchOptions {
    pub context_name: String,
    pub namespace: Option<String>,
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
    /// Forced relist interval in seconds; `None` keeps the stream open until the server ends it.
    pub resync_period_secs: Option<u64>,
}

impl WatchOptions {
    pub fn for_context(context_name: impl Into<String>) -> Self {
        Self { context_name: context_name.into(), ..Default::default() }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionPhase {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Point-in-time view of one informer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InformerState {
    pub running: bool,
    pub connected: bool,
    pub connection: ConnectionPhase,
    pub resource_count: usize,
    pub error_count: u64,
    pub last_error: Option<String>,
    /// Epoch millis of the last cache mutation.
    pub last_sync_time: Option<i64>,
    pub reconnect_attempts: u64,
}

impl InformerState {
    pub fn started() -> Self {
        Self { running: true, ..Default::default() }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStatistics {
    pub total_informers: usize,
    pub running_informers: usize,
    pub total_resources: usize,
    pub total_errors: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeltaType {
    Add,
    Update,
    Delete,
}

/// Minimal description of one resource's change.
///
/// ADD carries `full_resource`, UPDATE carries a non-empty `patches`, DELETE carries neither.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDelta {
    #[serde(rename = "type")]
    pub delta_type: DeltaType,
    pub uid: Uid,
    pub context_name: String,
    pub resource_type: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patches: Option<json_patch::Patch>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_resource: Option<Json>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaBatch {
    /// Epoch millis at flush time.
    pub timestamp: i64,
    pub deltas: Vec<ResourceDelta>,
    pub total_changes: usize,
}

impl DeltaBatch {
    pub fn new(deltas: Vec<ResourceDelta>) -> Self {
        let total_changes = deltas.len();
        Self { timestamp: now_millis(), deltas, total_changes }
    }
}

/// Summary of a kubeconfig context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct K8sContextInfo {
    pub name: String,
    pub cluster: String,
    pub user: Option<String>,
    pub namespace: Option<String>,
    pub is_current: bool,
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
