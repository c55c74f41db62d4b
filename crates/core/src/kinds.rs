//! Registry of built-in Kubernetes kinds the desktop client knows how to show.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BuiltinKind {
    pub group: &'static str,
    pub version: &'static str,
    pub kind: &'static str,
    pub plural: &'static str,
    pub namespaced: bool,
}

const fn k(
    group: &'static str,
    version: &'static str,
    kind: &'static str,
    plural: &'static str,
    namespaced: bool,
) -> BuiltinKind {
    BuiltinKind { group, version, kind, plural, namespaced }
}

pub const BUILTIN_KINDS: &[BuiltinKind] = &[
    k("", "v1", "Pod", "pods", true),
    k("", "v1", "Node", "nodes", false),
    k("", "v1", "Namespace", "namespaces", false),
    k("", "v1", "Service", "services", true),
    k("", "v1", "ConfigMap", "configmaps", true),
    k("", "v1", "Secret", "secrets", true),
    k("", "v1", "Event", "events", true),
    k("", "v1", "Endpoints", "endpoints", true),
    k("", "v1", "ServiceAccount", "serviceaccounts", true),
    k("", "v1", "PersistentVolume", "persistentvolumes", false),
    k("", "v1", "PersistentVolumeClaim", "persistentvolumeclaims", true),
    k("apps", "v1", "Deployment", "deployments", true),
    k("apps", "v1", "ReplicaSet", "replicasets", true),
    k("apps", "v1", "StatefulSet", "statefulsets", true),
    k("apps", "v1", "DaemonSet", "daemonsets", true),
    k("batch", "v1", "Job", "jobs", true),
    k("batch", "v1", "CronJob", "cronjobs", true),
    k("networking.k8s.io", "v1", "Ingress", "ingresses", true),
    k("storage.k8s.io", "v1", "StorageClass", "storageclasses", false),
    k("autoscaling", "v2", "HorizontalPodAutoscaler", "horizontalpodautoscalers", true),
];

/// Kind names of [`BUILTIN_KINDS`], in registry order.
pub const KNOWN_RESOURCE_TYPES: &[&str] = &[
    "Pod",
    "Node",
    "Namespace",
    "Service",
    "ConfigMap",
    "Secret",
    "Event",
    "Endpoints",
    "ServiceAccount",
    "PersistentVolume",
    "PersistentVolumeClaim",
    "Deployment",
    "ReplicaSet",
    "StatefulSet",
    "DaemonSet",
    "Job",
    "CronJob",
    "Ingress",
    "StorageClass",
    "HorizontalPodAutoscaler",
];

/// Look up a built-in by kind or plural, case-insensitively ("pod", "Pods", "pods" all match Pod).
pub fn lookup(name: &str) -> Option<&'static BuiltinKind> {
    BUILTIN_KINDS.iter().find(|b| {
        b.kind.eq_ignore_ascii_case(name)
            || b.plural.eq_ignore_ascii_case(name)
            || format!("{}s", b.kind).eq_ignore_ascii_case(name)
    })
}

pub fn is_known_kind(kind: &str) -> bool {
    KNOWN_RESOURCE_TYPES.contains(&kind)
}

impl BuiltinKind {
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.to_string()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}
