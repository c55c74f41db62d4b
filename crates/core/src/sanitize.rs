//! Stripping of server-churned metadata before caching or diffing.

use serde_json::Value as Json;

/// Metadata fields rewritten by the API server independent of the object's content.
pub const VOLATILE_METADATA_FIELDS: &[&str] = &["managedFields", "selfLink"];

/// Annotations that only echo client-side bookkeeping.
pub const VOLATILE_ANNOTATIONS: &[&str] = &["kubectl.kubernetes.io/last-applied-configuration"];

/// Metadata fields that move on every write; a change to only these is not a semantic change.
pub const VERSION_METADATA_FIELDS: &[&str] = &["resourceVersion", "generation"];

/// Return a sanitized copy of `raw`.
pub fn sanitize(raw: &Json) -> Json {
    let mut v = raw.clone();
    strip_volatile(&mut v);
    v
}

fn strip_volatile(v: &mut Json) {
    let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) else { return };
    for f in VOLATILE_METADATA_FIELDS {
        meta.remove(*f);
    }
    let drop_annotations = match meta.get_mut("annotations").and_then(|a| a.as_object_mut()) {
        Some(ann) => {
            for a in VOLATILE_ANNOTATIONS {
                ann.remove(*a);
            }
            ann.is_empty()
        }
        None => false,
    };
    if drop_annotations {
        meta.remove("annotations");
    }
}

/// JSON pointer of a version-only metadata field, e.g. `/metadata/resourceVersion`.
pub fn is_version_path(path: &str) -> bool {
    path.strip_prefix("/metadata/")
        .map(|f| VERSION_METADATA_FIELDS.contains(&f))
        .unwrap_or(false)
}
