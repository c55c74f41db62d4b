use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use json_patch::Patch;
use ksync_core::sanitize::{is_version_path, sanitize};
use ksync_core::{
    now_millis, DeltaBatch, DeltaType, EventType, InformerKey, Resource, ResourceDelta, ResourceEvent, Uid,
};
use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use tracing::{debug, trace, warn};

use crate::scheduler::Scheduler;
use crate::CalculatorOptions;

/// Receives every finished batch. Runs on whichever task flushed; must not call back into the
/// calculator that invoked it.
pub type BatchCallback = Arc<dyn Fn(DeltaBatch) + Send + Sync>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CalculatorStats {
    pub cached_resources: usize,
    pub total_changes_processed: u64,
    pub pending_deltas: usize,
}

/// Sanitized copy of one resource as last seen by the calculator.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceSnapshot {
    pub uid: Uid,
    pub sanitized: Json,
    /// Epoch millis.
    pub last_updated: i64,
}

#[derive(Default)]
struct Inner {
    snapshots: FxHashMap<Uid, ResourceSnapshot>,
    scheduler: Scheduler,
    total_changes: u64,
}

/// Turns resource events for one (context, resourceType) into throttled delta batches.
///
/// Cloning yields another handle to the same calculator.
#[derive(Clone)]
pub struct DeltaCalculator {
    key: Arc<InformerKey>,
    options: CalculatorOptions,
    inner: Arc<Mutex<Inner>>,
    /// Held across "take pending, run callback" so batches leave in the order they were cut.
    emit: Arc<Mutex<()>>,
    on_batch: BatchCallback,
}

enum Change {
    Add(Json),
    Update(Patch),
    Delete,
    Noop,
}

impl DeltaCalculator {
    pub fn new(key: InformerKey, options: CalculatorOptions, on_batch: BatchCallback) -> Self {
        Self {
            key: Arc::new(key),
            options: options.normalized(),
            inner: Arc::new(Mutex::new(Inner::default())),
            emit: Arc::new(Mutex::new(())),
            on_batch,
        }
    }

    pub fn key(&self) -> &InformerKey {
        &self.key
    }

    pub fn options(&self) -> CalculatorOptions {
        self.options
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_emit(&self) -> MutexGuard<'_, ()> {
        self.emit.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Fold one event into the snapshot cache and queue the resulting delta, if any.
    /// Events for resources without a uid are ignored.
    pub fn process_event(&self, event: &ResourceEvent, resource_type: &str) {
        let Some(uid) = event.resource.uid().map(str::to_string) else {
            trace!(key = %self.key, "delta: event without uid dropped");
            return;
        };
        let _order = self.lock_emit();
        let ready = {
            let mut inner = self.lock_inner();
            let change = match event.event_type {
                EventType::Deleted => {
                    inner.snapshots.remove(&uid);
                    Change::Delete
                }
                EventType::Added | EventType::Modified => {
                    let sanitized = sanitize(&event.resource.raw);
                    let previous = inner.snapshots.get(&uid).map(|s| &s.sanitized);
                    let change = classify(previous, &sanitized);
                    // version-only bumps still refresh the snapshot
                    if previous != Some(&sanitized) {
                        let snap = ResourceSnapshot { uid: uid.clone(), sanitized, last_updated: now_millis() };
                        inner.snapshots.insert(uid.clone(), snap);
                    }
                    change
                }
            };
            metrics::counter!("delta_events_total", 1u64);
            let delta = match change {
                Change::Noop => {
                    metrics::counter!("delta_noop_updates_total", 1u64);
                    trace!(key = %self.key, uid = %uid, "delta: no semantic change");
                    return;
                }
                Change::Add(full) => self.delta(DeltaType::Add, uid, &event.resource, resource_type, None, Some(full)),
                Change::Update(p) => self.delta(DeltaType::Update, uid, &event.resource, resource_type, Some(p), None),
                Change::Delete => self.delta(DeltaType::Delete, uid, &event.resource, resource_type, None, None),
            };
            inner.scheduler.push(delta);
            inner.total_changes += 1;
            if inner.scheduler.len() >= self.options.max_batch_size {
                Some(inner.scheduler.drain())
            } else {
                if !inner.scheduler.is_armed() {
                    self.arm_timer(&mut inner);
                }
                None
            }
        };
        if let Some(deltas) = ready {
            self.emit_batch(deltas, "size");
        }
    }

    fn delta(
        &self,
        delta_type: DeltaType,
        uid: Uid,
        resource: &Resource,
        resource_type: &str,
        patches: Option<Patch>,
        full_resource: Option<Json>,
    ) -> ResourceDelta {
        ResourceDelta {
            delta_type,
            uid,
            context_name: self.key.context_name.clone(),
            resource_type: resource_type.to_string(),
            name: resource.name().to_string(),
            namespace: resource.namespace().map(str::to_string),
            patches,
            full_resource,
        }
    }

    fn arm_timer(&self, inner: &mut Inner) {
        let Ok(rt) = tokio::runtime::Handle::try_current() else {
            warn!(key = %self.key, "delta: no runtime for throttle timer; waiting for manual flush");
            return;
        };
        let window = self.options.throttle_window;
        let generation = inner.scheduler.arm(Instant::now() + window);
        let this = self.clone();
        let handle = rt.spawn(async move {
            tokio::time::sleep(window).await;
            this.on_timer(generation);
        });
        inner.scheduler.set_timer(handle);
    }

    fn on_timer(&self, generation: u64) {
        let _order = self.lock_emit();
        let fired = self.lock_inner().scheduler.fire(generation);
        if let Some(deltas) = fired {
            self.emit_batch(deltas, "timer");
        }
    }

    /// Caller holds the emit lock and has released the state lock.
    fn emit_batch(&self, deltas: Vec<ResourceDelta>, cause: &'static str) {
        if deltas.is_empty() {
            return;
        }
        let batch = DeltaBatch::new(deltas);
        metrics::counter!("delta_batches_total", 1u64);
        metrics::histogram!("delta_batch_size", batch.total_changes as f64);
        debug!(key = %self.key, size = batch.total_changes, cause, "delta: batch ready");
        (self.on_batch)(batch);
    }

    /// Emit whatever is pending now. No-op when nothing is pending.
    pub fn flush(&self) {
        let _order = self.lock_emit();
        let deltas = self.lock_inner().scheduler.drain();
        self.emit_batch(deltas, "flush");
    }

    pub fn snapshot(&self, uid: &str) -> Option<ResourceSnapshot> {
        self.lock_inner().snapshots.get(uid).cloned()
    }

    pub fn get_stats(&self) -> CalculatorStats {
        let inner = self.lock_inner();
        CalculatorStats {
            cached_resources: inner.snapshots.len(),
            total_changes_processed: inner.total_changes,
            pending_deltas: inner.scheduler.len(),
        }
    }

    /// Forget every snapshot and drop pending deltas without emitting them.
    pub fn clear_cache(&self) {
        let _order = self.lock_emit();
        let mut inner = self.lock_inner();
        inner.snapshots.clear();
        inner.scheduler.clear();
    }

    pub fn destroy(&self) {
        self.clear_cache();
        debug!(key = %self.key, "delta: calculator destroyed");
    }
}

/// Decide what a new sanitized object means relative to the cached one.
fn classify(previous: Option<&Json>, next: &Json) -> Change {
    let Some(prev) = previous else {
        return Change::Add(next.clone());
    };
    if prev == next {
        return Change::Noop;
    }
    let patch = json_patch::diff(prev, next);
    if patch.0.is_empty() || only_version_bumps(&patch) {
        return Change::Noop;
    }
    Change::Update(patch)
}

fn only_version_bumps(patch: &Patch) -> bool {
    patch.0.iter().all(|op| {
        serde_json::to_value(op)
            .ok()
            .and_then(|v| v.get("path").and_then(|p| p.as_str()).map(is_version_path))
            .unwrap_or(false)
    })
}
