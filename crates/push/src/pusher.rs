use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};

use ksync_core::{DeltaBatch, InformerKey, PoolEvent, ResourceEvent};
use ksync_informer::{InformerPool, SubscriptionId};
use ksync_store::{CalculatorStats, DeltaCalculator};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::{BatchPayload, PushSink, PusherOptions, RESOURCE_DELTA_CHANNEL};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PusherStatistics {
    pub total_calculators: usize,
    /// Keyed by `"<context>:<resourceType>"`.
    pub calculators: BTreeMap<String, CalculatorStats>,
}

/// Where batches go. Calculator callbacks hold this, not the pusher.
struct Outlet {
    /// Locked for the whole send so the sink never sees concurrent calls.
    sink: Mutex<Option<Arc<dyn PushSink>>>,
    watched: FxHashSet<String>,
}

impl Outlet {
    fn sink(&self) -> MutexGuard<'_, Option<Arc<dyn PushSink>>> {
        self.sink.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn push(&self, key: &InformerKey, batch: DeltaBatch) {
        if !self.watched.contains(&key.resource_type) {
            trace!(key = %key, "push: kind not watched; batch kept local");
            return;
        }
        let guard = self.sink();
        let Some(sink) = guard.as_ref() else {
            trace!(key = %key, "push: no sink registered");
            return;
        };
        if !sink.is_alive() {
            debug!(key = %key, "push: sink is gone; batch dropped");
            return;
        }
        let size = batch.total_changes;
        let payload = BatchPayload::new(&key.context_name, &key.resource_type, batch);
        match catch_unwind(AssertUnwindSafe(|| sink.send(RESOURCE_DELTA_CHANNEL, &payload))) {
            Ok(Ok(())) => {
                metrics::counter!("push_batches_total", 1u64);
                trace!(key = %key, size, "push: batch sent");
            }
            Ok(Err(e)) => {
                metrics::counter!("push_errors_total", 1u64);
                warn!(key = %key, size, error = %format!("{:#}", e), "push: send failed");
            }
            Err(_) => {
                metrics::counter!("push_errors_total", 1u64);
                warn!(key = %key, size, "push: sink panicked during send");
            }
        }
    }
}

/// Wires an [`InformerPool`] to lazily created [`DeltaCalculator`]s and a [`PushSink`].
///
/// Must be created inside a tokio runtime; it spawns the task that drains the pool subscription.
pub struct DeltaPusher {
    pool: Arc<InformerPool>,
    options: PusherOptions,
    outlet: Arc<Outlet>,
    calculators: Mutex<FxHashMap<InformerKey, DeltaCalculator>>,
    subscription: Mutex<Option<(SubscriptionId, JoinHandle<()>)>>,
}

impl DeltaPusher {
    pub fn new(pool: Arc<InformerPool>, options: PusherOptions) -> Arc<Self> {
        let outlet = Arc::new(Outlet {
            sink: Mutex::new(None),
            watched: options.watched_kinds.iter().cloned().collect(),
        });
        let (id, mut rx) = pool.subscribe();
        let pusher = Arc::new(Self {
            pool: pool.clone(),
            options,
            outlet,
            calculators: Mutex::new(FxHashMap::default()),
            subscription: Mutex::new(None),
        });
        let weak = Arc::downgrade(&pusher);
        let handle = tokio::spawn(async move {
            while let Some(ev) = rx.recv().await {
                let Some(pusher) = weak.upgrade() else { break };
                match ev {
                    PoolEvent::Resource(e) => pusher.handle_event(&e),
                    PoolEvent::Error(e) => debug!(
                        context = %e.context_name,
                        resource_type = %e.resource_type,
                        error = %e.message,
                        "push: informer error observed"
                    ),
                }
            }
            debug!("push: subscription drained");
        });
        *pusher.subscription_slot() = Some((id, handle));
        info!(
            throttle_ms = %pusher.options.calculator.throttle_window.as_millis(),
            max_batch = pusher.options.calculator.max_batch_size,
            "push: pusher attached to pool"
        );
        pusher
    }

    fn subscription_slot(&self) -> MutexGuard<'_, Option<(SubscriptionId, JoinHandle<()>)>> {
        self.subscription.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn calculators(&self) -> MutexGuard<'_, FxHashMap<InformerKey, DeltaCalculator>> {
        self.calculators.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Register or clear the sink. Calculators keep running either way.
    pub fn set_main_window(&self, sink: Option<Arc<dyn PushSink>>) {
        let attached = sink.is_some();
        *self.outlet.sink() = sink;
        info!(attached, "push: main window updated");
    }

    pub fn has_main_window(&self) -> bool {
        self.outlet.sink().is_some()
    }

    fn calculator_for(&self, key: InformerKey) -> DeltaCalculator {
        let mut calcs = self.calculators();
        if let Some(c) = calcs.get(&key) {
            return c.clone();
        }
        let outlet = self.outlet.clone();
        let route = key.clone();
        let calc = DeltaCalculator::new(
            key.clone(),
            self.options.calculator,
            Arc::new(move |batch| outlet.push(&route, batch)),
        );
        debug!(key = %key, "push: calculator created");
        calcs.insert(key, calc.clone());
        metrics::gauge!("push_calculators", calcs.len() as f64);
        calc
    }

    /// Route one pool event to its calculator, creating it on first sight of the key.
    /// Events without a uid or kind are ignored.
    pub fn handle_event(&self, event: &ResourceEvent) {
        if event.resource.uid().is_none() {
            trace!(context = %event.context_name, "push: event without uid ignored");
            return;
        }
        let Some(kind) = event.resource.kind() else {
            trace!(context = %event.context_name, "push: event without kind ignored");
            return;
        };
        let kind = kind.to_string();
        let calc = self.calculator_for(InformerKey::new(event.context_name.clone(), kind.clone()));
        calc.process_event(event, &kind);
    }

    fn live(&self) -> Vec<DeltaCalculator> {
        self.calculators().values().cloned().collect()
    }

    pub fn flush_all(&self) {
        let calcs = self.live();
        for c in &calcs {
            c.flush();
        }
        debug!(count = calcs.len(), "push: flushed all calculators");
    }

    pub fn get_statistics(&self) -> PusherStatistics {
        let calculators: BTreeMap<String, CalculatorStats> =
            self.calculators().iter().map(|(k, c)| (k.to_string(), c.get_stats())).collect();
        PusherStatistics { total_calculators: calculators.len(), calculators }
    }

    pub fn calculator(&self, context_name: &str, resource_type: &str) -> Option<DeltaCalculator> {
        self.calculators().get(&InformerKey::new(context_name, resource_type)).cloned()
    }

    /// Destroy and forget one calculator; returns whether it existed.
    pub fn remove_calculator(&self, context_name: &str, resource_type: &str) -> bool {
        let removed = {
            let mut calcs = self.calculators();
            let removed = calcs.remove(&InformerKey::new(context_name, resource_type));
            metrics::gauge!("push_calculators", calcs.len() as f64);
            removed
        };
        match removed {
            Some(c) => {
                c.destroy();
                info!(context = %context_name, resource_type = %resource_type, "push: calculator removed");
                true
            }
            None => false,
        }
    }

    /// Detach from the pool and destroy every calculator. Safe to call repeatedly.
    pub fn destroy(&self) {
        if let Some((id, handle)) = self.subscription_slot().take() {
            self.pool.unsubscribe(id);
            handle.abort();
        }
        let calcs: Vec<DeltaCalculator> = self.calculators().drain().map(|(_, c)| c).collect();
        for c in &calcs {
            c.destroy();
        }
        metrics::gauge!("push_calculators", 0.0);
        if !calcs.is_empty() {
            info!(count = calcs.len(), "push: pusher destroyed");
        }
    }
}

impl Drop for DeltaPusher {
    fn drop(&mut self) {
        self.destroy();
    }
}
