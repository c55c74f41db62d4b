use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use ksync_core::PoolEvent;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Fan-out of pool events. Unbounded queues: a slow subscriber never loses events,
/// so per-key order reaches every subscriber intact.
#[derive(Default)]
pub(crate) struct EventHub {
    subs: Mutex<Vec<(SubscriptionId, mpsc::UnboundedSender<PoolEvent>)>>,
    next_id: AtomicU64,
}

impl EventHub {
    pub(crate) fn subscribe(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<PoolEvent>) {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        self.subs.lock().unwrap_or_else(|p| p.into_inner()).push((id, tx));
        (id, rx)
    }

    pub(crate) fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.subs.lock().unwrap_or_else(|p| p.into_inner());
        let before = subs.len();
        subs.retain(|(sid, _)| *sid != id);
        subs.len() != before
    }

    /// Send `ev` unless `live` is cancelled. The check and the send happen under the
    /// subscriber lock, so nothing gets through once [`EventHub::close`] has returned.
    pub(crate) fn emit_live(&self, live: &CancellationToken, ev: PoolEvent) -> bool {
        let mut subs = self.subs.lock().unwrap_or_else(|p| p.into_inner());
        if live.is_cancelled() {
            return false;
        }
        subs.retain(|(id, tx)| {
            let open = tx.send(ev.clone()).is_ok();
            if !open {
                debug!(subscription = ?id, "pool: dropping closed subscriber");
            }
            open
        });
        true
    }

    /// Cancel `live`, waiting out any emit currently in flight for it.
    pub(crate) fn close(&self, live: &CancellationToken) {
        let _subs = self.subs.lock().unwrap_or_else(|p| p.into_inner());
        live.cancel();
    }

    pub(crate) fn len(&self) -> usize {
        self.subs.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}
