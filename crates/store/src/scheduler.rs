use std::time::Instant;

use ksync_core::ResourceDelta;
use tokio::task::JoinHandle;

/// Pending deltas plus the single throttle timer that will flush them.
///
/// At most one timer is armed at a time; `generation` lets a timer that already woke up
/// recognise that it was superseded by a flush.
#[derive(Default)]
pub(crate) struct Scheduler {
    pending: Vec<ResourceDelta>,
    deadline: Option<Instant>,
    timer: Option<JoinHandle<()>>,
    generation: u64,
}

impl Scheduler {
    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn push(&mut self, d: ResourceDelta) {
        self.pending.push(d);
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Record a new timer; returns the generation it must present when firing.
    pub(crate) fn arm(&mut self, deadline: Instant) -> u64 {
        self.generation = self.generation.wrapping_add(1);
        self.deadline = Some(deadline);
        self.generation
    }

    pub(crate) fn set_timer(&mut self, handle: JoinHandle<()>) {
        self.timer = Some(handle);
    }

    /// Called from the timer task itself. `None` when the timer was superseded.
    pub(crate) fn fire(&mut self, generation: u64) -> Option<Vec<ResourceDelta>> {
        if self.deadline.is_none() || self.generation != generation {
            return None;
        }
        self.deadline = None;
        self.timer = None;
        Some(std::mem::take(&mut self.pending))
    }

    /// Take everything pending and disarm the timer.
    pub(crate) fn drain(&mut self) -> Vec<ResourceDelta> {
        self.disarm();
        std::mem::take(&mut self.pending)
    }

    /// Drop pending deltas without emitting them.
    pub(crate) fn clear(&mut self) {
        self.disarm();
        self.pending.clear();
    }

    fn disarm(&mut self) {
        self.deadline = None;
        self.generation = self.generation.wrapping_add(1);
        if let Some(t) = self.timer.take() {
            t.abort();
        }
    }
}
