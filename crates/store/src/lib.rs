//! ksync store: per (context, resourceType) delta calculator.
//!
//! Keeps a sanitized snapshot of every resource seen, turns resource events into ADD/UPDATE/DELETE
//! deltas and coalesces them into throttled batches.

#![forbid(unsafe_code)]

use std::time::Duration;

mod calculator;
mod scheduler;

pub use calculator::{BatchCallback, CalculatorStats, DeltaCalculator, ResourceSnapshot};

/// Batching knobs shared by every calculator a pusher creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalculatorOptions {
    pub throttle_window: Duration,
    pub max_batch_size: usize,
}

impl Default for CalculatorOptions {
    fn default() -> Self {
        Self { throttle_window: Duration::from_millis(150), max_batch_size: 75 }
    }
}

impl CalculatorOptions {
    pub fn new(throttle_window: Duration, max_batch_size: usize) -> Self {
        Self { throttle_window, max_batch_size }.normalized()
    }

    /// Defaults overridden by `KSYNC_THROTTLE_MS` and `KSYNC_MAX_BATCH`.
    pub fn from_env() -> Self {
        let d = Self::default();
        let throttle_window = std::env::var("KSYNC_THROTTLE_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(d.throttle_window);
        let max_batch_size =
            std::env::var("KSYNC_MAX_BATCH").ok().and_then(|s| s.parse::<usize>().ok()).unwrap_or(d.max_batch_size);
        Self::new(throttle_window, max_batch_size)
    }

    /// Both knobs must be positive.
    pub fn normalized(self) -> Self {
        Self {
            throttle_window: self.throttle_window.max(Duration::from_millis(1)),
            max_batch_size: self.max_batch_size.max(1),
        }
    }
}
