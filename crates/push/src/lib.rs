//! ksync push: routes informer pool events to per-key delta calculators and delivers finished
//! batches to a push sink (the UI transport).

#![forbid(unsafe_code)]

use anyhow::Result;
use ksync_core::{DeltaBatch, ResourceDelta, KNOWN_RESOURCE_TYPES};
use ksync_store::CalculatorOptions;
use serde::{Deserialize, Serialize};

mod pusher;

pub use pusher::{DeltaPusher, PusherStatistics};

/// Channel every batch is sent on.
pub const RESOURCE_DELTA_CHANNEL: &str = "resource-delta-batch";

/// Receiver of finished batches. Implementations need not be thread-safe beyond `Send + Sync`:
/// the pusher never calls `send` concurrently.
pub trait PushSink: Send + Sync {
    /// `false` once the receiving side is gone; sends are skipped.
    fn is_alive(&self) -> bool;
    fn send(&self, channel: &str, payload: &BatchPayload) -> Result<()>;
}

/// A [`DeltaBatch`] plus the key it was cut for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchPayload {
    pub context_name: String,
    pub resource_type: String,
    pub timestamp: i64,
    pub deltas: Vec<ResourceDelta>,
    pub total_changes: usize,
}

impl BatchPayload {
    pub fn new(context_name: &str, resource_type: &str, batch: DeltaBatch) -> Self {
        Self {
            context_name: context_name.to_string(),
            resource_type: resource_type.to_string(),
            timestamp: batch.timestamp,
            deltas: batch.deltas,
            total_changes: batch.total_changes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PusherOptions {
    /// Applied to every calculator the pusher creates.
    pub calculator: CalculatorOptions,
    /// Kinds whose batches are delivered. Other kinds are still tracked, never pushed.
    pub watched_kinds: Vec<String>,
}

impl Default for PusherOptions {
    fn default() -> Self {
        Self {
            calculator: CalculatorOptions::default(),
            watched_kinds: KNOWN_RESOURCE_TYPES.iter().map(|k| k.to_string()).collect(),
        }
    }
}

impl PusherOptions {
    pub fn from_env() -> Self {
        Self { calculator: CalculatorOptions::from_env(), ..Self::default() }
    }
}
