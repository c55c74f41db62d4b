//! ksync informer pool – one watch session and resource cache per (context, resourceType).

#![forbid(unsafe_code)]

use std::time::Duration;

mod hub;
mod pool;
mod task;

pub use hub::SubscriptionId;
pub use pool::InformerPool;

/// Reconnection policy shared by all informers of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { backoff_base: Duration::from_millis(500), backoff_max: Duration::from_secs(30) }
    }
}

impl PoolConfig {
    /// Defaults overridden by `KSYNC_BACKOFF_BASE_MS` and `KSYNC_BACKOFF_MAX_SECS`.
    pub fn from_env() -> Self {
        let d = Self::default();
        let backoff_base = std::env::var("KSYNC_BACKOFF_BASE_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(d.backoff_base);
        let backoff_max = std::env::var("KSYNC_BACKOFF_MAX_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(d.backoff_max);
        Self { backoff_base, backoff_max: backoff_max.max(backoff_base) }
    }

    /// Delay before reconnect attempt `attempt` (0-based): exponential, capped, with jitter in
    /// the upper half so consecutive retries never collapse to zero.
    pub fn backoff(&self, attempt: u32) -> Duration {
        use rand::Rng;
        let base = self.backoff_base.as_millis().max(1) as u64;
        let cap = self.backoff_max.as_millis().max(1) as u64;
        let exp = base.saturating_mul(1u64 << attempt.min(20)).min(cap);
        let jittered = rand::thread_rng().gen_range(exp / 2..=exp);
        Duration::from_millis(jittered.max(1))
    }
}
