use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use ksync_push::{BatchPayload, PushSink};
use tracing::warn;

/// Writes one JSON line per batch to stdout: `{"channel": ..., "payload": {...}}`.
/// Goes dead after the first failed write (closed pipe).
pub struct StdoutSink {
    alive: AtomicBool,
}

impl StdoutSink {
    pub fn new() -> Self {
        Self { alive: AtomicBool::new(true) }
    }
}

impl Default for StdoutSink {
    fn default() -> Self {
        Self::new()
    }
}

impl PushSink for StdoutSink {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    fn send(&self, channel: &str, payload: &BatchPayload) -> Result<()> {
        let line = serde_json::to_string(&serde_json::json!({ "channel": channel, "payload": payload }))
            .context("serializing batch")?;
        let mut out = std::io::stdout().lock();
        if let Err(e) = writeln!(out, "{}", line).and_then(|_| out.flush()) {
            self.alive.store(false, Ordering::Relaxed);
            warn!(error = %e, "stdout closed; no further batches will be written");
            return Err(e).context("writing batch to stdout");
        }
        Ok(())
    }
}
