//! Process-wide rate-limit backpressure
//!
//! When any job receives a rate-limit signal from the source, the whole
//! process pauses: no new job may start until the pause expires. The gate is
//! a shared value object injected into the orchestrator rather than a
//! module-level global, so tests can construct and inspect it directly.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;
use tracing::warn;

/// Pause applied when the source gives no Retry-After hint
pub const DEFAULT_PAUSE_SECS: u64 = 300;

/// Shared pause-until state, cloned into every worker
#[derive(Debug, Clone, Default)]
pub struct RateLimitGate {
    paused_until: Arc<RwLock<Option<DateTime<Utc>>>>,
}

/// Snapshot of the gate for status reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct RateLimitStatus {
    pub is_limited: bool,
    pub remaining_seconds: i64,
}

impl RateLimitGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pause all jobs for `retry_after_secs`, or the default when the source
    /// gave no hint. A longer existing pause is never shortened.
    pub async fn pause_for(&self, retry_after_secs: Option<u64>) {
        let secs = retry_after_secs.unwrap_or(DEFAULT_PAUSE_SECS);
        let until = Utc::now() + Duration::seconds(secs as i64);

        let mut guard = self.paused_until.write().await;
        match *guard {
            Some(existing) if existing >= until => {}
            _ => {
                warn!(pause_secs = secs, until = %until, "rate limited, pausing all jobs");
                *guard = Some(until);
            }
        }
    }

    /// Whether jobs are currently suppressed
    pub async fn is_limited(&self) -> bool {
        match *self.paused_until.read().await {
            Some(until) => until > Utc::now(),
            None => false,
        }
    }

    /// Seconds left on the pause, zero when unpaused
    pub async fn remaining_seconds(&self) -> i64 {
        match *self.paused_until.read().await {
            Some(until) => (until - Utc::now()).num_seconds().max(0),
            None => 0,
        }
    }

    /// Clear the pause regardless of expiry
    pub async fn clear(&self) {
        *self.paused_until.write().await = None;
    }

    /// Status snapshot for the control surface
    pub async fn status(&self) -> RateLimitStatus {
        RateLimitStatus {
            is_limited: self.is_limited().await,
            remaining_seconds: self.remaining_seconds().await,
        }
    }
}
