//! Lease liveness rules shared by every store

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Default staleness threshold (5 minutes).
pub const DEFAULT_STALE_AFTER_SECS: u64 = 300;

/// Default number of claims before a stale batch is failed instead of reset.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;

/// Thresholds applied by the reaper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReapPolicy {
    pub stale_after: Duration,
    pub max_attempts: i32,
}

impl Default for ReapPolicy {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(DEFAULT_STALE_AFTER_SECS),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl ReapPolicy {
    /// Whether a claim whose last heartbeat was at `heartbeat_at` is dead at `now`.
    pub fn is_stale(&self, heartbeat_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        is_stale(heartbeat_at, now, self.stale_after)
    }

    /// Whether a stale claim has used up its attempts.
    pub fn is_exhausted(&self, attempt_count: i32) -> bool {
        attempt_count >= self.max_attempts
    }
}

/// A dead worker sends nothing; silence longer than `stale_after` is the only signal.
pub fn is_stale(heartbeat_at: DateTime<Utc>, now: DateTime<Utc>, stale_after: Duration) -> bool {
    match chrono::Duration::from_std(stale_after) {
        Ok(threshold) => now.signed_duration_since(heartbeat_at) > threshold,
        // Out of chrono's range: nothing can be that old.
        Err(_) => false,
    }
}

/// Reaper outcome for one pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReapReport {
    /// Stale claims returned to `claimable`.
    pub reset: u64,
    /// Stale claims moved to `failed` with attempts exhausted.
    pub exhausted: u64,
}

impl ReapReport {
    pub fn is_empty(&self) -> bool {
        self.reset == 0 && self.exhausted == 0
    }
}
