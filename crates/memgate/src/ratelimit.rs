//! Fixed-window rate limiter keyed by client fingerprint.
//!
//! Counters increase monotonically within a window; the window resets
//! (count back to 1) only when the wall clock has passed the entry's
//! reset time, never on a rolling basis. Entries expire independently
//! and a periodic sweep deletes them, bounding memory regardless of
//! traffic shape.
//!
//! The map sits behind narrow `get`/`set`/`delete`/`sweep` operations
//! so a shared backing store can replace it for multi-instance
//! deployments; this implementation is process-local by design.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use tracing::debug;

/// Result of a rate limit check.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RateLimitDecision {
    /// Whether the request is allowed.
    pub allowed: bool,
    /// The quota limit.
    pub limit: u32,
    /// Remaining requests in the current window.
    pub remaining: u32,
    /// Unix timestamp when the window resets.
    pub reset: u64,
    /// Retry-After in seconds (only set when blocked).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

/// Fixed-window entry for a single fingerprint.
#[derive(Debug, Clone)]
struct WindowEntry {
    count: u32,
    reset_at: Instant,
    /// Unix-seconds mirror of `reset_at`, for response headers.
    reset_unix: u64,
}

/// Thread-safe fixed-window rate limiter.
pub struct RateLimiter {
    entries: RwLock<HashMap<String, WindowEntry>>,
    window: Duration,
    max_requests: u32,
}

impl RateLimiter {
    pub fn new(window: Duration, max_requests: u32) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            window,
            max_requests,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Check and record a request for the given fingerprint.
    pub fn check(&self, key: &str) -> RateLimitDecision {
        let now = Instant::now();
        let mut entries = self.entries.write();

        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| WindowEntry {
                count: 0,
                reset_at: now + self.window,
                reset_unix: unix_now() + self.window.as_secs(),
            });

        // Window expired: start a fresh one with this request counted.
        if now >= entry.reset_at {
            entry.count = 1;
            entry.reset_at = now + self.window;
            entry.reset_unix = unix_now() + self.window.as_secs();
        } else {
            entry.count += 1;
        }

        if entry.count > self.max_requests {
            let retry_after = entry.reset_at.saturating_duration_since(now).as_secs().max(1);
            RateLimitDecision {
                allowed: false,
                limit: self.max_requests,
                remaining: 0,
                reset: entry.reset_unix,
                retry_after: Some(retry_after),
            }
        } else {
            RateLimitDecision {
                allowed: true,
                limit: self.max_requests,
                remaining: self.max_requests - entry.count,
                reset: entry.reset_unix,
                retry_after: None,
            }
        }
    }

    /// Read an entry's count and reset timestamp.
    pub fn get(&self, key: &str) -> Option<(u32, u64)> {
        self.entries
            .read()
            .get(key)
            .map(|e| (e.count, e.reset_unix))
    }

    /// Overwrite an entry's count, keeping its window.
    pub fn set(&self, key: &str, count: u32) {
        if let Some(entry) = self.entries.write().get_mut(key) {
            entry.count = count;
        }
    }

    /// Remove a single entry.
    pub fn delete(&self, key: &str) {
        self.entries.write().remove(key);
    }

    /// Delete all entries whose window has already expired. Returns
    /// the number removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| entry.reset_at > now);
        before - entries.len()
    }

    /// Number of live fingerprints.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

/// Derive the rate-limit map key: the first 16 hex characters of the
/// SHA-256 of the API key, or of the raw client IP when no key was
/// presented.
pub fn client_fingerprint(source: &str) -> String {
    let digest = Sha256::digest(source.as_bytes());
    hex::encode(digest)[..16].to_string()
}

/// Spawn the background sweep, independent of any single request.
pub fn spawn_sweep_task(
    limiter: Arc<RateLimiter>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let removed = limiter.sweep();
            if removed > 0 {
                debug!(removed, active = limiter.len(), "swept expired rate-limit windows");
            }
        }
    })
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
