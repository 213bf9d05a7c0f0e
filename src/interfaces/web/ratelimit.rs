//! Fixed-window rate limiting for inbound webhooks, keyed by
//! (plugin, organization). Counters reset lazily on the first request
//! after window expiry; a scheduled job prunes entries for keys that
//! went quiet.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::core::store::now_ms;

struct RateLimitEntry {
    count: u32,
    window_reset_ms: u64,
}

pub struct RateLimiter {
    entries: Mutex<HashMap<(String, String), RateLimitEntry>>,
    max_requests: u32,
    window_ms: u64,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window_secs: u64) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            max_requests,
            window_ms: window_secs * 1000,
        })
    }

    /// Count one request against the key. Returns false once the window
    /// budget is spent.
    pub async fn check(&self, plugin_id: &str, organization_id: &str) -> bool {
        self.check_at(plugin_id, organization_id, now_ms()).await
    }

    async fn check_at(&self, plugin_id: &str, organization_id: &str, now: u64) -> bool {
        let key = (plugin_id.to_string(), organization_id.to_string());
        let mut entries = self.entries.lock().await;
        let entry = entries.entry(key).or_insert(RateLimitEntry {
            count: 0,
            window_reset_ms: now + self.window_ms,
        });
        if now >= entry.window_reset_ms {
            entry.count = 0;
            entry.window_reset_ms = now + self.window_ms;
        }
        if entry.count >= self.max_requests {
            return false;
        }
        entry.count += 1;
        true
    }

    /// Drop entries whose window has passed. Invoked by a scheduler job.
    pub async fn prune_expired(&self) -> usize {
        self.prune_expired_at(now_ms()).await
    }

    async fn prune_expired_at(&self, now: u64) -> usize {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.window_reset_ms > now);
        before - entries.len()
    }

    pub async fn tracked_keys(&self) -> usize {
        self.entries.lock().await.len()
    }
}
