use async_trait::async_trait;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// The shared key/value store used for flags, the last-run heartbeat, and
/// (by convention) pub/sub topics. Every value here is advisory: its loss
/// must never corrupt matching, only cause a cache miss or a missed
/// heartbeat read.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn set_with_ttl(&self, key: &str, value: String, ttl: Duration);
    async fn get(&self, key: &str) -> Option<String>;
    /// Publishes to the `trade:executed` pub/sub topic. Best-effort.
    async fn publish(&self, topic: &str, payload: String);
}

struct Entry {
    value: String,
    expires_at: Instant,
}

/// In-process stand-in for the real shared store (e.g. Redis): an expiring
/// key/value map plus a fire-and-forget publish. A production host can swap
/// this for a real client without the core caring, since access only ever
/// goes through `KeyValueStore`.
#[derive(Default)]
pub struct InMemoryKeyValueStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl InMemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKeyValueStore {
    async fn set_with_ttl(&self, key: &str, value: String, ttl: Duration) {
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    async fn get(&self, key: &str) -> Option<String> {
        let entries = self.entries.lock().await;
        entries.get(key).and_then(|e| {
            if e.expires_at > Instant::now() {
                Some(e.value.clone())
            } else {
                None
            }
        })
    }

    async fn publish(&self, topic: &str, payload: String) {
        tracing::debug!(topic, payload, "publish (no subscribers in-process)");
    }
}

pub const KEY_LAST_RUN: &str = "matching:last_run";
pub const KEY_HAS_ACTIVE_ORDERS: &str = "matching:has_active_orders";
