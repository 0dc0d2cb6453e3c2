use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::models::Order;
use crate::store::OrderStore;

/// A bounded-freshness, process-local view of active orders used by the
/// scan loop. Never mutated in place — a refresh always replaces the whole
/// vector rather than patching it, so a reader holding a clone never sees a
/// partially-updated snapshot.
pub struct SnapshotCache {
    orders: Vec<Arc<Order>>,
    fetched_at: Option<Instant>,
    validity: Duration,
}

impl SnapshotCache {
    pub fn new(validity: Duration) -> Self {
        Self {
            orders: Vec::new(),
            fetched_at: None,
            validity,
        }
    }

    /// Returns the cached vector if fresh, otherwise queries the store and
    /// replaces the cache. On store failure, returns the previous vector —
    /// safe because the Committer re-reads inside its own transaction.
    pub async fn get(&mut self, store: &dyn OrderStore) -> Vec<Arc<Order>> {
        let is_fresh = self
            .fetched_at
            .is_some_and(|t| t.elapsed() < self.validity);

        if is_fresh {
            return self.orders.clone();
        }

        match store.find_active_orders().await {
            Ok(orders) => {
                self.orders = orders.into_iter().map(Arc::new).collect();
                self.fetched_at = Some(Instant::now());
            }
            Err(err) => {
                warn!(error = %err, "snapshot refresh failed, serving stale cache");
            }
        }

        self.orders.clone()
    }

    /// Wipes `fetched_at`, forcing the next `get` to refresh.
    pub fn invalidate(&mut self) {
        self.fetched_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeStore;

    #[tokio::test]
    async fn serves_stale_cache_on_store_failure() {
        let store = FakeStore::new();
        let mut cache = SnapshotCache::new(Duration::from_secs(30));

        let first = cache.get(&store).await;
        assert!(first.is_empty());

        store.fail_next_find();
        cache.invalidate();
        let second = cache.get(&store).await;
        assert_eq!(second.len(), first.len());
    }

    #[tokio::test]
    async fn does_not_refetch_within_validity_window() {
        let store = FakeStore::new();
        let mut cache = SnapshotCache::new(Duration::from_secs(30));
        cache.get(&store).await;
        store.fail_next_find();
        // Still within the validity window, so the failure is never hit.
        let _ = cache.get(&store).await;
    }
}
