//! Process-local read-through view of per-channel slowmode configuration.
//!
//! Entries never expire on their own. Whoever mutates a channel's config calls
//! [`SlowmodeCache::invalidate`]; the next lookup refetches from the store.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::slowmode_store::{LeaseStore, LeaseStoreResult, SlowmodeConfig};

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, Option<SlowmodeConfig>>,
    channel_generations: HashMap<String, u64>,
    global_generation: u64,
}

impl CacheState {
    fn generation_of(&self, channel_id: &str) -> (u64, u64) {
        (
            self.global_generation,
            self.channel_generations
                .get(channel_id)
                .copied()
                .unwrap_or(0),
        )
    }
}

/// Memoizes `LeaseStore::load_config`, including "no config" answers.
pub struct SlowmodeCache {
    store: Arc<dyn LeaseStore>,
    state: RwLock<CacheState>,
}

impl SlowmodeCache {
    pub fn new(store: Arc<dyn LeaseStore>) -> Self {
        Self {
            store,
            state: RwLock::new(CacheState::default()),
        }
    }

    fn read_state(&self) -> RwLockReadGuard<'_, CacheState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, CacheState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the cached answer for `channel_id`, loading it on a miss.
    /// Store failures are returned to the caller and nothing is cached.
    pub async fn get(&self, channel_id: &str) -> LeaseStoreResult<Option<SlowmodeConfig>> {
        let generation = {
            let state = self.read_state();
            if let Some(entry) = state.entries.get(channel_id) {
                return Ok(entry.clone());
            }
            state.generation_of(channel_id)
        };

        let loaded = self.store.load_config(channel_id).await?;

        let mut state = self.write_state();
        if state.generation_of(channel_id) == generation {
            state
                .entries
                .insert(channel_id.to_string(), loaded.clone());
        } else {
            // Invalidated while loading; the next lookup refetches.
            tracing::debug!(channel_id, "dropping slowmode config loaded across invalidation");
        }
        Ok(loaded)
    }

    /// Cached answer without touching the store.
    pub fn peek(&self, channel_id: &str) -> Option<Option<SlowmodeConfig>> {
        self.read_state().entries.get(channel_id).cloned()
    }

    pub fn invalidate(&self, channel_id: &str) {
        let mut state = self.write_state();
        state.entries.remove(channel_id);
        let generation = state
            .channel_generations
            .entry(channel_id.to_string())
            .or_insert(0);
        *generation = generation.wrapping_add(1);
    }

    pub fn invalidate_all(&self) {
        let mut state = self.write_state();
        state.entries.clear();
        state.global_generation = state.global_generation.wrapping_add(1);
    }

    pub fn cached_len(&self) -> usize {
        self.read_state().entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::SlowmodeCache;
    use crate::{
        ActiveLease, InMemoryLeaseStore, LeaseCreation, LeaseStore, LeaseStoreError,
        LeaseStoreResult, NewLease, SlowmodeConfig,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::Notify;

    /// Counts config loads and can park them until released.
    #[derive(Default)]
    struct CountingStore {
        inner: InMemoryLeaseStore,
        loads: AtomicUsize,
        fail_loads: std::sync::atomic::AtomicBool,
        gate: Option<Arc<Notify>>,
    }

    #[async_trait]
    impl LeaseStore for CountingStore {
        async fn load_config(&self, channel_id: &str) -> LeaseStoreResult<Option<SlowmodeConfig>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.fail_loads.load(Ordering::SeqCst) {
                return Err(LeaseStoreError::Unavailable("config backend offline".into()));
            }
            self.inner.load_config(channel_id).await
        }
        async fn save_config(&self, config: SlowmodeConfig) -> LeaseStoreResult<()> {
            self.inner.save_config(config).await
        }
        async fn delete_config(&self, channel_id: &str) -> LeaseStoreResult<bool> {
            self.inner.delete_config(channel_id).await
        }
        async fn list_configs(&self) -> LeaseStoreResult<Vec<SlowmodeConfig>> {
            self.inner.list_configs().await
        }
        async fn lease_record(
            &self,
            channel_id: &str,
            user_id: &str,
        ) -> LeaseStoreResult<Option<ActiveLease>> {
            self.inner.lease_record(channel_id, user_id).await
        }
        async fn create_lease(&self, request: NewLease) -> LeaseStoreResult<LeaseCreation> {
            self.inner.create_lease(request).await
        }
        async fn delete_lease(&self, lease_id: &str) -> LeaseStoreResult<bool> {
            self.inner.delete_lease(lease_id).await
        }
        async fn list_leases(
            &self,
            channel_id: Option<&str>,
        ) -> LeaseStoreResult<Vec<ActiveLease>> {
            self.inner.list_leases(channel_id).await
        }
        async fn expired_leases(&self, now_unix_ms: u64) -> LeaseStoreResult<Vec<ActiveLease>> {
            self.inner.expired_leases(now_unix_ms).await
        }
    }

    #[tokio::test]
    async fn unit_absent_config_is_cached() {
        let store = Arc::new(CountingStore::default());
        let cache = SlowmodeCache::new(store.clone());

        assert!(cache.get("c-1").await.expect("first").is_none());
        assert!(cache.get("c-1").await.expect("second").is_none());
        assert_eq!(store.loads.load(Ordering::SeqCst), 1);
        assert_eq!(cache.peek("c-1"), Some(None));
    }

    #[tokio::test]
    async fn functional_invalidate_refetches_updated_config() {
        let store = Arc::new(CountingStore::default());
        let cache = SlowmodeCache::new(store.clone());
        assert!(cache.get("c-1").await.expect("miss").is_none());

        store
            .save_config(SlowmodeConfig::new("c-1", 10))
            .await
            .expect("save");
        assert!(cache.get("c-1").await.expect("stale hit").is_none());

        cache.invalidate("c-1");
        let refreshed = cache.get("c-1").await.expect("refetch").expect("config");
        assert_eq!(refreshed.slowmode_seconds, 10);
        assert_eq!(store.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unit_store_failure_is_not_cached() {
        let store = Arc::new(CountingStore::default());
        store.fail_loads.store(true, Ordering::SeqCst);
        let cache = SlowmodeCache::new(store.clone());

        assert!(cache.get("c-1").await.is_err());
        assert_eq!(cache.cached_len(), 0);

        store.fail_loads.store(false, Ordering::SeqCst);
        assert!(cache.get("c-1").await.expect("recovered").is_none());
        assert_eq!(store.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn regression_load_racing_invalidate_does_not_repopulate_stale_entry() {
        let gate = Arc::new(Notify::new());
        let store = Arc::new(CountingStore {
            gate: Some(Arc::clone(&gate)),
            ..CountingStore::default()
        });
        let cache = Arc::new(SlowmodeCache::new(store.clone()));

        let pending = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.get("c-1").await })
        };
        while store.loads.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        cache.invalidate("c-1");
        gate.notify_one();
        let loaded = pending.await.expect("join").expect("load");
        assert!(loaded.is_none());
        assert_eq!(cache.peek("c-1"), None);
    }

    #[tokio::test]
    async fn unit_invalidate_all_clears_entries() {
        let store = Arc::new(CountingStore::default());
        let cache = SlowmodeCache::new(store);
        cache.get("c-1").await.expect("c-1");
        cache.get("c-2").await.expect("c-2");
        assert_eq!(cache.cached_len(), 2);
        cache.invalidate_all();
        assert_eq!(cache.cached_len(), 0);
    }
}
