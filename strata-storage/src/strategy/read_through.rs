use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::{DashMap, DashSet};
use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;
use serde::{de::DeserializeOwned, Serialize};
use strata_core::{
    now_ms, CacheKey, CacheResult, DataSource, StrategyDescriptor, TaskSupervisor,
};

use super::{decode_entry, encode_entry, CacheStrategy};
use crate::storage::CacheStorage;

type SharedLoad<T> = Shared<BoxFuture<'static, CacheResult<Option<T>>>>;

/// One outstanding source load, tagged so cleanup only removes its own slot.
struct Flight<T> {
    id: u64,
    load: SharedLoad<T>,
}

/// Removes a flight from the in-flight map once the shared load itself
/// resolves or is dropped. Lives inside the load, so a joining caller keeps
/// the flight alive after the caller that started it goes away.
struct FlightGuard<T> {
    in_flight: Arc<DashMap<CacheKey, Flight<T>>>,
    key: CacheKey,
    id: u64,
}

impl<T> Drop for FlightGuard<T> {
    fn drop(&mut self) {
        self.in_flight.remove_if(&self.key, |_, flight| flight.id == self.id);
    }
}

/// Clears the refreshing marker once a background revalidation ends.
struct RefreshGuard {
    refreshing: Arc<DashSet<CacheKey>>,
    key: CacheKey,
}

impl Drop for RefreshGuard {
    fn drop(&mut self) {
        self.refreshing.remove(&self.key);
    }
}

/// Read-through cache with single-flight loading and stale-while-revalidate.
///
/// Concurrent misses on the same key share one source load. Entries past
/// the stale threshold are served immediately while one background reload
/// runs under the supervisor; its failures are logged, never returned.
pub struct ReadThroughStrategy<T> {
    storage: Arc<dyn CacheStorage>,
    source: Arc<dyn DataSource<T>>,
    descriptor: StrategyDescriptor,
    supervisor: TaskSupervisor,
    in_flight: Arc<DashMap<CacheKey, Flight<T>>>,
    refreshing: Arc<DashSet<CacheKey>>,
    next_flight: AtomicU64,
}

impl<T> ReadThroughStrategy<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub fn new(
        storage: Arc<dyn CacheStorage>,
        source: Arc<dyn DataSource<T>>,
        descriptor: StrategyDescriptor,
        supervisor: TaskSupervisor,
    ) -> Self {
        Self {
            storage,
            source,
            descriptor,
            supervisor,
            in_flight: Arc::new(DashMap::new()),
            refreshing: Arc::new(DashSet::new()),
            next_flight: AtomicU64::new(1),
        }
    }

    /// Keys with a source load currently outstanding.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Whether a background revalidation for `key` is running.
    pub fn is_refreshing(&self, key: &CacheKey) -> bool {
        self.refreshing.contains(key)
    }

    fn fetch(
        storage: Arc<dyn CacheStorage>,
        source: Arc<dyn DataSource<T>>,
        descriptor: StrategyDescriptor,
        key: CacheKey,
    ) -> BoxFuture<'static, CacheResult<Option<T>>> {
        async move {
            let loaded = source.get(&key).await?;
            if let Some(data) = &loaded {
                let entry = encode_entry(&key, data, &descriptor)?;
                storage.set(&key, entry).await;
            }
            Ok(loaded)
        }
        .boxed()
    }

    /// Join the outstanding load for `key`, or start one.
    async fn load(&self, key: &CacheKey) -> CacheResult<Option<T>> {
        let load = match self.in_flight.entry(key.clone()) {
            MapEntry::Occupied(slot) => slot.get().load.clone(),
            MapEntry::Vacant(slot) => {
                let id = self.next_flight.fetch_add(1, Ordering::Relaxed);
                let guard = FlightGuard {
                    in_flight: Arc::clone(&self.in_flight),
                    key: key.clone(),
                    id,
                };
                let fetch = Self::fetch(
                    Arc::clone(&self.storage),
                    Arc::clone(&self.source),
                    self.descriptor.clone(),
                    key.clone(),
                );
                let load = async move {
                    let _guard = guard;
                    fetch.await
                }
                .boxed()
                .shared();
                slot.insert(Flight {
                    id,
                    load: load.clone(),
                });
                load
            }
        };

        load.await
    }

    /// Kick off one background reload for `key` unless one is running.
    fn revalidate(&self, key: &CacheKey) {
        if !self.refreshing.insert(key.clone()) {
            return;
        }
        let guard = RefreshGuard {
            refreshing: Arc::clone(&self.refreshing),
            key: key.clone(),
        };
        let fetch = Self::fetch(
            Arc::clone(&self.storage),
            Arc::clone(&self.source),
            self.descriptor.clone(),
            key.clone(),
        );
        let label = format!("revalidate {key}");
        self.supervisor.spawn(label, async move {
            let _guard = guard;
            fetch.await.map(|_| ())
        });
    }
}

#[async_trait]
impl<T> CacheStrategy<T> for ReadThroughStrategy<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &CacheKey) -> CacheResult<Option<T>> {
        let pending = self.in_flight.get(key).map(|flight| flight.load.clone());
        if let Some(load) = pending {
            return load.await;
        }

        if let Some(stored) = self.storage.get(key).await {
            let now = now_ms();
            if stored.is_valid_at(now) {
                let stale = stored.is_stale_at(now);
                if let Some(entry) = decode_entry::<T>(key, stored) {
                    if stale && self.descriptor.stale_while_revalidate {
                        tracing::debug!(key = %key, "Serving stale entry while revalidating");
                        self.revalidate(key);
                    }
                    return Ok(Some(entry.data));
                }
            }
        }

        self.load(key).await
    }

    /// Populate storage only; the source is treated as read-only.
    async fn set(&self, key: &CacheKey, data: T) -> CacheResult<()> {
        let entry = encode_entry(key, &data, &self.descriptor)?;
        self.storage.set(key, entry).await;
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> CacheResult<()> {
        self.storage.delete(key).await;
        Ok(())
    }

    fn descriptor(&self) -> &StrategyDescriptor {
        &self.descriptor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryTier;
    use futures_util::future::join_all;
    use std::time::Duration;
    use strata_core::{CacheError, Entry, Priority};
    use strata_test_utils::InMemoryDataSource;

    fn key(s: &str) -> CacheKey {
        CacheKey::parse(s).unwrap()
    }

    fn descriptor(swr: bool) -> StrategyDescriptor {
        StrategyDescriptor::new(Duration::from_secs(10), Priority::Critical, 100)
            .stale_while_revalidate(swr)
    }

    fn setup(
        swr: bool,
    ) -> (
        Arc<MemoryTier>,
        Arc<InMemoryDataSource<u64>>,
        TaskSupervisor,
        Arc<ReadThroughStrategy<u64>>,
    ) {
        let storage = Arc::new(MemoryTier::new(1 << 20));
        let source = Arc::new(InMemoryDataSource::new());
        let supervisor = TaskSupervisor::new();
        let strategy = Arc::new(ReadThroughStrategy::new(
            storage.clone(),
            source.clone(),
            descriptor(swr),
            supervisor.clone(),
        ));
        (storage, source, supervisor, strategy)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_misses_share_one_load() {
        let (_storage, source, _sup, strategy) = setup(false);
        source.insert(&key("post:1:likes"), 42);
        source.set_delay(Duration::from_millis(50));

        let callers = (0..5).map(|_| {
            let strategy = Arc::clone(&strategy);
            tokio::spawn(async move { strategy.get(&key("post:1:likes")).await })
        });
        let results = join_all(callers).await;

        for result in results {
            assert_eq!(result.unwrap().unwrap(), Some(42));
        }
        assert_eq!(source.get_calls(), 1);
        assert_eq!(strategy.in_flight_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_starter_leaves_load_to_joiner() {
        let (storage, source, _sup, strategy) = setup(false);
        let k = key("post:3:likes");
        source.insert(&k, 42);
        source.set_delay(Duration::from_millis(100));

        let starter = {
            let strategy = Arc::clone(&strategy);
            let k = k.clone();
            tokio::spawn(async move { strategy.get(&k).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(strategy.in_flight_count(), 1);

        let joiner = {
            let strategy = Arc::clone(&strategy);
            let k = k.clone();
            tokio::spawn(async move { strategy.get(&k).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        starter.abort();
        assert!(starter.await.unwrap_err().is_cancelled());
        assert_eq!(strategy.in_flight_count(), 1);

        // A caller arriving after the cancellation still shares the load.
        assert_eq!(strategy.get(&k).await.unwrap(), Some(42));
        assert_eq!(joiner.await.unwrap().unwrap(), Some(42));
        assert_eq!(source.get_calls(), 1);
        assert_eq!(strategy.in_flight_count(), 0);
        assert!(storage.get(&k).await.is_some());
    }

    #[tokio::test]
    async fn test_failed_load_clears_in_flight_and_surfaces() {
        let (storage, source, _sup, strategy) = setup(false);
        source.set_fail_reads(true);

        let err = strategy.get(&key("post:9")).await.unwrap_err();
        assert!(matches!(err, CacheError::Source(_)));
        assert_eq!(strategy.in_flight_count(), 0);
        assert!(storage.get(&key("post:9")).await.is_none());

        source.set_fail_reads(false);
        source.insert(&key("post:9"), 9);
        assert_eq!(strategy.get(&key("post:9")).await.unwrap(), Some(9));
    }

    #[tokio::test]
    async fn test_fresh_hit_skips_source() {
        let (storage, source, _sup, strategy) = setup(true);
        storage
            .set(&key("k"), Entry::new(serde_json::json!(5), Duration::from_secs(10)))
            .await;
        assert_eq!(strategy.get(&key("k")).await.unwrap(), Some(5));
        assert_eq!(source.get_calls(), 0);
    }

    #[tokio::test]
    async fn test_stale_entry_served_and_revalidated_once() {
        let (storage, source, supervisor, strategy) = setup(true);
        source.insert(&key("k"), 2);
        source.set_delay(Duration::from_millis(20));

        // 85% of a 10s TTL already elapsed.
        let stale = Entry::created_at(
            serde_json::json!(1),
            Duration::from_secs(10),
            now_ms() - 8_500,
        );
        storage.set(&key("k"), stale).await;

        assert_eq!(strategy.get(&key("k")).await.unwrap(), Some(1));
        assert_eq!(strategy.get(&key("k")).await.unwrap(), Some(1));
        assert!(strategy.is_refreshing(&key("k")));

        supervisor.wait_idle().await;
        assert_eq!(source.get_calls(), 1);
        assert!(!strategy.is_refreshing(&key("k")));
        assert_eq!(strategy.get(&key("k")).await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_stale_without_swr_is_plain_hit() {
        let (storage, source, supervisor, strategy) = setup(false);
        let stale = Entry::created_at(
            serde_json::json!(1),
            Duration::from_secs(10),
            now_ms() - 9_000,
        );
        storage.set(&key("k"), stale).await;

        assert_eq!(strategy.get(&key("k")).await.unwrap(), Some(1));
        supervisor.wait_idle().await;
        assert_eq!(source.get_calls(), 0);
    }

    #[tokio::test]
    async fn test_background_failure_is_swallowed() {
        let (storage, source, supervisor, strategy) = setup(true);
        source.set_fail_reads(true);
        let stale = Entry::created_at(
            serde_json::json!(1),
            Duration::from_secs(10),
            now_ms() - 9_000,
        );
        storage.set(&key("k"), stale).await;

        assert_eq!(strategy.get(&key("k")).await.unwrap(), Some(1));
        supervisor.wait_idle().await;
        assert_eq!(supervisor.stats().failed, 1);
        assert!(!strategy.is_refreshing(&key("k")));
    }

    #[tokio::test]
    async fn test_expired_entry_reloads() {
        let (storage, source, _sup, strategy) = setup(true);
        source.insert(&key("k"), 3);
        let expired = Entry::created_at(
            serde_json::json!(1),
            Duration::from_secs(10),
            now_ms() - 20_000,
        );
        storage.set(&key("k"), expired).await;

        assert_eq!(strategy.get(&key("k")).await.unwrap(), Some(3));
        assert_eq!(source.get_calls(), 1);
    }
}
