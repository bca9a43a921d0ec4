use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use strata_core::{
    now_ms, CacheKey, CacheResult, DataSource, SourceError, StrategyDescriptor, TaskSupervisor,
    WriteBehindConfig,
};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::{decode_entry, encode_entry, CacheStrategy};
use crate::storage::CacheStorage;

/// A deferred write waiting for the next flush.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingOp<T> {
    Upsert(T),
    Delete,
}

#[derive(Debug, Clone)]
struct PendingWrite<T> {
    op: PendingOp<T>,
    enqueued_at: i64,
    attempts: u32,
}

/// A write that exhausted its flush attempts.
#[derive(Debug, Clone)]
pub struct DeadLetter<T> {
    pub key: CacheKey,
    pub op: PendingOp<T>,
    pub attempts: u32,
    pub last_error: SourceError,
    pub enqueued_at: i64,
    pub failed_at: i64,
}

/// Outcome of one flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub written: usize,
    pub deleted: usize,
    pub retried: usize,
    pub dead_lettered: usize,
}

impl FlushReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Writes land in storage at once and reach the source in periodic batches.
///
/// The pending map holds one write per key, so a later `set` or `delete`
/// replaces an earlier one within the same interval. Reads consult the
/// pending map, then the batch currently being flushed, before storage.
/// A failed item is re-queued unless a newer
/// write for its key arrived during the flush; after
/// `max_flush_attempts` it moves to the bounded dead-letter log.
pub struct WriteBehindStrategy<T> {
    storage: Arc<dyn CacheStorage>,
    source: Arc<dyn DataSource<T>>,
    descriptor: StrategyDescriptor,
    config: WriteBehindConfig,
    pending: Mutex<HashMap<CacheKey, PendingWrite<T>>>,
    /// Operations drained by the running flush, visible until it finishes.
    in_flight: Mutex<HashMap<CacheKey, PendingOp<T>>>,
    dead_letters: Mutex<VecDeque<DeadLetter<T>>>,
    flush_lock: tokio::sync::Mutex<()>,
    flushes: AtomicU64,
}

impl<T> WriteBehindStrategy<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub fn new(
        storage: Arc<dyn CacheStorage>,
        source: Arc<dyn DataSource<T>>,
        descriptor: StrategyDescriptor,
        config: WriteBehindConfig,
    ) -> Self {
        Self {
            storage,
            source,
            descriptor,
            config,
            pending: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            dead_letters: Mutex::new(VecDeque::new()),
            flush_lock: tokio::sync::Mutex::new(()),
            flushes: AtomicU64::new(0),
        }
    }

    pub fn pending_len(&self) -> usize {
        self.lock_pending().len()
    }

    /// The queued operation for `key`, if any.
    pub fn pending_op(&self, key: &CacheKey) -> Option<PendingOp<T>> {
        self.lock_pending().get(key).map(|w| w.op.clone())
    }

    /// Snapshot of the dead-letter log, oldest first.
    pub fn dead_letters(&self) -> Vec<DeadLetter<T>> {
        self.dead_letters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Number of flushes that found work to do.
    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<CacheKey, PendingWrite<T>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_in_flight(&self) -> std::sync::MutexGuard<'_, HashMap<CacheKey, PendingOp<T>>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The newest unflushed operation for `key`: queued first, then in flight.
    fn unflushed_op(&self, key: &CacheKey) -> Option<PendingOp<T>> {
        self.pending_op(key)
            .or_else(|| self.lock_in_flight().get(key).cloned())
    }

    fn enqueue(&self, key: &CacheKey, op: PendingOp<T>) {
        self.lock_pending().insert(
            key.clone(),
            PendingWrite {
                op,
                enqueued_at: now_ms(),
                attempts: 0,
            },
        );
    }

    /// Drain the pending map into one batched write and one batched delete.
    pub async fn flush(&self) -> FlushReport {
        let _serial = self.flush_lock.lock().await;

        let batch: HashMap<CacheKey, PendingWrite<T>> = self.lock_pending().drain().collect();
        let mut report = FlushReport::default();
        if batch.is_empty() {
            return report;
        }
        self.flushes.fetch_add(1, Ordering::Relaxed);
        self.lock_in_flight().extend(
            batch
                .iter()
                .map(|(key, write)| (key.clone(), write.op.clone())),
        );

        let mut upserts = Vec::new();
        let mut deletes = Vec::new();
        for (key, write) in &batch {
            match &write.op {
                PendingOp::Upsert(data) => upserts.push((key.clone(), data.clone())),
                PendingOp::Delete => deletes.push(key.clone()),
            }
        }

        let failed_sets = if upserts.is_empty() {
            Vec::new()
        } else {
            self.source.multi_set(&upserts).await
        };
        let failed_deletes = if deletes.is_empty() {
            Vec::new()
        } else {
            self.source.multi_delete(&deletes).await
        };

        report.written = upserts.len().saturating_sub(failed_sets.len());
        report.deleted = deletes.len().saturating_sub(failed_deletes.len());

        let mut batch = batch;
        for (key, error) in failed_sets.into_iter().chain(failed_deletes) {
            if let Some(write) = batch.remove(&key) {
                self.handle_failure(key, write, error, &mut report);
            }
        }
        // Re-queued items are back in `pending`; flushes are serialized.
        self.lock_in_flight().clear();

        tracing::info!(
            written = report.written,
            deleted = report.deleted,
            retried = report.retried,
            dead_lettered = report.dead_lettered,
            "Flushed write-behind batch"
        );
        report
    }

    fn handle_failure(
        &self,
        key: CacheKey,
        mut write: PendingWrite<T>,
        error: SourceError,
        report: &mut FlushReport,
    ) {
        write.attempts += 1;

        let mut pending = self.lock_pending();
        if pending.contains_key(&key) {
            tracing::debug!(key = %key, "Dropping failed write superseded by a newer one");
            return;
        }

        if write.attempts >= self.config.max_flush_attempts {
            drop(pending);
            tracing::error!(
                key = %key,
                attempts = write.attempts,
                error = %error,
                "Write-behind item exhausted retries, moved to dead-letter log"
            );
            report.dead_lettered += 1;
            self.push_dead_letter(DeadLetter {
                key,
                op: write.op,
                attempts: write.attempts,
                last_error: error,
                enqueued_at: write.enqueued_at,
                failed_at: now_ms(),
            });
            return;
        }

        tracing::warn!(key = %key, attempts = write.attempts, error = %error, "Write-behind item re-queued");
        report.retried += 1;
        pending.insert(key, write);
    }

    fn push_dead_letter(&self, letter: DeadLetter<T>) {
        let capacity = self.config.dead_letter_capacity;
        if capacity == 0 {
            return;
        }
        let mut letters = self.dead_letters.lock().unwrap_or_else(PoisonError::into_inner);
        while letters.len() >= capacity {
            letters.pop_front();
        }
        letters.push_back(letter);
    }

    /// Start the periodic flush under `supervisor`.
    ///
    /// The loop stops when the supervisor shuts down, flushing one last time.
    pub fn start(self: &Arc<Self>, supervisor: &TaskSupervisor) -> JoinHandle<()> {
        let this = Arc::clone(self);
        let mut shutdown = supervisor.shutdown_signal();
        let period = self.config.flush_interval();

        supervisor.spawn("write-behind flush", async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;

            while !*shutdown.borrow() {
                tokio::select! {
                    _ = ticker.tick() => {
                        this.flush().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }

            let report = this.flush().await;
            tracing::info!(pending = this.pending_len(), written = report.written, "Write-behind stopped");
            Ok(())
        })
    }
}

#[async_trait]
impl<T> CacheStrategy<T> for WriteBehindStrategy<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &CacheKey) -> CacheResult<Option<T>> {
        if let Some(op) = self.unflushed_op(key) {
            return Ok(match op {
                PendingOp::Upsert(data) => Some(data),
                PendingOp::Delete => None,
            });
        }

        if let Some(stored) = self.storage.get(key).await {
            if stored.is_valid_at(now_ms()) {
                if let Some(entry) = decode_entry::<T>(key, stored) {
                    return Ok(Some(entry.data));
                }
            }
        }

        let loaded = self.source.get(key).await?;
        if let Some(data) = &loaded {
            let entry = encode_entry(key, data, &self.descriptor)?;
            self.storage.set(key, entry).await;
        }
        Ok(loaded)
    }

    async fn set(&self, key: &CacheKey, data: T) -> CacheResult<()> {
        let entry = encode_entry(key, &data, &self.descriptor)?;
        self.storage.set(key, entry).await;
        self.enqueue(key, PendingOp::Upsert(data));
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> CacheResult<()> {
        self.storage.delete(key).await;
        self.enqueue(key, PendingOp::Delete);
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
    use std::time::Duration;
    use strata_core::Priority;
    use strata_test_utils::InMemoryDataSource;

    fn key(s: &str) -> CacheKey {
        CacheKey::parse(s).unwrap()
    }

    fn config() -> WriteBehindConfig {
        WriteBehindConfig {
            flush_interval_ms: 5000,
            max_flush_attempts: 3,
            dead_letter_capacity: 2,
        }
    }

    fn setup() -> (
        Arc<MemoryTier>,
        Arc<InMemoryDataSource<i64>>,
        Arc<WriteBehindStrategy<i64>>,
    ) {
        let storage = Arc::new(MemoryTier::new(1 << 20));
        let source = Arc::new(InMemoryDataSource::new());
        let strategy = Arc::new(WriteBehindStrategy::new(
            storage.clone(),
            source.clone(),
            StrategyDescriptor::new(Duration::from_secs(300), Priority::Medium, 100),
            config(),
        ));
        (storage, source, strategy)
    }

    #[tokio::test]
    async fn test_set_is_deferred_until_flush() {
        let (storage, source, strategy) = setup();
        strategy.set(&key("post:1"), 1).await.unwrap();
        strategy.set(&key("post:2"), 2).await.unwrap();

        assert!(storage.get(&key("post:1")).await.is_some());
        assert_eq!(source.value(&key("post:1")), None);
        assert_eq!(strategy.pending_len(), 2);

        let report = strategy.flush().await;
        assert_eq!(report.written, 2);
        assert_eq!(strategy.pending_len(), 0);
        assert_eq!(source.value(&key("post:2")), Some(2));
    }

    #[tokio::test]
    async fn test_last_write_wins_within_interval() {
        let (_storage, source, strategy) = setup();
        source.insert(&key("k"), 0);

        strategy.set(&key("k"), 1).await.unwrap();
        strategy.delete(&key("k")).await.unwrap();
        assert_eq!(strategy.pending_len(), 1);
        assert_eq!(strategy.get(&key("k")).await.unwrap(), None);

        strategy.set(&key("k"), 7).await.unwrap();
        assert_eq!(strategy.get(&key("k")).await.unwrap(), Some(7));

        let report = strategy.flush().await;
        assert_eq!((report.written, report.deleted), (1, 0));
        assert_eq!(source.value(&key("k")), Some(7));
    }

    #[tokio::test]
    async fn test_delete_sentinel_reaches_source() {
        let (_storage, source, strategy) = setup();
        source.insert(&key("k"), 3);
        strategy.delete(&key("k")).await.unwrap();

        let report = strategy.flush().await;
        assert_eq!(report.deleted, 1);
        assert_eq!(source.value(&key("k")), None);
    }

    #[tokio::test]
    async fn test_get_falls_back_to_source() {
        let (storage, source, strategy) = setup();
        source.insert(&key("k"), 11);
        assert_eq!(strategy.get(&key("k")).await.unwrap(), Some(11));
        assert!(storage.get(&key("k")).await.is_some());
    }

    #[tokio::test]
    async fn test_failed_items_retry_then_dead_letter() {
        let (_storage, source, strategy) = setup();
        source.set_fail_writes(true);
        strategy.set(&key("k"), 1).await.unwrap();

        assert_eq!(strategy.flush().await.retried, 1);
        assert_eq!(strategy.flush().await.retried, 1);
        let last = strategy.flush().await;
        assert_eq!(last.dead_lettered, 1);
        assert_eq!(strategy.pending_len(), 0);

        let letters = strategy.dead_letters();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].attempts, 3);
        assert_eq!(letters[0].op, PendingOp::Upsert(1));
    }

    #[tokio::test]
    async fn test_partial_batch_failure_requeues_only_failed_key() {
        let (_storage, source, strategy) = setup();
        source.fail_key(&key("b"));
        strategy.set(&key("a"), 1).await.unwrap();
        strategy.set(&key("b"), 2).await.unwrap();

        let report = strategy.flush().await;
        assert_eq!((report.written, report.retried), (1, 1));
        assert_eq!(strategy.pending_op(&key("b")), Some(PendingOp::Upsert(2)));
        assert_eq!(source.value(&key("a")), Some(1));
    }

    #[tokio::test]
    async fn test_dead_letter_log_is_bounded() {
        let (_storage, source, strategy) = setup();
        source.set_fail_writes(true);
        for k in ["a", "b", "c"] {
            strategy.set(&key(k), 0).await.unwrap();
        }
        for _ in 0..3 {
            strategy.flush().await;
        }
        let letters = strategy.dead_letters();
        assert_eq!(letters.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_newer_write_supersedes_failed_one() {
        let (_storage, source, strategy) = setup();
        source.set_fail_writes(true);
        source.set_delay(Duration::from_millis(50));
        strategy.set(&key("k"), 1).await.unwrap();

        let flushing = {
            let strategy = Arc::clone(&strategy);
            tokio::spawn(async move { strategy.flush().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        strategy.set(&key("k"), 2).await.unwrap();

        let report = flushing.await.unwrap();
        assert_eq!(report.retried, 0);
        assert_eq!(strategy.pending_op(&key("k")), Some(PendingOp::Upsert(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_during_flush_sees_in_flight_delete() {
        let (storage, source, strategy) = setup();
        source.insert(&key("k"), 3);
        strategy.set(&key("k"), 3).await.unwrap();
        strategy.flush().await;
        strategy.delete(&key("k")).await.unwrap();
        source.set_delay(Duration::from_millis(100));

        let flushing = {
            let strategy = Arc::clone(&strategy);
            tokio::spawn(async move { strategy.flush().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(strategy.pending_len(), 0);
        assert_eq!(strategy.get(&key("k")).await.unwrap(), None);
        assert!(storage.get(&key("k")).await.is_none());

        assert_eq!(flushing.await.unwrap().deleted, 1);
        assert_eq!(strategy.get(&key("k")).await.unwrap(), None);
        assert_eq!(source.value(&key("k")), None);
        assert!(storage.get(&key("k")).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_during_flush_sees_in_flight_upsert() {
        let (_storage, source, strategy) = setup();
        source.set_delay(Duration::from_millis(100));
        strategy.set(&key("k"), 5).await.unwrap();

        let flushing = {
            let strategy = Arc::clone(&strategy);
            tokio::spawn(async move { strategy.flush().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(strategy.get(&key("k")).await.unwrap(), Some(5));
        assert_eq!(source.get_calls(), 0);
        flushing.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_flushes_and_shutdown_drains() {
        let (_storage, source, strategy) = setup();
        let supervisor = TaskSupervisor::new();
        let handle = strategy.start(&supervisor);

        strategy.set(&key("a"), 1).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5_100)).await;
        assert_eq!(source.value(&key("a")), Some(1));

        strategy.set(&key("b"), 2).await.unwrap();
        supervisor.shutdown();
        handle.await.unwrap();

        assert_eq!(source.value(&key("b")), Some(2));
        assert_eq!(strategy.pending_len(), 0);
        assert_eq!(supervisor.stats().succeeded, 1);
    }
}
