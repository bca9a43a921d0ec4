//! Volatile in-process tier (L1).
//!
//! Size is accounted as the JSON-encoded length of each entry. When an
//! insert would push the total past capacity, the globally least recently
//! used keys are evicted until it fits. Recency is a logical clock bumped on
//! every read and write, so eviction order is deterministic.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use strata_core::{CacheKey, KeyPattern, StoredEntry};

use crate::storage::CacheStorage;

#[derive(Debug)]
struct Slot {
    entry: StoredEntry,
    bytes: usize,
    tick: u64,
}

#[derive(Debug, Default)]
struct State {
    slots: HashMap<CacheKey, Slot>,
    /// tick -> key, oldest first.
    recency: BTreeMap<u64, CacheKey>,
    current_bytes: usize,
    clock: u64,
}

impl State {
    fn next_tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn touch(&mut self, key: &CacheKey) -> Option<StoredEntry> {
        let tick = self.next_tick();
        let slot = self.slots.get_mut(key)?;
        self.recency.remove(&slot.tick);
        slot.tick = tick;
        self.recency.insert(tick, key.clone());
        Some(slot.entry.clone())
    }

    fn remove(&mut self, key: &CacheKey) -> bool {
        match self.slots.remove(key) {
            Some(slot) => {
                self.recency.remove(&slot.tick);
                self.current_bytes -= slot.bytes;
                true
            }
            None => false,
        }
    }

    fn evict_lru(&mut self) -> Option<CacheKey> {
        let (_, key) = self.recency.pop_first()?;
        if let Some(slot) = self.slots.remove(&key) {
            self.current_bytes -= slot.bytes;
        }
        Some(key)
    }
}

/// Bounded, LRU-evicted memory tier.
#[derive(Debug)]
pub struct MemoryTier {
    capacity_bytes: usize,
    state: Mutex<State>,
    evictions: AtomicU64,
}

impl MemoryTier {
    pub fn new(capacity_bytes: usize) -> Self {
        Self {
            capacity_bytes,
            state: Mutex::new(State::default()),
            evictions: AtomicU64::new(0),
        }
    }

    /// Bytes an entry is charged against the capacity.
    pub fn entry_size(entry: &StoredEntry) -> usize {
        entry.encoded_len()
    }

    pub fn capacity_bytes(&self) -> usize {
        self.capacity_bytes
    }

    pub fn current_bytes(&self) -> usize {
        self.lock().current_bytes
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Drop expired entries. Correctness never depends on this; it only
    /// reclaims memory.
    pub fn purge_expired(&self, now_ms: i64) -> usize {
        let mut state = self.lock();
        let expired: Vec<CacheKey> = state
            .slots
            .iter()
            .filter(|(_, slot)| !slot.entry.is_valid_at(now_ms))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            state.remove(key);
        }
        expired.len()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, state: &mut State, key: &CacheKey, entry: StoredEntry) {
        let bytes = Self::entry_size(&entry);
        state.remove(key);

        if bytes > self.capacity_bytes {
            tracing::warn!(
                key = %key,
                bytes,
                capacity = self.capacity_bytes,
                "Entry larger than memory tier capacity, not cached"
            );
            return;
        }

        while state.current_bytes + bytes > self.capacity_bytes {
            match state.evict_lru() {
                Some(evicted) => {
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(key = %evicted, "Evicted least recently used entry");
                }
                None => break,
            }
        }

        let tick = state.next_tick();
        state.recency.insert(tick, key.clone());
        state.current_bytes += bytes;
        state.slots.insert(key.clone(), Slot { entry, bytes, tick });
    }
}

#[async_trait]
impl CacheStorage for MemoryTier {
    fn name(&self) -> &'static str {
        "l1"
    }

    async fn get(&self, key: &CacheKey) -> Option<StoredEntry> {
        self.lock().touch(key)
    }

    async fn set(&self, key: &CacheKey, entry: StoredEntry) {
        let mut state = self.lock();
        self.insert(&mut state, key, entry);
    }

    async fn delete(&self, key: &CacheKey) {
        self.lock().remove(key);
    }

    async fn multi_get(&self, keys: &[CacheKey]) -> Vec<(CacheKey, Option<StoredEntry>)> {
        let mut state = self.lock();
        keys.iter()
            .map(|key| (key.clone(), state.touch(key)))
            .collect()
    }

    async fn multi_set(&self, entries: Vec<(CacheKey, StoredEntry)>) {
        let mut state = self.lock();
        for (key, entry) in entries {
            self.insert(&mut state, &key, entry);
        }
    }

    async fn multi_delete(&self, keys: &[CacheKey]) {
        let mut state = self.lock();
        for key in keys {
            state.remove(key);
        }
    }

    async fn keys(&self, pattern: Option<&KeyPattern>) -> Vec<CacheKey> {
        let state = self.lock();
        let mut keys: Vec<CacheKey> = state
            .slots
            .keys()
            .filter(|key| pattern.map_or(true, |p| p.matches(key)))
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    async fn clear(&self, pattern: Option<&KeyPattern>) {
        let mut state = self.lock();
        match pattern {
            None => *state = State::default(),
            Some(p) => {
                let doomed: Vec<CacheKey> =
                    state.slots.keys().filter(|k| p.matches(k)).cloned().collect();
                for key in &doomed {
                    state.remove(key);
                }
            }
        }
    }

    async fn size(&self) -> usize {
        self.lock().slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use strata_core::Entry;

    fn key(s: &str) -> CacheKey {
        CacheKey::parse(s).unwrap()
    }

    fn entry(payload: &str) -> StoredEntry {
        Entry::created_at(json!(payload), Duration::from_secs(60), 1_000)
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let tier = MemoryTier::new(1024 * 1024);
        tier.set(&key("post:1"), entry("hello")).await;
        let got = tier.get(&key("post:1")).await.unwrap();
        assert_eq!(got.data, json!("hello"));
        assert_eq!(tier.size().await, 1);
    }

    #[tokio::test]
    async fn test_lru_evicts_least_recently_accessed() {
        let size = MemoryTier::entry_size(&entry("aaaa"));
        let tier = MemoryTier::new(size * 2);

        tier.set(&key("a"), entry("aaaa")).await;
        tier.set(&key("b"), entry("bbbb")).await;
        assert!(tier.get(&key("a")).await.is_some());
        tier.set(&key("c"), entry("cccc")).await;

        assert!(tier.get(&key("a")).await.is_some());
        assert!(tier.get(&key("b")).await.is_none());
        assert!(tier.get(&key("c")).await.is_some());
        assert_eq!(tier.evictions(), 1);
        assert_eq!(tier.current_bytes(), size * 2);
    }

    #[tokio::test]
    async fn test_overwrite_replaces_size_accounting() {
        let tier = MemoryTier::new(1024 * 1024);
        tier.set(&key("k"), entry("short")).await;
        tier.set(&key("k"), entry(&"x".repeat(100))).await;
        assert_eq!(
            tier.current_bytes(),
            MemoryTier::entry_size(&entry(&"x".repeat(100)))
        );
        assert_eq!(tier.size().await, 1);
    }

    #[tokio::test]
    async fn test_oversized_entry_rejected_and_old_value_dropped() {
        let tier = MemoryTier::new(64);
        tier.set(&key("k"), entry("s")).await;
        tier.set(&key("k"), entry(&"x".repeat(500))).await;
        assert!(tier.get(&key("k")).await.is_none());
        assert_eq!(tier.current_bytes(), 0);
    }

    #[tokio::test]
    async fn test_overwrite_does_not_evict_itself() {
        let size = MemoryTier::entry_size(&entry("aaaa"));
        let tier = MemoryTier::new(size * 2);
        tier.set(&key("a"), entry("aaaa")).await;
        tier.set(&key("b"), entry("bbbb")).await;
        tier.set(&key("b"), entry("BBBB")).await;
        assert_eq!(tier.size().await, 2);
        assert_eq!(tier.evictions(), 0);
    }

    #[tokio::test]
    async fn test_keys_and_clear_by_pattern() {
        let tier = MemoryTier::new(1024 * 1024);
        for k in ["user:1:a", "user:1:b", "user:2:a"] {
            tier.set(&key(k), entry(k)).await;
        }
        let pattern = KeyPattern::parse("user:1*").unwrap();
        assert_eq!(
            tier.keys(Some(&pattern)).await,
            vec![key("user:1:a"), key("user:1:b")]
        );

        tier.clear(Some(&pattern)).await;
        assert_eq!(tier.keys(None).await, vec![key("user:2:a")]);

        tier.clear(None).await;
        assert_eq!(tier.size().await, 0);
        assert_eq!(tier.current_bytes(), 0);
    }

    #[tokio::test]
    async fn test_multi_ops() {
        let tier = MemoryTier::new(1024 * 1024);
        tier.multi_set(vec![(key("a"), entry("1")), (key("b"), entry("2"))])
            .await;
        let got = tier.multi_get(&[key("a"), key("zz")]).await;
        assert!(got[0].1.is_some());
        assert!(got[1].1.is_none());

        tier.multi_delete(&[key("a"), key("b")]).await;
        assert_eq!(tier.size().await, 0);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let tier = MemoryTier::new(1024 * 1024);
        tier.set(&key("old"), Entry::created_at(json!(1), Duration::from_millis(10), 0))
            .await;
        tier.set(&key("new"), entry("fresh")).await;
        assert_eq!(tier.purge_expired(1_000), 1);
        assert_eq!(tier.keys(None).await, vec![key("new")]);
    }
}
