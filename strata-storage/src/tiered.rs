//! Two-tier view over L1 and L2.
//!
//! Reads try L1 first and fall back to L2, promoting valid L2 hits into L1.
//! Writes always land in L1 and also in L2 when persistence is enabled.
//! Strategies built over a `TieredStorage` therefore share the same tiers
//! as the cache manager.

use std::sync::Arc;

use async_trait::async_trait;
use strata_core::{now_ms, CacheKey, KeyPattern, StoredEntry};

use crate::storage::CacheStorage;

#[derive(Clone)]
pub struct TieredStorage {
    l1: Arc<dyn CacheStorage>,
    l2: Arc<dyn CacheStorage>,
    persist: bool,
}

impl TieredStorage {
    pub fn new(l1: Arc<dyn CacheStorage>, l2: Arc<dyn CacheStorage>, persist: bool) -> Self {
        Self { l1, l2, persist }
    }
}

#[async_trait]
impl CacheStorage for TieredStorage {
    fn name(&self) -> &'static str {
        "tiered"
    }

    async fn get(&self, key: &CacheKey) -> Option<StoredEntry> {
        let now = now_ms();
        if let Some(entry) = self.l1.get(key).await {
            if entry.is_valid_at(now) {
                return Some(entry);
            }
        }
        let entry = self.l2.get(key).await?;
        if entry.is_valid_at(now) {
            self.l1.set(key, entry.clone()).await;
        }
        Some(entry)
    }

    async fn set(&self, key: &CacheKey, entry: StoredEntry) {
        if self.persist {
            futures_util::join!(self.l1.set(key, entry.clone()), self.l2.set(key, entry));
        } else {
            self.l1.set(key, entry).await;
        }
    }

    async fn delete(&self, key: &CacheKey) {
        futures_util::join!(self.l1.delete(key), self.l2.delete(key));
    }

    async fn multi_delete(&self, keys: &[CacheKey]) {
        futures_util::join!(self.l1.multi_delete(keys), self.l2.multi_delete(keys));
    }

    async fn keys(&self, pattern: Option<&KeyPattern>) -> Vec<CacheKey> {
        let (mut keys, l2_keys) =
            futures_util::join!(self.l1.keys(pattern), self.l2.keys(pattern));
        keys.extend(l2_keys);
        keys.sort();
        keys.dedup();
        keys
    }

    async fn clear(&self, pattern: Option<&KeyPattern>) {
        futures_util::join!(self.l1.clear(pattern), self.l2.clear(pattern));
    }

    async fn size(&self) -> usize {
        self.keys(None).await.len()
    }
}
