//! The storage contract every cache tier implements.

use async_trait::async_trait;
use strata_core::{CacheKey, KeyPattern, StoredEntry};

/// Asynchronous key/value contract shared by all tiers.
///
/// Operations never fail from the caller's point of view. A tier that hits
/// an I/O or decoding problem logs it and behaves as a miss (reads) or a
/// no-op (writes). Entries are returned regardless of validity; callers
/// check TTLs themselves.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Short tier label used in logs.
    fn name(&self) -> &'static str;

    async fn get(&self, key: &CacheKey) -> Option<StoredEntry>;

    async fn set(&self, key: &CacheKey, entry: StoredEntry);

    async fn delete(&self, key: &CacheKey);

    async fn multi_get(&self, keys: &[CacheKey]) -> Vec<(CacheKey, Option<StoredEntry>)> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            out.push((key.clone(), self.get(key).await));
        }
        out
    }

    async fn multi_set(&self, entries: Vec<(CacheKey, StoredEntry)>) {
        for (key, entry) in entries {
            self.set(&key, entry).await;
        }
    }

    async fn multi_delete(&self, keys: &[CacheKey]) {
        for key in keys {
            self.delete(key).await;
        }
    }

    /// Stored keys, optionally filtered by a pattern.
    async fn keys(&self, pattern: Option<&KeyPattern>) -> Vec<CacheKey>;

    /// Remove everything, or only the keys matching `pattern`.
    async fn clear(&self, pattern: Option<&KeyPattern>) {
        let keys = self.keys(pattern).await;
        if !keys.is_empty() {
            self.multi_delete(&keys).await;
        }
    }

    /// Number of stored entries.
    async fn size(&self) -> usize;
}
