//! The authoritative remote store the strategies read through and write to.

use async_trait::async_trait;

use crate::error::SourceError;
use crate::key::CacheKey;

/// Remote data source behind the cache.
///
/// Implemented outside this workspace; the strategies only consume it.
/// Batch methods default to per-key loops so simple sources only need the
/// single-key operations.
#[async_trait]
pub trait DataSource<T>: Send + Sync
where
    T: Send + Sync + 'static,
{
    async fn get(&self, key: &CacheKey) -> Result<Option<T>, SourceError>;

    async fn set(&self, key: &CacheKey, data: &T) -> Result<(), SourceError>;

    async fn delete(&self, key: &CacheKey) -> Result<(), SourceError>;

    async fn multi_get(&self, keys: &[CacheKey]) -> Result<Vec<Option<T>>, SourceError> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            out.push(self.get(key).await?);
        }
        Ok(out)
    }

    /// Write a batch. Returns the keys that failed, with their errors.
    async fn multi_set(&self, items: &[(CacheKey, T)]) -> Vec<(CacheKey, SourceError)> {
        let mut failed = Vec::new();
        for (key, data) in items {
            if let Err(e) = self.set(key, data).await {
                failed.push((key.clone(), e));
            }
        }
        failed
    }

    /// Delete a batch. Returns the keys that failed, with their errors.
    async fn multi_delete(&self, keys: &[CacheKey]) -> Vec<(CacheKey, SourceError)> {
        let mut failed = Vec::new();
        for key in keys {
            if let Err(e) = self.delete(key).await {
                failed.push((key.clone(), e));
            }
        }
        failed
    }
}
