use std::sync::Arc;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use strata_core::{now_ms, CacheKey, CacheResult, DataSource, StrategyDescriptor};

use super::{decode_entry, encode_entry, CacheStrategy};
use crate::storage::CacheStorage;

/// Writes go to storage and the source concurrently.
///
/// Use where read-after-write consistency matters more than write latency.
pub struct WriteThroughStrategy<T> {
    storage: Arc<dyn CacheStorage>,
    source: Arc<dyn DataSource<T>>,
    descriptor: StrategyDescriptor,
}

impl<T> WriteThroughStrategy<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub fn new(
        storage: Arc<dyn CacheStorage>,
        source: Arc<dyn DataSource<T>>,
        descriptor: StrategyDescriptor,
    ) -> Self {
        Self {
            storage,
            source,
            descriptor,
        }
    }
}

#[async_trait]
impl<T> CacheStrategy<T> for WriteThroughStrategy<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &CacheKey) -> CacheResult<Option<T>> {
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
        let ((), written) =
            futures_util::join!(self.storage.set(key, entry), self.source.set(key, &data));
        written?;
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> CacheResult<()> {
        let ((), deleted) =
            futures_util::join!(self.storage.delete(key), self.source.delete(key));
        deleted?;
        Ok(())
    }

    fn descriptor(&self) -> &StrategyDescriptor {
        &self.descriptor
    }
}
