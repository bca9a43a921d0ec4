//! Cache strategies.
//!
//! Each strategy composes a [`CacheStorage`](crate::CacheStorage), a remote
//! [`DataSource`](strata_core::DataSource) and a
//! [`StrategyDescriptor`](strata_core::StrategyDescriptor):
//!
//! - [`WriteThroughStrategy`]: writes hit storage and source together.
//! - [`ReadThroughStrategy`]: single-flight loads plus stale-while-revalidate.
//! - [`WriteBehindStrategy`]: writes land in storage immediately and reach the
//!   source in periodic batches.

mod read_through;
mod write_behind;
mod write_through;

pub use read_through::ReadThroughStrategy;
pub use write_behind::{DeadLetter, FlushReport, PendingOp, WriteBehindStrategy};
pub use write_through::WriteThroughStrategy;

use async_trait::async_trait;
use strata_core::{
    CacheKey, CacheResult, Entry, StorageError, StoredEntry, StrategyDescriptor,
};

/// Common surface of the three strategies.
#[async_trait]
pub trait CacheStrategy<T>: Send + Sync
where
    T: Send + Sync + 'static,
{
    /// Read a value, consulting the source on a miss.
    async fn get(&self, key: &CacheKey) -> CacheResult<Option<T>>;

    async fn set(&self, key: &CacheKey, data: T) -> CacheResult<()>;

    async fn delete(&self, key: &CacheKey) -> CacheResult<()>;

    fn descriptor(&self) -> &StrategyDescriptor;
}

/// Build the stored form of `data` under `descriptor`.
pub(crate) fn encode_entry<T: serde::Serialize>(
    key: &CacheKey,
    data: &T,
    descriptor: &StrategyDescriptor,
) -> Result<StoredEntry, StorageError> {
    let value = serde_json::to_value(data).map_err(|e| StorageError::Encode {
        key: key.to_string(),
        reason: e.to_string(),
    })?;
    Ok(Entry::new(value, descriptor.ttl()))
}

/// Decode a stored entry, treating a type mismatch as a miss.
pub(crate) fn decode_entry<T: serde::de::DeserializeOwned>(
    key: &CacheKey,
    stored: StoredEntry,
) -> Option<Entry<T>> {
    match stored.decode() {
        Ok(entry) => Some(entry),
        Err(e) => {
            tracing::warn!(key = %key, error = %e, "Cached entry has unexpected shape, ignoring");
            None
        }
    }
}
