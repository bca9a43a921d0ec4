//! Strata Storage - Cache Tiers and Strategies
//!
//! Every tier implements [`CacheStorage`]: the volatile [`MemoryTier`] (L1),
//! the LMDB-backed [`DurableTier`] (L2), and [`TieredStorage`], which layers
//! the two. The strategies in [`strategy`] compose a storage with a remote
//! `DataSource`.

pub mod durable;
pub mod memory;
pub mod storage;
pub mod strategy;
pub mod tiered;

pub use durable::{DurableTier, DurableTierError};
pub use memory::MemoryTier;
pub use storage::CacheStorage;
pub use strategy::{
    CacheStrategy, DeadLetter, FlushReport, PendingOp, ReadThroughStrategy, WriteBehindStrategy,
    WriteThroughStrategy,
};
pub use tiered::TieredStorage;
