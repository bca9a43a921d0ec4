//! Strata Sync - Realtime Change-Feed Synchronization
//!
//! Subscribes to row-level change notifications through a
//! [`ChangeTransport`](strata_core::ChangeTransport) and keeps the cache
//! consistent with the source of truth:
//!
//! ```text
//! transport ──▶ channel loop ──▶ SyncRules::affected_keys ─┐
//!                    │                                      ├─▶ CacheManager::invalidate
//!                    │           event_for ──▶ rule keys ───┘
//!                    │                │
//!                    │                └──▶ EventBus (origin: change feed)
//!                    ▼
//!             ChannelMachine (subscribe / backoff / disable)
//! ```
//!
//! Each channel runs under the shared
//! [`TaskSupervisor`](strata_core::TaskSupervisor). A channel that fails
//! `max_attempts` times in a row is disabled until realtime sync is
//! re-enabled.

mod engine;
mod machine;
mod rules;

pub use engine::{ChangeOutcome, ChannelSnapshot, RealtimeSyncEngine, SyncStats};
pub use machine::{ChannelMachine, ChannelState, Step};
pub use rules::{event_for, SyncHandler, SyncRule, SyncRules};
