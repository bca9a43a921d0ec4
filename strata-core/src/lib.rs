//! Strata Core - Shared Cache Types
//!
//! Entries, the segmented key grammar, strategy descriptors, the event
//! vocabulary and the error taxonomy. Every other strata crate depends on
//! this one; it holds no storage and no I/O beyond the external-interface
//! traits (`DataSource`, `ChangeTransport`).

pub mod config;
pub mod entry;
pub mod error;
pub mod event;
pub mod feed;
pub mod key;
pub mod source;
pub mod strategy;
pub mod supervisor;

pub use config::{
    AlertThresholds, AlertsConfig, DurableConfig, LayerConfig, PriorityLimits, RealtimeChannel,
    RealtimeConfig, ReconnectConfig, StrataConfig, WriteBehindConfig,
};
pub use entry::{now_ms, Entry, StoredEntry, STALE_FRACTION};
pub use error::{
    CacheError, CacheResult, ConfigError, SourceError, StorageError, SubscriptionError,
    ValidationError,
};
pub use event::{EntityType, Event, EventKind, EventOrigin};
pub use feed::{ChangeNotification, ChangeOperation, ChangeTransport, ChannelStatus, TransportMessage};
pub use key::{CacheKey, CacheKeys, KeyParts, KeyPattern, PatternSegment};
pub use source::DataSource;
pub use strategy::{Priority, StrategyDescriptor, StrategyTable};
pub use supervisor::{FailureHook, SupervisorStats, TaskSupervisor};
