//! Strata Cache - Unified Cache Manager
//!
//! The [`CacheManager`] fronts the memory tier (L1) and the durable tier
//! (L2): reads try L1, then L2 with promotion; writes follow the resolved
//! strategy descriptor; invalidations expand key patterns across both
//! tiers. It subscribes to every event kind on the injected
//! [`EventBus`](strata_events::EventBus) and applies the rule table.
//!
//! All collaborators are passed in explicitly. There are no process-wide
//! instances; construct one manager at startup and share the `Arc`.

mod admission;
mod manager;
pub mod metrics;
mod refresh;
pub mod telemetry;

pub use manager::{CacheManager, EventOutcome, LoadOptions, ManagerMetrics, SetOptions};
pub use metrics::{
    Alert, AlertLevel, AlertMetric, CacheMetrics, GetOutcome, MetricsCollector,
    PerformanceSummary,
};
pub use refresh::{refresh_loader, RefreshLoader};
pub use telemetry::{init_tracing, LogFormat, TelemetryConfig, TelemetryError};
