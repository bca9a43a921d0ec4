//! Per-resource caching strategy descriptors.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::event::EventKind;

/// Eviction priority class of a resource type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
}

impl Priority {
    pub const ALL: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Medium,
        Priority::Low,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

/// How one resource type is cached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StrategyDescriptor {
    pub ttl_ms: u64,
    pub priority: Priority,
    #[serde(default)]
    pub invalidate_on: Vec<EventKind>,
    #[serde(default)]
    pub refresh_on: Vec<EventKind>,
    /// Maximum tracked entries for this resource type.
    pub max_size: usize,
    /// Also write to the durable tier.
    #[serde(default)]
    pub persistence: bool,
    #[serde(default)]
    pub compression: bool,
    #[serde(default)]
    pub background_refresh: bool,
    #[serde(default)]
    pub stale_while_revalidate: bool,
}

const MINUTE_MS: u64 = 60 * 1000;
const HOUR_MS: u64 = 60 * MINUTE_MS;

impl StrategyDescriptor {
    pub fn new(ttl: Duration, priority: Priority, max_size: usize) -> Self {
        Self {
            ttl_ms: u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
            priority,
            invalidate_on: Vec::new(),
            refresh_on: Vec::new(),
            max_size,
            persistence: false,
            compression: false,
            background_refresh: false,
            stale_while_revalidate: false,
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn invalidate_on(mut self, kinds: impl IntoIterator<Item = EventKind>) -> Self {
        self.invalidate_on = kinds.into_iter().collect();
        self
    }

    pub fn refresh_on(mut self, kinds: impl IntoIterator<Item = EventKind>) -> Self {
        self.refresh_on = kinds.into_iter().collect();
        self
    }

    pub fn persistent(mut self, persistence: bool) -> Self {
        self.persistence = persistence;
        self
    }

    pub fn compressed(mut self, compression: bool) -> Self {
        self.compression = compression;
        self
    }

    pub fn background_refresh(mut self, enabled: bool) -> Self {
        self.background_refresh = enabled;
        self
    }

    pub fn stale_while_revalidate(mut self, enabled: bool) -> Self {
        self.stale_while_revalidate = enabled;
        self
    }

    /// Descriptor used when a caller names no known strategy.
    pub fn fallback() -> Self {
        Self::new(Duration::from_millis(5 * MINUTE_MS), Priority::Medium, 1000).persistent(true)
    }
}

impl Default for StrategyDescriptor {
    fn default() -> Self {
        Self::fallback()
    }
}

/// Named strategy descriptors plus the fallback for unknown names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyTable {
    #[serde(default = "StrategyDescriptor::fallback")]
    pub fallback: StrategyDescriptor,
    #[serde(flatten)]
    pub named: BTreeMap<String, StrategyDescriptor>,
}

impl StrategyTable {
    pub fn empty() -> Self {
        Self {
            fallback: StrategyDescriptor::fallback(),
            named: BTreeMap::new(),
        }
    }

    /// Resolve a name, falling back to the generic descriptor.
    pub fn resolve(&self, name: Option<&str>) -> (&str, &StrategyDescriptor) {
        match name.and_then(|n| self.named.get_key_value(n)) {
            Some((name, descriptor)) => (name.as_str(), descriptor),
            None => ("default", &self.fallback),
        }
    }

    pub fn get(&self, name: &str) -> Option<&StrategyDescriptor> {
        self.named.get(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, descriptor: StrategyDescriptor) {
        self.named.insert(name.into(), descriptor);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &StrategyDescriptor)> {
        self.named.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl Default for StrategyTable {
    /// The production strategy table.
    fn default() -> Self {
        use EventKind::*;

        let mut table = Self::empty();
        table.insert(
            "likes",
            StrategyDescriptor::new(Duration::from_millis(10 * MINUTE_MS), Priority::Critical, 1000)
                .invalidate_on([PostLiked, PostUnliked, CommentLiked, CommentUnliked])
                .refresh_on([UserLogin])
                .persistent(true)
                .background_refresh(true)
                .stale_while_revalidate(true),
        );
        table.insert(
            "follows",
            StrategyDescriptor::new(Duration::from_millis(15 * MINUTE_MS), Priority::Critical, 500)
                .invalidate_on([UserFollowed, UserUnfollowed])
                .refresh_on([UserLogin, UserProfileViewed])
                .persistent(true)
                .background_refresh(true),
        );
        table.insert(
            "posts",
            StrategyDescriptor::new(Duration::from_millis(5 * MINUTE_MS), Priority::High, 200)
                .invalidate_on([PostCreated, PostUpdated, PostDeleted])
                .refresh_on([UserLogin, FeedRefresh])
                .persistent(true)
                .compressed(true)
                .stale_while_revalidate(true),
        );
        table.insert(
            "comments",
            StrategyDescriptor::new(Duration::from_millis(5 * MINUTE_MS), Priority::High, 300)
                .invalidate_on([CommentCreated, CommentUpdated, CommentDeleted])
                .persistent(true),
        );
        table.insert(
            "user_stats",
            StrategyDescriptor::new(Duration::from_millis(30 * MINUTE_MS), Priority::Medium, 100)
                .invalidate_on([UserStatsUpdated, UserFollowed, UserUnfollowed])
                .persistent(true),
        );
        table.insert(
            "map_catches",
            StrategyDescriptor::new(Duration::from_millis(24 * HOUR_MS), Priority::Medium, 500)
                .invalidate_on([CatchCreated, CatchUpdated, CatchDeleted])
                .persistent(true)
                .compressed(true)
                .background_refresh(true),
        );
        table.insert(
            "weather",
            StrategyDescriptor::new(Duration::from_millis(30 * MINUTE_MS), Priority::Low, 50)
                .persistent(true)
                .background_refresh(true)
                .stale_while_revalidate(true),
        );
        table.insert(
            "species",
            StrategyDescriptor::new(Duration::from_millis(24 * HOUR_MS), Priority::Low, 1000)
                .invalidate_on([SpeciesUpdated])
                .persistent(true)
                .compressed(true),
        );
        table
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_known_and_unknown_names() {
        let table = StrategyTable::default();
        let (name, likes) = table.resolve(Some("likes"));
        assert_eq!(name, "likes");
        assert_eq!(likes.priority, Priority::Critical);
        assert!(likes.stale_while_revalidate);

        let (name, fallback) = table.resolve(Some("nope"));
        assert_eq!(name, "default");
        assert_eq!(fallback.ttl(), Duration::from_secs(300));
        assert!(fallback.persistence);

        let (name, _) = table.resolve(None);
        assert_eq!(name, "default");
    }

    #[test]
    fn test_default_table_contents() {
        let table = StrategyTable::default();
        assert_eq!(table.named.len(), 8);
        assert_eq!(table.get("weather").map(|d| d.max_size), Some(50));
        assert_eq!(
            table.get("species").map(|d| d.ttl()),
            Some(Duration::from_secs(24 * 60 * 60))
        );
        assert!(table.get("weather").is_some_and(|d| d.invalidate_on.is_empty()));
    }

    #[test]
    fn test_descriptor_toml_shape() {
        let raw = r#"
            ttl_ms = 60000
            priority = "high"
            invalidate_on = ["post.liked", "badge.awarded"]
            max_size = 10
            persistence = true
        "#;
        let descriptor: StrategyDescriptor = toml::from_str(raw).unwrap();
        assert_eq!(descriptor.priority, Priority::High);
        assert_eq!(
            descriptor.invalidate_on,
            vec![
                EventKind::PostLiked,
                EventKind::Custom("badge.awarded".to_string())
            ]
        );
        assert!(!descriptor.stale_while_revalidate);
    }

    #[test]
    fn test_descriptor_rejects_bad_event_kind() {
        let raw = r#"
            ttl_ms = 1
            priority = "low"
            invalidate_on = ["NotAKind"]
            max_size = 1
        "#;
        assert!(toml::from_str::<StrategyDescriptor>(raw).is_err());
    }
}
