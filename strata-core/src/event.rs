//! Domain event vocabulary.
//!
//! Events drive invalidation: application code emits them directly, and the
//! realtime sync engine derives them from change-feed notifications.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::ValidationError;

/// Kinds of domain events.
///
/// The known vocabulary is closed; `Custom` carries kinds introduced by
/// configuration. Custom names use the same `entity.action` form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum EventKind {
    PostLiked,
    PostUnliked,
    CommentLiked,
    CommentUnliked,
    UserFollowed,
    UserUnfollowed,
    PostCreated,
    PostUpdated,
    PostDeleted,
    CommentCreated,
    CommentUpdated,
    CommentDeleted,
    UserStatsUpdated,
    UserLogin,
    UserProfileViewed,
    FeedRefresh,
    AppForeground,
    AppBackground,
    SpeciesUpdated,
    CatchCreated,
    CatchUpdated,
    CatchDeleted,
    Custom(String),
}

impl EventKind {
    /// Every built-in kind, in declaration order.
    pub const KNOWN: [EventKind; 22] = [
        EventKind::PostLiked,
        EventKind::PostUnliked,
        EventKind::CommentLiked,
        EventKind::CommentUnliked,
        EventKind::UserFollowed,
        EventKind::UserUnfollowed,
        EventKind::PostCreated,
        EventKind::PostUpdated,
        EventKind::PostDeleted,
        EventKind::CommentCreated,
        EventKind::CommentUpdated,
        EventKind::CommentDeleted,
        EventKind::UserStatsUpdated,
        EventKind::UserLogin,
        EventKind::UserProfileViewed,
        EventKind::FeedRefresh,
        EventKind::AppForeground,
        EventKind::AppBackground,
        EventKind::SpeciesUpdated,
        EventKind::CatchCreated,
        EventKind::CatchUpdated,
        EventKind::CatchDeleted,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            EventKind::PostLiked => "post.liked",
            EventKind::PostUnliked => "post.unliked",
            EventKind::CommentLiked => "comment.liked",
            EventKind::CommentUnliked => "comment.unliked",
            EventKind::UserFollowed => "user.followed",
            EventKind::UserUnfollowed => "user.unfollowed",
            EventKind::PostCreated => "post.created",
            EventKind::PostUpdated => "post.updated",
            EventKind::PostDeleted => "post.deleted",
            EventKind::CommentCreated => "comment.created",
            EventKind::CommentUpdated => "comment.updated",
            EventKind::CommentDeleted => "comment.deleted",
            EventKind::UserStatsUpdated => "user.stats_updated",
            EventKind::UserLogin => "user.login",
            EventKind::UserProfileViewed => "user.profile_viewed",
            EventKind::FeedRefresh => "feed.refresh",
            EventKind::AppForeground => "app.foreground",
            EventKind::AppBackground => "app.background",
            EventKind::SpeciesUpdated => "species.updated",
            EventKind::CatchCreated => "catch.created",
            EventKind::CatchUpdated => "catch.updated",
            EventKind::CatchDeleted => "catch.deleted",
            EventKind::Custom(name) => name,
        }
    }

    pub fn is_custom(&self) -> bool {
        matches!(self, EventKind::Custom(_))
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(known) = Self::KNOWN.iter().find(|k| k.as_str() == s) {
            return Ok(known.clone());
        }
        let well_formed = s.split('.').count() >= 2
            && s.split('.').all(|part| {
                !part.is_empty()
                    && part
                        .chars()
                        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
            });
        if well_formed {
            Ok(EventKind::Custom(s.to_string()))
        } else {
            Err(ValidationError::UnknownEventKind {
                kind: s.to_string(),
            })
        }
    }
}

impl TryFrom<String> for EventKind {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<EventKind> for String {
    fn from(kind: EventKind) -> Self {
        match kind {
            EventKind::Custom(name) => name,
            other => other.as_str().to_string(),
        }
    }
}

/// Entity an event is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Post,
    Comment,
    User,
    Species,
    Catch,
    App,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Post => "post",
            EntityType::Comment => "comment",
            EntityType::User => "user",
            EntityType::Species => "species",
            EntityType::Catch => "catch",
            EntityType::App => "app",
        }
    }
}

/// Where an event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOrigin {
    /// Emitted by application code.
    #[default]
    Application,
    /// Derived from a change-feed notification; invalidations already applied.
    ChangeFeed,
}

/// A domain event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub kind: EventKind,
    pub entity_id: String,
    pub entity_type: EntityType,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
    #[serde(default)]
    pub origin: EventOrigin,
}

impl Event {
    pub fn new(kind: EventKind, entity_type: EntityType, entity_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            kind,
            entity_id: entity_id.into(),
            entity_type,
            timestamp: Utc::now(),
            actor_id: None,
            metadata: None,
            origin: EventOrigin::Application,
        }
    }

    pub fn with_actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_origin(mut self, origin: EventOrigin) -> Self {
        self.origin = origin;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_kinds_round_trip_through_strings() {
        for kind in EventKind::KNOWN.iter() {
            let parsed: EventKind = kind.as_str().parse().unwrap();
            assert_eq!(&parsed, kind);
            assert!(!parsed.is_custom());
        }
    }

    #[test]
    fn test_custom_kind_accepted_when_well_formed() {
        let kind: EventKind = "badge.awarded".parse().unwrap();
        assert_eq!(kind, EventKind::Custom("badge.awarded".to_string()));
        assert_eq!(kind.to_string(), "badge.awarded");
    }

    #[test]
    fn test_malformed_kind_rejected() {
        for bad in ["", "post", "Post.Liked", "post..liked", "post.liked!", ".x"] {
            assert!(bad.parse::<EventKind>().is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn test_event_serializes_kind_as_string() {
        let event = Event::new(EventKind::PostLiked, EntityType::Post, "42").with_actor("u1");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "post.liked");
        assert_eq!(json["entity_type"], "post");
        assert_eq!(json["origin"], "application");
        let back: Event = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }
}
