//! Declarative invalidation rules.
//!
//! A rule maps one event kind to the key patterns it affects and the
//! action to take on them. Most rules are written as key templates where
//! `{id}` stands for the event's entity id and `{actor}` for its actor id.

use std::fmt;
use std::sync::Arc;

use strata_core::{Event, EventKind, KeyPattern};

/// What to do with the affected keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleAction {
    /// Delete matching keys from both tiers.
    Invalidate,
    /// Reload matching keys that have a registered loader.
    Refresh,
    /// Reserved; no built-in rule uses it.
    Update,
}

impl RuleAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleAction::Invalidate => "invalidate",
            RuleAction::Refresh => "refresh",
            RuleAction::Update => "update",
        }
    }
}

/// Scheduling hint for a rule.
///
/// `Immediate` and `Batch` rules run inline with event delivery (all
/// inline invalidations of one event are merged into a single pass);
/// `Background` rules are handed to the task supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RulePriority {
    Immediate,
    Batch,
    Background,
}

/// Computes the patterns an event affects.
pub type AffectedKeys = Arc<dyn Fn(&Event) -> Vec<KeyPattern> + Send + Sync>;

#[derive(Clone)]
pub struct InvalidationRule {
    pub on_event: EventKind,
    pub action: RuleAction,
    pub priority: RulePriority,
    affected: AffectedKeys,
}

impl fmt::Debug for InvalidationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvalidationRule")
            .field("on_event", &self.on_event)
            .field("action", &self.action)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

impl InvalidationRule {
    pub fn new(
        on_event: EventKind,
        action: RuleAction,
        priority: RulePriority,
        affected: AffectedKeys,
    ) -> Self {
        Self {
            on_event,
            action,
            priority,
            affected,
        }
    }

    /// Rule whose patterns come from `templates`.
    ///
    /// Templates naming `{actor}` are skipped for events without an actor,
    /// and substituted values must be a single key segment.
    pub fn templated(
        on_event: EventKind,
        action: RuleAction,
        priority: RulePriority,
        templates: &[&str],
    ) -> Self {
        let templates: Vec<String> = templates.iter().map(|t| t.to_string()).collect();
        let affected: AffectedKeys = Arc::new(move |event: &Event| -> Vec<KeyPattern> {
            templates
                .iter()
                .filter_map(|template| expand(template, event))
                .collect()
        });
        Self::new(on_event, action, priority, affected)
    }

    pub fn affected_keys(&self, event: &Event) -> Vec<KeyPattern> {
        (self.affected)(event)
    }
}

fn is_segment_value(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_graphic() && c != ':' && c != '*')
}

/// Substitute `{id}` and `{actor}` in `template` and parse the result.
fn expand(template: &str, event: &Event) -> Option<KeyPattern> {
    let mut raw = template.to_string();
    if raw.contains("{id}") {
        if !is_segment_value(&event.entity_id) {
            tracing::debug!(template, id = %event.entity_id, "Entity id is not a key segment, skipping");
            return None;
        }
        raw = raw.replace("{id}", &event.entity_id);
    }
    if raw.contains("{actor}") {
        let actor = event.actor_id.as_deref().filter(|a| is_segment_value(a))?;
        raw = raw.replace("{actor}", actor);
    }
    match KeyPattern::parse(&raw) {
        Ok(pattern) => Some(pattern),
        Err(e) => {
            tracing::warn!(template, error = %e, "Rule template produced an invalid pattern");
            None
        }
    }
}

/// Ordered list of rules.
#[derive(Debug, Clone, Default)]
pub struct RuleTable {
    rules: Vec<InvalidationRule>,
}

impl RuleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The production rule set.
    pub fn standard() -> Self {
        use RuleAction::{Invalidate, Refresh};
        use RulePriority::{Background, Batch, Immediate};

        let like_keys: &[&str] = &[
            "post:{id}:likes",
            "post:{id}:likers*",
            "post:{id}:stats",
            "user:{actor}:liked_posts",
        ];

        let mut table = Self::new();
        table.push(InvalidationRule::templated(
            EventKind::PostLiked,
            Invalidate,
            Immediate,
            like_keys,
        ));
        table.push(InvalidationRule::templated(
            EventKind::PostUnliked,
            Invalidate,
            Immediate,
            like_keys,
        ));
        table.push(InvalidationRule::templated(
            EventKind::CommentLiked,
            Invalidate,
            Immediate,
            &[
                "comment:{id}:likes",
                "comment:{id}:likers*",
                "user:{actor}:liked_comments",
            ],
        ));
        table.push(InvalidationRule::templated(
            EventKind::UserFollowed,
            Invalidate,
            Immediate,
            &[
                "user:{actor}:follows",
                "user:{id}:stats",
                "user:{actor}:stats",
            ],
        ));
        table.push(InvalidationRule::templated(
            EventKind::PostCreated,
            Invalidate,
            Batch,
            &["map*", "user:{actor}:stats"],
        ));
        table.push(InvalidationRule::templated(
            EventKind::UserLogin,
            Refresh,
            Background,
            &["user:{actor}:*", "feed*"],
        ));
        table.push(InvalidationRule::templated(
            EventKind::AppForeground,
            Refresh,
            Background,
            &["weather*", "user:*:stats"],
        ));
        table
    }

    pub fn push(&mut self, rule: InvalidationRule) {
        self.rules.push(rule);
    }

    /// Remove every rule for `kind`. Returns how many were removed.
    pub fn remove_for(&mut self, kind: &EventKind) -> usize {
        let before = self.rules.len();
        self.rules.retain(|r| &r.on_event != kind);
        before - self.rules.len()
    }

    pub fn matching<'a>(&'a self, kind: &'a EventKind) -> impl Iterator<Item = &'a InvalidationRule> {
        self.rules.iter().filter(move |r| &r.on_event == kind)
    }

    /// Deduplicated patterns from every rule for `event` with `action`.
    pub fn affected_keys(&self, event: &Event, action: RuleAction) -> Vec<KeyPattern> {
        let mut out: Vec<KeyPattern> = Vec::new();
        for rule in self.matching(&event.kind).filter(|r| r.action == action) {
            for pattern in rule.affected_keys(event) {
                if !out.contains(&pattern) {
                    out.push(pattern);
                }
            }
        }
        out
    }

    pub fn iter(&self) -> impl Iterator<Item = &InvalidationRule> {
        self.rules.iter()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::EntityType;
    use strata_test_utils::fixtures::{post_liked, user_followed};

    fn strings(patterns: &[KeyPattern]) -> Vec<&str> {
        patterns.iter().map(KeyPattern::as_str).collect()
    }

    #[test]
    fn test_post_liked_affects_four_keys() {
        let table = RuleTable::standard();
        let keys = table.affected_keys(&post_liked("42", "u7"), RuleAction::Invalidate);
        assert_eq!(
            strings(&keys),
            vec![
                "post:42:likes",
                "post:42:likers*",
                "post:42:stats",
                "user:u7:liked_posts"
            ]
        );
    }

    #[test]
    fn test_missing_actor_skips_actor_keys() {
        let table = RuleTable::standard();
        let event = Event::new(EventKind::PostLiked, EntityType::Post, "42");
        let keys = table.affected_keys(&event, RuleAction::Invalidate);
        assert_eq!(
            strings(&keys),
            vec!["post:42:likes", "post:42:likers*", "post:42:stats"]
        );
    }

    #[test]
    fn test_user_followed_uses_entity_and_actor() {
        let table = RuleTable::standard();
        let keys = table.affected_keys(&user_followed("b", "a"), RuleAction::Invalidate);
        assert_eq!(
            strings(&keys),
            vec!["user:a:follows", "user:b:stats", "user:a:stats"]
        );
    }

    #[test]
    fn test_refresh_rules_are_separate_from_invalidate() {
        let table = RuleTable::standard();
        let login = Event::new(EventKind::UserLogin, EntityType::User, "u1").with_actor("u1");
        assert!(table
            .affected_keys(&login, RuleAction::Invalidate)
            .is_empty());
        assert_eq!(
            strings(&table.affected_keys(&login, RuleAction::Refresh)),
            vec!["user:u1:*", "feed*"]
        );

        let rule = table.matching(&EventKind::UserLogin).next().unwrap();
        assert_eq!(rule.priority, RulePriority::Background);
    }

    #[test]
    fn test_every_refresh_rule_runs_in_background() {
        let table = RuleTable::standard();
        let foreground = table.matching(&EventKind::AppForeground).next().unwrap();
        assert_eq!(foreground.action, RuleAction::Refresh);
        assert_eq!(foreground.priority, RulePriority::Background);

        assert!(table
            .iter()
            .filter(|r| r.action == RuleAction::Refresh)
            .all(|r| r.priority == RulePriority::Background));
    }

    #[test]
    fn test_id_with_separator_is_rejected() {
        let table = RuleTable::standard();
        let event = post_liked("4:2", "u7");
        let keys = table.affected_keys(&event, RuleAction::Invalidate);
        assert_eq!(strings(&keys), vec!["user:u7:liked_posts"]);
    }

    #[test]
    fn test_unmatched_kind_has_no_keys() {
        let table = RuleTable::standard();
        let event = Event::new(EventKind::SpeciesUpdated, EntityType::Species, "9");
        assert!(table.affected_keys(&event, RuleAction::Invalidate).is_empty());
    }

    #[test]
    fn test_custom_rule_and_removal() {
        let mut table = RuleTable::new();
        let kind: EventKind = "trip.planned".parse().unwrap();
        table.push(InvalidationRule::new(
            kind.clone(),
            RuleAction::Invalidate,
            RulePriority::Immediate,
            Arc::new(|e: &Event| -> Vec<KeyPattern> {
                KeyPattern::parse(&format!("trip:{}*", e.entity_id))
                    .into_iter()
                    .collect()
            }),
        ));
        let event = Event::new(kind.clone(), EntityType::App, "t1");
        assert_eq!(
            strings(&table.affected_keys(&event, RuleAction::Invalidate)),
            vec!["trip:t1*"]
        );
        assert_eq!(table.remove_for(&kind), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn test_standard_table_shape() {
        let table = RuleTable::standard();
        assert_eq!(table.len(), 7);
        let refresh = table
            .iter()
            .filter(|r| r.action == RuleAction::Refresh)
            .count();
        assert_eq!(refresh, 2);
    }

    mod prop_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(100))]

            #[test]
            fn prop_affected_patterns_match_their_own_keys(
                id in "[a-z0-9]{1,8}",
                actor in "[a-z0-9]{1,8}",
            ) {
                let table = RuleTable::standard();
                let event = post_liked(&id, &actor);
                let likes = strata_core::CacheKeys::post_likes(&id).unwrap();
                let keys = table.affected_keys(&event, RuleAction::Invalidate);
                prop_assert!(keys.iter().any(|p| p.matches(&likes)));
                prop_assert!(keys.iter().all(|p| p.as_str().contains(id.as_str())
                    || p.as_str().contains(actor.as_str())));
            }
        }
    }
}
