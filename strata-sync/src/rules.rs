//! Table change handlers and the change → event mapping.
//!
//! A sync rule turns one `(table, operation)` change into the key patterns
//! it makes stale. Rules only compute keys; the engine unions them with the
//! keys of the mapped event and invalidates once.

use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};
use strata_core::{
    CacheKey, CacheKeys, ChangeNotification, ChangeOperation, EntityType, Event, EventKind,
    EventOrigin, KeyPattern, ValidationError,
};

/// Computes the patterns a change invalidates.
pub type SyncHandler = Arc<dyn Fn(&ChangeNotification) -> Vec<KeyPattern> + Send + Sync>;

#[derive(Clone)]
pub struct SyncRule {
    pub table: String,
    pub operation: ChangeOperation,
    handler: SyncHandler,
}

impl fmt::Debug for SyncRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncRule")
            .field("table", &self.table)
            .field("operation", &self.operation)
            .finish_non_exhaustive()
    }
}

impl SyncRule {
    pub fn new(table: impl Into<String>, operation: ChangeOperation, handler: SyncHandler) -> Self {
        Self {
            table: table.into(),
            operation,
            handler,
        }
    }

    pub fn applies_to(&self, change: &ChangeNotification) -> bool {
        self.table == change.table && self.operation == change.operation
    }

    pub fn affected_keys(&self, change: &ChangeNotification) -> Vec<KeyPattern> {
        (self.handler)(change)
    }
}

/// Ordered sync rules.
#[derive(Debug, Clone, Default)]
pub struct SyncRules {
    rules: Vec<SyncRule>,
}

impl SyncRules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handlers for likes, posts, comments, follows, user_stats and post_stats.
    pub fn standard() -> Self {
        use ChangeOperation::{Delete, Insert, Update};

        let mut rules = Self::new();
        for op in [Insert, Delete] {
            rules.add(SyncRule::new("likes", op, handler(like_keys)));
            rules.add(SyncRule::new("follows", op, handler(follow_keys)));
        }
        for op in [Insert, Update, Delete] {
            let touches_map = op != Delete;
            rules.add(SyncRule::new(
                "posts",
                op,
                Arc::new(move |change: &ChangeNotification| -> Vec<KeyPattern> {
                    post_keys(change, touches_map)
                }),
            ));
            rules.add(SyncRule::new("comments", op, handler(comment_keys)));
        }
        rules.add(SyncRule::new("user_stats", Update, handler(user_stats_keys)));
        rules.add(SyncRule::new("post_stats", Update, handler(post_stats_keys)));
        rules
    }

    pub fn add(&mut self, rule: SyncRule) {
        self.rules.push(rule);
    }

    /// Remove every rule for `table` x `operation`. Returns how many went.
    pub fn remove(&mut self, table: &str, operation: ChangeOperation) -> usize {
        let before = self.rules.len();
        self.rules
            .retain(|r| !(r.table == table && r.operation == operation));
        before - self.rules.len()
    }

    /// Deduplicated patterns from every rule matching `change`.
    pub fn affected_keys(&self, change: &ChangeNotification) -> Vec<KeyPattern> {
        let mut out = Vec::new();
        for rule in self.rules.iter().filter(|r| r.applies_to(change)) {
            push_unique(&mut out, rule.affected_keys(change));
        }
        out
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn clear(&mut self) {
        self.rules.clear();
    }
}

pub(crate) fn push_unique(target: &mut Vec<KeyPattern>, patterns: Vec<KeyPattern>) {
    for pattern in patterns {
        if !target.contains(&pattern) {
            target.push(pattern);
        }
    }
}

fn handler(f: fn(&ChangeNotification) -> Vec<KeyPattern>) -> SyncHandler {
    Arc::new(f)
}

/// Collect the keys that built; ids that are not valid key segments are
/// skipped.
fn collect(
    change: &ChangeNotification,
    keys: impl IntoIterator<Item = Result<KeyPattern, ValidationError>>,
) -> Vec<KeyPattern> {
    keys.into_iter()
        .filter_map(|k| match k {
            Ok(pattern) => Some(pattern),
            Err(e) => {
                tracing::debug!(table = %change.table, error = %e, "Skipping key for change");
                None
            }
        })
        .collect()
}

fn exact(key: Result<CacheKey, ValidationError>) -> Result<KeyPattern, ValidationError> {
    key.map(KeyPattern::from)
}

fn pages(key: Result<CacheKey, ValidationError>) -> Result<KeyPattern, ValidationError> {
    key.map(|k| CacheKeys::all_pages(&k))
}

fn like_keys(change: &ChangeNotification) -> Vec<KeyPattern> {
    let user = change.field("user_id");
    let mut keys = Vec::new();
    if let Some(post) = change.field("post_id") {
        keys.push(exact(CacheKeys::post_likes(&post)));
        keys.push(pages(CacheKeys::post_likers(&post)));
        keys.push(exact(CacheKeys::post_stats(&post)));
        if let Some(user) = &user {
            keys.push(exact(CacheKeys::user_liked_posts(user)));
        }
    }
    if let Some(comment) = change.field("comment_id") {
        keys.push(exact(CacheKeys::comment_likes(&comment)));
        keys.push(pages(CacheKeys::comment_likers(&comment)));
        if let Some(user) = &user {
            keys.push(exact(CacheKeys::user_liked_comments(user)));
        }
    }
    collect(change, keys)
}

fn post_keys(change: &ChangeNotification, touches_map: bool) -> Vec<KeyPattern> {
    let Some(post) = change.field("id") else {
        return Vec::new();
    };
    let mut keys = vec![
        exact(CacheKeys::post(&post)),
        exact(CacheKeys::post_likes(&post)),
        exact(CacheKeys::post_comments(&post)),
        exact(CacheKeys::post_stats(&post)),
    ];
    if touches_map {
        keys.push(KeyPattern::parse("map*"));
    }
    collect(change, keys)
}

fn comment_keys(change: &ChangeNotification) -> Vec<KeyPattern> {
    let (Some(comment), Some(post)) = (change.field("id"), change.field("post_id")) else {
        return Vec::new();
    };
    collect(
        change,
        [
            exact(CacheKeys::comment(&comment)),
            exact(CacheKeys::comment_likes(&comment)),
            exact(CacheKeys::post_comments(&post)),
            exact(CacheKeys::post_stats(&post)),
        ],
    )
}

fn follow_keys(change: &ChangeNotification) -> Vec<KeyPattern> {
    let (Some(follower), Some(following)) =
        (change.field("follower_id"), change.field("following_id"))
    else {
        return Vec::new();
    };
    collect(
        change,
        [
            exact(CacheKeys::user_follows(&follower)),
            exact(CacheKeys::user_stats(&follower)),
            exact(CacheKeys::user_stats(&following)),
        ],
    )
}

fn user_stats_keys(change: &ChangeNotification) -> Vec<KeyPattern> {
    match change.field("user_id") {
        Some(user) => collect(change, [exact(CacheKeys::user_stats(&user))]),
        None => Vec::new(),
    }
}

fn post_stats_keys(change: &ChangeNotification) -> Vec<KeyPattern> {
    match change.field("post_id") {
        Some(post) => collect(change, [exact(CacheKeys::post_stats(&post))]),
        None => Vec::new(),
    }
}

/// The domain event a change stands for, if any.
///
/// The entity id is the first present of `post_id`, `comment_id`,
/// `following_id` and `id`; the actor is `user_id` or `follower_id`.
/// Changes without any entity id produce no event.
pub fn event_for(change: &ChangeNotification) -> Option<Event> {
    use ChangeOperation::{Delete, Insert, Update};

    let on_post = change.field("post_id").is_some();
    let (kind, entity_type) = match (change.table.as_str(), change.operation) {
        ("likes", Insert) if on_post => (EventKind::PostLiked, EntityType::Post),
        ("likes", Insert) => (EventKind::CommentLiked, EntityType::Comment),
        ("likes", Delete) if on_post => (EventKind::PostUnliked, EntityType::Post),
        ("likes", Delete) => (EventKind::CommentUnliked, EntityType::Comment),
        ("posts", Insert) => (EventKind::PostCreated, EntityType::Post),
        ("posts", Update) => (EventKind::PostUpdated, EntityType::Post),
        ("posts", Delete) => (EventKind::PostDeleted, EntityType::Post),
        ("comments", Insert) => (EventKind::CommentCreated, EntityType::Comment),
        ("comments", Update) => (EventKind::CommentUpdated, EntityType::Comment),
        ("comments", Delete) => (EventKind::CommentDeleted, EntityType::Comment),
        ("follows", Insert) => (EventKind::UserFollowed, EntityType::User),
        ("follows", Delete) => (EventKind::UserUnfollowed, EntityType::User),
        _ => return None,
    };

    let entity_id = ["post_id", "comment_id", "following_id", "id"]
        .iter()
        .find_map(|f| change.field(f))?;

    let mut metadata = Map::new();
    metadata.insert("table".to_string(), Value::from(change.table.clone()));
    metadata.insert(
        "operation".to_string(),
        Value::from(change.operation.as_str()),
    );

    let mut event = Event::new(kind, entity_type, entity_id)
        .with_metadata(metadata)
        .with_origin(EventOrigin::ChangeFeed);
    if let Some(actor) = change
        .field("user_id")
        .or_else(|| change.field("follower_id"))
    {
        event = event.with_actor(actor);
    }
    Some(event)
}
