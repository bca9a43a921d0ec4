//! Strata Test Utilities
//!
//! Shared test infrastructure for the strata workspace:
//! - An in-memory `DataSource` with call counters, delays and failure injection
//! - A scripted `ChangeTransport` for driving the realtime sync engine
//! - Proptest generators for keys, patterns and events
//! - Fixtures for common rows, events and configurations

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

pub use strata_core::{
    CacheKey, ChangeNotification, ChangeOperation, ChangeTransport, ChannelStatus, EntityType,
    Event, EventKind, KeyPattern, SourceError, SubscriptionError, TransportMessage,
};
use strata_core::DataSource;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// IN-MEMORY DATA SOURCE
// ============================================================================

/// `DataSource` backed by a hash map.
///
/// Counts every call, can sleep before answering (on the tokio clock, so
/// paused-time tests stay deterministic) and can fail reads, writes or
/// individual keys on demand.
pub struct InMemoryDataSource<T> {
    data: Mutex<HashMap<CacheKey, T>>,
    delay: Mutex<Option<Duration>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    failing_keys: Mutex<HashSet<CacheKey>>,
    get_calls: AtomicU64,
    set_calls: AtomicU64,
    delete_calls: AtomicU64,
}

impl<T: Clone + Send + Sync + 'static> InMemoryDataSource<T> {
    pub fn new() -> Self {
        Self {
            data: Mutex::new(HashMap::new()),
            delay: Mutex::new(None),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            failing_keys: Mutex::new(HashSet::new()),
            get_calls: AtomicU64::new(0),
            set_calls: AtomicU64::new(0),
            delete_calls: AtomicU64::new(0),
        }
    }

    pub fn with_delay(self, delay: Duration) -> Self {
        self.set_delay(delay);
        self
    }

    pub fn set_delay(&self, delay: Duration) {
        *lock(&self.delay) = Some(delay);
    }

    pub fn insert(&self, key: &CacheKey, value: T) {
        lock(&self.data).insert(key.clone(), value);
    }

    pub fn remove(&self, key: &CacheKey) -> Option<T> {
        lock(&self.data).remove(key)
    }

    pub fn value(&self, key: &CacheKey) -> Option<T> {
        lock(&self.data).get(key).cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.data).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get_calls(&self) -> u64 {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub fn set_calls(&self) -> u64 {
        self.set_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> u64 {
        self.delete_calls.load(Ordering::SeqCst)
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Fail every operation on `key` until [`clear_failures`](Self::clear_failures).
    pub fn fail_key(&self, key: &CacheKey) {
        lock(&self.failing_keys).insert(key.clone());
    }

    pub fn clear_failures(&self) {
        lock(&self.failing_keys).clear();
        self.set_fail_reads(false);
        self.set_fail_writes(false);
    }

    async fn pause(&self) {
        let delay = *lock(&self.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn key_fails(&self, key: &CacheKey) -> bool {
        lock(&self.failing_keys).contains(key)
    }
}

impl<T: Clone + Send + Sync + 'static> Default for InMemoryDataSource<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> DataSource<T> for InMemoryDataSource<T> {
    async fn get(&self, key: &CacheKey) -> Result<Option<T>, SourceError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        if self.fail_reads.load(Ordering::SeqCst) || self.key_fails(key) {
            return Err(SourceError::ReadFailed {
                key: key.to_string(),
                reason: "injected read failure".to_string(),
            });
        }
        Ok(self.value(key))
    }

    async fn set(&self, key: &CacheKey, data: &T) -> Result<(), SourceError> {
        self.set_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        if self.fail_writes.load(Ordering::SeqCst) || self.key_fails(key) {
            return Err(SourceError::WriteFailed {
                key: key.to_string(),
                reason: "injected write failure".to_string(),
            });
        }
        self.insert(key, data.clone());
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> Result<(), SourceError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        if self.fail_writes.load(Ordering::SeqCst) || self.key_fails(key) {
            return Err(SourceError::DeleteFailed {
                key: key.to_string(),
                reason: "injected delete failure".to_string(),
            });
        }
        self.remove(key);
        Ok(())
    }
}

// ============================================================================
// SCRIPTED CHANGE TRANSPORT
// ============================================================================

/// What the transport does on the next `subscribe` for a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedOutcome {
    /// Accept and report `Subscribed`.
    Subscribed,
    /// Accept, then report `Error(reason)`.
    StatusError(String),
    /// Accept, then report `Closed`.
    Closed,
    /// Reject the call itself.
    Reject(String),
    /// Accept and report nothing.
    Silent,
}

/// `ChangeTransport` whose subscribe outcomes are queued per channel.
///
/// With an empty script a subscribe succeeds. Sinks are kept so tests can
/// push changes and status updates into a live subscription.
#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<HashMap<String, VecDeque<ScriptedOutcome>>>,
    sinks: Mutex<HashMap<String, mpsc::Sender<TransportMessage>>>,
    subscribes: Mutex<Vec<String>>,
    unsubscribes: Mutex<Vec<String>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue outcomes for successive subscribes on `channel`.
    pub fn script(&self, channel: &str, outcomes: impl IntoIterator<Item = ScriptedOutcome>) {
        lock(&self.script)
            .entry(channel.to_string())
            .or_default()
            .extend(outcomes);
    }

    /// Number of subscribe calls seen for `channel`.
    pub fn subscribe_count(&self, channel: &str) -> usize {
        lock(&self.subscribes).iter().filter(|c| *c == channel).count()
    }

    pub fn unsubscribed(&self) -> Vec<String> {
        lock(&self.unsubscribes).clone()
    }

    pub fn is_live(&self, channel: &str) -> bool {
        lock(&self.sinks).contains_key(channel)
    }

    /// Deliver a change on `channel`. Returns false when nobody listens.
    pub async fn push_change(&self, channel: &str, change: ChangeNotification) -> bool {
        self.push(channel, TransportMessage::Change(change)).await
    }

    pub async fn push_status(&self, channel: &str, status: ChannelStatus) -> bool {
        self.push(channel, TransportMessage::Status(status)).await
    }

    async fn push(&self, channel: &str, message: TransportMessage) -> bool {
        let sink = lock(&self.sinks).get(channel).cloned();
        match sink {
            Some(sink) => sink.send(message).await.is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl ChangeTransport for ScriptedTransport {
    async fn subscribe(
        &self,
        channel: &str,
        _tables: &[String],
        _operations: &[ChangeOperation],
        sink: mpsc::Sender<TransportMessage>,
    ) -> Result<(), SubscriptionError> {
        lock(&self.subscribes).push(channel.to_string());
        let outcome = lock(&self.script)
            .get_mut(channel)
            .and_then(VecDeque::pop_front)
            .unwrap_or(ScriptedOutcome::Subscribed);

        let status = match outcome {
            ScriptedOutcome::Reject(reason) => {
                return Err(SubscriptionError::SubscribeFailed {
                    channel: channel.to_string(),
                    reason,
                });
            }
            ScriptedOutcome::Subscribed => Some(ChannelStatus::Subscribed),
            ScriptedOutcome::StatusError(reason) => Some(ChannelStatus::Error(reason)),
            ScriptedOutcome::Closed => Some(ChannelStatus::Closed),
            ScriptedOutcome::Silent => None,
        };

        lock(&self.sinks).insert(channel.to_string(), sink.clone());
        if let Some(status) = status {
            let _ = sink.send(TransportMessage::Status(status)).await;
        }
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), SubscriptionError> {
        lock(&self.unsubscribes).push(channel.to_string());
        lock(&self.sinks).remove(channel);
        Ok(())
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    use super::*;
    use proptest::prelude::*;
    use strata_core::PatternSegment;

    /// A single key segment.
    pub fn arb_segment() -> impl Strategy<Value = String> {
        "[a-z0-9_]{1,8}"
    }

    /// A key of one to five segments.
    pub fn arb_key() -> impl Strategy<Value = CacheKey> {
        prop::collection::vec(arb_segment(), 1..=5).prop_filter_map("valid key", |segments| {
            CacheKey::from_segments(segments).ok()
        })
    }

    /// A pattern segment; `Prefix` is only produced for the last position.
    pub fn arb_pattern_segment(last: bool) -> BoxedStrategy<PatternSegment> {
        if last {
            prop_oneof![
                3 => arb_segment().prop_map(PatternSegment::Literal),
                1 => Just(PatternSegment::Any),
                1 => "[a-z0-9_]{0,4}".prop_map(PatternSegment::Prefix),
            ]
            .boxed()
        } else {
            prop_oneof![
                3 => arb_segment().prop_map(PatternSegment::Literal),
                1 => Just(PatternSegment::Any),
            ]
            .boxed()
        }
    }

    /// A pattern derived from `key` with some segments widened.
    pub fn arb_pattern_for(key: CacheKey) -> impl Strategy<Value = KeyPattern> {
        let segments: Vec<String> = key.segments().map(str::to_string).collect();
        let n = segments.len();
        (prop::collection::vec(any::<bool>(), n), any::<bool>()).prop_filter_map(
            "valid pattern",
            move |(widen, prefix_last)| {
                let mut parts: Vec<String> = segments
                    .iter()
                    .zip(&widen)
                    .map(|(s, w)| if *w { "*".to_string() } else { s.clone() })
                    .collect();
                if prefix_last {
                    if let Some(last) = parts.last_mut() {
                        if last.as_str() != "*" {
                            let keep = last.len() / 2;
                            *last = format!("{}*", &last[..keep]);
                        }
                    }
                }
                KeyPattern::parse(&parts.join(":")).ok()
            },
        )
    }

    /// One of the known event kinds.
    pub fn arb_known_event_kind() -> impl Strategy<Value = EventKind> {
        proptest::sample::select(EventKind::KNOWN.to_vec())
    }

    pub fn arb_event() -> impl Strategy<Value = Event> {
        (
            arb_known_event_kind(),
            "[0-9]{1,6}",
            proptest::option::of("[a-z0-9]{1,8}"),
        )
            .prop_map(|(kind, id, actor)| {
                let event = Event::new(kind, EntityType::Post, id);
                match actor {
                    Some(actor) => event.with_actor(actor),
                    None => event,
                }
            })
    }

    pub fn arb_change_operation() -> impl Strategy<Value = ChangeOperation> {
        proptest::sample::select(ChangeOperation::ALL.to_vec())
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    use super::*;
    use serde_json::{Map, Value};
    use strata_core::StrataConfig;

    /// Parse a key literal, panicking on bad input.
    pub fn key(raw: &str) -> CacheKey {
        CacheKey::parse(raw).unwrap_or_else(|e| panic!("bad fixture key {raw}: {e}"))
    }

    pub fn pattern(raw: &str) -> KeyPattern {
        KeyPattern::parse(raw).unwrap_or_else(|e| panic!("bad fixture pattern {raw}: {e}"))
    }

    pub fn keys(raw: &[&str]) -> Vec<CacheKey> {
        raw.iter().map(|r| key(r)).collect()
    }

    /// A JSON object as a row image.
    pub fn row(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("fixture row must be an object, got {other}"),
        }
    }

    /// A change carrying `image` as its new row (old row for deletes).
    pub fn change(table: &str, operation: ChangeOperation, image: Value) -> ChangeNotification {
        let base = ChangeNotification::new(table, operation);
        if operation == ChangeOperation::Delete {
            base.with_old(row(image))
        } else {
            base.with_new(row(image))
        }
    }

    pub fn post_liked(post_id: &str, user_id: &str) -> Event {
        Event::new(EventKind::PostLiked, EntityType::Post, post_id).with_actor(user_id)
    }

    pub fn user_followed(following_id: &str, follower_id: &str) -> Event {
        Event::new(EventKind::UserFollowed, EntityType::User, following_id)
            .with_actor(follower_id)
    }

    /// Defaults with a short flush interval and fast reconnects.
    pub fn fast_config() -> StrataConfig {
        let mut config = StrataConfig::default();
        config.write_behind.flush_interval_ms = 100;
        config.realtime.reconnect.base_ms = 10;
        config.realtime.reconnect.max_ms = 100;
        config
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    use super::*;

    /// Assert two key lists hold the same keys, ignoring order.
    pub fn assert_same_keys(actual: &[CacheKey], expected: &[CacheKey]) {
        let mut a: Vec<&str> = actual.iter().map(CacheKey::as_str).collect();
        let mut e: Vec<&str> = expected.iter().map(CacheKey::as_str).collect();
        a.sort_unstable();
        e.sort_unstable();
        assert_eq!(a, e, "key sets differ");
    }

    pub fn assert_matches_all(pattern: &KeyPattern, keys: &[CacheKey]) {
        for key in keys {
            assert!(pattern.matches(key), "{pattern} should match {key}");
        }
    }
}
