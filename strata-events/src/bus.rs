//! Publish/subscribe bus for domain events.
//!
//! Handlers are plain synchronous callbacks. Delivery order is global
//! registration order across exact-kind and wildcard subscriptions. A
//! handler that returns an error or panics is logged and skipped; the
//! remaining handlers still run.

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use strata_core::{CacheResult, Event, EventKind};

/// Callback invoked for each delivered event.
pub type EventHandler = Arc<dyn Fn(&Event) -> CacheResult<()> + Send + Sync>;

/// Identifies one registration on a bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

#[derive(Clone)]
struct Registration {
    id: SubscriptionId,
    handler: EventHandler,
}

#[derive(Default)]
struct Registry {
    by_kind: HashMap<EventKind, Vec<Registration>>,
    wildcard: Vec<Registration>,
}

impl Registry {
    fn slot(&mut self, kind: Option<&EventKind>) -> &mut Vec<Registration> {
        match kind {
            Some(kind) => self.by_kind.entry(kind.clone()).or_default(),
            None => &mut self.wildcard,
        }
    }
}

struct BusInner {
    registry: RwLock<Registry>,
    next_id: AtomicU64,
    emitted: AtomicU64,
    handler_failures: AtomicU64,
}

impl BusInner {
    fn read(&self) -> RwLockReadGuard<'_, Registry> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Registry> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove(&self, kind: Option<&EventKind>, id: SubscriptionId) -> bool {
        let mut registry = self.write();
        let slot = registry.slot(kind);
        let before = slot.len();
        slot.retain(|r| r.id != id);
        before != slot.len()
    }
}

/// Handle returned by [`EventBus::subscribe`].
///
/// Dropping the handle leaves the handler registered; call
/// [`unsubscribe`](Self::unsubscribe) to remove it.
#[derive(Clone)]
pub struct Subscription {
    bus: Weak<BusInner>,
    kind: Option<EventKind>,
    id: SubscriptionId,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// The subscribed kind, `None` for a wildcard subscription.
    pub fn kind(&self) -> Option<&EventKind> {
        self.kind.as_ref()
    }

    /// Remove the handler. Returns false if it was already gone.
    pub fn unsubscribe(&self) -> bool {
        match self.bus.upgrade() {
            Some(bus) => bus.remove(self.kind.as_ref(), self.id),
            None => false,
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

/// In-process event bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.inner.read();
        f.debug_struct("EventBus")
            .field("kinds", &registry.by_kind.len())
            .field("wildcard", &registry.wildcard.len())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                registry: RwLock::new(Registry::default()),
                next_id: AtomicU64::new(1),
                emitted: AtomicU64::new(0),
                handler_failures: AtomicU64::new(0),
            }),
        }
    }

    /// Register `handler` for events of `kind`.
    ///
    /// Registering the same handler (same `Arc`) for the same kind again
    /// returns the existing subscription instead of adding a duplicate.
    pub fn subscribe(&self, kind: EventKind, handler: EventHandler) -> Subscription {
        self.register(Some(kind), handler)
    }

    /// Register `handler` for every event kind.
    pub fn subscribe_all(&self, handler: EventHandler) -> Subscription {
        self.register(None, handler)
    }

    fn register(&self, kind: Option<EventKind>, handler: EventHandler) -> Subscription {
        let mut registry = self.inner.write();
        let slot = registry.slot(kind.as_ref());

        let existing = slot
            .iter()
            .find(|r| Arc::ptr_eq(&r.handler, &handler))
            .map(|r| r.id);
        let id = match existing {
            Some(id) => id,
            None => {
                let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
                slot.push(Registration { id, handler });
                id
            }
        };
        drop(registry);

        tracing::debug!(
            kind = kind.as_ref().map_or("*", EventKind::as_str),
            subscription = %id,
            "Event handler registered"
        );
        Subscription {
            bus: Arc::downgrade(&self.inner),
            kind,
            id,
        }
    }

    /// Remove one handler for `kind`, or all of them when `id` is `None`.
    ///
    /// Returns how many registrations were removed.
    pub fn unsubscribe(&self, kind: &EventKind, id: Option<SubscriptionId>) -> usize {
        let mut registry = self.inner.write();
        let Some(slot) = registry.by_kind.get_mut(kind) else {
            return 0;
        };
        let before = slot.len();
        match id {
            Some(id) => slot.retain(|r| r.id != id),
            None => slot.clear(),
        }
        let removed = before - slot.len();
        if slot.is_empty() {
            registry.by_kind.remove(kind);
        }
        removed
    }

    /// Handlers that would receive an event of `kind`, wildcards included.
    pub fn handler_count(&self, kind: &EventKind) -> usize {
        let registry = self.inner.read();
        registry.by_kind.get(kind).map_or(0, Vec::len) + registry.wildcard.len()
    }

    /// Drop every registration.
    pub fn clear(&self) {
        let mut registry = self.inner.write();
        registry.by_kind.clear();
        registry.wildcard.clear();
    }

    /// Deliver `event` to its handlers.
    ///
    /// Returns the number of handlers that completed without error. Handlers
    /// may subscribe or emit re-entrantly; they see the registry as it was
    /// when this call started.
    pub fn emit(&self, event: &Event) -> usize {
        self.inner.emitted.fetch_add(1, Ordering::Relaxed);

        let mut targets: Vec<Registration> = {
            let registry = self.inner.read();
            registry
                .by_kind
                .get(&event.kind)
                .into_iter()
                .flatten()
                .chain(registry.wildcard.iter())
                .cloned()
                .collect()
        };
        targets.sort_by_key(|r| r.id);

        let mut delivered = 0;
        for registration in &targets {
            match catch_unwind(AssertUnwindSafe(|| (registration.handler)(event))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    self.inner.handler_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        kind = %event.kind,
                        subscription = %registration.id,
                        error = %e,
                        "Event handler failed"
                    );
                }
                Err(_) => {
                    self.inner.handler_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(
                        kind = %event.kind,
                        subscription = %registration.id,
                        "Event handler panicked"
                    );
                }
            }
        }
        tracing::trace!(kind = %event.kind, delivered, "Event emitted");
        delivered
    }

    /// Events emitted since construction.
    pub fn emitted(&self) -> u64 {
        self.inner.emitted.load(Ordering::Relaxed)
    }

    /// Handler invocations that failed or panicked.
    pub fn handler_failures(&self) -> u64 {
        self.inner.handler_failures.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use strata_core::{CacheError, EntityType};

    fn event(kind: EventKind) -> Event {
        Event::new(kind, EntityType::Post, "1")
    }

    fn recorder(log: &Arc<Mutex<Vec<String>>>, tag: &str) -> EventHandler {
        let log = Arc::clone(log);
        let tag = tag.to_string();
        Arc::new(move |e: &Event| -> CacheResult<()> {
            log.lock().unwrap().push(format!("{tag}:{}", e.kind));
            Ok(())
        })
    }

    #[test]
    fn test_exact_and_wildcard_in_registration_order() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(EventKind::PostLiked, recorder(&log, "a"));
        bus.subscribe_all(recorder(&log, "all"));
        bus.subscribe(EventKind::PostLiked, recorder(&log, "b"));
        bus.subscribe(EventKind::UserFollowed, recorder(&log, "c"));

        assert_eq!(bus.emit(&event(EventKind::PostLiked)), 3);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["a:post.liked", "all:post.liked", "b:post.liked"]
        );
    }

    #[test]
    fn test_same_handler_registered_once_per_kind() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let handler = recorder(&log, "h");
        let first = bus.subscribe(EventKind::PostLiked, Arc::clone(&handler));
        let second = bus.subscribe(EventKind::PostLiked, Arc::clone(&handler));
        assert_eq!(first.id(), second.id());

        bus.subscribe(EventKind::PostUnliked, handler);
        assert_eq!(bus.emit(&event(EventKind::PostLiked)), 1);
        assert_eq!(bus.handler_count(&EventKind::PostLiked), 1);
    }

    #[test]
    fn test_failing_and_panicking_handlers_do_not_stop_delivery() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(
            EventKind::PostLiked,
            Arc::new(|_: &Event| -> CacheResult<()> { Err(CacheError::handler("nope")) }),
        );
        bus.subscribe(
            EventKind::PostLiked,
            Arc::new(|_: &Event| -> CacheResult<()> { panic!("boom") }),
        );
        bus.subscribe(EventKind::PostLiked, recorder(&log, "ok"));

        assert_eq!(bus.emit(&event(EventKind::PostLiked)), 1);
        assert_eq!(log.lock().unwrap().len(), 1);
        assert_eq!(bus.handler_failures(), 2);
    }

    #[test]
    fn test_subscription_handle_unsubscribes() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let sub = bus.subscribe(EventKind::PostLiked, recorder(&log, "a"));
        let all = bus.subscribe_all(recorder(&log, "all"));

        assert!(sub.unsubscribe());
        assert!(!sub.unsubscribe());
        assert!(all.unsubscribe());
        assert_eq!(bus.emit(&event(EventKind::PostLiked)), 0);
    }

    #[test]
    fn test_unsubscribe_by_kind() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = bus.subscribe(EventKind::PostLiked, recorder(&log, "a"));
        bus.subscribe(EventKind::PostLiked, recorder(&log, "b"));
        bus.subscribe(EventKind::PostLiked, recorder(&log, "c"));

        assert_eq!(bus.unsubscribe(&EventKind::PostLiked, Some(a.id())), 1);
        assert_eq!(bus.handler_count(&EventKind::PostLiked), 2);
        assert_eq!(bus.unsubscribe(&EventKind::PostLiked, None), 2);
        assert_eq!(bus.unsubscribe(&EventKind::PostLiked, None), 0);
    }

    #[test]
    fn test_custom_kinds_are_routed_by_name() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let kind: EventKind = "trip.planned".parse().unwrap();
        bus.subscribe(kind.clone(), recorder(&log, "x"));
        assert_eq!(bus.emit(&event(kind)), 1);
        assert_eq!(*log.lock().unwrap(), vec!["x:trip.planned"]);
    }

    #[test]
    fn test_handler_may_emit_reentrantly() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let inner_bus = bus.clone();
        bus.subscribe(
            EventKind::PostCreated,
            Arc::new(move |_: &Event| -> CacheResult<()> {
                inner_bus.emit(&Event::new(EventKind::PostLiked, EntityType::Post, "1"));
                Ok(())
            }),
        );
        bus.subscribe(EventKind::PostLiked, recorder(&log, "nested"));

        assert_eq!(bus.emit(&event(EventKind::PostCreated)), 1);
        assert_eq!(*log.lock().unwrap(), vec!["nested:post.liked"]);
        assert_eq!(bus.emitted(), 2);
    }
}
