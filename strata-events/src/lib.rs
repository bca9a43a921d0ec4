//! Strata Events - Event Bus and Invalidation Rules
//!
//! Domain events flow from application code and the realtime sync engine
//! onto the [`EventBus`]. The cache manager subscribes to every kind and
//! looks matching [`InvalidationRule`]s up in a [`RuleTable`] to decide
//! which keys to invalidate or refresh.
//!
//! ```text
//! app / sync engine ──emit──▶ EventBus ──▶ handlers (exact kind + wildcard)
//!                                              │
//!                                              ▼
//!                                  RuleTable::matching(kind)
//!                                              │
//!                               affected_keys(event) ──▶ invalidate / refresh
//! ```

mod bus;
mod rules;

pub use bus::{EventBus, EventHandler, Subscription, SubscriptionId};
pub use rules::{AffectedKeys, InvalidationRule, RuleAction, RulePriority, RuleTable};

// Re-export core types for convenience
pub use strata_core::{EntityType, Event, EventKind, EventOrigin, KeyPattern};
