//! Per-strategy and per-priority admission limits.
//!
//! The manager admits every key it writes. When a strategy's `max_size` or
//! the global cap for its priority is exceeded, the oldest-admitted keys of
//! that strategy (or priority) are returned for eviction from both tiers.

use std::collections::{BTreeMap, HashMap};

use strata_core::{CacheKey, Priority, PriorityLimits};

#[derive(Debug, Clone)]
struct Admitted {
    strategy: String,
    priority: Priority,
    seq: u64,
}

#[derive(Debug)]
pub(crate) struct Admission {
    limits: PriorityLimits,
    seq: u64,
    by_key: HashMap<CacheKey, Admitted>,
    by_strategy: HashMap<String, BTreeMap<u64, CacheKey>>,
    by_priority: HashMap<Priority, BTreeMap<u64, CacheKey>>,
}

impl Admission {
    pub(crate) fn new(limits: PriorityLimits) -> Self {
        Self {
            limits,
            seq: 0,
            by_key: HashMap::new(),
            by_strategy: HashMap::new(),
            by_priority: HashMap::new(),
        }
    }

    /// Record `key` as written under `strategy`. Returns keys to evict.
    ///
    /// Re-admitting a key moves it to the young end of both queues.
    pub(crate) fn admit(
        &mut self,
        key: &CacheKey,
        strategy: &str,
        priority: Priority,
        max_size: usize,
    ) -> Vec<CacheKey> {
        self.forget(key);

        self.seq += 1;
        let seq = self.seq;
        self.by_key.insert(
            key.clone(),
            Admitted {
                strategy: strategy.to_string(),
                priority,
                seq,
            },
        );
        self.by_strategy
            .entry(strategy.to_string())
            .or_default()
            .insert(seq, key.clone());
        self.by_priority
            .entry(priority)
            .or_default()
            .insert(seq, key.clone());

        let mut evicted = Vec::new();
        while self.strategy_len(strategy) > max_size {
            match self.oldest_in_strategy(strategy) {
                Some(victim) => {
                    self.forget(&victim);
                    evicted.push(victim);
                }
                None => break,
            }
        }
        let cap = self.limits.limit(priority);
        while self.priority_len(priority) > cap {
            match self.oldest_in_priority(priority) {
                Some(victim) => {
                    self.forget(&victim);
                    evicted.push(victim);
                }
                None => break,
            }
        }
        evicted
    }

    /// Stop tracking `key`. Returns whether it was tracked.
    pub(crate) fn forget(&mut self, key: &CacheKey) -> bool {
        let Some(admitted) = self.by_key.remove(key) else {
            return false;
        };
        if let Some(queue) = self.by_strategy.get_mut(&admitted.strategy) {
            queue.remove(&admitted.seq);
            if queue.is_empty() {
                self.by_strategy.remove(&admitted.strategy);
            }
        }
        if let Some(queue) = self.by_priority.get_mut(&admitted.priority) {
            queue.remove(&admitted.seq);
            if queue.is_empty() {
                self.by_priority.remove(&admitted.priority);
            }
        }
        true
    }

    /// Keys currently tracked for `strategy`, oldest first.
    pub(crate) fn tracked(&self, strategy: &str) -> Vec<CacheKey> {
        self.by_strategy
            .get(strategy)
            .map(|q| q.values().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn strategy_of(&self, key: &CacheKey) -> Option<&str> {
        self.by_key.get(key).map(|a| a.strategy.as_str())
    }

    pub(crate) fn len(&self) -> usize {
        self.by_key.len()
    }

    pub(crate) fn clear(&mut self) {
        self.by_key.clear();
        self.by_strategy.clear();
        self.by_priority.clear();
    }

    fn strategy_len(&self, strategy: &str) -> usize {
        self.by_strategy.get(strategy).map_or(0, BTreeMap::len)
    }

    fn priority_len(&self, priority: Priority) -> usize {
        self.by_priority.get(&priority).map_or(0, BTreeMap::len)
    }

    fn oldest_in_strategy(&self, strategy: &str) -> Option<CacheKey> {
        self.by_strategy
            .get(strategy)
            .and_then(|q| q.values().next().cloned())
    }

    fn oldest_in_priority(&self, priority: Priority) -> Option<CacheKey> {
        self.by_priority
            .get(&priority)
            .and_then(|q| q.values().next().cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_test_utils::fixtures::key;

    fn limits(low: usize) -> PriorityLimits {
        PriorityLimits {
            critical: 10,
            high: 10,
            medium: 10,
            low,
        }
    }

    #[test]
    fn test_strategy_cap_evicts_oldest() {
        let mut a = Admission::new(limits(10));
        assert!(a.admit(&key("w:1"), "weather", Priority::Low, 2).is_empty());
        assert!(a.admit(&key("w:2"), "weather", Priority::Low, 2).is_empty());
        let evicted = a.admit(&key("w:3"), "weather", Priority::Low, 2);
        assert_eq!(evicted, vec![key("w:1")]);
        assert_eq!(a.tracked("weather"), vec![key("w:2"), key("w:3")]);
    }

    #[test]
    fn test_readmit_refreshes_position() {
        let mut a = Admission::new(limits(10));
        a.admit(&key("w:1"), "weather", Priority::Low, 2);
        a.admit(&key("w:2"), "weather", Priority::Low, 2);
        a.admit(&key("w:1"), "weather", Priority::Low, 2);
        let evicted = a.admit(&key("w:3"), "weather", Priority::Low, 2);
        assert_eq!(evicted, vec![key("w:2")]);
    }

    #[test]
    fn test_priority_cap_spans_strategies() {
        let mut a = Admission::new(limits(2));
        a.admit(&key("a:1"), "alpha", Priority::Low, 100);
        a.admit(&key("b:1"), "beta", Priority::Low, 100);
        let evicted = a.admit(&key("b:2"), "beta", Priority::Low, 100);
        assert_eq!(evicted, vec![key("a:1")]);
        assert!(a.tracked("alpha").is_empty());
        assert_eq!(a.len(), 2);
    }

    #[test]
    fn test_moving_key_between_strategies() {
        let mut a = Admission::new(limits(10));
        a.admit(&key("k:1"), "alpha", Priority::Low, 5);
        a.admit(&key("k:1"), "beta", Priority::High, 5);
        assert_eq!(a.strategy_of(&key("k:1")), Some("beta"));
        assert!(a.tracked("alpha").is_empty());
        assert_eq!(a.len(), 1);
    }

    #[test]
    fn test_forget_and_clear() {
        let mut a = Admission::new(limits(10));
        a.admit(&key("k:1"), "alpha", Priority::Low, 5);
        assert!(a.forget(&key("k:1")));
        assert!(!a.forget(&key("k:1")));
        a.admit(&key("k:2"), "alpha", Priority::Low, 5);
        a.clear();
        assert_eq!(a.len(), 0);
    }

    mod prop_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(100))]

            #[test]
            fn prop_tracked_never_exceeds_caps(
                ids in prop::collection::vec(0u32..40, 1..120),
                max_size in 1usize..8,
            ) {
                let mut a = Admission::new(limits(5));
                for id in ids {
                    let k = key(&format!("w:{id}"));
                    a.admit(&k, "weather", Priority::Low, max_size);
                    prop_assert!(a.tracked("weather").len() <= max_size.min(5));
                    prop_assert_eq!(a.strategy_of(&k), Some("weather"));
                }
            }
        }
    }
}
