//! Unified cache manager.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use strata_core::{
    now_ms, CacheError, CacheKey, CacheResult, DataSource, Entry, Event, EventKind, EventOrigin,
    KeyPattern, StorageError, StoredEntry, StrataConfig, StrategyDescriptor, SupervisorStats,
    TaskSupervisor,
};
use strata_events::{
    EventBus, EventHandler, InvalidationRule, RuleAction, RulePriority, RuleTable, Subscription,
};
use strata_storage::{
    CacheStorage, DurableTier, MemoryTier, ReadThroughStrategy, TieredStorage,
    WriteBehindStrategy, WriteThroughStrategy,
};
use tokio::task::JoinHandle;

use crate::admission::Admission;
use crate::metrics::{CacheMetrics, GetOutcome, MetricsCollector};
use crate::refresh::{LoaderRegistry, RefreshLoader};

/// Options for [`CacheManager::set`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetOptions {
    /// Overrides the strategy's TTL.
    pub ttl: Option<Duration>,
    /// Strategy name; unknown or absent names use the fallback descriptor.
    pub strategy: Option<String>,
}

impl SetOptions {
    pub fn strategy(name: impl Into<String>) -> Self {
        Self {
            ttl: None,
            strategy: Some(name.into()),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// Options for [`CacheManager::get_or_load`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadOptions {
    pub ttl: Option<Duration>,
    pub strategy: Option<String>,
    /// Skip the cache lookup and always call the loader.
    pub force_refresh: bool,
}

impl From<LoadOptions> for SetOptions {
    fn from(options: LoadOptions) -> Self {
        Self {
            ttl: options.ttl,
            strategy: options.strategy,
        }
    }
}

/// Manager-level view of the metrics.
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerMetrics {
    pub cache: CacheMetrics,
    /// Hit rate rounded to two decimals.
    pub hit_rate: f64,
    /// Hits, misses, sets and deletes.
    pub total_operations: u64,
    pub l1_evictions: u64,
    pub tracked_keys: usize,
    pub background: SupervisorStats,
}

/// What applying the rule table to one event did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventOutcome {
    /// Keys removed inline.
    pub invalidated: usize,
    /// Invalidation passes deferred to the supervisor.
    pub deferred: usize,
    /// Key reloads scheduled.
    pub refreshes: usize,
}

/// Two-tier cache front.
///
/// Reads try L1, then L2 (promoting hits into L1). Writes always land in
/// L1 and reach L2 when the resolved strategy is persistent. The manager
/// applies the rule table to every event on its bus; `Immediate` and
/// `Batch` invalidations of one event are merged into a single pass, while
/// `Background` rules and all refreshes run as supervised tasks.
pub struct CacheManager {
    config: StrataConfig,
    l1: Arc<MemoryTier>,
    l2: Arc<dyn CacheStorage>,
    bus: EventBus,
    metrics: Arc<MetricsCollector>,
    supervisor: TaskSupervisor,
    rules: RwLock<RuleTable>,
    loaders: RwLock<LoaderRegistry>,
    admission: Mutex<Admission>,
    subscription: Mutex<Option<Subscription>>,
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("l1", &self.l1)
            .field("l2", &self.l2.name())
            .field("supervisor", &self.supervisor)
            .finish_non_exhaustive()
    }
}

impl CacheManager {
    /// Build a manager over explicit collaborators and subscribe it to
    /// every event kind on `bus`.
    pub fn new(
        config: StrataConfig,
        l1: Arc<MemoryTier>,
        l2: Arc<dyn CacheStorage>,
        bus: EventBus,
        metrics: Arc<MetricsCollector>,
        supervisor: TaskSupervisor,
    ) -> Arc<Self> {
        let admission = Admission::new(config.limits);
        let manager = Arc::new(Self {
            config,
            l1,
            l2,
            bus,
            metrics,
            supervisor,
            rules: RwLock::new(RuleTable::standard()),
            loaders: RwLock::new(LoaderRegistry::default()),
            admission: Mutex::new(admission),
            subscription: Mutex::new(None),
        });

        let failures = Arc::clone(&manager.metrics);
        manager
            .supervisor
            .set_failure_hook(Arc::new(move |label: &str, error: &CacheError| {
                failures.record_error(format!("{label}: {error}"));
            }));

        let weak = Arc::downgrade(&manager);
        let handler: EventHandler = Arc::new(move |event: &Event| -> CacheResult<()> {
            match weak.upgrade() {
                Some(manager) => manager.dispatch(event),
                None => Ok(()),
            }
        });
        let subscription = manager.bus.subscribe_all(handler);
        *lock(&manager.subscription) = Some(subscription);

        tracing::info!(
            strategies = manager.config.strategies.named.len(),
            l1_capacity = manager.l1.capacity_bytes(),
            "Cache manager initialized"
        );
        manager
    }

    /// Build a manager with tiers, bus and metrics created from `config`.
    pub fn open(config: StrataConfig, supervisor: TaskSupervisor) -> CacheResult<Arc<Self>> {
        config.validate()?;
        let l1 = Arc::new(MemoryTier::new(config.layers.l1_capacity_bytes()));
        let l2 = DurableTier::open(&config.durable.path, config.layers.l2_map_size_mb())
            .map_err(StorageError::from)?;
        let metrics = Arc::new(MetricsCollector::from_config(&config));
        Ok(Self::new(
            config,
            l1,
            Arc::new(l2),
            EventBus::new(),
            metrics,
            supervisor,
        ))
    }

    pub fn config(&self) -> &StrataConfig {
        &self.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn supervisor(&self) -> &TaskSupervisor {
        &self.supervisor
    }

    pub fn l1(&self) -> &Arc<MemoryTier> {
        &self.l1
    }

    pub fn l2(&self) -> &Arc<dyn CacheStorage> {
        &self.l2
    }

    // ------------------------------------------------------------------
    // Reads and writes
    // ------------------------------------------------------------------

    /// Look `key` up in L1, then L2. An L2 hit is promoted into L1.
    ///
    /// Entries that fail to decode as `T` count as misses.
    pub async fn get<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        let started = Instant::now();
        let now = now_ms();

        if let Some(stored) = self.l1.get(key).await {
            if stored.is_valid_at(now) {
                if let Some(data) = decode::<T>(key, stored) {
                    self.metrics.record_get(started.elapsed(), GetOutcome::L1Hit);
                    return Some(data);
                }
            }
        }

        if let Some(stored) = self.l2.get(key).await {
            if stored.is_valid_at(now) {
                if let Some(data) = decode::<T>(key, stored.clone()) {
                    self.l1.set(key, stored).await;
                    self.metrics.record_get(started.elapsed(), GetOutcome::L2Hit);
                    return Some(data);
                }
            }
        }

        self.metrics.record_get(started.elapsed(), GetOutcome::Miss);
        None
    }

    /// Store `data` under the strategy named in `options`.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &CacheKey,
        data: &T,
        options: SetOptions,
    ) -> CacheResult<()> {
        let value = serde_json::to_value(data).map_err(|e| {
            let error = StorageError::Encode {
                key: key.to_string(),
                reason: e.to_string(),
            };
            self.metrics.record_error(error.to_string());
            CacheError::from(error)
        })?;
        self.store(key, value, &options).await;
        Ok(())
    }

    async fn store(&self, key: &CacheKey, value: Value, options: &SetOptions) {
        let started = Instant::now();
        let (name, descriptor) = self.config.strategies.resolve(options.strategy.as_deref());
        let ttl = options.ttl.unwrap_or_else(|| descriptor.ttl());
        let entry: StoredEntry = Entry::new(value, ttl);

        self.l1.set(key, entry.clone()).await;
        if descriptor.persistence {
            self.l2.set(key, entry).await;
        } else {
            // A previous persistent write must not resurface after L1 eviction.
            self.l2.delete(key).await;
        }

        let evicted = lock(&self.admission).admit(
            key,
            name,
            descriptor.priority,
            descriptor.max_size,
        );
        if !evicted.is_empty() {
            tracing::debug!(strategy = name, count = evicted.len(), "Admission limit reached, evicting oldest keys");
            self.l1.multi_delete(&evicted).await;
            self.l2.multi_delete(&evicted).await;
        }

        self.metrics.record_set(started.elapsed());
        self.update_sizes().await;
    }

    pub async fn delete(&self, key: &CacheKey) {
        self.l1.delete(key).await;
        self.l2.delete(key).await;
        lock(&self.admission).forget(key);
        self.metrics.record_delete();
    }

    /// Batched lookup. L1 misses are fetched from L2 in one call and the
    /// valid ones promoted together.
    pub async fn multi_get<T: DeserializeOwned>(
        &self,
        keys: &[CacheKey],
    ) -> Vec<(CacheKey, Option<T>)> {
        if keys.is_empty() {
            return Vec::new();
        }
        let started = Instant::now();
        let now = now_ms();

        let mut results: Vec<(CacheKey, Option<T>)> = Vec::with_capacity(keys.len());
        let mut outcomes = Vec::with_capacity(keys.len());
        let mut missing = Vec::new();
        for (key, stored) in self.l1.multi_get(keys).await {
            let data = stored
                .filter(|s| s.is_valid_at(now))
                .and_then(|s| decode::<T>(&key, s));
            if data.is_some() {
                outcomes.push(GetOutcome::L1Hit);
            } else {
                missing.push((results.len(), key.clone()));
                outcomes.push(GetOutcome::Miss);
            }
            results.push((key, data));
        }

        if !missing.is_empty() {
            let lookup: Vec<CacheKey> = missing.iter().map(|(_, k)| k.clone()).collect();
            let mut promote = Vec::new();
            for ((slot, _), (key, stored)) in missing.into_iter().zip(self.l2.multi_get(&lookup).await) {
                let Some(stored) = stored.filter(|s| s.is_valid_at(now)) else {
                    continue;
                };
                if let Some(data) = decode::<T>(&key, stored.clone()) {
                    results[slot].1 = Some(data);
                    outcomes[slot] = GetOutcome::L2Hit;
                    promote.push((key, stored));
                }
            }
            if !promote.is_empty() {
                self.l1.multi_set(promote).await;
            }
        }

        let share = per_key_share(started.elapsed(), keys.len());
        for outcome in outcomes {
            self.metrics.record_get(share, outcome);
        }
        results
    }

    /// Read `key`, calling `loader` and caching its result on a miss.
    pub async fn get_or_load<T, F, Fut>(
        &self,
        key: &CacheKey,
        loader: F,
        options: LoadOptions,
    ) -> CacheResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = CacheResult<T>>,
    {
        if !options.force_refresh {
            if let Some(hit) = self.get::<T>(key).await {
                return Ok(hit);
            }
        }
        let data = loader().await?;
        self.set(key, &data, options.into()).await?;
        Ok(data)
    }

    // ------------------------------------------------------------------
    // Invalidation
    // ------------------------------------------------------------------

    /// Remove every key named or matched by `patterns` from both tiers.
    ///
    /// Returns the number of distinct keys targeted.
    pub async fn invalidate(&self, patterns: &[KeyPattern]) -> usize {
        let targets = self.expand(patterns, true).await;
        if targets.is_empty() {
            return 0;
        }

        self.l1.multi_delete(&targets).await;
        self.l2.multi_delete(&targets).await;
        {
            let mut admission = lock(&self.admission);
            for key in &targets {
                admission.forget(key);
            }
        }
        self.metrics.record_invalidation(targets.len());
        tracing::debug!(patterns = patterns.len(), keys = targets.len(), "Invalidated keys");
        targets.len()
    }

    /// [`invalidate`](Self::invalidate) over raw key or pattern strings.
    pub async fn invalidate_str(&self, raw: &[&str]) -> CacheResult<usize> {
        let patterns = raw
            .iter()
            .map(|r| KeyPattern::parse(r))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self.invalidate(&patterns).await)
    }

    /// Distinct keys named by literal patterns plus stored keys matching
    /// wildcard ones, across both tiers.
    async fn expand(&self, patterns: &[KeyPattern], include_literals: bool) -> Vec<CacheKey> {
        let mut keys = BTreeSet::new();
        for pattern in patterns {
            match pattern.as_key() {
                Some(key) if include_literals => {
                    keys.insert(key);
                }
                _ => {
                    keys.extend(self.l1.keys(Some(pattern)).await);
                    keys.extend(self.l2.keys(Some(pattern)).await);
                }
            }
        }
        keys.into_iter().collect()
    }

    // ------------------------------------------------------------------
    // Refresh
    // ------------------------------------------------------------------

    /// Register `loader` for keys matching `pattern`.
    pub fn register_loader(&self, pattern: KeyPattern, loader: RefreshLoader) {
        write(&self.loaders).register(pattern, loader);
    }

    pub fn unregister_loader(&self, pattern: &KeyPattern) -> bool {
        write(&self.loaders).unregister(pattern)
    }

    /// Run `loader` under the supervisor and cache its result.
    ///
    /// Failures are logged and counted, never returned.
    pub fn background_refresh<T, F, Fut>(
        self: &Arc<Self>,
        key: CacheKey,
        loader: F,
        options: SetOptions,
    ) -> JoinHandle<()>
    where
        T: Serialize + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = CacheResult<T>> + Send + 'static,
    {
        let manager = Arc::clone(self);
        self.supervisor.spawn(format!("refresh {key}"), async move {
            let data = loader().await?;
            manager.set(&key, &data, options).await
        })
    }

    /// Reload the keys matching `patterns` that have a registered loader.
    ///
    /// Wildcard patterns expand against both tiers; literal patterns are
    /// reloaded even when not currently cached. Returns how many reloads
    /// were scheduled.
    pub async fn schedule_refresh(self: &Arc<Self>, patterns: &[KeyPattern]) -> usize {
        let keys = self.expand(patterns, true).await;
        self.refresh_keys(keys)
    }

    fn refresh_keys(self: &Arc<Self>, keys: Vec<CacheKey>) -> usize {
        let mut scheduled = 0;
        for key in keys {
            let Some(loader) = read(&self.loaders).find(&key) else {
                tracing::debug!(key = %key, "No loader registered, leaving key to expire");
                continue;
            };
            let strategy = lock(&self.admission).strategy_of(&key).map(str::to_string);
            let manager = Arc::clone(self);
            self.supervisor.spawn(format!("refresh {key}"), async move {
                let value = loader(key.clone()).await?;
                let options = SetOptions {
                    ttl: None,
                    strategy,
                };
                manager.store(&key, value, &options).await;
                Ok(())
            });
            scheduled += 1;
        }
        scheduled
    }

    /// Load and cache every entry concurrently. Returns how many loaded.
    pub async fn warm_cache(
        &self,
        entries: Vec<(CacheKey, RefreshLoader)>,
        strategy: Option<&str>,
    ) -> usize {
        let loads = entries.into_iter().map(|(key, loader)| async move {
            let loaded = loader(key.clone()).await;
            (key, loaded)
        });
        let options = SetOptions {
            ttl: None,
            strategy: strategy.map(str::to_string),
        };

        let mut warmed = 0;
        for (key, loaded) in futures_util::future::join_all(loads).await {
            match loaded {
                Ok(value) => {
                    self.store(&key, value, &options).await;
                    warmed += 1;
                }
                Err(e) => tracing::warn!(key = %key, error = %e, "Cache warm-up load failed"),
            }
        }
        tracing::info!(warmed, "Cache warm-up complete");
        warmed
    }

    // ------------------------------------------------------------------
    // Rules and events
    // ------------------------------------------------------------------

    pub fn add_rule(&self, rule: InvalidationRule) {
        write(&self.rules).push(rule);
    }

    pub fn remove_rules_for(&self, kind: &EventKind) -> usize {
        write(&self.rules).remove_for(kind)
    }

    pub fn rule_count(&self) -> usize {
        read(&self.rules).len()
    }

    /// Patterns the `Invalidate` rules name for `event`.
    pub fn invalidation_keys(&self, event: &Event) -> Vec<KeyPattern> {
        read(&self.rules).affected_keys(event, RuleAction::Invalidate)
    }

    /// Bus handler. Rule work needs the async runtime, so it is handed to
    /// the supervisor; delivery itself never blocks.
    fn dispatch(self: &Arc<Self>, event: &Event) -> CacheResult<()> {
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(CacheError::handler(format!(
                "no async runtime to apply rules for {}",
                event.kind
            )));
        }
        let manager = Arc::clone(self);
        let event = event.clone();
        self.supervisor
            .spawn(format!("apply rules {}", event.kind), async move {
                manager.handle_event(&event).await;
                Ok(())
            });
        Ok(())
    }

    /// Apply the rule table and strategy refresh triggers to `event`.
    ///
    /// `Invalidate` rules are skipped for change-feed events: the sync
    /// engine has already removed those keys.
    pub async fn handle_event(self: &Arc<Self>, event: &Event) -> EventOutcome {
        let from_feed = event.origin == EventOrigin::ChangeFeed;
        let mut inline = Vec::new();
        let mut deferred = Vec::new();
        let mut refresh = Vec::new();
        {
            let rules = read(&self.rules);
            for rule in rules.matching(&event.kind) {
                match rule.action {
                    RuleAction::Invalidate if from_feed => {}
                    RuleAction::Invalidate => {
                        let target = match rule.priority {
                            RulePriority::Immediate | RulePriority::Batch => &mut inline,
                            RulePriority::Background => &mut deferred,
                        };
                        push_unique(target, rule.affected_keys(event));
                    }
                    RuleAction::Refresh => push_unique(&mut refresh, rule.affected_keys(event)),
                    RuleAction::Update => {
                        tracing::debug!(kind = %event.kind, "Update rule matched, no action");
                    }
                }
            }
        }

        let mut outcome = EventOutcome::default();
        if !inline.is_empty() {
            outcome.invalidated = self.invalidate(&inline).await;
        }
        if !deferred.is_empty() {
            let manager = Arc::clone(self);
            self.supervisor
                .spawn(format!("invalidate {}", event.kind), async move {
                    manager.invalidate(&deferred).await;
                    Ok(())
                });
            outcome.deferred = 1;
        }
        if !refresh.is_empty() {
            outcome.refreshes += self.schedule_refresh(&refresh).await;
        }

        let triggered: Vec<&str> = self
            .config
            .strategies
            .iter()
            .filter(|(_, d)| refreshes_on(d, &event.kind))
            .map(|(name, _)| name)
            .collect();
        if !triggered.is_empty() {
            let keys: Vec<CacheKey> = {
                let admission = lock(&self.admission);
                triggered.iter().flat_map(|name| admission.tracked(name)).collect()
            };
            outcome.refreshes += self.refresh_keys(keys);
        }

        tracing::debug!(
            kind = %event.kind,
            origin = ?event.origin,
            invalidated = outcome.invalidated,
            refreshes = outcome.refreshes,
            "Applied rules"
        );
        outcome
    }

    // ------------------------------------------------------------------
    // Strategies
    // ------------------------------------------------------------------

    fn tiered(&self, descriptor: &StrategyDescriptor) -> Arc<dyn CacheStorage> {
        let l1: Arc<dyn CacheStorage> = self.l1.clone();
        Arc::new(TieredStorage::new(
            l1,
            Arc::clone(&self.l2),
            descriptor.persistence,
        ))
    }

    /// Write-through strategy over this manager's tiers.
    pub fn write_through<T>(
        &self,
        strategy: &str,
        source: Arc<dyn DataSource<T>>,
    ) -> WriteThroughStrategy<T>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    {
        let (_, descriptor) = self.config.strategies.resolve(Some(strategy));
        WriteThroughStrategy::new(self.tiered(descriptor), source, descriptor.clone())
    }

    /// Read-through strategy over this manager's tiers.
    pub fn read_through<T>(
        &self,
        strategy: &str,
        source: Arc<dyn DataSource<T>>,
    ) -> ReadThroughStrategy<T>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    {
        let (_, descriptor) = self.config.strategies.resolve(Some(strategy));
        ReadThroughStrategy::new(
            self.tiered(descriptor),
            source,
            descriptor.clone(),
            self.supervisor.clone(),
        )
    }

    /// Write-behind strategy over this manager's tiers, with its flush loop
    /// already running under the supervisor.
    pub fn write_behind<T>(
        &self,
        strategy: &str,
        source: Arc<dyn DataSource<T>>,
    ) -> Arc<WriteBehindStrategy<T>>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    {
        let (_, descriptor) = self.config.strategies.resolve(Some(strategy));
        let behind = Arc::new(WriteBehindStrategy::new(
            self.tiered(descriptor),
            source,
            descriptor.clone(),
            self.config.write_behind.clone(),
        ));
        behind.start(&self.supervisor);
        behind
    }

    // ------------------------------------------------------------------
    // Housekeeping
    // ------------------------------------------------------------------

    /// Empty both tiers and reset the metrics.
    pub async fn clear_all(&self) {
        self.l1.clear(None).await;
        self.l2.clear(None).await;
        lock(&self.admission).clear();
        self.metrics.reset();
        tracing::info!("Cache cleared");
    }

    /// Drop expired entries from L1. Returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let purged = self.l1.purge_expired(now_ms());
        self.update_sizes().await;
        purged
    }

    pub fn get_metrics(&self) -> ManagerMetrics {
        let cache = self.metrics.snapshot();
        ManagerMetrics {
            hit_rate: (cache.hit_rate * 100.0).round() / 100.0,
            total_operations: cache.hits + cache.misses + cache.sets + cache.deletes,
            l1_evictions: self.l1.evictions(),
            tracked_keys: lock(&self.admission).len(),
            background: self.supervisor.stats(),
            cache,
        }
    }

    async fn update_sizes(&self) {
        let l1_bytes = u64::try_from(self.l1.current_bytes()).unwrap_or(u64::MAX);
        let l2_entries = u64::try_from(self.l2.size().await).unwrap_or(u64::MAX);
        self.metrics.update_cache_sizes(l1_bytes, l2_entries);
    }

    /// Stop reacting to events, signal background loops to stop and wait
    /// for in-flight work. Write-behind loops flush one last time.
    ///
    /// The supervisor is shared, so anything else spawned on it is asked
    /// to stop as well.
    pub async fn shutdown(&self) {
        if let Some(subscription) = lock(&self.subscription).take() {
            subscription.unsubscribe();
        }
        self.supervisor.shutdown();
        self.supervisor.wait_idle().await;
        tracing::info!("Cache manager shut down");
    }
}

fn refreshes_on(descriptor: &StrategyDescriptor, kind: &EventKind) -> bool {
    descriptor.refresh_on.contains(kind)
}

/// Even split of a batch's elapsed time across its keys.
fn per_key_share(elapsed: Duration, keys: usize) -> Duration {
    if keys == 0 {
        return elapsed;
    }
    elapsed.div_f64(keys as f64)
}

fn push_unique(target: &mut Vec<KeyPattern>, patterns: Vec<KeyPattern>) {
    for pattern in patterns {
        if !target.contains(&pattern) {
            target.push(pattern);
        }
    }
}

fn decode<T: DeserializeOwned>(key: &CacheKey, stored: StoredEntry) -> Option<T> {
    match stored.decode::<T>() {
        Ok(entry) => Some(entry.data),
        Err(e) => {
            tracing::warn!(key = %key, error = %e, "Cached entry has unexpected shape, ignoring");
            None
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
