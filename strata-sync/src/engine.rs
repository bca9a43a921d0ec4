//! Realtime sync engine.
//!
//! One supervised loop per configured channel subscribes to the change
//! feed, turns each change into cache invalidations and a domain event,
//! and reconnects with exponential backoff when the channel fails.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use strata_cache::CacheManager;
use strata_core::{
    CacheResult, ChangeNotification, ChangeOperation, ChangeTransport, ChannelStatus, Event,
    KeyPattern, RealtimeChannel, RealtimeConfig, SubscriptionError, TaskSupervisor,
    TransportMessage,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::machine::{jittered, ChannelMachine, ChannelState, Step};
use crate::rules::{event_for, push_unique, SyncHandler, SyncRule, SyncRules};

const SINK_CAPACITY: usize = 256;

/// What one change did.
#[derive(Debug, Clone, Default)]
pub struct ChangeOutcome {
    pub patterns: Vec<KeyPattern>,
    pub invalidated: usize,
    pub event: Option<Event>,
}

/// Point-in-time view of one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSnapshot {
    pub name: String,
    pub state: ChannelState,
    pub attempt: u32,
    pub timers_scheduled: u64,
    pub last_error: Option<String>,
    pub running: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub changes: u64,
    pub invalidated: u64,
    pub events_emitted: u64,
}

#[derive(Debug, Default)]
struct SyncCounters {
    changes: AtomicU64,
    invalidated: AtomicU64,
    events_emitted: AtomicU64,
}

struct ChannelSlot {
    channel: RealtimeChannel,
    machine: Arc<Mutex<ChannelMachine>>,
    stop: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl ChannelSlot {
    fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

enum PumpEnd {
    Stopped,
    Failed(String),
}

pub struct RealtimeSyncEngine {
    config: RealtimeConfig,
    transport: Arc<dyn ChangeTransport>,
    manager: Arc<CacheManager>,
    supervisor: TaskSupervisor,
    enabled: AtomicBool,
    channels: Mutex<HashMap<String, ChannelSlot>>,
    rules: RwLock<SyncRules>,
    counters: SyncCounters,
}

impl std::fmt::Debug for RealtimeSyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeSyncEngine")
            .field("enabled", &self.is_enabled())
            .field("channels", &self.status())
            .finish_non_exhaustive()
    }
}

impl RealtimeSyncEngine {
    /// Build an engine with the standard table handlers. Nothing is
    /// subscribed until [`start`](Self::start) or
    /// [`initialize`](Self::initialize).
    pub fn new(
        config: RealtimeConfig,
        transport: Arc<dyn ChangeTransport>,
        manager: Arc<CacheManager>,
        supervisor: TaskSupervisor,
    ) -> Arc<Self> {
        Arc::new(Self {
            enabled: AtomicBool::new(config.enabled),
            config,
            transport,
            manager,
            supervisor,
            channels: Mutex::new(HashMap::new()),
            rules: RwLock::new(SyncRules::standard()),
            counters: SyncCounters::default(),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Subscribe every configured channel.
    pub fn start(self: &Arc<Self>) -> usize {
        let channels = self.config.channels.clone();
        self.initialize(&channels)
    }

    /// Launch a loop for each channel not already running.
    ///
    /// Returns the number of loops launched; zero while disabled.
    pub fn initialize(self: &Arc<Self>, channels: &[RealtimeChannel]) -> usize {
        if !self.is_enabled() {
            tracing::info!("Realtime sync disabled, not subscribing");
            return 0;
        }
        let mut slots = lock(&self.channels);
        let mut launched = 0;
        for channel in channels {
            if slots.get(&channel.name).is_some_and(ChannelSlot::is_running) {
                tracing::warn!(channel = %channel.name, "Channel already running");
                continue;
            }
            slots.insert(channel.name.clone(), self.launch(channel));
            launched += 1;
        }
        tracing::info!(channels = launched, "Realtime sync initialized");
        launched
    }

    fn launch(self: &Arc<Self>, channel: &RealtimeChannel) -> ChannelSlot {
        let machine = Arc::new(Mutex::new(ChannelMachine::new(
            self.config.reconnect.clone(),
        )));
        let (stop, stop_rx) = watch::channel(false);
        let engine = Arc::clone(self);
        let task_channel = channel.clone();
        let task_machine = Arc::clone(&machine);
        let handle = self
            .supervisor
            .spawn(format!("channel {}", channel.name), async move {
                engine.run_channel(task_channel, task_machine, stop_rx).await
            });
        ChannelSlot {
            channel: channel.clone(),
            machine,
            stop,
            handle: Some(handle),
        }
    }

    async fn run_channel(
        &self,
        channel: RealtimeChannel,
        machine: Arc<Mutex<ChannelMachine>>,
        mut stop: watch::Receiver<bool>,
    ) -> CacheResult<()> {
        let mut shutdown = self.supervisor.shutdown_signal();
        let mut step = lock(&machine).start();

        loop {
            if *stop.borrow() || *shutdown.borrow() || step != Step::Subscribe {
                return Ok(());
            }

            let (sink, mut rx) = mpsc::channel(SINK_CAPACITY);
            let subscribed = self
                .transport
                .subscribe(&channel.name, &channel.tables, &channel.operations, sink)
                .await;
            let reason = match subscribed {
                Err(e) => e.to_string(),
                Ok(()) => {
                    let end = self
                        .pump(&channel, &machine, &mut rx, &mut stop, &mut shutdown)
                        .await;
                    self.unsubscribe(&channel.name).await;
                    match end {
                        PumpEnd::Stopped => return Ok(()),
                        PumpEnd::Failed(reason) => reason,
                    }
                }
            };

            let next = {
                let mut m = lock(&machine);
                m.on_failure(reason.as_str());
                m.schedule()
            };
            match next {
                Step::Retry { attempt, delay } => {
                    let delay = jittered(delay, self.config.reconnect.jitter_ms);
                    tracing::warn!(
                        channel = %channel.name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %reason,
                        "Realtime channel failed, reconnecting"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = stop.changed() => return Ok(()),
                        _ = shutdown.changed() => return Ok(()),
                    }
                    step = lock(&machine).on_timer();
                }
                Step::GiveUp { attempts } => {
                    tracing::error!(
                        channel = %channel.name,
                        attempts,
                        error = %reason,
                        "Realtime channel disabled"
                    );
                    return Err(SubscriptionError::Disabled {
                        channel: channel.name.clone(),
                        attempts,
                    }
                    .into());
                }
                Step::Subscribe | Step::Ignore => return Ok(()),
            }
        }
    }

    async fn pump(
        &self,
        channel: &RealtimeChannel,
        machine: &Mutex<ChannelMachine>,
        rx: &mut mpsc::Receiver<TransportMessage>,
        stop: &mut watch::Receiver<bool>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> PumpEnd {
        loop {
            tokio::select! {
                _ = stop.changed() => return PumpEnd::Stopped,
                _ = shutdown.changed() => return PumpEnd::Stopped,
                message = rx.recv() => match message {
                    Some(TransportMessage::Change(change)) => {
                        self.handle_change(&change).await;
                    }
                    Some(TransportMessage::Status(status)) => {
                        if channel.log_status {
                            tracing::info!(channel = %channel.name, status = ?status, "Channel status");
                        }
                        match status {
                            ChannelStatus::Subscribed => {
                                lock(machine).on_subscribed();
                                tracing::info!(channel = %channel.name, "Realtime channel subscribed");
                            }
                            ChannelStatus::Error(reason) => {
                                return PumpEnd::Failed(SubscriptionError::ChannelError {
                                    channel: channel.name.clone(),
                                    reason,
                                }.to_string());
                            }
                            ChannelStatus::Closed => {
                                return PumpEnd::Failed(SubscriptionError::Closed {
                                    channel: channel.name.clone(),
                                }.to_string());
                            }
                        }
                    }
                    None => {
                        return PumpEnd::Failed(SubscriptionError::Closed {
                            channel: channel.name.clone(),
                        }.to_string());
                    }
                },
            }
        }
    }

    async fn unsubscribe(&self, channel: &str) {
        if let Err(e) = self.transport.unsubscribe(channel).await {
            tracing::warn!(channel, error = %e, "Unsubscribe failed");
        }
    }

    /// Invalidate what `change` makes stale and announce it.
    ///
    /// Keys from the table handlers and from the manager's rules for the
    /// mapped event are removed in one pass; the event then goes out on the
    /// bus marked as change-feed origin so the manager does not repeat the
    /// invalidation.
    pub async fn handle_change(&self, change: &ChangeNotification) -> ChangeOutcome {
        let mut patterns = read(&self.rules).affected_keys(change);
        let event = event_for(change);
        if let Some(event) = &event {
            push_unique(&mut patterns, self.manager.invalidation_keys(event));
        }

        let invalidated = if patterns.is_empty() {
            0
        } else {
            self.manager.invalidate(&patterns).await
        };
        if let Some(event) = &event {
            self.manager.bus().emit(event);
            self.counters.events_emitted.fetch_add(1, Ordering::Relaxed);
        }

        self.counters.changes.fetch_add(1, Ordering::Relaxed);
        self.counters
            .invalidated
            .fetch_add(invalidated as u64, Ordering::Relaxed);
        tracing::debug!(
            table = %change.table,
            operation = change.operation.as_str(),
            patterns = patterns.len(),
            invalidated,
            event = ?event.as_ref().map(|e| &e.kind),
            "Applied change"
        );
        ChangeOutcome {
            patterns,
            invalidated,
            event,
        }
    }

    /// Turn realtime sync on or off.
    ///
    /// Disabling stops every loop (each unsubscribes) and waits for them.
    /// Enabling relaunches channels that are not running, including ones
    /// that were disabled after exhausting their reconnects.
    pub async fn set_enabled(self: &Arc<Self>, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        if enabled {
            let mut slots = lock(&self.channels);
            let mut relaunched = 0;
            for slot in slots.values_mut() {
                if !slot.is_running() {
                    let fresh = self.launch(&slot.channel);
                    *slot = fresh;
                    relaunched += 1;
                }
            }
            tracing::info!(relaunched, "Realtime sync enabled");
        } else {
            self.stop_loops().await;
            for slot in lock(&self.channels).values() {
                lock(&slot.machine).reset();
            }
            tracing::info!("Realtime sync disabled");
        }
    }

    async fn stop_loops(&self) {
        let handles: Vec<(String, JoinHandle<()>)> = {
            let mut slots = lock(&self.channels);
            slots
                .iter_mut()
                .filter_map(|(name, slot)| {
                    slot.stop.send_replace(true);
                    slot.handle.take().map(|h| (name.clone(), h))
                })
                .collect()
        };
        for (channel, handle) in handles {
            if let Err(e) = handle.await {
                tracing::warn!(channel = %channel, error = %e, "Channel loop did not stop cleanly");
            }
        }
    }

    pub fn status(&self) -> BTreeMap<String, ChannelState> {
        lock(&self.channels)
            .iter()
            .map(|(name, slot)| (name.clone(), lock(&slot.machine).state()))
            .collect()
    }

    pub fn channel(&self, name: &str) -> Option<ChannelSnapshot> {
        let slots = lock(&self.channels);
        let slot = slots.get(name)?;
        let machine = lock(&slot.machine);
        Some(ChannelSnapshot {
            name: name.to_string(),
            state: machine.state(),
            attempt: machine.attempt(),
            timers_scheduled: machine.timers_scheduled(),
            last_error: machine.last_error().map(str::to_string),
            running: slot.is_running(),
        })
    }

    pub fn stats(&self) -> SyncStats {
        SyncStats {
            changes: self.counters.changes.load(Ordering::Relaxed),
            invalidated: self.counters.invalidated.load(Ordering::Relaxed),
            events_emitted: self.counters.events_emitted.load(Ordering::Relaxed),
        }
    }

    pub fn add_sync_rule(
        &self,
        table: impl Into<String>,
        operation: ChangeOperation,
        handler: SyncHandler,
    ) {
        write(&self.rules).add(SyncRule::new(table, operation, handler));
    }

    pub fn remove_sync_rule(&self, table: &str, operation: ChangeOperation) -> usize {
        write(&self.rules).remove(table, operation)
    }

    pub fn sync_rule_count(&self) -> usize {
        read(&self.rules).len()
    }

    /// Stop and unsubscribe every channel, then forget channels and rules.
    pub async fn cleanup(&self) {
        self.stop_loops().await;
        lock(&self.channels).clear();
        write(&self.rules).clear();
        tracing::info!("Realtime sync cleaned up");
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
