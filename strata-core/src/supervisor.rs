//! Supervised background tasks.
//!
//! Stale-while-revalidate reloads, rule-driven refreshes, the write-behind
//! flush loop and channel reconnect loops all run through a
//! [`TaskSupervisor`]. Failures and panics are counted, logged with the task
//! label, and passed to an optional hook; they never unwind into the caller
//! that scheduled the work.

use std::panic::AssertUnwindSafe;
use std::pin::pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use futures_util::FutureExt;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use crate::error::{CacheError, CacheResult};

/// Called with the task label and error whenever a supervised task fails.
pub type FailureHook = Arc<dyn Fn(&str, &CacheError) + Send + Sync>;

#[derive(Debug, Default)]
struct SupervisorMetrics {
    spawned: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    panicked: AtomicU64,
    in_flight: AtomicU64,
}

/// Snapshot of supervisor counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SupervisorStats {
    pub spawned: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub panicked: u64,
    pub in_flight: u64,
}

struct Inner {
    metrics: SupervisorMetrics,
    idle: Notify,
    shutdown_tx: watch::Sender<bool>,
    on_failure: RwLock<Option<FailureHook>>,
}

/// Spawns and tracks fire-and-forget work. Cheap to clone.
#[derive(Clone)]
pub struct TaskSupervisor {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for TaskSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskSupervisor")
            .field("stats", &self.stats())
            .finish()
    }
}

impl Default for TaskSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskSupervisor {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                metrics: SupervisorMetrics::default(),
                idle: Notify::new(),
                shutdown_tx,
                on_failure: RwLock::new(None),
            }),
        }
    }

    pub fn set_failure_hook(&self, hook: FailureHook) {
        if let Ok(mut slot) = self.inner.on_failure.write() {
            *slot = Some(hook);
        }
    }

    /// Run `task` in the background under supervision.
    pub fn spawn<F>(&self, label: impl Into<String>, task: F) -> JoinHandle<()>
    where
        F: std::future::Future<Output = CacheResult<()>> + Send + 'static,
    {
        let label = label.into();
        let inner = Arc::clone(&self.inner);
        inner.metrics.spawned.fetch_add(1, Ordering::Relaxed);
        inner.metrics.in_flight.fetch_add(1, Ordering::SeqCst);

        tokio::spawn(async move {
            match AssertUnwindSafe(task).catch_unwind().await {
                Ok(Ok(())) => {
                    inner.metrics.succeeded.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(task = %label, "Background task completed");
                }
                Ok(Err(e)) => {
                    inner.metrics.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(task = %label, error = %e, "Background task failed");
                    inner.report(&label, &e);
                }
                Err(_) => {
                    inner.metrics.panicked.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(task = %label, "Background task panicked");
                    inner.report(&label, &CacheError::handler("background task panicked"));
                }
            }
            if inner.metrics.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
                inner.idle.notify_waiters();
            }
        })
    }

    /// Receiver that flips to `true` when [`shutdown`](Self::shutdown) is called.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.inner.shutdown_tx.subscribe()
    }

    pub fn shutdown(&self) {
        self.inner.shutdown_tx.send_replace(true);
        tracing::info!("Task supervisor shutting down");
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.inner.shutdown_tx.borrow()
    }

    /// Resolve once no supervised task is running.
    pub async fn wait_idle(&self) {
        loop {
            let mut notified = pin!(self.inner.idle.notified());
            notified.as_mut().enable();
            if self.inner.metrics.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    pub fn stats(&self) -> SupervisorStats {
        let m = &self.inner.metrics;
        SupervisorStats {
            spawned: m.spawned.load(Ordering::Relaxed),
            succeeded: m.succeeded.load(Ordering::Relaxed),
            failed: m.failed.load(Ordering::Relaxed),
            panicked: m.panicked.load(Ordering::Relaxed),
            in_flight: m.in_flight.load(Ordering::SeqCst),
        }
    }
}

impl Inner {
    fn report(&self, label: &str, error: &CacheError) {
        let hook = match self.on_failure.read() {
            Ok(slot) => slot.clone(),
            Err(_) => None,
        };
        if let Some(hook) = hook {
            hook(label, error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SourceError;
    use std::sync::Mutex;
    use std::time::Duration;

    #[tokio::test]
    async fn test_counts_success_and_failure() {
        let supervisor = TaskSupervisor::new();
        supervisor.spawn("ok", async { Ok(()) });
        supervisor.spawn("bad", async {
            Err(SourceError::Unavailable {
                reason: "down".to_string(),
            }
            .into())
        });
        supervisor.wait_idle().await;

        let stats = supervisor.stats();
        assert_eq!(stats.spawned, 2);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test]
    async fn test_panic_is_contained_and_reported() {
        let supervisor = TaskSupervisor::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        supervisor.set_failure_hook(Arc::new(move |label, _err| {
            sink.lock().unwrap().push(label.to_string());
        }));

        supervisor.spawn("boom", async {
            panic!("task blew up");
        });
        supervisor.wait_idle().await;

        assert_eq!(supervisor.stats().panicked, 1);
        assert_eq!(seen.lock().unwrap().as_slice(), ["boom".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_idle_waits_for_slow_tasks() {
        let supervisor = TaskSupervisor::new();
        supervisor.spawn("slow", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        });
        assert_eq!(supervisor.stats().in_flight, 1);
        supervisor.wait_idle().await;
        assert_eq!(supervisor.stats().succeeded, 1);
    }

    #[tokio::test]
    async fn test_shutdown_signal_observed() {
        let supervisor = TaskSupervisor::new();
        let mut rx = supervisor.shutdown_signal();
        assert!(!supervisor.is_shutting_down());
        supervisor.shutdown();
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
        assert!(supervisor.is_shutting_down());
    }
}
