//! Cache metrics and threshold alerting.
//!
//! One [`MetricsCollector`] per manager, injected at construction. Latency
//! windows keep the most recent samples only; averages and maxima are
//! computed over the window. Threshold breaches become [`Alert`]s, at most
//! one per `(metric, level)` inside the dedup window, and the alert log is
//! capped.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strata_core::{AlertsConfig, StrataConfig};

type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Severity of an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    Warning,
    Error,
}

/// Metric an alert is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AlertMetric {
    HitRate,
    AvgGetTime,
    AvgSetTime,
    ErrorRate,
    MemoryUsage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    #[serde(rename = "type")]
    pub level: AlertLevel,
    pub metric: AlertMetric,
    pub threshold: f64,
    pub current_value: f64,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Where a read was served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetOutcome {
    L1Hit,
    L2Hit,
    Miss,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub l1_hits: u64,
    pub l2_hits: u64,
    pub hit_rate: f64,
    pub gets: u64,
    pub sets: u64,
    pub deletes: u64,
    pub invalidations: u64,
    pub avg_get_ms: f64,
    pub avg_set_ms: f64,
    pub max_get_ms: f64,
    pub max_set_ms: f64,
    /// Bytes held by the memory tier.
    pub l1_bytes: u64,
    /// Entries held by the durable tier.
    pub l2_entries: u64,
    pub errors: u64,
    pub last_error: Option<String>,
    pub start_time: DateTime<Utc>,
    pub last_reset: DateTime<Utc>,
}

impl CacheMetrics {
    fn zeroed(now: DateTime<Utc>) -> Self {
        Self {
            hits: 0,
            misses: 0,
            l1_hits: 0,
            l2_hits: 0,
            hit_rate: 0.0,
            gets: 0,
            sets: 0,
            deletes: 0,
            invalidations: 0,
            avg_get_ms: 0.0,
            avg_set_ms: 0.0,
            max_get_ms: 0.0,
            max_set_ms: 0.0,
            l1_bytes: 0,
            l2_entries: 0,
            errors: 0,
            last_error: None,
            start_time: now,
            last_reset: now,
        }
    }

    pub fn total_operations(&self) -> u64 {
        self.gets + self.sets + self.deletes
    }
}

impl fmt::Display for CacheMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Cache Metrics:")?;
        writeln!(f, "├─ Hit Rate: {:.1}%", self.hit_rate * 100.0)?;
        writeln!(f, "├─ Operations: {}", self.total_operations())?;
        writeln!(f, "├─ Avg Get Time: {:.1}ms", self.avg_get_ms)?;
        writeln!(f, "├─ Avg Set Time: {:.1}ms", self.avg_set_ms)?;
        writeln!(
            f,
            "├─ Cache Size: L1={}KB, L2={} entries",
            (self.l1_bytes as f64 / 1024.0).round(),
            self.l2_entries
        )?;
        write!(f, "└─ Errors: {}", self.errors)
    }
}

/// Human-oriented summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceSummary {
    pub hit_rate: String,
    pub avg_response_time: String,
    pub total_operations: u64,
    pub uptime: String,
    pub alerts_count: usize,
}

/// Fixed-capacity window of latency samples in milliseconds.
#[derive(Debug, Clone, Default)]
struct LatencyWindow {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl LatencyWindow {
    fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, ms: f64) {
        if self.capacity == 0 {
            return;
        }
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(ms);
    }

    fn average(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }

    fn max(&self) -> f64 {
        self.samples.iter().copied().fold(0.0, f64::max)
    }

    fn clear(&mut self) {
        self.samples.clear();
    }
}

struct State {
    metrics: CacheMetrics,
    get_times: LatencyWindow,
    set_times: LatencyWindow,
    alerts: VecDeque<Alert>,
}

pub struct MetricsCollector {
    config: AlertsConfig,
    memory_cap_bytes: u64,
    clock: Clock,
    state: Mutex<State>,
}

impl fmt::Debug for MetricsCollector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsCollector")
            .field("config", &self.config)
            .field("memory_cap_bytes", &self.memory_cap_bytes)
            .finish_non_exhaustive()
    }
}

impl MetricsCollector {
    /// `memory_cap_bytes` is the L1 capacity the memory alert is measured against.
    pub fn new(config: AlertsConfig, memory_cap_bytes: u64) -> Self {
        Self::with_clock(config, memory_cap_bytes, Arc::new(Utc::now))
    }

    pub fn from_config(config: &StrataConfig) -> Self {
        let cap = u64::try_from(config.layers.l1_capacity_bytes()).unwrap_or(u64::MAX);
        Self::new(config.alerts.clone(), cap)
    }

    /// Collector reading time from `clock`.
    pub fn with_clock(config: AlertsConfig, memory_cap_bytes: u64, clock: Clock) -> Self {
        let now = clock();
        let window = config.latency_window;
        Self {
            config,
            memory_cap_bytes,
            clock,
            state: Mutex::new(State {
                metrics: CacheMetrics::zeroed(now),
                get_times: LatencyWindow::new(window),
                set_times: LatencyWindow::new(window),
                alerts: VecDeque::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record_get(&self, elapsed: Duration, outcome: GetOutcome) {
        let now = (self.clock)();
        let mut state = self.lock();
        let m = &mut state.metrics;
        m.gets += 1;
        match outcome {
            GetOutcome::L1Hit => {
                m.hits += 1;
                m.l1_hits += 1;
            }
            GetOutcome::L2Hit => {
                m.hits += 1;
                m.l2_hits += 1;
            }
            GetOutcome::Miss => m.misses += 1,
        }
        state.get_times.push(as_ms(elapsed));
        refresh_derived(&mut state);
        self.check_hit_rate(&mut state, now);
        self.check_latency(&mut state, now);
    }

    pub fn record_set(&self, elapsed: Duration) {
        let now = (self.clock)();
        let mut state = self.lock();
        state.metrics.sets += 1;
        state.set_times.push(as_ms(elapsed));
        refresh_derived(&mut state);
        self.check_latency(&mut state, now);
    }

    pub fn record_delete(&self) {
        self.lock().metrics.deletes += 1;
    }

    pub fn record_invalidation(&self, keys: usize) {
        self.lock().metrics.invalidations += keys as u64;
    }

    pub fn record_error(&self, error: impl Into<String>) {
        let now = (self.clock)();
        let mut state = self.lock();
        state.metrics.errors += 1;
        state.metrics.last_error = Some(error.into());

        let ops = state.metrics.gets + state.metrics.sets;
        if ops > 0 {
            let rate = state.metrics.errors as f64 / ops as f64;
            let threshold = self.config.thresholds.high_error_rate;
            if rate > threshold {
                self.raise(
                    &mut state,
                    now,
                    AlertLevel::Error,
                    AlertMetric::ErrorRate,
                    threshold,
                    rate,
                    format!("High error rate: {:.1}%", rate * 100.0),
                );
            }
        }
    }

    pub fn update_cache_sizes(&self, l1_bytes: u64, l2_entries: u64) {
        let now = (self.clock)();
        let mut state = self.lock();
        state.metrics.l1_bytes = l1_bytes;
        state.metrics.l2_entries = l2_entries;

        if self.memory_cap_bytes == 0 {
            return;
        }
        let ratio = l1_bytes as f64 / self.memory_cap_bytes as f64;
        let threshold = self.config.thresholds.memory_warning;
        if ratio > threshold {
            self.raise(
                &mut state,
                now,
                AlertLevel::Warning,
                AlertMetric::MemoryUsage,
                threshold,
                ratio,
                format!("High memory usage: {:.1}%", ratio * 100.0),
            );
        }
    }

    fn check_hit_rate(&self, state: &mut State, now: DateTime<Utc>) {
        let t = &self.config.thresholds;
        let rate = state.metrics.hit_rate;
        if rate < t.low_hit_rate && state.metrics.gets >= t.min_gets_for_hit_rate {
            self.raise(
                state,
                now,
                AlertLevel::Warning,
                AlertMetric::HitRate,
                t.low_hit_rate,
                rate,
                format!("Low cache hit rate: {:.1}%", rate * 100.0),
            );
        }
    }

    fn check_latency(&self, state: &mut State, now: DateTime<Utc>) {
        let t = &self.config.thresholds;
        let avg_get = state.metrics.avg_get_ms;
        if avg_get > t.high_get_ms {
            self.raise(
                state,
                now,
                AlertLevel::Warning,
                AlertMetric::AvgGetTime,
                t.high_get_ms,
                avg_get,
                format!("High average get time: {avg_get:.1}ms"),
            );
        }
        let avg_set = state.metrics.avg_set_ms;
        if avg_set > t.high_set_ms {
            self.raise(
                state,
                now,
                AlertLevel::Warning,
                AlertMetric::AvgSetTime,
                t.high_set_ms,
                avg_set,
                format!("High average set time: {avg_set:.1}ms"),
            );
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn raise(
        &self,
        state: &mut State,
        now: DateTime<Utc>,
        level: AlertLevel,
        metric: AlertMetric,
        threshold: f64,
        current_value: f64,
        message: String,
    ) {
        let window = chrono::Duration::from_std(self.config.dedup_window())
            .unwrap_or(chrono::Duration::MAX);
        let duplicate = state.alerts.iter().any(|a| {
            a.metric == metric && a.level == level && now.signed_duration_since(a.timestamp) < window
        });
        if duplicate {
            return;
        }

        tracing::debug!(?metric, ?level, current_value, threshold, "Cache alert raised");
        state.alerts.push_back(Alert {
            level,
            metric,
            threshold,
            current_value,
            message,
            timestamp: now,
        });
        while state.alerts.len() > self.config.max_alerts {
            state.alerts.pop_front();
        }
    }

    pub fn snapshot(&self) -> CacheMetrics {
        self.lock().metrics.clone()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.lock().alerts.iter().cloned().collect()
    }

    pub fn performance_summary(&self) -> PerformanceSummary {
        let now = (self.clock)();
        let state = self.lock();
        summarize(&state, now)
    }

    /// Metrics, the last ten alerts and the summary as a JSON document.
    pub fn export(&self) -> serde_json::Value {
        let now = (self.clock)();
        let state = self.lock();
        let skip = state.alerts.len().saturating_sub(10);
        let recent: Vec<&Alert> = state.alerts.iter().skip(skip).collect();
        serde_json::json!({
            "timestamp": now,
            "metrics": state.metrics,
            "alerts": recent,
            "performance": summarize(&state, now),
        })
    }

    pub fn export_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.export())
    }

    /// Drop alerts raised more than `older_than` ago.
    pub fn clear_old_alerts(&self, older_than: Duration) {
        let now = (self.clock)();
        let age = chrono::Duration::from_std(older_than).unwrap_or(chrono::Duration::MAX);
        let mut state = self.lock();
        state
            .alerts
            .retain(|a| now.signed_duration_since(a.timestamp) < age);
    }

    /// Zero every counter, empty the windows and the alert log.
    pub fn reset(&self) {
        let now = (self.clock)();
        let mut state = self.lock();
        state.metrics = CacheMetrics::zeroed(now);
        state.get_times.clear();
        state.set_times.clear();
        state.alerts.clear();
    }
}

fn as_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

fn refresh_derived(state: &mut State) {
    let m = &mut state.metrics;
    let lookups = m.hits + m.misses;
    m.hit_rate = if lookups > 0 {
        m.hits as f64 / lookups as f64
    } else {
        0.0
    };
    m.avg_get_ms = state.get_times.average();
    m.max_get_ms = state.get_times.max();
    m.avg_set_ms = state.set_times.average();
    m.max_set_ms = state.set_times.max();
}

fn summarize(state: &State, now: DateTime<Utc>) -> PerformanceSummary {
    let m = &state.metrics;
    let uptime = now.signed_duration_since(m.start_time);
    PerformanceSummary {
        hit_rate: format!("{:.1}%", m.hit_rate * 100.0),
        avg_response_time: format!("{:.1}ms", m.avg_get_ms),
        total_operations: m.total_operations(),
        uptime: format!("{}h {}m", uptime.num_hours(), uptime.num_minutes() % 60),
        alerts_count: state.alerts.len(),
    }
}
