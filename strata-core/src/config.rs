//! Configuration loading for strata.
//!
//! Every section has production defaults, so an empty TOML document is a
//! valid configuration. `STRATA_*` environment variables override a handful
//! of deployment-specific values after the file is read.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::feed::ChangeOperation;
use crate::strategy::{Priority, StrategyTable};

const MB: u64 = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct StrataConfig {
    #[serde(default)]
    pub strategies: StrategyTable,
    #[serde(default)]
    pub limits: PriorityLimits,
    #[serde(default)]
    pub layers: LayerConfig,
    #[serde(default)]
    pub durable: DurableConfig,
    #[serde(default)]
    pub write_behind: WriteBehindConfig,
    #[serde(default)]
    pub realtime: RealtimeConfig,
    #[serde(default)]
    pub alerts: AlertsConfig,
}

/// Entry caps per priority class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PriorityLimits {
    pub critical: usize,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
}

impl PriorityLimits {
    pub fn limit(&self, priority: Priority) -> usize {
        match priority {
            Priority::Critical => self.critical,
            Priority::High => self.high,
            Priority::Medium => self.medium,
            Priority::Low => self.low,
        }
    }
}

impl Default for PriorityLimits {
    fn default() -> Self {
        Self {
            critical: 2000,
            high: 1500,
            medium: 1000,
            low: 500,
        }
    }
}

/// Capacity split between the memory and durable tiers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LayerConfig {
    pub l1_memory_ratio: f64,
    pub l2_storage_ratio: f64,
    /// Absolute cap of the memory tier.
    pub max_memory_mb: u64,
}

impl LayerConfig {
    pub fn l1_capacity_bytes(&self) -> usize {
        usize::try_from(self.max_memory_mb.saturating_mul(MB)).unwrap_or(usize::MAX)
    }

    /// LMDB map size for the durable tier, scaled from the memory cap by the
    /// tier ratios and rounded up to whole megabytes.
    pub fn l2_map_size_mb(&self) -> usize {
        let scaled = (self.max_memory_mb as f64 * self.l2_storage_ratio / self.l1_memory_ratio).ceil();
        (scaled as usize).max(1)
    }
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self {
            l1_memory_ratio: 0.3,
            l2_storage_ratio: 0.7,
            max_memory_mb: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DurableConfig {
    pub path: PathBuf,
}

impl Default for DurableConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./strata-cache"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WriteBehindConfig {
    pub flush_interval_ms: u64,
    /// Flush attempts per item before it moves to the dead-letter log.
    pub max_flush_attempts: u32,
    pub dead_letter_capacity: usize,
}

impl WriteBehindConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

impl Default for WriteBehindConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: 5000,
            max_flush_attempts: 3,
            dead_letter_capacity: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RealtimeConfig {
    pub enabled: bool,
    pub channels: Vec<RealtimeChannel>,
    pub reconnect: ReconnectConfig,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            channels: vec![RealtimeChannel {
                name: "cache-invalidation".to_string(),
                tables: ["likes", "follows", "user_stats", "post_stats"]
                    .into_iter()
                    .map(String::from)
                    .collect(),
                operations: ChangeOperation::ALL.to_vec(),
                log_status: false,
            }],
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// One change-feed channel subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RealtimeChannel {
    pub name: String,
    pub tables: Vec<String>,
    pub operations: Vec<ChangeOperation>,
    #[serde(default)]
    pub log_status: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReconnectConfig {
    pub base_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
    pub jitter_ms: u64,
    /// Consecutive failures after which a channel is disabled.
    pub max_attempts: u32,
}

impl ReconnectConfig {
    /// Delay before reconnect attempt `attempt` (1-based), without jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        let raw = self.base_ms as f64 * self.multiplier.powi(exp);
        let capped = if raw.is_finite() {
            (raw as u64).min(self.max_ms)
        } else {
            self.max_ms
        };
        Duration::from_millis(capped)
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_ms: 1000,
            max_ms: 60_000,
            multiplier: 2.0,
            jitter_ms: 0,
            max_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AlertsConfig {
    pub thresholds: AlertThresholds,
    pub dedup_window_secs: u64,
    pub max_alerts: usize,
    /// Latency samples kept per operation.
    pub latency_window: usize,
}

impl AlertsConfig {
    pub fn dedup_window(&self) -> Duration {
        Duration::from_secs(self.dedup_window_secs)
    }
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            thresholds: AlertThresholds::default(),
            dedup_window_secs: 300,
            max_alerts: 50,
            latency_window: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AlertThresholds {
    pub low_hit_rate: f64,
    /// Gets required before the hit-rate check applies.
    pub min_gets_for_hit_rate: u64,
    pub high_get_ms: f64,
    pub high_set_ms: f64,
    pub high_error_rate: f64,
    pub memory_warning: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            low_hit_rate: 0.70,
            min_gets_for_hit_rate: 50,
            high_get_ms: 100.0,
            high_set_ms: 200.0,
            high_error_rate: 0.05,
            memory_warning: 0.80,
        }
    }
}

fn invalid(field: &str, value: impl ToString, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_override<T: std::str::FromStr>(field: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| invalid(field, raw, "could not parse environment override"))
}

impl StrataConfig {
    /// Read, apply environment overrides, validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::from_path(path)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })
    }

    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary lookup; `apply_env_overrides` passes
    /// the process environment.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup("STRATA_MAX_MEMORY_MB") {
            self.layers.max_memory_mb = parse_override("STRATA_MAX_MEMORY_MB", &raw)?;
        }
        if let Some(raw) = lookup("STRATA_L1_MEMORY_RATIO") {
            self.layers.l1_memory_ratio = parse_override("STRATA_L1_MEMORY_RATIO", &raw)?;
        }
        if let Some(raw) = lookup("STRATA_L2_STORAGE_RATIO") {
            self.layers.l2_storage_ratio = parse_override("STRATA_L2_STORAGE_RATIO", &raw)?;
        }
        if let Some(raw) = lookup("STRATA_DURABLE_PATH") {
            self.durable.path = PathBuf::from(raw);
        }
        if let Some(raw) = lookup("STRATA_WRITE_BEHIND_INTERVAL_MS") {
            self.write_behind.flush_interval_ms =
                parse_override("STRATA_WRITE_BEHIND_INTERVAL_MS", &raw)?;
        }
        if let Some(raw) = lookup("STRATA_REALTIME_ENABLED") {
            self.realtime.enabled = raw.trim().to_lowercase() != "false";
        }
        if let Some(raw) = lookup("STRATA_RECONNECT_BASE_MS") {
            self.realtime.reconnect.base_ms = parse_override("STRATA_RECONNECT_BASE_MS", &raw)?;
        }
        if let Some(raw) = lookup("STRATA_RECONNECT_MAX_ATTEMPTS") {
            self.realtime.reconnect.max_attempts =
                parse_override("STRATA_RECONNECT_MAX_ATTEMPTS", &raw)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, descriptor) in self.strategies.iter() {
            if descriptor.ttl_ms == 0 {
                return Err(invalid(
                    &format!("strategies.{name}.ttl_ms"),
                    0,
                    "must be > 0",
                ));
            }
            if descriptor.max_size == 0 {
                return Err(invalid(
                    &format!("strategies.{name}.max_size"),
                    0,
                    "must be > 0",
                ));
            }
        }
        if self.strategies.fallback.ttl_ms == 0 {
            return Err(invalid("strategies.fallback.ttl_ms", 0, "must be > 0"));
        }

        for priority in Priority::ALL {
            if self.limits.limit(priority) == 0 {
                return Err(invalid(
                    &format!("limits.{}", priority.as_str()),
                    0,
                    "must be > 0",
                ));
            }
        }

        let layers = &self.layers;
        for (field, ratio) in [
            ("layers.l1_memory_ratio", layers.l1_memory_ratio),
            ("layers.l2_storage_ratio", layers.l2_storage_ratio),
        ] {
            if !(ratio > 0.0 && ratio <= 1.0) {
                return Err(invalid(field, ratio, "must be within (0, 1]"));
            }
        }
        let sum = layers.l1_memory_ratio + layers.l2_storage_ratio;
        if (sum - 1.0).abs() > 1e-6 {
            return Err(invalid("layers", sum, "ratios must sum to 1.0"));
        }
        if layers.max_memory_mb == 0 {
            return Err(invalid("layers.max_memory_mb", 0, "must be > 0"));
        }

        if self.durable.path.as_os_str().is_empty() {
            return Err(invalid("durable.path", "", "must not be empty"));
        }

        if self.write_behind.flush_interval_ms == 0 {
            return Err(invalid("write_behind.flush_interval_ms", 0, "must be > 0"));
        }
        if self.write_behind.max_flush_attempts == 0 {
            return Err(invalid("write_behind.max_flush_attempts", 0, "must be > 0"));
        }

        let reconnect = &self.realtime.reconnect;
        if reconnect.base_ms == 0 {
            return Err(invalid("realtime.reconnect.base_ms", 0, "must be > 0"));
        }
        if reconnect.max_ms < reconnect.base_ms {
            return Err(invalid(
                "realtime.reconnect.max_ms",
                reconnect.max_ms,
                "must be >= base_ms",
            ));
        }
        if reconnect.multiplier < 1.0 {
            return Err(invalid(
                "realtime.reconnect.multiplier",
                reconnect.multiplier,
                "must be >= 1.0",
            ));
        }
        if reconnect.max_attempts == 0 {
            return Err(invalid("realtime.reconnect.max_attempts", 0, "must be > 0"));
        }
        for channel in &self.realtime.channels {
            if channel.name.trim().is_empty() {
                return Err(invalid("realtime.channels.name", "", "must not be empty"));
            }
            if channel.tables.is_empty() {
                return Err(invalid(
                    &format!("realtime.channels.{}.tables", channel.name),
                    "[]",
                    "must list at least one table",
                ));
            }
            if channel.operations.is_empty() {
                return Err(invalid(
                    &format!("realtime.channels.{}.operations", channel.name),
                    "[]",
                    "must list at least one operation",
                ));
            }
        }

        let thresholds = &self.alerts.thresholds;
        for (field, value) in [
            ("alerts.thresholds.low_hit_rate", thresholds.low_hit_rate),
            ("alerts.thresholds.high_error_rate", thresholds.high_error_rate),
            ("alerts.thresholds.memory_warning", thresholds.memory_warning),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(invalid(field, value, "must be within 0..=1"));
            }
        }
        if self.alerts.max_alerts == 0 {
            return Err(invalid("alerts.max_alerts", 0, "must be > 0"));
        }
        if self.alerts.latency_window == 0 {
            return Err(invalid("alerts.latency_window", 0, "must be > 0"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_empty_document_yields_production_defaults() {
        let config = StrataConfig::from_toml("").unwrap();
        assert_eq!(config, StrataConfig::default());
        assert!(config.validate().is_ok());
        assert_eq!(config.limits.limit(Priority::Critical), 2000);
        assert_eq!(config.layers.l1_capacity_bytes(), 50 * 1024 * 1024);
        assert_eq!(config.layers.l2_map_size_mb(), 117);
        assert_eq!(config.realtime.channels[0].name, "cache-invalidation");
    }

    #[test]
    fn test_partial_sections_parse() {
        let raw = r#"
            [layers]
            l1_memory_ratio = 0.5
            l2_storage_ratio = 0.5
            max_memory_mb = 8

            [strategies.feed]
            ttl_ms = 30000
            priority = "high"
            max_size = 20
            stale_while_revalidate = true

            [realtime.reconnect]
            base_ms = 250
            max_ms = 4000
            multiplier = 2.0
            jitter_ms = 0
            max_attempts = 3
        "#;
        let config = StrataConfig::from_toml(raw).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.layers.max_memory_mb, 8);
        assert_eq!(config.layers.l2_map_size_mb(), 8);
        assert_eq!(config.strategies.named.len(), 1);
        assert!(config.strategies.get("feed").is_some());
        assert_eq!(config.realtime.reconnect.max_attempts, 3);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let raw = "[layers]\nl1_memory_ratio = 0.3\nl2_storage_ratio = 0.7\nmax_memory_mb = 1\nbogus = 1\n";
        assert!(matches!(
            StrataConfig::from_toml(raw),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_ratios_must_sum_to_one() {
        let mut config = StrataConfig::default();
        config.layers.l1_memory_ratio = 0.5;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("sum to 1.0"));
    }

    #[test]
    fn test_reconnect_max_below_base_rejected() {
        let mut config = StrataConfig::default();
        config.realtime.reconnect.max_ms = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_ttl_strategy_rejected() {
        let mut config = StrataConfig::default();
        if let Some(likes) = config.strategies.named.get_mut("likes") {
            likes.ttl_ms = 0;
        }
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("strategies.likes.ttl_ms"));
    }

    #[test]
    fn test_overrides_applied_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("STRATA_MAX_MEMORY_MB", "12"),
            ("STRATA_REALTIME_ENABLED", "false"),
            ("STRATA_RECONNECT_MAX_ATTEMPTS", "7"),
            ("STRATA_DURABLE_PATH", "/var/cache/strata"),
        ]
        .into_iter()
        .collect();
        let mut config = StrataConfig::default();
        config
            .apply_overrides(|name| vars.get(name).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.layers.max_memory_mb, 12);
        assert!(!config.realtime.enabled);
        assert_eq!(config.realtime.reconnect.max_attempts, 7);
        assert_eq!(config.durable.path, PathBuf::from("/var/cache/strata"));
    }

    #[test]
    fn test_unparseable_override_is_error() {
        let mut config = StrataConfig::default();
        let err = config
            .apply_overrides(|name| (name == "STRATA_MAX_MEMORY_MB").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("STRATA_MAX_MEMORY_MB"));
    }

    #[test]
    fn test_reconnect_delay_doubles_and_caps() {
        let reconnect = ReconnectConfig::default();
        assert_eq!(reconnect.delay_for(1), Duration::from_millis(2000));
        assert_eq!(reconnect.delay_for(2), Duration::from_millis(4000));
        assert_eq!(reconnect.delay_for(4), Duration::from_millis(16000));
        assert_eq!(reconnect.delay_for(40), Duration::from_millis(60_000));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[write_behind]\nflush_interval_ms = 250\nmax_flush_attempts = 2\ndead_letter_capacity = 10").unwrap();
        let config = StrataConfig::from_path(file.path()).unwrap();
        assert_eq!(config.write_behind.flush_interval(), Duration::from_millis(250));
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let err = StrataConfig::from_path(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
