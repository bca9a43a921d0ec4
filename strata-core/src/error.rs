//! Error types for strata operations

use thiserror::Error;

/// Cache tier errors.
///
/// These never cross the storage contract: tiers log them and degrade to a
/// miss or no-op. They exist so tier internals can use `?`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Tier {tier} I/O failed: {reason}")]
    Io { tier: &'static str, reason: String },

    #[error("Failed to encode entry for {key}: {reason}")]
    Encode { key: String, reason: String },

    #[error("Failed to decode entry for {key}: {reason}")]
    Decode { key: String, reason: String },

    #[error("Transaction failed: {reason}")]
    TransactionFailed { reason: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

/// Remote data source errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("Source unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Source read failed for {key}: {reason}")]
    ReadFailed { key: String, reason: String },

    #[error("Source write failed for {key}: {reason}")]
    WriteFailed { key: String, reason: String },

    #[error("Source delete failed for {key}: {reason}")]
    DeleteFailed { key: String, reason: String },

    #[error("Loader failed for {key}: {reason}")]
    LoaderFailed { key: String, reason: String },
}

/// Change-feed transport errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SubscriptionError {
    #[error("Subscribe to {channel} failed: {reason}")]
    SubscribeFailed { channel: String, reason: String },

    #[error("Channel {channel} reported an error: {reason}")]
    ChannelError { channel: String, reason: String },

    #[error("Channel {channel} closed")]
    Closed { channel: String },

    #[error("Channel {channel} disabled after {attempts} attempts")]
    Disabled { channel: String, attempts: u32 },
}

/// Validation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid key {key:?}: {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("Invalid pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Unknown event kind: {kind}")]
    UnknownEventKind { kind: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to read config {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("Failed to parse config: {reason}")]
    Parse { reason: String },
}

/// Master error type for all strata errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Subscription error: {0}")]
    Subscription(#[from] SubscriptionError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Handler error: {reason}")]
    Handler { reason: String },
}

impl CacheError {
    /// Shorthand for an error raised inside an event or change handler.
    pub fn handler(reason: impl Into<String>) -> Self {
        Self::Handler {
            reason: reason.into(),
        }
    }
}

/// Result type alias for strata operations.
pub type CacheResult<T> = Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_display_io() {
        let err = StorageError::Io {
            tier: "l2",
            reason: "disk full".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("l2"));
        assert!(msg.contains("disk full"));
    }

    #[test]
    fn test_source_error_converts_into_cache_error() {
        let err: CacheError = SourceError::ReadFailed {
            key: "post:1".to_string(),
            reason: "timeout".to_string(),
        }
        .into();
        assert!(matches!(err, CacheError::Source(_)));
        assert!(err.to_string().contains("post:1"));
    }

    #[test]
    fn test_validation_error_display_invalid_pattern() {
        let err = ValidationError::InvalidPattern {
            pattern: "us*er".to_string(),
            reason: "wildcard must end a segment".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("us*er"));
        assert!(msg.contains("wildcard"));
    }

    #[test]
    fn test_config_error_display_invalid_value() {
        let err = ConfigError::InvalidValue {
            field: "layers.l1_memory_ratio".to_string(),
            value: "1.5".to_string(),
            reason: "must be within 0..=1".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("l1_memory_ratio"));
        assert!(msg.contains("1.5"));
    }

    #[test]
    fn test_subscription_error_display_disabled() {
        let err = SubscriptionError::Disabled {
            channel: "cache-invalidation".to_string(),
            attempts: 5,
        };
        assert!(err.to_string().contains("5 attempts"));
    }
}
