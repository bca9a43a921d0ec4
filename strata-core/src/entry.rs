//! Cache entries and their validity rules.
//!
//! Validity is evaluated lazily on read: an entry is valid while
//! `now - timestamp < ttl`, and stale once more than [`STALE_FRACTION`]
//! of its TTL has elapsed.

use std::time::Duration;

use chrono::Utc;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};

/// Fraction of the TTL after which a still-valid entry counts as stale.
pub const STALE_FRACTION: f64 = 0.8;

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// A cached value plus its bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry<T> {
    pub data: T,
    /// Creation time, epoch milliseconds.
    pub timestamp: i64,
    /// Time to live in milliseconds.
    pub ttl: u64,
    pub version: u64,
    #[serde(default)]
    pub compressed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

/// The representation the tiers hold.
pub type StoredEntry = Entry<Value>;

impl<T> Entry<T> {
    /// Create an entry stamped with the current time.
    pub fn new(data: T, ttl: Duration) -> Self {
        Self::created_at(data, ttl, now_ms())
    }

    /// Create an entry with an explicit creation time.
    pub fn created_at(data: T, ttl: Duration, timestamp: i64) -> Self {
        Self {
            data,
            timestamp,
            ttl: u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
            version: 1,
            compressed: false,
            metadata: None,
        }
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    pub fn with_compressed(mut self, compressed: bool) -> Self {
        self.compressed = compressed;
        self
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn ttl_duration(&self) -> Duration {
        Duration::from_millis(self.ttl)
    }

    /// Age in milliseconds at `now`. Clock skew into the future counts as zero.
    pub fn age_ms(&self, now: i64) -> u64 {
        u64::try_from(now.saturating_sub(self.timestamp)).unwrap_or(0)
    }

    pub fn is_valid_at(&self, now: i64) -> bool {
        self.age_ms(now) < self.ttl
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid_at(now_ms())
    }

    /// Valid, but past the stale threshold.
    pub fn is_stale_at(&self, now: i64) -> bool {
        let age = self.age_ms(now);
        age < self.ttl && age as f64 > self.ttl as f64 * STALE_FRACTION
    }

    pub fn is_stale(&self) -> bool {
        self.is_stale_at(now_ms())
    }

    /// Replace the payload, keeping the bookkeeping.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Entry<U> {
        Entry {
            data: f(self.data),
            timestamp: self.timestamp,
            ttl: self.ttl,
            version: self.version,
            compressed: self.compressed,
            metadata: self.metadata,
        }
    }
}

impl<T: Serialize> Entry<T> {
    /// Convert into the tier representation.
    pub fn to_stored(&self) -> Result<StoredEntry, serde_json::Error> {
        Ok(Entry {
            data: serde_json::to_value(&self.data)?,
            timestamp: self.timestamp,
            ttl: self.ttl,
            version: self.version,
            compressed: self.compressed,
            metadata: self.metadata.clone(),
        })
    }
}

impl StoredEntry {
    /// Decode the payload into a concrete type.
    pub fn decode<T: DeserializeOwned>(self) -> Result<Entry<T>, serde_json::Error> {
        let data = serde_json::from_value(self.data)?;
        Ok(Entry {
            data,
            timestamp: self.timestamp,
            ttl: self.ttl,
            version: self.version,
            compressed: self.compressed,
            metadata: self.metadata,
        })
    }

    /// Serialized size in bytes, used by the memory tier for accounting.
    pub fn encoded_len(&self) -> usize {
        serde_json::to_vec(self).map(|bytes| bytes.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_entry_valid_until_ttl_elapses() {
        let entry = Entry::created_at(1, Duration::from_millis(1000), 10_000);
        assert!(entry.is_valid_at(10_000));
        assert!(entry.is_valid_at(10_999));
        assert!(!entry.is_valid_at(11_000));
    }

    #[test]
    fn test_entry_stale_window() {
        let entry = Entry::created_at("v", Duration::from_millis(1000), 0);
        assert!(!entry.is_stale_at(800));
        assert!(entry.is_stale_at(850));
        assert!(entry.is_stale_at(999));
        // Expired entries are invalid, not stale.
        assert!(!entry.is_stale_at(1000));
    }

    #[test]
    fn test_future_timestamp_counts_as_fresh() {
        let entry = Entry::created_at(1, Duration::from_millis(10), 5_000);
        assert_eq!(entry.age_ms(4_000), 0);
        assert!(entry.is_valid_at(4_000));
    }

    #[test]
    fn test_stored_round_trip_keeps_bookkeeping() {
        let entry = Entry::new(vec![1u32, 2, 3], Duration::from_secs(60)).with_version(7);
        let stored = entry.to_stored().unwrap();
        assert_eq!(stored.data, json!([1, 2, 3]));

        let back: Entry<Vec<u32>> = stored.decode().unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn test_decode_type_mismatch_is_error() {
        let stored = Entry::new(json!({"a": 1}), Duration::from_secs(1));
        assert!(stored.decode::<Vec<u8>>().is_err());
    }

    #[test]
    fn test_encoded_len_grows_with_payload() {
        let small = Entry::new(json!("x"), Duration::from_secs(1));
        let large = Entry::new(json!("x".repeat(500)), Duration::from_secs(1));
        assert!(large.encoded_len() > small.encoded_len() + 400);
    }
}
