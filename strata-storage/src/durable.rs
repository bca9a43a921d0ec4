//! LMDB-backed durable tier (L2).
//!
//! Uses the heed crate (Rust bindings for LMDB) for a memory-mapped store
//! that survives process restarts. Keys are stored as their string form and
//! entries as JSON, so an ordered prefix scan serves pattern enumeration.
//!
//! # Error isolation
//!
//! Every operation is implemented as a fallible inner method returning
//! [`DurableTierError`]. The [`CacheStorage`] impl logs failures and
//! degrades to a miss or a no-op, so nothing propagates to callers.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use heed::types::{Bytes, Str};
use heed::{Database, Env, EnvOpenOptions};
use strata_core::{CacheKey, KeyPattern, StorageError, StoredEntry};

use crate::storage::CacheStorage;

/// Durable tier failure, tagged with where it happened.
#[derive(Debug, thiserror::Error)]
pub enum DurableTierError {
    #[error("Cannot open durable tier at {}: {reason}", path.display())]
    Open { path: PathBuf, reason: String },

    #[error("Durable tier {op} failed: {source}")]
    Lmdb {
        op: &'static str,
        #[source]
        source: heed::Error,
    },

    #[error("Durable tier cannot encode {key}: {reason}")]
    Encode { key: String, reason: String },

    #[error("Durable tier holds undecodable entry for {key}: {reason}")]
    Decode { key: String, reason: String },
}

impl DurableTierError {
    fn open(path: &Path, reason: impl std::fmt::Display) -> Self {
        Self::Open {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }
}

/// Tags an LMDB failure with the tier operation that raised it.
fn lmdb(op: &'static str) -> impl FnOnce(heed::Error) -> DurableTierError {
    move |source| DurableTierError::Lmdb { op, source }
}

impl From<DurableTierError> for StorageError {
    fn from(e: DurableTierError) -> Self {
        match e {
            DurableTierError::Encode { key, reason } => StorageError::Encode { key, reason },
            DurableTierError::Decode { key, reason } => StorageError::Decode { key, reason },
            DurableTierError::Lmdb { .. } => StorageError::TransactionFailed {
                reason: e.to_string(),
            },
            DurableTierError::Open { .. } => StorageError::Io {
                tier: "l2",
                reason: e.to_string(),
            },
        }
    }
}

/// Durable tier backed by a single unnamed LMDB database.
pub struct DurableTier {
    env: Env,
    db: Database<Str, Bytes>,
}

impl std::fmt::Debug for DurableTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableTier")
            .field("path", &self.env.path())
            .finish()
    }
}

impl DurableTier {
    /// Open (or create) the store under `path`, sized to `map_size_mb`.
    ///
    /// Any failure before the database handle exists is reported as
    /// [`DurableTierError::Open`] carrying the path.
    pub fn open<P: AsRef<Path>>(path: P, map_size_mb: usize) -> Result<Self, DurableTierError> {
        let path = path.as_ref();
        std::fs::create_dir_all(path).map_err(|e| DurableTierError::open(path, e))?;

        // SAFETY: the environment is opened once per path by this process;
        // callers must not open the same directory twice concurrently.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size_mb * 1024 * 1024)
                .max_dbs(1)
                .open(path)
        }
        .map_err(|e| DurableTierError::open(path, e))?;

        let db = env
            .write_txn()
            .and_then(|mut wtxn| {
                let db: Database<Str, Bytes> = env.create_database(&mut wtxn, None)?;
                wtxn.commit()?;
                Ok(db)
            })
            .map_err(|e| DurableTierError::open(path, e))?;

        tracing::debug!(path = %path.display(), map_size_mb, "Durable tier opened");
        Ok(Self { env, db })
    }

    fn encode(key: &CacheKey, entry: &StoredEntry) -> Result<Vec<u8>, DurableTierError> {
        serde_json::to_vec(entry).map_err(|e| DurableTierError::Encode {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }

    fn decode(key: &CacheKey, bytes: &[u8]) -> Result<StoredEntry, DurableTierError> {
        serde_json::from_slice(bytes).map_err(|e| DurableTierError::Decode {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }

    fn try_get(&self, key: &CacheKey) -> Result<Option<StoredEntry>, DurableTierError> {
        let rtxn = self.env.read_txn().map_err(lmdb("get"))?;
        match self.db.get(&rtxn, key.as_str()).map_err(lmdb("get"))? {
            Some(bytes) => Self::decode(key, bytes).map(Some),
            None => Ok(None),
        }
    }

    fn try_put_many(&self, entries: &[(CacheKey, StoredEntry)]) -> Result<(), DurableTierError> {
        let encoded = entries
            .iter()
            .map(|(key, entry)| Ok((key, Self::encode(key, entry)?)))
            .collect::<Result<Vec<_>, DurableTierError>>()?;

        let mut wtxn = self.env.write_txn().map_err(lmdb("put"))?;
        for (key, bytes) in &encoded {
            self.db
                .put(&mut wtxn, key.as_str(), bytes.as_slice())
                .map_err(lmdb("put"))?;
        }
        wtxn.commit().map_err(lmdb("put"))
    }

    fn try_delete_many(&self, keys: &[CacheKey]) -> Result<(), DurableTierError> {
        let mut wtxn = self.env.write_txn().map_err(lmdb("delete"))?;
        for key in keys {
            self.db
                .delete(&mut wtxn, key.as_str())
                .map_err(lmdb("delete"))?;
        }
        wtxn.commit().map_err(lmdb("delete"))
    }

    /// Keys sharing the pattern's literal prefix, filtered by the full match.
    fn try_keys(&self, pattern: Option<&KeyPattern>) -> Result<Vec<CacheKey>, DurableTierError> {
        let rtxn = self.env.read_txn().map_err(lmdb("scan"))?;
        let mut keys = Vec::new();

        let prefix = pattern.map(KeyPattern::literal_prefix).unwrap_or_default();
        let iter = self
            .db
            .prefix_iter(&rtxn, prefix.as_str())
            .map_err(lmdb("scan"))?;
        for result in iter {
            let (raw, _) = result.map_err(lmdb("scan"))?;
            let Ok(key) = CacheKey::parse(raw) else {
                tracing::warn!(key = raw, "Skipping malformed key in durable tier");
                continue;
            };
            if pattern.map_or(true, |p| p.matches(&key)) {
                keys.push(key);
            }
        }
        Ok(keys)
    }

    fn try_clear(&self) -> Result<(), DurableTierError> {
        let mut wtxn = self.env.write_txn().map_err(lmdb("clear"))?;
        self.db.clear(&mut wtxn).map_err(lmdb("clear"))?;
        wtxn.commit().map_err(lmdb("clear"))
    }

    fn try_len(&self) -> Result<u64, DurableTierError> {
        let rtxn = self.env.read_txn().map_err(lmdb("len"))?;
        self.db.len(&rtxn).map_err(lmdb("len"))
    }
}

fn log_failure(op: &'static str, error: &DurableTierError) {
    tracing::warn!(tier = "l2", op, error = %error, "Durable tier operation failed");
}

#[async_trait]
impl CacheStorage for DurableTier {
    fn name(&self) -> &'static str {
        "l2"
    }

    async fn get(&self, key: &CacheKey) -> Option<StoredEntry> {
        self.try_get(key).unwrap_or_else(|e| {
            log_failure("get", &e);
            None
        })
    }

    async fn set(&self, key: &CacheKey, entry: StoredEntry) {
        if let Err(e) = self.try_put_many(&[(key.clone(), entry)]) {
            log_failure("set", &e);
        }
    }

    async fn delete(&self, key: &CacheKey) {
        if let Err(e) = self.try_delete_many(std::slice::from_ref(key)) {
            log_failure("delete", &e);
        }
    }

    async fn multi_get(&self, keys: &[CacheKey]) -> Vec<(CacheKey, Option<StoredEntry>)> {
        let rtxn = match self.env.read_txn().map_err(lmdb("get")) {
            Ok(txn) => txn,
            Err(e) => {
                log_failure("multi_get", &e);
                return keys.iter().map(|k| (k.clone(), None)).collect();
            }
        };
        keys.iter()
            .map(|key| {
                let entry = self
                    .db
                    .get(&rtxn, key.as_str())
                    .map_err(lmdb("get"))
                    .and_then(|bytes| bytes.map(|b| Self::decode(key, b)).transpose())
                    .unwrap_or_else(|e| {
                        log_failure("multi_get", &e);
                        None
                    });
                (key.clone(), entry)
            })
            .collect()
    }

    async fn multi_set(&self, entries: Vec<(CacheKey, StoredEntry)>) {
        if let Err(e) = self.try_put_many(&entries) {
            log_failure("multi_set", &e);
        }
    }

    async fn multi_delete(&self, keys: &[CacheKey]) {
        if let Err(e) = self.try_delete_many(keys) {
            log_failure("multi_delete", &e);
        }
    }

    async fn keys(&self, pattern: Option<&KeyPattern>) -> Vec<CacheKey> {
        self.try_keys(pattern).unwrap_or_else(|e| {
            log_failure("keys", &e);
            Vec::new()
        })
    }

    async fn clear(&self, pattern: Option<&KeyPattern>) {
        let result = match pattern {
            None => self.try_clear(),
            Some(p) => self
                .try_keys(Some(p))
                .and_then(|keys| self.try_delete_many(&keys)),
        };
        if let Err(e) = result {
            log_failure("clear", &e);
        }
    }

    async fn size(&self) -> usize {
        match self.try_len() {
            Ok(n) => usize::try_from(n).unwrap_or(usize::MAX),
            Err(e) => {
                log_failure("size", &e);
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use strata_core::Entry;
    use tempfile::TempDir;

    fn key(s: &str) -> CacheKey {
        CacheKey::parse(s).unwrap()
    }

    fn entry(v: serde_json::Value) -> StoredEntry {
        Entry::new(v, Duration::from_secs(60))
    }

    fn open() -> (TempDir, DurableTier) {
        let dir = TempDir::new().unwrap();
        let tier = DurableTier::open(dir.path(), 10).unwrap();
        (dir, tier)
    }

    #[tokio::test]
    async fn test_round_trip() {
        let (_dir, tier) = open();
        let stored = entry(json!({"likes": 3}));
        tier.set(&key("post:1:likes"), stored.clone()).await;
        assert_eq!(tier.get(&key("post:1:likes")).await, Some(stored));
        assert_eq!(tier.get(&key("post:2:likes")).await, None);
        assert_eq!(tier.size().await, 1);
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let tier = DurableTier::open(dir.path(), 10).unwrap();
            tier.set(&key("species:7"), entry(json!("trout"))).await;
        }
        let tier = DurableTier::open(dir.path(), 10).unwrap();
        let got = tier.get(&key("species:7")).await.unwrap();
        assert_eq!(got.data, json!("trout"));
    }

    #[tokio::test]
    async fn test_pattern_keys_use_segment_match() {
        let (_dir, tier) = open();
        for k in ["user:1:a", "user:1:b", "user:2:a", "user:10:a", "post:1"] {
            tier.set(&key(k), entry(json!(k))).await;
        }

        let p = KeyPattern::parse("user:1:*").unwrap();
        assert_eq!(
            tier.keys(Some(&p)).await,
            vec![key("user:1:a"), key("user:1:b")]
        );

        let p = KeyPattern::parse("user:*:a").unwrap();
        assert_eq!(
            tier.keys(Some(&p)).await,
            vec![key("user:10:a"), key("user:1:a"), key("user:2:a")]
        );

        assert_eq!(tier.keys(None).await.len(), 5);
    }

    #[tokio::test]
    async fn test_multi_ops_and_clear() {
        let (_dir, tier) = open();
        tier.multi_set(vec![
            (key("a:1"), entry(json!(1))),
            (key("a:2"), entry(json!(2))),
            (key("b:1"), entry(json!(3))),
        ])
        .await;

        let got = tier.multi_get(&[key("a:1"), key("zz")]).await;
        assert_eq!(got[0].1.as_ref().map(|e| e.data.clone()), Some(json!(1)));
        assert!(got[1].1.is_none());

        tier.clear(Some(&KeyPattern::parse("a*").unwrap())).await;
        assert_eq!(tier.keys(None).await, vec![key("b:1")]);

        tier.clear(None).await;
        assert_eq!(tier.size().await, 0);
    }

    #[test]
    fn test_open_on_a_file_reports_the_path() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("not-a-dir");
        std::fs::write(&file, b"x").unwrap();

        let err = DurableTier::open(&file, 10).unwrap_err();
        match &err {
            DurableTierError::Open { path, .. } => assert_eq!(path, &file),
            other => panic!("expected Open, got {other:?}"),
        }
        assert!(matches!(
            StorageError::from(err),
            StorageError::Io { tier: "l2", .. }
        ));
    }

    #[tokio::test]
    async fn test_undecodable_entry_is_a_tagged_miss() {
        let (_dir, tier) = open();
        let k = key("post:9:likes");
        {
            let mut wtxn = tier.env.write_txn().unwrap();
            tier.db.put(&mut wtxn, k.as_str(), b"not json").unwrap();
            wtxn.commit().unwrap();
        }

        let err = tier.try_get(&k).unwrap_err();
        assert!(matches!(&err, DurableTierError::Decode { key, .. } if key == "post:9:likes"));
        assert!(matches!(
            StorageError::from(err),
            StorageError::Decode { key, .. } if key == "post:9:likes"
        ));

        assert_eq!(tier.get(&k).await, None);
        assert!(tier.multi_get(std::slice::from_ref(&k)).await[0].1.is_none());
    }

    #[tokio::test]
    async fn test_delete_missing_key_is_noop() {
        let (_dir, tier) = open();
        tier.delete(&key("nothing:here")).await;
        tier.multi_delete(&[key("x"), key("y")]).await;
        assert_eq!(tier.size().await, 0);
    }
}
