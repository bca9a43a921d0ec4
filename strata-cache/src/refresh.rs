//! Refresh loaders.
//!
//! A loader knows how to rebuild the value for a key from its source of
//! truth. The manager keeps loaders registered by key pattern and uses them
//! for rule-driven refreshes; keys without a loader simply expire.

use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::Serialize;
use serde_json::Value;
use strata_core::{CacheKey, CacheResult, KeyPattern, StorageError};

/// Type-erased loader producing the JSON form of a key's value.
pub type RefreshLoader = Arc<dyn Fn(CacheKey) -> BoxFuture<'static, CacheResult<Value>> + Send + Sync>;

/// Wrap a typed async loader into a [`RefreshLoader`].
pub fn refresh_loader<T, F, Fut>(load: F) -> RefreshLoader
where
    T: Serialize + Send + 'static,
    F: Fn(CacheKey) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CacheResult<T>> + Send + 'static,
{
    Arc::new(move |key: CacheKey| -> BoxFuture<'static, CacheResult<Value>> {
        let label = key.to_string();
        let pending = load(key);
        async move {
            let data = pending.await?;
            serde_json::to_value(data).map_err(|e| {
                StorageError::Encode {
                    key: label,
                    reason: e.to_string(),
                }
                .into()
            })
        }
        .boxed()
    })
}

/// Loaders keyed by pattern; the first registered match wins.
#[derive(Default, Clone)]
pub(crate) struct LoaderRegistry {
    loaders: Vec<(KeyPattern, RefreshLoader)>,
}

impl LoaderRegistry {
    /// Register `loader` for `pattern`, replacing a loader for the same pattern.
    pub(crate) fn register(&mut self, pattern: KeyPattern, loader: RefreshLoader) {
        match self.loaders.iter_mut().find(|(p, _)| *p == pattern) {
            Some(slot) => slot.1 = loader,
            None => self.loaders.push((pattern, loader)),
        }
    }

    pub(crate) fn unregister(&mut self, pattern: &KeyPattern) -> bool {
        let before = self.loaders.len();
        self.loaders.retain(|(p, _)| p != pattern);
        before != self.loaders.len()
    }

    pub(crate) fn find(&self, key: &CacheKey) -> Option<RefreshLoader> {
        self.loaders
            .iter()
            .find(|(p, _)| p.matches(key))
            .map(|(_, loader)| Arc::clone(loader))
    }

    pub(crate) fn len(&self) -> usize {
        self.loaders.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::{CacheError, SourceError};
    use strata_test_utils::fixtures::{key, pattern};

    #[tokio::test]
    async fn test_loader_serializes_typed_value() {
        let loader = refresh_loader(|key: CacheKey| async move {
            Ok::<_, CacheError>(vec![key.to_string(), "x".to_string()])
        });
        let value = loader(key("weather:today")).await.unwrap();
        assert_eq!(value, serde_json::json!(["weather:today", "x"]));
    }

    #[tokio::test]
    async fn test_loader_error_passes_through() {
        let loader = refresh_loader(|key: CacheKey| async move {
            Err::<u32, _>(CacheError::from(SourceError::LoaderFailed {
                key: key.to_string(),
                reason: "offline".to_string(),
            }))
        });
        let err = loader(key("weather:today")).await.unwrap_err();
        assert!(matches!(err, CacheError::Source(SourceError::LoaderFailed { .. })));
    }

    #[test]
    fn test_registry_first_match_wins_and_replace() {
        let a = refresh_loader(|_: CacheKey| async { Ok::<_, CacheError>(1u32) });
        let b = refresh_loader(|_: CacheKey| async { Ok::<_, CacheError>(2u32) });
        let c = refresh_loader(|_: CacheKey| async { Ok::<_, CacheError>(3u32) });

        let mut registry = LoaderRegistry::default();
        registry.register(pattern("user:*:stats"), Arc::clone(&a));
        registry.register(pattern("user*"), Arc::clone(&b));
        assert!(Arc::ptr_eq(&registry.find(&key("user:1:stats")).unwrap(), &a));
        assert!(Arc::ptr_eq(&registry.find(&key("user:1:follows")).unwrap(), &b));
        assert!(registry.find(&key("post:1")).is_none());

        registry.register(pattern("user:*:stats"), Arc::clone(&c));
        assert_eq!(registry.len(), 2);
        assert!(Arc::ptr_eq(&registry.find(&key("user:1:stats")).unwrap(), &c));

        assert!(registry.unregister(&pattern("user*")));
        assert!(registry.find(&key("user:1:follows")).is_none());
    }
}
