//! Typed, failure-tolerant cache for function results.
//!
//! Caching is an optimization, never a correctness dependency:
//! - a provider error on read is logged and reported as a miss
//! - a provider error on write is logged and swallowed
//! - an entry that no longer decodes is evicted and reported as a miss

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::entry::CacheEntry;
use crate::error::CacheError;
use crate::index::DependencyIndex;
use crate::provider::CacheProvider;

fn record_cache_error(op: &'static str, error: &CacheError) {
    tracing::warn!(op, error = %error, "cache provider error (degrading)");
    counter!("cache_errors_total", "op" => op).increment(1);
}

/// Result cache plus its dependency index, over one provider.
#[derive(Clone)]
pub struct ResultCache {
    provider: Arc<dyn CacheProvider>,
    index: DependencyIndex,
}

impl ResultCache {
    pub fn new(provider: Arc<dyn CacheProvider>) -> Self {
        let index = DependencyIndex::new(provider.clone());
        Self { provider, index }
    }

    pub fn with_index(provider: Arc<dyn CacheProvider>, index: DependencyIndex) -> Self {
        Self { provider, index }
    }

    pub fn provider(&self) -> &Arc<dyn CacheProvider> {
        &self.provider
    }

    pub fn index(&self) -> &DependencyIndex {
        &self.index
    }

    /// Read an entry. Any failure is a miss.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<CacheEntry<T>> {
        let raw = match self.provider.get(key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                record_cache_error("get", &e);
                return None;
            }
        };

        match CacheEntry::decode(&raw) {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Failed to decode cached entry, evicting");
                self.evict(key).await;
                None
            }
        }
    }

    /// Write an entry and record it in the dependency index for every
    /// dependency. Returns whether both steps succeeded.
    pub async fn store<T: Serialize>(
        &self,
        key: &str,
        data: &T,
        ttl_seconds: u64,
        dependencies: &BTreeSet<String>,
    ) -> bool {
        let entry = CacheEntry::new(data, ttl_seconds, dependencies.iter().cloned());
        let bytes = match entry.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                record_cache_error("encode", &e);
                return false;
            }
        };

        let ttl = Duration::from_secs(ttl_seconds);
        if let Err(e) = self.provider.set(key, bytes, Some(ttl)).await {
            record_cache_error("set", &e);
            return false;
        }

        if let Err(e) = self.index.register(dependencies, key, ttl).await {
            record_cache_error("index", &e);
            return false;
        }

        tracing::debug!(key = %key, ttl_seconds, "cached result");
        true
    }

    /// Evict a key. Returns whether the provider confirmed the delete.
    pub async fn evict(&self, key: &str) -> bool {
        match self.provider.delete(key).await {
            Ok(()) => true,
            Err(e) => {
                record_cache_error("delete", &e);
                false
            }
        }
    }

    /// Bulk eviction by glob pattern.
    pub async fn evict_pattern(&self, pattern: &str) -> u64 {
        match self.provider.invalidate_by_pattern(pattern).await {
            Ok(removed) => removed,
            Err(e) => {
                record_cache_error("invalidate_pattern", &e);
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CacheResult;
    use crate::memory::MemoryProvider;
    use async_trait::async_trait;

    /// Provider that fails every call.
    struct BrokenProvider;

    #[async_trait]
    impl CacheProvider for BrokenProvider {
        fn name(&self) -> &'static str {
            "broken"
        }
        async fn get(&self, _key: &str) -> CacheResult<Option<Arc<Vec<u8>>>> {
            Err(CacheError::Connection("down".into()))
        }
        async fn set(&self, _key: &str, _value: Vec<u8>, _ttl: Option<Duration>) -> CacheResult<()> {
            Err(CacheError::Connection("down".into()))
        }
        async fn delete(&self, _key: &str) -> CacheResult<()> {
            Err(CacheError::Connection("down".into()))
        }
        async fn invalidate_by_pattern(&self, _pattern: &str) -> CacheResult<u64> {
            Err(CacheError::Connection("down".into()))
        }
        async fn clear(&self) -> CacheResult<()> {
            Err(CacheError::Connection("down".into()))
        }
    }

    fn deps(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_store_then_get() {
        let cache = ResultCache::new(Arc::new(MemoryProvider::new()));
        assert!(
            cache
                .store("users.getAll:{}", &vec!["ada"], 60, &deps(&["users"]))
                .await
        );

        let entry: CacheEntry<Vec<String>> = cache.get("users.getAll:{}").await.unwrap();
        assert_eq!(entry.data, vec!["ada".to_string()]);
        assert!(entry.depends_on("users"));
        assert_eq!(
            cache.index().lookup("users").await.unwrap(),
            vec!["users.getAll:{}"]
        );
    }

    #[tokio::test]
    async fn test_broken_provider_degrades_to_miss() {
        let cache = ResultCache::new(Arc::new(BrokenProvider));
        assert!(cache.get::<String>("k").await.is_none());
        assert!(!cache.store("k", &"v", 60, &deps(&["users"])).await);
        assert!(!cache.evict("k").await);
        assert_eq!(cache.evict_pattern("k*").await, 0);
    }

    #[tokio::test]
    async fn test_undecodable_entry_is_evicted() {
        let provider = Arc::new(MemoryProvider::new());
        provider.set("k", b"garbage".to_vec(), None).await.unwrap();
        let cache = ResultCache::new(provider.clone());

        assert!(cache.get::<Vec<u32>>("k").await.is_none());
        assert!(provider.get("k").await.unwrap().is_none());
    }
}
