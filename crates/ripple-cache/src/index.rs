//! Reverse index from data source to the cache keys that read from it.
//!
//! Lives in the same keyspace as the cached results, one entry per source:
//!
//! `{namespace}:function-dependency:{source}` → JSON array of cache keys
//!
//! The index is append-only. Updates are idempotent set-additions done as
//! read-modify-write without locking; two concurrent additions can race and
//! one key may be missing until the next write of that key re-adds it.
//! Keys are never removed: an entry expires as a whole once no key has been
//! registered under it for the longest result TTL seen so far, so it always
//! outlives every result it lists.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::future::join_all;

use crate::error::CacheResult;
use crate::provider::CacheProvider;

/// Default namespace for index entries.
pub const DEFAULT_NAMESPACE: &str = "ripple";

/// Dependency index stored in a cache provider.
#[derive(Clone)]
pub struct DependencyIndex {
    provider: Arc<dyn CacheProvider>,
    namespace: String,
    /// Largest result TTL registered so far, in seconds; shared by clones
    entry_ttl_secs: Arc<AtomicU64>,
}

impl DependencyIndex {
    pub fn new(provider: Arc<dyn CacheProvider>) -> Self {
        Self::with_namespace(provider, DEFAULT_NAMESPACE)
    }

    pub fn with_namespace(provider: Arc<dyn CacheProvider>, namespace: impl Into<String>) -> Self {
        Self {
            provider,
            namespace: namespace.into(),
            entry_ttl_secs: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Raise the entry TTL floor, e.g. to the longest TTL of the registered
    /// functions before any of them has cached a result.
    pub fn with_min_entry_ttl(self, ttl: Duration) -> Self {
        self.entry_ttl_secs.fetch_max(ttl.as_secs(), Ordering::Relaxed);
        self
    }

    /// TTL applied to index entries on their next write.
    pub fn entry_ttl(&self) -> Duration {
        Duration::from_secs(self.entry_ttl_secs.load(Ordering::Relaxed))
    }

    /// Storage key for a source's index entry.
    #[inline]
    pub fn index_key(&self, source: &str) -> String {
        format!("{}:function-dependency:{}", self.namespace, source)
    }

    /// All cache keys recorded for a source. Keys whose results were
    /// already evicted or expired may still be listed.
    pub async fn lookup(&self, source: &str) -> CacheResult<Vec<String>> {
        let key = self.index_key(source);
        match self.provider.get(&key).await? {
            Some(raw) => Ok(serde_json::from_slice(&raw)?),
            None => Ok(Vec::new()),
        }
    }

    /// Record that `cache_key`, cached for `ttl`, reads from each of
    /// `sources`. Every touched entry has its TTL refreshed.
    pub async fn register<'a, I>(&self, sources: I, cache_key: &str, ttl: Duration) -> CacheResult<()>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let secs = self
            .entry_ttl_secs
            .fetch_max(ttl.as_secs(), Ordering::Relaxed)
            .max(ttl.as_secs());
        let entry_ttl = Duration::from_secs(secs);

        let results = join_all(
            sources
                .into_iter()
                .map(|source| self.add(source, cache_key, entry_ttl)),
        )
        .await;
        results.into_iter().collect()
    }

    async fn add(&self, source: &str, cache_key: &str, entry_ttl: Duration) -> CacheResult<()> {
        let mut keys = self.lookup(source).await?;
        if !keys.iter().any(|k| k == cache_key) {
            keys.push(cache_key.to_string());
        }
        let payload = serde_json::to_vec(&keys)?;
        let ttl = (!entry_ttl.is_zero()).then_some(entry_ttl);
        self.provider.set(&self.index_key(source), payload, ttl).await
    }
}
