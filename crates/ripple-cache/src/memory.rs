//! In-process cache provider backed by a `DashMap`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::CacheResult;
use crate::pattern::KeyPattern;
use crate::provider::CacheProvider;

/// A cached value with optional TTL.
///
/// The data is wrapped in `Arc` so a hit hands out a cheap clone.
#[derive(Clone, Debug)]
pub struct CachedEntry {
    pub data: Arc<Vec<u8>>,
    pub cached_at: Instant,
    pub ttl: Option<Duration>,
}

impl CachedEntry {
    /// Create a new cached entry.
    pub fn new(data: Vec<u8>, ttl: Option<Duration>) -> Self {
        Self {
            data: Arc::new(data),
            cached_at: Instant::now(),
            ttl,
        }
    }

    /// Check if this entry has expired.
    pub fn is_expired(&self) -> bool {
        self.ttl
            .map(|ttl| self.cached_at.elapsed() > ttl)
            .unwrap_or(false)
    }
}

/// Single-instance cache: a concurrent map with manual TTL bookkeeping.
///
/// Expiry is detected lazily on read. Pattern invalidation is a linear scan
/// over the keys, which is fine at in-process scale.
#[derive(Clone, Default)]
pub struct MemoryProvider {
    entries: Arc<DashMap<String, CachedEntry>>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries, including ones not yet found expired.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired());
        before.saturating_sub(self.entries.len())
    }
}

#[async_trait]
impl CacheProvider for MemoryProvider {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> CacheResult<Option<Arc<Vec<u8>>>> {
        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired() {
                return Ok(Some(Arc::clone(&entry.data)));
            }
            // Remove expired entry
            drop(entry);
            self.entries.remove_if(key, |_, entry| entry.is_expired());
            tracing::debug!(key = %key, "expired cache entry removed");
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> CacheResult<()> {
        self.entries
            .insert(key.to_string(), CachedEntry::new(value, ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn invalidate_by_pattern(&self, pattern: &str) -> CacheResult<u64> {
        let pattern = KeyPattern::new(pattern)?;
        let before = self.entries.len();
        self.entries.retain(|key, _| !pattern.matches(key));
        let removed = before.saturating_sub(self.entries.len()) as u64;
        tracing::debug!(removed, "pattern invalidation (memory)");
        Ok(removed)
    }

    async fn clear(&self) -> CacheResult<()> {
        self.entries.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_set_delete() {
        let cache = MemoryProvider::new();
        cache.set("k", b"v".to_vec(), None).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some(Arc::new(b"v".to_vec())));

        cache.delete("k").await.unwrap();
        assert!(cache.get("k").await.unwrap().is_none());

        // Deleting twice is fine
        cache.delete("k").await.unwrap();
    }

    #[tokio::test]
    async fn test_expiration_is_lazy() {
        let cache = MemoryProvider::new();
        cache
            .set("short", b"v".to_vec(), Some(Duration::from_millis(50)))
            .await
            .unwrap();
        assert!(cache.get("short").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(80)).await;

        // Still physically present until read
        assert_eq!(cache.len(), 1);
        assert!(cache.get("short").await.unwrap().is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let cache = MemoryProvider::new();
        cache
            .set("a", b"1".to_vec(), Some(Duration::from_millis(10)))
            .await
            .unwrap();
        cache.set("b", b"2".to_vec(), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_invalidate_by_pattern() {
        let cache = MemoryProvider::new();
        cache.set("posts.getAll:{\"o\":1}", vec![1], None).await.unwrap();
        cache.set("posts.getAll:{\"o\":2}", vec![2], None).await.unwrap();
        cache.set("users.getAll:{}", vec![3], None).await.unwrap();

        let removed = cache.invalidate_by_pattern("posts.getAll:*").await.unwrap();
        assert_eq!(removed, 2);
        assert!(cache.get("users.getAll:{}").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_clear() {
        let cache = MemoryProvider::new();
        cache.set("a", vec![1], None).await.unwrap();
        cache.set("b", vec![2], None).await.unwrap();
        cache.clear().await.unwrap();
        assert!(cache.is_empty());
    }
}
