//! Pluggable key/value cache contract.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::CacheResult;

/// Key/value store with TTL and pattern-based bulk deletion.
///
/// Values are opaque bytes; typed access goes through [`crate::ResultCache`].
/// Single-key operations are atomic as far as the backing store makes them
/// so. Bulk deletion is not atomic.
#[async_trait]
pub trait CacheProvider: Send + Sync {
    /// Short provider name for logs and stats ("memory", "redis").
    fn name(&self) -> &'static str;

    /// Get a value. Expired entries are reported as absent.
    async fn get(&self, key: &str) -> CacheResult<Option<Arc<Vec<u8>>>>;

    /// Set a value, optionally expiring after `ttl`.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> CacheResult<()>;

    /// Delete a single key. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> CacheResult<()>;

    /// Delete every key matching a glob pattern (`*` and `?`).
    ///
    /// Returns the number of keys deleted.
    async fn invalidate_by_pattern(&self, pattern: &str) -> CacheResult<u64>;

    /// Remove everything.
    async fn clear(&self) -> CacheResult<()>;
}
