//! Cache provider backed by a shared Redis instance.
//!
//! ## Connection
//!
//! The pool is created lazily on first use and memoized. Concurrent callers
//! that arrive while the first connect is in flight wait on that same attempt
//! instead of starting their own. A failed attempt leaves the cell empty so
//! the next call tries again.
//!
//! ## Bounded calls
//!
//! Every round trip is wrapped in the configured timeout; a timeout surfaces
//! as [`CacheError::Timeout`].
//!
//! ## Bulk deletion
//!
//! Pattern invalidation walks the keyspace with `SCAN ... MATCH` (never
//! `KEYS`) and deletes in batches of at most [`DELETE_BATCH_SIZE`] keys.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::redis::{AsyncCommands, cmd};
use deadpool_redis::{Connection, Pool, Runtime};
use tokio::sync::OnceCell;

use crate::error::{CacheError, CacheResult};
use crate::provider::CacheProvider;

/// Maximum number of keys per `DEL` round trip during pattern invalidation.
pub const DELETE_BATCH_SIZE: usize = 500;

/// Redis provider settings.
#[derive(Debug, Clone)]
pub struct RedisProviderConfig {
    /// Redis connection URL (e.g., "redis://localhost:6379")
    pub url: String,
    /// Connection pool size
    pub pool_size: usize,
    /// Timeout applied to every pool wait and command
    pub timeout: Duration,
}

impl RedisProviderConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            pool_size: 10,
            timeout: Duration::from_millis(5000),
        }
    }
}

/// Shared cache on Redis.
pub struct RedisProvider {
    config: RedisProviderConfig,
    pool: OnceCell<Pool>,
}

impl RedisProvider {
    /// Create a provider. No connection is made until the first operation.
    pub fn new(config: RedisProviderConfig) -> Self {
        Self {
            config,
            pool: OnceCell::new(),
        }
    }

    /// Create a provider around an existing pool.
    pub fn with_pool(config: RedisProviderConfig, pool: Pool) -> Self {
        Self {
            config,
            pool: OnceCell::new_with(Some(pool)),
        }
    }

    /// Whether the lazy connect has already succeeded.
    pub fn is_connected(&self) -> bool {
        self.pool.initialized()
    }

    /// Check that Redis answers (for health checks).
    pub async fn ping(&self) -> CacheResult<()> {
        let mut conn = self.connection().await?;
        self.bounded("PING", async {
            let _: String = cmd("PING")
                .query_async(&mut conn)
                .await
                .map_err(|e| CacheError::Command(e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn pool(&self) -> CacheResult<&Pool> {
        self.pool
            .get_or_try_init(|| async {
                tracing::info!(url = %self.config.url, "Connecting to Redis");

                let mut redis_config = deadpool_redis::Config::from_url(&self.config.url);
                if let Some(ref mut pool_config) = redis_config.pool {
                    pool_config.max_size = self.config.pool_size;
                    pool_config.timeouts.wait = Some(self.config.timeout);
                    pool_config.timeouts.create = Some(self.config.timeout);
                    pool_config.timeouts.recycle = Some(self.config.timeout);
                }
                let pool = redis_config
                    .create_pool(Some(Runtime::Tokio1))
                    .map_err(|e| CacheError::Connection(e.to_string()))?;

                // Prove the pool can hand out a live connection before memoizing it
                let conn = tokio::time::timeout(self.config.timeout, pool.get())
                    .await
                    .map_err(|_| CacheError::Timeout {
                        op: "CONNECT",
                        after: self.config.timeout,
                    })?
                    .map_err(|e| CacheError::Connection(e.to_string()))?;
                drop(conn);

                tracing::info!("Connected to Redis");
                Ok(pool)
            })
            .await
    }

    async fn connection(&self) -> CacheResult<Connection> {
        let pool = self.pool().await?;
        self.bounded("POOL_GET", async {
            pool.get()
                .await
                .map_err(|e| CacheError::Connection(e.to_string()))
        })
        .await
    }

    async fn bounded<T, F>(&self, op: &'static str, fut: F) -> CacheResult<T>
    where
        F: Future<Output = CacheResult<T>>,
    {
        match tokio::time::timeout(self.config.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::Timeout {
                op,
                after: self.config.timeout,
            }),
        }
    }

    async fn delete_batch(&self, conn: &mut Connection, batch: &[String]) -> CacheResult<u64> {
        if batch.is_empty() {
            return Ok(0);
        }
        self.bounded("DEL", async {
            conn.del::<_, u64>(batch)
                .await
                .map_err(|e| CacheError::Command(e.to_string()))
        })
        .await
    }
}

#[async_trait]
impl CacheProvider for RedisProvider {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> CacheResult<Option<Arc<Vec<u8>>>> {
        let mut conn = self.connection().await?;
        let value = self
            .bounded("GET", async {
                conn.get::<_, Option<Vec<u8>>>(key)
                    .await
                    .map_err(|e| CacheError::Command(e.to_string()))
            })
            .await?;
        Ok(value.map(Arc::new))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> CacheResult<()> {
        let mut conn = self.connection().await?;
        self.bounded("SET", async {
            let result = match ttl {
                Some(ttl) => {
                    // Redis EX is whole seconds; never round a short TTL down to "no expiry"
                    let secs = ttl.as_secs().max(1);
                    conn.set_ex::<_, _, ()>(key, value, secs).await
                }
                None => conn.set::<_, _, ()>(key, value).await,
            };
            result.map_err(|e| CacheError::Command(e.to_string()))
        })
        .await?;
        tracing::debug!(key = %key, "cache set (redis)");
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        let mut conn = self.connection().await?;
        self.bounded("DEL", async {
            conn.del::<_, ()>(key)
                .await
                .map_err(|e| CacheError::Command(e.to_string()))
        })
        .await
    }

    async fn invalidate_by_pattern(&self, pattern: &str) -> CacheResult<u64> {
        let mut conn = self.connection().await?;
        let mut cursor: u64 = 0;
        let mut batch: Vec<String> = Vec::with_capacity(DELETE_BATCH_SIZE);
        let mut removed = 0u64;

        loop {
            let (next, keys): (u64, Vec<String>) = self
                .bounded("SCAN", async {
                    cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(pattern)
                        .arg("COUNT")
                        .arg(DELETE_BATCH_SIZE)
                        .query_async(&mut conn)
                        .await
                        .map_err(|e| CacheError::Command(e.to_string()))
                })
                .await?;

            for key in keys {
                batch.push(key);
                if batch.len() >= DELETE_BATCH_SIZE {
                    removed += self.delete_batch(&mut conn, &batch).await?;
                    batch.clear();
                }
            }

            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        removed += self.delete_batch(&mut conn, &batch).await?;
        tracing::debug!(pattern = %pattern, removed, "pattern invalidation (redis)");
        Ok(removed)
    }

    async fn clear(&self) -> CacheResult<()> {
        let mut conn = self.connection().await?;
        self.bounded("FLUSHDB", async {
            let _: () = cmd("FLUSHDB")
                .query_async(&mut conn)
                .await
                .map_err(|e| CacheError::Command(e.to_string()))?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = RedisProviderConfig::new("redis://localhost:6379");
        assert_eq!(config.pool_size, 10);
        assert_eq!(config.timeout, Duration::from_millis(5000));
    }

    #[tokio::test]
    async fn test_lazy_connect_does_not_connect_on_construction() {
        let provider = RedisProvider::new(RedisProviderConfig::new("redis://127.0.0.1:1"));
        assert!(!provider.is_connected());
        assert_eq!(provider.name(), "redis");
    }

    #[tokio::test]
    async fn test_unreachable_redis_reports_error_and_stays_unconnected() {
        let mut config = RedisProviderConfig::new("redis://127.0.0.1:1");
        config.timeout = Duration::from_millis(200);
        let provider = RedisProvider::new(config);

        assert!(provider.get("k").await.is_err());
        // A failed connect is not memoized
        assert!(!provider.is_connected());
    }
}
