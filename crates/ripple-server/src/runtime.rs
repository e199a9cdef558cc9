//! Wiring of registry, cache, invalidation and delivery into one handle.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use ripple_cache::{
    CacheProvider, DependencyIndex, MemoryProvider, RedisProvider, RedisProviderConfig,
    ResultCache,
};
use ripple_core::{Change, ChangeOperation, DataStore, InvalidationEvent, Result};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::analyzer::{analyze_sql, analyze_write, infer_mutation_changes};
use crate::config::{AppConfig, CacheConfig, ServerCacheProvider};
use crate::delivery::{DeliveryConfig, DeliveryManager};
use crate::functions::{FunctionCache, FunctionKind, FunctionRegistry};
use crate::invalidation::InvalidationEngine;
use crate::relay::{RedisEventRelay, create_pool};

/// Cache provider selected by `cache.server.provider`.
pub fn build_cache_provider(config: &CacheConfig) -> Arc<dyn CacheProvider> {
    match config.server.provider {
        ServerCacheProvider::Memory => Arc::new(MemoryProvider::new()),
        ServerCacheProvider::Redis => {
            let redis = &config.server.redis;
            Arc::new(RedisProvider::new(RedisProviderConfig {
                url: redis.url.clone(),
                pool_size: redis.pool_size,
                timeout: redis.timeout(),
            }))
        }
    }
}

/// Everything a request needs to call functions and report writes.
pub struct ReactiveRuntime<S: DataStore> {
    config: Arc<AppConfig>,
    store: Arc<S>,
    registry: Arc<FunctionRegistry<S>>,
    cache: FunctionCache,
    engine: InvalidationEngine<S>,
    delivery: Option<DeliveryManager>,
    relay: Option<Arc<RedisEventRelay>>,
}

impl<S: DataStore> ReactiveRuntime<S> {
    pub fn new(config: AppConfig, store: S, registry: FunctionRegistry<S>) -> anyhow::Result<Self> {
        let provider = build_cache_provider(&config.cache);
        Self::with_provider(config, store, registry, provider)
    }

    pub fn with_provider(
        config: AppConfig,
        store: S,
        registry: FunctionRegistry<S>,
        provider: Arc<dyn CacheProvider>,
    ) -> anyhow::Result<Self> {
        let longest_ttl = registry
            .metadata()
            .iter()
            .filter_map(|meta| meta.cache_ttl_secs)
            .fold(config.cache.default_ttl_secs, u64::max);
        let index = DependencyIndex::with_namespace(provider.clone(), config.cache.namespace.clone())
            .with_min_entry_ttl(Duration::from_secs(longest_ttl));
        let cache = FunctionCache::new(ResultCache::with_index(provider, index))
            .with_default_ttl(config.cache.default_ttl_secs);
        let registry = Arc::new(registry);

        let realtime = &config.realtime;
        let delivery = realtime
            .enabled
            .then(|| DeliveryManager::new(DeliveryConfig::from(realtime)));

        let relay = match &delivery {
            Some(delivery) if realtime.relay.enabled => {
                let redis = &config.cache.server.redis;
                let pool = create_pool(redis).context("failed to create relay Redis pool")?;
                Some(Arc::new(RedisEventRelay::new(
                    pool,
                    redis,
                    realtime.relay.channel.clone(),
                    delivery.clone(),
                )))
            }
            _ => None,
        };

        let mut engine = InvalidationEngine::new(registry.clone(), cache.clone())
            .with_relations(config.relations.clone())
            .with_acknowledgments(realtime.enabled && realtime.reliability.acknowledgments);
        if let Some(delivery) = &delivery {
            engine = engine.with_delivery(delivery.clone());
        }
        if let Some(relay) = &relay {
            engine = engine.with_relay(relay.clone());
        }

        tracing::info!(
            functions = registry.len(),
            cache_provider = cache.results.provider().name(),
            realtime = realtime.enabled,
            relay = relay.is_some(),
            "Reactive runtime ready"
        );

        Ok(Self {
            config: Arc::new(config),
            store: Arc::new(store),
            registry,
            cache,
            engine,
            delivery,
            relay,
        })
    }

    /// Execute a function by name. After a successful mutation, the sources
    /// it writes are invalidated before the output is returned.
    pub async fn call(&self, name: &str, input: Value) -> Result<Value> {
        let function = self.registry.get(name)?;
        let output = function
            .execute_json(input.clone(), self.store.as_ref(), &self.cache)
            .await?;

        if let FunctionKind::Mutation(operation) = function.kind() {
            let changes =
                infer_mutation_changes(function.dependencies(), operation, &input, &output);
            for change in &changes {
                self.engine.process(change).await;
            }
        }
        Ok(output)
    }

    /// Report a write made outside of any mutation function.
    pub async fn notify_write<I, K>(
        &self,
        source: &str,
        operation: ChangeOperation,
        keys: I,
        organization_id: Option<&str>,
    ) -> InvalidationEvent
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        let change = analyze_write(source, operation, keys, organization_id);
        self.engine.process(&change).await
    }

    /// Report a raw SQL statement. Reads and statements that cannot be
    /// analyzed produce no event.
    pub async fn notify_sql(&self, statement: &str) -> Option<InvalidationEvent> {
        let change = analyze_sql(statement)?.to_change()?;
        Some(self.engine.process(&change).await)
    }

    pub async fn process_change(&self, change: &Change) -> InvalidationEvent {
        self.engine.process(change).await
    }

    /// Start the retry sweeper and the relay subscriber, if enabled.
    pub fn spawn_background(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        if let Some(delivery) = &self.delivery {
            handles.push(delivery.spawn_retry_sweeper(shutdown.clone()));
        }
        if let Some(relay) = &self.relay {
            handles.push(tokio::spawn(relay.clone().run(shutdown)));
        }
        handles
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn registry(&self) -> &FunctionRegistry<S> {
        &self.registry
    }

    pub fn cache(&self) -> &FunctionCache {
        &self.cache
    }

    pub fn engine(&self) -> &InvalidationEngine<S> {
        &self.engine
    }

    pub fn delivery(&self) -> Option<&DeliveryManager> {
        self.delivery.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demo::register_demo_functions;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn runtime(config: AppConfig) -> ReactiveRuntime<MemoryStore> {
        let registry = FunctionRegistry::new();
        register_demo_functions(&registry).unwrap();
        ReactiveRuntime::new(config, MemoryStore::new(), registry).unwrap()
    }

    #[test]
    fn test_provider_selection() {
        let mut cache = CacheConfig::default();
        assert_eq!(build_cache_provider(&cache).name(), "memory");
        cache.server.provider = ServerCacheProvider::Redis;
        cache.server.redis.url = "redis://127.0.0.1:6379".into();
        assert_eq!(build_cache_provider(&cache).name(), "redis");
    }

    #[tokio::test]
    async fn test_realtime_disabled_has_no_delivery() {
        let mut config = AppConfig::default();
        config.realtime.enabled = false;
        let rt = runtime(config);
        assert!(rt.delivery().is_none());

        let event = rt
            .notify_write("users", ChangeOperation::Delete, ["u1"], Some("org1"))
            .await;
        assert!(!event.requires_ack);
    }

    #[tokio::test]
    async fn test_notify_sql() {
        let rt = runtime(AppConfig::default());
        let event = rt
            .notify_sql("UPDATE posts SET title = 'x' WHERE id = 'p1' AND organization_id = 'org1'")
            .await
            .unwrap();
        assert_eq!(event.source_name, "posts");
        assert_eq!(event.organization_id, "org1");
        assert_eq!(event.affected_keys, vec!["p1".to_string()]);

        assert!(rt.notify_sql("SELECT * FROM posts").await.is_none());
        assert!(rt.notify_sql("VACUUM").await.is_none());
    }

    #[tokio::test]
    async fn test_mutation_call_invalidates_dependents() {
        let rt = runtime(AppConfig::default());
        let user = rt
            .call("users.create", json!({"name": "Ada", "email": "ada@example.com", "organizationId": "org1"}))
            .await
            .unwrap();
        let posts_input = json!({"organizationId": "org1"});
        rt.call("posts.getAll", posts_input.clone()).await.unwrap();
        let key = rt
            .registry()
            .get("posts.getAll")
            .unwrap()
            .cache_key_for(&posts_input)
            .unwrap();
        assert!(rt.cache().results.get::<Value>(&key).await.is_some());

        rt.call(
            "posts.create",
            json!({"title": "Hello", "authorId": user["id"], "organizationId": "org1"}),
        )
        .await
        .unwrap();
        assert!(rt.cache().results.get::<Value>(&key).await.is_none());
    }
}
