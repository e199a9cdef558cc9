//! Invalidation engine: turns a data change into cache evictions and an
//! event for subscribers.
//!
//! For each source touched by a change (the source itself plus its configured
//! relations):
//!
//! 1. the dependency index yields the candidate cache keys
//! 2. the registry yields the functions reading from the source; each is
//!    asked whether this change invalidates it
//! 3. a key is evicted unless its owner is one of those functions and
//!    declined; keys of unknown owners are evicted
//!
//! The index is never written here. A request that re-caches an evicted
//! key while the change is in flight stays listed for the next change.
//!
//! If the index cannot be read, every invalidating function's keys are
//! evicted by pattern instead. Eviction is best-effort and never fails the
//! caller. The event is then handed to local delivery and, when configured,
//! to the cross-instance relay.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use indexmap::IndexSet;
use ripple_core::{Change, DataStore, InvalidationEvent};
use tracing::{debug, info, warn};

use crate::config::relation_table;
use crate::delivery::DeliveryManager;
use crate::functions::{FunctionCache, FunctionRegistry, key_owner};
use crate::metrics;
use crate::relay::RedisEventRelay;

pub struct InvalidationEngine<S: DataStore> {
    registry: Arc<FunctionRegistry<S>>,
    cache: FunctionCache,
    relations: BTreeMap<String, Vec<String>>,
    requires_ack: bool,
    delivery: Option<DeliveryManager>,
    relay: Option<Arc<RedisEventRelay>>,
}

impl<S: DataStore> InvalidationEngine<S> {
    pub fn new(registry: Arc<FunctionRegistry<S>>, cache: FunctionCache) -> Self {
        Self {
            registry,
            cache,
            relations: BTreeMap::new(),
            requires_ack: true,
            delivery: None,
            relay: None,
        }
    }

    pub fn with_relations(mut self, relations: BTreeMap<String, Vec<String>>) -> Self {
        self.relations = relations;
        self
    }

    /// Whether produced events require subscriber acknowledgment.
    pub fn with_acknowledgments(mut self, enabled: bool) -> Self {
        self.requires_ack = enabled;
        self
    }

    pub fn with_delivery(mut self, delivery: DeliveryManager) -> Self {
        self.delivery = Some(delivery);
        self
    }

    pub fn with_relay(mut self, relay: Arc<RedisEventRelay>) -> Self {
        self.relay = Some(relay);
        self
    }

    pub fn delivery(&self) -> Option<&DeliveryManager> {
        self.delivery.as_ref()
    }

    /// The changed source followed by its relations, without duplicates.
    pub fn sources_for(&self, source: &str) -> Vec<String> {
        let mut sources = IndexSet::new();
        sources.insert(source.to_string());
        if let Some(related) = self.relations.get(source) {
            for target in related {
                sources.insert(relation_table(target).to_string());
            }
        }
        sources.into_iter().collect()
    }

    /// Evict what the change invalidates and publish the resulting event.
    pub async fn process(&self, change: &Change) -> InvalidationEvent {
        let mut affected_keys = IndexSet::new();
        let mut evicted = 0usize;

        for source in self.sources_for(&change.source_name) {
            let scoped = change.for_source(&source);
            let (keys, count) = self.invalidate_source(&scoped).await;
            affected_keys.extend(keys);
            evicted += count;
        }

        metrics::record_invalidation(&change.source_name);
        metrics::record_evictions(evicted);

        let event = InvalidationEvent::from_change(
            change,
            affected_keys.into_iter().collect(),
            self.requires_ack,
        );

        info!(
            event_id = %event.event_id,
            source = %change.source_name,
            operation = %change.operation,
            organization_id = %event.organization_id,
            affected = event.affected_query_keys.len(),
            evicted,
            "Processed change"
        );

        if let Some(delivery) = &self.delivery {
            delivery.broadcast(&event);
        }
        if let Some(relay) = &self.relay
            && let Err(e) = relay.publish(&event).await
        {
            warn!(event_id = %event.event_id, error = %e, "Failed to publish event to relay");
        }

        event
    }

    /// Returns the resolved keys and how many evictions the provider confirmed.
    async fn invalidate_source(&self, change: &Change) -> (Vec<String>, usize) {
        let source = change.source_name.as_str();
        let mut invalidating = BTreeSet::new();
        let mut declined = BTreeSet::new();
        for function in self.registry.list_affected_by(source) {
            if function.should_invalidate(change) {
                invalidating.insert(function.name().to_string());
            } else {
                declined.insert(function.name().to_string());
            }
        }

        let index = self.cache.results.index();
        let candidates = match index.lookup(source).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(source = %source, error = %e, "Dependency index unavailable; evicting by pattern");
                return self.evict_by_pattern(&invalidating).await;
            }
        };

        let mut resolved = Vec::new();
        let mut evicted = 0usize;
        for key in candidates {
            if key_owner(&key).is_some_and(|owner| declined.contains(owner)) {
                debug!(key = %key, source = %source, "Predicate declined invalidation");
                continue;
            }
            if self.cache.results.evict(&key).await {
                evicted += 1;
            }
            resolved.push(key);
        }

        (resolved, evicted)
    }

    async fn evict_by_pattern(&self, functions: &BTreeSet<String>) -> (Vec<String>, usize) {
        let mut patterns = Vec::with_capacity(functions.len());
        let mut removed = 0u64;
        for name in functions {
            let pattern = format!("{name}:*");
            removed += self.cache.results.evict_pattern(&pattern).await;
            patterns.push(pattern);
        }
        (patterns, removed as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::{DeliveryConfig, DeliveryMessage};
    use crate::functions::{
        AffectsKeys, FunctionHandler, HandlerContext, ReactiveFunction, RegisteredFunction,
    };
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use futures_util::future::BoxFuture;
    use ripple_cache::{CacheProvider, CacheResult, MemoryProvider, ResultCache};
    use std::time::Duration;
    use ripple_core::{ChangeOperation, Result};
    use serde_json::{Value, json};

    struct Echo;

    #[async_trait]
    impl FunctionHandler<MemoryStore> for Echo {
        type Input = Value;
        type Output = Value;

        async fn handle(&self, ctx: HandlerContext<'_, MemoryStore, Value>) -> Result<Value> {
            Ok(ctx.input)
        }
    }

    fn query(name: &str, deps: &[&str]) -> ReactiveFunction<MemoryStore, Echo> {
        ReactiveFunction::query(name, Echo)
            .depends_on(deps.iter().copied())
            .build()
            .unwrap()
    }

    struct Fixture {
        store: MemoryStore,
        cache: FunctionCache,
        registry: Arc<FunctionRegistry<MemoryStore>>,
    }

    impl Fixture {
        fn new() -> Self {
            let registry = Arc::new(FunctionRegistry::new());
            registry.register(query("users.getAll", &["users"])).unwrap();
            registry
                .register(query("posts.getAll", &["posts", "users"]))
                .unwrap();
            Self {
                store: MemoryStore::new(),
                cache: FunctionCache::new(ResultCache::new(Arc::new(MemoryProvider::new()))),
                registry,
            }
        }

        fn engine(&self) -> InvalidationEngine<MemoryStore> {
            InvalidationEngine::new(self.registry.clone(), self.cache.clone())
        }

        async fn warm(&self, name: &str, input: Value) -> String {
            let function = self.registry.get(name).unwrap();
            function
                .execute_json(input.clone(), &self.store, &self.cache)
                .await
                .unwrap();
            function.cache_key_for(&input).unwrap()
        }

        async fn cached(&self, key: &str) -> bool {
            self.cache.results.get::<Value>(key).await.is_some()
        }
    }

    #[tokio::test]
    async fn test_change_evicts_only_dependent_keys() {
        let fx = Fixture::new();
        let users = fx.warm("users.getAll", json!({"organizationId": "org1"})).await;
        let posts = fx.warm("posts.getAll", json!({"organizationId": "org1"})).await;

        let change =
            Change::new("posts", ChangeOperation::Create, vec!["p1".into()]).with_organization("org1");
        let event = fx.engine().process(&change).await;

        assert!(!fx.cached(&posts).await);
        assert!(fx.cached(&users).await);
        assert_eq!(event.affected_query_keys, vec![posts]);
        assert_eq!(event.organization_id, "org1");
        assert!(event.requires_ack);
    }

    #[tokio::test]
    async fn test_index_keeps_keys_after_eviction() {
        let fx = Fixture::new();
        let posts = fx.warm("posts.getAll", json!({})).await;

        fx.engine()
            .process(&Change::new("posts", ChangeOperation::Update, vec![]))
            .await;

        assert!(!fx.cached(&posts).await);
        for source in ["posts", "users"] {
            assert_eq!(fx.cache.results.index().lookup(source).await.unwrap(), vec![posts.clone()]);
        }
    }

    /// Memory provider that runs a one-shot task right after a given key is deleted.
    #[derive(Default)]
    struct AfterDelete {
        inner: MemoryProvider,
        hook: parking_lot::Mutex<Option<(String, BoxFuture<'static, ()>)>>,
    }

    #[async_trait]
    impl CacheProvider for AfterDelete {
        fn name(&self) -> &'static str {
            "after-delete"
        }
        async fn get(&self, key: &str) -> CacheResult<Option<Arc<Vec<u8>>>> {
            self.inner.get(key).await
        }
        async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> CacheResult<()> {
            self.inner.set(key, value, ttl).await
        }
        async fn delete(&self, key: &str) -> CacheResult<()> {
            self.inner.delete(key).await?;
            let task = {
                let mut hook = self.hook.lock();
                match hook.as_ref() {
                    Some((target, _)) if target == key => hook.take().map(|(_, task)| task),
                    _ => None,
                }
            };
            if let Some(task) = task {
                task.await;
            }
            Ok(())
        }
        async fn invalidate_by_pattern(&self, pattern: &str) -> CacheResult<u64> {
            self.inner.invalidate_by_pattern(pattern).await
        }
        async fn clear(&self) -> CacheResult<()> {
            self.inner.clear().await
        }
    }

    #[tokio::test]
    async fn test_key_recached_during_eviction_is_evicted_by_next_change() {
        let provider = Arc::new(AfterDelete::default());
        let cache = FunctionCache::new(ResultCache::new(provider.clone()));
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(FunctionRegistry::new());
        registry
            .register(query("posts.getAll", &["posts", "users"]))
            .unwrap();
        let engine = InvalidationEngine::new(registry.clone(), cache.clone());

        let input = json!({"organizationId": "org1"});
        let function = registry.get("posts.getAll").unwrap();
        function
            .execute_json(input.clone(), &*store, &cache)
            .await
            .unwrap();
        let key = function.cache_key_for(&input).unwrap();

        // a concurrent request misses and re-caches while the change is evicting
        let recache = {
            let (function, store, cache, input) =
                (function.clone(), store.clone(), cache.clone(), input.clone());
            async move {
                let _ = function.execute_json(input, &*store, &cache).await;
            }
        };
        *provider.hook.lock() = Some((key.clone(), Box::pin(recache)));

        let change = Change::new("posts", ChangeOperation::Update, vec![]).with_organization("org1");
        engine.process(&change).await;
        assert!(cache.results.get::<Value>(&key).await.is_some());
        assert!(cache.results.index().lookup("posts").await.unwrap().contains(&key));

        let event = engine.process(&change).await;
        assert!(cache.results.get::<Value>(&key).await.is_none());
        assert_eq!(event.affected_query_keys, vec![key]);
    }

    #[tokio::test]
    async fn test_relations_fan_out() {
        let fx = Fixture::new();
        let users = fx.warm("users.getAll", json!({})).await;

        let mut relations = BTreeMap::new();
        relations.insert("accounts".to_string(), vec!["users.account_id".to_string()]);
        let engine = fx.engine().with_relations(relations);

        assert_eq!(engine.sources_for("accounts"), vec!["accounts", "users"]);
        let event = engine
            .process(&Change::new("accounts", ChangeOperation::Delete, vec!["a1".into()]))
            .await;

        assert!(!fx.cached(&users).await);
        assert_eq!(event.source_name, "accounts");
        assert!(event.affected_query_keys.contains(&users));
    }

    #[tokio::test]
    async fn test_declining_predicate_keeps_entry() {
        let fx = Fixture::new();
        fx.registry
            .register(
                ReactiveFunction::query("posts.byId", Echo)
                    .depends_on(["posts"])
                    .invalidate_when("posts", AffectsKeys(vec!["p1".into()]))
                    .build()
                    .unwrap(),
            )
            .unwrap();
        let key = fx.warm("posts.byId", json!({"id": "p1"})).await;

        fx.engine()
            .process(&Change::new("posts", ChangeOperation::Update, vec!["p2".into()]))
            .await;
        assert!(fx.cached(&key).await);

        fx.engine()
            .process(&Change::new("posts", ChangeOperation::Update, vec!["p1".into()]))
            .await;
        assert!(!fx.cached(&key).await);
    }

    #[tokio::test]
    async fn test_failing_predicate_invalidates() {
        let fx = Fixture::new();
        fx.registry
            .register(
                ReactiveFunction::query("posts.flaky", Echo)
                    .depends_on(["posts"])
                    .invalidate_when("posts", |_: &Change| -> std::result::Result<bool, _> {
                        Err(crate::functions::PredicateError::new("lookup failed"))
                    })
                    .build()
                    .unwrap(),
            )
            .unwrap();
        let key = fx.warm("posts.flaky", json!({})).await;

        fx.engine()
            .process(&Change::new("posts", ChangeOperation::Delete, vec![]))
            .await;
        assert!(!fx.cached(&key).await);
    }

    #[tokio::test]
    async fn test_event_is_broadcast() {
        let fx = Fixture::new();
        let delivery = DeliveryManager::new(DeliveryConfig::default());
        let mut sub = delivery.subscribe("org1", None);
        assert!(matches!(sub.try_recv(), Some(DeliveryMessage::Ready { .. })));

        let engine = fx
            .engine()
            .with_acknowledgments(false)
            .with_delivery(delivery.clone());
        let event = engine
            .process(&Change::new("users", ChangeOperation::Create, vec![]).with_organization("org1"))
            .await;

        assert!(!event.requires_ack);
        match sub.try_recv() {
            Some(DeliveryMessage::Invalidation(got)) => assert_eq!(got.event_id, event.event_id),
            other => panic!("expected invalidation, got {other:?}"),
        }
        assert_eq!(delivery.pending_count(sub.connection_id()), Some(0));
    }
}
