//! Reactive functions: named, validated, cacheable units of read/write work.
//!
//! A function is defined once with [`ReactiveFunction::query`] or
//! [`ReactiveFunction::mutation`], configured through [`FunctionBuilder`],
//! and registered in a [`FunctionRegistry`](super::FunctionRegistry).
//!
//! # Cache keys
//!
//! Result keys are `{name}:{canonical input}`, where the canonical input is
//! the JSON encoding of the parsed input with object keys sorted. A custom
//! key function replaces only the part after the colon, so the owning
//! function can always be recovered from a key with [`key_owner`].

use std::collections::{BTreeSet, HashMap};
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use ripple_cache::ResultCache;
use ripple_core::{
    Change, ChangeOperation, DataStore, ReactiveError, ReplicationMode, Result,
    TransactionOptions,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::predicate::{InvalidationPredicate, evaluate_guarded};
use crate::metrics;

/// TTL for cached query results when neither the function nor the
/// configuration sets one.
pub const DEFAULT_TTL_SECS: u64 = 300;

/// Input type of a reactive function.
///
/// `validate` runs after deserialization and before any side effect.
pub trait FunctionInput: Serialize + DeserializeOwned + Send + Sync + 'static {
    fn validate(&self) -> Result<()> {
        Ok(())
    }
}

impl FunctionInput for Value {}

/// What a handler gets to work with.
///
/// `tx` is set when the function runs inside a transaction; writes should go
/// through it so that a handler error discards them.
pub struct HandlerContext<'a, S: DataStore, I> {
    pub input: I,
    pub store: &'a S,
    pub tx: Option<&'a mut S::Transaction>,
}

/// User logic behind a reactive function.
#[async_trait]
pub trait FunctionHandler<S: DataStore>: Send + Sync + 'static {
    type Input: FunctionInput;
    type Output: Serialize + DeserializeOwned + Send + Sync + 'static;

    async fn handle(&self, ctx: HandlerContext<'_, S, Self::Input>) -> Result<Self::Output>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase", tag = "type", content = "operation")]
pub enum FunctionKind {
    /// Read; results are cached
    Query,
    /// Write of the given kind to every declared dependency; never cached
    Mutation(ChangeOperation),
}

impl FunctionKind {
    pub fn is_query(&self) -> bool {
        matches!(self, FunctionKind::Query)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionMetadata {
    pub name: String,
    pub kind: FunctionKind,
    pub dependencies: Vec<String>,
    pub cache_enabled: bool,
    pub cache_ttl_secs: Option<u64>,
    pub has_invalidation_rules: bool,
    pub transaction_enabled: bool,
    pub replication_mode: Option<ReplicationMode>,
}

/// Result cache as seen by function execution.
#[derive(Clone)]
pub struct FunctionCache {
    pub results: ResultCache,
    pub default_ttl_secs: u64,
}

impl FunctionCache {
    pub fn new(results: ResultCache) -> Self {
        Self {
            results,
            default_ttl_secs: DEFAULT_TTL_SECS,
        }
    }

    pub fn with_default_ttl(mut self, ttl_secs: u64) -> Self {
        self.default_ttl_secs = ttl_secs;
        self
    }
}

/// Name of the function owning a result key.
pub fn key_owner(cache_key: &str) -> Option<&str> {
    cache_key.split_once(':').map(|(name, _)| name)
}

/// JSON encoding with object keys sorted at every level.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(item, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

type KeyFn<I> = Box<dyn Fn(&I) -> String + Send + Sync>;

/// A reactive function over data store `S`, implemented by handler `H`.
pub struct ReactiveFunction<S: DataStore, H: FunctionHandler<S>> {
    name: String,
    kind: FunctionKind,
    dependencies: BTreeSet<String>,
    cache_enabled: bool,
    ttl_secs: Option<u64>,
    key_fn: Option<KeyFn<H::Input>>,
    rules: HashMap<String, Arc<dyn InvalidationPredicate>>,
    transaction: Option<TransactionOptions>,
    handler: H,
    _store: PhantomData<fn(&S)>,
}

/// Configures a [`ReactiveFunction`]; [`build`](Self::build) checks the
/// definition.
pub struct FunctionBuilder<S: DataStore, H: FunctionHandler<S>> {
    function: ReactiveFunction<S, H>,
}

impl<S: DataStore, H: FunctionHandler<S>> ReactiveFunction<S, H> {
    fn new(name: String, kind: FunctionKind, handler: H) -> Self {
        Self {
            name,
            kind,
            dependencies: BTreeSet::new(),
            cache_enabled: kind.is_query(),
            ttl_secs: None,
            key_fn: None,
            rules: HashMap::new(),
            transaction: None,
            handler,
            _store: PhantomData,
        }
    }

    /// Start defining a cached read.
    pub fn query(name: impl Into<String>, handler: H) -> FunctionBuilder<S, H> {
        FunctionBuilder {
            function: Self::new(name.into(), FunctionKind::Query, handler),
        }
    }

    /// Start defining a write. Its dependencies are the sources it writes.
    pub fn mutation(
        name: impl Into<String>,
        operation: ChangeOperation,
        handler: H,
    ) -> FunctionBuilder<S, H> {
        FunctionBuilder {
            function: Self::new(name.into(), FunctionKind::Mutation(operation), handler),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> FunctionKind {
        self.kind
    }

    pub fn dependencies(&self) -> &BTreeSet<String> {
        &self.dependencies
    }

    pub fn is_cacheable(&self) -> bool {
        self.kind.is_query() && self.cache_enabled
    }

    pub fn cache_key(&self, input: &H::Input) -> Result<String> {
        let suffix = match &self.key_fn {
            Some(key_fn) => key_fn(input),
            None => canonical_json(&serde_json::to_value(input)?),
        };
        Ok(format!("{}:{}", self.name, suffix))
    }

    /// Whether `change` invalidates this function's cached results.
    pub fn should_invalidate(&self, change: &Change) -> bool {
        if !self.dependencies.contains(&change.source_name) {
            return false;
        }
        match self.rules.get(&change.source_name) {
            Some(rule) => evaluate_guarded(&self.name, rule.as_ref(), change),
            None => true,
        }
    }

    /// Validate, serve from cache when fresh, otherwise run the handler and
    /// cache its result.
    pub async fn execute(
        &self,
        input: H::Input,
        store: &S,
        cache: &FunctionCache,
    ) -> Result<H::Output> {
        input.validate()?;

        let key = if self.is_cacheable() {
            Some(self.cache_key(&input)?)
        } else {
            None
        };

        if let Some(key) = key.as_deref() {
            match cache.results.get::<H::Output>(key).await {
                Some(entry) if entry.is_fresh() => {
                    debug!(function = %self.name, key = %key, "cache hit");
                    metrics::record_cache_hit(&self.name);
                    return Ok(entry.data);
                }
                _ => {
                    debug!(function = %self.name, key = %key, "cache miss");
                    metrics::record_cache_miss(&self.name);
                }
            }
        }

        let output = self.run_handler(input, store).await?;

        if let Some(key) = key.as_deref() {
            let ttl = self.ttl_secs.unwrap_or(cache.default_ttl_secs);
            cache
                .results
                .store(key, &output, ttl, &self.dependencies)
                .await;
        }

        Ok(output)
    }

    async fn run_handler(&self, input: H::Input, store: &S) -> Result<H::Output> {
        let Some(options) = self.transaction.as_ref() else {
            return self
                .handler
                .handle(HandlerContext {
                    input,
                    store,
                    tx: None,
                })
                .await;
        };

        debug!(
            function = %self.name,
            replication_mode = options.replication_mode.as_str(),
            "executing in transaction"
        );
        let mut tx = store.begin_transaction(options).await?;
        let result = self
            .handler
            .handle(HandlerContext {
                input,
                store,
                tx: Some(&mut tx),
            })
            .await;

        match result {
            Ok(output) => {
                store.commit(tx).await?;
                Ok(output)
            }
            Err(e) => {
                if let Err(rollback_err) = store.rollback(tx).await {
                    warn!(
                        function = %self.name,
                        error = %rollback_err,
                        "rollback failed after handler error"
                    );
                }
                Err(e)
            }
        }
    }

    pub fn metadata(&self) -> FunctionMetadata {
        FunctionMetadata {
            name: self.name.clone(),
            kind: self.kind,
            dependencies: self.dependencies.iter().cloned().collect(),
            cache_enabled: self.is_cacheable(),
            cache_ttl_secs: self.ttl_secs,
            has_invalidation_rules: !self.rules.is_empty(),
            transaction_enabled: self.transaction.is_some(),
            replication_mode: self.transaction.map(|t| t.replication_mode),
        }
    }
}

impl<S: DataStore, H: FunctionHandler<S>> FunctionBuilder<S, H> {
    pub fn depends_on<I, D>(mut self, sources: I) -> Self
    where
        I: IntoIterator<Item = D>,
        D: Into<String>,
    {
        self.function
            .dependencies
            .extend(sources.into_iter().map(Into::into));
        self
    }

    pub fn ttl_secs(mut self, ttl_secs: u64) -> Self {
        self.function.ttl_secs = Some(ttl_secs);
        self
    }

    /// Turn result caching off (or back on) for a query.
    pub fn cache_enabled(mut self, enabled: bool) -> Self {
        self.function.cache_enabled = enabled;
        self
    }

    /// Replace the canonical input in the cache key. The function name is
    /// still prepended.
    pub fn key_fn<F>(mut self, key_fn: F) -> Self
    where
        F: Fn(&H::Input) -> String + Send + Sync + 'static,
    {
        self.function.key_fn = Some(Box::new(key_fn));
        self
    }

    pub fn invalidate_when<P>(mut self, source: impl Into<String>, predicate: P) -> Self
    where
        P: InvalidationPredicate + 'static,
    {
        self.function
            .rules
            .insert(source.into(), Arc::new(predicate));
        self
    }

    /// Run the handler inside a store transaction.
    pub fn transactional(mut self, replication_mode: ReplicationMode) -> Self {
        self.function.transaction = Some(TransactionOptions::with_replication_mode(
            replication_mode,
        ));
        self
    }

    pub fn build(self) -> Result<ReactiveFunction<S, H>> {
        let f = self.function;
        if f.name.trim().is_empty() {
            return Err(ReactiveError::definition("function name must not be empty"));
        }
        if f.name.contains(':') {
            return Err(ReactiveError::definition(format!(
                "function name '{}' must not contain ':'",
                f.name
            )));
        }
        if f.dependencies.iter().any(|d| d.trim().is_empty()) {
            return Err(ReactiveError::definition(format!(
                "function '{}' declares an empty dependency",
                f.name
            )));
        }
        if f.kind.is_query() && f.dependencies.is_empty() {
            return Err(ReactiveError::definition(format!(
                "query '{}' must declare at least one dependency",
                f.name
            )));
        }
        if f.ttl_secs == Some(0) {
            return Err(ReactiveError::definition(format!(
                "function '{}' has a zero TTL",
                f.name
            )));
        }
        if let Some(source) = f.rules.keys().find(|s| !f.dependencies.contains(*s)) {
            return Err(ReactiveError::definition(format!(
                "function '{}' has an invalidation rule for undeclared source '{}'",
                f.name, source
            )));
        }
        Ok(f)
    }
}

/// Type-erased view of a registered function.
#[async_trait]
pub trait RegisteredFunction<S: DataStore>: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> FunctionKind;

    fn dependencies(&self) -> &BTreeSet<String>;

    fn metadata(&self) -> FunctionMetadata;

    /// Cache key for a JSON input.
    fn cache_key_for(&self, input: &Value) -> Result<String>;

    fn should_invalidate(&self, change: &Change) -> bool;

    /// Parse `input`, execute, and encode the output.
    async fn execute_json(&self, input: Value, store: &S, cache: &FunctionCache) -> Result<Value>;
}

fn parse_input<I: FunctionInput>(function: &str, input: Value) -> Result<I> {
    serde_json::from_value(input)
        .map_err(|e| ReactiveError::validation(format!("invalid input for {function}: {e}")))
}

#[async_trait]
impl<S, H> RegisteredFunction<S> for ReactiveFunction<S, H>
where
    S: DataStore,
    H: FunctionHandler<S>,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> FunctionKind {
        self.kind
    }

    fn dependencies(&self) -> &BTreeSet<String> {
        &self.dependencies
    }

    fn metadata(&self) -> FunctionMetadata {
        ReactiveFunction::metadata(self)
    }

    fn cache_key_for(&self, input: &Value) -> Result<String> {
        let input: H::Input = parse_input(&self.name, input.clone())?;
        self.cache_key(&input)
    }

    fn should_invalidate(&self, change: &Change) -> bool {
        ReactiveFunction::should_invalidate(self, change)
    }

    async fn execute_json(&self, input: Value, store: &S, cache: &FunctionCache) -> Result<Value> {
        let input: H::Input = parse_input(&self.name, input)?;
        let output = self.execute(input, store, cache).await?;
        Ok(serde_json::to_value(output)?)
    }
}
