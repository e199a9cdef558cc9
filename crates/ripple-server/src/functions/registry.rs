use std::collections::BTreeMap;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;
use ripple_core::{DataStore, ReactiveError, Result};
use serde::Serialize;
use serde_json::Value;

use super::function::{FunctionCache, FunctionMetadata, RegisteredFunction};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub total_functions: usize,
    /// Functions reading from (or writing to) each source, in registration order
    pub functions_by_dependency: BTreeMap<String, Vec<String>>,
}

/// Catalog of reactive functions, in registration order.
///
/// Constructed by the process bootstrap and passed around explicitly; there
/// is no global instance.
pub struct FunctionRegistry<S: DataStore> {
    functions: RwLock<IndexMap<String, Arc<dyn RegisteredFunction<S>>>>,
}

impl<S: DataStore> Default for FunctionRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: DataStore> FunctionRegistry<S> {
    pub fn new() -> Self {
        Self {
            functions: RwLock::new(IndexMap::new()),
        }
    }

    /// Register a function. Fails with `DuplicateName` if the name is taken.
    pub fn register<F>(&self, function: F) -> Result<()>
    where
        F: RegisteredFunction<S> + 'static,
    {
        self.register_arc(Arc::new(function))
    }

    pub fn register_arc(&self, function: Arc<dyn RegisteredFunction<S>>) -> Result<()> {
        let name = function.name().to_string();
        let mut functions = self.functions.write();
        if functions.contains_key(&name) {
            return Err(ReactiveError::duplicate_name(name));
        }
        tracing::debug!(
            function = %name,
            kind = ?function.kind(),
            dependencies = ?function.dependencies(),
            "registered reactive function"
        );
        functions.insert(name, function);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn RegisteredFunction<S>>> {
        self.functions
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ReactiveError::not_found(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.read().contains_key(name)
    }

    pub async fn execute(
        &self,
        name: &str,
        input: Value,
        store: &S,
        cache: &FunctionCache,
    ) -> Result<Value> {
        let function = self.get(name)?;
        function.execute_json(input, store, cache).await
    }

    /// Every function whose dependencies include `source`.
    pub fn list_affected_by(&self, source: &str) -> Vec<Arc<dyn RegisteredFunction<S>>> {
        self.functions
            .read()
            .values()
            .filter(|f| f.dependencies().contains(source))
            .cloned()
            .collect()
    }

    /// Metadata of every function, in registration order.
    pub fn metadata(&self) -> Vec<FunctionMetadata> {
        self.functions.read().values().map(|f| f.metadata()).collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.functions.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.functions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.read().is_empty()
    }

    pub fn stats(&self) -> RegistryStats {
        let functions = self.functions.read();
        let mut functions_by_dependency: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for function in functions.values() {
            for dependency in function.dependencies() {
                functions_by_dependency
                    .entry(dependency.clone())
                    .or_default()
                    .push(function.name().to_string());
            }
        }
        RegistryStats {
            total_functions: functions.len(),
            functions_by_dependency,
        }
    }
}
