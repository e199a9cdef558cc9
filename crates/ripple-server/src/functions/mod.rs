//! Reactive functions and the registry that catalogs them.

pub mod function;
pub mod predicate;
pub mod registry;

pub use function::{
    DEFAULT_TTL_SECS, FunctionBuilder, FunctionCache, FunctionHandler, FunctionInput,
    FunctionKind, FunctionMetadata, HandlerContext, ReactiveFunction, RegisteredFunction,
    canonical_json, key_owner,
};
pub use predicate::{AffectsKeys, InvalidationPredicate, PredicateError};
pub use registry::{FunctionRegistry, RegistryStats};
