//! Reactive function runtime with dependency-aware cache invalidation and
//! at-least-once delivery of invalidation events over SSE.

pub mod analyzer;
pub mod config;
pub mod delivery;
pub mod demo;
pub mod functions;
pub mod invalidation;
pub mod metrics;
pub mod observability;
pub mod relay;
pub mod runtime;
pub mod server;
pub mod store;

pub use config::AppConfig;
pub use delivery::{DeliveryConfig, DeliveryManager, DeliveryMessage, ResumeCursor, Subscription};
pub use functions::{FunctionRegistry, ReactiveFunction};
pub use invalidation::InvalidationEngine;
pub use observability::init_tracing;
pub use relay::RedisEventRelay;
pub use runtime::{ReactiveRuntime, build_cache_provider};
pub use server::{AppState, RippleServer, ServerBuilder, build_app};
pub use store::MemoryStore;
