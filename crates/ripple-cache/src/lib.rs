//! Cache layer for Ripple.
//!
//! ## Layout
//!
//! - [`CacheProvider`]: byte-level key/value contract with TTL and bulk
//!   pattern deletion
//! - [`MemoryProvider`]: in-process `DashMap`, lazy expiry
//! - [`RedisProvider`]: shared Redis, lazily connected, every call bounded by
//!   a timeout
//! - [`DependencyIndex`]: source → cache keys, stored in the same keyspace
//! - [`ResultCache`]: typed entries on top of a provider; swallows provider
//!   failures so callers only ever see a hit or a miss
//!
//! ```text
//! execute(fn) ──► ResultCache::get ──► provider ──► miss? run handler
//!                       │                                │
//!                       └──── store + index ◄────────────┘
//! ```

pub mod entry;
pub mod error;
pub mod index;
pub mod memory;
pub mod pattern;
pub mod provider;
pub mod redis;
pub mod result_cache;

pub use entry::CacheEntry;
pub use error::{CacheError, CacheResult};
pub use index::{DEFAULT_NAMESPACE, DependencyIndex};
pub use memory::{CachedEntry, MemoryProvider};
pub use pattern::KeyPattern;
pub use provider::CacheProvider;
pub use redis::{DELETE_BATCH_SIZE, RedisProvider, RedisProviderConfig};
pub use result_cache::ResultCache;
