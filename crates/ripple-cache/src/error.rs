use std::time::Duration;

/// Result type for cache provider operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Errors raised by a cache provider.
///
/// Callers on the read and write paths never see these; [`ResultCache`]
/// logs them and degrades to a miss or a no-op.
///
/// [`ResultCache`]: crate::ResultCache
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache connection error: {0}")]
    Connection(String),

    #[error("cache command error: {0}")]
    Command(String),

    #[error("cache operation {op} timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },

    #[error("cache serialization error: {0}")]
    Serialization(String),

    #[error("invalid key pattern: {0}")]
    Pattern(String),
}

impl From<rmp_serde::encode::Error> for CacheError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for CacheError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
