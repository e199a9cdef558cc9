use std::collections::BTreeSet;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::CacheResult;

/// A cached function result together with the sources it was read from.
///
/// Stored as MessagePack. `stored_at_ms` is wall-clock so the freshness check
/// works when the entry was written by another instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub data: T,
    pub stored_at_ms: i64,
    pub ttl_seconds: u64,
    pub dependencies: BTreeSet<String>,
}

impl<T> CacheEntry<T> {
    pub fn new(data: T, ttl_seconds: u64, dependencies: impl IntoIterator<Item = String>) -> Self {
        Self {
            data,
            stored_at_ms: now_ms(),
            ttl_seconds,
            dependencies: dependencies.into_iter().collect(),
        }
    }

    /// Age of the entry in milliseconds.
    pub fn age_ms(&self) -> i64 {
        now_ms().saturating_sub(self.stored_at_ms)
    }

    /// `now - stored_at <= ttl`
    pub fn is_fresh(&self) -> bool {
        self.age_ms() <= (self.ttl_seconds as i64).saturating_mul(1000)
    }

    pub fn depends_on(&self, source: &str) -> bool {
        self.dependencies.contains(source)
    }
}

impl<T: Serialize> CacheEntry<T> {
    pub fn encode(&self) -> CacheResult<Vec<u8>> {
        Ok(rmp_serde::to_vec(self)?)
    }
}

impl<T: DeserializeOwned> CacheEntry<T> {
    pub fn decode(bytes: &[u8]) -> CacheResult<Self> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

fn now_ms() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_entry() {
        let entry = CacheEntry::new(vec![1, 2, 3], 300, ["posts".to_string()]);
        assert!(entry.is_fresh());
        assert!(entry.depends_on("posts"));
        assert!(!entry.depends_on("users"));
    }

    #[test]
    fn test_stale_entry() {
        let mut entry = CacheEntry::new("x".to_string(), 1, Vec::new());
        entry.stored_at_ms -= 1_500;
        assert!(!entry.is_fresh());
    }

    #[test]
    fn test_encode_decode_json_payload() {
        let entry = CacheEntry::new(
            serde_json::json!({"users": [{"id": "u1", "name": "Ada"}]}),
            60,
            ["users".to_string(), "posts".to_string()],
        );
        let bytes = entry.encode().unwrap();
        let decoded: CacheEntry<serde_json::Value> = CacheEntry::decode(&bytes).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(CacheEntry::<String>::decode(b"not msgpack").is_err());
    }
}
