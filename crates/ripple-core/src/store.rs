//! Contract for the underlying data store.
//!
//! The store is opaque: reactive functions talk to their concrete store type
//! directly. The only thing the runtime needs is a scoped transaction so that
//! a handler's writes commit or roll back as one unit.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Replication / consistency mode requested for a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicationMode {
    /// Whatever the store does by default
    #[default]
    Default,
    /// Wait for replicas before acknowledging the commit
    Strong,
    /// Acknowledge once the primary has committed
    Eventual,
}

impl ReplicationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplicationMode::Default => "default",
            ReplicationMode::Strong => "strong",
            ReplicationMode::Eventual => "eventual",
        }
    }
}

/// Options passed to [`DataStore::begin_transaction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TransactionOptions {
    #[serde(default)]
    pub replication_mode: ReplicationMode,
}

impl TransactionOptions {
    pub fn with_replication_mode(replication_mode: ReplicationMode) -> Self {
        Self { replication_mode }
    }
}

/// Errors raised by a data store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("query error: {0}")]
    Query(String),

    #[error("connection error: {0}")]
    Connection(String),
}

/// A data store that can scope a unit of work in a transaction.
#[async_trait]
pub trait DataStore: Send + Sync + 'static {
    /// Open transaction handle. Writes made through it become visible on commit.
    type Transaction: Send;

    /// Begin a transaction with the given options.
    async fn begin_transaction(
        &self,
        options: &TransactionOptions,
    ) -> Result<Self::Transaction, StoreError>;

    /// Commit a transaction.
    async fn commit(&self, tx: Self::Transaction) -> Result<(), StoreError>;

    /// Roll back a transaction, discarding its writes.
    async fn rollback(&self, tx: Self::Transaction) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replication_mode_default() {
        let options = TransactionOptions::default();
        assert_eq!(options.replication_mode, ReplicationMode::Default);
        assert_eq!(
            TransactionOptions::with_replication_mode(ReplicationMode::Strong)
                .replication_mode
                .as_str(),
            "strong"
        );
    }

    #[test]
    fn test_replication_mode_serde() {
        let options: TransactionOptions =
            serde_json::from_str(r#"{"replication_mode":"eventual"}"#).unwrap();
        assert_eq!(options.replication_mode, ReplicationMode::Eventual);
    }
}
