//! In-memory table store.
//!
//! Rows are JSON objects kept per table in insertion order. Writes made
//! through a [`MemoryTransaction`] are buffered and only become visible on
//! commit; reads never see uncommitted rows, including those of the reading
//! transaction.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use ripple_core::{DataStore, StoreError, TransactionOptions};
use serde_json::Value;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

#[derive(Debug)]
pub struct MemoryTransaction {
    id: u64,
    options: TransactionOptions,
    writes: Vec<(String, Value)>,
}

impl MemoryTransaction {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn options(&self) -> &TransactionOptions {
        &self.options
    }

    pub fn pending_writes(&self) -> usize {
        self.writes.len()
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<HashMap<String, Vec<Value>>>,
    next_tx: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a row, filling `id` and `createdAt` when absent. With a
    /// transaction the row is buffered until commit.
    pub fn insert(&self, tx: Option<&mut MemoryTransaction>, table: &str, mut row: Value) -> Value {
        if let Some(fields) = row.as_object_mut() {
            fields
                .entry("id")
                .or_insert_with(|| Value::String(uuid::Uuid::new_v4().to_string()));
            if !fields.contains_key("createdAt") {
                let now = OffsetDateTime::now_utc()
                    .format(&Rfc3339)
                    .unwrap_or_default();
                fields.insert("createdAt".into(), Value::String(now));
            }
        }

        match tx {
            Some(tx) => tx.writes.push((table.to_string(), row.clone())),
            None => self
                .tables
                .write()
                .entry(table.to_string())
                .or_default()
                .push(row.clone()),
        }
        row
    }

    /// Committed rows matching `filter`, newest first.
    pub fn select<F>(&self, table: &str, filter: F, limit: usize) -> Vec<Value>
    where
        F: Fn(&Value) -> bool,
    {
        self.tables
            .read()
            .get(table)
            .map(|rows| {
                rows.iter()
                    .rev()
                    .filter(|row| filter(row))
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn find(&self, table: &str, id: &str) -> Option<Value> {
        self.tables.read().get(table).and_then(|rows| {
            rows.iter()
                .find(|row| row.get("id").and_then(Value::as_str) == Some(id))
                .cloned()
        })
    }

    pub fn count(&self, table: &str) -> usize {
        self.tables.read().get(table).map_or(0, Vec::len)
    }
}

#[async_trait]
impl DataStore for MemoryStore {
    type Transaction = MemoryTransaction;

    async fn begin_transaction(
        &self,
        options: &TransactionOptions,
    ) -> Result<MemoryTransaction, StoreError> {
        Ok(MemoryTransaction {
            id: self.next_tx.fetch_add(1, Ordering::Relaxed),
            options: *options,
            writes: Vec::new(),
        })
    }

    async fn commit(&self, tx: MemoryTransaction) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        for (table, row) in tx.writes {
            tables.entry(table).or_default().push(row);
        }
        Ok(())
    }

    async fn rollback(&self, tx: MemoryTransaction) -> Result<(), StoreError> {
        tracing::debug!(tx = tx.id, discarded = tx.writes.len(), "transaction rolled back");
        Ok(())
    }
}
