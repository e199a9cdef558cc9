//! Normalized description of a completed write.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Kind of write that produced a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeOperation {
    /// Rows were inserted
    Create,
    /// Rows were modified
    Update,
    /// Rows were removed
    Delete,
}

impl ChangeOperation {
    /// Returns the string representation of the operation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOperation::Create => "CREATE",
            ChangeOperation::Update => "UPDATE",
            ChangeOperation::Delete => "DELETE",
        }
    }

    /// Map a SQL verb onto an operation. `SELECT` and unknown verbs yield `None`.
    pub fn from_sql_verb(verb: &str) -> Option<Self> {
        match verb.to_ascii_uppercase().as_str() {
            "INSERT" => Some(ChangeOperation::Create),
            "UPDATE" => Some(ChangeOperation::Update),
            "DELETE" => Some(ChangeOperation::Delete),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChangeOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A write against one data source.
///
/// Produced by the change analyzer and consumed within a single
/// invalidation cycle; never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Change {
    /// Logical data source (table) that was written
    pub source_name: String,
    /// Kind of write
    pub operation: ChangeOperation,
    /// Primary-key values touched by the write
    pub affected_keys: Vec<String>,
    /// Tenant scope, if the write carried one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<String>,
    /// When the change was observed
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl Change {
    /// Create a new change stamped with the current time.
    pub fn new(
        source_name: impl Into<String>,
        operation: ChangeOperation,
        affected_keys: Vec<String>,
    ) -> Self {
        Self {
            source_name: source_name.into(),
            operation,
            affected_keys,
            organization_id: None,
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    /// Set the organization scope.
    pub fn with_organization(mut self, organization_id: impl Into<String>) -> Self {
        self.organization_id = Some(organization_id.into());
        self
    }

    /// Same change, re-targeted at another source (relation fan-out).
    pub fn for_source(&self, source_name: impl Into<String>) -> Self {
        Self {
            source_name: source_name.into(),
            ..self.clone()
        }
    }

    /// Whether the change touched the given key.
    pub fn affects_key(&self, key: &str) -> bool {
        self.affected_keys.iter().any(|k| k == key)
    }
}
