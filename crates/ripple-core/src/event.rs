//! Invalidation events pushed to subscribers.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::change::{Change, ChangeOperation};
use crate::id::generate_event_id;

/// Scope used when a change carries no organization. Events in this scope
/// are delivered to every organization.
pub const GLOBAL_SCOPE: &str = "global";

/// Notification that cached query results for a source were evicted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidationEvent {
    /// Unique id, used for acknowledgment and resume
    pub event_id: String,
    /// Source whose change triggered the event
    pub source_name: String,
    /// Tenant the event is delivered to
    pub organization_id: String,
    /// Cache keys evicted by this change
    pub affected_query_keys: Vec<String>,
    /// Primary-key values from the originating change
    #[serde(default)]
    pub affected_keys: Vec<String>,
    /// Whether subscribers must acknowledge receipt
    pub requires_ack: bool,
    pub operation: ChangeOperation,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl InvalidationEvent {
    /// Build an event for a processed change with a fresh id.
    pub fn from_change(change: &Change, affected_query_keys: Vec<String>, requires_ack: bool) -> Self {
        Self {
            event_id: generate_event_id(),
            source_name: change.source_name.clone(),
            organization_id: change
                .organization_id
                .clone()
                .unwrap_or_else(|| GLOBAL_SCOPE.to_string()),
            affected_query_keys,
            affected_keys: change.affected_keys.clone(),
            requires_ack,
            operation: change.operation,
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    /// Whether the event is ungated (delivered to every organization).
    pub fn is_global(&self) -> bool {
        self.organization_id == GLOBAL_SCOPE
    }

    /// Check if this event is relevant to subscribers of an organization.
    pub fn matches_organization(&self, organization_id: &str) -> bool {
        self.is_global() || self.organization_id == organization_id
    }
}
