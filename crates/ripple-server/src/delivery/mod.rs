//! Delivery of invalidation events to live subscribers.
//!
//! Per organization, the [`DeliveryManager`] keeps:
//! - the live connections, each with its own outbound queue and pending
//!   (unacknowledged) events
//! - a bounded ring of recent events for reconnect backfill and polling
//!
//! Delivery is at-least-once: an event that requires acknowledgment stays
//! pending on a connection until acknowledged, is resent on the configured
//! backoff schedule, and is dropped with a warning once the retry budget is
//! spent. Cache eviction has already happened by the time an event is
//! broadcast, so a dropped event only costs the client a refetch on TTL.

mod backlog;
mod connection;
pub mod manager;
pub mod sweeper;

use std::time::Duration;

use ripple_core::InvalidationEvent;
use serde::Serialize;
use thiserror::Error;
use time::OffsetDateTime;

use crate::config::RealtimeConfig;

pub use manager::{DeliveryManager, SweepReport, Subscription};
pub use sweeper::RetrySweeper;

/// Fallback when the retry schedule is empty.
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("connection {0} not found")]
    ConnectionNotFound(String),

    #[error("outbound queue full for connection {0}")]
    QueueFull(String),

    #[error("connection {0} closed")]
    ConnectionClosed(String),
}

/// What a subscriber receives, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryMessage {
    Invalidation(InvalidationEvent),
    /// Missed events cannot be replayed; the client should refetch everything
    Resync { reason: ResyncReason },
    /// Backfill is complete and the connection is live
    Ready { connection_id: String, replayed: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResyncReason {
    /// The presented event id is not in the backlog
    UnknownEvent,
    /// Events after the cursor have already left the backlog
    BacklogExpired,
}

/// Where a reconnecting subscriber left off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeCursor {
    EventId(String),
    Timestamp(OffsetDateTime),
}

/// Answer to "what happened since X" without a live connection.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PollResult {
    pub events: Vec<InvalidationEvent>,
    pub resync_required: bool,
    pub latest_event_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delays: Vec<Duration>,
}

impl RetryPolicy {
    /// Wait before the next resend of an event already sent `attempts` times.
    /// The last delay repeats.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let index = attempts.saturating_sub(1) as usize;
        self.delays
            .get(index)
            .or_else(|| self.delays.last())
            .copied()
            .unwrap_or(DEFAULT_RETRY_DELAY)
    }
}

#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    pub retry: RetryPolicy,
    pub backlog_capacity: usize,
    pub backlog_retention: Duration,
    pub channel_capacity: usize,
    /// Cap on unacknowledged events held per connection
    pub max_pending: usize,
    pub sweep_interval: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self::from(&RealtimeConfig::default())
    }
}

impl From<&RealtimeConfig> for DeliveryConfig {
    fn from(config: &RealtimeConfig) -> Self {
        Self {
            retry: RetryPolicy {
                max_retries: config.reliability.max_retries,
                delays: config.reliability.retry_delays(),
            },
            backlog_capacity: config.backlog.capacity,
            backlog_retention: Duration::from_secs(config.backlog.retention_secs),
            channel_capacity: config.channel_capacity,
            max_pending: config.reliability.max_pending,
            sweep_interval: config.sweep_interval(),
        }
    }
}
