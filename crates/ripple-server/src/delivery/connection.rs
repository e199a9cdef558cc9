use indexmap::IndexMap;
use ripple_core::InvalidationEvent;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;
use tracing::warn;

use super::{DeliveryError, DeliveryMessage, RetryPolicy};
use crate::metrics;

#[derive(Debug)]
pub(crate) struct PendingDelivery {
    pub event: InvalidationEvent,
    pub last_sent: Instant,
    /// Send attempts so far, including ones that found the queue full
    pub attempts: u32,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RetryOutcome {
    pub resent: usize,
    pub dropped: usize,
    pub closed: bool,
}

/// One live subscriber. Its pending set is private to it; nothing else
/// mutates it.
#[derive(Debug)]
pub(crate) struct Connection {
    pub id: String,
    sender: mpsc::Sender<DeliveryMessage>,
    pending: IndexMap<String, PendingDelivery>,
    /// Oldest pending events are dropped beyond this
    max_pending: usize,
    last_acknowledged: Option<String>,
}

impl Connection {
    pub fn new(id: String, sender: mpsc::Sender<DeliveryMessage>, max_pending: usize) -> Self {
        Self {
            id,
            sender,
            pending: IndexMap::new(),
            max_pending: max_pending.max(1),
            last_acknowledged: None,
        }
    }

    /// Non-blocking send.
    pub fn send(&self, message: DeliveryMessage) -> Result<(), DeliveryError> {
        self.sender.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryError::QueueFull(self.id.clone()),
            TrySendError::Closed(_) => DeliveryError::ConnectionClosed(self.id.clone()),
        })
    }

    /// Send an event, keeping it pending when it needs acknowledgment. A
    /// full queue still counts as an attempt.
    pub fn deliver(&mut self, event: &InvalidationEvent, now: Instant) -> Result<(), DeliveryError> {
        let result = self.send(DeliveryMessage::Invalidation(event.clone()));
        if event.requires_ack && !matches!(result, Err(DeliveryError::ConnectionClosed(_))) {
            let pending = self
                .pending
                .entry(event.event_id.clone())
                .or_insert(PendingDelivery {
                    event: event.clone(),
                    last_sent: now,
                    attempts: 0,
                });
            pending.attempts += 1;
            pending.last_sent = now;
            self.enforce_pending_cap();
        }
        result
    }

    fn enforce_pending_cap(&mut self) {
        while self.pending.len() > self.max_pending {
            let Some((event_id, pending)) = self.pending.shift_remove_index(0) else {
                break;
            };
            warn!(
                connection_id = %self.id,
                event_id = %event_id,
                organization_id = %pending.event.organization_id,
                max_pending = self.max_pending,
                "Pending set full; dropping oldest event"
            );
            metrics::record_delivery_dropped();
        }
    }

    /// Retire a pending event. Unknown or already retired ids are a no-op.
    pub fn acknowledge(&mut self, event_id: &str) -> bool {
        let removed = self.pending.shift_remove(event_id).is_some();
        if removed {
            self.last_acknowledged = Some(event_id.to_string());
        }
        removed
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn last_acknowledged(&self) -> Option<&str> {
        self.last_acknowledged.as_deref()
    }

    /// Resend every pending event whose backoff has elapsed, in event order,
    /// and drop those that have used up their retries.
    pub fn retry_due(&mut self, now: Instant, policy: &RetryPolicy) -> RetryOutcome {
        let mut outcome = RetryOutcome::default();
        let mut exhausted = Vec::new();

        for (event_id, pending) in self.pending.iter_mut() {
            if now.duration_since(pending.last_sent) < policy.delay_for(pending.attempts) {
                continue;
            }
            if pending.attempts > policy.max_retries {
                exhausted.push(event_id.clone());
                continue;
            }
            match self
                .sender
                .try_send(DeliveryMessage::Invalidation(pending.event.clone()))
            {
                Ok(()) => {
                    pending.attempts += 1;
                    pending.last_sent = now;
                    outcome.resent += 1;
                    metrics::record_delivery_retry();
                }
                Err(TrySendError::Full(_)) => {
                    pending.attempts += 1;
                    pending.last_sent = now;
                    metrics::record_delivery("full");
                }
                Err(TrySendError::Closed(_)) => {
                    outcome.closed = true;
                    break;
                }
            }
        }

        for event_id in exhausted {
            if let Some(pending) = self.pending.shift_remove(&event_id) {
                warn!(
                    connection_id = %self.id,
                    event_id = %event_id,
                    organization_id = %pending.event.organization_id,
                    attempts = pending.attempts,
                    "Delivery retries exhausted; dropping event"
                );
                metrics::record_delivery_dropped();
                outcome.dropped += 1;
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ripple_core::{Change, ChangeOperation};
    use std::time::Duration;

    fn event(requires_ack: bool) -> InvalidationEvent {
        let change =
            Change::new("posts", ChangeOperation::Create, vec![]).with_organization("o1");
        InvalidationEvent::from_change(&change, vec![], requires_ack)
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 1,
            delays: vec![Duration::from_secs(2)],
        }
    }

    #[tokio::test]
    async fn test_deliver_tracks_only_acked_events() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut conn = Connection::new("c1".into(), tx, 16);
        let now = Instant::now();

        conn.deliver(&event(true), now).unwrap();
        conn.deliver(&event(false), now).unwrap();
        assert_eq!(conn.pending_len(), 1);
        assert!(matches!(rx.recv().await, Some(DeliveryMessage::Invalidation(_))));
    }

    #[tokio::test]
    async fn test_acknowledge_is_idempotent() {
        let (tx, _rx) = mpsc::channel(8);
        let mut conn = Connection::new("c1".into(), tx, 16);
        let e = event(true);
        conn.deliver(&e, Instant::now()).unwrap();

        assert!(conn.acknowledge(&e.event_id));
        assert!(!conn.acknowledge(&e.event_id));
        assert!(!conn.acknowledge("never-sent"));
        assert_eq!(conn.last_acknowledged(), Some(e.event_id.as_str()));
    }

    #[tokio::test]
    async fn test_full_queue_keeps_event_pending_for_retry() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut conn = Connection::new("c1".into(), tx, 16);
        let now = Instant::now();

        let first = event(true);
        conn.deliver(&first, now).unwrap();
        let second = event(true);
        assert!(matches!(
            conn.deliver(&second, now),
            Err(DeliveryError::QueueFull(_))
        ));
        assert_eq!(conn.pending_len(), 2);

        rx.recv().await.unwrap();
        conn.acknowledge(&first.event_id);
        assert_eq!(conn.retry_due(now, &policy()).resent, 0);

        let outcome = conn.retry_due(now + Duration::from_secs(2), &policy());
        assert_eq!(outcome.resent, 1);
        match rx.recv().await {
            Some(DeliveryMessage::Invalidation(e)) => assert_eq!(e.event_id, second.event_id),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unread_queue_exhausts_retries() {
        let (tx, _rx) = mpsc::channel(1);
        let mut conn = Connection::new("c1".into(), tx, 16);
        let now = Instant::now();
        conn.deliver(&event(true), now).unwrap();
        assert!(conn.deliver(&event(true), now).is_err());

        // max_retries 1: one resend attempt on a full queue, then dropped
        let outcome = conn.retry_due(now + Duration::from_secs(2), &policy());
        assert_eq!((outcome.resent, outcome.dropped), (0, 0));
        assert_eq!(conn.pending_len(), 2);

        let outcome = conn.retry_due(now + Duration::from_secs(4), &policy());
        assert_eq!(outcome.dropped, 2);
        assert_eq!(conn.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_pending_set_is_capped() {
        let (tx, _rx) = mpsc::channel(1);
        let mut conn = Connection::new("c1".into(), tx, 2);
        let now = Instant::now();
        let events: Vec<_> = (0..3).map(|_| event(true)).collect();
        for e in &events {
            let _ = conn.deliver(e, now);
        }

        assert_eq!(conn.pending_len(), 2);
        assert!(!conn.acknowledge(&events[0].event_id));
        assert!(conn.acknowledge(&events[2].event_id));
    }

    #[tokio::test]
    async fn test_closed_receiver() {
        let (tx, rx) = mpsc::channel(1);
        let mut conn = Connection::new("c1".into(), tx, 16);
        drop(rx);
        assert!(matches!(
            conn.deliver(&event(true), Instant::now()),
            Err(DeliveryError::ConnectionClosed(_))
        ));
        assert_eq!(conn.pending_len(), 0);
    }
}
