use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use dashmap::DashMap;
use futures_util::Stream;
use indexmap::IndexMap;
use parking_lot::Mutex;
use ripple_core::{GLOBAL_SCOPE, InvalidationEvent, generate_connection_id};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use super::backlog::{Backlog, Replay, resolve};
use super::connection::Connection;
use super::sweeper::RetrySweeper;
use super::{DeliveryConfig, DeliveryError, DeliveryMessage, PollResult, ResumeCursor};
use crate::metrics;

/// State of one organization scope. Guarded by its own lock, so broadcasts
/// to one organization are serialized and reach every connection in the
/// order they were produced.
struct OrgState {
    connections: IndexMap<String, Connection>,
    backlog: Backlog,
}

impl OrgState {
    fn new(config: &DeliveryConfig) -> Self {
        Self {
            connections: IndexMap::new(),
            backlog: Backlog::new(config.backlog_capacity, config.backlog_retention),
        }
    }

    /// Push to every connection. Returns the number reached and the ids of
    /// connections found closed, which are removed.
    fn deliver(&mut self, event: &InvalidationEvent, now: Instant) -> (usize, Vec<String>) {
        let mut delivered = 0;
        let mut closed = Vec::new();
        for connection in self.connections.values_mut() {
            match connection.deliver(event, now) {
                Ok(()) => {
                    delivered += 1;
                    metrics::record_delivery("sent");
                }
                Err(DeliveryError::QueueFull(id)) => {
                    debug!(connection_id = %id, event_id = %event.event_id, "outbound queue full; will retry");
                    metrics::record_delivery("full");
                }
                Err(DeliveryError::ConnectionClosed(id)) => {
                    metrics::record_delivery("closed");
                    closed.push(id);
                }
                Err(DeliveryError::ConnectionNotFound(_)) => {}
            }
        }
        for id in &closed {
            self.connections.shift_remove(id);
        }
        (delivered, closed)
    }
}

struct Inner {
    config: DeliveryConfig,
    orgs: DashMap<String, Arc<Mutex<OrgState>>>,
    /// connection id -> organization id
    connections: DashMap<String, String>,
    sequence: AtomicU64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub resent: usize,
    pub dropped: usize,
    pub closed: usize,
}

/// Fan-out of invalidation events to subscribers, per organization.
#[derive(Clone)]
pub struct DeliveryManager {
    inner: Arc<Inner>,
}

impl DeliveryManager {
    pub fn new(config: DeliveryConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                orgs: DashMap::new(),
                connections: DashMap::new(),
                sequence: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &DeliveryConfig {
        &self.inner.config
    }

    fn org(&self, organization_id: &str) -> Arc<Mutex<OrgState>> {
        self.inner
            .orgs
            .entry(organization_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(OrgState::new(&self.inner.config))))
            .clone()
    }

    fn existing_org(&self, organization_id: &str) -> Option<Arc<Mutex<OrgState>>> {
        self.inner
            .orgs
            .get(organization_id)
            .map(|entry| entry.value().clone())
    }

    fn all_orgs(&self) -> Vec<(String, Arc<Mutex<OrgState>>)> {
        self.inner
            .orgs
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    fn forget_connections(&self, closed: Vec<String>) {
        for id in closed {
            if self.inner.connections.remove(&id).is_some() {
                metrics::decrement_connections();
                debug!(connection_id = %id, "removed closed connection");
            }
        }
    }

    /// Register a connection under an organization.
    ///
    /// With a resume cursor, events after the cursor are queued first, or a
    /// `Resync` if they can no longer be replayed. `Ready` always follows.
    /// All of this happens under the organization lock, so no event produced
    /// meanwhile is skipped.
    pub fn subscribe(&self, organization_id: &str, resume: Option<ResumeCursor>) -> Subscription {
        let connection_id = generate_connection_id();
        let now = Instant::now();
        let org = self.org(organization_id);
        let mut state = org.lock();
        state.backlog.prune(now);

        let replay = match &resume {
            None => Replay::Events(Vec::new()),
            Some(cursor) => {
                let global = if organization_id == GLOBAL_SCOPE {
                    None
                } else {
                    self.existing_org(GLOBAL_SCOPE)
                };
                let mut global_state = global.as_ref().map(|g| g.lock());
                if let Some(g) = global_state.as_mut() {
                    g.backlog.prune(now);
                }
                resolve(cursor, &state.backlog, global_state.as_ref().map(|g| &g.backlog))
            }
        };

        let replay_len = match &replay {
            Replay::Events(events) => events.len(),
            Replay::Gap(_) => 0,
        };
        let capacity = self.inner.config.channel_capacity.max(replay_len + 2);
        let (sender, receiver) = mpsc::channel(capacity);
        let mut connection = Connection::new(connection_id.clone(), sender, self.inner.config.max_pending);

        let replayed = match replay {
            Replay::Events(events) => {
                for entry in &events {
                    let _ = connection.deliver(&entry.event, now);
                    metrics::record_delivery("replayed");
                }
                events.len()
            }
            Replay::Gap(reason) => {
                info!(
                    organization_id = %organization_id,
                    reason = ?reason,
                    "Reconnecting subscriber must resync"
                );
                let _ = connection.send(DeliveryMessage::Resync { reason });
                0
            }
        };
        let _ = connection.send(DeliveryMessage::Ready {
            connection_id: connection_id.clone(),
            replayed,
        });

        state.connections.insert(connection_id.clone(), connection);
        self.inner
            .connections
            .insert(connection_id.clone(), organization_id.to_string());
        drop(state);

        metrics::increment_connections();
        info!(
            connection_id = %connection_id,
            organization_id = %organization_id,
            replayed,
            "Subscriber connected"
        );

        Subscription {
            connection_id: connection_id.clone(),
            organization_id: organization_id.to_string(),
            receiver,
            _guard: SubscriptionGuard {
                manager: Arc::downgrade(&self.inner),
                connection_id,
            },
        }
    }

    /// Remove a connection and discard its pending set.
    pub fn unsubscribe(&self, connection_id: &str) -> bool {
        let Some((_, organization_id)) = self.inner.connections.remove(connection_id) else {
            return false;
        };
        let removed = self
            .existing_org(&organization_id)
            .and_then(|org| org.lock().connections.shift_remove(connection_id));

        match removed {
            Some(connection) => {
                metrics::decrement_connections();
                info!(
                    connection_id = %connection_id,
                    organization_id = %organization_id,
                    discarded_pending = connection.pending_len(),
                    "Subscriber disconnected"
                );
                true
            }
            None => false,
        }
    }

    /// Record an event in its organization's backlog and push it to every
    /// live connection. Global events reach every organization.
    ///
    /// Returns the number of connections the event was handed to.
    pub fn broadcast(&self, event: &InvalidationEvent) -> usize {
        let now = Instant::now();
        let mut delivered = 0;
        let mut closed = Vec::new();

        {
            let org = self.org(&event.organization_id);
            let mut state = org.lock();
            let seq = self.inner.sequence.fetch_add(1, Ordering::SeqCst) + 1;
            state.backlog.push(seq, event.clone(), now);
            let (count, gone) = state.deliver(event, now);
            delivered += count;
            closed.extend(gone);
        }

        if event.is_global() {
            for (organization_id, org) in self.all_orgs() {
                if organization_id == GLOBAL_SCOPE {
                    continue;
                }
                let (count, gone) = org.lock().deliver(event, now);
                delivered += count;
                closed.extend(gone);
            }
        }

        self.forget_connections(closed);
        debug!(
            event_id = %event.event_id,
            organization_id = %event.organization_id,
            source = %event.source_name,
            delivered,
            "Broadcast invalidation event"
        );
        delivered
    }

    /// Retire an event on every connection holding it.
    ///
    /// Returns how many pending entries were removed; zero for duplicates.
    pub fn acknowledge(&self, event_id: &str) -> usize {
        let mut removed = 0;
        for (_, org) in self.all_orgs() {
            let mut state = org.lock();
            for connection in state.connections.values_mut() {
                if connection.acknowledge(event_id) {
                    removed += 1;
                }
            }
        }
        debug!(event_id = %event_id, removed, "Acknowledged event");
        removed
    }

    /// Retire an event on one connection.
    pub fn acknowledge_connection(
        &self,
        connection_id: &str,
        event_id: &str,
    ) -> Result<bool, DeliveryError> {
        let organization_id = self
            .inner
            .connections
            .get(connection_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| DeliveryError::ConnectionNotFound(connection_id.to_string()))?;
        let org = self
            .existing_org(&organization_id)
            .ok_or_else(|| DeliveryError::ConnectionNotFound(connection_id.to_string()))?;
        let mut state = org.lock();
        let connection = state
            .connections
            .get_mut(connection_id)
            .ok_or_else(|| DeliveryError::ConnectionNotFound(connection_id.to_string()))?;
        Ok(connection.acknowledge(event_id))
    }

    /// One pass of the retry schedule over every connection.
    pub fn sweep_once(&self) -> SweepReport {
        let now = Instant::now();
        let mut report = SweepReport::default();
        let mut closed = Vec::new();

        for (_, org) in self.all_orgs() {
            let mut state = org.lock();
            state.backlog.prune(now);
            let mut gone = Vec::new();
            for connection in state.connections.values_mut() {
                let outcome = connection.retry_due(now, &self.inner.config.retry);
                report.resent += outcome.resent;
                report.dropped += outcome.dropped;
                if outcome.closed {
                    gone.push(connection.id.clone());
                }
            }
            for id in &gone {
                state.connections.shift_remove(id);
            }
            report.closed += gone.len();
            closed.extend(gone);
        }

        self.forget_connections(closed);
        if report != SweepReport::default() {
            debug!(
                resent = report.resent,
                dropped = report.dropped,
                closed = report.closed,
                "Delivery sweep"
            );
        }
        report
    }

    /// Events for an organization after `cursor`, for clients without a
    /// live connection.
    pub fn events_since(&self, organization_id: &str, cursor: &ResumeCursor) -> PollResult {
        let now = Instant::now();
        let own = self.existing_org(organization_id);
        let global = if organization_id == GLOBAL_SCOPE {
            None
        } else {
            self.existing_org(GLOBAL_SCOPE)
        };

        let mut own_state = own.as_ref().map(|o| o.lock());
        let mut global_state = global.as_ref().map(|g| g.lock());
        if let Some(s) = own_state.as_mut() {
            s.backlog.prune(now);
        }
        if let Some(g) = global_state.as_mut() {
            g.backlog.prune(now);
        }

        let empty = Backlog::new(1, self.inner.config.backlog_retention);
        let own_backlog = own_state.as_ref().map_or(&empty, |s| &s.backlog);
        let global_backlog = global_state.as_ref().map(|g| &g.backlog);

        let latest_event_id = own_backlog
            .latest_event_id()
            .or_else(|| global_backlog.and_then(|g| g.latest_event_id()))
            .map(str::to_string);

        match resolve(cursor, own_backlog, global_backlog) {
            Replay::Events(entries) => PollResult {
                events: entries.into_iter().map(|e| e.event).collect(),
                resync_required: false,
                latest_event_id,
            },
            Replay::Gap(_) => PollResult {
                events: Vec::new(),
                resync_required: true,
                latest_event_id,
            },
        }
    }

    /// Start the background retry sweep; it stops when `shutdown` turns true
    /// or its sender is dropped.
    pub fn spawn_retry_sweeper(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let sweeper = RetrySweeper::new(self.clone(), self.inner.config.sweep_interval);
        tokio::spawn(sweeper.run(shutdown))
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    pub fn connection_count_for(&self, organization_id: &str) -> usize {
        self.existing_org(organization_id)
            .map_or(0, |org| org.lock().connections.len())
    }

    /// Last event id the connection acknowledged, if any.
    pub fn last_acknowledged(&self, connection_id: &str) -> Option<String> {
        let organization_id = self
            .inner
            .connections
            .get(connection_id)
            .map(|entry| entry.value().clone())?;
        let org = self.existing_org(&organization_id)?;
        let state = org.lock();
        state
            .connections
            .get(connection_id)
            .and_then(|c| c.last_acknowledged().map(str::to_string))
    }

    /// Pending (unacknowledged) events of a connection.
    pub fn pending_count(&self, connection_id: &str) -> Option<usize> {
        let organization_id = self
            .inner
            .connections
            .get(connection_id)
            .map(|entry| entry.value().clone())?;
        let org = self.existing_org(&organization_id)?;
        let state = org.lock();
        state.connections.get(connection_id).map(Connection::pending_len)
    }

    pub fn backlog_len(&self, organization_id: &str) -> usize {
        self.existing_org(organization_id)
            .map_or(0, |org| org.lock().backlog.len())
    }
}

/// Unsubscribes its connection when dropped.
struct SubscriptionGuard {
    manager: Weak<Inner>,
    connection_id: String,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if let Some(inner) = self.manager.upgrade() {
            DeliveryManager { inner }.unsubscribe(&self.connection_id);
        }
    }
}

/// A live subscription. Dropping it unsubscribes.
pub struct Subscription {
    connection_id: String,
    organization_id: String,
    receiver: mpsc::Receiver<DeliveryMessage>,
    _guard: SubscriptionGuard,
}

impl Subscription {
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn organization_id(&self) -> &str {
        &self.organization_id
    }

    pub async fn recv(&mut self) -> Option<DeliveryMessage> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<DeliveryMessage> {
        self.receiver.try_recv().ok()
    }
}

impl Stream for Subscription {
    type Item = DeliveryMessage;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().receiver.poll_recv(cx)
    }
}
