use std::collections::VecDeque;
use std::time::Duration;

use ripple_core::InvalidationEvent;
use time::OffsetDateTime;
use tokio::time::Instant;

use super::{ResumeCursor, ResyncReason};

#[derive(Debug, Clone)]
pub(crate) struct BacklogEntry {
    pub seq: u64,
    pub recorded_at: Instant,
    pub event: InvalidationEvent,
}

#[derive(Debug)]
pub(crate) enum Replay {
    Events(Vec<BacklogEntry>),
    Gap(ResyncReason),
}

/// Bounded, time-boxed ring of recent events for one scope.
///
/// Remembers how far eviction has gone so that a cursor older than the
/// oldest retained event is reported as a gap instead of an empty replay.
#[derive(Debug)]
pub(crate) struct Backlog {
    entries: VecDeque<BacklogEntry>,
    capacity: usize,
    retention: Duration,
    evicted_seq: Option<u64>,
    evicted_through: Option<OffsetDateTime>,
}

impl Backlog {
    pub fn new(capacity: usize, retention: Duration) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(64)),
            capacity: capacity.max(1),
            retention,
            evicted_seq: None,
            evicted_through: None,
        }
    }

    pub fn push(&mut self, seq: u64, event: InvalidationEvent, now: Instant) {
        self.prune(now);
        while self.entries.len() >= self.capacity {
            self.evict_front();
        }
        self.entries.push_back(BacklogEntry {
            seq,
            recorded_at: now,
            event,
        });
    }

    pub fn prune(&mut self, now: Instant) {
        while self
            .entries
            .front()
            .is_some_and(|e| now.duration_since(e.recorded_at) > self.retention)
        {
            self.evict_front();
        }
    }

    fn evict_front(&mut self) {
        if let Some(entry) = self.entries.pop_front() {
            self.evicted_seq = Some(self.evicted_seq.map_or(entry.seq, |s| s.max(entry.seq)));
            self.evicted_through = Some(
                self.evicted_through
                    .map_or(entry.event.timestamp, |t| t.max(entry.event.timestamp)),
            );
        }
    }

    pub fn seq_of(&self, event_id: &str) -> Option<u64> {
        self.entries
            .iter()
            .find(|e| e.event.event_id == event_id)
            .map(|e| e.seq)
    }

    pub fn since_seq(&self, seq: u64) -> Replay {
        if self.evicted_seq.is_some_and(|evicted| evicted > seq) {
            return Replay::Gap(ResyncReason::BacklogExpired);
        }
        Replay::Events(
            self.entries
                .iter()
                .filter(|e| e.seq > seq)
                .cloned()
                .collect(),
        )
    }

    pub fn since_time(&self, since: OffsetDateTime) -> Replay {
        if self.evicted_through.is_some_and(|evicted| evicted > since) {
            return Replay::Gap(ResyncReason::BacklogExpired);
        }
        Replay::Events(
            self.entries
                .iter()
                .filter(|e| e.event.timestamp > since)
                .cloned()
                .collect(),
        )
    }

    pub fn latest_event_id(&self) -> Option<&str> {
        self.entries.back().map(|e| e.event.event_id.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Events after `cursor` from a scope's own ring and, for organization
/// scopes, the ring of global events.
pub(crate) fn resolve(cursor: &ResumeCursor, own: &Backlog, global: Option<&Backlog>) -> Replay {
    let (own_replay, global_replay) = match cursor {
        ResumeCursor::EventId(id) => {
            let seq = own
                .seq_of(id)
                .or_else(|| global.and_then(|g| g.seq_of(id)));
            let Some(seq) = seq else {
                return Replay::Gap(ResyncReason::UnknownEvent);
            };
            (own.since_seq(seq), global.map(|g| g.since_seq(seq)))
        }
        ResumeCursor::Timestamp(since) => (
            own.since_time(*since),
            global.map(|g| g.since_time(*since)),
        ),
    };

    let mut events = match own_replay {
        Replay::Events(events) => events,
        gap => return gap,
    };
    match global_replay {
        Some(Replay::Events(global_events)) => events.extend(global_events),
        Some(gap) => return gap,
        None => {}
    }
    events.sort_by_key(|e| e.seq);
    Replay::Events(events)
}
