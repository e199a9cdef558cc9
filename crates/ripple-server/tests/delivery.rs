use std::time::Duration;

use ripple_core::{Change, ChangeOperation, InvalidationEvent};
use ripple_server::delivery::{DeliveryConfig, DeliveryMessage, ResumeCursor, ResyncReason};
use ripple_server::{DeliveryManager, Subscription};

fn event(org: Option<&str>) -> InvalidationEvent {
    let mut change = Change::new("posts", ChangeOperation::Update, vec!["p1".into()]);
    if let Some(org) = org {
        change = change.with_organization(org);
    }
    InvalidationEvent::from_change(&change, vec!["posts.getAll:{}".into()], true)
}

/// Every invalidation event id currently queued for the subscriber.
fn drain(subscription: &mut Subscription) -> Vec<String> {
    let mut ids = Vec::new();
    while let Some(message) = subscription.try_recv() {
        if let DeliveryMessage::Invalidation(event) = message {
            ids.push(event.event_id);
        }
    }
    ids
}

async fn advance_and_sweep(manager: &DeliveryManager, by: Duration) {
    tokio::time::advance(by).await;
    manager.sweep_once();
}

#[tokio::test(start_paused = true)]
async fn unacknowledged_event_is_resent_on_schedule_then_dropped() {
    // defaults: 3 retries, delays 2s, 5s, 10s
    let manager = DeliveryManager::new(DeliveryConfig::default());
    let mut sub = manager.subscribe("org1", None);
    let e = event(Some("org1"));
    manager.broadcast(&e);
    assert_eq!(drain(&mut sub), vec![e.event_id.clone()]);

    advance_and_sweep(&manager, Duration::from_millis(1900)).await;
    assert!(drain(&mut sub).is_empty());

    advance_and_sweep(&manager, Duration::from_millis(100)).await;
    assert_eq!(drain(&mut sub), vec![e.event_id.clone()]);

    advance_and_sweep(&manager, Duration::from_secs(5)).await;
    assert_eq!(drain(&mut sub), vec![e.event_id.clone()]);

    advance_and_sweep(&manager, Duration::from_secs(10)).await;
    assert_eq!(drain(&mut sub), vec![e.event_id.clone()]);
    assert_eq!(manager.pending_count(sub.connection_id()), Some(1));

    let report = {
        tokio::time::advance(Duration::from_secs(10)).await;
        manager.sweep_once()
    };
    assert_eq!(report.dropped, 1);
    assert!(drain(&mut sub).is_empty());
    assert_eq!(manager.pending_count(sub.connection_id()), Some(0));
}

#[tokio::test(start_paused = true)]
async fn acknowledged_event_is_not_redelivered() {
    let manager = DeliveryManager::new(DeliveryConfig::default());
    let mut sub = manager.subscribe("org1", None);
    let e = event(Some("org1"));
    manager.broadcast(&e);
    drain(&mut sub);

    assert_eq!(manager.acknowledge(&e.event_id), 1);
    assert_eq!(manager.acknowledge(&e.event_id), 0);
    assert!(
        manager
            .acknowledge_connection(sub.connection_id(), &e.event_id)
            .is_ok_and(|removed| !removed)
    );

    advance_and_sweep(&manager, Duration::from_secs(30)).await;
    assert!(drain(&mut sub).is_empty());
}

#[tokio::test]
async fn reconnect_backfills_missed_events_before_ready() {
    let manager = DeliveryManager::new(DeliveryConfig::default());
    let mut sub = manager.subscribe("org1", None);
    let seen = event(Some("org1"));
    manager.broadcast(&seen);
    assert_eq!(drain(&mut sub), vec![seen.event_id.clone()]);
    drop(sub);
    assert_eq!(manager.connection_count(), 0);

    let missed = [event(Some("org1")), event(Some("org1"))];
    for e in &missed {
        assert_eq!(manager.broadcast(e), 0);
    }
    let unrelated = event(Some("org2"));
    manager.broadcast(&unrelated);

    let mut sub = manager.subscribe("org1", Some(ResumeCursor::EventId(seen.event_id.clone())));
    let mut replayed = Vec::new();
    loop {
        match sub.try_recv() {
            Some(DeliveryMessage::Invalidation(e)) => replayed.push(e.event_id),
            Some(DeliveryMessage::Ready { replayed: count, .. }) => {
                assert_eq!(count, 2);
                break;
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }
    assert_eq!(
        replayed,
        missed.iter().map(|e| e.event_id.clone()).collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn reconnect_past_the_backlog_requires_resync() {
    let config = DeliveryConfig {
        backlog_capacity: 2,
        ..DeliveryConfig::default()
    };
    let manager = DeliveryManager::new(config);
    let seen = event(Some("org1"));
    manager.broadcast(&seen);
    for _ in 0..3 {
        manager.broadcast(&event(Some("org1")));
    }

    let mut sub = manager.subscribe("org1", Some(ResumeCursor::EventId(seen.event_id.clone())));
    assert_eq!(
        sub.try_recv(),
        Some(DeliveryMessage::Resync {
            reason: ResyncReason::UnknownEvent
        })
    );
    assert!(matches!(
        sub.try_recv(),
        Some(DeliveryMessage::Ready { replayed: 0, .. })
    ));

    let poll = manager.events_since("org1", &ResumeCursor::EventId(seen.event_id));
    assert!(poll.resync_required);
}

#[tokio::test]
async fn global_events_are_replayed_to_every_organization() {
    let manager = DeliveryManager::new(DeliveryConfig::default());
    let seen = event(Some("org1"));
    manager.broadcast(&seen);
    let global = event(None);
    manager.broadcast(&global);

    let poll = manager.events_since("org1", &ResumeCursor::EventId(seen.event_id.clone()));
    assert!(!poll.resync_required);
    assert_eq!(poll.events.len(), 1);
    assert_eq!(poll.events[0].event_id, global.event_id);
    assert!(poll.events[0].is_global());
}

#[tokio::test(start_paused = true)]
async fn slow_subscriber_does_not_block_others() {
    let config = DeliveryConfig {
        channel_capacity: 2,
        ..DeliveryConfig::default()
    };
    let manager = DeliveryManager::new(config);
    let slow = manager.subscribe("org1", None);
    let mut fast = manager.subscribe("org1", None);

    let events: Vec<_> = (0..5).map(|_| event(Some("org1"))).collect();
    for e in &events {
        manager.broadcast(e);
        assert!(!drain(&mut fast).is_empty());
    }
    assert_eq!(manager.pending_count(slow.connection_id()), Some(5));

    // 2s + 5s + 10s of resends, then the budget is spent
    for _ in 0..60 {
        advance_and_sweep(&manager, Duration::from_millis(500)).await;
    }
    assert_eq!(manager.pending_count(slow.connection_id()), Some(0));
    assert_eq!(manager.connection_count_for("org1"), 2);
}

#[tokio::test(start_paused = true)]
async fn unread_subscriber_pending_set_is_bounded() {
    let config = DeliveryConfig {
        channel_capacity: 2,
        max_pending: 50,
        ..DeliveryConfig::default()
    };
    let manager = DeliveryManager::new(config);
    let slow = manager.subscribe("org1", None);

    for _ in 0..200 {
        manager.broadcast(&event(Some("org1")));
    }
    assert_eq!(manager.pending_count(slow.connection_id()), Some(50));

    for _ in 0..600 {
        advance_and_sweep(&manager, Duration::from_millis(500)).await;
    }
    assert_eq!(manager.pending_count(slow.connection_id()), Some(0));
}
