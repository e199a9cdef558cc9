use std::time::Duration;

use tokio::sync::watch;

use super::DeliveryManager;

/// Background task that resends unacknowledged events on their backoff
/// schedule and prunes expired backlog entries.
pub struct RetrySweeper {
    manager: DeliveryManager,
    interval: Duration,
}

impl RetrySweeper {
    pub fn new(manager: DeliveryManager, interval: Duration) -> Self {
        Self {
            manager,
            interval: interval.max(Duration::from_millis(10)),
        }
    }

    /// Run until `shutdown` becomes true or its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            interval_ms = self.interval.as_millis() as u64,
            "Starting delivery retry sweeper"
        );

        loop {
            self.manager.sweep_once();

            tokio::select! {
                biased;

                result = shutdown.changed() => {
                    match result {
                        Ok(()) if *shutdown.borrow() => {
                            tracing::info!("Delivery retry sweeper shutting down");
                            break;
                        }
                        Ok(()) => {}
                        Err(_) => {
                            tracing::info!("Delivery retry sweeper shutdown channel closed");
                            break;
                        }
                    }
                }
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::{DeliveryConfig, DeliveryMessage, RetryPolicy};
    use ripple_core::{Change, ChangeOperation, InvalidationEvent};

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_resends_then_stops_on_shutdown() {
        let config = DeliveryConfig {
            retry: RetryPolicy {
                max_retries: 1,
                delays: vec![Duration::from_secs(2)],
            },
            sweep_interval: Duration::from_millis(500),
            ..DeliveryConfig::default()
        };
        let manager = DeliveryManager::new(config);
        let mut sub = manager.subscribe("org1", None);
        assert!(matches!(sub.recv().await, Some(DeliveryMessage::Ready { .. })));

        let change =
            Change::new("posts", ChangeOperation::Update, vec!["p1".into()]).with_organization("org1");
        let event = InvalidationEvent::from_change(&change, vec![], true);
        manager.broadcast(&event);
        assert!(matches!(sub.recv().await, Some(DeliveryMessage::Invalidation(_))));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = manager.spawn_retry_sweeper(shutdown_rx);

        match sub.recv().await {
            Some(DeliveryMessage::Invalidation(resent)) => assert_eq!(resent.event_id, event.event_id),
            other => panic!("expected resend, got {other:?}"),
        }

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(manager.pending_count(sub.connection_id()), Some(0));

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
