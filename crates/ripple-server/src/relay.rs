//! Redis pub/sub relay for multi-instance deployments.
//!
//! Every invalidation event produced on this instance is published to a Redis
//! channel, tagged with this instance's id. Every instance subscribes to the
//! channel and re-broadcasts events from other instances to its own
//! subscribers. Cache eviction is not repeated on the receiving side: the
//! shared cache was already evicted by the producing instance.

use std::sync::Arc;
use std::time::Duration;

use deadpool_redis::redis::{AsyncCommands, Client};
use deadpool_redis::{Pool, Runtime};
use futures_util::StreamExt;
use ripple_core::InvalidationEvent;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::RedisSettings;
use crate::delivery::DeliveryManager;

/// Default pub/sub channel for invalidation events.
pub const DEFAULT_RELAY_CHANNEL: &str = "ripple:invalidations";

const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Wire format on the relay channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayEnvelope {
    /// Id of the publishing instance
    pub origin: String,
    pub event: InvalidationEvent,
}

/// Errors that can occur while relaying.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Redis pool error: {0}")]
    Pool(String),

    #[error("Redis connection error: {0}")]
    Connection(String),

    #[error("Redis subscribe error: {0}")]
    Subscribe(String),

    #[error("Redis publish error: {0}")]
    Publish(String),

    #[error("Redis message error: {0}")]
    Message(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Redis operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Redis pub/sub stream ended")]
    StreamEnded,
}

/// Build a connection pool for the relay from the cache Redis settings.
pub fn create_pool(settings: &RedisSettings) -> Result<Pool, RelayError> {
    let mut redis_config = deadpool_redis::Config::from_url(&settings.url);
    if let Some(ref mut pool_config) = redis_config.pool {
        pool_config.max_size = settings.pool_size;
        pool_config.timeouts.wait = Some(settings.timeout());
        pool_config.timeouts.create = Some(settings.timeout());
    }
    redis_config
        .create_pool(Some(Runtime::Tokio1))
        .map_err(|e| RelayError::Pool(e.to_string()))
}

pub struct RedisEventRelay {
    pool: Pool,
    redis_url: String,
    channel: String,
    instance_id: String,
    timeout: Duration,
    delivery: DeliveryManager,
}

impl RedisEventRelay {
    pub fn new(
        pool: Pool,
        settings: &RedisSettings,
        channel: impl Into<String>,
        delivery: DeliveryManager,
    ) -> Self {
        Self {
            pool,
            redis_url: settings.url.clone(),
            channel: channel.into(),
            instance_id: uuid::Uuid::new_v4().to_string(),
            timeout: settings.timeout(),
            delivery,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Publish a locally produced event for the other instances.
    pub async fn publish(&self, event: &InvalidationEvent) -> Result<(), RelayError> {
        let message = serde_json::to_string(&RelayEnvelope {
            origin: self.instance_id.clone(),
            event: event.clone(),
        })
        .map_err(|e| RelayError::Serialization(e.to_string()))?;

        let publish = async {
            let mut conn = self
                .pool
                .get()
                .await
                .map_err(|e| RelayError::Pool(e.to_string()))?;
            let _: () = conn
                .publish(&self.channel, &message)
                .await
                .map_err(|e| RelayError::Publish(e.to_string()))?;
            Ok::<_, RelayError>(())
        };
        tokio::time::timeout(self.timeout, publish)
            .await
            .map_err(|_| RelayError::Timeout(self.timeout))??;

        debug!(
            event_id = %event.event_id,
            organization_id = %event.organization_id,
            "Published event to relay"
        );
        Ok(())
    }

    /// Decode one relay payload and re-broadcast it locally.
    ///
    /// Returns false for our own events and for payloads that do not decode.
    pub fn handle_payload(&self, payload: &str) -> bool {
        let envelope = match serde_json::from_str::<RelayEnvelope>(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, payload = %payload, "Failed to decode relay event");
                return false;
            }
        };
        if envelope.origin == self.instance_id {
            return false;
        }
        debug!(
            event_id = %envelope.event.event_id,
            origin = %envelope.origin,
            "Received event from relay"
        );
        self.delivery.broadcast(&envelope.event);
        true
    }

    /// Subscribe and forward until `shutdown` turns true, reconnecting with
    /// exponential backoff.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(channel = %self.channel, instance_id = %self.instance_id, "Starting event relay");
        let mut backoff = Duration::from_secs(1);

        loop {
            tokio::select! {
                biased;

                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        info!("Event relay shutting down");
                        return;
                    }
                }
                result = self.subscribe_loop() => {
                    match result {
                        Ok(()) => backoff = Duration::from_secs(1),
                        Err(e) => {
                            error!(
                                error = %e,
                                backoff_secs = backoff.as_secs(),
                                "Event relay error, reconnecting"
                            );
                            tokio::select! {
                                _ = shutdown.changed() => {
                                    if *shutdown.borrow() {
                                        info!("Event relay shutting down");
                                        return;
                                    }
                                }
                                _ = tokio::time::sleep(backoff) => {}
                            }
                            backoff = (backoff * 2).min(MAX_BACKOFF);
                        }
                    }
                }
            }
        }
    }

    async fn subscribe_loop(&self) -> Result<(), RelayError> {
        // Pooled connections cannot SUBSCRIBE
        let client = Client::open(self.redis_url.as_str())
            .map_err(|e| RelayError::Connection(e.to_string()))?;

        let mut pubsub = tokio::time::timeout(self.timeout, client.get_async_pubsub())
            .await
            .map_err(|_| RelayError::Timeout(self.timeout))?
            .map_err(|e| RelayError::Connection(e.to_string()))?;

        pubsub
            .subscribe(&self.channel)
            .await
            .map_err(|e| RelayError::Subscribe(e.to_string()))?;

        info!(channel = %self.channel, "Subscribed to relay channel");

        let mut stream = pubsub.on_message();
        while let Some(msg) = stream.next().await {
            let payload: String = msg
                .get_payload()
                .map_err(|e| RelayError::Message(e.to_string()))?;
            self.handle_payload(&payload);
        }

        warn!("Relay pub/sub stream ended");
        Err(RelayError::StreamEnded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::{DeliveryConfig, DeliveryMessage};
    use ripple_core::{Change, ChangeOperation};

    fn relay(delivery: DeliveryManager) -> RedisEventRelay {
        let settings = RedisSettings {
            url: "redis://127.0.0.1:6390".into(),
            ..RedisSettings::default()
        };
        let pool = create_pool(&settings).unwrap();
        RedisEventRelay::new(pool, &settings, DEFAULT_RELAY_CHANNEL, delivery)
    }

    fn event() -> InvalidationEvent {
        let change =
            Change::new("posts", ChangeOperation::Create, vec!["p1".into()]).with_organization("org1");
        InvalidationEvent::from_change(&change, vec!["posts.getAll:{}".into()], true)
    }

    #[tokio::test]
    async fn test_foreign_events_are_rebroadcast() {
        let delivery = DeliveryManager::new(DeliveryConfig::default());
        let mut sub = delivery.subscribe("org1", None);
        assert!(matches!(sub.try_recv(), Some(DeliveryMessage::Ready { .. })));

        let relay = relay(delivery);
        let e = event();
        let payload = serde_json::to_string(&RelayEnvelope {
            origin: "other-instance".into(),
            event: e.clone(),
        })
        .unwrap();

        assert!(relay.handle_payload(&payload));
        match sub.try_recv() {
            Some(DeliveryMessage::Invalidation(got)) => assert_eq!(got.event_id, e.event_id),
            other => panic!("expected invalidation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_own_and_malformed_payloads_are_ignored() {
        let delivery = DeliveryManager::new(DeliveryConfig::default());
        let relay = relay(delivery.clone());
        let own = serde_json::to_string(&RelayEnvelope {
            origin: relay.instance_id().to_string(),
            event: event(),
        })
        .unwrap();

        assert!(!relay.handle_payload(&own));
        assert!(!relay.handle_payload("not json"));
        assert_eq!(delivery.backlog_len("org1"), 0);
    }
}
