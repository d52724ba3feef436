//! Redis pub/sub backend.
//!
//! The publish leg runs over a [`ConnectionManager`], which re-establishes
//! dropped connections internally; the subscribe leg opens a dedicated
//! pub/sub connection per bridge (re)connect, keeping the two failure
//! domains independent.

use crate::backend::{BrokerError, BrokerEvent, PubSubBackend, Subscriber};
use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use tracing::info;

/// Redis-backed pub/sub transport.
#[derive(Clone)]
pub struct RedisBroker {
    publisher: ConnectionManager,
    client: redis::Client,
}

impl RedisBroker {
    /// Connect to Redis at `url` (e.g., `redis://127.0.0.1:6379`).
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Unavailable`] if the publisher connection
    /// cannot be established.
    pub async fn connect(url: &str) -> Result<Self, BrokerError> {
        let client =
            redis::Client::open(url).map_err(|e| BrokerError::Backend(e.to_string()))?;
        let publisher = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| BrokerError::Unavailable(e.to_string()))?;

        info!(url = %url, "Broker Redis connection established");
        Ok(Self { publisher, client })
    }
}

#[async_trait]
impl PubSubBackend for RedisBroker {
    async fn publish(&self, topic: &str, payload: &str) -> Result<usize, BrokerError> {
        let mut conn = self.publisher.clone();
        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(topic)
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| BrokerError::Backend(e.to_string()))?;
        Ok(receivers as usize)
    }

    async fn subscribe(&self, topics: &[String]) -> Result<Box<dyn Subscriber>, BrokerError> {
        let conn = self
            .client
            .get_async_connection()
            .await
            .map_err(|e| BrokerError::Unavailable(e.to_string()))?;
        let mut pubsub = conn.into_pubsub();

        for topic in topics {
            pubsub
                .subscribe(topic)
                .await
                .map_err(|e| BrokerError::Backend(e.to_string()))?;
        }

        Ok(Box::new(RedisSubscriber { pubsub }))
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

/// Subscriber half of the Redis backend.
struct RedisSubscriber {
    pubsub: redis::aio::PubSub,
}

#[async_trait]
impl Subscriber for RedisSubscriber {
    async fn next_event(&mut self) -> Result<Option<BrokerEvent>, BrokerError> {
        let Some(msg) = self.pubsub.on_message().next().await else {
            return Ok(None);
        };

        let payload = msg
            .get_payload::<String>()
            .map_err(|e| BrokerError::Backend(e.to_string()))?;

        Ok(Some(BrokerEvent {
            topic: msg.get_channel_name().to_string(),
            payload,
        }))
    }
}
