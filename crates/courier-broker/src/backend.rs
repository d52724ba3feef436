//! Pub/sub backend abstraction.
//!
//! Backends carry UTF-8 payloads between processes. The bridge treats the
//! publish and subscribe legs as separate connections so a broken one
//! cannot take down the other.

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::trace;

/// Capacity of a per-topic bus in the in-memory broker.
const MEMORY_TOPIC_CAPACITY: usize = 1024;

/// Broker errors.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The broker could not be reached after the retry budget was spent.
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    /// The bridge has been shut down.
    #[error("Broker bridge closed")]
    Closed,

    /// A backend operation failed.
    #[error("Broker backend error: {0}")]
    Backend(String),
}

/// An inbound pub/sub event.
#[derive(Debug, Clone)]
pub struct BrokerEvent {
    /// Topic the payload arrived on.
    pub topic: String,
    /// UTF-8 payload.
    pub payload: String,
}

/// An open subscriber connection.
///
/// One subscriber covers every topic it was opened with; the bridge opens
/// a fresh subscriber on every (re)connect.
#[async_trait]
pub trait Subscriber: Send {
    /// Receive the next event.
    ///
    /// Returns `None` if the connection closed cleanly.
    async fn next_event(&mut self) -> Result<Option<BrokerEvent>, BrokerError>;
}

/// A publish/subscribe transport.
#[async_trait]
pub trait PubSubBackend: Send + Sync {
    /// Publish a payload to a topic.
    ///
    /// Returns the number of subscriber connections that received it.
    async fn publish(&self, topic: &str, payload: &str) -> Result<usize, BrokerError>;

    /// Open a subscriber connection covering the given topics.
    async fn subscribe(&self, topics: &[String]) -> Result<Box<dyn Subscriber>, BrokerError>;

    /// Get the backend name (e.g., "redis", "memory").
    fn name(&self) -> &'static str;
}

/// In-memory broker for tests and single-process deployments.
///
/// Each topic is a broadcast bus; subscriber connections forward their
/// buses into a single event queue.
#[derive(Debug, Default)]
pub struct MemoryBroker {
    topics: DashMap<String, broadcast::Sender<String>>,
}

impl MemoryBroker {
    /// Create an empty in-memory broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn bus(&self, topic: &str) -> broadcast::Sender<String> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(MEMORY_TOPIC_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl PubSubBackend for MemoryBroker {
    async fn publish(&self, topic: &str, payload: &str) -> Result<usize, BrokerError> {
        let delivered = self.bus(topic).send(payload.to_string()).unwrap_or(0);
        trace!(topic = %topic, delivered, "Published to memory broker");
        Ok(delivered)
    }

    async fn subscribe(&self, topics: &[String]) -> Result<Box<dyn Subscriber>, BrokerError> {
        let (tx, rx) = mpsc::unbounded_channel();

        for topic in topics {
            let mut bus_rx = self.bus(topic).subscribe();
            let topic = topic.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                loop {
                    match bus_rx.recv().await {
                        Ok(payload) => {
                            let event = BrokerEvent {
                                topic: topic.clone(),
                                payload,
                            };
                            if tx.send(event).is_err() {
                                break; // Subscriber dropped
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    }
                }
            });
        }

        Ok(Box::new(MemorySubscriber { rx }))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Subscriber half of the in-memory broker.
struct MemorySubscriber {
    rx: mpsc::UnboundedReceiver<BrokerEvent>,
}

#[async_trait]
impl Subscriber for MemorySubscriber {
    async fn next_event(&mut self) -> Result<Option<BrokerEvent>, BrokerError> {
        Ok(self.rx.recv().await)
    }
}
