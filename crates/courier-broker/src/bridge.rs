//! The broker bridge.
//!
//! Owns the process's two broker connections: the publish leg (driven by
//! callers) and the subscribe leg (a background task that routes inbound
//! payloads to per-topic handlers). Either leg failing triggers retry or
//! reconnect with capped exponential backoff, never an error on the other
//! leg.

use crate::backend::{BrokerError, PubSubBackend};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Handler invoked with the raw payload of each inbound event on a topic.
pub type TopicHandler = Arc<dyn Fn(String) + Send + Sync>;

/// Bridge configuration.
#[derive(Debug, Clone)]
pub struct BrokerBridgeConfig {
    /// Total time budget for a single `publish` call, retries included.
    pub publish_deadline: Duration,
    /// First retry delay.
    pub backoff_base: Duration,
    /// Upper bound on a retry delay.
    pub backoff_cap: Duration,
}

impl Default for BrokerBridgeConfig {
    fn default() -> Self {
        Self {
            publish_deadline: Duration::from_secs(5),
            backoff_base: Duration::from_millis(50),
            backoff_cap: Duration::from_secs(2),
        }
    }
}

/// Capped exponential backoff.
#[derive(Debug, Clone)]
struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempt: 0,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let factor = 1u32 << self.attempt.min(16);
        let delay = self.base.saturating_mul(factor).min(self.cap);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Cross-process pub/sub bridge.
///
/// One instance per process, shared by every session and dispatcher.
/// Sessions must not close or mutate the underlying connections; lifecycle
/// is owned here and ends with [`BrokerBridge::shutdown`].
pub struct BrokerBridge {
    backend: Arc<dyn PubSubBackend>,
    handlers: Arc<DashMap<String, TopicHandler>>,
    topics_tx: mpsc::UnboundedSender<String>,
    shutdown_tx: watch::Sender<bool>,
    subscriber_task: Mutex<Option<JoinHandle<()>>>,
    config: BrokerBridgeConfig,
}

impl BrokerBridge {
    /// Create a bridge and start its subscriber task.
    #[must_use]
    pub fn new(backend: Arc<dyn PubSubBackend>, config: BrokerBridgeConfig) -> Self {
        let handlers: Arc<DashMap<String, TopicHandler>> = Arc::new(DashMap::new());
        let (topics_tx, topics_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(subscriber_loop(
            backend.clone(),
            handlers.clone(),
            topics_rx,
            shutdown_rx,
            Backoff::new(config.backoff_base, config.backoff_cap),
        ));

        info!(backend = backend.name(), "Broker bridge started");

        Self {
            backend,
            handlers,
            topics_tx,
            shutdown_tx,
            subscriber_task: Mutex::new(Some(task)),
            config,
        }
    }

    /// Publish a payload to a topic, retrying until the deadline.
    ///
    /// Returns the number of subscriber connections that received it.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Unavailable`] once the retry budget is
    /// exhausted and [`BrokerError::Closed`] after shutdown.
    pub async fn publish(&self, topic: &str, payload: &str) -> Result<usize, BrokerError> {
        let deadline = Instant::now() + self.config.publish_deadline;
        let mut backoff = Backoff::new(self.config.backoff_base, self.config.backoff_cap);

        loop {
            if *self.shutdown_tx.borrow() {
                return Err(BrokerError::Closed);
            }

            match self.backend.publish(topic, payload).await {
                Ok(delivered) => {
                    trace!(topic = %topic, delivered, "Published");
                    return Ok(delivered);
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    if Instant::now() + delay >= deadline {
                        warn!(topic = %topic, error = %e, "Publish retry budget exhausted");
                        return Err(BrokerError::Unavailable(e.to_string()));
                    }
                    debug!(
                        topic = %topic,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Publish failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Register a handler for a topic.
    ///
    /// At most one handler per topic per process: subscribing twice is a
    /// logged no-op, not an error.
    pub fn subscribe(&self, topic: &str, handler: impl Fn(String) + Send + Sync + 'static) {
        if self.handlers.contains_key(topic) {
            warn!(topic = %topic, "Already subscribed to topic");
            return;
        }

        self.handlers.insert(topic.to_string(), Arc::new(handler));
        // Wake the subscriber task so it reopens its connection with the
        // new topic included.
        let _ = self.topics_tx.send(topic.to_string());
        info!(topic = %topic, "Subscribed to topic");
    }

    /// Number of registered topic handlers.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.handlers.len()
    }

    /// Shut the bridge down.
    ///
    /// Signals the subscriber task and waits for it to exit. No handler is
    /// invoked after shutdown begins; in-flight publishes observe the flag
    /// and fail with [`BrokerError::Closed`] instead of retrying.
    pub async fn shutdown(&self) {
        if self.shutdown_tx.send_replace(true) {
            return; // already shut down
        }

        info!("Shutting down broker bridge");
        let task = self.subscriber_task.lock().await.take();
        if let Some(task) = task {
            let _ = task.await;
        }
        info!("Broker bridge shut down");
    }
}

/// Subscriber leg: keeps one inbound connection open, routes events to
/// handlers, reconnects with backoff on failure.
async fn subscriber_loop(
    backend: Arc<dyn PubSubBackend>,
    handlers: Arc<DashMap<String, TopicHandler>>,
    mut topics_rx: mpsc::UnboundedReceiver<String>,
    mut shutdown_rx: watch::Receiver<bool>,
    mut backoff: Backoff,
) {
    loop {
        if *shutdown_rx.borrow() {
            return;
        }

        let topics: Vec<String> = handlers.iter().map(|e| e.key().clone()).collect();
        if topics.is_empty() {
            // Nothing to subscribe to yet; wait for the first registration.
            tokio::select! {
                _ = shutdown_rx.changed() => {}
                added = topics_rx.recv() => {
                    if added.is_none() {
                        return;
                    }
                }
            }
            continue;
        }

        let mut subscriber = match backend.subscribe(&topics).await {
            Ok(sub) => {
                info!(topics = ?topics, "Subscriber connection established");
                backoff.reset();
                sub
            }
            Err(e) => {
                let delay = backoff.next_delay();
                warn!(
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "Subscriber connection failed, retrying"
                );
                tokio::select! {
                    _ = shutdown_rx.changed() => {}
                    _ = tokio::time::sleep(delay) => {}
                }
                continue;
            }
        };

        // Connected: route events until the connection breaks, the topic
        // set grows, or shutdown is signaled.
        let mut reconnect_after_error = false;
        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        return;
                    }
                }

                added = topics_rx.recv() => {
                    match added {
                        Some(topic) => {
                            if topics.iter().any(|t| t == &topic) {
                                // Registered before this connection opened;
                                // already covered.
                                continue;
                            }
                            debug!(topic = %topic, "Topic added, reopening subscriber");
                            break;
                        }
                        None => return,
                    }
                }

                event = subscriber.next_event() => {
                    match event {
                        Ok(Some(event)) => {
                            if *shutdown_rx.borrow() {
                                return;
                            }
                            if let Some(handler) = handlers.get(&event.topic) {
                                handler(event.payload);
                            } else {
                                trace!(topic = %event.topic, "No handler for inbound topic");
                            }
                        }
                        Ok(None) => {
                            warn!("Subscriber connection closed, reconnecting");
                            reconnect_after_error = true;
                            break;
                        }
                        Err(e) => {
                            warn!(error = %e, "Subscriber connection error, reconnecting");
                            reconnect_after_error = true;
                            break;
                        }
                    }
                }
            }
        }

        if reconnect_after_error {
            let delay = backoff.next_delay();
            tokio::select! {
                _ = shutdown_rx.changed() => {}
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BrokerEvent, MemoryBroker, Subscriber};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::timeout;

    fn test_config() -> BrokerBridgeConfig {
        BrokerBridgeConfig {
            publish_deadline: Duration::from_millis(200),
            backoff_base: Duration::from_millis(10),
            backoff_cap: Duration::from_millis(40),
        }
    }

    /// Backend whose publish leg always fails and whose subscribe leg
    /// never yields.
    struct DownBroker;

    struct SilentSubscriber;

    #[async_trait]
    impl Subscriber for SilentSubscriber {
        async fn next_event(&mut self) -> Result<Option<BrokerEvent>, BrokerError> {
            std::future::pending().await
        }
    }

    #[async_trait]
    impl PubSubBackend for DownBroker {
        async fn publish(&self, _topic: &str, _payload: &str) -> Result<usize, BrokerError> {
            Err(BrokerError::Backend("connection refused".into()))
        }

        async fn subscribe(
            &self,
            _topics: &[String],
        ) -> Result<Box<dyn Subscriber>, BrokerError> {
            Ok(Box::new(SilentSubscriber))
        }

        fn name(&self) -> &'static str {
            "down"
        }
    }

    #[tokio::test]
    async fn test_handler_receives_inbound_events() {
        let backend = Arc::new(MemoryBroker::new());
        let bridge = BrokerBridge::new(backend.clone(), test_config());

        let (tx, mut rx) = mpsc::unbounded_channel();
        bridge.subscribe("chat_messages", move |payload| {
            let _ = tx.send(payload);
        });

        // Give the subscriber task a moment to open its connection.
        tokio::time::sleep(Duration::from_millis(50)).await;

        bridge.publish("chat_messages", "hello").await.unwrap();

        let payload = timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payload, "hello");

        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn test_duplicate_subscribe_is_noop() {
        let backend = Arc::new(MemoryBroker::new());
        let bridge = BrokerBridge::new(backend.clone(), test_config());

        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let counter = first.clone();
        bridge.subscribe("chat_messages", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = second.clone();
        bridge.subscribe("chat_messages", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(bridge.subscription_count(), 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        bridge.publish("chat_messages", "hello").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 0);

        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn test_publish_exhausts_retries() {
        let bridge = BrokerBridge::new(Arc::new(DownBroker), test_config());

        let start = std::time::Instant::now();
        let result = bridge.publish("chat_messages", "hello").await;

        assert!(matches!(result, Err(BrokerError::Unavailable(_))));
        // At least one backoff delay elapsed before giving up.
        assert!(start.elapsed() >= Duration::from_millis(10));

        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn test_no_handler_invocation_after_shutdown() {
        let backend = Arc::new(MemoryBroker::new());
        let bridge = BrokerBridge::new(backend.clone(), test_config());

        let invocations = Arc::new(AtomicUsize::new(0));
        let counter = invocations.clone();
        bridge.subscribe("chat_messages", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        bridge.shutdown().await;

        // Publish straight through the backend; the bridge's subscriber
        // task is gone, so nothing may reach the handler.
        backend.publish("chat_messages", "late").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(invocations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_publish_after_shutdown_is_closed() {
        let bridge = BrokerBridge::new(Arc::new(MemoryBroker::new()), test_config());
        bridge.shutdown().await;

        let result = bridge.publish("chat_messages", "hello").await;
        assert!(matches!(result, Err(BrokerError::Closed)));
    }
}
