//! The message distribution core.
//!
//! One dispatcher per process, shared by every session. Pipeline per
//! message: validate → enrich → persist → invalidate history cache →
//! refresh latest snapshot → publish to the broker → fan out locally.
//!
//! Errors that would prevent durability (validation, persistence) surface
//! to the caller; cache and broker failures only degrade freshness or
//! cross-process reach and are absorbed here.

use crate::fanout::Fanout;
use crate::message::{ChatMessage, Envelope};
use crate::store::{MessageStore, StoreError, StoredMessage, DEFAULT_HISTORY_LIMIT};
use courier_broker::BrokerBridge;
use courier_cache::Cache;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

/// Broker topic carrying chat messages.
pub const CHAT_TOPIC: &str = "chat_messages";

/// Dispatch errors surfaced to callers.
///
/// Broker and cache failures are not represented here: they are absorbed
/// as degraded operation once the message is durable.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The message violates an invariant; nothing was persisted or
    /// published.
    #[error("Invalid message: {0}")]
    Validation(&'static str),

    /// The store write failed; the message was not published.
    #[error("Failed to persist message: {0}")]
    Persistence(#[from] StoreError),
}

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Broker topic to publish on and subscribe to.
    pub topic: String,
    /// TTL for `chat:history:{group}:{limit}` entries. Short: history is
    /// the most mutable derived data.
    pub history_ttl: Duration,
    /// TTL for the `chat:message:{group}` latest snapshot.
    pub snapshot_ttl: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            topic: CHAT_TOPIC.to_string(),
            history_ttl: Duration::from_secs(60),
            snapshot_ttl: Duration::from_secs(300),
        }
    }
}

fn history_key(group: &str, limit: usize) -> String {
    format!("chat:history:{group}:{limit}")
}

fn history_prefix(group: &str) -> String {
    format!("chat:history:{group}:")
}

fn latest_key(group: &str) -> String {
    format!("chat:message:{group}")
}

/// Generate the per-process origin id stamped on published envelopes.
fn generate_origin_id() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    format!("proc_{timestamp:x}")
}

/// The distribution core.
pub struct Dispatcher {
    store: Arc<dyn MessageStore>,
    cache: Cache,
    bridge: Arc<BrokerBridge>,
    fanout: Arc<Fanout>,
    origin: String,
    config: DispatcherConfig,
}

impl Dispatcher {
    /// Create a dispatcher and wire it into the broker bridge.
    ///
    /// Registers the topic handler that routes cross-process messages into
    /// the local fanout, dropping self-originated echoes.
    #[must_use]
    pub fn new(
        store: Arc<dyn MessageStore>,
        cache: Cache,
        bridge: Arc<BrokerBridge>,
        config: DispatcherConfig,
    ) -> Arc<Self> {
        let dispatcher = Arc::new(Self {
            store,
            cache,
            bridge,
            fanout: Arc::new(Fanout::new()),
            origin: generate_origin_id(),
            config,
        });

        let fanout = dispatcher.fanout.clone();
        let origin = dispatcher.origin.clone();
        dispatcher
            .bridge
            .subscribe(&dispatcher.config.topic, move |payload| {
                match Envelope::parse(&payload) {
                    Ok(envelope) if envelope.origin == origin => {
                        // Local sessions already got this message at accept
                        // time; only remote-origin envelopes fan out here.
                        trace!("Dropped self-originated echo");
                    }
                    Ok(envelope) => {
                        fanout.publish(&envelope.message);
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to parse inbound broker payload");
                    }
                }
            });

        dispatcher
    }

    /// Per-process origin id stamped on published envelopes.
    #[must_use]
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Number of sessions currently tapped into the fanout.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.fanout.subscriber_count()
    }

    /// Accept one message: enrich, persist, invalidate, publish, fan out.
    ///
    /// Returns the enriched message. Cache and broker failures are logged
    /// and absorbed; on a broker failure the message still reaches local
    /// sessions (the cross-process gap is accepted, since the message is
    /// already durable).
    ///
    /// # Errors
    ///
    /// [`DispatchError::Validation`] before any side effect;
    /// [`DispatchError::Persistence`] if the store write fails, in which
    /// case nothing is published.
    pub async fn handle(&self, message: ChatMessage) -> Result<ChatMessage, DispatchError> {
        message.validate().map_err(DispatchError::Validation)?;

        let enriched = message.enrich();
        let group = enriched.group_key().to_string();

        self.store
            .append(&enriched.user_id, &group, &enriched.content)
            .await?;

        // The append is durable; clear derived reads before returning so
        // no caller observes history that misses this message.
        if let Err(e) = self.cache.delete_prefix(&history_prefix(&group)).await {
            warn!(group = %group, error = %e, "History invalidation failed");
        }
        if let Err(e) = self
            .cache
            .set(&latest_key(&group), &enriched, Some(self.config.snapshot_ttl))
            .await
        {
            warn!(group = %group, error = %e, "Latest-message refresh failed");
        }

        match Envelope::new(self.origin.clone(), enriched.clone()).to_json() {
            Ok(payload) => match self.bridge.publish(&self.config.topic, &payload).await {
                Ok(delivered) => {
                    debug!(group = %group, delivered, "Message published");
                }
                Err(e) => {
                    warn!(
                        group = %group,
                        error = %e,
                        "Broker publish failed; message delivered locally only"
                    );
                }
            },
            Err(e) => {
                error!(group = %group, error = %e, "Failed to encode envelope");
            }
        }

        // Direct local delivery. Remote processes receive the broker copy;
        // our own echo is dropped by the origin check.
        self.fanout.publish(&enriched);

        Ok(enriched)
    }

    /// Adapt one session's inbound stream to the fanout.
    ///
    /// Inbound messages are handled serially in arrival order. A failed
    /// element produces a `Failed` item on this session's outbound only
    /// and never terminates the stream; accepted elements reach every
    /// session through the fanout. The returned receiver is this session's
    /// live tap from the moment of the call onward; dropping it tears the
    /// tap down.
    pub fn handle_stream(
        self: &Arc<Self>,
        mut inbound: mpsc::UnboundedReceiver<ChatMessage>,
    ) -> mpsc::UnboundedReceiver<ChatMessage> {
        let (out_tx, out_rx) = mpsc::unbounded_channel();

        // Outbound leg: forward the fanout tap until the session goes
        // away. Dropping the tap deregisters the session.
        let mut tap = self.fanout.subscribe();
        let tap_tx = out_tx.clone();
        tokio::spawn(async move {
            while let Some(message) = tap.recv().await {
                if tap_tx.send(message).is_err() {
                    break;
                }
            }
        });

        // Inbound leg: serialized per-session handling.
        let dispatcher = self.clone();
        tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                if let Err(e) = dispatcher.handle(message.clone()).await {
                    error!(error = %e, "Failed to handle stream message");
                    if out_tx.send(message.failed(e.to_string())).is_err() {
                        break;
                    }
                }
            }
        });

        out_rx
    }

    /// Read the most recent `limit` messages for a group, newest first.
    ///
    /// Cache-then-store: a cache hit answers directly; a miss queries the
    /// store and populates the history entry with its short TTL. Cache
    /// read errors degrade to a miss.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Persistence`] if the store query fails.
    pub async fn get_history(
        &self,
        group_id: &str,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, DispatchError> {
        let limit = if limit == 0 { DEFAULT_HISTORY_LIMIT } else { limit };
        let key = history_key(group_id, limit);

        match self.cache.get::<Vec<StoredMessage>>(&key).await {
            Ok(Some(messages)) => {
                debug!(group = %group_id, limit, "History served from cache");
                return Ok(messages);
            }
            Ok(None) => {}
            Err(e) => {
                warn!(group = %group_id, error = %e, "History cache read failed");
            }
        }

        let messages = self.store.query_recent(group_id, limit).await?;

        if let Err(e) = self
            .cache
            .set(&key, &messages, Some(self.config.history_ttl))
            .await
        {
            warn!(group = %group_id, error = %e, "History cache refresh failed");
        }

        debug!(group = %group_id, count = messages.len(), "History served from store");
        Ok(messages)
    }

    /// Delete a group's messages and drop its cache entries.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Persistence`] if the store delete fails.
    pub async fn delete_group(&self, group_id: &str) -> Result<u64, DispatchError> {
        let deleted = self.store.delete_all(group_id).await?;

        if let Err(e) = self.cache.delete_prefix(&history_prefix(group_id)).await {
            warn!(group = %group_id, error = %e, "History invalidation failed");
        }
        if let Err(e) = self.cache.delete(&latest_key(group_id)).await {
            warn!(group = %group_id, error = %e, "Latest-message invalidation failed");
        }

        Ok(deleted)
    }

    /// Shut down the broker bridge.
    ///
    /// In-flight publishes complete or fail cleanly; no bridge handler
    /// runs afterwards.
    pub async fn shutdown(&self) {
        self.bridge.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageStatus;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use courier_broker::{
        BrokerBridgeConfig, BrokerError, MemoryBroker, PubSubBackend, Subscriber,
    };
    use courier_cache::{CacheBackend, MemoryCache};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(1);

    /// Store wrapper with call-count instrumentation.
    struct CountingStore {
        inner: MemoryStore,
        appends: AtomicUsize,
        queries: AtomicUsize,
    }

    impl CountingStore {
        fn new() -> Self {
            Self {
                inner: MemoryStore::new(),
                appends: AtomicUsize::new(0),
                queries: AtomicUsize::new(0),
            }
        }

        fn appends(&self) -> usize {
            self.appends.load(Ordering::SeqCst)
        }

        fn queries(&self) -> usize {
            self.queries.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MessageStore for CountingStore {
        async fn append(
            &self,
            user_id: &str,
            group_id: &str,
            content: &str,
        ) -> Result<StoredMessage, StoreError> {
            self.appends.fetch_add(1, Ordering::SeqCst);
            self.inner.append(user_id, group_id, content).await
        }

        async fn query_recent(
            &self,
            group_id: &str,
            limit: usize,
        ) -> Result<Vec<StoredMessage>, StoreError> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            self.inner.query_recent(group_id, limit).await
        }

        async fn delete_all(&self, group_id: &str) -> Result<u64, StoreError> {
            self.inner.delete_all(group_id).await
        }
    }

    /// Backend that records publishes and forwards them to an inner
    /// in-memory broker.
    struct RecordingBroker {
        inner: MemoryBroker,
        published: Mutex<Vec<(String, String)>>,
    }

    impl RecordingBroker {
        fn new() -> Self {
            Self {
                inner: MemoryBroker::new(),
                published: Mutex::new(Vec::new()),
            }
        }

        fn published(&self) -> Vec<(String, String)> {
            self.published.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PubSubBackend for RecordingBroker {
        async fn publish(&self, topic: &str, payload: &str) -> Result<usize, BrokerError> {
            self.published
                .lock()
                .unwrap()
                .push((topic.to_string(), payload.to_string()));
            self.inner.publish(topic, payload).await
        }

        async fn subscribe(&self, topics: &[String]) -> Result<Box<dyn Subscriber>, BrokerError> {
            self.inner.subscribe(topics).await
        }

        fn name(&self) -> &'static str {
            "recording"
        }
    }

    /// Backend whose publish leg is down.
    struct DownBroker {
        inner: MemoryBroker,
    }

    #[async_trait]
    impl PubSubBackend for DownBroker {
        async fn publish(&self, _topic: &str, _payload: &str) -> Result<usize, BrokerError> {
            Err(BrokerError::Backend("connection reset".into()))
        }

        async fn subscribe(&self, topics: &[String]) -> Result<Box<dyn Subscriber>, BrokerError> {
            self.inner.subscribe(topics).await
        }

        fn name(&self) -> &'static str {
            "down"
        }
    }

    fn bridge_config() -> BrokerBridgeConfig {
        BrokerBridgeConfig {
            publish_deadline: Duration::from_millis(100),
            backoff_base: Duration::from_millis(10),
            backoff_cap: Duration::from_millis(40),
        }
    }

    struct TestHarness {
        dispatcher: Arc<Dispatcher>,
        store: Arc<CountingStore>,
        backend: Arc<RecordingBroker>,
        cache_backend: Arc<MemoryCache>,
    }

    fn harness() -> TestHarness {
        harness_with_backend(Arc::new(RecordingBroker::new()))
    }

    fn harness_with_backend(backend: Arc<RecordingBroker>) -> TestHarness {
        let store = Arc::new(CountingStore::new());
        let cache_backend = Arc::new(MemoryCache::new());
        let bridge = Arc::new(BrokerBridge::new(backend.clone(), bridge_config()));
        let dispatcher = Dispatcher::new(
            store.clone(),
            Cache::new(cache_backend.clone()),
            bridge,
            DispatcherConfig::default(),
        );

        TestHarness {
            dispatcher,
            store,
            backend,
            cache_backend,
        }
    }

    #[tokio::test]
    async fn test_handle_enriches_and_persists() {
        let h = harness();

        let enriched = h
            .dispatcher
            .handle(ChatMessage::new("u1", "hi").with_group("g1"))
            .await
            .unwrap();

        assert!(!enriched.timestamp.as_deref().unwrap_or("").is_empty());
        assert_eq!(enriched.status, MessageStatus::Sent);
        assert_eq!(h.store.appends(), 1);

        let history = h.dispatcher.get_history("g1", 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].user_id, "u1");
        assert_eq!(history[0].content, "hi");
    }

    #[tokio::test]
    async fn test_handle_rejects_invalid_message() {
        let h = harness();

        let no_user = h.dispatcher.handle(ChatMessage::new("", "hi")).await;
        let no_content = h.dispatcher.handle(ChatMessage::new("u1", "")).await;

        assert!(matches!(no_user, Err(DispatchError::Validation(_))));
        assert!(matches!(no_content, Err(DispatchError::Validation(_))));
        assert_eq!(h.store.appends(), 0);
        assert!(h.backend.published().is_empty());
    }

    #[tokio::test]
    async fn test_handle_publishes_wire_payload() {
        let h = harness();

        h.dispatcher
            .handle(ChatMessage::new("u1", "hi").with_group("g1"))
            .await
            .unwrap();

        let published = h.backend.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "chat_messages");

        let payload: serde_json::Value = serde_json::from_str(&published[0].1).unwrap();
        assert_eq!(payload["userId"], "u1");
        assert_eq!(payload["content"], "hi");
        assert!(!payload["timestamp"].as_str().unwrap().is_empty());
        assert!(payload.get("error").is_none());
        assert_eq!(payload["origin"], h.dispatcher.origin());
    }

    #[tokio::test]
    async fn test_history_is_cached_and_idempotent() {
        let h = harness();

        h.dispatcher
            .handle(ChatMessage::new("u1", "hi").with_group("g1"))
            .await
            .unwrap();

        let first = h.dispatcher.get_history("g1", 10).await.unwrap();
        let second = h.dispatcher.get_history("g1", 10).await.unwrap();

        assert_eq!(first, second);
        // Second read was answered by the cache.
        assert_eq!(h.store.queries(), 1);
    }

    #[tokio::test]
    async fn test_handle_invalidates_history_cache() {
        let h = harness();

        h.dispatcher
            .handle(ChatMessage::new("u1", "one").with_group("g1"))
            .await
            .unwrap();
        h.dispatcher.get_history("g1", 10).await.unwrap();
        assert_eq!(h.store.queries(), 1);

        // A new write must clear the cached history entry.
        h.dispatcher
            .handle(ChatMessage::new("u2", "two").with_group("g1"))
            .await
            .unwrap();
        assert_eq!(
            h.cache_backend.get("chat:history:g1:10").await.unwrap(),
            None
        );

        let history = h.dispatcher.get_history("g1", 10).await.unwrap();
        assert_eq!(h.store.queries(), 2);
        assert_eq!(history[0].content, "two");
    }

    #[tokio::test]
    async fn test_handle_refreshes_latest_snapshot() {
        let h = harness();

        h.dispatcher
            .handle(ChatMessage::new("u1", "hi").with_group("g1"))
            .await
            .unwrap();

        let raw = h
            .cache_backend
            .get("chat:message:g1")
            .await
            .unwrap()
            .unwrap();
        let snapshot: ChatMessage = serde_json::from_str(&raw).unwrap();
        assert_eq!(snapshot.content, "hi");
    }

    #[tokio::test]
    async fn test_publish_failure_does_not_fail_handle() {
        let store = Arc::new(CountingStore::new());
        let bridge = Arc::new(BrokerBridge::new(
            Arc::new(DownBroker {
                inner: MemoryBroker::new(),
            }),
            bridge_config(),
        ));
        let dispatcher = Dispatcher::new(
            store.clone(),
            Cache::new(Arc::new(MemoryCache::new())),
            bridge,
            DispatcherConfig::default(),
        );

        let (_in_tx, in_rx) = mpsc::unbounded_channel();
        let mut out_rx = dispatcher.handle_stream(in_rx);

        let enriched = dispatcher
            .handle(ChatMessage::new("u1", "hi").with_group("g1"))
            .await
            .unwrap();

        // Persisted, returned, and still delivered to local sessions.
        assert!(enriched.timestamp.is_some());
        assert_eq!(store.appends(), 1);
        let delivered = timeout(WAIT, out_rx.recv()).await.unwrap().unwrap();
        assert_eq!(delivered.content, "hi");
    }

    #[tokio::test]
    async fn test_stream_fanout_reaches_all_sessions() {
        let h = harness();

        let (in_tx1, in_rx1) = mpsc::unbounded_channel();
        let mut out_rx1 = h.dispatcher.handle_stream(in_rx1);
        let (_in_tx2, in_rx2) = mpsc::unbounded_channel();
        let mut out_rx2 = h.dispatcher.handle_stream(in_rx2);

        in_tx1
            .send(ChatMessage::new("u1", "hi").with_group("g1"))
            .unwrap();

        let got1 = timeout(WAIT, out_rx1.recv()).await.unwrap().unwrap();
        let got2 = timeout(WAIT, out_rx2.recv()).await.unwrap().unwrap();

        assert_eq!(got1.content, "hi");
        assert_eq!(got2.content, "hi");
        assert_eq!(got1.status, MessageStatus::Sent);
    }

    #[tokio::test]
    async fn test_stream_failure_is_session_local() {
        let h = harness();

        let (in_tx1, in_rx1) = mpsc::unbounded_channel();
        let mut out_rx1 = h.dispatcher.handle_stream(in_rx1);
        let (_in_tx2, in_rx2) = mpsc::unbounded_channel();
        let mut out_rx2 = h.dispatcher.handle_stream(in_rx2);

        // Invalid element: only the producing session sees the failure.
        in_tx1.send(ChatMessage::new("u1", "")).unwrap();

        let failed = timeout(WAIT, out_rx1.recv()).await.unwrap().unwrap();
        assert_eq!(failed.status, MessageStatus::Failed);
        assert!(failed.error.is_some());
        assert!(timeout(Duration::from_millis(100), out_rx2.recv())
            .await
            .is_err());

        // The stream survives the failed element.
        in_tx1
            .send(ChatMessage::new("u1", "still alive").with_group("g1"))
            .unwrap();
        let next = timeout(WAIT, out_rx1.recv()).await.unwrap().unwrap();
        assert_eq!(next.content, "still alive");
    }

    #[tokio::test]
    async fn test_session_teardown_unsubscribes() {
        let h = harness();

        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let out_rx = h.dispatcher.handle_stream(in_rx);
        // Both spawned tasks need a poll to register and park.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.dispatcher.session_count(), 1);

        drop(out_rx);
        drop(in_tx);
        // Next delivery attempt prunes the dead queue.
        h.dispatcher
            .handle(ChatMessage::new("u1", "hi").with_group("g1"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.dispatcher.session_count(), 0);
    }

    #[tokio::test]
    async fn test_cross_process_delivery_and_self_dedup() {
        // Two dispatchers over one broker backend stand in for two
        // processes.
        let backend = Arc::new(RecordingBroker::new());
        let h1 = harness_with_backend(backend.clone());
        let h2 = harness_with_backend(backend);

        let (_in_tx1, in_rx1) = mpsc::unbounded_channel();
        let mut out_rx1 = h1.dispatcher.handle_stream(in_rx1);

        // Let both subscriber legs connect.
        tokio::time::sleep(Duration::from_millis(50)).await;

        // A message accepted by process 2 reaches process 1's session.
        h2.dispatcher
            .handle(ChatMessage::new("u2", "from p2").with_group("g1"))
            .await
            .unwrap();
        let got = timeout(WAIT, out_rx1.recv()).await.unwrap().unwrap();
        assert_eq!(got.content, "from p2");

        // A message accepted by process 1 arrives exactly once despite the
        // broker echoing it back.
        h1.dispatcher
            .handle(ChatMessage::new("u1", "from p1").with_group("g1"))
            .await
            .unwrap();
        let got = timeout(WAIT, out_rx1.recv()).await.unwrap().unwrap();
        assert_eq!(got.content, "from p1");
        assert!(timeout(Duration::from_millis(100), out_rx1.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_delete_group_clears_store_and_cache() {
        let h = harness();

        h.dispatcher
            .handle(ChatMessage::new("u1", "one").with_group("g1"))
            .await
            .unwrap();
        h.dispatcher
            .handle(ChatMessage::new("u1", "two").with_group("g1"))
            .await
            .unwrap();
        h.dispatcher.get_history("g1", 10).await.unwrap();

        let deleted = h.dispatcher.delete_group("g1").await.unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(
            h.cache_backend.get("chat:history:g1:10").await.unwrap(),
            None
        );
        assert_eq!(h.cache_backend.get("chat:message:g1").await.unwrap(), None);
        assert!(h.dispatcher.get_history("g1", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_default_history_limit_applied() {
        let h = harness();

        h.dispatcher
            .handle(ChatMessage::new("u1", "hi").with_group("g1"))
            .await
            .unwrap();
        h.dispatcher.get_history("g1", 0).await.unwrap();

        let key = format!("chat:history:g1:{DEFAULT_HISTORY_LIMIT}");
        assert!(h.cache_backend.get(&key).await.unwrap().is_some());
    }
}
