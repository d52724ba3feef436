//! The process-wide multicast tap.
//!
//! One accepted message becomes N independent session deliveries. The tap
//! is an explicit registry of per-session queues: sessions register on
//! subscribe and are deregistered when their tap is dropped, so teardown
//! is visible and testable rather than hidden in a broadcast primitive.
//! Each session owns its queue exclusively; a slow session delays nobody
//! else.

use crate::message::ChatMessage;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Identifier of a subscribed session.
pub type SessionId = u64;

/// Multicast registry keyed by session id.
#[derive(Debug, Default)]
pub struct Fanout {
    subscribers: DashMap<SessionId, mpsc::UnboundedSender<ChatMessage>>,
    next_id: AtomicU64,
}

impl Fanout {
    /// Create an empty fanout.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new session.
    ///
    /// The returned tap receives every message published from this moment
    /// onward (no backfill) and deregisters itself on drop.
    #[must_use]
    pub fn subscribe(self: &Arc<Self>) -> FanoutTap {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.insert(id, tx);

        debug!(session = id, subscribers = self.subscribers.len(), "Session subscribed to fanout");

        FanoutTap {
            id,
            rx,
            fanout: self.clone(),
        }
    }

    /// Remove a session from the registry.
    ///
    /// Returns `true` if the session was subscribed. After this returns,
    /// no further message is delivered to the session's queue.
    pub fn unsubscribe(&self, id: SessionId) -> bool {
        let removed = self.subscribers.remove(&id).is_some();
        if removed {
            debug!(session = id, "Session unsubscribed from fanout");
        }
        removed
    }

    /// Deliver a message to every subscribed session.
    ///
    /// Returns the number of sessions that received it. Queues whose
    /// receiver is gone are pruned.
    pub fn publish(&self, message: &ChatMessage) -> usize {
        let mut delivered = 0;
        let mut stale = Vec::new();

        for entry in self.subscribers.iter() {
            if entry.value().send(message.clone()).is_ok() {
                delivered += 1;
            } else {
                stale.push(*entry.key());
            }
        }

        for id in stale {
            self.subscribers.remove(&id);
        }

        trace!(delivered, "Fanned out message");
        delivered
    }

    /// Number of live subscribed sessions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

/// A session's live tap on the fanout.
///
/// Dropping the tap unsubscribes the session atomically with respect to
/// delivery: after the drop returns, nothing is queued for it anymore.
#[derive(Debug)]
pub struct FanoutTap {
    id: SessionId,
    rx: mpsc::UnboundedReceiver<ChatMessage>,
    fanout: Arc<Fanout>,
}

impl FanoutTap {
    /// The session id of this tap.
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Receive the next fanned-out message.
    ///
    /// Returns `None` once unsubscribed and drained.
    pub async fn recv(&mut self) -> Option<ChatMessage> {
        self.rx.recv().await
    }
}

impl Drop for FanoutTap {
    fn drop(&mut self) {
        self.fanout.unsubscribe(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(content: &str) -> ChatMessage {
        ChatMessage::new("u1", content).with_group("g1").enrich()
    }

    #[tokio::test]
    async fn test_fanout_delivers_to_all_sessions() {
        let fanout = Arc::new(Fanout::new());

        let mut tap1 = fanout.subscribe();
        let mut tap2 = fanout.subscribe();
        assert_eq!(fanout.subscriber_count(), 2);

        let delivered = fanout.publish(&message("hi"));
        assert_eq!(delivered, 2);

        assert_eq!(tap1.recv().await.unwrap().content, "hi");
        assert_eq!(tap2.recv().await.unwrap().content, "hi");
    }

    #[tokio::test]
    async fn test_drop_unsubscribes() {
        let fanout = Arc::new(Fanout::new());

        let tap = fanout.subscribe();
        assert_eq!(fanout.subscriber_count(), 1);

        drop(tap);
        assert_eq!(fanout.subscriber_count(), 0);
        assert_eq!(fanout.publish(&message("hi")), 0);
    }

    #[tokio::test]
    async fn test_no_backfill_before_subscription() {
        let fanout = Arc::new(Fanout::new());

        fanout.publish(&message("before"));
        let mut tap = fanout.subscribe();
        fanout.publish(&message("after"));

        assert_eq!(tap.recv().await.unwrap().content, "after");
    }

    #[tokio::test]
    async fn test_slow_session_does_not_block_others() {
        let fanout = Arc::new(Fanout::new());

        // tap1 never reads; tap2 must still see everything.
        let _tap1 = fanout.subscribe();
        let mut tap2 = fanout.subscribe();

        for i in 0..100 {
            fanout.publish(&message(&format!("m{i}")));
        }

        for i in 0..100 {
            assert_eq!(tap2.recv().await.unwrap().content, format!("m{i}"));
        }
    }
}
