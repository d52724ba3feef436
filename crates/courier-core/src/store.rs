//! Persistence adapter seam.
//!
//! The production store is an external collaborator; the engine consumes
//! only this interface. `MemoryStore` backs tests and single-node
//! deployments.

use crate::message::MessageStatus;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Default number of messages returned by a history query.
pub const DEFAULT_HISTORY_LIMIT: usize = 100;

/// Persistence errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached.
    #[error("Message store unavailable: {0}")]
    Unavailable(String),

    /// The store refused the write.
    #[error("Message store rejected write: {0}")]
    Rejected(String),
}

/// A persisted message row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    /// Sender id.
    pub user_id: String,
    /// Group key; empty string for one-to-one messages.
    pub group_id: String,
    /// Message body.
    pub content: String,
    /// Delivery status at persist time.
    pub status: MessageStatus,
    /// RFC 3339 persist timestamp.
    pub timestamp: String,
}

/// Append-only message store with group-scoped range queries.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Append a message.
    async fn append(
        &self,
        user_id: &str,
        group_id: &str,
        content: &str,
    ) -> Result<StoredMessage, StoreError>;

    /// Query the most recent `limit` messages for a group, newest first.
    async fn query_recent(
        &self,
        group_id: &str,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, StoreError>;

    /// Delete every message of a group, returning the number removed.
    async fn delete_all(&self, group_id: &str) -> Result<u64, StoreError>;
}

/// In-memory message store, grouped by group key in append order.
#[derive(Debug, Default)]
pub struct MemoryStore {
    groups: DashMap<String, Vec<StoredMessage>>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn append(
        &self,
        user_id: &str,
        group_id: &str,
        content: &str,
    ) -> Result<StoredMessage, StoreError> {
        let stored = StoredMessage {
            user_id: user_id.to_string(),
            group_id: group_id.to_string(),
            content: content.to_string(),
            status: MessageStatus::Sent,
            timestamp: Utc::now().to_rfc3339(),
        };

        self.groups
            .entry(group_id.to_string())
            .or_default()
            .push(stored.clone());

        debug!(group = %group_id, "Message saved");
        Ok(stored)
    }

    async fn query_recent(
        &self,
        group_id: &str,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        let messages = self
            .groups
            .get(group_id)
            .map(|rows| rows.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default();

        Ok(messages)
    }

    async fn delete_all(&self, group_id: &str) -> Result<u64, StoreError> {
        let removed = self
            .groups
            .remove(group_id)
            .map(|(_, rows)| rows.len() as u64)
            .unwrap_or(0);

        if removed == 0 {
            warn!(group = %group_id, "No messages found to delete");
        } else {
            debug!(group = %group_id, removed, "Deleted group messages");
        }

        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_append_and_query_newest_first() {
        let store = MemoryStore::new();

        store.append("u1", "g1", "first").await.unwrap();
        store.append("u2", "g1", "second").await.unwrap();
        store.append("u1", "g2", "elsewhere").await.unwrap();

        let recent = store.query_recent("g1", 10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].content, "second");
        assert_eq!(recent[1].content, "first");
    }

    #[tokio::test]
    async fn test_query_respects_limit() {
        let store = MemoryStore::new();

        for i in 0..5 {
            store
                .append("u1", "g1", &format!("m{i}"))
                .await
                .unwrap();
        }

        let recent = store.query_recent("g1", 2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].content, "m4");
    }

    #[tokio::test]
    async fn test_query_unknown_group_is_empty() {
        let store = MemoryStore::new();
        assert!(store.query_recent("missing", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_all() {
        let store = MemoryStore::new();

        store.append("u1", "g1", "one").await.unwrap();
        store.append("u1", "g1", "two").await.unwrap();

        assert_eq!(store.delete_all("g1").await.unwrap(), 2);
        assert_eq!(store.delete_all("g1").await.unwrap(), 0);
        assert!(store.query_recent("g1", 10).await.unwrap().is_empty());
    }
}
