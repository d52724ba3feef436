//! Chat message model.
//!
//! Messages arrive from producers with `userId` and `content` set, are
//! enriched exactly once with a server-side timestamp, and from then on
//! flow through the system as immutable values.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Delivery status of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageStatus {
    /// Accepted and published.
    Sent,
    /// Confirmed received by a consumer.
    Delivered,
    /// Rejected or failed.
    Failed,
}

impl Default for MessageStatus {
    fn default() -> Self {
        Self::Sent
    }
}

/// A chat message.
///
/// `group_id` is absent in a one-to-one context. The timestamp is assigned
/// by the dispatcher, never trusted from the producer once set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Sender id. Required.
    pub user_id: String,

    /// Group the message belongs to; `None` for one-to-one messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,

    /// Message body. Required.
    pub content: String,

    /// RFC 3339 timestamp, assigned on enrichment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,

    /// Delivery status.
    #[serde(default)]
    pub status: MessageStatus,

    /// Error detail for `Failed` messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ChatMessage {
    /// Create a message in the pre-enrichment state.
    #[must_use]
    pub fn new(user_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            group_id: None,
            content: content.into(),
            timestamp: None,
            status: MessageStatus::Sent,
            error: None,
        }
    }

    /// Attach a group id.
    #[must_use]
    pub fn with_group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    /// Validate the invariants required before persistence or publish.
    ///
    /// # Errors
    ///
    /// Returns a static description of the violated invariant.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.user_id.is_empty() {
            return Err("userId is required");
        }
        if self.content.is_empty() {
            return Err("content is required");
        }
        Ok(())
    }

    /// Produce the enriched form of this message.
    ///
    /// Pure transform: assigns the timestamp only when absent, so a retry
    /// of an already-enriched message never re-stamps it.
    #[must_use]
    pub fn enrich(&self) -> Self {
        let mut enriched = self.clone();
        if enriched.timestamp.is_none() {
            enriched.timestamp = Some(Utc::now().to_rfc3339());
        }
        enriched.status = MessageStatus::Sent;
        enriched.error = None;
        enriched
    }

    /// Produce a `Failed` response item for this message.
    #[must_use]
    pub fn failed(&self, error: impl Into<String>) -> Self {
        let mut failed = self.clone();
        if failed.timestamp.is_none() {
            failed.timestamp = Some(Utc::now().to_rfc3339());
        }
        failed.status = MessageStatus::Failed;
        failed.error = Some(error.into());
        failed
    }

    /// Group key used for storage and cache namespacing.
    ///
    /// One-to-one messages share the empty-string group.
    #[must_use]
    pub fn group_key(&self) -> &str {
        self.group_id.as_deref().unwrap_or("")
    }
}

/// Errors raised at the broker parse boundary.
#[derive(Debug, Error)]
pub enum ParseError {
    /// The payload was not valid JSON for a chat message.
    #[error("Malformed payload: {0}")]
    Json(#[from] serde_json::Error),

    /// The payload decoded but violates a message invariant.
    #[error("Invalid message: {0}")]
    Invalid(&'static str),
}

/// Wire envelope carried on the broker topic.
///
/// The envelope is the JSON of the message plus the publishing process's
/// `origin` id, which the subscribe leg uses to drop self-originated
/// echoes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Instance id of the publishing process.
    #[serde(default)]
    pub origin: String,

    /// The enriched message.
    #[serde(flatten)]
    pub message: ChatMessage,
}

impl Envelope {
    /// Wrap a message for publishing.
    #[must_use]
    pub fn new(origin: impl Into<String>, message: ChatMessage) -> Self {
        Self {
            origin: origin.into(),
            message,
        }
    }

    /// Encode as the UTF-8 JSON wire payload.
    ///
    /// # Errors
    ///
    /// Returns a serialization error; chat messages always serialize, so
    /// this only fires on pathological content.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode and validate a wire payload.
    ///
    /// Payloads missing `userId` or `content` are rejected here and never
    /// reach subscribers.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError`] for malformed JSON or violated invariants.
    pub fn parse(payload: &str) -> Result<Self, ParseError> {
        let envelope: Envelope = serde_json::from_str(payload)?;
        envelope.message.validate().map_err(ParseError::Invalid)?;
        Ok(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_requires_user_and_content() {
        assert!(ChatMessage::new("u1", "hi").validate().is_ok());
        assert!(ChatMessage::new("", "hi").validate().is_err());
        assert!(ChatMessage::new("u1", "").validate().is_err());
    }

    #[test]
    fn test_enrich_assigns_timestamp_once() {
        let message = ChatMessage::new("u1", "hi").with_group("g1");
        let enriched = message.enrich();

        let timestamp = enriched.timestamp.clone().unwrap();
        assert!(!timestamp.is_empty());

        // Re-enrichment keeps the original timestamp.
        let again = enriched.enrich();
        assert_eq!(again.timestamp.as_deref(), Some(timestamp.as_str()));
    }

    #[test]
    fn test_failed_carries_error() {
        let failed = ChatMessage::new("u1", "hi").failed("store down");

        assert_eq!(failed.status, MessageStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("store down"));
        assert!(failed.timestamp.is_some());
    }

    #[test]
    fn test_group_key_defaults_to_empty() {
        assert_eq!(ChatMessage::new("u1", "hi").group_key(), "");
        assert_eq!(
            ChatMessage::new("u1", "hi").with_group("g1").group_key(),
            "g1"
        );
    }

    #[test]
    fn test_wire_field_names_are_camel_case() {
        let envelope = Envelope::new("proc_1", ChatMessage::new("u1", "hi").with_group("g1").enrich());
        let json = envelope.to_json().unwrap();

        assert!(json.contains("\"userId\":\"u1\""));
        assert!(json.contains("\"groupId\":\"g1\""));
        assert!(json.contains("\"origin\":\"proc_1\""));
        assert!(!json.contains("\"error\""));
    }

    #[test]
    fn test_parse_rejects_missing_fields() {
        assert!(Envelope::parse("not json").is_err());
        assert!(matches!(
            Envelope::parse(r#"{"userId":"u1","content":"","status":"SENT"}"#),
            Err(ParseError::Invalid(_))
        ));

        let ok = Envelope::parse(r#"{"origin":"p1","userId":"u1","content":"hi","status":"SENT"}"#)
            .unwrap();
        assert_eq!(ok.origin, "p1");
        assert_eq!(ok.message.user_id, "u1");
    }

    #[test]
    fn test_parse_tolerates_missing_origin() {
        let envelope =
            Envelope::parse(r#"{"userId":"u1","content":"hi","status":"SENT"}"#).unwrap();
        assert!(envelope.origin.is_empty());
    }
}
