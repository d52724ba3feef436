//! Stream session management.
//!
//! Each WebSocket connection becomes one stream session: inbound frames
//! are decoded and fed to the dispatcher, the dispatcher's outbound tap is
//! encoded back to the client. A single bad message produces a FAILED
//! response item; only transport errors end the session.

use crate::config::LimitsConfig;
use crate::metrics::{self, SessionMetricsGuard};
use axum::extract::ws::{Message, WebSocket};
use courier_core::{ChatMessage, Dispatcher, MessageStatus};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Response item returned to stream and unary callers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageResponse {
    /// Sender id of the originating message.
    pub user_id: String,
    /// Message body.
    pub content: String,
    /// RFC 3339 timestamp.
    pub timestamp: String,
    /// Delivery status.
    pub status: MessageStatus,
    /// Error detail for failed messages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<ChatMessage> for MessageResponse {
    fn from(message: ChatMessage) -> Self {
        Self {
            user_id: message.user_id,
            content: message.content,
            timestamp: message.timestamp.unwrap_or_default(),
            status: message.status,
            error: message.error,
        }
    }
}

impl MessageResponse {
    /// Failure item for input that never decoded into a message.
    #[must_use]
    pub fn rejected(error: impl Into<String>) -> Self {
        Self::from(ChatMessage::new("", "").failed(error))
    }
}

/// Run one stream session to completion.
///
/// Lifecycle: OPEN (this call) → ACTIVE (select loop) → CLOSING (either
/// side ended; bounded-grace flush) → CLOSED (tap torn down via the
/// dispatcher's drop guard when the outbound receiver goes away).
pub async fn run_session(socket: WebSocket, dispatcher: Arc<Dispatcher>, limits: LimitsConfig) {
    let _metrics_guard = SessionMetricsGuard::new();

    let session_id = format!(
        "sess_{:x}",
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos()
    );

    debug!(session = %session_id, "Stream session opened");

    let (mut sender, mut receiver) = socket.split();

    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let mut out_rx = dispatcher.handle_stream(in_rx);

    loop {
        tokio::select! {
            biased;

            // Deliver fanned-out and failure items to the client.
            item = out_rx.recv() => {
                match item {
                    Some(message) => {
                        if send_response(&mut sender, &MessageResponse::from(message))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    None => break,
                }
            }

            // Receive from the WebSocket.
            frame = receiver.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        let start = Instant::now();
                        if let Some(rejection) = accept_inbound(&text, &in_tx, &limits, &session_id) {
                            if send_response(&mut sender, &rejection).await.is_err() {
                                break;
                            }
                        }
                        metrics::record_latency(start.elapsed().as_secs_f64());
                    }
                    Some(Ok(Message::Binary(data))) => {
                        match String::from_utf8(data) {
                            Ok(text) => {
                                if let Some(rejection) =
                                    accept_inbound(&text, &in_tx, &limits, &session_id)
                                {
                                    if send_response(&mut sender, &rejection).await.is_err() {
                                        break;
                                    }
                                }
                            }
                            Err(_) => {
                                metrics::record_error("parse");
                                let rejection =
                                    MessageResponse::rejected("binary frames must be UTF-8 JSON");
                                if send_response(&mut sender, &rejection).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        // Ignore pongs
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(session = %session_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(session = %session_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(session = %session_id, "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    // CLOSING: stop feeding the dispatcher, then best-effort flush of
    // already-buffered outbound items within the grace period.
    drop(in_tx);
    let grace = Duration::from_millis(limits.session_grace_ms);
    let flush = async {
        while let Ok(message) = out_rx.try_recv() {
            if send_response(&mut sender, &MessageResponse::from(message))
                .await
                .is_err()
            {
                break;
            }
        }
    };
    if tokio::time::timeout(grace, flush).await.is_err() {
        warn!(session = %session_id, "Flush grace elapsed, dropping buffered items");
    }

    debug!(session = %session_id, "Stream session closed");
}

/// Decode one inbound frame and hand it to the dispatcher.
///
/// Returns a rejection response for input that never became a message;
/// dispatch-level failures come back through the session's outbound tap.
fn accept_inbound(
    text: &str,
    in_tx: &mpsc::UnboundedSender<ChatMessage>,
    limits: &LimitsConfig,
    session_id: &str,
) -> Option<MessageResponse> {
    if text.len() > limits.max_message_bytes {
        warn!(session = %session_id, bytes = text.len(), "Oversized inbound message");
        metrics::record_error("oversize");
        return Some(MessageResponse::rejected("message too large"));
    }

    match serde_json::from_str::<ChatMessage>(text) {
        Ok(message) => {
            metrics::record_message(text.len(), "inbound");
            let _ = in_tx.send(message);
            None
        }
        Err(e) => {
            warn!(session = %session_id, error = %e, "Malformed inbound message");
            metrics::record_error("parse");
            Some(MessageResponse::rejected(format!("malformed message: {e}")))
        }
    }
}

/// Encode and send one response frame.
async fn send_response(
    sender: &mut SplitSink<WebSocket, Message>,
    response: &MessageResponse,
) -> Result<(), axum::Error> {
    match serde_json::to_string(response) {
        Ok(text) => {
            metrics::record_message(text.len(), "outbound");
            sender.send(Message::Text(text)).await
        }
        Err(e) => {
            error!(error = %e, "Failed to encode response");
            Ok(())
        }
    }
}
