//! # courier-core
//!
//! Message model and distribution core for the Courier realtime chat
//! engine.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **ChatMessage** - the wire/model type, with validation and one-shot
//!   enrichment
//! - **Fanout** - the process-wide multicast tap that turns one accepted
//!   message into N session deliveries
//! - **MessageStore** - the persistence adapter seam
//! - **Dispatcher** - the pipeline: receive → persist → cache-invalidate →
//!   publish → fan out
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌──────────────┐     ┌──────────────┐
//! │   Session   │────▶│  Dispatcher  │────▶│ MessageStore │
//! └─────────────┘     └──────┬───────┘     └──────────────┘
//!                            │
//!               ┌────────────┼────────────┐
//!               ▼            ▼            ▼
//!        ┌────────────┐ ┌─────────┐ ┌──────────┐
//!        │BrokerBridge│ │  Cache  │ │  Fanout  │
//!        └────────────┘ └─────────┘ └──────────┘
//! ```

pub mod dispatch;
pub mod fanout;
pub mod message;
pub mod store;

pub use dispatch::{DispatchError, Dispatcher, DispatcherConfig, CHAT_TOPIC};
pub use fanout::{Fanout, FanoutTap, SessionId};
pub use message::{ChatMessage, Envelope, MessageStatus, ParseError};
pub use store::{MemoryStore, MessageStore, StoreError, StoredMessage, DEFAULT_HISTORY_LIMIT};
