//! # courier-broker
//!
//! Cross-process publish/subscribe bridge for the Courier engine.
//!
//! Each process owns exactly one outbound (publish) connection and one
//! inbound (subscribe) connection. Inbound payloads are routed to the
//! handler registered for their topic; the publisher and subscriber are
//! independent failure domains.
//!
//! ```text
//! ┌────────────┐ publish  ┌──────────────┐ deliver ┌────────────┐
//! │ Dispatcher │─────────▶│    Broker    │────────▶│ Subscriber │
//! └────────────┘          │ (Redis, ...) │         │    task    │
//!                         └──────────────┘         └─────┬──────┘
//!                                                        ▼
//!                                               per-topic handlers
//! ```

pub mod backend;
pub mod bridge;
pub mod redis;

pub use backend::{BrokerError, BrokerEvent, MemoryBroker, PubSubBackend, Subscriber};
pub use bridge::{BrokerBridge, BrokerBridgeConfig};
pub use redis::RedisBroker;
