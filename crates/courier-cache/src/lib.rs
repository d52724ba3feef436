//! # courier-cache
//!
//! Read-through/write-through key-value caching for the Courier engine.
//!
//! The layer splits into two pieces:
//!
//! - **`CacheBackend`** - the raw string store (Redis in production, an
//!   in-memory map for tests and single-node deployments)
//! - **`Cache`** - a typed wrapper that serializes values as JSON and
//!   applies a default TTL
//!
//! Cache failures never block the message path: callers treat read errors
//! as a miss and write errors as a skipped refresh.

pub mod backend;
pub mod cache;
pub mod redis;

pub use backend::{CacheBackend, CacheError, MemoryCache};
pub use cache::Cache;
pub use redis::RedisCache;
