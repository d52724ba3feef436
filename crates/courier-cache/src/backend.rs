//! Cache backend abstraction.
//!
//! Backends store raw JSON strings under namespaced keys with a per-entry
//! TTL. The trait keeps the dispatch core backend-agnostic.

use async_trait::async_trait;
use dashmap::DashMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

/// Cache errors.
///
/// Reads and writes fail independently so callers can apply the fail-open
/// policy per direction: a read error degrades to a miss, a write error to
/// a skipped refresh.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The backend could not be reached at connect time.
    #[error("Cache backend unavailable: {0}")]
    Unavailable(String),

    /// A read against the backend failed.
    #[error("Cache read failed: {0}")]
    Read(String),

    /// A write against the backend failed.
    #[error("Cache write failed: {0}")]
    Write(String),
}

/// A key-value store with per-entry TTL.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Get the raw value for a key.
    ///
    /// Returns `Ok(None)` for a missing or expired key; `Err` only on a
    /// genuine backend failure.
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Store a value, overwriting silently.
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError>;

    /// Delete a single key. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Delete every key starting with `prefix`.
    ///
    /// Returns the number of keys removed.
    async fn delete_prefix(&self, prefix: &str) -> Result<u64, CacheError>;

    /// Drop all entries.
    async fn clear(&self) -> Result<(), CacheError>;

    /// Get the backend name (e.g., "redis", "memory").
    fn name(&self) -> &'static str;
}

/// Entry in the in-memory cache.
#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Instant,
}

/// In-memory cache backend.
///
/// Used by tests and single-node deployments where an external cache is
/// not configured. Expired entries are pruned lazily on access.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: DashMap<String, Entry>,
}

impl MemoryCache {
    /// Create an empty in-memory cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (possibly expired, not yet pruned) entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check whether the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        if let Some(entry) = self.entries.get(key) {
            if entry.expires_at > Instant::now() {
                return Ok(Some(entry.value.clone()));
            }
        } else {
            return Ok(None);
        }

        // Entry exists but is expired.
        self.entries.remove(key);
        Ok(None)
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, CacheError> {
        let before = self.entries.len();
        self.entries.retain(|key, _| !key.starts_with(prefix));
        let removed = (before - self.entries.len()) as u64;

        debug!(prefix = %prefix, removed, "Invalidated cache prefix");
        Ok(removed)
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.entries.clear();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
