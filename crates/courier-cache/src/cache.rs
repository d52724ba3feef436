//! Typed cache wrapper.
//!
//! Serializes values as JSON on the way in and deserializes on the way
//! out, so callers work with their own types rather than raw strings.

use crate::backend::{CacheBackend, CacheError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// Default TTL applied when a call site does not specify one.
const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// A typed, TTL-aware cache over an arbitrary backend.
#[derive(Clone)]
pub struct Cache {
    backend: Arc<dyn CacheBackend>,
    default_ttl: Duration,
}

impl Cache {
    /// Create a cache with the default TTL.
    #[must_use]
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self::with_default_ttl(backend, DEFAULT_TTL)
    }

    /// Create a cache with a specific default TTL.
    #[must_use]
    pub fn with_default_ttl(backend: Arc<dyn CacheBackend>, default_ttl: Duration) -> Self {
        Self {
            backend,
            default_ttl,
        }
    }

    /// The TTL used when `set` is called without an explicit one.
    #[must_use]
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Fetch and decode a value.
    ///
    /// Returns `Ok(None)` for a missing key. A value that fails to decode
    /// is reported as a read error; callers treat it as a miss.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Read`] on backend failure or a corrupt entry.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        let Some(raw) = self.backend.get(key).await? else {
            trace!(key = %key, "Cache miss");
            return Ok(None);
        };

        trace!(key = %key, "Cache hit");
        let value = serde_json::from_str(&raw).map_err(|e| CacheError::Read(e.to_string()))?;
        Ok(Some(value))
    }

    /// Encode and store a value.
    ///
    /// `ttl = None` applies the cache's default TTL.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Write`] on backend failure.
    pub async fn set<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let raw = serde_json::to_string(value).map_err(|e| CacheError::Write(e.to_string()))?;
        let ttl = ttl.unwrap_or(self.default_ttl);
        self.backend.set(key, raw, ttl).await
    }

    /// Delete a single key.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Write`] on backend failure.
    pub async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.backend.delete(key).await
    }

    /// Delete every key under a prefix, returning the number removed.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Write`] on backend failure.
    pub async fn delete_prefix(&self, prefix: &str) -> Result<u64, CacheError> {
        self.backend.delete_prefix(prefix).await
    }

    /// Drop every entry in the backend.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Write`] on backend failure.
    pub async fn clear(&self) -> Result<(), CacheError> {
        self.backend.clear().await
    }
}
