//! Caching layer for Vitrine Core.
//!
//! This module provides:
//!
//! - **Backend Abstraction**: pluggable tiers (in-memory, Redis, tiered)
//! - **Deterministic Keys**: filter normalization and key derivation with a
//!   namespace version counter for bulk invalidation
//! - **HTTP Primitives**: ETag generation and Cache-Control construction
//!
//! The [`CacheStore`] facade owns a [`TieredBackend`] and exposes typed
//! JSON get/set plus namespace-version bookkeeping. Every cache failure is
//! logged and degraded to a miss: the storefront must keep serving when the
//! cache infrastructure is down.

pub mod backend;
pub mod http;
pub mod key;

pub use backend::{CacheBackend, CacheTier, InMemoryBackend, RedisBackend, TieredBackend};
pub use http::{CacheControl, ETagGenerator};
pub use key::{FilterParams, NormalizedFilter, CATEGORIES_NAMESPACE, PRODUCTS_NAMESPACE};

use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Namespace versions are effectively immortal; Redis still needs a TTL.
const VERSION_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

// ═══════════════════════════════════════════════════════════════════════════════
// Cache Store
// ═══════════════════════════════════════════════════════════════════════════════

/// Unified cache facade over the tiered backend.
///
/// Constructed once at process start and injected wherever caching is needed;
/// there is no module-level global.
pub struct CacheStore {
    backend: Arc<TieredBackend>,
}

impl CacheStore {
    /// Create a store over the given tiered backend.
    pub fn new(backend: Arc<TieredBackend>) -> Self {
        Self { backend }
    }

    /// Memory-only store for tests and degraded deployments.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(TieredBackend::memory_only()))
    }

    /// Whether a distributed tier is attached.
    pub fn has_distributed(&self) -> bool {
        self.backend.has_distributed()
    }

    /// Get a JSON value. Decode failures and backend errors degrade to a miss.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<(T, CacheTier)> {
        let (bytes, tier) = match self.backend.get_with_tier(key).await {
            Ok(Some(hit)) => hit,
            Ok(None) => return None,
            Err(e) => {
                warn!(key, error = %e, "Cache read failed");
                return None;
            }
        };

        match serde_json::from_slice(&bytes) {
            Ok(value) => Some((value, tier)),
            Err(e) => {
                // A corrupt entry is worse than a miss; drop it.
                warn!(key, error = %e, "Dropping undecodable cache entry");
                let _ = self.backend.delete(key).await;
                None
            }
        }
    }

    /// Write a JSON value to both tiers. Failures are logged, never raised.
    pub async fn set_json<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        let bytes = match serde_json::to_vec(value) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(key, error = %e, "Cache serialization failed");
                return;
            }
        };

        if let Err(e) = self.backend.set(key, bytes, ttl).await {
            warn!(key, error = %e, "Cache write failed");
        }
    }

    /// Delete a key from both tiers.
    pub async fn delete(&self, key: &str) -> bool {
        match self.backend.delete(key).await {
            Ok(deleted) => deleted,
            Err(e) => {
                warn!(key, error = %e, "Cache delete failed");
                false
            }
        }
    }

    /// Delete every key under a prefix. Returns the number deleted; a scan
    /// failure purges whatever was enumerated before it.
    pub async fn purge_prefix(&self, prefix: &str) -> u64 {
        let keys = match self.backend.scan_prefix(prefix).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(prefix, error = %e, "Cache scan failed, nothing purged");
                return 0;
            }
        };

        let mut deleted = 0;
        for key in keys {
            if self.delete(&key).await {
                deleted += 1;
            }
        }

        info!(prefix, deleted, "Purged cache prefix");
        deleted
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Namespace Versions
    // ─────────────────────────────────────────────────────────────────────────

    fn version_key(namespace: &str) -> String {
        format!("ns:{}:version", namespace)
    }

    /// Get the current version for a namespace, initializing it to 1.
    pub async fn namespace_version(&self, namespace: &str) -> u64 {
        let key = Self::version_key(namespace);
        if let Some((version, _)) = self.get_json::<u64>(&key).await {
            if version > 0 {
                return version;
            }
        }

        self.set_json(&key, &1u64, VERSION_TTL).await;
        1
    }

    /// Increment the version for a namespace, invalidating every key derived
    /// under the previous version without touching the entries themselves.
    pub async fn bump_namespace(&self, namespace: &str) -> u64 {
        let key = Self::version_key(namespace);
        let current = self
            .get_json::<u64>(&key)
            .await
            .map(|(v, _)| v)
            .unwrap_or(1);
        let next = current + 1;
        self.set_json(&key, &next, VERSION_TTL).await;
        debug!(namespace, from = current, to = next, "Bumped cache namespace version");
        next
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
