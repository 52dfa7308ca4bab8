//! Cache backend implementations.
//!
//! This module provides the pluggable storage tiers behind [`crate::cache::CacheStore`]:
//! - **InMemoryBackend**: process-local map, fast and volatile
//! - **RedisBackend**: distributed cache shared across processes
//! - **TieredBackend**: distributed-first reads with local fallback, dual writes
//!
//! Caching is an optimization, never a dependency: the tiered backend treats a
//! distributed-tier failure as a miss and keeps serving from the local tier.

use crate::error::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use metrics::counter;
use redis::AsyncCommands;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// Cache Backend Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Which tier produced a cache hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTier {
    Memory,
    Distributed,
}

impl CacheTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Distributed => "distributed",
        }
    }
}

/// Trait for cache backends. Values are opaque serialized bytes.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Get a value from the cache.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Set a value in the cache with a TTL.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()>;

    /// Delete a value from the cache. Returns whether a value was present.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Enumerate keys starting with the given prefix.
    ///
    /// Implementations tolerate partial failure: keys enumerated before an
    /// error are returned and the error is logged, not propagated.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// Get the backend name.
    fn name(&self) -> &'static str;
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-Memory Backend
// ═══════════════════════════════════════════════════════════════════════════════

struct StoredValue {
    data: Vec<u8>,
    expires_at: Instant,
}

/// Process-local cache backend. Entries expire lazily at read time.
pub struct InMemoryBackend {
    entries: DashMap<String, StoredValue>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Remove every expired entry. Returns the number evicted.
    pub fn sweep_expired(&self) -> u64 {
        let now = Instant::now();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.value().expires_at <= now)
            .map(|e| e.key().clone())
            .collect();

        let count = expired.len() as u64;
        for key in expired {
            self.entries.remove(&key);
        }
        if count > 0 {
            debug!(evicted = count, "Swept expired in-memory cache entries");
        }
        count
    }

    /// Number of live entries (expired-but-unswept included).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheBackend for InMemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        if let Some(entry) = self.entries.get(key) {
            if entry.expires_at <= Instant::now() {
                drop(entry);
                self.entries.remove(key);
                counter!("vitrine_cache_misses_total", "backend" => "memory", "reason" => "expired")
                    .increment(1);
                return Ok(None);
            }
            counter!("vitrine_cache_hits_total", "backend" => "memory").increment(1);
            Ok(Some(entry.data.clone()))
        } else {
            counter!("vitrine_cache_misses_total", "backend" => "memory", "reason" => "not_found")
                .increment(1);
            Ok(None)
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        self.entries.insert(
            key.to_string(),
            StoredValue {
                data: value,
                expires_at: Instant::now() + ttl,
            },
        );
        counter!("vitrine_cache_sets_total", "backend" => "memory").increment(1);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.entries.remove(key).is_some())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let now = Instant::now();
        Ok(self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix) && e.value().expires_at > now)
            .map(|e| e.key().clone())
            .collect())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Redis Backend
// ═══════════════════════════════════════════════════════════════════════════════

/// Distributed cache backend over Redis.
///
/// Keys are namespaced with a configured prefix so several services can share
/// one Redis instance.
pub struct RedisBackend {
    client: redis::Client,
    key_prefix: String,
}

impl RedisBackend {
    /// Create a new Redis backend and verify connectivity.
    pub async fn new(url: &str, key_prefix: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(url)?;

        let mut conn = client.get_multiplexed_async_connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;

        info!(url, "Redis cache backend connected");

        Ok(Self {
            client,
            key_prefix: key_prefix.into(),
        })
    }

    async fn get_conn(&self) -> Result<redis::aio::MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }
}

#[async_trait]
impl CacheBackend for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.get_conn().await?;
        let data: Option<Vec<u8>> = conn.get(self.full_key(key)).await?;

        match data {
            Some(bytes) => {
                counter!("vitrine_cache_hits_total", "backend" => "redis").increment(1);
                Ok(Some(bytes))
            }
            None => {
                counter!("vitrine_cache_misses_total", "backend" => "redis", "reason" => "not_found")
                    .increment(1);
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        let mut conn = self.get_conn().await?;
        let ttl_secs = ttl.as_secs().max(1);
        conn.set_ex::<_, _, ()>(self.full_key(key), value, ttl_secs)
            .await?;
        counter!("vitrine_cache_sets_total", "backend" => "redis").increment(1);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.get_conn().await?;
        let deleted: i64 = conn.del(self.full_key(key)).await?;
        Ok(deleted > 0)
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut conn = match self.get_conn().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "Redis scan aborted before start");
                return Ok(Vec::new());
            }
        };

        let pattern = format!("{}{}*", self.key_prefix, prefix);
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let scanned: std::result::Result<(u64, Vec<String>), redis::RedisError> =
                redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(&pattern)
                    .arg("COUNT")
                    .arg(100)
                    .query_async(&mut conn)
                    .await;

            match scanned {
                Ok((next_cursor, batch)) => {
                    let prefix_len = self.key_prefix.len();
                    keys.extend(
                        batch
                            .into_iter()
                            .filter(|k| k.len() >= prefix_len)
                            .map(|k| k[prefix_len..].to_string()),
                    );
                    cursor = next_cursor;
                    if cursor == 0 {
                        break;
                    }
                }
                Err(e) => {
                    // Partial enumeration is still useful; return what we have.
                    warn!(error = %e, enumerated = keys.len(), "Redis scan failed mid-way");
                    break;
                }
            }
        }

        Ok(keys)
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tiered Backend
// ═══════════════════════════════════════════════════════════════════════════════

/// Two-tier backend: distributed (authoritative, shared) in front of a
/// process-local map.
///
/// Reads try the distributed tier first; a miss or an error falls back to the
/// local tier. Writes go to both tiers. Distributed failures are logged and
/// swallowed so serving never depends on the cache infrastructure.
pub struct TieredBackend {
    local: Arc<InMemoryBackend>,
    distributed: Option<Arc<dyn CacheBackend>>,
}

impl TieredBackend {
    pub fn new(local: Arc<InMemoryBackend>, distributed: Option<Arc<dyn CacheBackend>>) -> Self {
        Self { local, distributed }
    }

    /// Memory-only store, used when the distributed tier is not configured.
    pub fn memory_only() -> Self {
        Self::new(Arc::new(InMemoryBackend::new()), None)
    }

    /// Whether a distributed tier is attached.
    pub fn has_distributed(&self) -> bool {
        self.distributed.is_some()
    }

    /// Get a value together with the tier that served it.
    pub async fn get_with_tier(&self, key: &str) -> Result<Option<(Vec<u8>, CacheTier)>> {
        if let Some(ref distributed) = self.distributed {
            match distributed.get(key).await {
                Ok(Some(bytes)) => return Ok(Some((bytes, CacheTier::Distributed))),
                Ok(None) => {}
                Err(e) => {
                    // Treated as a miss; the local tier still serves.
                    counter!("vitrine_cache_errors_total", "backend" => "redis", "op" => "get")
                        .increment(1);
                    warn!(key, error = %e, "Distributed cache read failed, falling back to local");
                }
            }
        }

        Ok(self
            .local
            .get(key)
            .await?
            .map(|bytes| (bytes, CacheTier::Memory)))
    }
}

#[async_trait]
impl CacheBackend for TieredBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.get_with_tier(key).await?.map(|(bytes, _)| bytes))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        self.local.set(key, value.clone(), ttl).await?;

        if let Some(ref distributed) = self.distributed {
            if let Err(e) = distributed.set(key, value, ttl).await {
                counter!("vitrine_cache_errors_total", "backend" => "redis", "op" => "set")
                    .increment(1);
                warn!(key, error = %e, "Distributed cache write failed");
            }
        }

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let local_deleted = self.local.delete(key).await?;

        let mut distributed_deleted = false;
        if let Some(ref distributed) = self.distributed {
            match distributed.delete(key).await {
                Ok(deleted) => distributed_deleted = deleted,
                Err(e) => {
                    warn!(key, error = %e, "Distributed cache delete failed");
                }
            }
        }

        Ok(local_deleted || distributed_deleted)
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = self.local.scan_prefix(prefix).await?;

        if let Some(ref distributed) = self.distributed {
            match distributed.scan_prefix(prefix).await {
                Ok(remote) => {
                    for key in remote {
                        if !keys.contains(&key) {
                            keys.push(key);
                        }
                    }
                }
                Err(e) => {
                    warn!(prefix, error = %e, "Distributed cache scan failed");
                }
            }
        }

        Ok(keys)
    }

    fn name(&self) -> &'static str {
        "tiered"
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_roundtrip() {
        let backend = InMemoryBackend::new();

        backend
            .set("key1", b"value".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();

        let value = backend.get("key1").await.unwrap();
        assert_eq!(value, Some(b"value".to_vec()));

        assert!(backend.delete("key1").await.unwrap());
        assert_eq!(backend.get("key1").await.unwrap(), None);
        assert!(!backend.delete("key1").await.unwrap());
    }

    #[tokio::test]
    async fn test_in_memory_expiry() {
        let backend = InMemoryBackend::new();
        backend
            .set("short", b"x".to_vec(), Duration::from_millis(10))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(backend.get("short").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_in_memory_scan_prefix() {
        let backend = InMemoryBackend::new();
        backend
            .set("products:a", b"1".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();
        backend
            .set("products:b", b"2".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();
        backend
            .set("categories:c", b"3".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();

        let mut keys = backend.scan_prefix("products:").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["products:a", "products:b"]);
    }

    #[tokio::test]
    async fn test_sweep_expired() {
        let backend = InMemoryBackend::new();
        backend
            .set("gone", b"x".to_vec(), Duration::from_millis(1))
            .await
            .unwrap();
        backend
            .set("kept", b"y".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(backend.sweep_expired(), 1);
        assert_eq!(backend.len(), 1);
    }

    /// A distributed tier that always fails, for fallback tests.
    struct BrokenBackend;

    #[async_trait]
    impl CacheBackend for BrokenBackend {
        async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>> {
            Err(crate::error::VitrineError::new(
                crate::error::ErrorCode::CacheUnavailable,
                "broken",
            ))
        }

        async fn set(&self, _key: &str, _value: Vec<u8>, _ttl: Duration) -> Result<()> {
            Err(crate::error::VitrineError::new(
                crate::error::ErrorCode::CacheUnavailable,
                "broken",
            ))
        }

        async fn delete(&self, _key: &str) -> Result<bool> {
            Err(crate::error::VitrineError::new(
                crate::error::ErrorCode::CacheUnavailable,
                "broken",
            ))
        }

        async fn scan_prefix(&self, _prefix: &str) -> Result<Vec<String>> {
            Err(crate::error::VitrineError::new(
                crate::error::ErrorCode::CacheUnavailable,
                "broken",
            ))
        }

        fn name(&self) -> &'static str {
            "broken"
        }
    }

    #[tokio::test]
    async fn test_tiered_falls_back_to_local_on_distributed_error() {
        let local = Arc::new(InMemoryBackend::new());
        let tiered = TieredBackend::new(local.clone(), Some(Arc::new(BrokenBackend)));

        // Write survives the broken distributed tier.
        tiered
            .set("key", b"payload".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();

        let hit = tiered.get_with_tier("key").await.unwrap();
        let (bytes, tier) = hit.expect("local tier should serve");
        assert_eq!(bytes, b"payload".to_vec());
        assert_eq!(tier, CacheTier::Memory);
    }

    #[tokio::test]
    async fn test_tiered_scan_tolerates_distributed_failure() {
        let local = Arc::new(InMemoryBackend::new());
        local
            .set("p:1", b"x".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();
        let tiered = TieredBackend::new(local, Some(Arc::new(BrokenBackend)));

        let keys = tiered.scan_prefix("p:").await.unwrap();
        assert_eq!(keys, vec!["p:1"]);
    }

    #[tokio::test]
    async fn test_memory_only_tiered() {
        let tiered = TieredBackend::memory_only();
        assert!(!tiered.has_distributed());

        tiered
            .set("k", b"v".to_vec(), Duration::from_secs(5))
            .await
            .unwrap();
        let (bytes, tier) = tiered.get_with_tier("k").await.unwrap().unwrap();
        assert_eq!(bytes, b"v".to_vec());
        assert_eq!(tier, CacheTier::Memory);
    }
}
