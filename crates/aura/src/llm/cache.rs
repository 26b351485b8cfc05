// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Response caching for the LLM invocation layer.
//!
//! Two tiers: a distributed KV store (Redis, via `aura-redis-cache`) and a
//! local in-process LRU. [`TieredResponseCache`] consults the distributed
//! tier first and falls back to the local tier automatically when the
//! distributed backend errors; writes go through both. Keys are
//! `SHA256(prompt || model || temperature_bucket)` so identical calls across
//! processes share entries regardless of which tier answers.

use crate::error::Result;
use crate::language_models::CompletionResponse;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

/// Compute the cache key for a completion call.
///
/// Temperature is bucketed to one decimal place so float noise does not
/// fragment the cache.
#[must_use]
pub fn cache_key(prompt: &str, model: &str, temperature: Option<f32>) -> String {
    let bucket = ((temperature.unwrap_or(0.0) * 10.0).round() as i32).clamp(0, 20);
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hasher.update([0x1f]);
    hasher.update(model.as_bytes());
    hasher.update([0x1f]);
    hasher.update(bucket.to_le_bytes());
    hex::encode(hasher.finalize())
}

/// A cached, serialised completion response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CachedResponse {
    /// JSON-serialised [`CompletionResponse`].
    pub payload: Vec<u8>,
}

impl CachedResponse {
    /// Serialise a response for storage.
    pub fn encode(response: &CompletionResponse) -> Result<Self> {
        let payload = serde_json::to_vec(response)
            .map_err(|e| crate::error::Error::internal(format!("cache encode failed: {e}")))?;
        Ok(Self { payload })
    }

    /// Deserialise back into a response.
    pub fn decode(&self) -> Result<CompletionResponse> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| crate::error::Error::internal(format!("cache decode failed: {e}")))
    }
}

/// Counters describing a cache tier's behaviour, surfaced by the health
/// endpoint.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub backend: String,
    pub hits: u64,
    pub misses: u64,
    pub entries: u64,
    pub evictions: u64,
}

/// Storage interface for a single cache tier.
#[async_trait::async_trait]
pub trait ResponseCache: Send + Sync {
    /// Look up an entry. Expired entries count as misses.
    async fn get(&self, key: &str) -> Result<Option<CachedResponse>>;

    /// Store an entry with a strictly positive TTL.
    async fn put(&self, key: &str, value: &CachedResponse, ttl: Duration) -> Result<()>;

    /// Current counters for this tier.
    async fn stats(&self) -> CacheStats;

    /// Short backend identifier ("local", "redis", ...).
    fn backend(&self) -> &str;
}

struct LocalEntry {
    value: CachedResponse,
    created_at: Instant,
    ttl: Duration,
}

/// In-process LRU cache tier with per-entry TTL.
pub struct LocalResponseCache {
    entries: Mutex<lru::LruCache<String, LocalEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl LocalResponseCache {
    /// Create a local cache holding at most `max_size` entries.
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        let capacity = NonZeroUsize::new(max_size.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(lru::LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }
}

#[async_trait::async_trait]
impl ResponseCache for LocalResponseCache {
    async fn get(&self, key: &str) -> Result<Option<CachedResponse>> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.created_at.elapsed() < entry.ttl => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(entry.value.clone()))
            }
            Some(_) => {
                // Expired: evict eagerly so stale entries don't pin the LRU.
                entries.pop(key);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    async fn put(&self, key: &str, value: &CachedResponse, ttl: Duration) -> Result<()> {
        if ttl.is_zero() {
            return Err(crate::error::Error::invalid_input(
                "cache TTL must be strictly positive",
            ));
        }
        let mut entries = self.entries.lock();
        let at_capacity = entries.len() == usize::from(entries.cap());
        let evicted = entries.push(
            key.to_string(),
            LocalEntry {
                value: value.clone(),
                created_at: Instant::now(),
                ttl,
            },
        );
        if at_capacity {
            if let Some((old_key, _)) = evicted {
                if old_key != key {
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        Ok(())
    }

    async fn stats(&self) -> CacheStats {
        CacheStats {
            backend: "local".to_string(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries.lock().len() as u64,
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    fn backend(&self) -> &str {
        "local"
    }
}

/// Distributed-first cache with automatic local fallback.
///
/// A distributed-tier error is downgraded to a warning: reads fall through to
/// the local tier, writes still land locally. Misses propagate to the
/// provider as usual.
pub struct TieredResponseCache {
    distributed: Option<Arc<dyn ResponseCache>>,
    local: Arc<LocalResponseCache>,
}

impl TieredResponseCache {
    /// Local-only cache.
    #[must_use]
    pub fn local_only(max_size: usize) -> Self {
        Self {
            distributed: None,
            local: Arc::new(LocalResponseCache::new(max_size)),
        }
    }

    /// Distributed tier backed by a local fallback.
    #[must_use]
    pub fn with_distributed(distributed: Arc<dyn ResponseCache>, max_size: usize) -> Self {
        Self {
            distributed: Some(distributed),
            local: Arc::new(LocalResponseCache::new(max_size)),
        }
    }

    /// Stats for every configured tier, distributed first.
    pub async fn tier_stats(&self) -> Vec<CacheStats> {
        let mut stats = Vec::new();
        if let Some(distributed) = &self.distributed {
            stats.push(distributed.stats().await);
        }
        stats.push(self.local.stats().await);
        stats
    }
}

#[async_trait::async_trait]
impl ResponseCache for TieredResponseCache {
    async fn get(&self, key: &str) -> Result<Option<CachedResponse>> {
        if let Some(distributed) = &self.distributed {
            match distributed.get(key).await {
                Ok(Some(value)) => return Ok(Some(value)),
                Ok(None) => {}
                Err(e) => {
                    warn!(backend = distributed.backend(), error = %e,
                        "Distributed cache unavailable, falling back to local tier");
                }
            }
        }
        self.local.get(key).await
    }

    async fn put(&self, key: &str, value: &CachedResponse, ttl: Duration) -> Result<()> {
        if let Some(distributed) = &self.distributed {
            if let Err(e) = distributed.put(key, value, ttl).await {
                warn!(backend = distributed.backend(), error = %e,
                    "Distributed cache write failed, keeping local copy only");
            }
        }
        self.local.put(key, value, ttl).await
    }

    async fn stats(&self) -> CacheStats {
        self.local.stats().await
    }

    fn backend(&self) -> &str {
        "tiered"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn response(text: &str) -> CompletionResponse {
        CompletionResponse {
            text: text.to_string(),
            model: "m".to_string(),
            usage: None,
            finish_reason: None,
        }
    }

    #[test]
    fn cache_key_is_stable_and_bucketed() {
        let a = cache_key("prompt", "model", Some(0.70));
        let b = cache_key("prompt", "model", Some(0.71));
        let c = cache_key("prompt", "model", Some(0.80));
        assert_eq!(a, b, "temperatures in the same bucket share a key");
        assert_ne!(a, c);
        assert_ne!(cache_key("prompt", "other-model", Some(0.7)), a);
        assert_eq!(a.len(), 64);
    }

    #[tokio::test]
    async fn local_round_trip_within_ttl() {
        let cache = LocalResponseCache::new(10);
        let value = CachedResponse::encode(&response("hi")).unwrap();
        cache.put("k", &value, Duration::from_secs(60)).await.unwrap();

        let got = cache.get("k").await.unwrap().unwrap();
        assert_eq!(got.decode().unwrap().text, "hi");

        let stats = cache.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.entries, 1);
    }

    #[tokio::test]
    async fn local_expires_after_ttl() {
        let cache = LocalResponseCache::new(10);
        let value = CachedResponse::encode(&response("hi")).unwrap();
        cache.put("k", &value, Duration::from_millis(20)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(cache.get("k").await.unwrap().is_none());
        let stats = cache.stats().await;
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.evictions, 1);
    }

    #[tokio::test]
    async fn local_rejects_zero_ttl() {
        let cache = LocalResponseCache::new(10);
        let value = CachedResponse::encode(&response("hi")).unwrap();
        assert!(cache.put("k", &value, Duration::ZERO).await.is_err());
    }

    #[tokio::test]
    async fn local_evicts_on_overflow() {
        let cache = LocalResponseCache::new(2);
        let value = CachedResponse::encode(&response("x")).unwrap();
        cache.put("a", &value, Duration::from_secs(60)).await.unwrap();
        cache.put("b", &value, Duration::from_secs(60)).await.unwrap();
        cache.put("c", &value, Duration::from_secs(60)).await.unwrap();

        assert!(cache.get("a").await.unwrap().is_none());
        assert!(cache.get("c").await.unwrap().is_some());
        assert_eq!(cache.stats().await.evictions, 1);
    }

    struct BrokenCache;

    #[async_trait::async_trait]
    impl ResponseCache for BrokenCache {
        async fn get(&self, _key: &str) -> Result<Option<CachedResponse>> {
            Err(Error::unavailable("redis down"))
        }
        async fn put(&self, _key: &str, _value: &CachedResponse, _ttl: Duration) -> Result<()> {
            Err(Error::unavailable("redis down"))
        }
        async fn stats(&self) -> CacheStats {
            CacheStats {
                backend: "broken".to_string(),
                ..CacheStats::default()
            }
        }
        fn backend(&self) -> &str {
            "broken"
        }
    }

    #[tokio::test]
    async fn tiered_falls_back_to_local_when_distributed_errors() {
        let cache = TieredResponseCache::with_distributed(Arc::new(BrokenCache), 10);
        let value = CachedResponse::encode(&response("hi")).unwrap();

        // Write survives the distributed failure via the local tier.
        cache.put("k", &value, Duration::from_secs(60)).await.unwrap();
        let got = cache.get("k").await.unwrap().unwrap();
        assert_eq!(got.decode().unwrap().text, "hi");
    }

    struct CountingCache {
        inner: LocalResponseCache,
        gets: AtomicU64,
    }

    #[async_trait::async_trait]
    impl ResponseCache for CountingCache {
        async fn get(&self, key: &str) -> Result<Option<CachedResponse>> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            self.inner.get(key).await
        }
        async fn put(&self, key: &str, value: &CachedResponse, ttl: Duration) -> Result<()> {
            self.inner.put(key, value, ttl).await
        }
        async fn stats(&self) -> CacheStats {
            self.inner.stats().await
        }
        fn backend(&self) -> &str {
            "counting"
        }
    }

    #[tokio::test]
    async fn tiered_prefers_distributed_hit() {
        let distributed = Arc::new(CountingCache {
            inner: LocalResponseCache::new(10),
            gets: AtomicU64::new(0),
        });
        let cache =
            TieredResponseCache::with_distributed(Arc::clone(&distributed) as Arc<dyn ResponseCache>, 10);
        let value = CachedResponse::encode(&response("hi")).unwrap();
        cache.put("k", &value, Duration::from_secs(60)).await.unwrap();

        assert!(cache.get("k").await.unwrap().is_some());
        assert_eq!(distributed.gets.load(Ordering::SeqCst), 1);
    }
}
