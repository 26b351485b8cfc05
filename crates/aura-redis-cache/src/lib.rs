//! Redis-backed distributed response cache for the Aura LLM layer.
//!
//! Implements the core [`ResponseCache`] trait over a shared Redis
//! instance. Entries are stored under `{key_prefix}:llm:{key}` with a
//! per-entry TTL (`SET ... EX`), so expiry is enforced server-side. All
//! operations are bounded by a socket timeout; a slow or unreachable Redis
//! surfaces as `upstream_unavailable`, which the tiered cache in the core
//! downgrades to a local-tier fallback.
//!
//! # Example
//!
//! ```rust,ignore
//! let distributed = RedisResponseCache::connect(&RedisCacheConfig {
//!     url: "redis://cache.internal:6379".to_string(),
//!     key_prefix: "aura".to_string(),
//!     ..RedisCacheConfig::default()
//! })
//! .await?;
//! let client = LlmClient::with_distributed_cache(model, options, Arc::new(distributed), 1000);
//! ```

use aura::llm::cache::{CacheStats, CachedResponse, ResponseCache};
use aura::{Error as AuraError, Result as AuraResult};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{error, info};

/// Connection settings for the distributed cache tier.
#[derive(Clone, Debug)]
pub struct RedisCacheConfig {
    /// Redis connection URL, e.g. `redis://localhost:6379`.
    pub url: String,
    /// Prefix for all keys written by this cache.
    pub key_prefix: String,
    /// Per-command deadline.
    pub socket_timeout: Duration,
    /// Initial connection deadline.
    pub socket_connect_timeout: Duration,
}

impl Default for RedisCacheConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            key_prefix: "aura".to_string(),
            socket_timeout: Duration::from_secs(2),
            socket_connect_timeout: Duration::from_secs(2),
        }
    }
}

/// Errors raised while connecting to Redis.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RedisCacheError {
    #[error("Redis connection error: {0}")]
    Connection(String),
}

impl From<RedisCacheError> for AuraError {
    fn from(err: RedisCacheError) -> Self {
        match err {
            RedisCacheError::Connection(msg) => AuraError::unavailable(msg),
        }
    }
}

/// Distributed response cache over Redis.
pub struct RedisResponseCache {
    manager: ConnectionManager,
    key_prefix: String,
    socket_timeout: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl RedisResponseCache {
    /// Connect and verify the server responds within the connect timeout.
    pub async fn connect(config: &RedisCacheConfig) -> Result<Self, RedisCacheError> {
        info!(key_prefix = %config.key_prefix, "Connecting to Redis response cache");
        let client = redis::Client::open(config.url.as_str()).map_err(|e| {
            error!("Failed to create Redis client: {}", e);
            RedisCacheError::Connection(e.to_string())
        })?;

        let manager = tokio::time::timeout(
            config.socket_connect_timeout,
            ConnectionManager::new(client),
        )
        .await
        .map_err(|_| {
            RedisCacheError::Connection(format!(
                "connect timed out after {}ms",
                config.socket_connect_timeout.as_millis()
            ))
        })?
        .map_err(|e| {
            error!("Failed to connect to Redis: {}", e);
            RedisCacheError::Connection(e.to_string())
        })?;

        Ok(Self {
            manager,
            key_prefix: config.key_prefix.clone(),
            socket_timeout: config.socket_timeout,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    fn redis_key(&self, key: &str) -> String {
        format!("{}:llm:{key}", self.key_prefix)
    }

    async fn bounded<T, F>(&self, operation: &str, fut: F) -> AuraResult<T>
    where
        F: std::future::Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.socket_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(AuraError::unavailable(format!(
                "redis {operation} failed: {e}"
            ))),
            Err(_) => Err(AuraError::timeout(format!(
                "redis {operation} exceeded {}ms",
                self.socket_timeout.as_millis()
            ))),
        }
    }
}

#[async_trait::async_trait]
impl ResponseCache for RedisResponseCache {
    async fn get(&self, key: &str) -> AuraResult<Option<CachedResponse>> {
        let mut conn = self.manager.clone();
        let redis_key = self.redis_key(key);
        let payload: Option<Vec<u8>> = self
            .bounded("GET", conn.get(&redis_key))
            .await?;

        match payload {
            Some(payload) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(CachedResponse { payload }))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    async fn put(&self, key: &str, value: &CachedResponse, ttl: Duration) -> AuraResult<()> {
        if ttl.is_zero() {
            return Err(AuraError::invalid_input(
                "cache TTL must be strictly positive",
            ));
        }
        let mut conn = self.manager.clone();
        let redis_key = self.redis_key(key);
        let ttl_secs = ttl.as_secs().max(1);
        self.bounded::<(), _>(
            "SET",
            conn.set_ex(&redis_key, value.payload.as_slice(), ttl_secs),
        )
        .await
    }

    async fn stats(&self) -> CacheStats {
        let entries = {
            let mut conn = self.manager.clone();
            let pattern = format!("{}:llm:*", self.key_prefix);
            // Best-effort: KEYS over the prefix, bounded by the socket
            // timeout. DBSIZE would count keys outside this prefix.
            match tokio::time::timeout(self.socket_timeout, async {
                let keys: redis::RedisResult<Vec<String>> = conn.keys(&pattern).await;
                keys
            })
            .await
            {
                Ok(Ok(keys)) => keys.len() as u64,
                _ => 0,
            }
        };

        CacheStats {
            backend: "redis".to_string(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries,
            evictions: 0,
        }
    }

    fn backend(&self) -> &str {
        "redis"
    }
}
