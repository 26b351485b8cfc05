//! Service configuration with the recognised options and defaults.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

fn default_true() -> bool {
    true
}
fn default_cache_ttl_s() -> u64 {
    3600
}
fn default_cache_max_size() -> usize {
    1000
}
fn default_key_prefix() -> String {
    "aura".to_string()
}
fn default_pool_size() -> u32 {
    10
}
fn default_socket_timeout_s() -> f64 {
    2.0
}

/// LLM response cache settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub cache_enabled: bool,
    #[serde(default = "default_cache_ttl_s")]
    pub cache_ttl_s: u64,
    #[serde(default = "default_cache_max_size")]
    pub cache_max_size: usize,
    /// Whether a distributed (Redis) tier is configured at all.
    #[serde(default)]
    pub distributed_enabled: bool,
    #[serde(default)]
    pub distributed_url: Option<String>,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    #[serde(default = "default_socket_timeout_s")]
    pub socket_timeout_s: f64,
    #[serde(default = "default_socket_timeout_s")]
    pub socket_connect_timeout_s: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_enabled: true,
            cache_ttl_s: default_cache_ttl_s(),
            cache_max_size: default_cache_max_size(),
            distributed_enabled: false,
            distributed_url: None,
            key_prefix: default_key_prefix(),
            pool_size: default_pool_size(),
            socket_timeout_s: default_socket_timeout_s(),
            socket_connect_timeout_s: default_socket_timeout_s(),
        }
    }
}

impl CacheConfig {
    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_s.max(1))
    }
}

fn default_batch_size() -> usize {
    5
}
fn default_batch_delay_s() -> f64 {
    0.1
}

/// Batched-invocation settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_batch_delay_s")]
    pub batch_delay_s: f64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            batch_delay_s: default_batch_delay_s(),
        }
    }
}

impl BatchConfig {
    #[must_use]
    pub fn delay(&self) -> Duration {
        Duration::from_secs_f64(self.batch_delay_s.max(0.0))
    }
}

fn default_rate_limit_requests() -> u32 {
    100
}
fn default_rate_limit_window_s() -> u64 {
    60
}

/// One rate-limit bucket shape.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct RateLimitRule {
    pub requests: u32,
    pub window_s: u64,
}

/// Rate-limit settings with per-endpoint overrides.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RateLimitSettings {
    #[serde(default = "default_true")]
    pub rate_limit_enabled: bool,
    #[serde(default = "default_rate_limit_requests")]
    pub rate_limit_requests: u32,
    #[serde(default = "default_rate_limit_window_s")]
    pub rate_limit_window_s: u64,
    /// Per-endpoint overrides, e.g. `struggle -> 50/60s`, `audit -> 30/60s`.
    #[serde(default = "default_overrides")]
    pub overrides: HashMap<String, RateLimitRule>,
}

fn default_overrides() -> HashMap<String, RateLimitRule> {
    let mut overrides = HashMap::new();
    overrides.insert(
        "struggle".to_string(),
        RateLimitRule {
            requests: 50,
            window_s: 60,
        },
    );
    overrides.insert(
        "audit".to_string(),
        RateLimitRule {
            requests: 30,
            window_s: 60,
        },
    );
    overrides
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            rate_limit_enabled: true,
            rate_limit_requests: default_rate_limit_requests(),
            rate_limit_window_s: default_rate_limit_window_s(),
            overrides: default_overrides(),
        }
    }
}

impl RateLimitSettings {
    /// The effective rule for an endpoint.
    #[must_use]
    pub fn rule_for(&self, endpoint: &str) -> RateLimitRule {
        self.overrides
            .get(endpoint)
            .copied()
            .unwrap_or(RateLimitRule {
                requests: self.rate_limit_requests,
                window_s: self.rate_limit_window_s,
            })
    }
}

fn default_epoch_window_ms() -> u64 {
    60_000
}
fn default_max_supersteps() -> u64 {
    32
}

/// Top-level service configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
    #[serde(default)]
    pub privacy: aura_signals::PrivacyConfig,
    #[serde(default)]
    pub detector: aura_signals::DetectorConfig,
    #[serde(default)]
    pub aggregator: aura_signals::AggregatorConfig,
    /// Trigger-coalescing epoch: in-flight submissions for the same file
    /// within one epoch share a thread.
    #[serde(default = "default_epoch_window_ms")]
    pub epoch_window_ms: u64,
    /// Superstep cap per workflow thread.
    #[serde(default = "default_max_supersteps")]
    pub max_supersteps: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            batch: BatchConfig::default(),
            rate_limit: RateLimitSettings::default(),
            privacy: aura_signals::PrivacyConfig::default(),
            detector: aura_signals::DetectorConfig::default(),
            aggregator: aura_signals::AggregatorConfig::default(),
            epoch_window_ms: default_epoch_window_ms(),
            max_supersteps: default_max_supersteps(),
        }
    }
}

impl ServiceConfig {
    /// Invocation-layer options derived from the cache and batch settings.
    #[must_use]
    pub fn llm_options(&self) -> aura::LlmOptions {
        aura::LlmOptions {
            cache_enabled: self.cache.cache_enabled,
            cache_ttl: self.cache.ttl(),
            batch_size: self.batch.batch_size.max(1),
            batch_delay: self.batch.delay(),
            ..aura::LlmOptions::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_defaults() {
        let config = CacheConfig::default();
        assert!(config.cache_enabled);
        assert_eq!(config.cache_ttl_s, 3600);
        assert_eq!(config.cache_max_size, 1000);
        assert_eq!(config.key_prefix, "aura");
    }

    #[test]
    fn batch_defaults() {
        let config = BatchConfig::default();
        assert_eq!(config.batch_size, 5);
        assert!((config.batch_delay_s - 0.1).abs() < f64::EPSILON);
        assert_eq!(config.delay(), Duration::from_millis(100));
    }

    #[test]
    fn rate_limit_endpoint_overrides() {
        let settings = RateLimitSettings::default();
        assert_eq!(settings.rule_for("struggle").requests, 50);
        assert_eq!(settings.rule_for("audit").requests, 30);
        assert_eq!(settings.rule_for("unknown").requests, 100);
        assert_eq!(settings.rule_for("unknown").window_s, 60);
    }

    #[test]
    fn llm_options_follow_cache_and_batch_settings() {
        let config: ServiceConfig = serde_json::from_str(
            r#"{"cache": {"cache_enabled": false, "cache_ttl_s": 120}, "batch": {"batch_size": 2, "batch_delay_s": 0.5}}"#,
        )
        .unwrap();
        let options = config.llm_options();
        assert!(!options.cache_enabled);
        assert_eq!(options.cache_ttl, Duration::from_secs(120));
        assert_eq!(options.batch_size, 2);
        assert_eq!(options.batch_delay, Duration::from_millis(500));
    }

    #[test]
    fn service_config_deserialises_from_partial_json() {
        let config: ServiceConfig = serde_json::from_str(
            r#"{"cache": {"cache_ttl_s": 60}, "rate_limit": {"rate_limit_requests": 5}}"#,
        )
        .unwrap();
        assert_eq!(config.cache.cache_ttl_s, 60);
        assert_eq!(config.rate_limit.rate_limit_requests, 5);
        assert_eq!(config.batch.batch_size, 5);
        assert_eq!(config.epoch_window_ms, 60_000);
    }
}
