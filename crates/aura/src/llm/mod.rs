// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! LLM invocation layer: caching, retry, timeout, and batching around a
//! [`CompletionModel`].
//!
//! Call order for [`LlmClient::invoke`]: cache lookup (distributed tier
//! first, local fallback) -> provider call with per-call timeout and
//! exponential backoff for retryable failures -> cache store with TTL.
//! Prompts carrying scrubber redaction markers are never cached - a redacted
//! prompt is not a stable key and the payload may still be sensitive in
//! aggregate.

pub mod cache;

use crate::error::{Error, Result};
use crate::language_models::{CompletionModel, CompletionRequest, CompletionResponse};
use crate::retry::RetryPolicy;
use crate::scrub;
use cache::{cache_key, CacheStats, CachedResponse, ResponseCache, TieredResponseCache};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Tunables for the invocation layer.
#[derive(Clone, Debug)]
pub struct LlmOptions {
    /// Whether responses are cached at all.
    pub cache_enabled: bool,
    /// TTL applied when storing cache entries.
    pub cache_ttl: Duration,
    /// Per-call deadline for the provider.
    pub timeout: Duration,
    /// Backoff policy for retryable provider failures.
    pub retry: RetryPolicy,
    /// Maximum concurrently in-flight calls within `invoke_batch`.
    pub batch_size: usize,
    /// Fixed delay between consecutive batches; zero disables it.
    pub batch_delay: Duration,
}

impl Default for LlmOptions {
    fn default() -> Self {
        Self {
            cache_enabled: true,
            cache_ttl: Duration::from_secs(3600),
            timeout: Duration::from_secs(60),
            retry: RetryPolicy::default(),
            batch_size: 5,
            batch_delay: Duration::from_millis(100),
        }
    }
}

/// Single entrypoint for completion calls.
///
/// Cheap to clone; the model and cache are shared.
#[derive(Clone)]
pub struct LlmClient {
    model: Arc<dyn CompletionModel>,
    cache: Arc<TieredResponseCache>,
    options: LlmOptions,
}

impl LlmClient {
    /// Build a client with a local-only cache sized by `cache_max_size`.
    pub fn new(model: Arc<dyn CompletionModel>, options: LlmOptions, cache_max_size: usize) -> Self {
        Self {
            model,
            cache: Arc::new(TieredResponseCache::local_only(cache_max_size)),
            options,
        }
    }

    /// Build a client with a distributed cache tier over a local fallback.
    pub fn with_distributed_cache(
        model: Arc<dyn CompletionModel>,
        options: LlmOptions,
        distributed: Arc<dyn ResponseCache>,
        cache_max_size: usize,
    ) -> Self {
        Self {
            model,
            cache: Arc::new(TieredResponseCache::with_distributed(
                distributed,
                cache_max_size,
            )),
            options,
        }
    }

    /// Per-tier cache statistics for the health report.
    pub async fn cache_stats(&self) -> Vec<CacheStats> {
        self.cache.tier_stats().await
    }

    fn request_cache_key(&self, request: &CompletionRequest) -> String {
        let model = request
            .model
            .as_deref()
            .unwrap_or_else(|| self.model.model_name());
        cache_key(&request.prompt, model, request.temperature)
    }

    /// Execute a single completion with caching, retry, and timeout.
    pub async fn invoke(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        let cacheable = self.options.cache_enabled && !scrub::was_redacted(&request.prompt);
        let key = self.request_cache_key(request);

        if cacheable {
            if let Some(cached) = self.cache.get(&key).await? {
                debug!(provider = self.model.provider(), "LLM cache hit");
                return cached.decode();
            }
        }

        let response = self.call_with_retry(request).await?;

        if cacheable {
            let encoded = CachedResponse::encode(&response)?;
            if let Err(e) = self.cache.put(&key, &encoded, self.options.cache_ttl).await {
                warn!(error = %e, "Failed to store LLM response in cache");
            }
        }

        Ok(response)
    }

    /// Execute many completions with bounded concurrency.
    ///
    /// At most `batch_size` calls are in flight at once; an optional fixed
    /// delay separates batches. The result list always has the same length
    /// and order as the input - per-prompt failures are captured in place and
    /// never abort sibling calls.
    pub async fn invoke_batch(
        &self,
        requests: Vec<CompletionRequest>,
    ) -> Vec<Result<CompletionResponse>> {
        let mut results = Vec::with_capacity(requests.len());
        let batch_size = self.options.batch_size.max(1);
        let total_batches = requests.len().div_ceil(batch_size);

        for (batch_ix, chunk) in requests.chunks(batch_size).enumerate() {
            let futures: Vec<_> = chunk.iter().map(|request| self.invoke(request)).collect();
            let batch_results = futures::future::join_all(futures).await;
            results.extend(batch_results);

            if batch_ix + 1 < total_batches && !self.options.batch_delay.is_zero() {
                tokio::time::sleep(self.options.batch_delay).await;
            }
        }

        results
    }

    async fn call_with_retry(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        let mut attempt: u32 = 0;
        loop {
            let result = match tokio::time::timeout(
                self.options.timeout,
                self.model.complete(request),
            )
            .await
            {
                Ok(inner) => inner,
                Err(_) => Err(Error::timeout(format!(
                    "provider '{}' call exceeded {}ms",
                    self.model.provider(),
                    self.options.timeout.as_millis()
                ))),
            };

            match result {
                Ok(response) => return Ok(response),
                Err(err) => match self.options.retry.delay_for(attempt, &err) {
                    Some(delay) => {
                        warn!(
                            provider = self.model.provider(),
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "Retryable provider failure, backing off"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    None => return Err(err),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::language_models::MockCompletionModel;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_options() -> LlmOptions {
        LlmOptions {
            retry: RetryPolicy {
                max_retries: 2,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(2),
                multiplier: 2.0,
                jitter: 0.0,
            },
            batch_delay: Duration::ZERO,
            ..LlmOptions::default()
        }
    }

    #[tokio::test]
    async fn second_identical_call_hits_cache() {
        let model = MockCompletionModel::answering("cached answer");
        let client = LlmClient::new(
            Arc::clone(&model) as Arc<dyn CompletionModel>,
            fast_options(),
            100,
        );

        let request = CompletionRequest::new("same prompt").with_temperature(0.7);
        let first = client.invoke(&request).await.unwrap();
        let second = client.invoke(&request).await.unwrap();

        // Bit-identical response, single provider call.
        assert_eq!(first, second);
        assert_eq!(model.call_count(), 1);
    }

    #[tokio::test]
    async fn different_temperature_bucket_misses_cache() {
        let model = MockCompletionModel::answering("answer");
        let client = LlmClient::new(
            Arc::clone(&model) as Arc<dyn CompletionModel>,
            fast_options(),
            100,
        );

        client
            .invoke(&CompletionRequest::new("p").with_temperature(0.1))
            .await
            .unwrap();
        client
            .invoke(&CompletionRequest::new("p").with_temperature(0.9))
            .await
            .unwrap();
        assert_eq!(model.call_count(), 2);
    }

    #[tokio::test]
    async fn redacted_prompts_are_never_cached() {
        let model = MockCompletionModel::answering("answer");
        let client = LlmClient::new(
            Arc::clone(&model) as Arc<dyn CompletionModel>,
            fast_options(),
            100,
        );

        let request = CompletionRequest::new("context: [REDACTED:api_key] do the thing");
        client.invoke(&request).await.unwrap();
        client.invoke(&request).await.unwrap();
        assert_eq!(model.call_count(), 2);
    }

    #[tokio::test]
    async fn transient_provider_failure_retries() {
        let model = MockCompletionModel::scripted(vec![
            Err(Error::transient("blip")),
            Ok("recovered".to_string()),
        ]);
        let client = LlmClient::new(
            Arc::clone(&model) as Arc<dyn CompletionModel>,
            fast_options(),
            100,
        );

        let response = client.invoke(&CompletionRequest::new("p")).await.unwrap();
        assert_eq!(response.text, "recovered");
        assert_eq!(model.call_count(), 2);
    }

    #[tokio::test]
    async fn non_retryable_failure_propagates_without_retry() {
        let model = MockCompletionModel::scripted(vec![Err(Error::non_retryable("refusal"))]);
        let client = LlmClient::new(
            Arc::clone(&model) as Arc<dyn CompletionModel>,
            fast_options(),
            100,
        );

        let result = client.invoke(&CompletionRequest::new("p")).await;
        assert!(matches!(result, Err(Error::NonRetryable(_))));
        assert_eq!(model.call_count(), 1);
    }

    #[tokio::test]
    async fn batch_results_are_positional_with_partial_failure() {
        // Third call fails non-retryably; siblings succeed.
        let model = MockCompletionModel::scripted(vec![
            Ok("r0".to_string()),
            Ok("r1".to_string()),
            Err(Error::non_retryable("bad prompt")),
            Ok("r3".to_string()),
            Ok("r4".to_string()),
        ]);
        let client = LlmClient::new(
            Arc::clone(&model) as Arc<dyn CompletionModel>,
            LlmOptions {
                cache_enabled: false,
                batch_size: 1, // serialise so the script lines up with positions
                ..fast_options()
            },
            100,
        );

        let requests: Vec<_> = (0..5)
            .map(|i| CompletionRequest::new(format!("prompt {i}")))
            .collect();
        let results = client.invoke_batch(requests).await;

        assert_eq!(results.len(), 5);
        assert_eq!(results[0].as_ref().unwrap().text, "r0");
        assert_eq!(results[1].as_ref().unwrap().text, "r1");
        assert!(results[2].is_err());
        assert_eq!(results[3].as_ref().unwrap().text, "r3");
        assert_eq!(results[4].as_ref().unwrap().text, "r4");
    }

    #[tokio::test]
    async fn batch_bounds_concurrency() {
        struct GaugeModel {
            in_flight: AtomicU32,
            peak: AtomicU32,
        }

        #[async_trait::async_trait]
        impl CompletionModel for GaugeModel {
            async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
                let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(CompletionResponse {
                    text: request.prompt.clone(),
                    model: "gauge".to_string(),
                    usage: None,
                    finish_reason: None,
                })
            }
            fn model_name(&self) -> &str {
                "gauge"
            }
            fn provider(&self) -> &str {
                "gauge"
            }
        }

        let model = Arc::new(GaugeModel {
            in_flight: AtomicU32::new(0),
            peak: AtomicU32::new(0),
        });
        let client = LlmClient::new(
            Arc::clone(&model) as Arc<dyn CompletionModel>,
            LlmOptions {
                cache_enabled: false,
                batch_size: 3,
                batch_delay: Duration::ZERO,
                ..fast_options()
            },
            100,
        );

        let requests: Vec<_> = (0..9)
            .map(|i| CompletionRequest::new(format!("p{i}")))
            .collect();
        let results = client.invoke_batch(requests).await;
        assert_eq!(results.len(), 9);
        assert!(results.iter().all(Result::is_ok));
        assert!(model.peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn per_call_timeout_maps_to_upstream_timeout() {
        struct SlowModel;

        #[async_trait::async_trait]
        impl CompletionModel for SlowModel {
            async fn complete(&self, _request: &CompletionRequest) -> Result<CompletionResponse> {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(CompletionResponse {
                    text: String::new(),
                    model: "slow".to_string(),
                    usage: None,
                    finish_reason: None,
                })
            }
            fn model_name(&self) -> &str {
                "slow"
            }
            fn provider(&self) -> &str {
                "slow"
            }
        }

        let client = LlmClient::new(
            Arc::new(SlowModel),
            LlmOptions {
                timeout: Duration::from_millis(10),
                retry: RetryPolicy::none(),
                ..fast_options()
            },
            100,
        );

        let result = client.invoke(&CompletionRequest::new("p")).await;
        assert!(matches!(result, Err(Error::UpstreamTimeout(_))));
    }
}
