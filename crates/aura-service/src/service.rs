//! Workflow service: rate-limited submission, thread queries, health.
//!
//! Services are explicitly constructed and injected - there are no
//! process-wide singletons. Tests swap in fresh instances (mock models,
//! in-memory stores) through the same constructor.

use crate::audit::{build_audit_graph, AuditState};
use crate::bridge::coalesced_thread_id;
use crate::config::ServiceConfig;
use crate::dto::{HealthReport, Page, TriggerRequest, TriggerResponse, WorkflowStateDto};
use crate::struggle::{build_struggle_graph, StruggleState};
use aura::checkpoint::status;
use aura::rate_limiters::{RateLimitConfig, RateLimitDecision, TokenBucketRateLimiter};
use aura::{
    Checkpointer, CompiledGraph, Error, KnowledgeRetriever, LlmClient, Result,
};
use chrono::{DateTime, Utc};
use dashmap::DashSet;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{info, warn};

/// Endpoint names used for rate-limit override lookup.
const ENDPOINT_STRUGGLE: &str = "struggle";
const ENDPOINT_AUDIT: &str = "audit";

fn to_datetime(time: SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(time)
}

/// Backend assembly over injected retrieval, LLM, and checkpoint services.
pub struct WorkflowService {
    struggle_graph: CompiledGraph<StruggleState>,
    audit_graph: CompiledGraph<AuditState>,
    checkpointer: Arc<dyn Checkpointer<StruggleState>>,
    llm: Arc<LlmClient>,
    limiters: HashMap<&'static str, TokenBucketRateLimiter>,
    inflight: DashSet<String>,
    epoch_window_ms: u64,
}

impl WorkflowService {
    /// Assemble the service from its collaborators.
    pub fn new(
        config: &ServiceConfig,
        checkpointer: Arc<dyn Checkpointer<StruggleState>>,
        retriever: Arc<KnowledgeRetriever>,
        llm: Arc<LlmClient>,
    ) -> Result<Self> {
        let struggle_graph =
            build_struggle_graph(config, Arc::clone(&retriever), Arc::clone(&llm))?
                .with_checkpointer_arc(Arc::clone(&checkpointer));
        let audit_graph = build_audit_graph(retriever, Arc::clone(&llm))?;

        let mut limiters = HashMap::new();
        for endpoint in [ENDPOINT_STRUGGLE, ENDPOINT_AUDIT] {
            let rule = config.rate_limit.rule_for(endpoint);
            limiters.insert(
                endpoint,
                TokenBucketRateLimiter::new(RateLimitConfig {
                    enabled: config.rate_limit.rate_limit_enabled,
                    requests: rule.requests,
                    window: Duration::from_secs(rule.window_s.max(1)),
                }),
            );
        }

        Ok(Self {
            struggle_graph,
            audit_graph,
            checkpointer,
            llm,
            limiters,
            inflight: DashSet::new(),
            epoch_window_ms: config.epoch_window_ms,
        })
    }

    fn check_rate_limit(&self, endpoint: &str, client_id: &str) -> Result<()> {
        let Some(limiter) = self.limiters.get(endpoint) else {
            return Ok(());
        };
        match limiter.check(client_id) {
            RateLimitDecision::Allowed { .. } => Ok(()),
            RateLimitDecision::Rejected { retry_after } => Err(Error::rate_limited(
                format!("rate limit exceeded for '{endpoint}'"),
                Some(retry_after),
            )),
        }
    }

    /// The thread a submission coalesces into.
    #[must_use]
    pub fn thread_id_for(&self, request: &TriggerRequest) -> String {
        let file_key = request
            .file_path
            .as_deref()
            .unwrap_or_else(|| {
                if request.source.is_empty() {
                    "unknown"
                } else {
                    request.source.as_str()
                }
            });
        coalesced_thread_id(file_key, request.client_timestamp, self.epoch_window_ms)
    }

    /// Submit a struggle trigger.
    ///
    /// The rate limiter runs before anything else - a rejection never
    /// partially executes a workflow. Submissions within the same epoch
    /// window for the same file share a thread; a concurrent duplicate
    /// returns the thread's current state instead of starting a second run.
    pub async fn submit(
        &self,
        client_id: &str,
        request: TriggerRequest,
    ) -> Result<TriggerResponse> {
        self.check_rate_limit(ENDPOINT_STRUGGLE, client_id)?;

        let thread_id = self.thread_id_for(&request);

        if !self.inflight.insert(thread_id.clone()) {
            info!(thread_id, "Coalescing duplicate in-flight trigger");
            // The first run may not have checkpointed yet.
            let state = match self.get(&thread_id).await {
                Ok(state) => state,
                Err(Error::NotFound(_)) => {
                    let now = Utc::now();
                    WorkflowStateDto {
                        thread_id: thread_id.clone(),
                        status: "pending".to_string(),
                        is_struggling: false,
                        lesson_recommendation: None,
                        created_at: now,
                        updated_at: now,
                    }
                }
                Err(e) => return Err(e),
            };
            return Ok(TriggerResponse {
                thread_id,
                status: state.status.clone(),
                state,
            });
        }

        let run = async {
            let graph = self.struggle_graph.clone().with_thread_id(thread_id.as_str());
            graph.invoke(StruggleState::from_request(&request)).await
        };
        let outcome = run.await;
        self.inflight.remove(&thread_id);

        match outcome {
            Ok(_) => {
                let state = self.get(&thread_id).await?;
                Ok(TriggerResponse {
                    thread_id,
                    status: state.status.clone(),
                    state,
                })
            }
            Err(err) => {
                warn!(thread_id, error = %err, "Struggle workflow failed");
                Err(err)
            }
        }
    }

    /// Run a code audit over a unified diff.
    pub async fn audit(
        &self,
        client_id: &str,
        diff: &str,
        source: &str,
    ) -> Result<AuditState> {
        self.check_rate_limit(ENDPOINT_AUDIT, client_id)?;
        let result = self.audit_graph.invoke(AuditState::new(diff, source)).await?;
        Ok(result.final_state)
    }

    /// Latest state of a thread.
    pub async fn get(&self, thread_id: &str) -> Result<WorkflowStateDto> {
        let latest = self
            .checkpointer
            .get_latest(thread_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("thread '{thread_id}'")))?;

        let history = self.checkpointer.list(thread_id).await?;
        let created_at = history
            .last()
            .map(|oldest| oldest.timestamp)
            .unwrap_or(latest.timestamp);

        let thread_status = latest
            .metadata
            .get(status::KEY)
            .cloned()
            .unwrap_or_else(|| status::RUNNING.to_string());

        Ok(WorkflowStateDto {
            thread_id: thread_id.to_string(),
            status: thread_status,
            is_struggling: latest.state.is_struggling,
            lesson_recommendation: latest.state.lesson_recommendation.clone(),
            created_at: to_datetime(created_at),
            updated_at: to_datetime(latest.timestamp),
        })
    }

    /// Paginated listing of workflow threads, most recently updated first.
    pub async fn list(&self, page: usize, page_size: usize) -> Result<Page<WorkflowStateDto>> {
        let threads = self.checkpointer.list_threads().await?;
        let total = threads.len();
        let page_size = page_size.clamp(1, 100);
        let page = page.max(1);
        let pages = total.div_ceil(page_size).max(1);

        let start = (page - 1).saturating_mul(page_size);
        let mut items = Vec::new();
        for thread in threads.into_iter().skip(start).take(page_size) {
            match self.get(&thread.thread_id).await {
                Ok(dto) => items.push(dto),
                Err(e) => {
                    warn!(thread_id = %thread.thread_id, error = %e,
                        "Skipping unreadable thread in listing");
                }
            }
        }

        Ok(Page {
            items,
            total,
            page,
            page_size,
            pages,
        })
    }

    /// Request cooperative cancellation of a running thread.
    pub fn cancel(&self, thread_id: &str) {
        self.struggle_graph.cancel(thread_id);
    }

    /// Liveness plus per-tier cache statistics.
    pub async fn health(&self) -> HealthReport {
        HealthReport {
            status: "ok".to_string(),
            caches: self.llm.cache_stats().await,
        }
    }
}
