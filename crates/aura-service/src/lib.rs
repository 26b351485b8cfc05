//! # aura-service
//!
//! The Aura backend assembly: the trigger bridge that packages aggregated
//! struggle decisions into submissions, the checkpointed struggle and audit
//! workflow graphs, the workflow query API, and per-client rate limiting
//! applied before any workflow is submitted.
//!
//! Transport concerns (HTTP framing, auth, CSRF) live outside this crate;
//! everything here speaks typed requests and the shared error taxonomy, so
//! any server surface can mount it.

pub mod audit;
pub mod bridge;
pub mod config;
pub mod dto;
pub mod service;
pub mod struggle;

pub use audit::{build_audit_graph, AuditState, Violation};
pub use bridge::{coalesced_thread_id, Feedback, SurfaceState, TriggerBridge};
pub use config::{BatchConfig, CacheConfig, RateLimitSettings, ServiceConfig};
pub use dto::{
    ErrorBody, ErrorEnvelope, HealthReport, Page, TriggerRequest, TriggerResponse,
    WorkflowStateDto,
};
pub use service::WorkflowService;
pub use struggle::{build_struggle_graph, StruggleInputs, StruggleState, ThreadStatus};
