//! Wire-facing request, response, and error types.

use aura::Error;
use aura_signals::Signal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Trigger submission accepted from the editor.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TriggerRequest {
    #[serde(default)]
    pub edit_frequency: f64,
    #[serde(default)]
    pub error_logs: Vec<String>,
    /// Prior lesson recommendations for this session.
    #[serde(default)]
    pub history: Vec<String>,
    /// Originating surface, e.g. `vscode`.
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub language_id: Option<String>,
    #[serde(default)]
    pub code_snippet: Option<String>,
    /// Client clock at submission, epoch milliseconds.
    #[serde(default)]
    pub client_timestamp: i64,
    #[serde(default)]
    pub struggle_reason: Option<String>,
    #[serde(default)]
    pub retry_count: Option<u32>,
    #[serde(default)]
    pub combined_score: Option<f64>,
    #[serde(default)]
    pub primary_signal: Option<String>,
    #[serde(default)]
    pub signals: Vec<Signal>,
    #[serde(default)]
    pub undo_redo_pattern: Option<String>,
    #[serde(default)]
    pub hesitation_ms: Option<u64>,
    #[serde(default)]
    pub terminal_errors: Option<Vec<String>>,
    #[serde(default)]
    pub debug_breakpoint_changes: Option<u32>,
}

/// Thread state surfaced to clients.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowStateDto {
    pub thread_id: String,
    /// `pending`, `running`, `completed`, `failed`, or `cancelled`.
    pub status: String,
    pub is_struggling: bool,
    #[serde(default)]
    pub lesson_recommendation: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Response to a trigger submission.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TriggerResponse {
    pub thread_id: String,
    pub status: String,
    pub state: WorkflowStateDto,
}

/// Pagination envelope for workflow listings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
    pub pages: usize,
}

impl<T> Page<T> {
    /// Slice `all` into the requested page (1-indexed).
    #[must_use]
    pub fn paginate(all: Vec<T>, page: usize, page_size: usize) -> Self {
        let page_size = page_size.clamp(1, 100);
        let page = page.max(1);
        let total = all.len();
        let pages = total.div_ceil(page_size).max(1);

        let start = (page - 1).saturating_mul(page_size);
        let items: Vec<T> = all
            .into_iter()
            .skip(start)
            .take(page_size)
            .collect();

        Self {
            items,
            total,
            page,
            page_size,
            pages,
        }
    }
}

/// Rejection payload: `{error: {message, type, status, details?, path}}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
    #[serde(rename = "type")]
    pub error_type: String,
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    pub path: String,
}

impl ErrorEnvelope {
    /// Build the wire shape for an error raised while serving `path`.
    #[must_use]
    pub fn from_error(error: &Error, path: &str) -> Self {
        let kind = error.kind();
        let details = error.retry_after().map(|retry_after| {
            serde_json::json!({ "retry_after_s": retry_after.as_secs() })
        });
        Self {
            error: ErrorBody {
                message: error.to_string(),
                error_type: kind.as_str().to_string(),
                status: kind.status(),
                details,
                path: path.to_string(),
            },
        }
    }
}

/// Cache statistics plus liveness, served by the health endpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: String,
    pub caches: Vec<aura::CacheStats>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn trigger_request_deserialises_sparse_payload() {
        let request: TriggerRequest = serde_json::from_str(
            r#"{"edit_frequency": 12.5, "error_logs": ["E0308"], "source": "vscode"}"#,
        )
        .unwrap();
        assert!((request.edit_frequency - 12.5).abs() < f64::EPSILON);
        assert_eq!(request.error_logs.len(), 1);
        assert!(request.signals.is_empty());
        assert!(request.terminal_errors.is_none());
    }

    #[test]
    fn pagination_envelope_shapes() {
        let page = Page::paginate((0..25).collect::<Vec<_>>(), 2, 10);
        assert_eq!(page.items, (10..20).collect::<Vec<_>>());
        assert_eq!(page.total, 25);
        assert_eq!(page.page, 2);
        assert_eq!(page.pages, 3);

        let last = Page::paginate((0..25).collect::<Vec<_>>(), 3, 10);
        assert_eq!(last.items.len(), 5);

        let beyond = Page::paginate((0..5).collect::<Vec<_>>(), 9, 10);
        assert!(beyond.items.is_empty());
        assert_eq!(beyond.pages, 1);
    }

    #[test]
    fn pagination_clamps_degenerate_inputs() {
        let page = Page::paginate(vec![1, 2, 3], 0, 0);
        assert_eq!(page.page, 1);
        assert_eq!(page.page_size, 1);
        assert_eq!(page.items, vec![1]);
    }

    #[test]
    fn error_envelope_wire_shape() {
        let err = Error::rate_limited("too many triggers", Some(Duration::from_secs(9)));
        let envelope = ErrorEnvelope::from_error(&err, "/api/struggle");
        assert_eq!(envelope.error.error_type, "rate_limited");
        assert_eq!(envelope.error.status, 429);
        assert_eq!(envelope.error.path, "/api/struggle");
        assert_eq!(
            envelope.error.details.unwrap()["retry_after_s"],
            serde_json::json!(9)
        );

        let err = Error::not_found("thread 'x'");
        let envelope = ErrorEnvelope::from_error(&err, "/api/workflows/x");
        assert_eq!(envelope.error.status, 404);
        assert!(envelope.error.details.is_none());
    }
}
