//! Trigger bridge: packages aggregated decisions with code context into
//! submissions, coalesces in-flight triggers per epoch window, and applies
//! user feedback to the local lesson surface.

use crate::dto::TriggerRequest;
use aura_signals::{
    AggregatedDecision, PrivacyConfig, SignalMetadata, SignalType, StruggleContext,
};
use dashmap::DashSet;
use serde::{Deserialize, Serialize};

/// Thread id permitting coalescing: submissions for the same file within
/// one epoch window share a thread, so duplicate in-flight triggers dedupe
/// to one run.
#[must_use]
pub fn coalesced_thread_id(file_key: &str, ts_ms: i64, epoch_window_ms: u64) -> String {
    let epoch = if epoch_window_ms == 0 {
        0
    } else {
        ts_ms.max(0) as u64 / epoch_window_ms
    };
    format!("{file_key}:{epoch}")
}

/// User feedback on a surfaced lesson.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feedback {
    /// Show the lesson now.
    Show,
    /// Hide and snooze all triggers for the given duration.
    Snooze { duration_ms: u64 },
    /// Turn the feature off for this session.
    Disable,
}

/// Local state of the lesson surface, driven by feedback transitions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SurfaceState {
    pub snoozed_until_ms: Option<i64>,
    pub disabled: bool,
}

impl SurfaceState {
    /// Apply one feedback action at `now_ms`.
    pub fn apply(&mut self, feedback: Feedback, now_ms: i64) {
        match feedback {
            Feedback::Show => {}
            Feedback::Snooze { duration_ms } => {
                let until = now_ms.saturating_add(duration_ms as i64);
                self.snoozed_until_ms = Some(self.snoozed_until_ms.unwrap_or(0).max(until));
            }
            Feedback::Disable => self.disabled = true,
        }
    }

    /// Whether a trigger may surface right now.
    #[must_use]
    pub fn may_surface(&self, now_ms: i64) -> bool {
        if self.disabled {
            return false;
        }
        match self.snoozed_until_ms {
            None => true,
            Some(until) => now_ms >= until,
        }
    }
}

/// Packages submissions and tracks in-flight thread ids.
pub struct TriggerBridge {
    privacy: PrivacyConfig,
    epoch_window_ms: u64,
    inflight: DashSet<String>,
}

impl TriggerBridge {
    #[must_use]
    pub fn new(privacy: PrivacyConfig, epoch_window_ms: u64) -> Self {
        Self {
            privacy,
            epoch_window_ms,
            inflight: DashSet::new(),
        }
    }

    /// The thread id a submission for this context at this time coalesces
    /// into.
    #[must_use]
    pub fn thread_id_for(&self, context: &StruggleContext, ts_ms: i64) -> String {
        coalesced_thread_id(&context.file_key, ts_ms, self.epoch_window_ms)
    }

    /// Claim a thread for submission. `false` means an identical trigger is
    /// already in flight and this one should be dropped.
    pub fn begin_submission(&self, thread_id: &str) -> bool {
        self.inflight.insert(thread_id.to_string())
    }

    /// Release a thread after its submission resolved (either way).
    pub fn finish_submission(&self, thread_id: &str) {
        self.inflight.remove(thread_id);
    }

    /// Assemble the submission payload from a decision and its context,
    /// applying the privacy flags.
    #[must_use]
    pub fn assemble(
        &self,
        decision: &AggregatedDecision,
        context: &StruggleContext,
        source: &str,
    ) -> TriggerRequest {
        let mut request = TriggerRequest {
            source: source.to_string(),
            client_timestamp: decision.window_end_ms,
            combined_score: Some(decision.combined_score),
            primary_signal: decision.primary_signal.map(|t| t.as_str().to_string()),
            signals: decision.signals.clone(),
            error_logs: context.diagnostics_errors.clone(),
            language_id: context.language_id.clone(),
            file_path: if self.privacy.send_file_path {
                context.file_path.clone()
            } else {
                None
            },
            code_snippet: if self.privacy.send_code_snippet {
                context.snippet.clone()
            } else {
                None
            },
            ..TriggerRequest::default()
        };

        for signal in &decision.signals {
            match &signal.metadata {
                SignalMetadata::EditPattern {
                    edit_frequency_per_min,
                    retry_count,
                    ..
                } => {
                    request.edit_frequency = *edit_frequency_per_min;
                    request.retry_count = Some(*retry_count);
                }
                SignalMetadata::UndoRedo { pattern, .. } => {
                    request.undo_redo_pattern =
                        Some(format!("{pattern:?}").to_lowercase());
                }
                SignalMetadata::TimePattern { hesitation_ms } => {
                    request.hesitation_ms = Some(*hesitation_ms);
                }
                SignalMetadata::Terminal { terminal_errors } => {
                    request.terminal_errors = Some(terminal_errors.clone());
                }
                SignalMetadata::Debug { breakpoint_changes } => {
                    request.debug_breakpoint_changes = Some(*breakpoint_changes);
                }
                SignalMetadata::Semantic { .. } => {}
            }
        }

        if request.struggle_reason.is_none() {
            request.struggle_reason = decision
                .primary_signal
                .filter(|t| *t == SignalType::Terminal)
                .map(|_| "repeated errors".to_string());
        }

        request
    }
}
