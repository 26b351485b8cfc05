//! Time-pattern detector: hesitation after errors.
//!
//! A long gap since the last edit only signals struggle when errors are
//! present in the window; a quiet file with no errors is just a developer
//! reading.

use super::{Detector, WindowBuffer};
use crate::config::DetectorConfig;
use crate::event::{smoothstep, Signal, SignalEvent, SignalKind, SignalMetadata, SignalType};
use std::collections::HashMap;

struct FileState {
    last_activity_ms: Option<i64>,
    errors: WindowBuffer<()>,
    /// Explicit hesitation reported by the editor, with its timestamp.
    explicit_hesitation: Option<(i64, u64)>,
}

/// Detects hesitation: long inter-edit gaps with prior errors present.
pub struct TimePatternDetector {
    config: DetectorConfig,
    files: HashMap<String, FileState>,
}

impl TimePatternDetector {
    #[must_use]
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            config,
            files: HashMap::new(),
        }
    }

    fn state_for(&mut self, file_key: &str) -> &mut FileState {
        let cap = self.config.max_errors_per_file;
        self.files
            .entry(file_key.to_string())
            .or_insert_with(|| FileState {
                last_activity_ms: None,
                errors: WindowBuffer::new(cap),
                explicit_hesitation: None,
            })
    }
}

impl Detector for TimePatternDetector {
    fn signal_type(&self) -> SignalType {
        SignalType::TimePattern
    }

    fn observe(&mut self, event: &SignalEvent) {
        match event.kind {
            SignalKind::Edit | SignalKind::Undo | SignalKind::Redo => {
                let state = self.state_for(&event.file_key);
                state.last_activity_ms = Some(event.ts_ms);
            }
            SignalKind::DiagnosticError | SignalKind::TerminalError => {
                let window_ms = self.config.window_ms;
                let state = self.state_for(&event.file_key);
                state.errors.prune(event.ts_ms, window_ms);
                state.errors.push(event.ts_ms, ());
            }
            SignalKind::Hesitation => {
                // The editor measured the gap itself; payload is the gap in
                // milliseconds. Unparseable payloads are tolerated.
                let hesitation_ms = event.payload.trim().parse::<u64>().ok();
                let state = self.state_for(&event.file_key);
                if let Some(ms) = hesitation_ms {
                    state.explicit_hesitation = Some((event.ts_ms, ms));
                }
            }
            SignalKind::DebugEvent => {}
        }
    }

    fn evaluate(&self, file_key: &str, now_ms: i64) -> Option<Signal> {
        let state = self.files.get(file_key)?;
        let window_ms = self.config.window_ms;
        let threshold = self.config.hesitation_threshold_ms;

        let errors_present = state.errors.in_window(now_ms, window_ms).count() > 0;

        let computed_gap = state
            .last_activity_ms
            .map(|last| now_ms.saturating_sub(last).max(0) as u64);

        let explicit = state
            .explicit_hesitation
            .filter(|(ts, _)| now_ms.saturating_sub(*ts) <= window_ms as i64)
            .map(|(_, ms)| ms);

        // The computed gap requires errors in the window; an explicit
        // hesitation event already carries the editor's judgement.
        let hesitation_ms = match (computed_gap.filter(|_| errors_present), explicit) {
            (Some(gap), Some(reported)) => gap.max(reported),
            (Some(gap), None) => gap,
            (None, Some(reported)) => reported,
            (None, None) => return None,
        };

        if hesitation_ms < threshold {
            return None;
        }

        // Saturates at twice the threshold.
        let ratio = hesitation_ms as f64 / (threshold as f64 * 2.0);

        Some(Signal {
            signal_type: SignalType::TimePattern,
            score: smoothstep(ratio),
            window_ms,
            metadata: SignalMetadata::TimePattern { hesitation_ms },
        })
    }
}
