//! Debug-activity detector: breakpoint churn and stepping after errors.

use super::{Detector, WindowBuffer};
use crate::config::DetectorConfig;
use crate::event::{smoothstep, Signal, SignalEvent, SignalKind, SignalMetadata, SignalType};
use std::collections::HashMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DebugAction {
    BreakpointChange,
    Step,
}

struct FileState {
    actions: WindowBuffer<DebugAction>,
    last_error_ms: Option<i64>,
}

/// Counts breakpoint add/remove churn and step activity following errors.
pub struct DebugDetector {
    config: DetectorConfig,
    files: HashMap<String, FileState>,
}

impl DebugDetector {
    #[must_use]
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            config,
            files: HashMap::new(),
        }
    }

    fn parse_action(payload: &str) -> Option<DebugAction> {
        match payload.trim() {
            "breakpoint_added" | "breakpoint_removed" | "breakpoint_changed" => {
                Some(DebugAction::BreakpointChange)
            }
            "step" | "step_over" | "step_into" | "step_out" => Some(DebugAction::Step),
            _ => None,
        }
    }
}

impl Detector for DebugDetector {
    fn signal_type(&self) -> SignalType {
        SignalType::Debug
    }

    fn observe(&mut self, event: &SignalEvent) {
        let cap = self.config.max_events_per_file;
        match event.kind {
            SignalKind::DebugEvent => {
                let Some(action) = Self::parse_action(&event.payload) else {
                    return;
                };
                let state = self
                    .files
                    .entry(event.file_key.clone())
                    .or_insert_with(|| FileState {
                        actions: WindowBuffer::new(cap),
                        last_error_ms: None,
                    });
                state.actions.prune(event.ts_ms, self.config.window_ms);
                state.actions.push(event.ts_ms, action);
            }
            SignalKind::DiagnosticError | SignalKind::TerminalError => {
                let state = self
                    .files
                    .entry(event.file_key.clone())
                    .or_insert_with(|| FileState {
                        actions: WindowBuffer::new(cap),
                        last_error_ms: None,
                    });
                state.last_error_ms = Some(event.ts_ms);
            }
            _ => {}
        }
    }

    fn evaluate(&self, file_key: &str, now_ms: i64) -> Option<Signal> {
        let state = self.files.get(file_key)?;
        let window_ms = self.config.window_ms;

        let mut breakpoint_changes = 0u32;
        let mut steps_after_error = 0u32;
        let error_ms = state.last_error_ms;

        for (ts, action) in state.actions.in_window(now_ms, window_ms) {
            match action {
                DebugAction::BreakpointChange => breakpoint_changes += 1,
                DebugAction::Step => {
                    if error_ms.is_some_and(|err_ts| *ts >= err_ts) {
                        steps_after_error += 1;
                    }
                }
            }
        }

        if breakpoint_changes == 0 && steps_after_error == 0 {
            return None;
        }

        // Steps after an error count at half the weight of breakpoint churn.
        let activity = f64::from(breakpoint_changes) + f64::from(steps_after_error) * 0.5;
        let ratio = activity / f64::from(self.config.breakpoint_churn_threshold);

        Some(Signal {
            signal_type: SignalType::Debug,
            score: smoothstep(ratio),
            window_ms,
            metadata: SignalMetadata::Debug { breakpoint_changes },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn debug_event(ts_ms: i64, payload: &str) -> SignalEvent {
        SignalEvent::new(ts_ms, "f.rs", SignalKind::DebugEvent).with_payload(payload)
    }

    #[test]
    fn breakpoint_churn_scores() {
        let mut detector = DebugDetector::new(DetectorConfig::default());
        for i in 0..5 {
            detector.observe(&debug_event(i * 100, "breakpoint_added"));
        }
        let signal = detector.evaluate("f.rs", 500).unwrap();
        assert!(signal.saturated());
        let SignalMetadata::Debug { breakpoint_changes } = signal.metadata else {
            panic!("wrong metadata variant");
        };
        assert_eq!(breakpoint_changes, 5);
    }

    #[test]
    fn steps_only_count_after_errors() {
        let mut detector = DebugDetector::new(DetectorConfig::default());
        detector.observe(&debug_event(0, "step_over"));
        assert!(detector.evaluate("f.rs", 100).is_none());

        detector.observe(&SignalEvent::new(200, "f.rs", SignalKind::DiagnosticError));
        detector.observe(&debug_event(300, "step_over"));
        let signal = detector.evaluate("f.rs", 400).unwrap();
        assert!(signal.score > 0.0);
    }

    #[test]
    fn unknown_debug_payloads_are_ignored() {
        let mut detector = DebugDetector::new(DetectorConfig::default());
        detector.observe(&debug_event(0, "console_output"));
        assert!(detector.evaluate("f.rs", 100).is_none());
    }
}
