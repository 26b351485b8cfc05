//! Edit-pattern detector: edit frequency and retry detection.
//!
//! A "retry" is a new edit whose snippet is nearly identical to a prior edit
//! at the same location: length-normalised Levenshtein distance at or below
//! `levenshtein_similarity_threshold` (0.2 = at most 20% changed), with lines
//! within `max_line_distance_for_retry` of each other. Each matching prior
//! edit increments the retry count, bounded by `max_comparisons_per_edit`
//! most-recent candidates per incoming edit.

use super::{Detector, WindowBuffer};
use crate::config::DetectorConfig;
use crate::event::{smoothstep, Signal, SignalEvent, SignalKind, SignalMetadata, SignalType};
use std::collections::HashMap;

#[derive(Clone, Debug)]
struct EditRecord {
    line: Option<u32>,
    payload: String,
}

#[derive(Clone, Debug)]
struct RetryRecord {
    similarity: f64,
}

struct FileState {
    edits: WindowBuffer<EditRecord>,
    retries: WindowBuffer<RetryRecord>,
}

/// Detects rapid editing and repeated near-identical edits per file.
pub struct EditPatternDetector {
    config: DetectorConfig,
    files: HashMap<String, FileState>,
}

impl EditPatternDetector {
    #[must_use]
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            config,
            files: HashMap::new(),
        }
    }

    /// Length-normalised edit distance in `[0, 1]`; 0.0 for identical
    /// snippets.
    fn change_ratio(a: &str, b: &str) -> f64 {
        let max_len = a.chars().count().max(b.chars().count());
        if max_len == 0 {
            return 0.0;
        }
        strsim::levenshtein(a, b) as f64 / max_len as f64
    }
}

impl Detector for EditPatternDetector {
    fn signal_type(&self) -> SignalType {
        SignalType::EditPattern
    }

    fn observe(&mut self, event: &SignalEvent) {
        if event.kind != SignalKind::Edit {
            return;
        }

        let config = self.config.clone();
        let state = self
            .files
            .entry(event.file_key.clone())
            .or_insert_with(|| FileState {
                edits: WindowBuffer::new(config.max_events_per_file),
                retries: WindowBuffer::new(config.max_events_per_file),
            });

        state.edits.prune(event.ts_ms, config.window_ms);
        state.retries.prune(event.ts_ms, config.window_ms);

        // Compare against the most recent prior edits, bounded by the
        // comparison budget.
        if !event.payload.is_empty() {
            let mut comparisons = 0usize;
            let mut matches: Vec<RetryRecord> = Vec::new();
            for (_, prior) in state.edits.iter_recent() {
                if comparisons >= config.max_comparisons_per_edit {
                    break;
                }
                if prior.payload.is_empty() {
                    continue;
                }
                comparisons += 1;
                if !self_lines_close(&config, prior.line, event.line) {
                    continue;
                }
                let ratio = Self::change_ratio(&prior.payload, &event.payload);
                if ratio <= config.levenshtein_similarity_threshold {
                    matches.push(RetryRecord {
                        similarity: 1.0 - ratio,
                    });
                }
            }
            for record in matches {
                state.retries.push(event.ts_ms, record);
            }
        }

        state.edits.push(
            event.ts_ms,
            EditRecord {
                line: event.line,
                payload: event.payload.clone(),
            },
        );
    }

    fn evaluate(&self, file_key: &str, now_ms: i64) -> Option<Signal> {
        let state = self.files.get(file_key)?;
        let window_ms = self.config.window_ms;

        let edit_count = state.edits.in_window(now_ms, window_ms).count();
        if edit_count == 0 {
            return None;
        }

        let window_minutes = (window_ms as f64 / 60_000.0).max(f64::EPSILON);
        let edit_frequency_per_min = edit_count as f64 / window_minutes;

        let retry_entries: Vec<&(i64, RetryRecord)> =
            state.retries.in_window(now_ms, window_ms).collect();
        let retry_count = retry_entries.len() as u32;
        let similarity_max = retry_entries
            .iter()
            .map(|(_, r)| r.similarity)
            .fold(0.0f64, f64::max);

        let frequency_ratio = edit_frequency_per_min / self.config.edit_frequency_threshold_per_min;
        let retry_ratio = f64::from(retry_count) / f64::from(self.config.retry_attempt_threshold);
        let score = smoothstep(frequency_ratio.max(retry_ratio));

        Some(Signal {
            signal_type: SignalType::EditPattern,
            score,
            window_ms,
            metadata: SignalMetadata::EditPattern {
                edit_frequency_per_min,
                retry_count,
                similarity_max,
            },
        })
    }
}

// Free helper so the borrow of `state` inside `observe` does not conflict
// with `&mut self`. Without line information, content comparison decides.
fn self_lines_close(config: &DetectorConfig, a: Option<u32>, b: Option<u32>) -> bool {
    match (a, b) {
        (Some(x), Some(y)) => x.abs_diff(y) <= config.max_line_distance_for_retry,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edit(ts_ms: i64, payload: &str, line: u32) -> SignalEvent {
        SignalEvent::new(ts_ms, "src/main.rs", SignalKind::Edit)
            .with_payload(payload)
            .with_line(line)
    }

    #[test]
    fn identical_edits_at_same_line_count_as_retries() {
        let mut detector = EditPatternDetector::new(DetectorConfig::default());
        detector.observe(&edit(0, "const x = 1;", 10));
        detector.observe(&edit(1_000, "const x = 1;", 10));
        detector.observe(&edit(2_000, "const x = 1;", 10));

        let signal = detector.evaluate("src/main.rs", 2_000).unwrap();
        let SignalMetadata::EditPattern {
            retry_count,
            similarity_max,
            ..
        } = signal.metadata
        else {
            panic!("wrong metadata variant");
        };
        // Second edit matches one prior, third matches two.
        assert!(retry_count >= 3);
        assert!((similarity_max - 1.0).abs() < 1e-9);
        assert!(signal.saturated());
    }

    #[test]
    fn distant_lines_do_not_count_as_retries() {
        let mut detector = EditPatternDetector::new(DetectorConfig::default());
        detector.observe(&edit(0, "const x = 1;", 10));
        detector.observe(&edit(1_000, "const x = 1;", 50));

        let signal = detector.evaluate("src/main.rs", 1_000).unwrap();
        let SignalMetadata::EditPattern { retry_count, .. } = signal.metadata else {
            panic!("wrong metadata variant");
        };
        assert_eq!(retry_count, 0);
    }

    #[test]
    fn dissimilar_payloads_do_not_count_as_retries() {
        let mut detector = EditPatternDetector::new(DetectorConfig::default());
        detector.observe(&edit(0, "const x = 1;", 10));
        detector.observe(&edit(1_000, "fn totally_different() {}", 10));

        let signal = detector.evaluate("src/main.rs", 1_000).unwrap();
        let SignalMetadata::EditPattern { retry_count, .. } = signal.metadata else {
            panic!("wrong metadata variant");
        };
        assert_eq!(retry_count, 0);
    }

    #[test]
    fn slightly_changed_payload_still_counts() {
        let mut detector = EditPatternDetector::new(DetectorConfig::default());
        // One char changed out of 12: ratio ~0.08 <= 0.2.
        detector.observe(&edit(0, "const x = 1;", 10));
        detector.observe(&edit(1_000, "const x = 2;", 10));

        let signal = detector.evaluate("src/main.rs", 1_000).unwrap();
        let SignalMetadata::EditPattern { retry_count, .. } = signal.metadata else {
            panic!("wrong metadata variant");
        };
        assert_eq!(retry_count, 1);
    }

    #[test]
    fn no_edits_means_no_signal() {
        let detector = EditPatternDetector::new(DetectorConfig::default());
        assert!(detector.evaluate("src/main.rs", 1_000).is_none());
    }

    #[test]
    fn events_outside_window_are_ignored() {
        let config = DetectorConfig {
            window_ms: 10_000,
            ..DetectorConfig::default()
        };
        let mut detector = EditPatternDetector::new(config);
        detector.observe(&edit(0, "const x = 1;", 10));
        assert!(detector.evaluate("src/main.rs", 60_000).is_none());
    }

    #[test]
    fn cross_file_state_is_isolated() {
        let mut detector = EditPatternDetector::new(DetectorConfig::default());
        detector.observe(&edit(0, "const x = 1;", 10));
        let mut other = edit(500, "const x = 1;", 10);
        other.file_key = "src/other.rs".to_string();
        detector.observe(&other);

        let signal = detector.evaluate("src/other.rs", 500).unwrap();
        let SignalMetadata::EditPattern { retry_count, .. } = signal.metadata else {
            panic!("wrong metadata variant");
        };
        // The prior edit was in a different file; no retry.
        assert_eq!(retry_count, 0);
    }

    #[test]
    fn comparison_budget_is_respected() {
        let config = DetectorConfig {
            max_comparisons_per_edit: 2,
            ..DetectorConfig::default()
        };
        let mut detector = EditPatternDetector::new(config);
        for i in 0..5 {
            detector.observe(&edit(i64::from(i) * 100, "const x = 1;", 10));
        }
        let signal = detector.evaluate("src/main.rs", 1_000).unwrap();
        let SignalMetadata::EditPattern { retry_count, .. } = signal.metadata else {
            panic!("wrong metadata variant");
        };
        // Each edit after the first matches at most 2 priors.
        assert!(retry_count <= 8);
    }
}
