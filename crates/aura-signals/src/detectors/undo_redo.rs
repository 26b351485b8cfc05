//! Undo/redo detector: classifies sequences as thrash, revert, or explore.

use super::{Detector, WindowBuffer};
use crate::config::DetectorConfig;
use crate::event::{
    smoothstep, Signal, SignalEvent, SignalKind, SignalMetadata, SignalType, UndoRedoPattern,
};
use std::collections::HashMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Step {
    Undo,
    Redo,
}

/// Detects undo/redo churn per file.
pub struct UndoRedoDetector {
    config: DetectorConfig,
    files: HashMap<String, WindowBuffer<Step>>,
}

impl UndoRedoDetector {
    #[must_use]
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            config,
            files: HashMap::new(),
        }
    }

    fn classify(steps: &[Step]) -> (UndoRedoPattern, f64) {
        let total = steps.len();
        let undo_count = steps.iter().filter(|s| **s == Step::Undo).count();
        let undo_fraction = undo_count as f64 / total as f64;

        let alternations = steps.windows(2).filter(|w| w[0] != w[1]).count();
        let alternation_ratio = if total > 1 {
            alternations as f64 / (total - 1) as f64
        } else {
            0.0
        };

        if total >= 4 && alternation_ratio >= 0.5 {
            (UndoRedoPattern::Thrash, alternation_ratio)
        } else if undo_count >= 3 && undo_fraction >= 0.75 {
            (UndoRedoPattern::Revert, undo_fraction)
        } else {
            (UndoRedoPattern::Explore, 1.0 - undo_fraction)
        }
    }
}

impl Detector for UndoRedoDetector {
    fn signal_type(&self) -> SignalType {
        SignalType::UndoRedo
    }

    fn observe(&mut self, event: &SignalEvent) {
        let step = match event.kind {
            SignalKind::Undo => Step::Undo,
            SignalKind::Redo => Step::Redo,
            _ => return,
        };
        let buffer = self
            .files
            .entry(event.file_key.clone())
            .or_insert_with(|| WindowBuffer::new(self.config.max_events_per_file));
        buffer.prune(event.ts_ms, self.config.window_ms);
        buffer.push(event.ts_ms, step);
    }

    fn evaluate(&self, file_key: &str, now_ms: i64) -> Option<Signal> {
        let buffer = self.files.get(file_key)?;
        let steps: Vec<Step> = buffer
            .in_window(now_ms, self.config.window_ms)
            .map(|(_, s)| *s)
            .collect();
        if steps.is_empty() {
            return None;
        }

        let (pattern, ratio) = Self::classify(&steps);
        let density = steps.len() as f64 / f64::from(self.config.undo_redo_burst_threshold);

        Some(Signal {
            signal_type: SignalType::UndoRedo,
            score: smoothstep(density),
            window_ms: self.config.window_ms,
            metadata: SignalMetadata::UndoRedo { pattern, ratio },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(ts_ms: i64, kind: SignalKind) -> SignalEvent {
        SignalEvent::new(ts_ms, "file.rs", kind)
    }

    fn pattern_of(detector: &UndoRedoDetector, now_ms: i64) -> UndoRedoPattern {
        let signal = detector.evaluate("file.rs", now_ms).unwrap();
        match signal.metadata {
            SignalMetadata::UndoRedo { pattern, .. } => pattern,
            _ => panic!("wrong metadata variant"),
        }
    }

    #[test]
    fn alternating_sequence_is_thrash() {
        let mut detector = UndoRedoDetector::new(DetectorConfig::default());
        for (i, kind) in [
            SignalKind::Undo,
            SignalKind::Redo,
            SignalKind::Undo,
            SignalKind::Redo,
            SignalKind::Undo,
        ]
        .iter()
        .enumerate()
        {
            detector.observe(&event(i as i64 * 500, *kind));
        }
        assert_eq!(pattern_of(&detector, 2_500), UndoRedoPattern::Thrash);
    }

    #[test]
    fn sustained_undo_is_revert() {
        let mut detector = UndoRedoDetector::new(DetectorConfig::default());
        for i in 0..4 {
            detector.observe(&event(i * 500, SignalKind::Undo));
        }
        assert_eq!(pattern_of(&detector, 2_000), UndoRedoPattern::Revert);
    }

    #[test]
    fn redo_after_undo_is_explore() {
        let mut detector = UndoRedoDetector::new(DetectorConfig::default());
        detector.observe(&event(0, SignalKind::Undo));
        detector.observe(&event(500, SignalKind::Redo));
        detector.observe(&event(1_000, SignalKind::Redo));
        assert_eq!(pattern_of(&detector, 1_000), UndoRedoPattern::Explore);
    }

    #[test]
    fn score_grows_with_density() {
        let mut detector = UndoRedoDetector::new(DetectorConfig::default());
        detector.observe(&event(0, SignalKind::Undo));
        let sparse = detector.evaluate("file.rs", 0).unwrap().score;

        for i in 1..6 {
            detector.observe(&event(i * 100, SignalKind::Undo));
        }
        let dense = detector.evaluate("file.rs", 600).unwrap().score;
        assert!(dense > sparse);
        assert!(dense <= 1.0);
    }

    #[test]
    fn edits_are_ignored() {
        let mut detector = UndoRedoDetector::new(DetectorConfig::default());
        detector.observe(&event(0, SignalKind::Edit));
        assert!(detector.evaluate("file.rs", 0).is_none());
    }
}
