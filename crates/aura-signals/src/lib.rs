//! # aura-signals
//!
//! Struggle-signal detection for Aura: typed editor events, per-kind
//! detectors over rolling per-file windows, and a weighted aggregator that
//! fuses detector output into trigger decisions with cooldown and snooze.
//!
//! The editor side runs a cooperative single-threaded event loop; the
//! [`SignalEngine`] mirrors that by serialising detector access behind one
//! lock while the [`SignalAggregator`] stays lock-free per file.
//!
//! ```rust
//! use aura_signals::{SignalEngine, SignalEvent, SignalKind};
//!
//! let engine = SignalEngine::default();
//! engine.ingest(
//!     SignalEvent::new(0, "src/main.rs", SignalKind::Edit)
//!         .with_payload("let x = 1;")
//!         .with_line(10),
//! );
//! let decision = engine.evaluate("src/main.rs", 1_000);
//! assert!(!decision.should_trigger);
//! ```

pub mod aggregator;
pub mod config;
pub mod context;
pub mod detectors;
pub mod event;

pub use aggregator::{AggregatedDecision, SignalAggregator};
pub use config::{AggregatorConfig, ClientConfig, DetectorConfig, SignalWeights};
pub use context::{snippet_around, PrivacyConfig, StruggleContext};
pub use detectors::{
    DebugDetector, Detector, EditPatternDetector, SemanticDetector, TerminalDetector,
    TimePatternDetector, UndoRedoDetector,
};
pub use event::{
    smoothstep, Signal, SignalEvent, SignalKind, SignalMetadata, SignalType, UndoRedoPattern,
};

use parking_lot::Mutex;

struct DetectorSet {
    edit: EditPatternDetector,
    undo_redo: UndoRedoDetector,
    time: TimePatternDetector,
    terminal: TerminalDetector,
    debug: DebugDetector,
    semantic: SemanticDetector,
}

/// Owns the full detector set and the aggregator.
///
/// `ingest` fans one raw event out to every detector; `evaluate` collects
/// fresh signals for a file and fuses them. Evaluation is serialised per
/// engine, matching the editor's single-threaded event loop.
pub struct SignalEngine {
    detectors: Mutex<DetectorSet>,
    aggregator: SignalAggregator,
    detector_config: DetectorConfig,
}

impl SignalEngine {
    #[must_use]
    pub fn new(detector_config: DetectorConfig, aggregator_config: AggregatorConfig) -> Self {
        Self {
            detectors: Mutex::new(DetectorSet {
                edit: EditPatternDetector::new(detector_config.clone()),
                undo_redo: UndoRedoDetector::new(detector_config.clone()),
                time: TimePatternDetector::new(detector_config.clone()),
                terminal: TerminalDetector::new(detector_config.clone()),
                debug: DebugDetector::new(detector_config.clone()),
                semantic: SemanticDetector::new(detector_config.clone()),
            }),
            aggregator: SignalAggregator::new(aggregator_config),
            detector_config,
        }
    }

    /// Enable the semantic-drift detector (disabled by default).
    #[must_use]
    pub fn with_semantic_enabled(self) -> Self {
        {
            let mut detectors = self.detectors.lock();
            detectors.semantic = SemanticDetector::new(self.detector_config.clone()).enabled(true);
        }
        self
    }

    /// Feed one raw editor event to every detector.
    pub fn ingest(&self, event: SignalEvent) {
        let mut detectors = self.detectors.lock();
        detectors.edit.observe(&event);
        detectors.undo_redo.observe(&event);
        detectors.time.observe(&event);
        detectors.terminal.observe(&event);
        detectors.debug.observe(&event);
        detectors.semantic.observe(&event);
    }

    /// Record a semantic drift score computed out-of-band.
    pub fn record_semantic_drift(&self, file_key: &str, ts_ms: i64, drift: f64) {
        self.detectors
            .lock()
            .semantic
            .record_drift(file_key, ts_ms, drift);
    }

    /// Evaluate all detectors for a file and fuse the result.
    pub fn evaluate(&self, file_key: &str, now_ms: i64) -> AggregatedDecision {
        let signals = {
            let detectors = self.detectors.lock();
            [
                detectors.edit.evaluate(file_key, now_ms),
                detectors.undo_redo.evaluate(file_key, now_ms),
                detectors.time.evaluate(file_key, now_ms),
                detectors.terminal.evaluate(file_key, now_ms),
                detectors.debug.evaluate(file_key, now_ms),
                detectors.semantic.evaluate(file_key, now_ms),
            ]
        };
        for signal in signals.into_iter().flatten() {
            self.aggregator.update(file_key, signal);
        }
        self.aggregator.evaluate(file_key, now_ms)
    }

    /// Reset a file after a trigger was accepted downstream.
    pub fn reset(&self, file_key: &str, now_ms: i64) {
        self.aggregator.reset(file_key, now_ms);
    }

    /// Snooze all triggers until the given epoch-milliseconds bound.
    pub fn snooze_until(&self, until_ms: i64) {
        self.aggregator.snooze_until(until_ms);
    }
}

impl Default for SignalEngine {
    fn default() -> Self {
        Self::new(DetectorConfig::default(), AggregatorConfig::default())
    }
}
