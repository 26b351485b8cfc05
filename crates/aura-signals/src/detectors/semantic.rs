//! Semantic-drift detector (disabled by default).
//!
//! Compares edited snippets against a reference corpus of idiomatic code via
//! embeddings. Embedding is asynchronous and runs out-of-band; the computed
//! drift is pushed into the detector with [`SemanticDetector::record_drift`]
//! and surfaced through the usual `evaluate` contract. A disabled detector
//! emits no signal at all, so it contributes zero to the combined score and
//! never participates in primary-signal tie-breaks.

use super::Detector;
use crate::config::DetectorConfig;
use crate::event::{Signal, SignalEvent, SignalMetadata, SignalType};
use std::collections::HashMap;

/// Surfaces embedding-drift scores computed by an out-of-band job.
pub struct SemanticDetector {
    config: DetectorConfig,
    enabled: bool,
    drift: HashMap<String, (i64, f64)>,
}

impl SemanticDetector {
    /// Disabled by default.
    #[must_use]
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            config,
            enabled: false,
            drift: HashMap::new(),
        }
    }

    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Record a drift score in `[0, 1]` for a file, computed elsewhere from
    /// snippet embeddings against the reference corpus.
    pub fn record_drift(&mut self, file_key: &str, ts_ms: i64, drift: f64) {
        self.drift
            .insert(file_key.to_string(), (ts_ms, drift.clamp(0.0, 1.0)));
    }
}

impl Detector for SemanticDetector {
    fn signal_type(&self) -> SignalType {
        SignalType::Semantic
    }

    fn observe(&mut self, _event: &SignalEvent) {
        // Drift arrives via record_drift; raw events carry nothing usable
        // without the embedding job.
    }

    fn evaluate(&self, file_key: &str, now_ms: i64) -> Option<Signal> {
        if !self.enabled {
            return None;
        }
        let (ts, drift) = self.drift.get(file_key)?;
        if now_ms.saturating_sub(*ts) > self.config.window_ms as i64 {
            return None;
        }

        Some(Signal {
            signal_type: SignalType::Semantic,
            score: *drift,
            window_ms: self.config.window_ms,
            metadata: SignalMetadata::Semantic { drift: *drift },
        })
    }
}
