//! Detector and aggregator configuration with the recognised defaults.

use serde::{Deserialize, Serialize};

fn default_window_ms() -> u64 {
    300_000
}
fn default_retry_attempt_threshold() -> u32 {
    3
}
fn default_error_count_threshold() -> u32 {
    2
}
fn default_edit_frequency_threshold() -> f64 {
    10.0
}
fn default_similarity_threshold() -> f64 {
    0.2
}
fn default_max_line_distance() -> u32 {
    2
}
fn default_max_comparisons() -> usize {
    10
}
fn default_max_events_per_file() -> usize {
    200
}
fn default_max_errors_per_file() -> usize {
    20
}
fn default_hesitation_threshold_ms() -> u64 {
    45_000
}
fn default_undo_redo_burst() -> u32 {
    6
}
fn default_breakpoint_churn() -> u32 {
    5
}

/// Per-detector tunables.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Rolling lookback window.
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// Retries within the window that saturate the edit-pattern score.
    #[serde(default = "default_retry_attempt_threshold")]
    pub retry_attempt_threshold: u32,

    /// Errors within the window that saturate the terminal score.
    #[serde(default = "default_error_count_threshold")]
    pub error_count_threshold: u32,

    /// Edits per minute that saturate the edit-frequency score.
    #[serde(default = "default_edit_frequency_threshold")]
    pub edit_frequency_threshold_per_min: f64,

    /// Maximum length-normalised edit distance for two snippets to count as
    /// a retry (0.2 means at most 20% changed).
    #[serde(default = "default_similarity_threshold")]
    pub levenshtein_similarity_threshold: f64,

    /// Line distance within which edits are considered "the same location".
    #[serde(default = "default_max_line_distance")]
    pub max_line_distance_for_retry: u32,

    /// Comparison budget per incoming edit, applied to most-recent events.
    #[serde(default = "default_max_comparisons")]
    pub max_comparisons_per_edit: usize,

    /// Ring-buffer cap per file.
    #[serde(default = "default_max_events_per_file")]
    pub max_events_per_file: usize,

    /// Cap on retained error exemplars per file.
    #[serde(default = "default_max_errors_per_file")]
    pub max_errors_per_file: usize,

    /// Inter-edit gap that counts as hesitation (with prior errors present).
    #[serde(default = "default_hesitation_threshold_ms")]
    pub hesitation_threshold_ms: u64,

    /// Undo/redo events within the window that saturate the undo-redo score.
    #[serde(default = "default_undo_redo_burst")]
    pub undo_redo_burst_threshold: u32,

    /// Breakpoint changes within the window that saturate the debug score.
    #[serde(default = "default_breakpoint_churn")]
    pub breakpoint_churn_threshold: u32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
            retry_attempt_threshold: default_retry_attempt_threshold(),
            error_count_threshold: default_error_count_threshold(),
            edit_frequency_threshold_per_min: default_edit_frequency_threshold(),
            levenshtein_similarity_threshold: default_similarity_threshold(),
            max_line_distance_for_retry: default_max_line_distance(),
            max_comparisons_per_edit: default_max_comparisons(),
            max_events_per_file: default_max_events_per_file(),
            max_errors_per_file: default_max_errors_per_file(),
            hesitation_threshold_ms: default_hesitation_threshold_ms(),
            undo_redo_burst_threshold: default_undo_redo_burst(),
            breakpoint_churn_threshold: default_breakpoint_churn(),
        }
    }
}

fn w_undo_redo() -> f64 {
    0.25
}
fn w_time_pattern() -> f64 {
    0.20
}
fn w_terminal() -> f64 {
    0.20
}
fn w_debug() -> f64 {
    0.15
}
fn w_semantic() -> f64 {
    0.10
}
fn w_edit_pattern() -> f64 {
    0.10
}

/// Aggregation weights per signal type.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignalWeights {
    #[serde(default = "w_undo_redo")]
    pub undo_redo: f64,
    #[serde(default = "w_time_pattern")]
    pub time_pattern: f64,
    #[serde(default = "w_terminal")]
    pub terminal: f64,
    #[serde(default = "w_debug")]
    pub debug: f64,
    #[serde(default = "w_semantic")]
    pub semantic: f64,
    #[serde(default = "w_edit_pattern")]
    pub edit_pattern: f64,
}

impl Default for SignalWeights {
    fn default() -> Self {
        Self {
            undo_redo: w_undo_redo(),
            time_pattern: w_time_pattern(),
            terminal: w_terminal(),
            debug: w_debug(),
            semantic: w_semantic(),
            edit_pattern: w_edit_pattern(),
        }
    }
}

impl SignalWeights {
    /// The weight for a signal type.
    #[must_use]
    pub fn for_type(&self, signal_type: crate::event::SignalType) -> f64 {
        use crate::event::SignalType;
        match signal_type {
            SignalType::UndoRedo => self.undo_redo,
            SignalType::TimePattern => self.time_pattern,
            SignalType::Terminal => self.terminal,
            SignalType::Debug => self.debug,
            SignalType::Semantic => self.semantic,
            SignalType::EditPattern => self.edit_pattern,
        }
    }
}

fn default_trigger_threshold() -> f64 {
    0.6
}
fn default_cooldown_ms() -> u64 {
    60_000
}

/// Aggregator tunables.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AggregatorConfig {
    #[serde(default)]
    pub weights: SignalWeights,

    /// Combined score at which the fused decision triggers.
    #[serde(default = "default_trigger_threshold")]
    pub trigger_threshold: f64,

    /// Minimum interval between successive triggers for the same file.
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,

    /// Global snooze applied by the user (`aura.snoozed_until_ms` on the
    /// client). The stricter of the client and server bounds applies.
    #[serde(default)]
    pub snoozed_until_ms: Option<i64>,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            weights: SignalWeights::default(),
            trigger_threshold: default_trigger_threshold(),
            cooldown_ms: default_cooldown_ms(),
            snoozed_until_ms: None,
        }
    }
}

/// Editor-side settings as persisted by the client.
///
/// The client thinks in minutes (`windowMinutes`), with a seconds-granular
/// override for development (`devWindowSeconds`); the snooze bound is
/// persisted under the `aura.snoozed_until_ms` settings key. These map onto
/// the server-side millisecond configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(rename = "windowMinutes", default)]
    pub window_minutes: Option<u64>,
    #[serde(rename = "devWindowSeconds", default)]
    pub dev_window_seconds: Option<u64>,
    #[serde(rename = "aura.snoozed_until_ms", default)]
    pub snoozed_until_ms: Option<i64>,
}

impl ClientConfig {
    /// The effective window in milliseconds: the dev override wins, then
    /// `windowMinutes`, then the server default.
    #[must_use]
    pub fn effective_window_ms(&self) -> u64 {
        if let Some(seconds) = self.dev_window_seconds {
            return seconds.max(1) * 1_000;
        }
        if let Some(minutes) = self.window_minutes {
            return minutes.max(1) * 60_000;
        }
        default_window_ms()
    }

    /// Fold the client settings into detector and aggregator configs.
    pub fn apply(&self, detector: &mut DetectorConfig, aggregator: &mut AggregatorConfig) {
        detector.window_ms = self.effective_window_ms();
        if let Some(snoozed) = self.snoozed_until_ms {
            aggregator.snoozed_until_ms = Some(
                aggregator
                    .snoozed_until_ms
                    .map_or(snoozed, |existing| existing.max(snoozed)),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_recognised_options() {
        let config = DetectorConfig::default();
        assert_eq!(config.window_ms, 300_000);
        assert_eq!(config.retry_attempt_threshold, 3);
        assert_eq!(config.error_count_threshold, 2);
        assert!((config.edit_frequency_threshold_per_min - 10.0).abs() < f64::EPSILON);
        assert!((config.levenshtein_similarity_threshold - 0.2).abs() < f64::EPSILON);
        assert_eq!(config.max_line_distance_for_retry, 2);
        assert_eq!(config.max_comparisons_per_edit, 10);
        assert_eq!(config.max_events_per_file, 200);
        assert_eq!(config.max_errors_per_file, 20);
    }

    #[test]
    fn default_weights_sum_to_one() {
        let weights = SignalWeights::default();
        let sum = weights.undo_redo
            + weights.time_pattern
            + weights.terminal
            + weights.debug
            + weights.semantic
            + weights.edit_pattern;
        assert!((sum - 1.0).abs() < 1e-9);
    }

    #[test]
    fn client_config_maps_window_keys() {
        let client: ClientConfig = serde_json::from_str(
            r#"{"windowMinutes": 2, "aura.snoozed_until_ms": 99000}"#,
        )
        .unwrap();
        assert_eq!(client.effective_window_ms(), 120_000);

        let dev: ClientConfig =
            serde_json::from_str(r#"{"windowMinutes": 2, "devWindowSeconds": 15}"#).unwrap();
        assert_eq!(dev.effective_window_ms(), 15_000);

        let mut detector = DetectorConfig::default();
        let mut aggregator = AggregatorConfig {
            snoozed_until_ms: Some(50_000),
            ..AggregatorConfig::default()
        };
        client.apply(&mut detector, &mut aggregator);
        assert_eq!(detector.window_ms, 120_000);
        // The stricter (max) snooze bound wins.
        assert_eq!(aggregator.snoozed_until_ms, Some(99_000));
    }

    #[test]
    fn config_deserialises_with_partial_fields() {
        let config: DetectorConfig = serde_json::from_str(r#"{"window_ms": 60000}"#).unwrap();
        assert_eq!(config.window_ms, 60_000);
        assert_eq!(config.retry_attempt_threshold, 3);

        let aggregator: AggregatorConfig =
            serde_json::from_str(r#"{"trigger_threshold": 0.8}"#).unwrap();
        assert!((aggregator.trigger_threshold - 0.8).abs() < f64::EPSILON);
        assert_eq!(aggregator.cooldown_ms, 60_000);
    }
}
