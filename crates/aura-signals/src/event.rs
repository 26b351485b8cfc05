//! Signal events and scored signals.
//!
//! A [`SignalEvent`] is one raw editor observation (an edit, a diagnostic, a
//! terminal line, ...). Detectors fold events into per-file windows and emit
//! [`Signal`]s: typed, scored summaries the aggregator fuses into a trigger
//! decision.

use serde::{Deserialize, Serialize};

/// Kind of a raw editor event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Edit,
    Undo,
    Redo,
    DiagnosticError,
    TerminalError,
    DebugEvent,
    Hesitation,
}

/// An immutable raw observation from the editor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SignalEvent {
    /// Event timestamp in epoch milliseconds.
    pub ts_ms: i64,
    /// Stable identifier for the file the event belongs to.
    pub file_key: String,
    pub kind: SignalKind,
    /// Kind-specific payload: edit snippet, diagnostic message, terminal
    /// line, debug action, or a hesitation duration in milliseconds.
    #[serde(default)]
    pub payload: String,
    /// Line the event is anchored at, when known.
    #[serde(default)]
    pub line: Option<u32>,
}

impl SignalEvent {
    pub fn new(ts_ms: i64, file_key: impl Into<String>, kind: SignalKind) -> Self {
        Self {
            ts_ms,
            file_key: file_key.into(),
            kind,
            payload: String::new(),
            line: None,
        }
    }

    #[must_use]
    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = payload.into();
        self
    }

    #[must_use]
    pub fn with_line(mut self, line: u32) -> Self {
        self.line = Some(line);
        self
    }
}

/// Type of a scored signal, one per detector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    EditPattern,
    UndoRedo,
    TimePattern,
    Terminal,
    Debug,
    Semantic,
}

impl SignalType {
    /// Wire name, matching the configured weight keys.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EditPattern => "edit_pattern",
            Self::UndoRedo => "undo_redo",
            Self::TimePattern => "time_pattern",
            Self::Terminal => "terminal",
            Self::Debug => "debug",
            Self::Semantic => "semantic",
        }
    }

    /// Error-bearing signals outrank pure edit patterns in weighted-score
    /// ties.
    #[must_use]
    pub fn error_bearing(&self) -> bool {
        matches!(self, Self::Terminal)
    }
}

impl std::fmt::Display for SignalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Undo/redo sequence classification.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UndoRedoPattern {
    /// Rapid alternation between undo and redo.
    Thrash,
    /// Sustained undo: backing out of an approach.
    Revert,
    /// Mostly redo after undo: trying variants.
    Explore,
}

/// Per-type signal metadata.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalMetadata {
    EditPattern {
        edit_frequency_per_min: f64,
        retry_count: u32,
        similarity_max: f64,
    },
    UndoRedo {
        pattern: UndoRedoPattern,
        ratio: f64,
    },
    TimePattern {
        hesitation_ms: u64,
    },
    Terminal {
        terminal_errors: Vec<String>,
    },
    Debug {
        breakpoint_changes: u32,
    },
    Semantic {
        drift: f64,
    },
}

/// A scored summary emitted by one detector for one file window.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub signal_type: SignalType,
    /// Clamped to `[0, 1]`, monotone in the underlying observation.
    pub score: f64,
    /// Lookback window the score was computed over.
    pub window_ms: u64,
    pub metadata: SignalMetadata,
}

impl Signal {
    /// Whether the detector's own threshold is fully saturated. A saturated
    /// signal constitutes a trigger on its own, independent of the weighted
    /// fusion (a single weight never reaches the trigger threshold).
    #[must_use]
    pub fn saturated(&self) -> bool {
        self.score >= 1.0 - 1e-9
    }
}

/// Clamped cubic smoothstep over `[0, 1]`.
///
/// Maps a ratio of observation to threshold into a score that rises slowly
/// near zero, steeply around the midpoint, and saturates at the threshold.
#[must_use]
pub fn smoothstep(ratio: f64) -> f64 {
    let t = ratio.clamp(0.0, 1.0);
    t * t * (3.0 - 2.0 * t)
}
