//! Terminal/diagnostic error detector.
//!
//! Consumes terminal output lines and editor diagnostics. Terminal lines are
//! matched against common error shapes (compiler error prefixes, exception
//! traces, non-zero exits, panics); diagnostics already arrive classified
//! and always count. Exemplar messages are retained, capped per file.

use super::{Detector, WindowBuffer};
use crate::config::DetectorConfig;
use crate::event::{smoothstep, Signal, SignalEvent, SignalKind, SignalMetadata, SignalType};
use regex::RegexSet;
use std::collections::HashMap;
use std::sync::OnceLock;

fn error_patterns() -> &'static RegexSet {
    static PATTERNS: OnceLock<RegexSet> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        #[allow(clippy::expect_used)] // Literal patterns, validated by tests.
        RegexSet::new([
            r"(?i)^error(\[[A-Z]+\d+\])?[:\s]",       // rustc / generic "error:"
            r"\bE\d{4}\b",                            // rustc error codes
            r"\bTS\d{4,5}\b",                         // TypeScript diagnostics
            r"(?i)exception\b",                       // exception traces (incl. FooException)
            r"Traceback \(most recent call last\)",   // Python
            r"panicked at",                           // Rust panics
            r"(?i)exit (code|status) [1-9]\d*",       // non-zero exits
            r"(?i)\bsegmentation fault\b",
            r"(?i)(compilation|build) failed",
            r"(?i)^\s*FAILED\b",                      // test failures
            r"(?i)fatal:",                            // git/linkers
        ])
        .expect("terminal error patterns are valid")
    })
}

/// Whether a terminal line looks like an error.
#[must_use]
pub fn is_error_line(line: &str) -> bool {
    error_patterns().is_match(line)
}

/// Counts errors and keeps exemplar messages per file.
pub struct TerminalDetector {
    config: DetectorConfig,
    files: HashMap<String, WindowBuffer<String>>,
}

impl TerminalDetector {
    #[must_use]
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            config,
            files: HashMap::new(),
        }
    }
}

impl Detector for TerminalDetector {
    fn signal_type(&self) -> SignalType {
        SignalType::Terminal
    }

    fn observe(&mut self, event: &SignalEvent) {
        let is_error = match event.kind {
            SignalKind::DiagnosticError => true,
            SignalKind::TerminalError => {
                // Terminal events may carry arbitrary output lines; keep
                // only the ones that look like errors.
                event.payload.is_empty() || is_error_line(&event.payload)
            }
            _ => false,
        };
        if !is_error {
            return;
        }

        let buffer = self
            .files
            .entry(event.file_key.clone())
            .or_insert_with(|| WindowBuffer::new(self.config.max_errors_per_file));
        buffer.prune(event.ts_ms, self.config.window_ms);
        buffer.push(event.ts_ms, event.payload.clone());
    }

    fn evaluate(&self, file_key: &str, now_ms: i64) -> Option<Signal> {
        let buffer = self.files.get(file_key)?;
        let errors: Vec<String> = buffer
            .in_window(now_ms, self.config.window_ms)
            .map(|(_, msg)| msg.clone())
            .collect();
        if errors.is_empty() {
            return None;
        }

        let ratio = errors.len() as f64 / f64::from(self.config.error_count_threshold);

        Some(Signal {
            signal_type: SignalType::Terminal,
            score: smoothstep(ratio),
            window_ms: self.config.window_ms,
            metadata: SignalMetadata::Terminal {
                terminal_errors: errors,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognises_common_error_lines() {
        assert!(is_error_line("error[E0308]: mismatched types"));
        assert!(is_error_line("error: linking with `cc` failed"));
        assert!(is_error_line("TS2304: Cannot find name 'x'"));
        assert!(is_error_line("Traceback (most recent call last):"));
        assert!(is_error_line("thread 'main' panicked at src/main.rs:4:5"));
        assert!(is_error_line("Process finished with exit code 101"));
        assert!(is_error_line("FAILED tests/test_api.py::test_login"));
        assert!(is_error_line("java.lang.NullPointerException at Foo.bar"));
    }

    #[test]
    fn ignores_ordinary_output() {
        assert!(!is_error_line("Compiling aura v0.4.2"));
        assert!(!is_error_line("test result: ok. 42 passed; 0 failed"));
        assert!(!is_error_line("$ cargo run"));
    }

    #[test]
    fn two_diagnostics_saturate_the_score() {
        let mut detector = TerminalDetector::new(DetectorConfig::default());
        detector.observe(
            &SignalEvent::new(0, "f.ts", SignalKind::DiagnosticError)
                .with_payload("TS1005: ';' expected"),
        );
        detector.observe(
            &SignalEvent::new(100, "f.ts", SignalKind::DiagnosticError)
                .with_payload("TS2304: Cannot find name 'x'"),
        );

        let signal = detector.evaluate("f.ts", 200).unwrap();
        assert!(signal.saturated());
        let SignalMetadata::Terminal { terminal_errors } = signal.metadata else {
            panic!("wrong metadata variant");
        };
        assert_eq!(terminal_errors.len(), 2);
        assert!(terminal_errors[0].contains("TS1005"));
    }

    #[test]
    fn non_error_terminal_lines_are_filtered() {
        let mut detector = TerminalDetector::new(DetectorConfig::default());
        detector.observe(
            &SignalEvent::new(0, "f.rs", SignalKind::TerminalError)
                .with_payload("Compiling aura v0.4.2"),
        );
        assert!(detector.evaluate("f.rs", 100).is_none());
    }

    #[test]
    fn exemplars_are_capped() {
        let config = DetectorConfig {
            max_errors_per_file: 3,
            ..DetectorConfig::default()
        };
        let mut detector = TerminalDetector::new(config);
        for i in 0..10 {
            detector.observe(
                &SignalEvent::new(i, "f.rs", SignalKind::DiagnosticError)
                    .with_payload(format!("error: e{i}")),
            );
        }
        let signal = detector.evaluate("f.rs", 100).unwrap();
        let SignalMetadata::Terminal { terminal_errors } = signal.metadata else {
            panic!("wrong metadata variant");
        };
        assert_eq!(terminal_errors.len(), 3);
        // Most recent exemplars are retained.
        assert!(terminal_errors.contains(&"error: e9".to_string()));
    }

    #[test]
    fn single_error_scores_below_saturation() {
        let mut detector = TerminalDetector::new(DetectorConfig::default());
        detector.observe(
            &SignalEvent::new(0, "f.rs", SignalKind::DiagnosticError).with_payload("error: one"),
        );
        let signal = detector.evaluate("f.rs", 100).unwrap();
        assert!(signal.score > 0.0);
        assert!(!signal.saturated());
    }
}
