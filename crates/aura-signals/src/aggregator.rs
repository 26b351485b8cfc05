//! Weighted signal aggregation with cooldown and snooze.
//!
//! The aggregator is the single writer per `file_key`: detector emissions
//! are upserted by type, and `evaluate` fuses the current set into an
//! [`AggregatedDecision`]. It never errors - an absent signal simply
//! contributes zero.

use crate::config::AggregatorConfig;
use crate::event::{Signal, SignalType};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};

/// Fused decision for one file window.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AggregatedDecision {
    /// `clamp01(sum(w_i * s_i))` over present signals.
    pub combined_score: f64,
    /// Signal type contributing the largest weighted component, with
    /// documented tie-breaks.
    pub primary_signal: Option<SignalType>,
    /// The signals that went into the decision, in insertion order.
    pub signals: Vec<Signal>,
    pub window_start_ms: i64,
    pub window_end_ms: i64,
    /// Whether this decision should fire a trigger, after threshold,
    /// cooldown, and snooze checks.
    pub should_trigger: bool,
}

struct FileAggregate {
    /// Insertion-ordered upsert by signal type.
    signals: Vec<Signal>,
    last_trigger_ms: Option<i64>,
    window_start_ms: i64,
}

/// Combines per-type signals into trigger decisions, one file at a time.
pub struct SignalAggregator {
    config: AggregatorConfig,
    files: DashMap<String, FileAggregate>,
    /// Server-side snooze bound; the effective snooze is the max of this and
    /// the client-persisted `snoozed_until_ms` from the config.
    server_snoozed_until_ms: AtomicI64,
}

impl SignalAggregator {
    #[must_use]
    pub fn new(config: AggregatorConfig) -> Self {
        Self {
            config,
            files: DashMap::new(),
            server_snoozed_until_ms: AtomicI64::new(0),
        }
    }

    /// Snooze all triggers until the given epoch-milliseconds bound.
    pub fn snooze_until(&self, until_ms: i64) {
        self.server_snoozed_until_ms
            .fetch_max(until_ms, Ordering::SeqCst);
    }

    /// The effective snooze bound: the stricter (max) of the client and
    /// server values.
    fn snoozed_until(&self) -> i64 {
        let client = self.config.snoozed_until_ms.unwrap_or(0);
        let server = self.server_snoozed_until_ms.load(Ordering::SeqCst);
        client.max(server)
    }

    /// Upsert the latest signal of its type for a file.
    pub fn update(&self, file_key: &str, signal: Signal) {
        let mut entry = self
            .files
            .entry(file_key.to_string())
            .or_insert_with(|| FileAggregate {
                signals: Vec::new(),
                last_trigger_ms: None,
                window_start_ms: 0,
            });
        match entry
            .signals
            .iter_mut()
            .find(|s| s.signal_type == signal.signal_type)
        {
            Some(existing) => *existing = signal,
            None => entry.signals.push(signal),
        }
    }

    /// Fuse the current signals for a file into a decision.
    ///
    /// Tie-breaks for the primary signal: stable insertion order of signal
    /// types, except that error-bearing signals outrank pure edit patterns
    /// when weighted scores are equal within `1e-6`.
    pub fn evaluate(&self, file_key: &str, now_ms: i64) -> AggregatedDecision {
        let window_ms = self
            .files
            .get(file_key)
            .and_then(|f| f.signals.first().map(|s| s.window_ms))
            .unwrap_or(0);

        let mut entry = self
            .files
            .entry(file_key.to_string())
            .or_insert_with(|| FileAggregate {
                signals: Vec::new(),
                last_trigger_ms: None,
                window_start_ms: now_ms.saturating_sub(window_ms as i64),
            });
        entry.window_start_ms = now_ms.saturating_sub(window_ms as i64);

        let weights = &self.config.weights;
        let mut combined = 0.0f64;
        let mut primary: Option<(SignalType, f64)> = None;
        let mut any_saturated = false;

        for signal in &entry.signals {
            let weighted = weights.for_type(signal.signal_type) * signal.score.clamp(0.0, 1.0);
            combined += weighted;
            any_saturated |= signal.saturated();

            primary = match primary {
                None => Some((signal.signal_type, weighted)),
                Some((best_type, best_weighted)) => {
                    if weighted > best_weighted + 1e-6 {
                        Some((signal.signal_type, weighted))
                    } else if (weighted - best_weighted).abs() <= 1e-6
                        && signal.signal_type.error_bearing()
                        && !best_type.error_bearing()
                    {
                        Some((signal.signal_type, weighted))
                    } else {
                        Some((best_type, best_weighted))
                    }
                }
            };
        }
        let combined_score = combined.clamp(0.0, 1.0);

        // Weighted fusion catches diffuse struggle across signals; a
        // saturated single detector (its own threshold fully met) is a
        // trigger in its own right - no single weight reaches the combined
        // threshold alone.
        let over_threshold = combined_score >= self.config.trigger_threshold || any_saturated;

        let cooldown_ok = entry
            .last_trigger_ms
            .map_or(true, |last| {
                now_ms.saturating_sub(last) >= self.config.cooldown_ms as i64
            });

        let snoozed = now_ms < self.snoozed_until();

        let should_trigger = over_threshold && cooldown_ok && !snoozed;
        if should_trigger {
            entry.last_trigger_ms = Some(now_ms);
            tracing::debug!(
                file_key,
                combined_score,
                primary = primary.map(|(t, _)| t.as_str()),
                "Trigger decision fired"
            );
        }

        AggregatedDecision {
            combined_score,
            primary_signal: primary.map(|(t, _)| t),
            signals: entry.signals.clone(),
            window_start_ms: entry.window_start_ms,
            window_end_ms: now_ms,
            should_trigger,
        }
    }

    /// Clear a file's signals after a trigger was accepted downstream. The
    /// cooldown clock keeps running from the trigger.
    pub fn reset(&self, file_key: &str, now_ms: i64) {
        if let Some(mut entry) = self.files.get_mut(file_key) {
            entry.signals.clear();
            entry.last_trigger_ms = Some(now_ms);
        }
    }
}
