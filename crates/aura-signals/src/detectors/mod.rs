//! Signal detectors.
//!
//! One detector per signal kind, all implementing the same contract:
//! [`Detector::observe`] folds a raw event into per-file state without
//! blocking, and [`Detector::evaluate`] summarises the current window into a
//! [`Signal`]. Detectors never panic and never interfere across files; noisy
//! or missing events degrade scores, not availability.

mod debug;
mod edit_pattern;
mod semantic;
mod terminal;
mod time_pattern;
mod undo_redo;

pub use debug::DebugDetector;
pub use edit_pattern::EditPatternDetector;
pub use semantic::SemanticDetector;
pub use terminal::TerminalDetector;
pub use time_pattern::TimePatternDetector;
pub use undo_redo::UndoRedoDetector;

use crate::event::{Signal, SignalEvent, SignalType};
use std::collections::VecDeque;

/// Uniform detector contract.
pub trait Detector: Send {
    /// The signal type this detector emits.
    fn signal_type(&self) -> SignalType;

    /// Fold one raw event into per-file state. Non-blocking; events of
    /// irrelevant kinds are ignored.
    fn observe(&mut self, event: &SignalEvent);

    /// Summarise the window ending at `now_ms` for `file_key`. `None` when
    /// the detector has nothing to say for this file.
    fn evaluate(&self, file_key: &str, now_ms: i64) -> Option<Signal>;
}

/// A time-ordered, capacity-capped event buffer.
///
/// Entries live until they fall out of the rolling window or the buffer
/// overflows its cap, whichever is tighter.
#[derive(Clone, Debug)]
pub(crate) struct WindowBuffer<T> {
    entries: VecDeque<(i64, T)>,
    cap: usize,
}

impl<T> WindowBuffer<T> {
    pub(crate) fn new(cap: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            cap: cap.max(1),
        }
    }

    pub(crate) fn push(&mut self, ts_ms: i64, value: T) {
        if self.entries.len() == self.cap {
            self.entries.pop_front();
        }
        self.entries.push_back((ts_ms, value));
    }

    /// Drop entries older than the window.
    pub(crate) fn prune(&mut self, now_ms: i64, window_ms: u64) {
        let cutoff = now_ms.saturating_sub(window_ms as i64);
        while let Some((ts, _)) = self.entries.front() {
            if *ts < cutoff {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    /// Entries inside the window ending at `now_ms`, oldest first.
    pub(crate) fn in_window(&self, now_ms: i64, window_ms: u64) -> impl Iterator<Item = &(i64, T)> {
        let cutoff = now_ms.saturating_sub(window_ms as i64);
        self.entries
            .iter()
            .filter(move |(ts, _)| *ts >= cutoff && *ts <= now_ms)
    }

    /// Most-recent-first iteration over the whole buffer.
    pub(crate) fn iter_recent(&self) -> impl Iterator<Item = &(i64, T)> {
        self.entries.iter().rev()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_buffer_caps_length() {
        let mut buffer: WindowBuffer<u32> = WindowBuffer::new(3);
        for i in 0..5 {
            buffer.push(i64::from(i), i);
        }
        assert_eq!(buffer.len(), 3);
        let values: Vec<u32> = buffer.iter_recent().map(|(_, v)| *v).collect();
        assert_eq!(values, vec![4, 3, 2]);
    }

    #[test]
    fn window_buffer_prunes_old_entries() {
        let mut buffer: WindowBuffer<u32> = WindowBuffer::new(10);
        buffer.push(0, 0);
        buffer.push(5_000, 1);
        buffer.push(9_000, 2);
        buffer.prune(10_000, 6_000);
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn in_window_filters_by_cutoff() {
        let mut buffer: WindowBuffer<u32> = WindowBuffer::new(10);
        buffer.push(0, 0);
        buffer.push(5_000, 1);
        buffer.push(9_000, 2);
        let count = buffer.in_window(10_000, 6_000).count();
        assert_eq!(count, 2);
    }
}
