// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! State bounds for graph execution.

use serde::{de::DeserializeOwned, Serialize};

/// Marker trait for types usable as graph state.
///
/// Automatically implemented for any type meeting the bounds; no manual
/// implementation is needed. State must be cloneable (each node receives its
/// own copy), sendable across tasks, and serialisable for checkpointing.
pub trait GraphState: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> GraphState for T where T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// Deterministic merge of a state patch into an existing state.
///
/// The runtime folds recorded pending writes into the materialised state when
/// resuming a thread whose checkpoint did not advance past a completed task.
/// Implementations must be idempotent: merging the same patch twice yields
/// the same state as merging it once.
pub trait MergeableState {
    /// Fold `other` into `self`, preferring `other`'s populated fields.
    fn merge(&mut self, other: &Self);
}
