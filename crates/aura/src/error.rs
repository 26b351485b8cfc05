// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Error taxonomy for the Aura core.
//!
//! Every fallible operation in the workspace bottoms out in [`Error`]. The
//! variants mirror the error kinds surfaced to clients (`invalid_input`,
//! `rate_limited`, `upstream_timeout`, ...) and each variant carries a fixed
//! retryability classification that the workflow runtime and the LLM
//! invocation layer consult before backing off.

use std::time::Duration;
use thiserror::Error;

/// Result alias used throughout the Aura workspace.
pub type Result<T> = std::result::Result<T, Error>;

/// Stable, serialisable error kind exposed in rejection payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidInput,
    RateLimited,
    UpstreamTimeout,
    UpstreamUnavailable,
    Transient,
    NonRetryable,
    NotFound,
    Conflict,
    Internal,
}

impl ErrorKind {
    /// Wire name for this kind, as carried in `{error: {type: ...}}` bodies.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidInput => "invalid_input",
            Self::RateLimited => "rate_limited",
            Self::UpstreamTimeout => "upstream_timeout",
            Self::UpstreamUnavailable => "upstream_unavailable",
            Self::Transient => "transient",
            Self::NonRetryable => "non_retryable",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::Internal => "internal",
        }
    }

    /// HTTP-ish status code used in rejection payloads.
    #[must_use]
    pub fn status(&self) -> u16 {
        match self {
            Self::InvalidInput => 400,
            Self::RateLimited => 429,
            Self::UpstreamTimeout => 504,
            Self::UpstreamUnavailable => 503,
            Self::Transient => 503,
            Self::NonRetryable => 502,
            Self::NotFound => 404,
            Self::Conflict => 409,
            Self::Internal => 500,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Core error type for graph execution, model invocation, and storage.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The caller supplied a payload the system cannot act on.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A rate limit rejected the operation before it executed.
    #[error("Rate limited: {message}")]
    RateLimited {
        message: String,
        /// Hint for when the caller may retry, if the limiter knows.
        retry_after: Option<Duration>,
    },

    /// An upstream call exceeded its deadline.
    #[error("Upstream timeout: {0}")]
    UpstreamTimeout(String),

    /// An upstream dependency is down or refusing connections.
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// A transient failure that is expected to clear on retry.
    #[error("Transient failure: {0}")]
    Transient(String),

    /// A provider-level refusal or permanent failure; retrying cannot help.
    #[error("Non-retryable failure: {0}")]
    NonRetryable(String),

    /// The requested entity does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The operation conflicts with current state.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// An unexpected internal failure.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Graph construction or compilation failed validation.
    #[error("Graph validation failed: {0}")]
    Validation(String),

    /// A node's execution failed after the runtime's retry budget.
    #[error("Node '{node}' failed: {source}")]
    NodeExecution {
        node: String,
        #[source]
        source: Box<Error>,
    },

    /// Checkpoint storage failed.
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    /// The thread's cancellation flag was observed at a superstep boundary.
    #[error("Thread '{0}' was cancelled")]
    Cancelled(String),

    /// Interrupts require a checkpointer to persist the paused state.
    #[error("Interrupt configured without a checkpointer: {0}")]
    InterruptWithoutCheckpointer(String),

    /// Interrupts require a thread id to key the paused state.
    #[error("Interrupt configured without a thread id: {0}")]
    InterruptWithoutThreadId(String),

    /// `resume()` called on a graph without a checkpointer.
    #[error("resume() requires a checkpointer")]
    ResumeWithoutCheckpointer,

    /// `resume()` called on a graph without a thread id.
    #[error("resume() requires a thread id")]
    ResumeWithoutThreadId,

    /// `resume()` found no checkpoint for the configured thread.
    #[error("No checkpoint to resume for thread '{0}'")]
    NoCheckpointToResume(String),
}

impl Error {
    /// Construct an `InvalidInput` error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Construct a `RateLimited` error with an optional retry-after hint.
    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self::RateLimited {
            message: message.into(),
            retry_after,
        }
    }

    /// Construct an `UpstreamTimeout` error.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::UpstreamTimeout(message.into())
    }

    /// Construct an `UpstreamUnavailable` error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::UpstreamUnavailable(message.into())
    }

    /// Construct a `Transient` error.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    /// Construct a `NonRetryable` error.
    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self::NonRetryable(message.into())
    }

    /// Construct a `NotFound` error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    /// Construct an `Internal` error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// The stable kind for this error, as exposed to clients.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidInput(_) | Self::Validation(_) => ErrorKind::InvalidInput,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::UpstreamTimeout(_) => ErrorKind::UpstreamTimeout,
            Self::UpstreamUnavailable(_) | Self::Checkpoint(CheckpointError::ConnectionLost { .. }) => {
                ErrorKind::UpstreamUnavailable
            }
            Self::Transient(_) => ErrorKind::Transient,
            Self::NonRetryable(_) => ErrorKind::NonRetryable,
            Self::NotFound(_) | Self::NoCheckpointToResume(_) => ErrorKind::NotFound,
            Self::Cancelled(_) => ErrorKind::Conflict,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::NodeExecution { source, .. } => source.kind(),
            _ => ErrorKind::Internal,
        }
    }

    /// Whether the workflow runtime should re-execute after backoff.
    ///
    /// Rate limits, timeouts, unavailable upstreams, and transient failures
    /// retry; everything else fails the thread immediately.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::RateLimited
                | ErrorKind::UpstreamTimeout
                | ErrorKind::UpstreamUnavailable
                | ErrorKind::Transient
        )
    }

    /// Retry-after hint if one was carried by the upstream rejection.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            Self::NodeExecution { source, .. } => source.retry_after(),
            _ => None,
        }
    }
}

/// Errors raised by checkpoint storage backends.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CheckpointError {
    /// Filesystem-level failure.
    #[error("Checkpoint I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// State could not be serialised for storage.
    #[error("Checkpoint serialization failed: {reason}")]
    SerializationFailed { reason: String },

    /// Stored bytes could not be deserialised back into state.
    #[error("Checkpoint deserialization failed: {reason}")]
    DeserializationFailed { reason: String },

    /// The integrity header did not verify (corruption detected).
    #[error("Checkpoint '{checkpoint_id}' failed integrity check: {reason}")]
    IntegrityCheckFailed {
        checkpoint_id: String,
        reason: String,
    },

    /// The storage backend dropped its connection.
    #[error("Checkpoint backend '{backend}' connection lost: {reason}")]
    ConnectionLost { backend: String, reason: String },

    /// Cross-process lock acquisition failed.
    #[error("Failed to lock checkpoint directory '{path}': {reason}")]
    LockFailed { path: String, reason: String },

    /// Anything else.
    #[error("Checkpoint error: {0}")]
    Other(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        assert!(Error::rate_limited("slow down", None).is_retryable());
        assert!(Error::timeout("deadline").is_retryable());
        assert!(Error::unavailable("down").is_retryable());
        assert!(Error::transient("blip").is_retryable());

        assert!(!Error::invalid_input("bad").is_retryable());
        assert!(!Error::non_retryable("refused").is_retryable());
        assert!(!Error::not_found("missing").is_retryable());
        assert!(!Error::internal("bug").is_retryable());
    }

    #[test]
    fn node_execution_inherits_source_classification() {
        let err = Error::NodeExecution {
            node: "generate".to_string(),
            source: Box::new(Error::timeout("provider call")),
        };
        assert!(err.is_retryable());
        assert_eq!(err.kind(), ErrorKind::UpstreamTimeout);

        let err = Error::NodeExecution {
            node: "generate".to_string(),
            source: Box::new(Error::non_retryable("refusal")),
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn retry_after_propagates_through_node_wrapper() {
        let err = Error::NodeExecution {
            node: "generate".to_string(),
            source: Box::new(Error::rate_limited("429", Some(Duration::from_secs(7)))),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
    }

    #[test]
    fn kind_wire_names() {
        assert_eq!(ErrorKind::InvalidInput.as_str(), "invalid_input");
        assert_eq!(ErrorKind::RateLimited.as_str(), "rate_limited");
        assert_eq!(ErrorKind::UpstreamTimeout.as_str(), "upstream_timeout");
        assert_eq!(ErrorKind::NonRetryable.as_str(), "non_retryable");
        assert_eq!(ErrorKind::RateLimited.status(), 429);
        assert_eq!(ErrorKind::NotFound.status(), 404);
    }
}
