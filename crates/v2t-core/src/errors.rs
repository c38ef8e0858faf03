//! Data-model errors.
//!
//! These are raised by the state machines in [`crate::workspace`] and
//! [`crate::branch`] when a caller attempts an illegal mutation. They never
//! describe adapter failures; those live in the runtime crate.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Illegal mutation of a workspace or branch record.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ModelError {
    /// The requested state change is not in the transition table.
    #[error("illegal {entity} transition: {from} -> {to}")]
    IllegalTransition {
        /// `"workspace"` or `"branch"`.
        entity: &'static str,
        /// Current state.
        from: String,
        /// Requested state.
        to: String,
    },

    /// The transcript is write-once.
    #[error("transcript already set")]
    TranscriptAlreadySet,

    /// A workspace cannot become ready without transcript text.
    #[error("transcript is empty")]
    EmptyTranscript,

    /// Content may only grow while the branch is streaming.
    #[error("branch content is frozen in state {0}")]
    ContentFrozen(String),
}

/// Wire-level classification carried by `error` events.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Input rejected before any state was created.
    Validation,
    /// An external adapter call failed or timed out.
    Adapter,
    /// A branch of the same kind is already active.
    Conflict,
    /// Unknown workspace or branch ID.
    NotFound,
    /// Explicit cancellation.
    Cancelled,
    /// Operation not permitted in the target's current state.
    InvalidState,
}

impl ErrorCategory {
    /// Stable string form.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Adapter => "adapter",
            Self::Conflict => "conflict",
            Self::NotFound => "not_found",
            Self::Cancelled => "cancelled",
            Self::InvalidState => "invalid_state",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
