//! Runtime error types.
//!
//! [`AdapterError`] is what an external collaborator returns; it always names
//! the stage it failed in. [`EngineError`] is what the engine's public
//! operations return, and its [`category`](EngineError::category) is what
//! `error` events carry on the wire.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use v2t_core::{BranchKind, ErrorCategory, ModelError, WorkspaceId};

/// Adapter call an error is attributed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterStage {
    /// Media resolution and download.
    Download,
    /// Speech-to-text.
    Transcribe,
    /// Content generation for a branch.
    Generate,
    /// Text-to-speech for audio branches.
    Synthesize,
}

impl AdapterStage {
    /// Stable string form.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Download => "download",
            Self::Transcribe => "transcribe",
            Self::Generate => "generate",
            Self::Synthesize => "synthesize",
        }
    }
}

impl fmt::Display for AdapterStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of an external collaborator.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum AdapterError {
    /// The adapter reported an error.
    #[error("{stage} failed: {message}")]
    Failed {
        /// Failing stage.
        stage: AdapterStage,
        /// Adapter-provided reason.
        message: String,
    },

    /// The call did not finish within its time budget.
    #[error("{stage} timed out after {}s", .elapsed.as_secs())]
    Timeout {
        /// Failing stage.
        stage: AdapterStage,
        /// Budget that was exceeded.
        elapsed: Duration,
    },

    /// The call was aborted by a cancellation.
    #[error("{stage} cancelled")]
    Cancelled {
        /// Aborted stage.
        stage: AdapterStage,
    },
}

impl AdapterError {
    /// Shorthand for [`AdapterError::Failed`].
    pub fn failed(stage: AdapterStage, message: impl Into<String>) -> Self {
        Self::Failed {
            stage,
            message: message.into(),
        }
    }

    /// Stage the error is attributed to.
    pub fn stage(&self) -> AdapterStage {
        match self {
            Self::Failed { stage, .. } | Self::Timeout { stage, .. } | Self::Cancelled { stage } => {
                *stage
            }
        }
    }
}

/// Errors returned by engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Input rejected before any state was created.
    #[error("invalid input: {0}")]
    Validation(String),

    /// External adapter failure, or a cancellation that aborted an adapter
    /// call.
    #[error(transparent)]
    Adapter(#[from] AdapterError),

    /// A non-terminal branch of this kind already exists.
    #[error("a {kind} branch is already active in workspace {workspace_id}")]
    Conflict {
        /// Workspace.
        workspace_id: WorkspaceId,
        /// Kind that is busy.
        kind: BranchKind,
    },

    /// Unknown workspace or branch.
    #[error("not found: {0}")]
    NotFound(String),

    /// Operation not permitted in the target's current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A state-machine mutation was rejected.
    #[error(transparent)]
    InvalidTransition(#[from] ModelError),
}

impl EngineError {
    /// Wire-level classification.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Validation(_) => ErrorCategory::Validation,
            Self::Adapter(AdapterError::Cancelled { .. }) => ErrorCategory::Cancelled,
            Self::Adapter(_) => ErrorCategory::Adapter,
            Self::Conflict { .. } => ErrorCategory::Conflict,
            Self::NotFound(_) => ErrorCategory::NotFound,
            Self::InvalidState(_) | Self::InvalidTransition(_) => ErrorCategory::InvalidState,
        }
    }
}
