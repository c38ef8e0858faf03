//! Workspace record and its lifecycle state machine.
//!
//! A workspace tracks one source through the two mandatory acquisition
//! stages (download, transcribe). Only the lifecycle engine mutates
//! [`Workspace::stage`]; every change goes through [`Workspace::advance`],
//! which enforces the transition table below.
//!
//! ```text
//! pending ──▶ downloading ──▶ transcribing ──▶ ready ──▶ completed
//!    │             │               │
//!    └─────────────┴───────────────┴──────▶ failed
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::branch::BranchSnapshot;
use crate::errors::ModelError;
use crate::ids::WorkspaceId;

/// Lifecycle stage of a workspace.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceStage {
    /// Accepted, stage 1 not started yet.
    Pending,
    /// Download adapter in flight.
    Downloading,
    /// Transcribe adapter in flight.
    Transcribing,
    /// Transcript available; branches may start.
    Ready,
    /// Every started branch has settled.
    Completed,
    /// A stage failed or was cancelled.
    Failed,
}

impl WorkspaceStage {
    /// Whether the stage is final.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether the acquisition pipeline is still running.
    #[must_use]
    pub fn is_in_flight(self) -> bool {
        matches!(self, Self::Pending | Self::Downloading | Self::Transcribing)
    }

    /// Whether branches may be started against a workspace in this stage.
    #[must_use]
    pub fn accepts_branches(self) -> bool {
        matches!(self, Self::Ready | Self::Completed)
    }

    /// Transition table.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Downloading | Self::Failed)
                | (Self::Downloading, Self::Transcribing | Self::Failed)
                | (Self::Transcribing, Self::Ready | Self::Failed)
                | (Self::Ready, Self::Completed)
        )
    }

    /// Stable string form.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Transcribing => "transcribing",
            Self::Ready => "ready",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for WorkspaceStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque handle to a media artifact, owned by whichever adapter produced it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MediaHandle(String);

impl MediaHandle {
    /// Wrap an adapter-issued handle.
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    /// The raw handle.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MediaHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Handles returned by the download stage.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaHandles {
    /// Video artifact.
    pub video: MediaHandle,
    /// Audio track fed to the transcriber.
    pub audio: MediaHandle,
}

/// Durable workspace record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Workspace {
    /// Workspace ID.
    pub id: WorkspaceId,
    /// Source reference (URL extracted from the submission).
    pub source: String,
    stage: WorkspaceStage,
    /// Title reported by the download adapter.
    pub title: Option<String>,
    /// Human-readable progress line.
    pub progress: String,
    /// Media produced by stage 1.
    pub media: Option<MediaHandles>,
    /// Media duration reported by stage 1, if known.
    pub duration_secs: Option<u64>,
    transcript: Option<String>,
    /// Terminal error, set together with `failed`.
    pub error: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last time a consumer read or subscribed to this workspace.
    pub last_accessed_at: DateTime<Utc>,
}

impl Workspace {
    /// Allocate a workspace in `pending`.
    pub fn new(source: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: WorkspaceId::new(),
            source: source.into(),
            stage: WorkspaceStage::Pending,
            title: None,
            progress: "waiting".into(),
            media: None,
            duration_secs: None,
            transcript: None,
            error: None,
            created_at: now,
            last_accessed_at: now,
        }
    }

    /// Current stage.
    #[must_use]
    pub fn stage(&self) -> WorkspaceStage {
        self.stage
    }

    /// Transcript, once stage 2 has succeeded.
    #[must_use]
    pub fn transcript(&self) -> Option<&str> {
        self.transcript.as_deref()
    }

    /// Move to `next`, enforcing the transition table.
    ///
    /// `ready` additionally requires a non-empty transcript.
    pub fn advance(&mut self, next: WorkspaceStage) -> Result<(), ModelError> {
        if !self.stage.can_transition_to(next) {
            return Err(ModelError::IllegalTransition {
                entity: "workspace",
                from: self.stage.to_string(),
                to: next.to_string(),
            });
        }
        if next == WorkspaceStage::Ready && self.transcript.as_deref().is_none_or(str::is_empty) {
            return Err(ModelError::EmptyTranscript);
        }
        self.stage = next;
        Ok(())
    }

    /// Store the transcript. Write-once; empty text is rejected.
    pub fn set_transcript(&mut self, text: impl Into<String>) -> Result<(), ModelError> {
        if self.transcript.is_some() {
            return Err(ModelError::TranscriptAlreadySet);
        }
        let text = text.into();
        if text.trim().is_empty() {
            return Err(ModelError::EmptyTranscript);
        }
        self.transcript = Some(text);
        Ok(())
    }

    /// Record a terminal failure.
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), ModelError> {
        self.advance(WorkspaceStage::Failed)?;
        let reason = reason.into();
        self.progress.clone_from(&reason);
        self.error = Some(reason);
        Ok(())
    }

    /// Refresh the idle-expiry clock.
    pub fn touch(&mut self) {
        self.last_accessed_at = Utc::now();
    }

    /// Build the consumer-facing view.
    #[must_use]
    pub fn snapshot(&self, branches: Vec<BranchSnapshot>) -> WorkspaceSnapshot {
        WorkspaceSnapshot {
            workspace_id: self.id.clone(),
            source: self.source.clone(),
            stage: self.stage,
            title: self.title.clone(),
            progress: self.progress.clone(),
            transcript: self.transcript.clone(),
            error: self.error.clone(),
            media: self.media.clone(),
            duration_secs: self.duration_secs,
            branches,
            created_at: self.created_at,
            last_accessed_at: self.last_accessed_at,
        }
    }
}

/// Point-in-time view of a workspace and its branches.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceSnapshot {
    /// Workspace ID.
    pub workspace_id: WorkspaceId,
    /// Source reference.
    pub source: String,
    /// Current stage.
    pub stage: WorkspaceStage,
    /// Title, once known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Progress line.
    pub progress: String,
    /// Transcript, once ready.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcript: Option<String>,
    /// Terminal error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Media handles, once downloaded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media: Option<MediaHandles>,
    /// Media duration in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<u64>,
    /// Branch summaries, including accumulated content.
    pub branches: Vec<BranchSnapshot>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last access time.
    pub last_accessed_at: DateTime<Utc>,
}
