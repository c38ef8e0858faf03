//! Generation branches and their state machine.
//!
//! A branch is one derivative artifact (outline, article, podcast, ...)
//! generated from a ready workspace's transcript. Only the branch controller
//! mutates a branch, and only through the methods below, which consult
//! [`BranchState::can_transition_to`]:
//!
//! | From | To |
//! |------|----|
//! | `idle` | `streaming`, `failed` |
//! | `streaming` | `synthesizing` (audio kinds only), `completed`, `failed` |
//! | `synthesizing` | `completed`, `failed` |
//! | `completed`, `failed` | `streaming` (restart, same branch ID) |

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::ModelError;
use crate::ids::{BranchId, WorkspaceId};
use crate::workspace::MediaHandle;

/// Content kind produced by a branch. Open-ended: unknown names are kept
/// verbatim as [`BranchKind::Other`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum BranchKind {
    /// Structured outline with timestamps.
    Outline,
    /// Long-form article.
    Article,
    /// Spoken-style script followed by speech synthesis.
    Podcast,
    /// Article in an alternate publication style.
    AlternateArticle,
    /// Any other generator-supported kind.
    Other(String),
}

impl BranchKind {
    /// Stable string form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Outline => "outline",
            Self::Article => "article",
            Self::Podcast => "podcast",
            Self::AlternateArticle => "alternate-article",
            Self::Other(name) => name,
        }
    }

    /// Whether stream exhaustion is followed by a synthesis step.
    #[must_use]
    pub fn produces_audio(&self) -> bool {
        matches!(self, Self::Podcast)
    }
}

impl From<&str> for BranchKind {
    fn from(s: &str) -> Self {
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        match normalized.as_str() {
            "outline" => Self::Outline,
            "article" => Self::Article,
            "podcast" => Self::Podcast,
            "alternate-article" | "zhihu" | "zhihu-article" => Self::AlternateArticle,
            _ => Self::Other(normalized),
        }
    }
}

impl From<String> for BranchKind {
    fn from(s: String) -> Self {
        Self::from(s.as_str())
    }
}

impl From<BranchKind> for String {
    fn from(kind: BranchKind) -> Self {
        kind.as_str().to_owned()
    }
}

impl FromStr for BranchKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from(s))
    }
}

impl fmt::Display for BranchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Branch state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchState {
    /// Created, generator not invoked yet.
    Idle,
    /// Receiving chunks from the generator.
    Streaming,
    /// Script complete, speech synthesis in flight.
    Synthesizing,
    /// Finished; content is frozen until restart.
    Completed,
    /// Generator failed or the branch was cancelled.
    Failed,
}

impl BranchState {
    /// Whether the state is final (until an explicit restart).
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Transition table.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Idle, Self::Streaming | Self::Failed)
                | (
                    Self::Streaming,
                    Self::Synthesizing | Self::Completed | Self::Failed
                )
                | (Self::Synthesizing, Self::Completed | Self::Failed)
                | (Self::Completed | Self::Failed, Self::Streaming)
        )
    }

    /// Stable string form.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Streaming => "streaming",
            Self::Synthesizing => "synthesizing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for BranchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Prompt overrides handed to the generator. Empty fields mean "use the
/// generator's default prompt for this kind".
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptParams {
    /// System prompt override.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// User prompt override; `{content}` is replaced with the transcript.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_prompt: Option<String>,
}

/// Durable branch record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Branch {
    /// Branch ID, stable across restarts.
    pub id: BranchId,
    /// Owning workspace. Not an ownership edge: the store evicts branches
    /// together with their workspace.
    pub workspace_id: WorkspaceId,
    /// Content kind.
    pub kind: BranchKind,
    state: BranchState,
    content: String,
    /// Prompt parameters of the current attempt.
    pub params: PromptParams,
    /// Synthesized audio (audio kinds only).
    pub audio: Option<MediaHandle>,
    /// Non-fatal synthesis failure on an otherwise completed branch.
    pub audio_error: Option<String>,
    /// Terminal error.
    pub error: Option<String>,
    /// Number of times the branch entered `streaming`.
    pub attempt: u32,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

impl Branch {
    /// Create an idle branch.
    pub fn new(workspace_id: WorkspaceId, kind: BranchKind, params: PromptParams) -> Self {
        let now = Utc::now();
        Self {
            id: BranchId::new(),
            workspace_id,
            kind,
            state: BranchState::Idle,
            content: String::new(),
            params,
            audio: None,
            audio_error: None,
            error: None,
            attempt: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> BranchState {
        self.state
    }

    /// Accumulated content.
    #[must_use]
    pub fn content(&self) -> &str {
        &self.content
    }

    fn advance(&mut self, next: BranchState) -> Result<(), ModelError> {
        if !self.state.can_transition_to(next)
            || (next == BranchState::Synthesizing && !self.kind.produces_audio())
        {
            return Err(ModelError::IllegalTransition {
                entity: "branch",
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        self.state = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Enter `streaming`. From a terminal state this is a restart: content,
    /// errors and audio are reset and the attempt counter increments.
    /// `params` replaces the stored prompt parameters when given.
    pub fn begin(&mut self, params: Option<PromptParams>) -> Result<(), ModelError> {
        self.advance(BranchState::Streaming)?;
        self.content.clear();
        self.error = None;
        self.audio = None;
        self.audio_error = None;
        self.attempt += 1;
        if let Some(params) = params {
            self.params = params;
        }
        Ok(())
    }

    /// Append a generated chunk. Only legal while streaming.
    pub fn append(&mut self, delta: &str) -> Result<(), ModelError> {
        if self.state != BranchState::Streaming {
            return Err(ModelError::ContentFrozen(self.state.to_string()));
        }
        self.content.push_str(delta);
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Script finished; hand it to speech synthesis.
    pub fn begin_synthesis(&mut self) -> Result<(), ModelError> {
        self.advance(BranchState::Synthesizing)
    }

    /// Stream exhausted without a synthesis step.
    pub fn complete(&mut self) -> Result<(), ModelError> {
        if self.state == BranchState::Synthesizing {
            return Err(ModelError::IllegalTransition {
                entity: "branch",
                from: self.state.to_string(),
                to: BranchState::Completed.to_string(),
            });
        }
        self.advance(BranchState::Completed)
    }

    /// Synthesis finished. A synthesis error still completes the branch:
    /// the script stays usable and the error is kept in `audio_error`.
    pub fn complete_with_audio(
        &mut self,
        outcome: Result<MediaHandle, String>,
    ) -> Result<(), ModelError> {
        if self.state != BranchState::Synthesizing {
            return Err(ModelError::IllegalTransition {
                entity: "branch",
                from: self.state.to_string(),
                to: BranchState::Completed.to_string(),
            });
        }
        self.advance(BranchState::Completed)?;
        match outcome {
            Ok(handle) => self.audio = Some(handle),
            Err(reason) => self.audio_error = Some(reason),
        }
        Ok(())
    }

    /// Terminal failure. Partial content is kept for display.
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), ModelError> {
        self.advance(BranchState::Failed)?;
        self.error = Some(reason.into());
        Ok(())
    }

    /// Consumer-facing view.
    #[must_use]
    pub fn snapshot(&self) -> BranchSnapshot {
        BranchSnapshot {
            branch_id: self.id.clone(),
            workspace_id: self.workspace_id.clone(),
            kind: self.kind.clone(),
            state: self.state,
            content: self.content.clone(),
            params: self.params.clone(),
            has_audio: self.audio.is_some(),
            audio: self.audio.clone(),
            audio_error: self.audio_error.clone(),
            error: self.error.clone(),
            attempt: self.attempt,
            updated_at: self.updated_at,
        }
    }
}

/// Point-in-time view of a branch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BranchSnapshot {
    /// Branch ID.
    pub branch_id: BranchId,
    /// Owning workspace.
    pub workspace_id: WorkspaceId,
    /// Content kind.
    pub kind: BranchKind,
    /// Current state.
    pub state: BranchState,
    /// Accumulated content.
    pub content: String,
    /// Prompt parameters of the current attempt.
    pub params: PromptParams,
    /// Whether an audio artifact is attached.
    pub has_audio: bool,
    /// Audio handle.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<MediaHandle>,
    /// Non-fatal synthesis failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_error: Option<String>,
    /// Terminal error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Attempt counter.
    pub attempt: u32,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}
