//! Event envelope and payload union.
//!
//! Events are transient: they exist only on the channel and are never
//! persisted. Every event is addressed to one [`TargetId`] and carries a
//! per-target sequence number assigned at publish time.
//!
//! Wire shape:
//!
//! ```json
//! {"target":{"kind":"branch","id":"br_..."},"seq":4,"timestamp":"...",
//!  "type":"chunk","branch_id":"br_...","delta":"- point"}
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::branch::{BranchKind, BranchSnapshot, BranchState};
use crate::errors::ErrorCategory;
use crate::ids::{BranchId, WorkspaceId};
use crate::workspace::{MediaHandle, WorkspaceSnapshot, WorkspaceStage};

// ─────────────────────────────────────────────────────────────────────────────
// Addressing
// ─────────────────────────────────────────────────────────────────────────────

/// Channel topic an event is addressed to.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum TargetId {
    /// Workspace topic: stage changes plus every branch's events.
    Workspace(WorkspaceId),
    /// Branch topic: events of a single branch.
    Branch(BranchId),
}

impl From<WorkspaceId> for TargetId {
    fn from(id: WorkspaceId) -> Self {
        Self::Workspace(id)
    }
}

impl From<BranchId> for TargetId {
    fn from(id: BranchId) -> Self {
        Self::Branch(id)
    }
}

impl std::fmt::Display for TargetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Workspace(id) => write!(f, "workspace:{id}"),
            Self::Branch(id) => write!(f, "branch:{id}"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Payloads
// ─────────────────────────────────────────────────────────────────────────────

/// Synthetic state sent first to every new subscriber.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum Snapshot {
    /// Workspace with branch summaries.
    Workspace(WorkspaceSnapshot),
    /// Single branch.
    Branch(BranchSnapshot),
}

impl Snapshot {
    /// Whether the snapshotted target has nothing left to emit.
    ///
    /// A completed workspace still emits while a restarted branch runs.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Workspace(ws) => {
                ws.stage.is_terminal() && ws.branches.iter().all(|b| b.state.is_terminal())
            }
            Self::Branch(br) => br.state.is_terminal(),
        }
    }
}

/// State change of a workspace or branch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum StatusUpdate {
    /// Workspace stage change.
    Workspace {
        /// New stage.
        stage: WorkspaceStage,
        /// Progress line.
        progress: String,
        /// Title, once known.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
    },
    /// Branch state change not covered by `branch_started`/`done`/`error`.
    Branch {
        /// Branch.
        branch_id: BranchId,
        /// Content kind.
        kind: BranchKind,
        /// New state.
        state: BranchState,
    },
}

/// Kind-specific event body.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    /// Current state; always the first event on a fresh subscription.
    Snapshot {
        /// The state.
        snapshot: Snapshot,
    },
    /// Stage/state change.
    Status(StatusUpdate),
    /// A branch entered `streaming` (first start or restart).
    BranchStarted {
        /// Branch.
        branch_id: BranchId,
        /// Content kind.
        kind: BranchKind,
        /// Attempt counter after the start.
        attempt: u32,
    },
    /// Generated text delta. Never the accumulated buffer.
    Chunk {
        /// Branch.
        branch_id: BranchId,
        /// New text.
        delta: String,
    },
    /// Branch completed.
    Done {
        /// Branch.
        branch_id: BranchId,
        /// Whether an audio artifact is attached.
        has_audio: bool,
        /// Audio handle.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        audio: Option<MediaHandle>,
        /// Non-fatal synthesis failure.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        audio_error: Option<String>,
    },
    /// Terminal failure of a workspace (no `branch_id`) or a branch.
    Error {
        /// Failing branch; `None` for a workspace stage failure.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        branch_id: Option<BranchId>,
        /// Classification.
        category: ErrorCategory,
        /// Human-readable reason.
        reason: String,
    },
}

impl EventPayload {
    /// Wire name of the event type.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Snapshot { .. } => "snapshot",
            Self::Status(_) => "status",
            Self::BranchStarted { .. } => "branch_started",
            Self::Chunk { .. } => "chunk",
            Self::Done { .. } => "done",
            Self::Error { .. } => "error",
        }
    }

    /// Branch this payload concerns, if any.
    #[must_use]
    pub fn branch_id(&self) -> Option<&BranchId> {
        match self {
            Self::BranchStarted { branch_id, .. }
            | Self::Chunk { branch_id, .. }
            | Self::Done { branch_id, .. }
            | Self::Status(StatusUpdate::Branch { branch_id, .. }) => Some(branch_id),
            Self::Error { branch_id, .. } => branch_id.as_ref(),
            Self::Snapshot { snapshot } => match snapshot {
                Snapshot::Branch(br) => Some(&br.branch_id),
                Snapshot::Workspace(_) => None,
            },
            Self::Status(StatusUpdate::Workspace { .. }) => None,
        }
    }

    /// Whether this is the last event the given topic will carry until it
    /// is reopened.
    ///
    /// A branch topic ends at that branch's `done` or `error`. A workspace
    /// topic ends at `status(completed)` or at a workspace-level `error`
    /// (which follows `status(failed)`).
    #[must_use]
    pub fn closes(&self, target: &TargetId) -> bool {
        match target {
            TargetId::Branch(id) => match self {
                Self::Done { branch_id, .. } => branch_id == id,
                Self::Error {
                    branch_id: Some(branch_id),
                    ..
                } => branch_id == id,
                _ => false,
            },
            TargetId::Workspace(_) => matches!(
                self,
                Self::Status(StatusUpdate::Workspace {
                    stage: WorkspaceStage::Completed,
                    ..
                }) | Self::Error {
                    branch_id: None,
                    ..
                }
            ),
        }
    }

    /// Whether this event reopens a closed topic.
    ///
    /// `branch_started` reopens both the branch topic and the workspace
    /// topic it is mirrored on.
    #[must_use]
    pub fn reopens(&self, target: &TargetId) -> bool {
        match (self, target) {
            (Self::BranchStarted { branch_id, .. }, TargetId::Branch(id)) => branch_id == id,
            (Self::BranchStarted { .. }, TargetId::Workspace(_)) => true,
            _ => false,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Envelope
// ─────────────────────────────────────────────────────────────────────────────

/// Event envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Topic.
    pub target: TargetId,
    /// Per-target sequence number. For a snapshot this is the sequence of
    /// the last event the snapshot already reflects.
    pub seq: u64,
    /// Publish time.
    pub timestamp: DateTime<Utc>,
    /// Body.
    #[serde(flatten)]
    pub payload: EventPayload,
}

/// Rejected event at the serialization boundary.
#[derive(Debug, Error)]
pub enum WireError {
    /// Not valid JSON for the envelope or an unknown `type`.
    #[error("malformed event: {0}")]
    Malformed(#[from] serde_json::Error),

    /// A branch-scoped payload addressed to a different branch's topic.
    #[error("event for branch {payload} addressed to {target}")]
    MisaddressedBranch {
        /// Branch named in the payload.
        payload: BranchId,
        /// Topic the envelope names.
        target: TargetId,
    },
}

impl Event {
    /// Build an envelope stamped now.
    pub fn new(target: TargetId, seq: u64, payload: EventPayload) -> Self {
        Self {
            target,
            seq,
            timestamp: Utc::now(),
            payload,
        }
    }

    /// Whether this event ends its topic.
    #[must_use]
    pub fn is_closing(&self) -> bool {
        self.payload.closes(&self.target)
    }

    fn validate(&self) -> Result<(), WireError> {
        if let (TargetId::Branch(target), Some(branch)) = (&self.target, self.payload.branch_id())
        {
            if target != branch {
                return Err(WireError::MisaddressedBranch {
                    payload: branch.clone(),
                    target: self.target.clone(),
                });
            }
        }
        Ok(())
    }

    /// Encode for the wire.
    pub fn to_json(&self) -> Result<String, WireError> {
        self.validate()?;
        Ok(serde_json::to_string(self)?)
    }

    /// Decode and validate an event received from the wire.
    pub fn from_json(raw: &str) -> Result<Self, WireError> {
        let event: Self = serde_json::from_str(raw)?;
        event.validate()?;
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn br() -> BranchId {
        BranchId::from("br_1")
    }

    fn done() -> EventPayload {
        EventPayload::Done {
            branch_id: br(),
            has_audio: false,
            audio: None,
            audio_error: None,
        }
    }

    #[test]
    fn chunk_wire_shape() {
        let ev = Event::new(
            TargetId::Branch(br()),
            3,
            EventPayload::Chunk {
                branch_id: br(),
                delta: "Outline\n".into(),
            },
        );
        let v: serde_json::Value = serde_json::from_str(&ev.to_json().unwrap()).unwrap();
        assert_eq!(v["type"], "chunk");
        assert_eq!(v["delta"], "Outline\n");
        assert_eq!(v["seq"], 3);
        assert_eq!(v["target"], json!({"kind": "branch", "id": "br_1"}));
    }

    #[test]
    fn status_wire_shape() {
        let payload = EventPayload::Status(StatusUpdate::Workspace {
            stage: WorkspaceStage::Transcribing,
            progress: "transcribing audio".into(),
            title: None,
        });
        let v = serde_json::to_value(&payload).unwrap();
        assert_eq!(
            v,
            json!({
                "type": "status",
                "scope": "workspace",
                "stage": "transcribing",
                "progress": "transcribing audio"
            })
        );
    }

    #[test]
    fn decode_round_trips_error_event() {
        let raw = r#"{"target":{"kind":"workspace","id":"ws_1"},"seq":5,
            "timestamp":"2024-01-01T00:00:00Z","type":"error",
            "category":"adapter","reason":"download failed: 404"}"#;
        let ev = Event::from_json(raw).unwrap();
        assert_matches!(
            ev.payload,
            EventPayload::Error { branch_id: None, category: ErrorCategory::Adapter, .. }
        );
        assert!(ev.is_closing());
    }

    #[test]
    fn decode_rejects_unknown_type() {
        let raw = r#"{"target":{"kind":"workspace","id":"ws_1"},"seq":1,
            "timestamp":"2024-01-01T00:00:00Z","type":"progress"}"#;
        assert_matches!(Event::from_json(raw), Err(WireError::Malformed(_)));
    }

    #[test]
    fn decode_rejects_misaddressed_branch_payload() {
        let raw = r#"{"target":{"kind":"branch","id":"br_other"},"seq":1,
            "timestamp":"2024-01-01T00:00:00Z","type":"chunk",
            "branch_id":"br_1","delta":"x"}"#;
        assert_matches!(
            Event::from_json(raw),
            Err(WireError::MisaddressedBranch { .. })
        );
    }

    #[test]
    fn branch_topic_closes_on_own_terminal_events_only() {
        let own = TargetId::Branch(br());
        let other = TargetId::Branch(BranchId::from("br_2"));
        assert!(done().closes(&own));
        assert!(!done().closes(&other));
        let chunk = EventPayload::Chunk {
            branch_id: br(),
            delta: "x".into(),
        };
        assert!(!chunk.closes(&own));
    }

    #[test]
    fn workspace_topic_closing_rules() {
        let ws = TargetId::Workspace(WorkspaceId::from("ws_1"));
        let failed_status = EventPayload::Status(StatusUpdate::Workspace {
            stage: WorkspaceStage::Failed,
            progress: "boom".into(),
            title: None,
        });
        let completed_status = EventPayload::Status(StatusUpdate::Workspace {
            stage: WorkspaceStage::Completed,
            progress: "completed".into(),
            title: None,
        });
        let ws_error = EventPayload::Error {
            branch_id: None,
            category: ErrorCategory::Adapter,
            reason: "boom".into(),
        };
        let branch_error = EventPayload::Error {
            branch_id: Some(br()),
            category: ErrorCategory::Adapter,
            reason: "boom".into(),
        };
        assert!(!failed_status.closes(&ws));
        assert!(completed_status.closes(&ws));
        assert!(ws_error.closes(&ws));
        assert!(!branch_error.closes(&ws));
        assert!(!done().closes(&ws));
    }

    #[test]
    fn branch_started_reopens_branch_and_workspace_topics() {
        let started = EventPayload::BranchStarted {
            branch_id: br(),
            kind: BranchKind::Outline,
            attempt: 2,
        };
        assert!(started.reopens(&TargetId::Branch(br())));
        assert!(!started.reopens(&TargetId::Branch(BranchId::from("br_other"))));
        assert!(started.reopens(&TargetId::Workspace(WorkspaceId::from("ws_1"))));
        assert!(!done().reopens(&TargetId::Workspace(WorkspaceId::from("ws_1"))));
        assert_eq!(started.type_name(), "branch_started");
    }

    #[test]
    fn completed_workspace_with_running_branch_is_not_terminal() {
        use crate::branch::{Branch, PromptParams};
        use crate::workspace::Workspace;

        let mut ws = Workspace::new("http://x/video");
        ws.advance(WorkspaceStage::Downloading).unwrap();
        ws.advance(WorkspaceStage::Transcribing).unwrap();
        ws.set_transcript("hello world").unwrap();
        ws.advance(WorkspaceStage::Ready).unwrap();
        ws.advance(WorkspaceStage::Completed).unwrap();
        assert!(Snapshot::Workspace(ws.snapshot(Vec::new())).is_terminal());

        let mut branch = Branch::new(ws.id.clone(), BranchKind::Outline, PromptParams::default());
        branch.begin(None).unwrap();
        assert!(!Snapshot::Workspace(ws.snapshot(vec![branch.snapshot()])).is_terminal());
        branch.complete().unwrap();
        assert!(Snapshot::Workspace(ws.snapshot(vec![branch.snapshot()])).is_terminal());
    }
}
