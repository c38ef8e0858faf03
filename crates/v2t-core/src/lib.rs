//! # v2t-core
//!
//! Shared vocabulary for the v2t orchestration core:
//!
//! - **Branded IDs**: [`WorkspaceId`], [`BranchId`]
//! - **Workspace**: record plus the acquisition-stage state machine
//! - **Branch**: record plus the generation state machine, open [`BranchKind`]
//! - **Events**: [`Event`] envelope and the [`EventPayload`] tagged union
//! - **Errors**: [`ModelError`] for illegal mutations, [`ErrorCategory`] for the wire
//! - **Logging**: [`logging::init_subscriber`]

#![deny(unsafe_code)]

pub mod branch;
pub mod errors;
pub mod events;
pub mod ids;
pub mod logging;
pub mod workspace;

pub use branch::{Branch, BranchKind, BranchSnapshot, BranchState, PromptParams};
pub use errors::{ErrorCategory, ModelError};
pub use events::{Event, EventPayload, Snapshot, StatusUpdate, TargetId, WireError};
pub use ids::{BranchId, WorkspaceId};
pub use workspace::{MediaHandle, MediaHandles, Workspace, WorkspaceSnapshot, WorkspaceStage};
