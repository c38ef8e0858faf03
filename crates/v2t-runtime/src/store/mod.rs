//! Resource store for workspace and branch records.
//!
//! The store is the source of truth for snapshots. Writers never hold a
//! record across an await: every mutation is a closure applied under the
//! store's lock, so a reader always sees a whole record.

mod memory;

pub use memory::MemoryStore;

use chrono::{DateTime, Utc};
use v2t_core::{Branch, BranchId, ModelError, Workspace, WorkspaceId};

use crate::errors::EngineError;

/// Mutation applied to a stored workspace.
pub type WorkspaceUpdate<'a> = &'a mut dyn FnMut(&mut Workspace) -> Result<(), ModelError>;

/// Mutation applied to a stored branch.
pub type BranchUpdate<'a> = &'a mut dyn FnMut(&mut Branch) -> Result<(), ModelError>;

/// Storage for workspace and branch records.
pub trait ResourceStore: Send + Sync {
    /// Insert a new workspace.
    fn insert_workspace(&self, workspace: Workspace);

    /// Clone of a workspace record.
    fn workspace(&self, id: &WorkspaceId) -> Option<Workspace>;

    /// Apply `update` to a workspace and return the updated record. A
    /// rejected update leaves the record unchanged.
    fn update_workspace(
        &self,
        id: &WorkspaceId,
        update: WorkspaceUpdate<'_>,
    ) -> Result<Workspace, EngineError>;

    /// Insert a new branch under its workspace.
    fn insert_branch(&self, branch: Branch) -> Result<(), EngineError>;

    /// Clone of a branch record.
    fn branch(&self, id: &BranchId) -> Option<Branch>;

    /// Apply `update` to a branch and return the updated record.
    fn update_branch(&self, id: &BranchId, update: BranchUpdate<'_>) -> Result<Branch, EngineError>;

    /// Append a generated chunk to a streaming branch in place.
    fn append_content(&self, id: &BranchId, delta: &str) -> Result<(), EngineError>;

    /// Branches of a workspace in creation order.
    fn branches_of(&self, workspace_id: &WorkspaceId) -> Vec<Branch>;

    /// Remove a workspace and its branches. Returns the removed branch IDs.
    fn remove_workspace(&self, id: &WorkspaceId) -> Vec<BranchId>;

    /// Settled workspaces (no stage or branch in flight) last accessed
    /// before `cutoff`.
    fn expired(&self, cutoff: DateTime<Utc>) -> Vec<WorkspaceId>;

    /// Remove every workspace [`expired`](Self::expired) would return, in
    /// one step. Returns each removed workspace with its branch IDs.
    fn remove_expired(&self, cutoff: DateTime<Utc>) -> Vec<(WorkspaceId, Vec<BranchId>)>;
}
