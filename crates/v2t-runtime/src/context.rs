//! State shared by the lifecycle engine, the branch controller and the
//! engine facade.

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::info;
use v2t_core::{
    Branch, BranchId, BranchSnapshot, EventPayload, StatusUpdate, TargetId, Workspace,
    WorkspaceId, WorkspaceSnapshot,
};
use v2t_settings::V2tSettings;

use crate::adapters::Adapters;
use crate::channel::EventHub;
use crate::store::ResourceStore;

pub(crate) struct Context {
    pub(crate) store: Arc<dyn ResourceStore>,
    pub(crate) hub: EventHub,
    pub(crate) adapters: Adapters,
    pub(crate) settings: V2tSettings,
    /// Parent of every stage and branch token.
    pub(crate) shutdown: CancellationToken,
    /// Every spawned pipeline, branch and sweeper task.
    pub(crate) tasks: TaskTracker,
}

impl Context {
    pub(crate) fn new(
        settings: V2tSettings,
        adapters: Adapters,
        store: Arc<dyn ResourceStore>,
    ) -> Self {
        Self {
            store,
            hub: EventHub::new(&settings.channel),
            adapters,
            settings,
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    pub(crate) fn workspace_snapshot(&self, id: &WorkspaceId) -> Option<WorkspaceSnapshot> {
        let workspace = self.store.workspace(id)?;
        let branches = self
            .store
            .branches_of(id)
            .iter()
            .map(Branch::snapshot)
            .collect();
        Some(workspace.snapshot(branches))
    }

    pub(crate) fn branch_snapshot(&self, id: &BranchId) -> Option<BranchSnapshot> {
        self.store.branch(id).map(|b| b.snapshot())
    }

    /// Remove settled workspaces idle for longer than the configured TTL,
    /// along with their branches and channel topics.
    pub(crate) fn evict_expired(&self) -> usize {
        let ttl = self.settings.store.workspace_ttl();
        let Ok(ttl) = chrono::Duration::from_std(ttl) else {
            return 0;
        };
        let cutoff = Utc::now() - ttl;
        let mut evicted = Vec::new();
        // Selection and removal share the channel lock, so a branch cannot
        // start on a workspace between the two.
        self.hub.remove_with(|| {
            let mut targets = Vec::new();
            for (id, branches) in self.store.remove_expired(cutoff) {
                targets.extend(branches.into_iter().map(TargetId::Branch));
                targets.push(TargetId::Workspace(id.clone()));
                evicted.push(id);
            }
            targets
        });
        for id in &evicted {
            info!(workspace_id = %id, "evicted idle workspace");
        }
        evicted.len()
    }
}

/// Workspace `status` payload reflecting the record's current fields.
pub(crate) fn workspace_status(workspace: &Workspace) -> EventPayload {
    EventPayload::Status(StatusUpdate::Workspace {
        stage: workspace.stage(),
        progress: workspace.progress.clone(),
        title: workspace.title.clone(),
    })
}
