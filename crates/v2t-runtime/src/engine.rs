//! Engine facade.
//!
//! [`Engine`] wires the store, the event channel, the lifecycle engine and
//! the branch controller together and is the surface consumers call.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};
use v2t_core::{
    BranchId, BranchKind, BranchSnapshot, PromptParams, Snapshot, TargetId, WorkspaceId,
    WorkspaceSnapshot,
};
use v2t_settings::V2tSettings;

use crate::adapters::Adapters;
use crate::branches::BranchController;
use crate::channel::{EventHub, Subscription};
use crate::context::Context;
use crate::errors::EngineError;
use crate::lifecycle::{LifecycleEngine, ReadyHook};
use crate::store::{MemoryStore, ResourceStore};

/// How long [`Engine::shutdown`] waits for cancelled tasks to record their
/// outcome.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// The orchestration core.
pub struct Engine {
    ctx: Arc<Context>,
    lifecycle: Arc<LifecycleEngine>,
    branches: Arc<BranchController>,
}

impl Engine {
    /// Create an engine backed by an in-memory store.
    pub fn new(settings: V2tSettings, adapters: Adapters) -> Self {
        Self::with_store(settings, adapters, Arc::new(MemoryStore::new()))
    }

    /// Create an engine over a caller-provided store.
    pub fn with_store(
        settings: V2tSettings,
        adapters: Adapters,
        store: Arc<dyn ResourceStore>,
    ) -> Self {
        let ctx = Arc::new(Context::new(settings, adapters, store));
        let lifecycle = Arc::new(LifecycleEngine::new(Arc::clone(&ctx)));
        let branches = Arc::new(BranchController::new(
            Arc::clone(&ctx),
            Arc::clone(&lifecycle),
        ));
        Self {
            ctx,
            lifecycle,
            branches,
        }
    }

    /// Active settings.
    pub fn settings(&self) -> &V2tSettings {
        &self.ctx.settings
    }

    /// The event channel.
    pub fn hub(&self) -> &EventHub {
        &self.ctx.hub
    }

    /// Submit a source. Returns as soon as the workspace exists; download
    /// and transcription run in the background. Kinds listed in
    /// `branches.autoStart` start automatically once the workspace is ready.
    pub fn submit(&self, source: &str) -> Result<WorkspaceId, EngineError> {
        let auto_start = self.ctx.settings.branches.auto_start.clone();
        let hook: Option<ReadyHook> = if auto_start.is_empty() {
            None
        } else {
            let branches = Arc::clone(&self.branches);
            let hook: ReadyHook = Box::new(move |workspace_id| {
                for kind in auto_start {
                    if let Err(e) = branches.start_branch(&workspace_id, kind.clone(), None) {
                        warn!(workspace_id = %workspace_id, %kind, error = %e, "auto-start failed");
                    }
                }
            });
            Some(hook)
        };
        self.lifecycle.submit(source, hook)
    }

    /// Current workspace state with branch summaries.
    pub fn get(&self, id: &WorkspaceId) -> Result<WorkspaceSnapshot, EngineError> {
        self.lifecycle.touch(id)?;
        self.ctx
            .hub
            .commit(|_| self.ctx.workspace_snapshot(id))
            .ok_or_else(|| EngineError::NotFound(format!("workspace {id}")))
    }

    /// Current state of one branch.
    pub fn get_branch(&self, id: &BranchId) -> Result<BranchSnapshot, EngineError> {
        let snapshot = self
            .ctx
            .branch_snapshot(id)
            .ok_or_else(|| EngineError::NotFound(format!("branch {id}")))?;
        let _ = self.lifecycle.touch(&snapshot.workspace_id);
        Ok(snapshot)
    }

    /// Subscribe to a workspace: a snapshot, then stage changes and every
    /// branch's events, closing once the workspace has settled at
    /// `completed` or `failed` with no branch running.
    #[instrument(skip(self))]
    pub fn subscribe_workspace(&self, id: &WorkspaceId) -> Result<Subscription, EngineError> {
        self.lifecycle.touch(id)?;
        let ctx = &self.ctx;
        ctx.hub
            .subscribe(id.clone(), || {
                ctx.workspace_snapshot(id).map(Snapshot::Workspace)
            })
            .ok_or_else(|| EngineError::NotFound(format!("workspace {id}")))
    }

    /// Subscribe to one branch: a snapshot, then its events, closing at
    /// `done` or `error`.
    #[instrument(skip(self))]
    pub fn subscribe_branch(&self, id: &BranchId) -> Result<Subscription, EngineError> {
        let ctx = &self.ctx;
        let subscription = ctx
            .hub
            .subscribe(id.clone(), || ctx.branch_snapshot(id).map(Snapshot::Branch))
            .ok_or_else(|| EngineError::NotFound(format!("branch {id}")))?;
        if let Some(branch) = ctx.store.branch(id) {
            let _ = self.lifecycle.touch(&branch.workspace_id);
        }
        Ok(subscription)
    }

    /// Reconnect after the event with sequence `after_seq`. Replays missed
    /// events when the channel still has them, otherwise starts over with a
    /// snapshot.
    #[instrument(skip(self))]
    pub fn resume(&self, target: &TargetId, after_seq: u64) -> Result<Subscription, EngineError> {
        let ctx = &self.ctx;
        let snapshot = || match target {
            TargetId::Workspace(id) => ctx.workspace_snapshot(id).map(Snapshot::Workspace),
            TargetId::Branch(id) => ctx.branch_snapshot(id).map(Snapshot::Branch),
        };
        ctx.hub
            .resume(target.clone(), after_seq, snapshot)
            .ok_or_else(|| EngineError::NotFound(target.to_string()))
    }

    /// Start or restart the branch of `kind`. See
    /// [`BranchController::start_branch`].
    pub fn start_branch(
        &self,
        workspace_id: &WorkspaceId,
        kind: BranchKind,
        params: Option<PromptParams>,
    ) -> Result<BranchId, EngineError> {
        self.branches.start_branch(workspace_id, kind, params)
    }

    /// Cancel a running branch. Siblings and the workspace are unaffected.
    pub fn cancel_branch(&self, id: &BranchId) -> Result<(), EngineError> {
        self.branches.cancel_branch(id)
    }

    /// Cancel a workspace whose download or transcription is in flight.
    pub fn cancel_workspace(&self, id: &WorkspaceId) -> Result<(), EngineError> {
        self.lifecycle.cancel(id)
    }

    /// Evict settled workspaces idle past `store.workspaceTtlSecs`. Returns
    /// the number evicted.
    pub fn evict_expired(&self) -> usize {
        self.ctx.evict_expired()
    }

    /// Run [`evict_expired`](Self::evict_expired) every
    /// `store.sweepIntervalSecs` until shutdown.
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let ctx = Arc::clone(&self.ctx);
        self.ctx.tasks.spawn(async move {
            let period = ctx.settings.store.sweep_interval().max(Duration::from_secs(1));
            let mut ticker = tokio::time::interval(period);
            // First tick completes immediately.
            let _ = ticker.tick().await;
            loop {
                tokio::select! {
                    () = ctx.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = ctx.evict_expired();
                        if evicted > 0 {
                            info!(evicted, "idle workspaces swept");
                        }
                    }
                }
            }
        })
    }

    /// Cancel every in-flight stage and branch, wait briefly for them to
    /// record their outcome, then close all subscriptions.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        info!("engine shutdown initiated");
        self.ctx.shutdown.cancel();
        let _ = self.ctx.tasks.close();
        if tokio::time::timeout(SHUTDOWN_GRACE, self.ctx.tasks.wait())
            .await
            .is_err()
        {
            warn!(
                tasks = self.ctx.tasks.len(),
                workspaces = self.lifecycle.in_flight_count(),
                branches = self.branches.active_count(),
                "shutdown grace period elapsed with tasks still running"
            );
        }
        self.ctx.hub.close_all();
        info!("engine shutdown complete");
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("hub", &self.ctx.hub)
            .finish_non_exhaustive()
    }
}
