//! Branch controller.
//!
//! Starts, streams, restarts and cancels generation branches. Each running
//! branch is one spawned task that owns its branch record's state: the task
//! alone appends chunks and records the terminal outcome, so branches of
//! different kinds never share a writer and one failing cannot touch
//! another.
//!
//! Every branch event goes to both the branch's own topic and its
//! workspace's topic.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use metrics::gauge;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use v2t_core::{
    Branch, BranchId, BranchKind, EventPayload, MediaHandle, PromptParams, StatusUpdate,
    WorkspaceId,
};

use crate::adapters::call_with_budget;
use crate::channel::Outbox;
use crate::context::Context;
use crate::errors::{AdapterError, AdapterStage, EngineError};
use crate::lifecycle::LifecycleEngine;

/// Tracks a running branch task.
struct ActiveBranch {
    attempt: u32,
    cancel: CancellationToken,
}

/// Everything a branch task needs, captured at start time.
struct Run {
    workspace_id: WorkspaceId,
    branch_id: BranchId,
    kind: BranchKind,
    attempt: u32,
    transcript: String,
    params: PromptParams,
}

impl Run {
    /// Stage `payload` on the branch topic and the workspace topic.
    fn push(&self, outbox: &mut Outbox, payload: EventPayload) {
        outbox.push(self.branch_id.clone(), payload.clone());
        outbox.push(self.workspace_id.clone(), payload);
    }
}

/// Starts and supervises generation branches.
pub struct BranchController {
    ctx: Arc<Context>,
    lifecycle: Arc<LifecycleEngine>,
    /// Running branch tasks keyed by branch ID.
    active: Mutex<HashMap<BranchId, ActiveBranch>>,
}

impl BranchController {
    pub(crate) fn new(ctx: Arc<Context>, lifecycle: Arc<LifecycleEngine>) -> Self {
        Self {
            ctx,
            lifecycle,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Start (or restart) the branch of `kind` on a ready workspace.
    ///
    /// A workspace holds at most one branch per kind. If that branch is
    /// terminal it is restarted in place, keeping its ID; `params` replaces
    /// its prompt parameters when given. If it is still running the call
    /// fails with [`EngineError::Conflict`].
    #[instrument(skip(self, params))]
    pub fn start_branch(
        self: &Arc<Self>,
        workspace_id: &WorkspaceId,
        kind: BranchKind,
        params: Option<PromptParams>,
    ) -> Result<BranchId, EngineError> {
        let store = &self.ctx.store;
        let cancel = self.ctx.shutdown.child_token();

        let run = self.ctx.hub.commit(|outbox| -> Result<Run, EngineError> {
            let workspace = store
                .workspace(workspace_id)
                .ok_or_else(|| EngineError::NotFound(format!("workspace {workspace_id}")))?;
            let transcript = match workspace.transcript() {
                Some(text) if workspace.stage().accepts_branches() => text.to_owned(),
                _ => {
                    return Err(EngineError::InvalidState(format!(
                        "workspace {workspace_id} is {}; branches start once it is ready",
                        workspace.stage()
                    )));
                }
            };
            self.lifecycle.touch(workspace_id)?;

            let existing = store
                .branches_of(workspace_id)
                .into_iter()
                .find(|b| b.kind == kind);
            let branch = match existing {
                Some(b) if !b.state().is_terminal() => {
                    return Err(EngineError::Conflict {
                        workspace_id: workspace_id.clone(),
                        kind,
                    });
                }
                Some(b) => store.update_branch(&b.id, &mut |b| b.begin(params.clone()))?,
                None => {
                    let mut b = Branch::new(
                        workspace_id.clone(),
                        kind.clone(),
                        params.clone().unwrap_or_default(),
                    );
                    b.begin(None)?;
                    store.insert_branch(b.clone())?;
                    b
                }
            };

            let run = Run {
                workspace_id: workspace_id.clone(),
                branch_id: branch.id.clone(),
                kind: branch.kind.clone(),
                attempt: branch.attempt,
                transcript,
                params: branch.params.clone(),
            };
            run.push(
                outbox,
                EventPayload::BranchStarted {
                    branch_id: run.branch_id.clone(),
                    kind: run.kind.clone(),
                    attempt: run.attempt,
                },
            );
            let mut active = self.active.lock();
            let _ = active.insert(
                run.branch_id.clone(),
                ActiveBranch {
                    attempt: run.attempt,
                    cancel: cancel.clone(),
                },
            );
            #[allow(clippy::cast_precision_loss)]
            gauge!("v2t_branches_active").set(active.len() as f64);
            Ok(run)
        })?;

        info!(branch_id = %run.branch_id, attempt = run.attempt, "branch started");
        let branch_id = run.branch_id.clone();
        let this = Arc::clone(self);
        let _ = self.ctx.tasks.spawn(async move { this.run(run, cancel).await });
        Ok(branch_id)
    }

    async fn run(self: Arc<Self>, run: Run, cancel: CancellationToken) {
        let outcome = match self.stream_content(&run, &cancel).await {
            Ok(script) if run.kind.produces_audio() => {
                self.synthesize(&run, &script, &cancel).await
            }
            Ok(_) => self.finish(&run, None),
            Err(err) => Err(err),
        };
        if let Err(err) = outcome {
            self.fail(&run, &err);
        }
        self.release(&run);
        let _ = self.lifecycle.settle(&run.workspace_id);
    }

    /// Pull chunks until the generator is exhausted, appending each one.
    /// Returns the full script.
    async fn stream_content(
        &self,
        run: &Run,
        cancel: &CancellationToken,
    ) -> Result<String, EngineError> {
        let idle = self.ctx.settings.branches.chunk_idle_timeout();
        let generator = &self.ctx.adapters.generator;
        let mut chunks = call_with_budget(
            AdapterStage::Generate,
            idle,
            cancel,
            generator.generate(&run.kind, &run.transcript, &run.params),
        )
        .await?;

        let mut script = String::new();
        while let Some(delta) = call_with_budget(AdapterStage::Generate, idle, cancel, async {
            chunks.next().await.transpose()
        })
        .await?
        {
            if delta.is_empty() {
                continue;
            }
            self.append(run, &delta)?;
            script.push_str(&delta);
        }
        debug!(branch_id = %run.branch_id, bytes = script.len(), "generation finished");
        Ok(script)
    }

    fn append(&self, run: &Run, delta: &str) -> Result<(), EngineError> {
        self.ctx.hub.commit(|outbox| -> Result<(), EngineError> {
            self.ctx.store.append_content(&run.branch_id, delta)?;
            run.push(
                outbox,
                EventPayload::Chunk {
                    branch_id: run.branch_id.clone(),
                    delta: delta.to_owned(),
                },
            );
            Ok(())
        })
    }

    /// Audio kinds: hand the finished script to the synthesizer. A synthesis
    /// failure still completes the branch, with `audio_error` set;
    /// cancellation fails it.
    async fn synthesize(
        &self,
        run: &Run,
        script: &str,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        self.ctx.hub.commit(|outbox| -> Result<(), EngineError> {
            let branch = self
                .ctx
                .store
                .update_branch(&run.branch_id, &mut |b| b.begin_synthesis())?;
            run.push(
                outbox,
                EventPayload::Status(StatusUpdate::Branch {
                    branch_id: run.branch_id.clone(),
                    kind: run.kind.clone(),
                    state: branch.state(),
                }),
            );
            Ok(())
        })?;

        let audio = match call_with_budget(
            AdapterStage::Synthesize,
            self.ctx.settings.branches.synthesize_timeout(),
            cancel,
            self.ctx.adapters.synthesizer.synthesize(script),
        )
        .await
        {
            Ok(handle) => Ok(handle),
            Err(err @ AdapterError::Cancelled { .. }) => return Err(err.into()),
            Err(err) => {
                warn!(
                    branch_id = %run.branch_id,
                    error = %err,
                    "synthesis failed, completing without audio"
                );
                Err(err.to_string())
            }
        };
        self.finish(run, Some(audio))
    }

    /// Record completion and publish `done`.
    fn finish(
        &self,
        run: &Run,
        audio: Option<Result<MediaHandle, String>>,
    ) -> Result<(), EngineError> {
        let mut audio = audio;
        self.ctx.hub.commit(|outbox| -> Result<(), EngineError> {
            let branch = self
                .ctx
                .store
                .update_branch(&run.branch_id, &mut |b| match audio.take() {
                    Some(outcome) => b.complete_with_audio(outcome),
                    None => b.complete(),
                })?;
            run.push(
                outbox,
                EventPayload::Done {
                    branch_id: run.branch_id.clone(),
                    has_audio: branch.audio.is_some(),
                    audio: branch.audio.clone(),
                    audio_error: branch.audio_error.clone(),
                },
            );
            Ok(())
        })?;
        info!(branch_id = %run.branch_id, kind = %run.kind, "branch completed");
        Ok(())
    }

    fn fail(&self, run: &Run, err: &EngineError) {
        let reason = err.to_string();
        let category = err.category();
        let recorded = self.ctx.hub.commit(|outbox| -> Result<(), EngineError> {
            let _ = self
                .ctx
                .store
                .update_branch(&run.branch_id, &mut |b| b.fail(reason.clone()))?;
            run.push(
                outbox,
                EventPayload::Error {
                    branch_id: Some(run.branch_id.clone()),
                    category,
                    reason: reason.clone(),
                },
            );
            Ok(())
        });
        match recorded {
            Ok(()) => warn!(
                branch_id = %run.branch_id,
                kind = %run.kind,
                %category,
                reason = %reason,
                "branch failed"
            ),
            Err(e) => warn!(
                branch_id = %run.branch_id,
                error = %e,
                reason = %reason,
                "could not record branch failure"
            ),
        }
    }

    fn release(&self, run: &Run) {
        let mut active = self.active.lock();
        if active
            .get(&run.branch_id)
            .is_some_and(|a| a.attempt == run.attempt)
        {
            let _ = active.remove(&run.branch_id);
        }
        #[allow(clippy::cast_precision_loss)]
        gauge!("v2t_branches_active").set(active.len() as f64);
    }

    /// Abort a running branch. The branch task records the `failed` state
    /// and publishes the `error` event.
    #[instrument(skip(self))]
    pub fn cancel_branch(&self, branch_id: &BranchId) -> Result<(), EngineError> {
        let branch = self
            .ctx
            .store
            .branch(branch_id)
            .ok_or_else(|| EngineError::NotFound(format!("branch {branch_id}")))?;
        let _ = self.lifecycle.touch(&branch.workspace_id);
        if branch.state().is_terminal() {
            return Err(EngineError::InvalidState(format!(
                "branch {branch_id} is {} and cannot be cancelled",
                branch.state()
            )));
        }
        if let Some(active) = self.active.lock().get(branch_id) {
            warn!(branch_id = %branch_id, "branch cancel requested");
            active.cancel.cancel();
        }
        Ok(())
    }

    /// Number of running branch tasks.
    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }
}
