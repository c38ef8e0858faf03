//! Workspace lifecycle engine.
//!
//! Drives a workspace through download and transcription, one spawned task
//! per workspace. The engine is the only writer of [`Workspace::stage`]:
//! every stage change is applied inside [`EventHub::commit`] together with
//! the `status` event announcing it.
//!
//! [`EventHub::commit`]: crate::channel::EventHub::commit

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use metrics::counter;
use parking_lot::Mutex;
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use v2t_core::{EventPayload, ModelError, Workspace, WorkspaceId, WorkspaceStage};

use crate::adapters::call_with_budget;
use crate::context::{Context, workspace_status};
use crate::errors::{AdapterError, AdapterStage, EngineError};

/// Callback run once a workspace reaches `ready`.
pub type ReadyHook = Box<dyn FnOnce(WorkspaceId) + Send>;

static URL_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https?://[^\s<>]+").expect("URL pattern is valid"));

/// Pull the source URL out of a submission.
///
/// Submissions are often share text ("watch this https://... !"), so the
/// first `http(s)` URL anywhere in the input is taken, minus trailing
/// punctuation.
pub fn extract_source(input: &str) -> Result<String, EngineError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(EngineError::Validation("source is empty".into()));
    }
    URL_PATTERN
        .find(input)
        .map(|m| {
            m.as_str()
                .trim_end_matches(['.', ',', ';', ':', '!', '?', ')', ']', '"', '\''])
                .to_string()
        })
        .ok_or_else(|| EngineError::Validation("source does not contain an http(s) URL".into()))
}

/// Drives the download and transcribe stages.
pub struct LifecycleEngine {
    ctx: Arc<Context>,
    /// Cancellation tokens of workspaces whose pipeline is still running.
    in_flight: Mutex<HashMap<WorkspaceId, CancellationToken>>,
}

impl LifecycleEngine {
    pub(crate) fn new(ctx: Arc<Context>) -> Self {
        Self {
            ctx,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Accept a source and schedule its pipeline. Returns without waiting
    /// for any stage; `on_ready` runs on the pipeline task after `ready`.
    #[instrument(skip(self, on_ready))]
    pub fn submit(
        self: &Arc<Self>,
        source: &str,
        on_ready: Option<ReadyHook>,
    ) -> Result<WorkspaceId, EngineError> {
        let source = extract_source(source)?;
        let workspace = Workspace::new(source);
        let id = workspace.id.clone();
        let cancel = self.ctx.shutdown.child_token();
        let _ = self.in_flight.lock().insert(id.clone(), cancel.clone());

        self.ctx.hub.commit(|outbox| {
            outbox.push(id.clone(), workspace_status(&workspace));
            self.ctx.store.insert_workspace(workspace);
        });
        counter!("v2t_workspaces_submitted_total").increment(1);
        info!(workspace_id = %id, "workspace submitted");

        let this = Arc::clone(self);
        let task_id = id.clone();
        let _ = self
            .ctx
            .tasks
            .spawn(async move { this.drive(task_id, cancel, on_ready).await });
        Ok(id)
    }

    async fn drive(
        self: Arc<Self>,
        id: WorkspaceId,
        cancel: CancellationToken,
        on_ready: Option<ReadyHook>,
    ) {
        let outcome = self.acquire(&id, &cancel).await;
        if let Err(err) = &outcome {
            self.fail(&id, err);
        }
        // Removed only once the outcome is recorded.
        let _ = self.in_flight.lock().remove(&id);
        if outcome.is_ok() {
            info!(workspace_id = %id, "workspace ready");
            if let Some(hook) = on_ready {
                hook(id.clone());
            }
            // Completes at once unless the hook started branches.
            let _ = self.settle_with(&id, false);
        }
    }

    async fn acquire(
        &self,
        id: &WorkspaceId,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let pipeline = &self.ctx.settings.pipeline;
        let adapters = &self.ctx.adapters;

        // ── Stage 1: download ──────────────────────────────────────────
        let workspace = self.transition(
            id,
            Some(WorkspaceStage::Downloading),
            "downloading media",
            |_| Ok(()),
        )?;
        let output = call_with_budget(
            AdapterStage::Download,
            pipeline.download_timeout(),
            cancel,
            adapters.downloader.download(&workspace.source),
        )
        .await?;
        if let Some(duration) = output.duration_secs {
            if duration > pipeline.max_media_duration_secs {
                return Err(AdapterError::failed(
                    AdapterStage::Download,
                    format!(
                        "media is {duration}s long, limit is {}s",
                        pipeline.max_media_duration_secs
                    ),
                )
                .into());
            }
        }
        debug!(workspace_id = %id, title = %output.title, "download finished");
        let audio = output.media.audio.clone();
        let progress = format!("downloaded: {}", output.title);
        let _ = self.transition(id, None, &progress, move |ws| {
            ws.title = Some(output.title);
            ws.media = Some(output.media);
            ws.duration_secs = output.duration_secs;
            Ok(())
        })?;

        // ── Stage 2: transcribe ────────────────────────────────────────
        let _ = self.transition(
            id,
            Some(WorkspaceStage::Transcribing),
            "transcribing audio",
            |_| Ok(()),
        )?;
        let transcript = call_with_budget(
            AdapterStage::Transcribe,
            pipeline.transcribe_timeout(),
            cancel,
            adapters.transcriber.transcribe(&audio),
        )
        .await?;
        if transcript.trim().is_empty() {
            return Err(
                AdapterError::failed(AdapterStage::Transcribe, "transcript is empty").into(),
            );
        }
        let _ = self.transition(id, Some(WorkspaceStage::Ready), "transcript ready", move |ws| {
            ws.set_transcript(transcript)
        })?;
        Ok(())
    }

    /// Apply `prepare`, optionally advance the stage, set the progress line
    /// and publish `status`, all in one commit.
    fn transition(
        &self,
        id: &WorkspaceId,
        next: Option<WorkspaceStage>,
        progress: &str,
        prepare: impl FnOnce(&mut Workspace) -> Result<(), ModelError>,
    ) -> Result<Workspace, EngineError> {
        let mut prepare = Some(prepare);
        self.ctx.hub.commit(|outbox| -> Result<Workspace, EngineError> {
            let workspace = self.ctx.store.update_workspace(id, &mut |ws| {
                if let Some(prepare) = prepare.take() {
                    prepare(ws)?;
                }
                if let Some(next) = next {
                    ws.advance(next)?;
                }
                ws.progress = progress.to_string();
                Ok(())
            })?;
            outbox.push(id.clone(), workspace_status(&workspace));
            Ok(workspace)
        })
    }

    fn fail(&self, id: &WorkspaceId, err: &EngineError) {
        let reason = err.to_string();
        let category = err.category();
        let recorded = self.ctx.hub.commit(|outbox| -> Result<(), EngineError> {
            let workspace = self
                .ctx
                .store
                .update_workspace(id, &mut |ws| ws.fail(reason.clone()))?;
            outbox.push(id.clone(), workspace_status(&workspace));
            outbox.push(
                id.clone(),
                EventPayload::Error {
                    branch_id: None,
                    category,
                    reason: reason.clone(),
                },
            );
            Ok(())
        });
        counter!("v2t_workspaces_failed_total", "category" => category.as_str()).increment(1);
        match recorded {
            Ok(()) => warn!(workspace_id = %id, %category, reason = %reason, "workspace failed"),
            Err(e) => warn!(
                workspace_id = %id,
                error = %e,
                reason = %reason,
                "could not record workspace failure"
            ),
        }
    }

    /// Abort a workspace whose pipeline is still running.
    #[instrument(skip(self))]
    pub fn cancel(&self, id: &WorkspaceId) -> Result<(), EngineError> {
        let workspace = self
            .ctx
            .store
            .workspace(id)
            .ok_or_else(|| EngineError::NotFound(format!("workspace {id}")))?;
        if !workspace.stage().is_in_flight() {
            return Err(EngineError::InvalidState(format!(
                "workspace {id} is {} and cannot be cancelled",
                workspace.stage()
            )));
        }
        if let Some(token) = self.in_flight.lock().get(id) {
            warn!(workspace_id = %id, "workspace cancel requested");
            token.cancel();
        }
        Ok(())
    }

    /// Settle a workspace once no branch is running.
    ///
    /// A `ready` workspace moves to `completed`; it need not have any
    /// branches. A `completed` workspace whose restarted branches have all
    /// finished announces `completed` again, closing the workspace topic
    /// that `branch_started` reopened. Returns whether a `status` was
    /// published.
    pub fn settle(&self, id: &WorkspaceId) -> bool {
        self.settle_with(id, true)
    }

    /// `reannounce` is false for the check right after `ready`, which must
    /// not repeat a `completed` that a fast branch already published.
    fn settle_with(&self, id: &WorkspaceId, reannounce: bool) -> bool {
        let store = &self.ctx.store;
        let settled = self.ctx.hub.commit(|outbox| -> Result<bool, EngineError> {
            let Some(workspace) = store.workspace(id) else {
                return Ok(false);
            };
            if !workspace.stage().accepts_branches()
                || !store.branches_of(id).iter().all(|b| b.state().is_terminal())
            {
                return Ok(false);
            }
            let workspace = if workspace.stage() == WorkspaceStage::Ready {
                store.update_workspace(id, &mut |ws| {
                    ws.advance(WorkspaceStage::Completed)?;
                    ws.progress = "completed".to_string();
                    Ok(())
                })?
            } else if reannounce {
                workspace
            } else {
                return Ok(false);
            };
            outbox.push(id.clone(), workspace_status(&workspace));
            Ok(true)
        });
        match settled {
            Ok(true) => {
                info!(workspace_id = %id, "workspace completed");
                true
            }
            Ok(false) => false,
            Err(e) => {
                warn!(workspace_id = %id, error = %e, "could not settle workspace");
                false
            }
        }
    }

    /// Refresh a workspace's idle-expiry clock.
    pub fn touch(&self, id: &WorkspaceId) -> Result<(), EngineError> {
        let _ = self.ctx.store.update_workspace(id, &mut |ws| {
            ws.touch();
            Ok(())
        })?;
        Ok(())
    }

    /// Number of workspaces whose pipeline is running.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }
}
