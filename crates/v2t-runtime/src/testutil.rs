//! Scripted adapters and helpers for tests.
//!
//! Built for this crate's own tests and, behind the `test-util` feature,
//! for integration tests and downstream crates that embed the engine.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use v2t_core::{
    BranchKind, Event, EventPayload, MediaHandle, MediaHandles, PromptParams, Snapshot,
    StatusUpdate, WorkspaceId, WorkspaceSnapshot, WorkspaceStage,
};

use crate::adapters::{
    Adapters, ChunkStream, DownloadOutput, Downloader, Generator, Synthesizer, Transcriber,
};
use crate::engine::Engine;
use crate::errors::{AdapterError, AdapterStage, EngineError};

/// How a fake adapter call behaves.
#[derive(Clone, Debug)]
enum Behavior<T> {
    Succeed(T),
    Fail(String),
    Hang,
}

impl<T: Clone> Behavior<T> {
    async fn run(&self, stage: AdapterStage) -> Result<T, AdapterError> {
        match self {
            Self::Succeed(v) => Ok(v.clone()),
            Self::Fail(msg) => Err(AdapterError::failed(stage, msg.clone())),
            Self::Hang => std::future::pending().await,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Download / transcribe / synthesize
// ─────────────────────────────────────────────────────────────────────────────

/// Fake [`Downloader`].
#[derive(Clone, Debug)]
pub struct FakeDownloader(Behavior<DownloadOutput>);

impl FakeDownloader {
    /// Succeed with `title` and no reported duration.
    pub fn ok(title: &str) -> Self {
        Self(Behavior::Succeed(DownloadOutput {
            title: title.to_string(),
            media: MediaHandles {
                video: MediaHandle::new(format!("video://{title}")),
                audio: MediaHandle::new(format!("audio://{title}")),
            },
            duration_secs: None,
        }))
    }

    /// Succeed with `title` and a reported duration.
    pub fn with_duration(title: &str, secs: u64) -> Self {
        let mut this = Self::ok(title);
        if let Behavior::Succeed(out) = &mut this.0 {
            out.duration_secs = Some(secs);
        }
        this
    }

    /// Fail with `message`.
    pub fn failing(message: &str) -> Self {
        Self(Behavior::Fail(message.to_string()))
    }

    /// Never return.
    pub fn hanging() -> Self {
        Self(Behavior::Hang)
    }
}

#[async_trait]
impl Downloader for FakeDownloader {
    async fn download(&self, _source: &str) -> Result<DownloadOutput, AdapterError> {
        self.0.run(AdapterStage::Download).await
    }
}

/// Fake [`Transcriber`].
#[derive(Clone, Debug)]
pub struct FakeTranscriber(Behavior<String>);

impl FakeTranscriber {
    /// Return `text`.
    pub fn ok(text: &str) -> Self {
        Self(Behavior::Succeed(text.to_string()))
    }

    /// Fail with `message`.
    pub fn failing(message: &str) -> Self {
        Self(Behavior::Fail(message.to_string()))
    }

    /// Never return.
    pub fn hanging() -> Self {
        Self(Behavior::Hang)
    }
}

#[async_trait]
impl Transcriber for FakeTranscriber {
    async fn transcribe(&self, _audio: &MediaHandle) -> Result<String, AdapterError> {
        self.0.run(AdapterStage::Transcribe).await
    }
}

/// Fake [`Synthesizer`] that records the scripts it receives.
#[derive(Debug)]
pub struct FakeSynthesizer {
    behavior: Behavior<MediaHandle>,
    scripts: Mutex<Vec<String>>,
}

impl FakeSynthesizer {
    /// Return `handle`.
    pub fn ok(handle: &str) -> Self {
        Self {
            behavior: Behavior::Succeed(MediaHandle::new(handle)),
            scripts: Mutex::new(Vec::new()),
        }
    }

    /// Fail with `message`.
    pub fn failing(message: &str) -> Self {
        Self {
            behavior: Behavior::Fail(message.to_string()),
            scripts: Mutex::new(Vec::new()),
        }
    }

    /// Never return.
    pub fn hanging() -> Self {
        Self {
            behavior: Behavior::Hang,
            scripts: Mutex::new(Vec::new()),
        }
    }

    /// Scripts passed to `synthesize`, in call order.
    pub fn scripts(&self) -> Vec<String> {
        self.scripts.lock().clone()
    }
}

#[async_trait]
impl Synthesizer for FakeSynthesizer {
    async fn synthesize(&self, script: &str) -> Result<MediaHandle, AdapterError> {
        self.scripts.lock().push(script.to_string());
        self.behavior.run(AdapterStage::Synthesize).await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Generation
// ─────────────────────────────────────────────────────────────────────────────

/// One step of a scripted generation.
#[derive(Clone, Debug)]
pub enum Step {
    /// Yield a chunk.
    Chunk(String),
    /// Yield an error and end the stream.
    Fail(String),
    /// Stop producing without ending the stream.
    Stall,
}

/// Shorthand for a script of plain chunks.
pub fn chunks(parts: &[&str]) -> Vec<Step> {
    parts.iter().map(|p| Step::Chunk((*p).to_string())).collect()
}

/// [`Generator`] driven by per-kind scripts.
///
/// Each `generate` call for a kind consumes the next queued script. A
/// script is either fixed up front ([`script`](Self::script)) or fed live
/// through a sender ([`feed`](Self::feed)); a fed stream ends when its
/// sender is dropped.
#[derive(Debug, Default)]
pub struct ScriptedGenerator {
    queued: Mutex<HashMap<BranchKind, VecDeque<mpsc::UnboundedReceiver<Step>>>>,
    calls: Mutex<Vec<(BranchKind, String, PromptParams)>>,
}

impl ScriptedGenerator {
    /// Empty generator; every call fails until a script is queued.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a fixed script for the next `kind` call.
    pub fn script(&self, kind: BranchKind, steps: Vec<Step>) -> &Self {
        let tx = self.feed(kind);
        for step in steps {
            let _ = tx.send(step);
        }
        self
    }

    /// Queue a live script for the next `kind` call.
    pub fn feed(&self, kind: BranchKind) -> mpsc::UnboundedSender<Step> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.queued.lock().entry(kind).or_default().push_back(rx);
        tx
    }

    /// Calls received so far: kind, transcript and prompt parameters.
    pub fn calls(&self) -> Vec<(BranchKind, String, PromptParams)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn generate(
        &self,
        kind: &BranchKind,
        transcript: &str,
        params: &PromptParams,
    ) -> Result<ChunkStream, AdapterError> {
        self.calls
            .lock()
            .push((kind.clone(), transcript.to_string(), params.clone()));
        let mut rx = self
            .queued
            .lock()
            .get_mut(kind)
            .and_then(VecDeque::pop_front)
            .ok_or_else(|| {
                AdapterError::failed(AdapterStage::Generate, format!("no script for {kind}"))
            })?;
        let stream = async_stream::stream! {
            while let Some(step) = rx.recv().await {
                match step {
                    Step::Chunk(text) => yield Ok(text),
                    Step::Fail(message) => {
                        yield Err(AdapterError::failed(AdapterStage::Generate, message));
                        return;
                    }
                    Step::Stall => std::future::pending::<()>().await,
                }
            }
        };
        Ok(Box::pin(stream))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Bundles and helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Adapters for the happy path: download succeeds with title "video",
/// transcription yields "hello world", synthesis returns `audio://podcast`.
pub fn adapters(generator: Arc<ScriptedGenerator>) -> Adapters {
    Adapters {
        downloader: Arc::new(FakeDownloader::ok("video")),
        transcriber: Arc::new(FakeTranscriber::ok("hello world")),
        generator,
        synthesizer: Arc::new(FakeSynthesizer::ok("audio://podcast")),
    }
}

/// Stage carried by a workspace `snapshot` or `status` event.
pub fn stage_of(event: &Event) -> Option<WorkspaceStage> {
    match &event.payload {
        EventPayload::Status(StatusUpdate::Workspace { stage, .. }) => Some(*stage),
        EventPayload::Snapshot {
            snapshot: Snapshot::Workspace(ws),
        } => Some(ws.stage),
        _ => None,
    }
}

/// Chunk deltas in `events`, in order.
pub fn deltas(events: &[Event]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match &e.payload {
            EventPayload::Chunk { delta, .. } => Some(delta.clone()),
            _ => None,
        })
        .collect()
}

/// Wait until the workspace reaches `stage` (or any terminal stage) and
/// return its snapshot.
pub async fn wait_for_stage(
    engine: &Engine,
    id: &WorkspaceId,
    stage: WorkspaceStage,
) -> Result<WorkspaceSnapshot, EngineError> {
    let mut sub = engine.subscribe_workspace(id)?;
    while let Some(event) = sub.recv().await {
        if let Some(seen) = stage_of(&event) {
            if seen == stage || seen.is_terminal() {
                break;
            }
        }
    }
    engine.get(id)
}
