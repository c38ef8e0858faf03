//! Contracts for the external collaborators.
//!
//! Media download, speech-to-text, content generation and speech synthesis
//! are injected behind these traits. Implementations must be `Send + Sync`;
//! the engine shares one instance of each across all workspaces and branches.
//! Returning from a call early (for example when its future is dropped on
//! cancellation) must not leave the adapter in a state that breaks later
//! calls.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use tokio_util::sync::CancellationToken;
use v2t_core::{BranchKind, MediaHandle, MediaHandles, PromptParams};

use crate::errors::{AdapterError, AdapterStage};

/// Boxed stream of generated text chunks returned by [`Generator::generate`].
///
/// Finite and not restartable: a retry invokes the generator from scratch.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<String, AdapterError>> + Send>>;

/// Result of a successful download.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DownloadOutput {
    /// Title reported by the source.
    pub title: String,
    /// Downloaded media.
    pub media: MediaHandles,
    /// Media duration, when the source reports one.
    pub duration_secs: Option<u64>,
}

/// Resolves a source reference and downloads its media.
#[async_trait]
pub trait Downloader: Send + Sync {
    /// Download the media behind `source`.
    async fn download(&self, source: &str) -> Result<DownloadOutput, AdapterError>;
}

/// Speech-to-text.
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe the audio track. An empty result is treated as a failure.
    async fn transcribe(&self, audio: &MediaHandle) -> Result<String, AdapterError>;
}

/// Content generation.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Start generating `kind` from the transcript.
    ///
    /// Errors returned here fail the branch before any chunk is produced;
    /// errors yielded by the stream fail it mid-flight.
    async fn generate(
        &self,
        kind: &BranchKind,
        transcript: &str,
        params: &PromptParams,
    ) -> Result<ChunkStream, AdapterError>;
}

/// Text-to-speech for audio branch kinds.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Synthesize the complete script.
    async fn synthesize(&self, script: &str) -> Result<MediaHandle, AdapterError>;
}

/// The full set of collaborators an engine runs against.
#[derive(Clone)]
pub struct Adapters {
    /// Stage 1.
    pub downloader: Arc<dyn Downloader>,
    /// Stage 2.
    pub transcriber: Arc<dyn Transcriber>,
    /// Branch content.
    pub generator: Arc<dyn Generator>,
    /// Branch audio.
    pub synthesizer: Arc<dyn Synthesizer>,
}

impl std::fmt::Debug for Adapters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Adapters").finish_non_exhaustive()
    }
}

/// Await an adapter call under a time budget and a cancellation token.
///
/// Cancellation wins over a result that becomes ready at the same time.
pub(crate) async fn call_with_budget<T>(
    stage: AdapterStage,
    budget: Duration,
    cancel: &CancellationToken,
    call: impl Future<Output = Result<T, AdapterError>>,
) -> Result<T, AdapterError> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(AdapterError::Cancelled { stage }),
        res = tokio::time::timeout(budget, call) => {
            res.unwrap_or(Err(AdapterError::Timeout { stage, elapsed: budget }))
        }
    }
}
