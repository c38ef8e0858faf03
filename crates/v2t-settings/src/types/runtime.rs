//! Pipeline, branch, channel and store settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use v2t_core::BranchKind;

/// Acquisition pipeline settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineSettings {
    /// Longest media accepted; longer media fails the download stage.
    pub max_media_duration_secs: u64,
    /// Upper bound on the download adapter call.
    pub download_timeout_ms: u64,
    /// Upper bound on the transcribe adapter call.
    pub transcribe_timeout_ms: u64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_media_duration_secs: 7200,
            download_timeout_ms: 1_800_000,
            transcribe_timeout_ms: 1_800_000,
        }
    }
}

impl PipelineSettings {
    /// Download timeout as a [`Duration`].
    pub fn download_timeout(&self) -> Duration {
        Duration::from_millis(self.download_timeout_ms)
    }

    /// Transcribe timeout as a [`Duration`].
    pub fn transcribe_timeout(&self) -> Duration {
        Duration::from_millis(self.transcribe_timeout_ms)
    }
}

/// Generation branch settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BranchSettings {
    /// Kinds started automatically when a workspace becomes ready.
    pub auto_start: Vec<BranchKind>,
    /// Longest gap allowed between two generator chunks.
    pub chunk_idle_timeout_ms: u64,
    /// Upper bound on the synthesis adapter call.
    pub synthesize_timeout_ms: u64,
}

impl Default for BranchSettings {
    fn default() -> Self {
        Self {
            auto_start: Vec::new(),
            chunk_idle_timeout_ms: 120_000,
            synthesize_timeout_ms: 600_000,
        }
    }
}

impl BranchSettings {
    /// Chunk idle timeout as a [`Duration`].
    pub fn chunk_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.chunk_idle_timeout_ms)
    }

    /// Synthesis timeout as a [`Duration`].
    pub fn synthesize_timeout(&self) -> Duration {
        Duration::from_millis(self.synthesize_timeout_ms)
    }
}

/// Event channel settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChannelSettings {
    /// Events buffered per subscriber before it is considered slow and dropped.
    pub subscriber_buffer: usize,
    /// Most recent events kept per target for resume-by-sequence.
    pub backlog: usize,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            subscriber_buffer: 256,
            backlog: 512,
        }
    }
}

/// Resource store retention.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreSettings {
    /// Idle time after which a settled workspace is evicted.
    pub workspace_ttl_secs: u64,
    /// Interval of the background eviction sweep.
    pub sweep_interval_secs: u64,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            workspace_ttl_secs: 86_400,
            sweep_interval_secs: 600,
        }
    }
}

impl StoreSettings {
    /// Workspace TTL as a [`Duration`].
    pub fn workspace_ttl(&self) -> Duration {
        Duration::from_secs(self.workspace_ttl_secs)
    }

    /// Sweep interval as a [`Duration`].
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}
