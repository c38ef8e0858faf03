//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase")]` for the JSON file
//! format. Each type implements [`Default`] with production values, and
//! `#[serde(default)]` lets a file carry only the fields it overrides.

mod runtime;

pub use runtime::*;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
///
/// ```json
/// {
///   "pipeline": { "maxMediaDurationSecs": 3600 },
///   "branches": { "autoStart": ["outline", "article"] }
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct V2tSettings {
    /// Acquisition pipeline (download + transcribe).
    pub pipeline: PipelineSettings,
    /// Generation branches.
    pub branches: BranchSettings,
    /// Event channel.
    pub channel: ChannelSettings,
    /// Resource store retention.
    pub store: StoreSettings,
    /// Logging configuration.
    pub logging: LoggingSettings,
}

impl V2tSettings {
    /// Reject values the runtime cannot operate with.
    pub fn validate(&self) -> Result<()> {
        if self.channel.subscriber_buffer == 0 {
            return Err(SettingsError::InvalidValue(
                "channel.subscriberBuffer must be greater than 0".into(),
            ));
        }
        if self.pipeline.max_media_duration_secs == 0 {
            return Err(SettingsError::InvalidValue(
                "pipeline.maxMediaDurationSecs must be greater than 0".into(),
            ));
        }
        if self.branches.chunk_idle_timeout_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "branches.chunkIdleTimeoutMs must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

/// Logging configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Minimum level (`trace`..`error`) or a full `EnvFilter` directive.
    pub level: String,
    /// Emit one JSON object per line instead of the compact format.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
