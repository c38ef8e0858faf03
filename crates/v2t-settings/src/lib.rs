//! # v2t-settings
//!
//! Configuration with layered sources.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`V2tSettings::default()`]
//! 2. **Settings file**: `~/.config/v2t/settings.json`, or the path in
//!    `V2T_SETTINGS_PATH` (deep-merged over defaults)
//! 3. **Environment variables**: `V2T_*` overrides (highest priority)
//!
//! There is no global instance. Load once at startup and hand the value to
//! the engine.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, apply_overrides, deep_merge, load_settings, load_settings_from_path,
    settings_path,
};
pub use types::*;
