//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`V2tSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over defaults
//! 3. Apply `V2T_*` environment overrides (highest priority)
//! 4. Validate
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};
use v2t_core::BranchKind;

use crate::errors::Result;
use crate::types::V2tSettings;

/// Env var naming an explicit settings file.
pub const SETTINGS_PATH_ENV: &str = "V2T_SETTINGS_PATH";

/// Resolve the settings file path: `$V2T_SETTINGS_PATH`, else
/// `~/.config/v2t/settings.json`.
pub fn settings_path() -> PathBuf {
    if let Some(explicit) = std::env::var_os(SETTINGS_PATH_ENV).filter(|v| !v.is_empty()) {
        return PathBuf::from(explicit);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home)
        .join(".config")
        .join("v2t")
        .join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<V2tSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<V2tSettings> {
    load_with(path, |key| std::env::var(key).ok())
}

fn load_with(path: &Path, env: impl Fn(&str) -> Option<String>) -> Result<V2tSettings> {
    let defaults = serde_json::to_value(V2tSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: V2tSettings = serde_json::from_value(merged)?;
    apply_overrides(&mut settings, env);
    settings.validate()?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply process environment overrides to loaded settings.
pub fn apply_env_overrides(settings: &mut V2tSettings) {
    apply_overrides(settings, |key| std::env::var(key).ok());
}

/// Apply overrides read through `env`. Invalid values are ignored with a
/// warning and leave the file/default value in place.
pub fn apply_overrides(settings: &mut V2tSettings, env: impl Fn(&str) -> Option<String>) {
    let read = |key: &str| env(key).filter(|v| !v.is_empty());

    if let Some(v) = read("V2T_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read("V2T_LOG_JSON") {
        match parse_bool(&v) {
            Some(b) => settings.logging.json = b,
            None => warn!(key = "V2T_LOG_JSON", value = %v, "invalid boolean env var, ignoring"),
        }
    }
    if let Some(v) = read("V2T_MAX_MEDIA_DURATION") {
        match parse_u64_range(&v, 1, 86_400) {
            Some(n) => settings.pipeline.max_media_duration_secs = n,
            None => warn!(key = "V2T_MAX_MEDIA_DURATION", value = %v, "invalid u64 env var, ignoring"),
        }
    }
    if let Some(v) = read("V2T_WORKSPACE_TTL_SECS") {
        match parse_u64_range(&v, 60, 31_536_000) {
            Some(n) => settings.store.workspace_ttl_secs = n,
            None => warn!(key = "V2T_WORKSPACE_TTL_SECS", value = %v, "invalid u64 env var, ignoring"),
        }
    }
    if let Some(v) = read("V2T_SUBSCRIBER_BUFFER") {
        match parse_usize_range(&v, 1, 65_536) {
            Some(n) => settings.channel.subscriber_buffer = n,
            None => warn!(key = "V2T_SUBSCRIBER_BUFFER", value = %v, "invalid usize env var, ignoring"),
        }
    }
    if let Some(v) = env("V2T_AUTO_BRANCHES") {
        settings.branches.auto_start = parse_kind_list(&v);
    }
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.trim().parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

/// Parse a comma-separated list of branch kinds. Blank entries are skipped
/// and duplicates keep their first position; an empty string disables
/// automatic fan-out.
pub fn parse_kind_list(val: &str) -> Vec<BranchKind> {
    let mut kinds = Vec::new();
    for kind in val
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(BranchKind::from)
    {
        if !kinds.contains(&kind) {
            kinds.push(kind);
        }
    }
    kinds
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SettingsError;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn no_env(_: &str) -> Option<String> {
        None
    }

    // ── deep_merge ──────────────────────────────────────────────────

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({"pipeline": {"a": 1, "b": 2}});
        let source = serde_json::json!({"pipeline": {"a": 10}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["pipeline"]["a"], 10);
        assert_eq!(merged["pipeline"]["b"], 2);
    }

    #[test]
    fn merge_array_replaces() {
        let target = serde_json::json!({"items": [1, 2, 3]});
        let source = serde_json::json!({"items": [4]});
        assert_eq!(deep_merge(target, source)["items"], serde_json::json!([4]));
    }

    #[test]
    fn merge_null_preserves_target() {
        let target = serde_json::json!({"a": 1});
        let source = serde_json::json!({"a": null});
        assert_eq!(deep_merge(target, source)["a"], 1);
    }

    // ── load ────────────────────────────────────────────────────────

    #[test]
    fn missing_file_returns_defaults() {
        let s = load_with(Path::new("/nonexistent/settings.json"), no_env).unwrap();
        assert_eq!(s.pipeline.max_media_duration_secs, 7200);
        assert!(s.branches.auto_start.is_empty());
    }

    #[test]
    fn partial_file_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"pipeline": {"maxMediaDurationSecs": 600}, "branches": {"autoStart": ["outline"]}}"#,
        )
        .unwrap();

        let s = load_with(&path, no_env).unwrap();
        assert_eq!(s.pipeline.max_media_duration_secs, 600);
        assert_eq!(s.pipeline.download_timeout_ms, 1_800_000);
        assert_eq!(s.branches.auto_start, vec![BranchKind::Outline]);
    }

    #[test]
    fn invalid_json_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(load_with(&path, no_env), Err(SettingsError::Json(_))));
    }

    #[test]
    fn invalid_value_in_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"channel": {"subscriberBuffer": 0}}"#).unwrap();
        assert!(matches!(
            load_with(&path, no_env),
            Err(SettingsError::InvalidValue(_))
        ));
    }

    #[test]
    fn env_beats_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"logging": {"level": "debug"}}"#).unwrap();

        let env = env_of(&[("V2T_LOG_LEVEL", "trace"), ("V2T_LOG_JSON", "yes")]);
        let s = load_with(&path, env).unwrap();
        assert_eq!(s.logging.level, "trace");
        assert!(s.logging.json);
    }

    // ── overrides ───────────────────────────────────────────────────

    #[test]
    fn invalid_env_values_are_ignored() {
        let mut s = V2tSettings::default();
        apply_overrides(
            &mut s,
            env_of(&[
                ("V2T_LOG_JSON", "maybe"),
                ("V2T_MAX_MEDIA_DURATION", "abc"),
                ("V2T_SUBSCRIBER_BUFFER", "0"),
            ]),
        );
        assert!(!s.logging.json);
        assert_eq!(s.pipeline.max_media_duration_secs, 7200);
        assert_eq!(s.channel.subscriber_buffer, 256);
    }

    #[test]
    fn numeric_env_overrides() {
        let mut s = V2tSettings::default();
        apply_overrides(
            &mut s,
            env_of(&[
                ("V2T_MAX_MEDIA_DURATION", "3600"),
                ("V2T_WORKSPACE_TTL_SECS", "7200"),
                ("V2T_SUBSCRIBER_BUFFER", "32"),
            ]),
        );
        assert_eq!(s.pipeline.max_media_duration_secs, 3600);
        assert_eq!(s.store.workspace_ttl_secs, 7200);
        assert_eq!(s.channel.subscriber_buffer, 32);
    }

    #[test]
    fn auto_branches_env() {
        let mut s = V2tSettings::default();
        apply_overrides(&mut s, env_of(&[("V2T_AUTO_BRANCHES", "outline, podcast,,outline")]));
        assert_eq!(
            s.branches.auto_start,
            vec![BranchKind::Outline, BranchKind::Podcast]
        );

        // Present but empty disables fan-out configured in the file.
        apply_overrides(&mut s, env_of(&[("V2T_AUTO_BRANCHES", "")]));
        assert!(s.branches.auto_start.is_empty());
    }

    // ── parsers ─────────────────────────────────────────────────────

    #[test]
    fn parse_bool_variants() {
        for val in ["true", "1", "yes", "ON"] {
            assert_eq!(parse_bool(val), Some(true), "failed for {val}");
        }
        for val in ["false", "0", "no", "Off"] {
            assert_eq!(parse_bool(val), Some(false), "failed for {val}");
        }
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn parse_ranges() {
        assert_eq!(parse_u64_range("30", 1, 60), Some(30));
        assert_eq!(parse_u64_range("0", 1, 60), None);
        assert_eq!(parse_u64_range("61", 1, 60), None);
        assert_eq!(parse_usize_range(" 8 ", 1, 16), Some(8));
        assert_eq!(parse_usize_range("x", 1, 16), None);
    }

    #[test]
    fn settings_path_default_location() {
        if std::env::var_os(SETTINGS_PATH_ENV).is_none() {
            assert!(settings_path().ends_with(".config/v2t/settings.json"));
        }
    }
}
