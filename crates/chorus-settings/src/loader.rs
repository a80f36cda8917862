//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`ChorusSettings::default()`]
//! 2. If `~/.chorus/settings.json` exists, deep-merge user values over defaults
//! 3. Apply `CHORUS_*` environment overrides (highest priority)
//! 4. Validate the result
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::{ChorusSettings, MAX_SPEED, MAX_VOLUME, MIN_SPEED, MIN_VOLUME};

/// Resolve the path to the settings file (`~/.chorus/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".chorus").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<ChorusSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON or out-of-range values in the
/// file are errors.
pub fn load_settings_from_path(path: &Path) -> Result<ChorusSettings> {
    let defaults = serde_json::to_value(ChorusSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: ChorusSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
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

/// Apply `CHORUS_*` environment variable overrides.
///
/// Values that fail to parse or fall outside their range are logged at
/// `warn` and ignored.
pub fn apply_env_overrides(settings: &mut ChorusSettings) {
    apply_overrides_from(settings, |name| std::env::var(name).ok());
}

/// Same as [`apply_env_overrides`] but reads variables through `lookup`.
pub fn apply_overrides_from(
    settings: &mut ChorusSettings,
    lookup: impl Fn(&str) -> Option<String>,
) {
    let env = EnvReader { lookup };

    // ── Connection ──────────────────────────────────────────────────
    if let Some(v) = env.string("CHORUS_URL") {
        settings.connection.url = v;
    }
    if let Some(v) = env.u64("CHORUS_CONNECT_TIMEOUT_MS", 100, 300_000) {
        settings.connection.connect_timeout_ms = v;
    }
    if let Some(v) = env.u64("CHORUS_RECONNECT_BASE_MS", 1, 600_000) {
        settings.connection.reconnect.base_delay_ms = v;
    }
    if let Some(v) = env.u64("CHORUS_RECONNECT_MAX_MS", 1, 3_600_000) {
        settings.connection.reconnect.max_delay_ms = v;
    }
    if let Some(v) = env.u32("CHORUS_RECONNECT_ATTEMPTS", 0, 100) {
        settings.connection.reconnect.max_attempts = v;
    }

    // ── Audio ───────────────────────────────────────────────────────
    if let Some(v) = env.bool("CHORUS_VOICE_ENABLED") {
        settings.audio.voice_enabled = v;
    }
    if let Some(v) = env.bool("CHORUS_AUTOPLAY") {
        settings.audio.autoplay = v;
    }
    if let Some(v) = env.bool("CHORUS_AUTO_ADVANCE") {
        settings.audio.auto_advance = v;
    }
    if let Some(v) = env.f64("CHORUS_VOLUME", MIN_VOLUME, MAX_VOLUME) {
        settings.audio.volume = v;
    }
    if let Some(v) = env.f64("CHORUS_SPEED", MIN_SPEED, MAX_SPEED) {
        settings.audio.speed = v;
    }
    if let Some(v) = env.string("CHORUS_AUDIO_BASE_URL") {
        settings.audio.base_url = Some(v);
    }
    if let Some(v) = env.u64("CHORUS_AUDIO_MAX_BYTES", 1024, 1_073_741_824) {
        settings.audio.max_resource_bytes = v;
    }
    if let Some(v) = env.u64("CHORUS_AUDIO_TIMEOUT_MS", 100, 600_000) {
        settings.audio.resolve_timeout_ms = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = env.string("CHORUS_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.bool("CHORUS_LOG_JSON") {
        settings.logging.json = v;
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

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

/// Parse a string as a `u32` within an inclusive range.
pub fn parse_u32_range(val: &str, min: u32, max: u32) -> Option<u32> {
    let n: u32 = val.parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

/// Parse a string as a `u64` within an inclusive range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

/// Parse a string as a finite `f64` within an inclusive range.
pub fn parse_f64_range(val: &str, min: f64, max: f64) -> Option<f64> {
    let n: f64 = val.parse().ok()?;
    (n.is_finite() && (min..=max).contains(&n)).then_some(n)
}

// ── Env var readers ─────────────────────────────────────────────────────────

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn parsed<T>(&self, name: &str, kind: &str, parse: impl FnOnce(&str) -> Option<T>) -> Option<T> {
        let val = (self.lookup)(name)?;
        let result = parse(&val);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, kind, "invalid env var, ignoring");
        }
        result
    }

    fn bool(&self, name: &str) -> Option<bool> {
        self.parsed(name, "bool", parse_bool)
    }

    fn u32(&self, name: &str, min: u32, max: u32) -> Option<u32> {
        self.parsed(name, "u32", |v| parse_u32_range(v, min, max))
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        self.parsed(name, "u64", |v| parse_u64_range(v, min, max))
    }

    fn f64(&self, name: &str, min: f64, max: f64) -> Option<f64> {
        self.parsed(name, "f64", |v| parse_f64_range(v, min, max))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
