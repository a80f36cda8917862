//! # chorus-settings
//!
//! Layered configuration for the Chorus client runtime.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`ChorusSettings::default()`]
//! 2. **User file**: `~/.chorus/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `CHORUS_*` overrides (highest priority)
//!
//! Settings are passed by value; there is no global instance.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, apply_overrides_from, deep_merge, load_settings, load_settings_from_path,
    settings_path,
};
pub use types::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_are_valid() {
        let settings = ChorusSettings::default();
        assert_eq!(settings.connection.url, "ws://localhost:3001/ws");
        assert_eq!(settings.connection.connect_timeout_ms, 10_000);
        assert_eq!(settings.connection.reconnect.max_attempts, 5);
        assert!(settings.audio.voice_enabled);
        assert!(settings.audio.autoplay);
        assert!(settings.audio.auto_advance);
        assert!((settings.audio.volume - 1.0).abs() < f64::EPSILON);
        assert_eq!(settings.logging.level, "warn");
    }

    #[test]
    fn deep_merge_re_exported() {
        let merged = deep_merge(serde_json::json!({"x": 1}), serde_json::json!({"y": 2}));
        assert_eq!(merged["x"], 1);
        assert_eq!(merged["y"], 2);
    }
}
