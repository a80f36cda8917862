//! Voice mode and playback settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Lowest accepted volume.
pub const MIN_VOLUME: f64 = 0.0;
/// Highest accepted volume.
pub const MAX_VOLUME: f64 = 1.0;
/// Slowest accepted playback speed.
pub const MIN_SPEED: f64 = 0.5;
/// Fastest accepted playback speed.
pub const MAX_SPEED: f64 = 2.0;

/// Audio behavior for a session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AudioSettings {
    /// Persona text waits for the persona's audio.
    pub voice_enabled: bool,
    /// Start playback as soon as an item is queued.
    pub autoplay: bool,
    /// Output volume, 0.0 to 1.0.
    pub volume: f64,
    /// Playback rate, 0.5 to 2.0.
    pub speed: f64,
    /// Play the next queued item after one finishes.
    pub auto_advance: bool,
    /// Base URL for relative audio references.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Largest audio resource accepted, in bytes.
    pub max_resource_bytes: u64,
    /// Time allowed to fetch one resource, in milliseconds.
    pub resolve_timeout_ms: u64,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            voice_enabled: true,
            autoplay: true,
            volume: 1.0,
            speed: 1.0,
            auto_advance: true,
            base_url: None,
            max_resource_bytes: 20 * 1024 * 1024,
            resolve_timeout_ms: 15_000,
        }
    }
}

impl AudioSettings {
    /// Resolve timeout as a [`Duration`].
    #[must_use]
    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_millis(self.resolve_timeout_ms)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if !(MIN_VOLUME..=MAX_VOLUME).contains(&self.volume) {
            return Err(SettingsError::InvalidValue(format!(
                "audio.volume {} outside {MIN_VOLUME}..={MAX_VOLUME}",
                self.volume
            )));
        }
        if !(MIN_SPEED..=MAX_SPEED).contains(&self.speed) {
            return Err(SettingsError::InvalidValue(format!(
                "audio.speed {} outside {MIN_SPEED}..={MAX_SPEED}",
                self.speed
            )));
        }
        if self.max_resource_bytes == 0 {
            return Err(SettingsError::InvalidValue(
                "audio.maxResourceBytes must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_out_of_range_rejected() {
        let settings = AudioSettings {
            volume: 1.5,
            ..AudioSettings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn speed_bounds_inclusive() {
        let mut settings = AudioSettings::default();
        settings.speed = 0.5;
        assert!(settings.validate().is_ok());
        settings.speed = 2.0;
        assert!(settings.validate().is_ok());
        settings.speed = 2.1;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn base_url_round_trips() {
        let settings: AudioSettings =
            serde_json::from_str(r#"{"baseUrl": "http://localhost:3001"}"#).unwrap();
        assert_eq!(settings.base_url.as_deref(), Some("http://localhost:3001"));
        assert_eq!(settings.resolve_timeout(), Duration::from_secs(15));
    }
}
