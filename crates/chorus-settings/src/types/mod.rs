//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]` so a partial
//! JSON file fills the missing fields from [`Default`].

mod audio;
mod connection;

pub use audio::*;
pub use connection::*;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
///
/// ```json
/// {
///   "connection": { "url": "wss://chorus.example/ws" },
///   "audio": { "voiceEnabled": false },
///   "logging": { "level": "debug" }
/// }
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChorusSettings {
    /// Push-channel endpoint and reconnect behavior.
    pub connection: ConnectionSettings,
    /// Voice mode, playback and resource resolution.
    pub audio: AudioSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl ChorusSettings {
    /// Reject values that no component could run with.
    pub fn validate(&self) -> Result<()> {
        self.connection.validate()?;
        self.audio.validate()?;
        if self.logging.level.trim().is_empty() {
            return Err(SettingsError::InvalidValue("logging.level is empty".into()));
        }
        Ok(())
    }
}

/// Logging configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            json: false,
        }
    }
}
