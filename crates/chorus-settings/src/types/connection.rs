//! Push-channel settings.

use std::time::Duration;

use chorus_core::ReconnectPolicy;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Endpoint, connect timeout and reconnect policy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionSettings {
    /// Base WebSocket URL; the session id is appended as the last path segment.
    pub url: String,
    /// Time allowed for a single open attempt in milliseconds.
    pub connect_timeout_ms: u64,
    /// Reconnect attempt limit and delay bounds.
    pub reconnect: ReconnectPolicy,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            url: "ws://localhost:3001/ws".to_string(),
            connect_timeout_ms: 10_000,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl ConnectionSettings {
    /// Connect timeout as a [`Duration`].
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if !(self.url.starts_with("ws://") || self.url.starts_with("wss://")) {
            return Err(SettingsError::InvalidValue(format!(
                "connection.url must use ws:// or wss://, got {}",
                self.url
            )));
        }
        if self.connect_timeout_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "connection.connectTimeoutMs must be positive".into(),
            ));
        }
        if self.reconnect.base_delay_ms > self.reconnect.max_delay_ms {
            return Err(SettingsError::InvalidValue(format!(
                "reconnect base delay {}ms exceeds cap {}ms",
                self.reconnect.base_delay_ms, self.reconnect.max_delay_ms
            )));
        }
        Ok(())
    }
}
