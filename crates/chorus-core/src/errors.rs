//! Error taxonomy for the Chorus client runtime.
//!
//! - [`ConnectionError`]: push-channel failures (timeouts, transport faults)
//! - [`ProtocolError`]: frames that cannot be parsed or decoded
//! - [`AudioError`]: resolution and playback failures
//!
//! All three are `Clone` so they can travel inside broadcast events.

use std::time::Duration;

use thiserror::Error;

/// Push-channel failure.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ConnectionError {
    /// The channel did not reach the open state in time.
    #[error("connection timed out after {0:?}")]
    Timeout(Duration),

    /// Transport-level fault (handshake, I/O, protocol violation).
    #[error("transport error: {0}")]
    Transport(String),

    /// The peer closed the channel.
    #[error("connection closed: {0}")]
    Closed(String),

    /// The configured endpoint cannot be used.
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    /// An operation needed an open channel and there was none.
    #[error("not connected")]
    Disconnected,
}

impl ConnectionError {
    /// Whether a reconnect attempt might succeed after this error.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::InvalidUrl(_))
    }
}

/// A server frame that could not be understood.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// The raw text is not valid JSON or not an envelope.
    #[error("invalid frame json: {0}")]
    InvalidJson(String),

    /// The envelope carries a type this client does not know.
    #[error("unknown frame type: {0}")]
    UnknownType(String),

    /// The envelope type is known but its payload has the wrong shape.
    #[error("invalid payload for {frame_type}: {message}")]
    InvalidPayload {
        /// Frame type whose payload failed to decode.
        frame_type: String,
        /// Decoder message.
        message: String,
    },
}

/// Audio resolution or playback failure.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum AudioError {
    /// The resource reference could not be turned into playable data.
    #[error("failed to resolve audio: {0}")]
    Resolve(String),

    /// The output device failed while playing.
    #[error("playback failed: {0}")]
    Playback(String),

    /// The environment refused to start playback without user consent.
    #[error("playback not permitted: {0}")]
    PermissionDenied(String),

    /// No queued item has this message id.
    #[error("no audio item for message {0}")]
    UnknownItem(String),

    /// Resolved audio exceeds the configured size limit.
    #[error("audio resource too large: {size} bytes (limit {limit})")]
    TooLarge {
        /// Actual size in bytes.
        size: u64,
        /// Configured limit in bytes.
        limit: u64,
    },
}
