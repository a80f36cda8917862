//! Queue items, resolved handles and playback settings.

use std::time::Duration;

use bytes::Bytes;
use chorus_core::wire::AudioPayload;
use chorus_core::{MessageId, PersonaId};
use chorus_settings::{AudioSettings, MAX_SPEED, MAX_VOLUME, MIN_SPEED, MIN_VOLUME};

/// One playable persona utterance, keyed by message id.
#[derive(Clone, Debug, PartialEq)]
pub struct AudioQueueItem {
    /// Message the audio belongs to.
    pub message_id: MessageId,
    /// Speaking persona.
    pub persona_id: PersonaId,
    /// Resource reference, absolute or relative to the audio base URL.
    pub audio_url: String,
    /// Voice used for synthesis.
    pub voice_id: String,
    /// Length of the audio, when the server reported it.
    pub duration: Option<Duration>,
}

impl From<AudioPayload> for AudioQueueItem {
    fn from(p: AudioPayload) -> Self {
        Self {
            message_id: p.message_id,
            persona_id: p.persona_id,
            audio_url: p.audio_url,
            voice_id: p.voice_id,
            duration: p.duration.and_then(|secs| Duration::try_from_secs_f64(secs).ok()),
        }
    }
}

/// Resolved audio ready to hand to a device.
#[derive(Clone, Debug, PartialEq)]
pub struct AudioHandle {
    /// Where the data came from.
    pub url: String,
    /// Encoded audio.
    pub data: Bytes,
    /// Reported content type.
    pub mime_type: Option<String>,
    /// Length of the audio, when known.
    pub duration: Option<Duration>,
}

impl AudioHandle {
    /// Handle over in-memory data.
    pub fn new(url: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            url: url.into(),
            data: data.into(),
            mime_type: None,
            duration: None,
        }
    }

    /// Set the known duration.
    #[must_use]
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }
}

/// Volume and rate handed to the device for one playback.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PlaybackParams {
    /// 0.0 to 1.0.
    pub volume: f64,
    /// 0.5 to 2.0.
    pub speed: f64,
}

/// Coordinator-wide playback settings.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PlaybackSettings {
    /// Output volume.
    pub volume: f64,
    /// Playback rate.
    pub speed: f64,
    /// Start playing as soon as an item is queued.
    pub autoplay: bool,
}

impl Default for PlaybackSettings {
    fn default() -> Self {
        Self {
            volume: 1.0,
            speed: 1.0,
            autoplay: true,
        }
    }
}

impl PlaybackSettings {
    /// Settings for a session: autoplay only applies while voice mode is on.
    pub fn from_settings(settings: &AudioSettings) -> Self {
        Self {
            volume: clamp_volume(settings.volume),
            speed: clamp_speed(settings.speed),
            autoplay: settings.autoplay && settings.voice_enabled,
        }
    }

    /// Device parameters for the current settings.
    #[must_use]
    pub fn params(&self) -> PlaybackParams {
        PlaybackParams {
            volume: self.volume,
            speed: self.speed,
        }
    }
}

/// Clamp a volume into `0.0..=1.0`. NaN becomes the maximum.
#[must_use]
pub fn clamp_volume(volume: f64) -> f64 {
    if volume.is_nan() {
        MAX_VOLUME
    } else {
        volume.clamp(MIN_VOLUME, MAX_VOLUME)
    }
}

/// Clamp a speed into `0.5..=2.0`. NaN becomes normal speed.
#[must_use]
pub fn clamp_speed(speed: f64) -> f64 {
    if speed.is_nan() {
        1.0
    } else {
        speed.clamp(MIN_SPEED, MAX_SPEED)
    }
}
