//! Output device and autoplay-policy seams.
//!
//! A device renders one [`AudioHandle`] per [`PlaybackId`] and reports
//! progress as [`DeviceEvent`]s on the channel it was created with. Every
//! start gets a fresh id, so a late report for a playback the coordinator
//! has already replaced is recognizably stale.

use std::fmt;

use async_trait::async_trait;
use chorus_core::AudioError;

use crate::item::{AudioHandle, PlaybackParams};

/// Identifies one start of one item on a device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlaybackId(pub u64);

impl fmt::Display for PlaybackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pb-{}", self.0)
    }
}

/// Progress reported by a device.
#[derive(Clone, Debug, PartialEq)]
pub enum DeviceEvent {
    /// Audio is audible.
    Started(PlaybackId),
    /// Playback reached the end naturally.
    Ended(PlaybackId),
    /// Playback failed after starting.
    Failed(PlaybackId, AudioError),
}

/// An audio output.
#[async_trait]
pub trait PlaybackDevice: Send + Sync + 'static {
    /// Whether output is suspended and needs [`resume`](Self::resume) first.
    fn is_suspended(&self) -> bool;

    /// Resume a suspended output.
    async fn resume(&self) -> Result<(), AudioError>;

    /// Begin rendering. Returning `Ok` means the start was accepted;
    /// audibility is confirmed later by [`DeviceEvent::Started`].
    ///
    /// [`AudioError::PermissionDenied`] means the environment refused to
    /// play without a user gesture.
    async fn start(
        &self,
        playback: PlaybackId,
        handle: AudioHandle,
        params: PlaybackParams,
    ) -> Result<(), AudioError>;

    /// Stop rendering and rewind. Unknown ids are ignored.
    fn stop(&self, playback: PlaybackId);

    /// Change volume or rate of an active playback.
    fn apply(&self, playback: PlaybackId, params: PlaybackParams);

    /// Free any resources held for a playback.
    fn release(&self, playback: PlaybackId);
}

/// Environment autoplay policy.
#[async_trait]
pub trait PlaybackCapability: Send + Sync + 'static {
    /// Whether playback may start without a user gesture.
    fn can_autoplay(&self) -> bool;

    /// Ask the environment to allow playback after a user gesture.
    /// Returns whether playback is now allowed.
    async fn request_playback_unlock(&self) -> bool;
}

/// Native default: playback is always allowed.
#[derive(Clone, Copy, Debug, Default)]
pub struct AlwaysAllowed;

#[async_trait]
impl PlaybackCapability for AlwaysAllowed {
    fn can_autoplay(&self) -> bool {
        true
    }

    async fn request_playback_unlock(&self) -> bool {
        true
    }
}
