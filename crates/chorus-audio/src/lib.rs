//! # chorus-audio
//!
//! Serialized playback of persona audio.
//!
//! - [`coordinator::AudioCoordinator`]: the per-session queue; at most one
//!   item plays at a time, progress is published as [`coordinator::AudioEvent`]s
//! - [`device`]: output device and autoplay-policy seams
//! - [`resolver`]: turns `audio_url` references into bytes; [`resolver::HttpResolver`]
//!   fetches them with `reqwest`
//! - [`clock_device::ClockDevice`]: headless device that plays on the tokio clock
//! - [`testing`]: scriptable device, resolver and capability doubles

#![deny(unsafe_code)]

pub mod clock_device;
pub mod coordinator;
pub mod device;
pub mod item;
pub mod resolver;
pub mod testing;

pub use clock_device::ClockDevice;
pub use coordinator::{AudioBackend, AudioCoordinator, AudioEvent};
pub use device::{AlwaysAllowed, DeviceEvent, PlaybackCapability, PlaybackDevice, PlaybackId};
pub use item::{AudioHandle, AudioQueueItem, PlaybackParams, PlaybackSettings};
pub use resolver::{HttpResolver, ResourceResolver};
