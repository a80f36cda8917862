//! Headless output device driven by the tokio clock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chorus_core::AudioError;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::device::{DeviceEvent, PlaybackDevice, PlaybackId};
use crate::item::{AudioHandle, PlaybackParams};

/// Bitrate assumed when an item has no reported duration.
const ASSUMED_BITS_PER_SECOND: u64 = 128_000;

/// "Plays" audio by waiting for its duration.
///
/// Each playback emits `Started` immediately and `Ended` after
/// `duration / speed`, unless stopped first. Useful for terminals and
/// machines without a sound card.
#[derive(Clone)]
pub struct ClockDevice {
    events: mpsc::UnboundedSender<DeviceEvent>,
    active: Arc<Mutex<HashMap<PlaybackId, CancellationToken>>>,
}

impl ClockDevice {
    /// New device and the receiver for its progress reports.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DeviceEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                events,
                active: Arc::new(Mutex::new(HashMap::new())),
            },
            rx,
        )
    }

    /// Render time for a handle at the given speed.
    pub fn render_time(handle: &AudioHandle, speed: f64) -> Duration {
        let natural = handle.duration.unwrap_or_else(|| {
            let bits = handle.data.len() as u64 * 8;
            Duration::from_millis(bits * 1000 / ASSUMED_BITS_PER_SECOND)
        });
        natural.div_f64(speed.max(f64::MIN_POSITIVE))
    }
}

#[async_trait]
impl PlaybackDevice for ClockDevice {
    fn is_suspended(&self) -> bool {
        false
    }

    async fn resume(&self) -> Result<(), AudioError> {
        Ok(())
    }

    async fn start(
        &self,
        playback: PlaybackId,
        handle: AudioHandle,
        params: PlaybackParams,
    ) -> Result<(), AudioError> {
        let length = Self::render_time(&handle, params.speed);
        let token = CancellationToken::new();
        if let Some(previous) = self.active.lock().insert(playback, token.clone()) {
            previous.cancel();
        }
        debug!(%playback, ?length, "clock playback started");

        let events = self.events.clone();
        let active = Arc::clone(&self.active);
        drop(tokio::spawn(async move {
            let _ = events.send(DeviceEvent::Started(playback));
            tokio::select! {
                () = token.cancelled() => {}
                () = tokio::time::sleep(length) => {
                    let _ = active.lock().remove(&playback);
                    let _ = events.send(DeviceEvent::Ended(playback));
                }
            }
        }));
        Ok(())
    }

    fn stop(&self, playback: PlaybackId) {
        if let Some(token) = self.active.lock().remove(&playback) {
            token.cancel();
        }
    }

    fn apply(&self, playback: PlaybackId, params: PlaybackParams) {
        debug!(%playback, volume = params.volume, speed = params.speed, "clock device ignores live changes");
    }

    fn release(&self, playback: PlaybackId) {
        self.stop(playback);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_time_uses_duration_and_speed() {
        let handle = AudioHandle::new("x", vec![0_u8; 4]).with_duration(Duration::from_secs(4));
        assert_eq!(ClockDevice::render_time(&handle, 2.0), Duration::from_secs(2));

        // 32 000 bytes at 128 kbit/s is two seconds.
        let unknown = AudioHandle::new("y", vec![0_u8; 32_000]);
        assert_eq!(ClockDevice::render_time(&unknown, 1.0), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn plays_for_its_duration() {
        let (device, mut rx) = ClockDevice::new();
        let handle = AudioHandle::new("x", vec![1_u8]).with_duration(Duration::from_secs(3));
        let params = PlaybackParams { volume: 1.0, speed: 1.0 };
        device.start(PlaybackId(1), handle, params).await.unwrap();

        let begin = tokio::time::Instant::now();
        assert_eq!(rx.recv().await, Some(DeviceEvent::Started(PlaybackId(1))));
        assert_eq!(rx.recv().await, Some(DeviceEvent::Ended(PlaybackId(1))));
        assert_eq!(begin.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_playback_never_ends() {
        let (device, mut rx) = ClockDevice::new();
        let handle = AudioHandle::new("x", vec![1_u8]).with_duration(Duration::from_secs(3));
        let params = PlaybackParams { volume: 1.0, speed: 1.0 };
        device.start(PlaybackId(1), handle, params).await.unwrap();
        assert_eq!(rx.recv().await, Some(DeviceEvent::Started(PlaybackId(1))));

        device.stop(PlaybackId(1));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(rx.try_recv().is_err());
    }
}
