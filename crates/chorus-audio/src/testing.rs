//! Test doubles for the device, resolver and capability seams.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chorus_core::AudioError;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::device::{DeviceEvent, PlaybackCapability, PlaybackDevice, PlaybackId};
use crate::item::{AudioHandle, PlaybackParams};
use crate::resolver::ResourceResolver;

#[derive(Default)]
struct ManualState {
    active: HashSet<PlaybackId>,
    latest: Option<PlaybackId>,
    starts: Vec<(PlaybackId, String)>,
    released: Vec<PlaybackId>,
    max_concurrent: usize,
    last_params: Option<PlaybackParams>,
    suspended: bool,
    deny_next: bool,
    auto_start: bool,
}

/// Device whose progress is driven by the test.
///
/// Starts are recorded; `Started`, `Ended` and `Failed` reports are only
/// sent when the test asks, unless auto-start is enabled.
pub struct ManualDevice {
    events: mpsc::UnboundedSender<DeviceEvent>,
    state: Mutex<ManualState>,
}

impl ManualDevice {
    /// New device and the receiver for its reports.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<DeviceEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                events,
                state: Mutex::new(ManualState::default()),
            }),
            rx,
        )
    }

    /// Report `Started` as soon as a start is accepted.
    pub fn set_auto_start(&self, on: bool) {
        self.state.lock().auto_start = on;
    }

    /// Mark the output suspended.
    pub fn set_suspended(&self, suspended: bool) {
        self.state.lock().suspended = suspended;
    }

    /// Refuse the next start with `PermissionDenied`.
    pub fn deny_next_start(&self) {
        self.state.lock().deny_next = true;
    }

    /// Report `Started` for a playback.
    pub fn confirm(&self, playback: PlaybackId) {
        let _ = self.events.send(DeviceEvent::Started(playback));
    }

    /// Report `Started` for the most recent start.
    pub fn confirm_started(&self) {
        if let Some(playback) = self.state.lock().latest {
            self.confirm(playback);
        }
    }

    /// Report `Ended` for the most recent start.
    pub fn finish_current(&self) {
        let latest = self.state.lock().latest;
        if let Some(playback) = latest {
            self.finish(playback);
        }
    }

    /// Report `Ended` for a playback.
    pub fn finish(&self, playback: PlaybackId) {
        let _ = self.state.lock().active.remove(&playback);
        let _ = self.events.send(DeviceEvent::Ended(playback));
    }

    /// Report `Failed` for the most recent start.
    pub fn fail_current(&self, error: AudioError) {
        let latest = {
            let mut state = self.state.lock();
            let latest = state.latest;
            if let Some(playback) = latest {
                let _ = state.active.remove(&playback);
            }
            latest
        };
        if let Some(playback) = latest {
            let _ = self.events.send(DeviceEvent::Failed(playback, error));
        }
    }

    /// Playbacks currently rendering.
    pub fn active(&self) -> usize {
        self.state.lock().active.len()
    }

    /// Highest number of simultaneously rendering playbacks seen.
    pub fn max_concurrent(&self) -> usize {
        self.state.lock().max_concurrent
    }

    /// Every accepted start with the handle URL.
    pub fn starts(&self) -> Vec<(PlaybackId, String)> {
        self.state.lock().starts.clone()
    }

    /// Every released playback.
    pub fn released(&self) -> Vec<PlaybackId> {
        self.state.lock().released.clone()
    }

    /// Parameters most recently passed to `start` or `apply`.
    pub fn last_params(&self) -> Option<PlaybackParams> {
        self.state.lock().last_params
    }
}

#[async_trait]
impl PlaybackDevice for ManualDevice {
    fn is_suspended(&self) -> bool {
        self.state.lock().suspended
    }

    async fn resume(&self) -> Result<(), AudioError> {
        self.state.lock().suspended = false;
        Ok(())
    }

    async fn start(
        &self,
        playback: PlaybackId,
        handle: AudioHandle,
        params: PlaybackParams,
    ) -> Result<(), AudioError> {
        let auto_start = {
            let mut state = self.state.lock();
            if state.deny_next {
                state.deny_next = false;
                return Err(AudioError::PermissionDenied("user gesture required".into()));
            }
            let _ = state.active.insert(playback);
            state.max_concurrent = state.max_concurrent.max(state.active.len());
            state.latest = Some(playback);
            state.starts.push((playback, handle.url));
            state.last_params = Some(params);
            state.auto_start
        };
        if auto_start {
            self.confirm(playback);
        }
        Ok(())
    }

    fn stop(&self, playback: PlaybackId) {
        let _ = self.state.lock().active.remove(&playback);
    }

    fn apply(&self, _playback: PlaybackId, params: PlaybackParams) {
        self.state.lock().last_params = Some(params);
    }

    fn release(&self, playback: PlaybackId) {
        let mut state = self.state.lock();
        let _ = state.active.remove(&playback);
        state.released.push(playback);
    }
}

/// Resolver backed by an in-memory table.
#[derive(Default)]
pub struct StaticResolver {
    table: Mutex<HashMap<String, Result<AudioHandle, AudioError>>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl StaticResolver {
    /// Empty table. Unknown URLs fail with [`AudioError::Resolve`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `url` to a handle.
    pub fn insert(&self, url: impl Into<String>, handle: AudioHandle) {
        let _ = self.table.lock().insert(url.into(), Ok(handle));
    }

    /// Map `url` to a failure.
    pub fn fail(&self, url: impl Into<String>, error: AudioError) {
        let _ = self.table.lock().insert(url.into(), Err(error));
    }

    /// How often `url` was resolved.
    pub fn resolve_count(&self, url: &str) -> usize {
        self.calls.lock().get(url).copied().unwrap_or(0)
    }
}

#[async_trait]
impl ResourceResolver for StaticResolver {
    async fn resolve(&self, url: &str) -> Result<AudioHandle, AudioError> {
        *self.calls.lock().entry(url.to_owned()).or_default() += 1;
        self.table
            .lock()
            .get(url)
            .cloned()
            .unwrap_or_else(|| Err(AudioError::Resolve(format!("no audio at {url}"))))
    }
}

/// Capability that refuses autoplay until unlocked.
#[derive(Debug, Default)]
pub struct BlockedCapability {
    unlocked: AtomicBool,
    grant_unlock: AtomicBool,
}

impl BlockedCapability {
    /// Make `request_playback_unlock` succeed.
    pub fn grant_on_request(&self) {
        self.grant_unlock.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl PlaybackCapability for BlockedCapability {
    fn can_autoplay(&self) -> bool {
        self.unlocked.load(Ordering::SeqCst)
    }

    async fn request_playback_unlock(&self) -> bool {
        let granted = self.grant_unlock.load(Ordering::SeqCst);
        if granted {
            self.unlocked.store(true, Ordering::SeqCst);
        }
        granted
    }
}
