//! Audio playback coordinator.
//!
//! Owns the queue of playable items for one session and guarantees that at
//! most one of them renders at any time. Progress is published as
//! [`AudioEvent`]s; the coordinator never chains items on its own.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chorus_core::{AudioError, MessageId, PersonaId};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::device::{DeviceEvent, PlaybackCapability, PlaybackDevice, PlaybackId};
use crate::item::{AudioHandle, AudioQueueItem, PlaybackSettings, clamp_speed, clamp_volume};
use crate::resolver::ResourceResolver;

/// Notifications published by the coordinator.
#[derive(Clone, Debug, PartialEq)]
pub enum AudioEvent {
    /// The device confirmed that audio is audible.
    Started {
        /// Item that started.
        message_id: MessageId,
        /// Speaking persona.
        persona_id: PersonaId,
    },
    /// Playback reached the end. The item has been disposed.
    Finished {
        /// Item that finished.
        message_id: MessageId,
        /// Persona that was speaking.
        persona_id: PersonaId,
    },
    /// Playback was stopped before the end. The item stays queued.
    Stopped {
        /// Item that was stopped.
        message_id: MessageId,
        /// Persona that was speaking.
        persona_id: PersonaId,
    },
    /// The item could not be resolved or played. It has been disposed.
    Error {
        /// Failed item.
        message_id: MessageId,
        /// Its persona.
        persona_id: PersonaId,
        /// What went wrong.
        error: AudioError,
    },
    /// The environment requires a user gesture before playback.
    AutoplayBlocked {
        /// Item left waiting in the queue.
        message_id: MessageId,
        /// Its persona.
        persona_id: PersonaId,
    },
}

/// Collaborators the coordinator drives.
pub struct AudioBackend {
    /// Output device.
    pub device: Arc<dyn PlaybackDevice>,
    /// Receiver for the device's progress reports.
    pub device_events: mpsc::UnboundedReceiver<DeviceEvent>,
    /// Turns resource references into playable data.
    pub resolver: Arc<dyn ResourceResolver>,
    /// Environment autoplay policy.
    pub capability: Arc<dyn PlaybackCapability>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EntryStatus {
    Queued,
    Playing(PlaybackId),
}

struct Entry {
    item: AudioQueueItem,
    handle: Option<AudioHandle>,
    status: EntryStatus,
}

struct Active {
    message_id: MessageId,
    persona_id: PersonaId,
    playback: PlaybackId,
}

#[derive(Default)]
struct QueueState {
    entries: Vec<Entry>,
    current: Option<Active>,
    settings: PlaybackSettings,
}

impl QueueState {
    fn position(&self, message_id: &MessageId) -> Option<usize> {
        self.entries.iter().position(|e| &e.item.message_id == message_id)
    }

    fn entry_mut(&mut self, message_id: &MessageId) -> Option<&mut Entry> {
        self.entries.iter_mut().find(|e| &e.item.message_id == message_id)
    }

    /// Take the active playback if it belongs to `playback`.
    fn take_active(&mut self, playback: PlaybackId) -> Option<Active> {
        if self.current.as_ref().is_some_and(|a| a.playback == playback) {
            self.current.take()
        } else {
            None
        }
    }
}

enum PlayOutcome {
    Started,
    AlreadyPlaying,
    Busy,
    Missing,
    Blocked,
    Failed,
}

struct Inner {
    device: Arc<dyn PlaybackDevice>,
    resolver: Arc<dyn ResourceResolver>,
    capability: Arc<dyn PlaybackCapability>,
    state: Mutex<QueueState>,
    play_lock: tokio::sync::Mutex<()>,
    events: mpsc::UnboundedSender<AudioEvent>,
    next_playback: AtomicU64,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn emit(&self, event: AudioEvent) {
        if self.events.send(event).is_err() {
            debug!("audio event receiver dropped");
        }
    }

    /// Stop the active playback, leaving its entry queued.
    fn stop_active(&self, state: &mut QueueState) -> Option<Active> {
        let active = state.current.take()?;
        self.device.stop(active.playback);
        self.device.release(active.playback);
        if let Some(entry) = state.entry_mut(&active.message_id) {
            entry.status = EntryStatus::Queued;
        }
        Some(active)
    }

    /// Stop, release and remove one entry.
    fn dispose(&self, state: &mut QueueState, message_id: &MessageId) -> Option<AudioQueueItem> {
        let pos = state.position(message_id)?;
        let entry = state.entries.remove(pos);
        if let EntryStatus::Playing(playback) = entry.status {
            if state.current.as_ref().is_some_and(|a| a.playback == playback) {
                state.current = None;
            }
            self.device.stop(playback);
            self.device.release(playback);
        }
        Some(entry.item)
    }

    fn handle_device_event(&self, event: DeviceEvent) {
        match event {
            DeviceEvent::Started(playback) => {
                let state = self.state.lock();
                match state.current.as_ref() {
                    Some(active) if active.playback == playback => {
                        info!(message_id = %active.message_id, persona_id = %active.persona_id, "audio started");
                        self.emit(AudioEvent::Started {
                            message_id: active.message_id.clone(),
                            persona_id: active.persona_id.clone(),
                        });
                    }
                    _ => debug!(%playback, "ignoring stale start"),
                }
            }
            DeviceEvent::Ended(playback) => {
                let mut state = self.state.lock();
                let Some(active) = state.take_active(playback) else {
                    debug!(%playback, "ignoring stale end");
                    return;
                };
                let _ = self.dispose(&mut state, &active.message_id);
                drop(state);
                info!(message_id = %active.message_id, "audio finished");
                self.emit(AudioEvent::Finished {
                    message_id: active.message_id,
                    persona_id: active.persona_id,
                });
            }
            DeviceEvent::Failed(playback, error) => {
                let mut state = self.state.lock();
                let Some(active) = state.take_active(playback) else {
                    debug!(%playback, "ignoring stale failure");
                    return;
                };
                let _ = self.dispose(&mut state, &active.message_id);
                drop(state);
                warn!(message_id = %active.message_id, error = %error, "playback failed");
                self.emit(AudioEvent::Error {
                    message_id: active.message_id,
                    persona_id: active.persona_id,
                    error,
                });
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.get_mut().take() {
            pump.abort();
        }
    }
}

/// Serializes playback of queued persona audio.
///
/// Cloning yields another handle to the same queue.
#[derive(Clone)]
pub struct AudioCoordinator {
    inner: Arc<Inner>,
}

impl AudioCoordinator {
    /// Build a coordinator over `backend`. Must be called inside a tokio
    /// runtime; device reports are consumed on a background task.
    pub fn new(
        backend: AudioBackend,
        settings: PlaybackSettings,
    ) -> (Self, mpsc::UnboundedReceiver<AudioEvent>) {
        let AudioBackend {
            device,
            device_events,
            resolver,
            capability,
        } = backend;
        let (events, rx) = mpsc::unbounded_channel();
        let settings = PlaybackSettings {
            volume: clamp_volume(settings.volume),
            speed: clamp_speed(settings.speed),
            ..settings
        };
        let inner = Arc::new(Inner {
            device,
            resolver,
            capability,
            state: Mutex::new(QueueState {
                settings,
                ..QueueState::default()
            }),
            play_lock: tokio::sync::Mutex::new(()),
            events,
            next_playback: AtomicU64::new(1),
            pump: Mutex::new(None),
        });
        let pump = tokio::spawn(pump_device_events(Arc::downgrade(&inner), device_events));
        *inner.pump.lock() = Some(pump);
        (Self { inner }, rx)
    }

    /// Queue an item, replacing any entry with the same message id.
    pub fn enqueue(&self, item: AudioQueueItem) {
        let message_id = item.message_id.clone();
        let persona_id = item.persona_id.clone();
        let autoplay = {
            let mut state = self.inner.state.lock();
            if let Some(pos) = state.position(&message_id) {
                debug!(%message_id, "replacing queued audio");
                if let EntryStatus::Playing(playback) = state.entries[pos].status {
                    if state.current.as_ref().is_some_and(|a| a.playback == playback) {
                        state.current = None;
                    }
                    self.inner.device.stop(playback);
                    self.inner.device.release(playback);
                    self.inner.emit(AudioEvent::Stopped {
                        message_id: message_id.clone(),
                        persona_id: state.entries[pos].item.persona_id.clone(),
                    });
                }
                state.entries[pos] = Entry {
                    item,
                    handle: None,
                    status: EntryStatus::Queued,
                };
            } else {
                state.entries.push(Entry {
                    item,
                    handle: None,
                    status: EntryStatus::Queued,
                });
            }
            state.settings.autoplay
        };
        debug!(%message_id, %persona_id, "audio queued");

        if !autoplay {
            return;
        }
        if !self.inner.capability.can_autoplay() {
            info!(%message_id, "autoplay blocked by environment");
            self.inner.emit(AudioEvent::AutoplayBlocked {
                message_id,
                persona_id,
            });
            return;
        }
        let this = self.clone();
        drop(tokio::spawn(async move {
            let _guard = this.inner.play_lock.lock().await;
            // Unlike `play`, autoplay never interrupts: it starts the item only
            // when nothing is playing and leaves it queued otherwise.
            let _ = this.play_locked(&message_id, true).await;
        }));
    }

    /// Play one queued item, stopping whatever is playing.
    ///
    /// Returns whether the device accepted the start. Failures are reported
    /// as [`AudioEvent`]s, never to the caller.
    pub async fn play(&self, message_id: &MessageId) -> bool {
        if !self.inner.capability.can_autoplay()
            && !self.inner.capability.request_playback_unlock().await
        {
            warn!(%message_id, "playback unlock refused");
        }
        let _guard = self.inner.play_lock.lock().await;
        matches!(
            self.play_locked(message_id, false).await,
            PlayOutcome::Started | PlayOutcome::AlreadyPlaying
        )
    }

    async fn play_locked(&self, message_id: &MessageId, only_if_idle: bool) -> PlayOutcome {
        let inner = &self.inner;
        let (item, cached) = {
            let state = inner.state.lock();
            if state.current.as_ref().is_some_and(|a| &a.message_id == message_id) {
                return PlayOutcome::AlreadyPlaying;
            }
            if only_if_idle && state.current.is_some() {
                return PlayOutcome::Busy;
            }
            let Some(pos) = state.position(message_id) else {
                debug!(%message_id, "play requested for unknown item");
                return PlayOutcome::Missing;
            };
            let entry = &state.entries[pos];
            (entry.item.clone(), entry.handle.clone())
        };

        let handle = if let Some(handle) = cached {
            handle
        } else {
            match inner.resolver.resolve(&item.audio_url).await {
                Ok(mut handle) => {
                    if handle.duration.is_none() {
                        handle.duration = item.duration;
                    }
                    if let Some(entry) = inner.state.lock().entry_mut(message_id) {
                        entry.handle = Some(handle.clone());
                    }
                    handle
                }
                Err(error) => {
                    warn!(%message_id, url = %item.audio_url, error = %error, "audio resolve failed");
                    let removed = inner.dispose(&mut inner.state.lock(), message_id);
                    if removed.is_some() {
                        inner.emit(AudioEvent::Error {
                            message_id: item.message_id,
                            persona_id: item.persona_id,
                            error,
                        });
                    }
                    return PlayOutcome::Failed;
                }
            }
        };

        if inner.device.is_suspended() {
            if let Err(error) = inner.device.resume().await {
                warn!(error = %error, "failed to resume output device");
            }
        }

        let playback = PlaybackId(inner.next_playback.fetch_add(1, Ordering::Relaxed));
        let params = {
            let mut state = inner.state.lock();
            if state.position(message_id).is_none() {
                debug!(%message_id, "item removed while resolving");
                return PlayOutcome::Missing;
            }
            if let Some(previous) = inner.stop_active(&mut state) {
                debug!(message_id = %previous.message_id, "interrupting playback");
                inner.emit(AudioEvent::Stopped {
                    message_id: previous.message_id,
                    persona_id: previous.persona_id,
                });
            }
            if let Some(entry) = state.entry_mut(message_id) {
                entry.status = EntryStatus::Playing(playback);
            }
            state.current = Some(Active {
                message_id: message_id.clone(),
                persona_id: item.persona_id.clone(),
                playback,
            });
            state.settings.params()
        };

        match inner.device.start(playback, handle, params).await {
            Ok(()) => {
                debug!(%message_id, %playback, "playback accepted");
                PlayOutcome::Started
            }
            Err(AudioError::PermissionDenied(reason)) => {
                info!(%message_id, %reason, "playback needs user gesture");
                {
                    let mut state = inner.state.lock();
                    if state.take_active(playback).is_some() {
                        if let Some(entry) = state.entry_mut(message_id) {
                            entry.status = EntryStatus::Queued;
                        }
                    }
                }
                inner.device.release(playback);
                inner.emit(AudioEvent::AutoplayBlocked {
                    message_id: item.message_id,
                    persona_id: item.persona_id,
                });
                PlayOutcome::Blocked
            }
            Err(error) => {
                warn!(%message_id, error = %error, "playback start failed");
                let removed = inner.dispose(&mut inner.state.lock(), message_id);
                if removed.is_some() {
                    inner.emit(AudioEvent::Error {
                        message_id: item.message_id,
                        persona_id: item.persona_id,
                        error,
                    });
                }
                PlayOutcome::Failed
            }
        }
    }

    /// Stop `message_id` if it is playing. The item stays queued.
    pub fn stop(&self, message_id: &MessageId) {
        let mut state = self.inner.state.lock();
        if !state.current.as_ref().is_some_and(|a| &a.message_id == message_id) {
            return;
        }
        if let Some(active) = self.inner.stop_active(&mut state) {
            drop(state);
            debug!(message_id = %active.message_id, "audio stopped");
            self.inner.emit(AudioEvent::Stopped {
                message_id: active.message_id,
                persona_id: active.persona_id,
            });
        }
    }

    /// Stop whatever is playing.
    pub fn stop_all(&self) {
        let stopped = self.inner.stop_active(&mut self.inner.state.lock());
        if let Some(active) = stopped {
            debug!(message_id = %active.message_id, "audio stopped");
            self.inner.emit(AudioEvent::Stopped {
                message_id: active.message_id,
                persona_id: active.persona_id,
            });
        }
    }

    /// Stop playback and dispose every entry.
    pub fn clear(&self) {
        let mut state = self.inner.state.lock();
        let stopped = self.inner.stop_active(&mut state);
        let ids: Vec<MessageId> = state.entries.iter().map(|e| e.item.message_id.clone()).collect();
        for id in &ids {
            let _ = self.inner.dispose(&mut state, id);
        }
        drop(state);
        debug!(count = ids.len(), "audio queue cleared");
        if let Some(active) = stopped {
            self.inner.emit(AudioEvent::Stopped {
                message_id: active.message_id,
                persona_id: active.persona_id,
            });
        }
    }

    /// Dispose one entry, stopping it first if it is playing.
    pub fn remove(&self, message_id: &MessageId) -> Option<AudioQueueItem> {
        let removed = self.inner.dispose(&mut self.inner.state.lock(), message_id);
        if removed.is_some() {
            debug!(%message_id, "audio removed");
        }
        removed
    }

    /// Change volume and speed. Values are clamped; the playing item picks
    /// them up immediately and queued items when they start.
    pub fn update_settings(&self, volume: f64, speed: f64) -> PlaybackSettings {
        let mut state = self.inner.state.lock();
        state.settings.volume = clamp_volume(volume);
        state.settings.speed = clamp_speed(speed);
        if let Some(active) = state.current.as_ref() {
            self.inner.device.apply(active.playback, state.settings.params());
        }
        state.settings
    }

    /// Turn autoplay on or off for items queued from now on.
    pub fn set_autoplay(&self, autoplay: bool) {
        self.inner.state.lock().settings.autoplay = autoplay;
    }

    /// Current settings.
    pub fn settings(&self) -> PlaybackSettings {
        self.inner.state.lock().settings
    }

    /// Message whose audio is playing.
    pub fn currently_playing(&self) -> Option<MessageId> {
        self.inner.state.lock().current.as_ref().map(|a| a.message_id.clone())
    }

    /// Persona whose audio is playing.
    pub fn speaking_persona(&self) -> Option<PersonaId> {
        self.inner.state.lock().current.as_ref().map(|a| a.persona_id.clone())
    }

    /// Whether `message_id` is the playing item.
    pub fn is_playing(&self, message_id: &MessageId) -> bool {
        self.inner
            .state
            .lock()
            .current
            .as_ref()
            .is_some_and(|a| &a.message_id == message_id)
    }

    /// Every queued message id in arrival order, the playing one included.
    pub fn queued_ids(&self) -> Vec<MessageId> {
        self.inner
            .state
            .lock()
            .entries
            .iter()
            .map(|e| e.item.message_id.clone())
            .collect()
    }

    /// Queued message ids for one persona in arrival order.
    pub fn queued_for_persona(&self, persona_id: &PersonaId) -> Vec<MessageId> {
        self.inner
            .state
            .lock()
            .entries
            .iter()
            .filter(|e| &e.item.persona_id == persona_id)
            .map(|e| e.item.message_id.clone())
            .collect()
    }

    /// Oldest entry that is not playing.
    pub fn next_queued(&self) -> Option<MessageId> {
        self.inner
            .state
            .lock()
            .entries
            .iter()
            .find(|e| e.status == EntryStatus::Queued)
            .map(|e| e.item.message_id.clone())
    }
}

async fn pump_device_events(inner: Weak<Inner>, mut rx: mpsc::UnboundedReceiver<DeviceEvent>) {
    while let Some(event) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        inner.handle_device_event(event);
    }
    debug!("device event channel closed");
}
