//! Session runtime: one connection, one dispatcher, one audio coordinator and
//! one reconciler per conversation session.
//!
//! A single processing task owns the flow of frames and audio notifications.
//! Everything observers need is published as [`RuntimeEvent`]s on a
//! broadcast channel; events published before a subscriber joined are not
//! replayed, the query methods report current state instead.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chorus_audio::{
    AlwaysAllowed, AudioBackend, AudioCoordinator, AudioEvent, AudioQueueItem, ClockDevice,
    HttpResolver, PlaybackSettings,
};
use chorus_connection::{
    ConnectionConfig, ConnectionEvent, ConnectionManager, ConnectionState, FrameDispatcher,
    FrameHandler, Transport, WebSocketTransport,
};
use chorus_core::wire::{
    AudioErrorPayload, AudioPayload, ErrorPayload, ResponsePayload, TypingPayload,
};
use chorus_core::{
    Attachment, ConversationMessage, MessageId, PersonaId, Session, SessionId, Timestamp,
};
use chorus_settings::{AudioSettings, ChorusSettings};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::{Result, RuntimeError};
use crate::events::RuntimeEvent;
use crate::reconciler::{ReconcileOutcome, ResponseReconciler};

/// Capacity of the observer broadcast channel.
const EVENT_CAPACITY: usize = 256;

/// What a session starts from.
#[derive(Clone, Debug)]
pub struct SessionSeed {
    /// Session to join.
    pub session_id: SessionId,
    /// Personas taking part.
    pub persona_ids: Vec<PersonaId>,
    /// Previously loaded history.
    pub backlog: Vec<ConversationMessage>,
    /// Voice mode for this session; `None` uses the configured default.
    pub voice_enabled: Option<bool>,
}

impl SessionSeed {
    /// Seed with no backlog and the configured voice mode.
    pub fn new(session_id: SessionId, persona_ids: Vec<PersonaId>) -> Self {
        Self {
            session_id,
            persona_ids,
            backlog: Vec::new(),
            voice_enabled: None,
        }
    }

    /// Start from a loaded history.
    #[must_use]
    pub fn with_backlog(mut self, backlog: Vec<ConversationMessage>) -> Self {
        self.backlog = backlog;
        self
    }

    /// Override voice mode.
    #[must_use]
    pub fn with_voice(mut self, enabled: bool) -> Self {
        self.voice_enabled = Some(enabled);
        self
    }
}

/// Connection and audio configuration for a runtime.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RuntimeConfig {
    /// Push-channel parameters.
    pub connection: ConnectionConfig,
    /// Voice, playback and resolution settings.
    pub audio: AudioSettings,
}

impl RuntimeConfig {
    /// Build from loaded settings.
    pub fn from_settings(settings: &ChorusSettings) -> Self {
        Self {
            connection: ConnectionConfig::from_settings(&settings.connection),
            audio: settings.audio.clone(),
        }
    }
}

/// Collaborators a runtime is built from.
pub struct RuntimeDeps {
    /// Configuration.
    pub config: RuntimeConfig,
    /// Socket implementation.
    pub transport: Arc<dyn Transport>,
    /// Audio device, resolver and autoplay policy.
    pub audio: AudioBackend,
}

impl RuntimeDeps {
    /// WebSocket transport, HTTP resolver and the headless clock device.
    pub fn native(settings: &ChorusSettings) -> Result<Self> {
        let (device, device_events) = ClockDevice::new();
        let resolver = HttpResolver::from_settings(&settings.audio)?;
        Ok(Self {
            config: RuntimeConfig::from_settings(settings),
            transport: Arc::new(WebSocketTransport),
            audio: AudioBackend {
                device: Arc::new(device),
                device_events,
                resolver: Arc::new(resolver),
                capability: Arc::new(AlwaysAllowed),
            },
        })
    }
}

struct Shared {
    session_id: SessionId,
    connection: ConnectionManager,
    audio: AudioCoordinator,
    dispatcher: FrameDispatcher,
    reconciler: Mutex<ResponseReconciler>,
    speaking: Mutex<Option<PersonaId>>,
    events: broadcast::Sender<RuntimeEvent>,
    autoplay: bool,
    auto_advance: bool,
}

impl Shared {
    fn publish(&self, event: RuntimeEvent) {
        debug!(event_type = event.event_type(), "publishing runtime event");
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn set_speaking(&self, persona: Option<PersonaId>) {
        let mut speaking = self.speaking.lock();
        if *speaking == persona {
            return;
        }
        speaking.clone_from(&persona);
        drop(speaking);
        self.publish(RuntimeEvent::SpeakingChanged(persona));
    }

    /// Clear the speaking state once nothing is playing.
    fn sync_speaking(&self) {
        if self.audio.currently_playing().is_none() {
            self.set_speaking(None);
        }
    }

    fn release_failed(&self, persona: &PersonaId, message_id: &MessageId) {
        let released = self.reconciler.lock().on_audio_failed(persona, message_id);
        if let Some(message) = released {
            self.publish(RuntimeEvent::MessageDisplayed(message));
        }
    }

    /// Play the oldest queued item when sequencing is on and nothing plays.
    fn advance(&self) {
        if !self.auto_advance || !self.reconciler.lock().voice_enabled() {
            return;
        }
        if self.audio.currently_playing().is_some() {
            return;
        }
        let Some(next) = self.audio.next_queued() else {
            return;
        };
        debug!(message_id = %next, "advancing to next queued audio");
        let audio = self.audio.clone();
        drop(tokio::spawn(async move {
            let _ = audio.play(&next).await;
        }));
    }

    fn on_connection_event(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::StateChanged { from, to } => {
                self.publish(RuntimeEvent::ConnectionStateChanged { from, to });
            }
            ConnectionEvent::Opened { session_id } => {
                info!(%session_id, "session channel open");
            }
            ConnectionEvent::Frame(envelope) => {
                let _ = self.dispatcher.dispatch(&envelope, &mut FrameContext { shared: self });
            }
            ConnectionEvent::Malformed(error) => self.dispatcher.record_malformed(&error),
            ConnectionEvent::Closed {
                intentional,
                reason,
            } => {
                self.publish(RuntimeEvent::Disconnected {
                    intentional,
                    reason,
                });
            }
            ConnectionEvent::Error(error) => {
                self.publish(RuntimeEvent::ConnectionFailed(error));
            }
            ConnectionEvent::ReconnectScheduled { attempt, delay } => {
                self.publish(RuntimeEvent::ReconnectScheduled { attempt, delay });
            }
            ConnectionEvent::ReconnectExhausted { attempts } => {
                warn!(session_id = %self.session_id, attempts, "giving up on reconnecting");
                self.publish(RuntimeEvent::ReconnectExhausted { attempts });
            }
        }
    }

    fn on_audio_event(&self, event: AudioEvent) {
        match event {
            AudioEvent::Started {
                message_id,
                persona_id,
            } => {
                self.set_speaking(Some(persona_id.clone()));
                let released = self
                    .reconciler
                    .lock()
                    .on_audio_started(&persona_id, &message_id);
                if let Some(message) = released {
                    self.publish(RuntimeEvent::MessageDisplayed(message));
                }
            }
            AudioEvent::Finished {
                message_id,
                persona_id,
            } => {
                if !self
                    .connection
                    .send_acknowledgment(message_id.clone(), persona_id)
                {
                    debug!(%message_id, "audio acknowledgment not sent");
                }
                self.sync_speaking();
                self.advance();
            }
            AudioEvent::Stopped { .. } => self.sync_speaking(),
            AudioEvent::Error {
                message_id,
                persona_id,
                error,
            } => {
                warn!(%message_id, %persona_id, error = %error, "persona audio failed");
                self.release_failed(&persona_id, &message_id);
                self.publish(RuntimeEvent::AudioFailed {
                    message_id,
                    persona_id,
                    error: error.to_string(),
                });
                self.sync_speaking();
                self.advance();
            }
            AudioEvent::AutoplayBlocked {
                message_id,
                persona_id,
            } => {
                self.publish(RuntimeEvent::AutoplayBlocked {
                    message_id,
                    persona_id,
                });
            }
        }
    }
}

/// Frame handler view over the shared runtime state.
struct FrameContext<'a> {
    shared: &'a Shared,
}

impl FrameHandler for FrameContext<'_> {
    fn on_connection_established(&mut self, info: Value) {
        self.shared
            .publish(RuntimeEvent::ConnectionEstablished { info });
    }

    fn on_persona_typing(&mut self, payload: TypingPayload) {
        let changed = self
            .shared
            .reconciler
            .lock()
            .on_typing(payload.persona_id.clone(), payload.is_typing);
        if changed {
            self.shared.publish(RuntimeEvent::TypingChanged {
                persona_id: payload.persona_id,
                is_typing: payload.is_typing,
            });
        }
    }

    fn on_persona_response(&mut self, payload: ResponsePayload) {
        let timestamp = payload.timestamp.as_ref().and_then(Timestamp::to_datetime);
        let persona_id = payload.persona_id.clone();
        let message = ConversationMessage::from_persona(
            payload.message_id,
            payload.persona_id,
            payload.content,
            timestamp,
        );
        let message_id = message.id.clone();

        let (outcome, was_typing) = {
            let mut reconciler = self.shared.reconciler.lock();
            let was_typing = reconciler.is_typing(&persona_id);
            (reconciler.on_response(message.clone()), was_typing)
        };
        match outcome {
            ReconcileOutcome::Displayed => {
                self.shared.publish(RuntimeEvent::MessageDisplayed(message));
            }
            ReconcileOutcome::Held => {
                self.shared.publish(RuntimeEvent::MessageHeld {
                    message_id,
                    persona_id: persona_id.clone(),
                });
            }
            ReconcileOutcome::Duplicate => debug!(%message_id, "duplicate persona response"),
        }
        if was_typing {
            self.shared.publish(RuntimeEvent::TypingChanged {
                persona_id,
                is_typing: false,
            });
        }
    }

    fn on_all_personas_finished(&mut self) {
        let was_typing = {
            let mut reconciler = self.shared.reconciler.lock();
            let typing = reconciler.typing_personas();
            reconciler.on_all_finished();
            typing
        };
        for persona_id in was_typing {
            self.shared.publish(RuntimeEvent::TypingChanged {
                persona_id,
                is_typing: false,
            });
        }
        self.shared.publish(RuntimeEvent::AllPersonasFinished);
    }

    fn on_persona_audio(&mut self, payload: AudioPayload) {
        if !self.shared.reconciler.lock().voice_enabled() {
            debug!(message_id = %payload.message_id, "voice disabled, ignoring audio");
            return;
        }
        let item = AudioQueueItem::from(payload);
        self.shared.publish(RuntimeEvent::AudioQueued {
            message_id: item.message_id.clone(),
            persona_id: item.persona_id.clone(),
        });
        self.shared.audio.enqueue(item);
    }

    fn on_audio_error(&mut self, payload: AudioErrorPayload) {
        warn!(message_id = %payload.message_id, error = %payload.error, "server could not produce audio");
        let _ = self.shared.audio.remove(&payload.message_id);
        self.shared
            .release_failed(&payload.persona_id, &payload.message_id);
        self.shared.publish(RuntimeEvent::AudioFailed {
            message_id: payload.message_id,
            persona_id: payload.persona_id,
            error: payload.error,
        });
        self.shared.sync_speaking();
    }

    fn on_error(&mut self, payload: ErrorPayload) {
        warn!(message = %payload.message, "server error");
        self.shared.publish(RuntimeEvent::ServerError {
            message: payload.message,
        });
    }
}

async fn run_loop(
    shared: Arc<Shared>,
    mut connection_events: mpsc::UnboundedReceiver<ConnectionEvent>,
    mut audio_events: mpsc::UnboundedReceiver<AudioEvent>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            Some(event) = connection_events.recv() => shared.on_connection_event(event),
            Some(event) = audio_events.recv() => shared.on_audio_event(event),
            else => break,
        }
    }
    debug!(session_id = %shared.session_id, "session loop stopped");
}

/// A running conversation session.
pub struct SessionRuntime {
    shared: Arc<Shared>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl SessionRuntime {
    /// Build every component and start the processing task without
    /// connecting. Subscribe, then call [`connect`](Self::connect) to observe
    /// the whole connection lifecycle.
    pub fn new(seed: SessionSeed, deps: RuntimeDeps) -> Self {
        let RuntimeDeps {
            config,
            transport,
            audio,
        } = deps;
        let voice_enabled = seed.voice_enabled.unwrap_or(config.audio.voice_enabled);
        let mut playback = PlaybackSettings::from_settings(&config.audio);
        playback.autoplay = config.audio.autoplay && voice_enabled;

        let (connection, connection_events) = ConnectionManager::new(config.connection, transport);
        let (coordinator, audio_events) = AudioCoordinator::new(audio, playback);
        let session = Session::with_backlog(seed.session_id.clone(), seed.persona_ids, seed.backlog);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let shared = Arc::new(Shared {
            session_id: seed.session_id,
            connection,
            audio: coordinator,
            dispatcher: FrameDispatcher::new(),
            reconciler: Mutex::new(ResponseReconciler::new(session, voice_enabled)),
            speaking: Mutex::new(None),
            events,
            autoplay: config.audio.autoplay,
            auto_advance: config.audio.auto_advance,
        });
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run_loop(
            Arc::clone(&shared),
            connection_events,
            audio_events,
            shutdown.clone(),
        ));
        info!(session_id = %shared.session_id, voice_enabled, "session runtime ready");
        Self {
            shared,
            shutdown,
            task: Mutex::new(Some(task)),
            stopped: AtomicBool::new(false),
        }
    }

    /// Build, connect and start processing.
    ///
    /// A retryable failure of the first connect leaves the runtime running
    /// while the connection retries; observers see the failure as events.
    /// A non-retryable failure shuts the runtime down and is returned.
    pub async fn start(seed: SessionSeed, deps: RuntimeDeps) -> Result<Self> {
        let runtime = Self::new(seed, deps);
        match runtime.connect().await {
            Ok(()) => Ok(runtime),
            Err(RuntimeError::Connection(err)) if err.is_retryable() => {
                warn!(error = %err, "first connect failed, retrying in background");
                Ok(runtime)
            }
            Err(err) => {
                runtime.shutdown().await;
                Err(err)
            }
        }
    }

    /// Receive runtime events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.shared.events.subscribe()
    }

    // ── Commands ───────────────────────────────────────────────────────────

    /// Send a user message and append it to history. `false` when the
    /// channel is not open; nothing is appended then.
    pub fn send_user_message(
        &self,
        content: &str,
        direct_persona: Option<PersonaId>,
        attachment: Option<Attachment>,
    ) -> bool {
        if !self
            .shared
            .connection
            .send(content, direct_persona, attachment.clone())
        {
            return false;
        }
        let message = ConversationMessage::from_user(content, attachment);
        if self.shared.reconciler.lock().add_user_message(message.clone()) {
            self.shared.publish(RuntimeEvent::MessageDisplayed(message));
        }
        true
    }

    /// Play a queued item, interrupting whatever plays.
    pub async fn play(&self, message_id: &MessageId) -> bool {
        self.shared.audio.play(message_id).await
    }

    /// Stop one item if it is playing.
    pub fn stop(&self, message_id: &MessageId) {
        self.shared.audio.stop(message_id);
        self.shared.sync_speaking();
    }

    /// Stop whatever is playing.
    pub fn stop_all(&self) {
        self.shared.audio.stop_all();
        self.shared.sync_speaking();
    }

    /// Change volume and speed; returns the clamped settings.
    pub fn update_audio_settings(&self, volume: f64, speed: f64) -> PlaybackSettings {
        self.shared.audio.update_settings(volume, speed)
    }

    /// Switch voice mode. Turning it off flushes held texts to history and
    /// drops queued audio.
    pub fn set_voice_enabled(&self, enabled: bool) {
        let flushed = self.shared.reconciler.lock().set_voice_enabled(enabled);
        for message in flushed {
            self.shared.publish(RuntimeEvent::MessageDisplayed(message));
        }
        self.shared.audio.set_autoplay(enabled && self.shared.autoplay);
        if !enabled {
            self.shared.audio.clear();
            self.shared.sync_speaking();
        }
        info!(enabled, "voice mode changed");
    }

    /// Open the push channel for this session. Also used to connect again
    /// after reconnects were exhausted.
    pub async fn connect(&self) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(RuntimeError::ShutDown);
        }
        self.shared
            .connection
            .connect(self.shared.session_id.clone())
            .await?;
        Ok(())
    }

    /// Disconnect, dispose all audio and stop processing. Idempotent.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.connection.disconnect().await;
        self.shared.audio.clear();
        self.shutdown.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "session loop ended abnormally");
            }
        }
        info!(session_id = %self.shared.session_id, "session runtime shut down");
    }

    // ── Queries ────────────────────────────────────────────────────────────

    /// Session id.
    pub fn session_id(&self) -> &SessionId {
        &self.shared.session_id
    }

    /// Displayed history.
    pub fn history(&self) -> Vec<ConversationMessage> {
        self.shared.reconciler.lock().history().to_vec()
    }

    /// Personas currently typing.
    pub fn typing_personas(&self) -> Vec<PersonaId> {
        self.shared.reconciler.lock().typing_personas()
    }

    /// Persona whose audio is audible.
    pub fn speaking_persona(&self) -> Option<PersonaId> {
        self.shared.speaking.lock().clone()
    }

    /// Push-channel state.
    pub fn connection_state(&self) -> ConnectionState {
        self.shared.connection.state()
    }

    /// Texts held for a persona, oldest first.
    pub fn pending_for(&self, persona: &PersonaId) -> Vec<ConversationMessage> {
        self.shared.reconciler.lock().pending_for(persona)
    }

    /// Whether voice mode is on.
    pub fn voice_enabled(&self) -> bool {
        self.shared.reconciler.lock().voice_enabled()
    }

    /// Queued audio, playing item included, in arrival order.
    pub fn queued_audio(&self) -> Vec<MessageId> {
        self.shared.audio.queued_ids()
    }

    /// Current playback settings.
    pub fn audio_settings(&self) -> PlaybackSettings {
        self.shared.audio.settings()
    }

    /// Frames dispatched and dropped so far.
    pub fn frame_counts(&self) -> (u64, u64) {
        (self.shared.dispatcher.dispatched(), self.shared.dispatcher.dropped())
    }
}

impl Drop for SessionRuntime {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
