//! Events published to UI observers.

use std::time::Duration;

use chorus_connection::ConnectionState;
use chorus_core::{ConnectionError, ConversationMessage, MessageId, PersonaId};
use serde_json::Value;

/// Everything a session runtime tells its observers.
#[derive(Clone, Debug, PartialEq)]
pub enum RuntimeEvent {
    /// The server greeted the session.
    ConnectionEstablished {
        /// Server-provided session context.
        info: Value,
    },
    /// The push channel changed state.
    ConnectionStateChanged {
        /// Previous state.
        from: ConnectionState,
        /// New state.
        to: ConnectionState,
    },
    /// The push channel closed.
    Disconnected {
        /// Whether the close was requested locally.
        intentional: bool,
        /// Close reason, when known.
        reason: Option<String>,
    },
    /// An open attempt or an open channel failed.
    ConnectionFailed(ConnectionError),
    /// A reconnect will be attempted after `delay`.
    ReconnectScheduled {
        /// 1-based retry number.
        attempt: u32,
        /// Wait before the retry.
        delay: Duration,
    },
    /// No more reconnects will be attempted.
    ReconnectExhausted {
        /// Retries made.
        attempts: u32,
    },
    /// A persona started or stopped typing.
    TypingChanged {
        /// Persona.
        persona_id: PersonaId,
        /// New flag.
        is_typing: bool,
    },
    /// A message was appended to history.
    MessageDisplayed(ConversationMessage),
    /// A persona response is waiting for its audio.
    MessageHeld {
        /// Held message.
        message_id: MessageId,
        /// Its persona.
        persona_id: PersonaId,
    },
    /// All personas finished the current turn.
    AllPersonasFinished,
    /// Audio for a message was queued.
    AudioQueued {
        /// Message.
        message_id: MessageId,
        /// Speaking persona.
        persona_id: PersonaId,
    },
    /// The speaking persona changed. `None` when nobody is speaking.
    SpeakingChanged(Option<PersonaId>),
    /// Audio for a message could not be produced or played.
    AudioFailed {
        /// Message.
        message_id: MessageId,
        /// Its persona.
        persona_id: PersonaId,
        /// Failure description.
        error: String,
    },
    /// Playback needs a user gesture; the item waits in the queue.
    AutoplayBlocked {
        /// Waiting message.
        message_id: MessageId,
        /// Its persona.
        persona_id: PersonaId,
    },
    /// The server reported an error.
    ServerError {
        /// Server message.
        message: String,
    },
}

impl RuntimeEvent {
    /// Stable name of the event kind.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ConnectionEstablished { .. } => "connection_established",
            Self::ConnectionStateChanged { .. } => "connection_state_changed",
            Self::Disconnected { .. } => "disconnected",
            Self::ConnectionFailed(_) => "connection_failed",
            Self::ReconnectScheduled { .. } => "reconnect_scheduled",
            Self::ReconnectExhausted { .. } => "reconnect_exhausted",
            Self::TypingChanged { .. } => "typing_changed",
            Self::MessageDisplayed(_) => "message_displayed",
            Self::MessageHeld { .. } => "message_held",
            Self::AllPersonasFinished => "all_personas_finished",
            Self::AudioQueued { .. } => "audio_queued",
            Self::SpeakingChanged(_) => "speaking_changed",
            Self::AudioFailed { .. } => "audio_failed",
            Self::AutoplayBlocked { .. } => "autoplay_blocked",
            Self::ServerError { .. } => "server_error",
        }
    }
}
