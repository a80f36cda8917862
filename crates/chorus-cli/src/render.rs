//! One-line rendering of runtime events.

use chorus_core::SenderKind;
use chorus_runtime::RuntimeEvent;

/// Text to print for an event, or `None` for events the terminal skips.
pub fn line(event: &RuntimeEvent) -> Option<String> {
    let text = match event {
        RuntimeEvent::ConnectionEstablished { .. } => "* connected".to_owned(),
        RuntimeEvent::ConnectionStateChanged { .. } | RuntimeEvent::AudioQueued { .. } => {
            return None;
        }
        RuntimeEvent::Disconnected {
            intentional: false,
            reason,
        } => format!("* connection lost: {}", reason.as_deref().unwrap_or("unknown reason")),
        RuntimeEvent::Disconnected { .. } => "* disconnected".to_owned(),
        RuntimeEvent::ConnectionFailed(err) => format!("* connection error: {err}"),
        RuntimeEvent::ReconnectScheduled { attempt, delay } => {
            format!("* reconnecting in {}s (attempt {attempt})", delay.as_secs())
        }
        RuntimeEvent::ReconnectExhausted { attempts } => {
            format!("* gave up after {attempts} attempts; type /reconnect to try again")
        }
        RuntimeEvent::TypingChanged {
            persona_id,
            is_typing: true,
        } => format!("  {persona_id} is typing..."),
        RuntimeEvent::TypingChanged { .. } => return None,
        RuntimeEvent::MessageDisplayed(message) => match message.sender {
            SenderKind::User => format!("you: {}", message.content),
            SenderKind::Persona => format!(
                "{}: {}",
                message.persona_id.as_deref().unwrap_or("?"),
                message.content
            ),
        },
        RuntimeEvent::MessageHeld { .. } => return None,
        RuntimeEvent::AllPersonasFinished => "* everyone has answered".to_owned(),
        RuntimeEvent::SpeakingChanged(Some(persona)) => format!("  [{persona} speaking]"),
        RuntimeEvent::SpeakingChanged(None) => return None,
        RuntimeEvent::AudioFailed {
            message_id, error, ..
        } => format!("* no audio for {message_id}: {error}"),
        RuntimeEvent::AutoplayBlocked { message_id, .. } => {
            format!("* audio ready, type /play {message_id}")
        }
        RuntimeEvent::ServerError { message } => format!("* server error: {message}"),
    };
    Some(text)
}
