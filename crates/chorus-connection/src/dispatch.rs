//! Inbound frame dispatch.
//!
//! [`FrameDispatcher::dispatch`] decodes one envelope and calls exactly one
//! [`FrameHandler`] method with the typed payload. Unknown types and
//! malformed payloads are logged, counted and dropped; the next frame is
//! handled normally.

use std::sync::atomic::{AtomicU64, Ordering};

use chorus_core::wire::{
    AudioErrorPayload, AudioPayload, ErrorPayload, ResponsePayload, TypingPayload,
};
use chorus_core::{Envelope, InboundFrame, ProtocolError};
use serde_json::Value;
use tracing::{debug, warn};

/// Receives decoded server frames. One method per frame type.
pub trait FrameHandler {
    /// `connection-established`.
    fn on_connection_established(&mut self, info: Value);
    /// `persona-typing`.
    fn on_persona_typing(&mut self, payload: TypingPayload);
    /// `persona-response`. The payload timestamp falls back to the envelope's.
    fn on_persona_response(&mut self, payload: ResponsePayload);
    /// `all-personas-finished`.
    fn on_all_personas_finished(&mut self);
    /// `persona-audio`.
    fn on_persona_audio(&mut self, payload: AudioPayload);
    /// `audio-error`.
    fn on_audio_error(&mut self, payload: AudioErrorPayload);
    /// `error`.
    fn on_error(&mut self, payload: ErrorPayload);
}

/// Result of dispatching one envelope.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A handler method ran for this frame type.
    Handled(&'static str),
    /// The frame was dropped.
    Dropped(ProtocolError),
}

/// Routes envelopes to a [`FrameHandler`] and keeps counters.
#[derive(Debug, Default)]
pub struct FrameDispatcher {
    dispatched: AtomicU64,
    dropped: AtomicU64,
}

impl FrameDispatcher {
    /// New dispatcher with zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode `envelope` and invoke the matching handler method.
    pub fn dispatch<H: FrameHandler + ?Sized>(
        &self,
        envelope: &Envelope,
        handler: &mut H,
    ) -> DispatchOutcome {
        let frame = match InboundFrame::from_envelope(envelope) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(frame_type = %envelope.frame_type, error = %err, "dropping frame");
                let _ = self.dropped.fetch_add(1, Ordering::Relaxed);
                return DispatchOutcome::Dropped(err);
            }
        };

        let frame_type = frame.frame_type();
        debug!(frame_type, "dispatching frame");

        match frame {
            InboundFrame::ConnectionEstablished(info) => handler.on_connection_established(info),
            InboundFrame::PersonaTyping(p) => handler.on_persona_typing(p),
            InboundFrame::PersonaResponse(mut p) => {
                if p.timestamp.is_none() {
                    p.timestamp.clone_from(&envelope.timestamp);
                }
                handler.on_persona_response(p);
            }
            InboundFrame::AllPersonasFinished => handler.on_all_personas_finished(),
            InboundFrame::PersonaAudio(p) => handler.on_persona_audio(p),
            InboundFrame::AudioError(p) => handler.on_audio_error(p),
            InboundFrame::Error(p) => handler.on_error(p),
        }

        let _ = self.dispatched.fetch_add(1, Ordering::Relaxed);
        DispatchOutcome::Handled(frame_type)
    }

    /// Count inbound text that never became an envelope.
    pub fn record_malformed(&self, error: &ProtocolError) {
        warn!(error = %error, "dropping unparseable frame");
        let _ = self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Frames handed to a handler so far.
    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    /// Frames dropped so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
