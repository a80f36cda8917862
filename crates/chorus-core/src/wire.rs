//! Push-channel wire format.
//!
//! Every frame in either direction is an [`Envelope`]:
//!
//! ```json
//! { "type": "persona-response", "sessionId": "sess_1", "timestamp": 1736935200000, "data": {...} }
//! ```
//!
//! [`InboundFrame`] is the typed view of a server frame; [`OutboundFrame`]
//! covers the two client frames. Payload field names are camelCase.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ProtocolError;
use crate::ids::{MessageId, PersonaId};
use crate::messages::Attachment;

/// Frame type strings used on the wire.
pub mod frame_types {
    /// Server greeting after the channel opens.
    pub const CONNECTION_ESTABLISHED: &str = "connection-established";
    /// A persona started or stopped composing.
    pub const PERSONA_TYPING: &str = "persona-typing";
    /// A persona's text response.
    pub const PERSONA_RESPONSE: &str = "persona-response";
    /// Every persona finished responding to the last user message.
    pub const ALL_PERSONAS_FINISHED: &str = "all-personas-finished";
    /// Synthesized audio for a persona response.
    pub const PERSONA_AUDIO: &str = "persona-audio";
    /// Audio synthesis failed server-side.
    pub const AUDIO_ERROR: &str = "audio-error";
    /// Generic server error.
    pub const ERROR: &str = "error";
    /// Client → server user message.
    pub const USER_MESSAGE: &str = "user-message";
    /// Client → server notice that a persona's audio finished playing.
    pub const AUDIO_ACKNOWLEDGMENT: &str = "audio-acknowledgment";
}

// ─────────────────────────────────────────────────────────────────────────────
// Envelope
// ─────────────────────────────────────────────────────────────────────────────

/// Frame timestamp. The server sends epoch milliseconds, integral or
/// fractional; ISO strings are accepted too.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Timestamp {
    /// Milliseconds since the Unix epoch.
    Millis(i64),
    /// Fractional milliseconds since the Unix epoch.
    FractionalMillis(f64),
    /// RFC 3339 string.
    Text(String),
}

impl Timestamp {
    /// Current time as epoch milliseconds.
    #[must_use]
    pub fn now() -> Self {
        Self::Millis(Utc::now().timestamp_millis())
    }

    /// Convert to a UTC datetime, if the value is representable.
    #[must_use]
    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Millis(ms) => DateTime::from_timestamp_millis(*ms),
            Self::FractionalMillis(ms) if ms.is_finite() => {
                #[allow(clippy::cast_possible_truncation)]
                let micros = (ms * 1000.0).trunc() as i64;
                DateTime::from_timestamp_micros(micros)
            }
            Self::FractionalMillis(_) => None,
            Self::Text(s) => DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| dt.with_timezone(&Utc)),
        }
    }
}

/// Envelope wrapping every frame on the push channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Frame type (see [`frame_types`]).
    #[serde(rename = "type")]
    pub frame_type: String,
    /// Owning session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// When the frame was produced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Timestamp>,
    /// Payload; shape depends on `frame_type`.
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    /// Build an envelope stamped with the current time.
    pub fn new(frame_type: impl Into<String>, session_id: Option<String>, data: Value) -> Self {
        Self {
            frame_type: frame_type.into(),
            session_id,
            timestamp: Some(Timestamp::now()),
            data,
        }
    }

    /// Parse a raw text frame.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::InvalidJson(e.to_string()))
    }

    /// Serialize to the JSON text sent on the wire.
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::InvalidJson(e.to_string()))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Inbound payloads
// ─────────────────────────────────────────────────────────────────────────────

/// Payload of `persona-typing`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    /// Persona whose typing state changed.
    pub persona_id: PersonaId,
    /// Whether the persona is composing.
    pub is_typing: bool,
}

/// Payload of `persona-response`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponsePayload {
    /// Message id, shared with the matching audio frame.
    pub message_id: MessageId,
    /// Responding persona.
    pub persona_id: PersonaId,
    /// Response text.
    pub content: String,
    /// When the persona produced the response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Timestamp>,
}

/// Payload of `persona-audio`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioPayload {
    /// Message the audio belongs to.
    pub message_id: MessageId,
    /// Speaking persona.
    pub persona_id: PersonaId,
    /// Resource reference for the synthesized audio.
    pub audio_url: String,
    /// Voice used for synthesis.
    #[serde(default)]
    pub voice_id: String,
    /// Duration in seconds, when the server knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
}

/// Payload of `audio-error`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioErrorPayload {
    /// Message whose audio failed.
    pub message_id: MessageId,
    /// Persona whose audio failed.
    pub persona_id: PersonaId,
    /// Server-side error description.
    pub error: String,
    /// When the failure happened.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Timestamp>,
}

/// Payload of `error`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Human-readable description.
    pub message: String,
}

/// Typed view of a server frame.
#[derive(Clone, Debug, PartialEq)]
pub enum InboundFrame {
    /// `connection-established`, with the server's session/context info.
    ConnectionEstablished(Value),
    /// `persona-typing`.
    PersonaTyping(TypingPayload),
    /// `persona-response`.
    PersonaResponse(ResponsePayload),
    /// `all-personas-finished`.
    AllPersonasFinished,
    /// `persona-audio`.
    PersonaAudio(AudioPayload),
    /// `audio-error`.
    AudioError(AudioErrorPayload),
    /// `error`.
    Error(ErrorPayload),
}

impl InboundFrame {
    /// Decode an envelope into a typed frame.
    ///
    /// Unknown types yield [`ProtocolError::UnknownType`]; a recognized type
    /// with a payload of the wrong shape yields [`ProtocolError::InvalidPayload`].
    pub fn from_envelope(envelope: &Envelope) -> Result<Self, ProtocolError> {
        use frame_types as ft;

        let frame_type = envelope.frame_type.as_str();
        match frame_type {
            ft::CONNECTION_ESTABLISHED => Ok(Self::ConnectionEstablished(envelope.data.clone())),
            ft::PERSONA_TYPING => decode(envelope).map(Self::PersonaTyping),
            ft::PERSONA_RESPONSE => decode(envelope).map(Self::PersonaResponse),
            ft::ALL_PERSONAS_FINISHED => Ok(Self::AllPersonasFinished),
            ft::PERSONA_AUDIO => decode(envelope).map(Self::PersonaAudio),
            ft::AUDIO_ERROR => decode(envelope).map(Self::AudioError),
            ft::ERROR => decode(envelope).map(Self::Error),
            other => Err(ProtocolError::UnknownType(other.to_owned())),
        }
    }

    /// Wire type string of this frame.
    #[must_use]
    pub fn frame_type(&self) -> &'static str {
        use frame_types as ft;

        match self {
            Self::ConnectionEstablished(_) => ft::CONNECTION_ESTABLISHED,
            Self::PersonaTyping(_) => ft::PERSONA_TYPING,
            Self::PersonaResponse(_) => ft::PERSONA_RESPONSE,
            Self::AllPersonasFinished => ft::ALL_PERSONAS_FINISHED,
            Self::PersonaAudio(_) => ft::PERSONA_AUDIO,
            Self::AudioError(_) => ft::AUDIO_ERROR,
            Self::Error(_) => ft::ERROR,
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(envelope: &Envelope) -> Result<T, ProtocolError> {
    serde_json::from_value(envelope.data.clone()).map_err(|e| ProtocolError::InvalidPayload {
        frame_type: envelope.frame_type.clone(),
        message: e.to_string(),
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Outbound frames
// ─────────────────────────────────────────────────────────────────────────────

/// Payload of `user-message`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserMessagePayload {
    /// Message text.
    pub content: String,
    /// Persona the question is addressed to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direct_question_persona_id: Option<PersonaId>,
    /// Previously uploaded image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_attachment: Option<Attachment>,
}

/// Payload of `audio-acknowledgment`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioAckPayload {
    /// Message whose audio finished.
    pub message_id: MessageId,
    /// Persona whose audio finished.
    pub persona_id: PersonaId,
    /// Always `true`; the server only listens for completion.
    pub finished: bool,
    /// Epoch milliseconds at completion.
    pub timestamp: i64,
}

/// Frames the client sends.
#[derive(Clone, Debug, PartialEq)]
pub enum OutboundFrame {
    /// `user-message`.
    UserMessage(UserMessagePayload),
    /// `audio-acknowledgment`.
    AudioAcknowledgment(AudioAckPayload),
}

impl OutboundFrame {
    /// Build a `user-message` frame.
    pub fn user_message(
        content: impl Into<String>,
        direct_persona: Option<PersonaId>,
        attachment: Option<Attachment>,
    ) -> Self {
        Self::UserMessage(UserMessagePayload {
            content: content.into(),
            direct_question_persona_id: direct_persona,
            image_attachment: attachment,
        })
    }

    /// Build an `audio-acknowledgment` frame stamped now.
    pub fn audio_acknowledgment(message_id: MessageId, persona_id: PersonaId) -> Self {
        Self::AudioAcknowledgment(AudioAckPayload {
            message_id,
            persona_id,
            finished: true,
            timestamp: Utc::now().timestamp_millis(),
        })
    }

    /// Wire type string of this frame.
    #[must_use]
    pub fn frame_type(&self) -> &'static str {
        match self {
            Self::UserMessage(_) => frame_types::USER_MESSAGE,
            Self::AudioAcknowledgment(_) => frame_types::AUDIO_ACKNOWLEDGMENT,
        }
    }

    /// Wrap into an envelope for the given session.
    pub fn into_envelope(self, session_id: &str) -> Result<Envelope, ProtocolError> {
        let frame_type = self.frame_type();
        let data = match self {
            Self::UserMessage(p) => serde_json::to_value(p),
            Self::AudioAcknowledgment(p) => serde_json::to_value(p),
        }
        .map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
        Ok(Envelope::new(frame_type, Some(session_id.to_owned()), data))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn envelope(frame_type: &str, data: Value) -> Envelope {
        Envelope {
            frame_type: frame_type.into(),
            session_id: Some("sess_1".into()),
            timestamp: Some(Timestamp::Millis(1_736_935_200_000)),
            data,
        }
    }

    // ── Envelope ─────────────────────────────────────────────────────

    #[test]
    fn parse_envelope_with_numeric_timestamp() {
        let env = Envelope::parse(
            r#"{"type":"persona-typing","sessionId":"s1","timestamp":1736935200000,"data":{"personaId":"a","isTyping":true}}"#,
        )
        .unwrap();
        assert_eq!(env.frame_type, "persona-typing");
        assert_eq!(env.session_id.as_deref(), Some("s1"));
        assert_eq!(env.timestamp, Some(Timestamp::Millis(1_736_935_200_000)));
    }

    #[test]
    fn parse_envelope_with_string_timestamp_and_missing_data() {
        let env =
            Envelope::parse(r#"{"type":"all-personas-finished","timestamp":"2025-01-15T10:00:00Z"}"#)
                .unwrap();
        assert_eq!(env.timestamp, Some(Timestamp::Text("2025-01-15T10:00:00Z".into())));
        assert!(env.data.is_null());
        assert!(env.session_id.is_none());
    }

    #[test]
    fn parse_invalid_json_is_protocol_error() {
        assert_matches!(Envelope::parse("not json"), Err(ProtocolError::InvalidJson(_)));
        assert_matches!(Envelope::parse(r#"{"data":{}}"#), Err(ProtocolError::InvalidJson(_)));
    }

    #[test]
    fn envelope_json_field_names() {
        let env = envelope("error", json!({"message": "boom"}));
        let val: Value = serde_json::from_str(&env.to_json().unwrap()).unwrap();
        assert_eq!(val["type"], "error");
        assert_eq!(val["sessionId"], "sess_1");
        assert_eq!(val["timestamp"], 1_736_935_200_000_i64);
        assert_eq!(val["data"]["message"], "boom");
    }

    #[test]
    fn timestamp_to_datetime() {
        let ms = Timestamp::Millis(0).to_datetime().unwrap();
        assert_eq!(ms.timestamp(), 0);
        let text = Timestamp::Text("2025-01-15T10:00:00Z".into()).to_datetime().unwrap();
        assert_eq!(text.timestamp(), 1_736_935_200);
        assert!(Timestamp::Text("yesterday".into()).to_datetime().is_none());
    }

    #[test]
    fn parse_envelope_with_fractional_timestamp() {
        let env = Envelope::parse(
            r#"{"type":"persona-response","timestamp":1736935200000.5,"data":{"messageId":"m1","personaId":"a","content":"hi","timestamp":1736935200001.25}}"#,
        )
        .unwrap();
        assert_eq!(env.timestamp, Some(Timestamp::FractionalMillis(1_736_935_200_000.5)));
        let dt = env.timestamp.unwrap().to_datetime().unwrap();
        assert_eq!(dt.timestamp_micros(), 1_736_935_200_000_500);

        let frame = InboundFrame::from_envelope(&Envelope::parse(
            r#"{"type":"persona-response","data":{"messageId":"m1","personaId":"a","content":"hi","timestamp":1736935200001.25}}"#,
        ).unwrap())
        .unwrap();
        assert_matches!(frame, InboundFrame::PersonaResponse(p) if p.timestamp == Some(Timestamp::FractionalMillis(1_736_935_200_001.25)));
        assert!(Timestamp::FractionalMillis(f64::NAN).to_datetime().is_none());
    }

    // ── InboundFrame ─────────────────────────────────────────────────

    #[test]
    fn decode_every_inbound_type() {
        let cases = [
            envelope("connection-established", json!({"sessionId": "sess_1"})),
            envelope("persona-typing", json!({"personaId": "a", "isTyping": false})),
            envelope(
                "persona-response",
                json!({"messageId": "m1", "personaId": "a", "content": "hi", "timestamp": 5}),
            ),
            envelope("all-personas-finished", json!({})),
            envelope(
                "persona-audio",
                json!({"messageId": "m1", "personaId": "a", "audioUrl": "/audio/m1.mp3", "voiceId": "v1"}),
            ),
            envelope(
                "audio-error",
                json!({"messageId": "m1", "personaId": "a", "error": "tts down", "timestamp": 5}),
            ),
            envelope("error", json!({"message": "boom"})),
        ];
        for env in &cases {
            let frame = InboundFrame::from_envelope(env).unwrap();
            assert_eq!(frame.frame_type(), env.frame_type);
        }
    }

    #[test]
    fn decode_audio_payload_fields() {
        let env = envelope(
            "persona-audio",
            json!({"messageId": "m1", "personaId": "a", "audioUrl": "/a.mp3", "voiceId": "v", "duration": 2.5}),
        );
        let frame = InboundFrame::from_envelope(&env).unwrap();
        assert_matches!(frame, InboundFrame::PersonaAudio(p) => {
            assert_eq!(p.message_id.as_str(), "m1");
            assert_eq!(p.audio_url, "/a.mp3");
            assert_eq!(p.duration, Some(2.5));
        });
    }

    #[test]
    fn unknown_type_is_rejected() {
        let env = envelope("persona-dancing", json!({}));
        assert_matches!(
            InboundFrame::from_envelope(&env),
            Err(ProtocolError::UnknownType(t)) if t == "persona-dancing"
        );
    }

    #[test]
    fn malformed_payload_is_rejected() {
        let env = envelope("persona-typing", json!({"personaId": 7}));
        assert_matches!(
            InboundFrame::from_envelope(&env),
            Err(ProtocolError::InvalidPayload { frame_type, .. }) if frame_type == "persona-typing"
        );
    }

    // ── OutboundFrame ────────────────────────────────────────────────

    #[test]
    fn user_message_envelope_omits_absent_fields() {
        let env = OutboundFrame::user_message("hello", None, None)
            .into_envelope("sess_9")
            .unwrap();
        assert_eq!(env.frame_type, "user-message");
        assert_eq!(env.session_id.as_deref(), Some("sess_9"));
        assert_eq!(env.data, json!({"content": "hello"}));
    }

    #[test]
    fn user_message_with_direct_persona_and_attachment() {
        let attachment = Attachment {
            url: "/uploads/cat.png".into(),
            name: Some("cat.png".into()),
            mime_type: Some("image/png".into()),
        };
        let env = OutboundFrame::user_message("look", Some(PersonaId::from("b")), Some(attachment))
            .into_envelope("s")
            .unwrap();
        assert_eq!(env.data["directQuestionPersonaId"], "b");
        assert_eq!(env.data["imageAttachment"]["url"], "/uploads/cat.png");
        assert_eq!(env.data["imageAttachment"]["mimeType"], "image/png");
    }

    #[test]
    fn acknowledgment_envelope_shape() {
        let env = OutboundFrame::audio_acknowledgment(MessageId::from("m1"), PersonaId::from("a"))
            .into_envelope("s")
            .unwrap();
        assert_eq!(env.frame_type, "audio-acknowledgment");
        assert_eq!(env.data["messageId"], "m1");
        assert_eq!(env.data["personaId"], "a");
        assert_eq!(env.data["finished"], true);
        assert!(env.data["timestamp"].is_i64());
    }
}
