//! Conversation model.
//!
//! A [`Session`] owns the displayed history: an append-only list of
//! [`ConversationMessage`]s with unique message ids.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{MessageId, PersonaId, SessionId};

/// Who sent a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderKind {
    /// The human participant.
    User,
    /// A simulated participant.
    Persona,
}

/// Reference to an uploaded file attached to a user message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    /// Where the upload can be fetched.
    pub url: String,
    /// Original file name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// MIME type, e.g. `image/png`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// One entry in the conversation history. Immutable once created.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMessage {
    /// Unique id.
    pub id: MessageId,
    /// Sender kind.
    pub sender: SenderKind,
    /// Sending persona, for persona messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona_id: Option<PersonaId>,
    /// Text content.
    pub content: String,
    /// When the message was produced.
    pub timestamp: DateTime<Utc>,
    /// Optional attachment (user messages only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
}

impl ConversationMessage {
    /// A message typed by the user, stamped now with a fresh id.
    pub fn from_user(content: impl Into<String>, attachment: Option<Attachment>) -> Self {
        Self {
            id: MessageId::new(),
            sender: SenderKind::User,
            persona_id: None,
            content: content.into(),
            timestamp: Utc::now(),
            attachment,
        }
    }

    /// A persona response. Falls back to the current time when the frame
    /// carried no usable timestamp.
    pub fn from_persona(
        id: MessageId,
        persona_id: PersonaId,
        content: impl Into<String>,
        timestamp: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id,
            sender: SenderKind::Persona,
            persona_id: Some(persona_id),
            content: content.into(),
            timestamp: timestamp.unwrap_or_else(Utc::now),
            attachment: None,
        }
    }

    /// Whether this message was sent by the given persona.
    #[must_use]
    pub fn is_from(&self, persona: &PersonaId) -> bool {
        self.persona_id.as_ref() == Some(persona)
    }
}

/// A conversation session: identity, active personas and displayed history.
#[derive(Clone, Debug)]
pub struct Session {
    /// Session id.
    pub id: SessionId,
    /// Personas taking part.
    pub persona_ids: Vec<PersonaId>,
    history: Vec<ConversationMessage>,
    seen: HashSet<MessageId>,
}

impl Session {
    /// Empty session.
    pub fn new(id: SessionId, persona_ids: Vec<PersonaId>) -> Self {
        Self {
            id,
            persona_ids,
            history: Vec::new(),
            seen: HashSet::new(),
        }
    }

    /// Session seeded with a previously loaded backlog. Duplicate ids in the
    /// backlog keep their first occurrence.
    pub fn with_backlog(
        id: SessionId,
        persona_ids: Vec<PersonaId>,
        backlog: impl IntoIterator<Item = ConversationMessage>,
    ) -> Self {
        let mut session = Self::new(id, persona_ids);
        for message in backlog {
            let _ = session.append(message);
        }
        session
    }

    /// Append a message. Returns `false` when a message with the same id is
    /// already in history.
    pub fn append(&mut self, message: ConversationMessage) -> bool {
        if !self.seen.insert(message.id.clone()) {
            return false;
        }
        self.history.push(message);
        true
    }

    /// Displayed history in order.
    #[must_use]
    pub fn history(&self) -> &[ConversationMessage] {
        &self.history
    }

    /// Whether a message id is already displayed.
    #[must_use]
    pub fn contains(&self, id: &MessageId) -> bool {
        self.seen.contains(id)
    }

    /// Number of displayed messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.history.len()
    }

    /// Whether no message has been displayed yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }
}
