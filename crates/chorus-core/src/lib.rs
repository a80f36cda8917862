//! # chorus-core
//!
//! Foundation types shared by every Chorus crate.
//!
//! - **Branded IDs**: `SessionId`, `MessageId`, `PersonaId` newtypes
//! - **Conversation model**: [`messages::ConversationMessage`] and the
//!   append-only [`messages::Session`]
//! - **Wire format**: the `{type, sessionId, timestamp, data}` envelope plus
//!   typed inbound and outbound frames
//! - **Errors**: connection, protocol and audio error taxonomies via `thiserror`
//! - **Backoff**: reconnect policy and delay math
//! - **Logging**: `tracing` subscriber setup and test capture helpers

#![deny(unsafe_code)]

pub mod backoff;
pub mod errors;
pub mod ids;
pub mod logging;
pub mod messages;
pub mod wire;

pub use backoff::{ReconnectPolicy, calculate_backoff_delay};
pub use errors::{AudioError, ConnectionError, ProtocolError};
pub use ids::{MessageId, PersonaId, SessionId};
pub use messages::{Attachment, ConversationMessage, SenderKind, Session};
pub use wire::{Envelope, InboundFrame, OutboundFrame, Timestamp};
