//! # chorus-connection
//!
//! The push channel between a Chorus client and its session server.
//!
//! - [`manager::ConnectionManager`]: open/close/reconnect state machine with
//!   bounded exponential backoff, reporting [`manager::ConnectionEvent`]s
//! - [`dispatch::FrameDispatcher`]: routes each inbound envelope to exactly
//!   one [`dispatch::FrameHandler`] method
//! - [`transport::Transport`]: the socket seam; [`transport::WebSocketTransport`]
//!   is the `tokio-tungstenite` implementation
//! - [`testing::ScriptedTransport`]: in-memory transport for tests

#![deny(unsafe_code)]

pub mod dispatch;
pub mod manager;
pub mod testing;
pub mod transport;

pub use dispatch::{DispatchOutcome, FrameDispatcher, FrameHandler};
pub use manager::{ConnectionConfig, ConnectionEvent, ConnectionManager, ConnectionState};
pub use transport::{FrameSink, FrameStream, Transport, WebSocketTransport};
