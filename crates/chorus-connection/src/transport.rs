//! Socket seam.
//!
//! The manager only sees text frames: a [`FrameSink`] for outbound JSON and
//! a [`FrameStream`] for inbound JSON. A peer close surfaces as
//! `Err(ConnectionError::Closed)` followed by the end of the stream.

use std::pin::Pin;

use async_trait::async_trait;
use chorus_core::ConnectionError;
use futures::{Sink, SinkExt, Stream, StreamExt, future};
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::trace;

/// Outbound half of an open channel.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = ConnectionError> + Send>>;

/// Inbound half of an open channel.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, ConnectionError>> + Send>>;

/// Opens a bidirectional text channel to a URL.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a channel. Resolves once the handshake completes.
    async fn open(&self, url: &str) -> Result<(FrameSink, FrameStream), ConnectionError>;
}

/// WebSocket transport backed by `tokio-tungstenite`.
///
/// Ping/pong is answered by tungstenite; binary frames are ignored.
#[derive(Clone, Copy, Debug, Default)]
pub struct WebSocketTransport;

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, url: &str) -> Result<(FrameSink, FrameStream), ConnectionError> {
        let (ws, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(map_ws_error)?;
        let (write, read) = ws.split();

        let sink = write
            .with(|text: String| future::ok::<_, tungstenite::Error>(Message::Text(text.into())))
            .sink_map_err(map_ws_error);

        let stream = read.filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
                Ok(Message::Close(frame)) => {
                    let reason = frame
                        .map(|f| format!("{} {}", u16::from(f.code), f.reason.as_str()))
                        .unwrap_or_else(|| "no close frame".to_string());
                    Some(Err(ConnectionError::Closed(reason)))
                }
                Ok(_) => {
                    trace!("ignoring non-text frame");
                    None
                }
                Err(e) => Some(Err(map_ws_error(e))),
            })
        });

        Ok((Box::pin(sink), Box::pin(stream)))
    }
}

fn map_ws_error(err: tungstenite::Error) -> ConnectionError {
    match err {
        tungstenite::Error::Url(e) => ConnectionError::InvalidUrl(e.to_string()),
        tungstenite::Error::HttpFormat(e) => ConnectionError::InvalidUrl(e.to_string()),
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            ConnectionError::Closed("socket already closed".into())
        }
        other => ConnectionError::Transport(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn invalid_url_is_reported() {
        let result = WebSocketTransport.open("http://localhost/ws/s").await;
        assert_matches!(result.map(|_| ()), Err(ConnectionError::InvalidUrl(_)));
    }

    #[tokio::test]
    async fn refused_connection_is_transport_error() {
        // Port 1 on loopback is never listening in test environments.
        let result = WebSocketTransport.open("ws://127.0.0.1:1/ws/s").await;
        assert_matches!(result.map(|_| ()), Err(ConnectionError::Transport(_)));
    }

    #[test]
    fn closed_errors_map_to_closed() {
        assert_matches!(
            map_ws_error(tungstenite::Error::ConnectionClosed),
            ConnectionError::Closed(_)
        );
    }
}
