//! Scripted in-memory transport for tests.
//!
//! Each call to [`Transport::open`] consumes the next scripted step. An
//! accepted step hands the test a [`ServerEnd`] that can push frames to the
//! client and read what the client sent.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use chorus_core::{ConnectionError, Envelope};
use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;

use crate::transport::{FrameSink, FrameStream, Transport};

enum Step {
    Fail(ConnectionError),
    Hang,
    Open(FrameSink, FrameStream),
}

/// Server side of an accepted scripted connection.
pub struct ServerEnd {
    to_client: mpsc::UnboundedSender<Result<String, ConnectionError>>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl ServerEnd {
    /// Deliver a raw text frame to the client.
    pub fn push(&self, text: &str) -> bool {
        self.to_client.unbounded_send(Ok(text.to_owned())).is_ok()
    }

    /// Deliver an envelope to the client.
    pub fn push_envelope(&self, envelope: &Envelope) -> bool {
        envelope.to_json().is_ok_and(|text| self.push(&text))
    }

    /// Inject a transport fault; the client sees the channel fail.
    pub fn fail(&self, err: ConnectionError) -> bool {
        self.to_client.unbounded_send(Err(err)).is_ok()
    }

    /// Close from the server side with a reason.
    pub fn close(self, reason: &str) {
        let _ = self
            .to_client
            .unbounded_send(Err(ConnectionError::Closed(reason.to_owned())));
    }

    /// Next frame the client sent, waiting for it.
    pub async fn next_sent(&mut self) -> Option<String> {
        self.from_client.next().await
    }

    /// Every frame the client has sent so far, without waiting.
    pub fn drain_sent(&mut self) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(Some(text)) = self.from_client.try_next() {
            out.push(text);
        }
        out
    }
}

/// Transport that replays scripted open outcomes in order.
///
/// When the script runs out, opens fail with a transport error.
#[derive(Default)]
pub struct ScriptedTransport {
    steps: Mutex<VecDeque<Step>>,
    urls: Mutex<Vec<String>>,
}

impl ScriptedTransport {
    /// Empty script.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Next open fails with `err`.
    pub fn fail(&self, err: ConnectionError) {
        self.steps.lock().push_back(Step::Fail(err));
    }

    /// Next open never completes (exercises the connect timeout).
    pub fn hang(&self) {
        self.steps.lock().push_back(Step::Hang);
    }

    /// Next open succeeds; returns the server side of that connection.
    pub fn accept(&self) -> ServerEnd {
        let (to_client, client_rx) = mpsc::unbounded();
        let (client_tx, from_client) = mpsc::unbounded::<String>();

        let sink: FrameSink = Box::pin(
            client_tx.sink_map_err(|e| ConnectionError::Transport(e.to_string())),
        );
        let stream: FrameStream = Box::pin(client_rx);
        self.steps.lock().push_back(Step::Open(sink, stream));

        ServerEnd {
            to_client,
            from_client,
        }
    }

    /// Number of open attempts made so far.
    pub fn open_count(&self) -> usize {
        self.urls.lock().len()
    }

    /// URLs passed to each open attempt.
    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn open(&self, url: &str) -> Result<(FrameSink, FrameStream), ConnectionError> {
        self.urls.lock().push(url.to_owned());
        let step = self.steps.lock().pop_front();
        match step {
            Some(Step::Open(sink, stream)) => Ok((sink, stream)),
            Some(Step::Fail(err)) => Err(err),
            Some(Step::Hang) => futures::future::pending().await,
            None => Err(ConnectionError::Transport("script exhausted".into())),
        }
    }
}
