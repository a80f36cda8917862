//! Connection manager: one persistent push channel per session.
//!
//! ```text
//! closed ──connect──▶ connecting ──opened──▶ open
//!   ▲                     │                    │
//!   │◀──timeout/error─────┘                    │
//!   │◀──────────────closed (unintended)────────┤
//!   │                                          │
//!   └──────────closing ◀──disconnect───────────┘
//! ```
//!
//! After an unintended close the supervisor waits
//! `min(base * 2^attempt, cap)` and goes back to `connecting`, until
//! `max_attempts` retries have been scheduled without a successful open.
//! The attempt counter resets on every open.
//!
//! Each `connect` spawns a supervisor task that exclusively owns the socket.
//! Outbound frames reach it through an unbounded channel that only exists
//! while the state is `open`, so `send` can answer `false` without touching
//! the socket.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chorus_core::{
    Attachment, ConnectionError, Envelope, MessageId, OutboundFrame, PersonaId,
    ProtocolError, ReconnectPolicy, SessionId,
};
use chorus_settings::ConnectionSettings;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::transport::{FrameSink, FrameStream, Transport};

// ─────────────────────────────────────────────────────────────────────────────
// Types
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle state of the push channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No channel, or waiting to retry.
    Closed,
    /// Handshake in progress.
    Connecting,
    /// Frames flow both ways.
    Open,
    /// Intentional shutdown in progress.
    Closing,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Closed => "closed",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
        })
    }
}

/// Connection parameters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Base endpoint; the session id becomes the last path segment.
    pub base_url: String,
    /// Time allowed for one open attempt. Independent of the backoff.
    pub connect_timeout: Duration,
    /// Retry limit and delay bounds.
    pub reconnect: ReconnectPolicy,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::from_settings(&ConnectionSettings::default())
    }
}

impl ConnectionConfig {
    /// Build from the `connection` settings section.
    pub fn from_settings(settings: &ConnectionSettings) -> Self {
        Self {
            base_url: settings.url.clone(),
            connect_timeout: settings.connect_timeout(),
            reconnect: settings.reconnect.clone(),
        }
    }

    /// Session-scoped endpoint: `{base_url}/{session_id}`.
    #[must_use]
    pub fn url_for(&self, session_id: &SessionId) -> String {
        format!("{}/{session_id}", self.base_url.trim_end_matches('/'))
    }
}

/// Everything the manager reports.
#[derive(Clone, Debug, PartialEq)]
pub enum ConnectionEvent {
    /// The state machine moved.
    StateChanged {
        /// Previous state.
        from: ConnectionState,
        /// New state.
        to: ConnectionState,
    },
    /// The channel opened for a session.
    Opened {
        /// Session the channel belongs to.
        session_id: SessionId,
    },
    /// A parsed inbound envelope, in arrival order.
    Frame(Envelope),
    /// Inbound text that is not a valid envelope. The channel stays open.
    Malformed(ProtocolError),
    /// The channel closed.
    Closed {
        /// `true` when caused by [`ConnectionManager::disconnect`].
        intentional: bool,
        /// Peer or transport reason, when known.
        reason: Option<String>,
    },
    /// An open attempt or an open channel failed.
    Error(ConnectionError),
    /// A retry will start after `delay`.
    ReconnectScheduled {
        /// One-based retry number.
        attempt: u32,
        /// Wait before the retry.
        delay: Duration,
    },
    /// Retries are used up; the manager stays closed.
    ReconnectExhausted {
        /// Retries made.
        attempts: u32,
    },
}

// ─────────────────────────────────────────────────────────────────────────────
// Manager
// ─────────────────────────────────────────────────────────────────────────────

struct Inner {
    config: ConnectionConfig,
    transport: Arc<dyn Transport>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    state: Mutex<ConnectionState>,
    session_id: Mutex<Option<SessionId>>,
    attempts: AtomicU32,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
}

impl Inner {
    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    fn set_state(&self, to: ConnectionState) {
        let from = std::mem::replace(&mut *self.state.lock(), to);
        if from != to {
            debug!(%from, %to, "connection state changed");
            self.emit(ConnectionEvent::StateChanged { from, to });
        }
    }
}

struct Supervisor {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns the push channel for one session at a time.
pub struct ConnectionManager {
    inner: Arc<Inner>,
    supervisor: Mutex<Option<Supervisor>>,
}

impl ConnectionManager {
    /// Create a manager and the receiver for its events.
    pub fn new(
        config: ConnectionConfig,
        transport: Arc<dyn Transport>,
    ) -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            config,
            transport,
            events,
            state: Mutex::new(ConnectionState::Closed),
            session_id: Mutex::new(None),
            attempts: AtomicU32::new(0),
            outbound: Mutex::new(None),
        });
        let manager = Self {
            inner,
            supervisor: Mutex::new(None),
        };
        (manager, rx)
    }

    /// Connect to a session, tearing down any existing channel first.
    ///
    /// Resolves once the first attempt opens or fails. A failed first attempt
    /// still counts as an unintended close, so a retry is scheduled when the
    /// policy allows one.
    pub async fn connect(&self, session_id: SessionId) -> Result<(), ConnectionError> {
        self.disconnect().await;

        *self.inner.session_id.lock() = Some(session_id.clone());
        self.inner.attempts.store(0, Ordering::SeqCst);

        let url = self.inner.config.url_for(&session_id);
        info!(%session_id, %url, "connecting");

        let cancel = CancellationToken::new();
        let (first_tx, first_rx) = oneshot::channel();
        let handle = tokio::spawn(run_supervisor(
            Arc::clone(&self.inner),
            url,
            session_id,
            cancel.clone(),
            first_tx,
        ));
        *self.supervisor.lock() = Some(Supervisor { cancel, handle });

        first_rx.await.unwrap_or(Err(ConnectionError::Disconnected))
    }

    /// Close the channel on purpose. Idempotent.
    ///
    /// Cancels any pending retry, sends a close frame when open and waits for
    /// the supervisor to exit. The state ends `closed`.
    pub async fn disconnect(&self) {
        let Some(supervisor) = self.supervisor.lock().take() else {
            return;
        };

        if self.inner.state() == ConnectionState::Open {
            self.inner.set_state(ConnectionState::Closing);
        }
        *self.inner.outbound.lock() = None;
        supervisor.cancel.cancel();
        if let Err(e) = supervisor.handle.await {
            warn!(error = %e, "connection supervisor ended abnormally");
        }

        self.inner.attempts.store(0, Ordering::SeqCst);
        self.inner.set_state(ConnectionState::Closed);
        self.inner.emit(ConnectionEvent::Closed {
            intentional: true,
            reason: None,
        });
        info!("disconnected");
    }

    /// Send a `user-message` frame. `false` when the channel is not open.
    pub fn send(
        &self,
        content: &str,
        direct_persona: Option<PersonaId>,
        attachment: Option<Attachment>,
    ) -> bool {
        self.send_frame(OutboundFrame::user_message(content, direct_persona, attachment))
    }

    /// Send an `audio-acknowledgment` frame. `false` when the channel is not open.
    pub fn send_acknowledgment(&self, message_id: MessageId, persona_id: PersonaId) -> bool {
        self.send_frame(OutboundFrame::audio_acknowledgment(message_id, persona_id))
    }

    fn send_frame(&self, frame: OutboundFrame) -> bool {
        let frame_type = frame.frame_type();
        let Some(session_id) = self.session_id() else {
            debug!(frame_type, "no session, dropping outbound frame");
            return false;
        };

        let outbound = self.inner.outbound.lock();
        let Some(tx) = outbound.as_ref() else {
            debug!(frame_type, state = %self.inner.state(), "not open, dropping outbound frame");
            return false;
        };

        let text = match frame.into_envelope(&session_id).and_then(|env| env.to_json()) {
            Ok(text) => text,
            Err(e) => {
                warn!(frame_type, error = %e, "failed to serialize outbound frame");
                return false;
            }
        };
        tx.send(text).is_ok()
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Session of the current (or last) connection.
    pub fn session_id(&self) -> Option<SessionId> {
        self.inner.session_id.lock().clone()
    }

    /// Retries scheduled since the last successful open.
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::SeqCst)
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(supervisor) = self.supervisor.get_mut().take() {
            supervisor.cancel.cancel();
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Supervisor task
// ─────────────────────────────────────────────────────────────────────────────

enum PumpEnd {
    Cancelled,
    Closed(Option<String>),
    Failed(ConnectionError),
}

async fn run_supervisor(
    inner: Arc<Inner>,
    url: String,
    session_id: SessionId,
    cancel: CancellationToken,
    first: oneshot::Sender<Result<(), ConnectionError>>,
) {
    let mut first = Some(first);
    let timeout = inner.config.connect_timeout;

    loop {
        inner.set_state(ConnectionState::Connecting);

        let opened = tokio::select! {
            () = cancel.cancelled() => return,
            result = tokio::time::timeout(timeout, inner.transport.open(&url)) => {
                result.unwrap_or(Err(ConnectionError::Timeout(timeout)))
            }
        };

        match opened {
            Ok((sink, stream)) => {
                inner.attempts.store(0, Ordering::SeqCst);
                let (out_tx, out_rx) = mpsc::unbounded_channel();
                *inner.outbound.lock() = Some(out_tx);
                inner.set_state(ConnectionState::Open);
                info!(%session_id, "connection open");
                inner.emit(ConnectionEvent::Opened {
                    session_id: session_id.clone(),
                });
                if let Some(tx) = first.take() {
                    let _ = tx.send(Ok(()));
                }

                let end = pump(&inner, sink, stream, out_rx, &cancel).await;
                *inner.outbound.lock() = None;

                match end {
                    PumpEnd::Cancelled => return,
                    PumpEnd::Closed(reason) => {
                        info!(%session_id, reason = reason.as_deref().unwrap_or(""), "connection closed by peer");
                        inner.set_state(ConnectionState::Closed);
                        inner.emit(ConnectionEvent::Closed {
                            intentional: false,
                            reason,
                        });
                    }
                    PumpEnd::Failed(err) => {
                        warn!(%session_id, error = %err, "connection failed");
                        inner.set_state(ConnectionState::Closed);
                        inner.emit(ConnectionEvent::Error(err.clone()));
                        inner.emit(ConnectionEvent::Closed {
                            intentional: false,
                            reason: Some(err.to_string()),
                        });
                    }
                }
            }
            Err(err) => {
                warn!(%session_id, error = %err, "connection attempt failed");
                inner.set_state(ConnectionState::Closed);
                inner.emit(ConnectionEvent::Error(err.clone()));
                if let Some(tx) = first.take() {
                    let _ = tx.send(Err(err.clone()));
                }
                if !err.is_retryable() {
                    return;
                }
            }
        }

        let attempt = inner.attempts.load(Ordering::SeqCst);
        if !inner.config.reconnect.allows(attempt) {
            warn!(%session_id, attempts = attempt, "reconnect attempts exhausted");
            inner.emit(ConnectionEvent::ReconnectExhausted { attempts: attempt });
            return;
        }

        let delay = inner.config.reconnect.delay_for(attempt);
        inner.attempts.store(attempt + 1, Ordering::SeqCst);
        info!(%session_id, attempt = attempt + 1, ?delay, "reconnect scheduled");
        inner.emit(ConnectionEvent::ReconnectScheduled {
            attempt: attempt + 1,
            delay,
        });

        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(delay) => {}
        }
    }
}

async fn pump(
    inner: &Inner,
    mut sink: FrameSink,
    mut stream: FrameStream,
    mut outbound: mpsc::UnboundedReceiver<String>,
    cancel: &CancellationToken,
) -> PumpEnd {
    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                if let Err(e) = sink.close().await {
                    debug!(error = %e, "close frame not delivered");
                }
                return PumpEnd::Cancelled;
            }
            Some(text) = outbound.recv() => {
                if let Err(e) = sink.send(text).await {
                    return PumpEnd::Failed(e);
                }
            }
            incoming = stream.next() => match incoming {
                Some(Ok(text)) => match Envelope::parse(&text) {
                    Ok(envelope) => {
                        debug!(frame_type = %envelope.frame_type, "frame received");
                        inner.emit(ConnectionEvent::Frame(envelope));
                    }
                    Err(e) => {
                        debug!(error = %e, "unparseable frame");
                        inner.emit(ConnectionEvent::Malformed(e));
                    }
                },
                Some(Err(ConnectionError::Closed(reason))) => return PumpEnd::Closed(Some(reason)),
                Some(Err(e)) => return PumpEnd::Failed(e),
                None => return PumpEnd::Closed(None),
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
