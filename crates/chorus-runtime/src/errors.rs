//! Runtime error types.

use chorus_core::{AudioError, ConnectionError};

/// Errors that can occur while starting or driving a session runtime.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// The push channel cannot be established for this session.
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// An audio collaborator could not be built.
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    /// The runtime was already shut down.
    #[error("Runtime shut down")]
    ShutDown,
}

impl RuntimeError {
    /// Whether starting again with the same inputs might succeed.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Connection(e) => e.is_retryable(),
            Self::Audio(_) | Self::ShutDown => false,
        }
    }

    /// Error category string for display and logging.
    pub fn category(&self) -> &str {
        match self {
            Self::Connection(_) => "connection",
            Self::Audio(_) => "audio",
            Self::ShutDown => "shut_down",
        }
    }
}

/// Result alias for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;
