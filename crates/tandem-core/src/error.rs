//! Error types for Tandem Core

use thiserror::Error;

/// Result type alias using Tandem Error
pub type Result<T> = std::result::Result<T, Error>;

/// Tandem error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("Unknown session: {0}")]
    UnknownSession(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Session {0} is already streaming")]
    AlreadyStreaming(String),

    #[error("Conversation {0} is already in use by another session mode")]
    InUseByOtherMode(String),

    #[error("Session state conflict: {0}")]
    StateConflict(String),

    #[error("No active streaming session for {0}")]
    NoActiveStream(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Shutdown timed out after {0} ms")]
    ShutdownTimeout(u64),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Operation cancelled")]
    Cancelled,
}

/// Coarse classification of an [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    StateConflict,
    Process,
    Protocol,
    ShutdownTimeout,
    Cancelled,
    Storage,
    Config,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownSession(_) | Self::InvalidMessage(_) => ErrorKind::Validation,
            Self::AlreadyStreaming(_)
            | Self::InUseByOtherMode(_)
            | Self::StateConflict(_)
            | Self::NoActiveStream(_) => ErrorKind::StateConflict,
            Self::Process(_) | Self::Io(_) => ErrorKind::Process,
            Self::Protocol(_) | Self::Serialization(_) => ErrorKind::Protocol,
            Self::ShutdownTimeout(_) => ErrorKind::ShutdownTimeout,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Storage(_) => ErrorKind::Storage,
            Self::Config(_) => ErrorKind::Config,
        }
    }

    /// Whether this error only reports that work was cancelled on purpose
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<tandem_process::TerminateError> for Error {
    fn from(e: tandem_process::TerminateError) -> Self {
        Self::Process(e.to_string())
    }
}
