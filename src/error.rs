//! Error types for migration sessions.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, MigrationError>;

#[derive(Debug, Error)]
pub enum MigrationError {
    /// Malformed or unsupported migration header.
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    /// Channel dial, send or receive failure (including timeouts and
    /// disconnects observed mid-transfer).
    #[error("Transport error: {0}")]
    Transport(String),

    /// Unknown, expired or already consumed secret.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Mount, create or stream failure inside a storage driver.
    #[error("{target}: {message}")]
    Backend { target: String, message: String },

    /// Bad input detected before any network I/O.
    #[error("{0}")]
    Validation(String),

    /// The operation was cancelled while the session was in flight.
    #[error("Migration cancelled")]
    Cancelled,

    /// The peer closed the session with a failure control message.
    #[error("{0}")]
    Remote(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Negotiation,
    Transport,
    Auth,
    Backend,
    Validation,
    Cancelled,
    Remote,
}

impl MigrationError {
    /// Wrap a driver failure, annotated with the affected volume or snapshot.
    ///
    /// Transport and cancellation errors that bubbled up through the driver
    /// keep their original kind.
    pub fn backend(target: impl Into<String>, err: anyhow::Error) -> Self {
        match err.downcast::<MigrationError>() {
            Ok(inner) => inner,
            Err(err) => Self::Backend {
                target: target.into(),
                message: format!("{:#}", err),
            },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Negotiation(_) => ErrorKind::Negotiation,
            Self::Transport(_) => ErrorKind::Transport,
            Self::Auth(_) => ErrorKind::Auth,
            Self::Backend { .. } => ErrorKind::Backend,
            Self::Validation(_) => ErrorKind::Validation,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Remote(_) => ErrorKind::Remote,
        }
    }
}

impl From<std::io::Error> for MigrationError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}
