//! Error taxonomy shared by every layer of the protocol.
//!
//! Callers do not distinguish sub-kinds of a crypto failure; the operation
//! name carried in [`ProtocolError::Crypto`] is for logs, not branching.

use thiserror::Error;

/// Every failure the protocol surfaces, from the wire up to the session.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("unknown packet type: {0}")]
    UnknownPacketType(String),

    #[error("crypto error during {operation}: {detail}")]
    Crypto { operation: &'static str, detail: String },

    #[error("auth state error: {0}")]
    AuthState(String),

    #[error("identifier already in use: {0}")]
    IdentifierConflict(String),

    #[error("connection timed out")]
    ConnectionTimeout,
}

impl ProtocolError {
    pub fn crypto(operation: &'static str, detail: impl std::fmt::Display) -> Self {
        ProtocolError::Crypto { operation, detail: detail.to_string() }
    }

    /// The application close code a server-side session should use when
    /// this error terminates a session. `None` means the error is
    /// surfaced to the caller but does not imply a close.
    pub fn close_code(&self) -> Option<u16> {
        match self {
            ProtocolError::Codec(_) | ProtocolError::UnknownPacketType(_) => Some(4000),
            ProtocolError::Crypto { .. } | ProtocolError::AuthState(_) => Some(4001),
            ProtocolError::IdentifierConflict(_) => Some(4002),
            ProtocolError::Transport(_) | ProtocolError::ConnectionTimeout => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
