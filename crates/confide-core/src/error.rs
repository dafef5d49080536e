//! Relay error taxonomy.
//!
//! Every error is reported to the originating connection only, as an
//! `error{type, message}` event, except [`RelayError::Unavailable`] which is
//! a normal outcome of a call request and surfaces as `call-failed`.

use confide_protocol::ServerEvent;
use thiserror::Error;

/// Errors produced while handling a peer's request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    /// Malformed `register` payload.
    #[error("Invalid registration: {0}")]
    InvalidRegistration(&'static str),

    /// Role-restricted operation attempted by the wrong role.
    #[error("Not authorized: only confidants may {0}")]
    NotAuthorized(&'static str),

    /// Referenced peer is not registered.
    #[error("Peer not found: {0}")]
    NotFound(String),

    /// The acting connection has no registered peer.
    #[error("Connection is not registered")]
    UnknownSender,

    /// Call target exists but cannot take calls right now.
    #[error("Peer unavailable: {0}")]
    Unavailable(String),
}

impl RelayError {
    /// Machine-readable error type carried on the wire.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::InvalidRegistration(_) => "invalid-registration",
            RelayError::NotAuthorized(_) => "not-authorized",
            RelayError::NotFound(_) => "not-found",
            RelayError::UnknownSender => "unknown-sender",
            RelayError::Unavailable(_) => "unavailable",
        }
    }

    /// The event reported back to the originating connection.
    #[must_use]
    pub fn to_event(&self) -> ServerEvent {
        match self {
            RelayError::Unavailable(_) => ServerEvent::call_unavailable(),
            other => ServerEvent::error(other.kind(), other.to_string()),
        }
    }
}
