//! Outbound delivery to connected peers.
//!
//! The relay never touches sockets. It hands events to an [`EventSink`],
//! keyed by connection. [`ConnectionHub`] is the default sink: each attached
//! connection owns the receiving half of an unbounded channel, drained by
//! whatever task writes to the socket.

use confide_protocol::ServerEvent;
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

/// Unique identifier for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Create a new connection ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random connection ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("conn_{}", uuid::Uuid::new_v4().simple()))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Delivery errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// No such connection is attached.
    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    /// The connection's writer has gone away.
    #[error("Connection closed: {0}")]
    Closed(ConnectionId),
}

/// Destination for outbound events.
///
/// Implementations must not block; a slow or dead connection must never
/// stall delivery to others.
pub trait EventSink: Send + Sync {
    /// Deliver an event to a single connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is unknown or closed.
    fn deliver(
        &self,
        connection_id: &ConnectionId,
        event: Arc<ServerEvent>,
    ) -> Result<(), DeliveryError>;
}

/// Receiving half handed to a connection's writer.
pub type EventReceiver = mpsc::UnboundedReceiver<Arc<ServerEvent>>;

/// In-process sink backed by one unbounded channel per connection.
#[derive(Debug, Default)]
pub struct ConnectionHub {
    senders: DashMap<ConnectionId, mpsc::UnboundedSender<Arc<ServerEvent>>>,
}

impl ConnectionHub {
    /// Create an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a connection, returning the receiver its writer should drain.
    ///
    /// Attaching an ID twice replaces the previous channel.
    pub fn attach(&self, connection_id: ConnectionId) -> EventReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        debug!(connection = %connection_id, "Connection attached");
        self.senders.insert(connection_id, tx);
        rx
    }

    /// Detach a connection. Returns `true` if it was attached.
    pub fn detach(&self, connection_id: &ConnectionId) -> bool {
        let removed = self.senders.remove(connection_id).is_some();
        if removed {
            debug!(connection = %connection_id, "Connection detached");
        }
        removed
    }

    /// Check if a connection is attached.
    #[must_use]
    pub fn is_attached(&self, connection_id: &ConnectionId) -> bool {
        self.senders.contains_key(connection_id)
    }

    /// Number of attached connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.senders.len()
    }

    /// Check if no connection is attached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }
}

impl EventSink for ConnectionHub {
    fn deliver(
        &self,
        connection_id: &ConnectionId,
        event: Arc<ServerEvent>,
    ) -> Result<(), DeliveryError> {
        let sender = self
            .senders
            .get(connection_id)
            .ok_or_else(|| DeliveryError::UnknownConnection(connection_id.clone()))?;

        sender
            .send(event)
            .map_err(|_| DeliveryError::Closed(connection_id.clone()))
    }
}
