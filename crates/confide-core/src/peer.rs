//! Registered peers.

use crate::hub::ConnectionId;
use confide_protocol::{ConfidantSummary, Role};
use std::time::Duration;
use tokio::time::Instant;

/// A caller-chosen peer identity.
pub type PeerId = String;

/// State of one registered participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    /// Stable identity, unique among registered peers.
    pub peer_id: PeerId,
    /// Connection this peer was registered on.
    pub connection_id: ConnectionId,
    /// Role, fixed for the lifetime of the registration.
    pub role: Role,
    /// Optional display name.
    pub display_name: Option<String>,
    /// Availability flag. Only ever `true` for confidants.
    pub available: bool,
    /// Most recent activity signal.
    pub last_liveness_at: Instant,
    /// When this registration was created.
    pub registered_at: Instant,
    pub(crate) call_partner: Option<PeerId>,
    pub(crate) detached_at: Option<Instant>,
    pub(crate) seq: u64,
}

impl Peer {
    pub(crate) fn new(
        peer_id: PeerId,
        connection_id: ConnectionId,
        role: Role,
        display_name: Option<String>,
        seq: u64,
    ) -> Self {
        let now = Instant::now();
        Self {
            peer_id,
            connection_id,
            role,
            display_name,
            available: false,
            last_liveness_at: now,
            registered_at: now,
            call_partner: None,
            detached_at: None,
            seq,
        }
    }

    /// Whether this peer is bound to a call.
    #[must_use]
    pub fn in_call(&self) -> bool {
        self.call_partner.is_some()
    }

    /// The other side of the current call.
    #[must_use]
    pub fn call_partner(&self) -> Option<&str> {
        self.call_partner.as_deref()
    }

    /// Whether this peer is a confidant.
    #[must_use]
    pub fn is_confidant(&self) -> bool {
        matches!(self.role, Role::Confidant)
    }

    /// Whether the connection dropped and the peer is waiting out its grace window.
    #[must_use]
    pub fn is_detached(&self) -> bool {
        self.detached_at.is_some()
    }

    /// When the connection dropped, if it did.
    #[must_use]
    pub fn detached_at(&self) -> Option<Instant> {
        self.detached_at
    }

    /// Check if this peer has been silent for longer than `timeout`.
    #[must_use]
    pub fn is_stale(&self, timeout: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.last_liveness_at) > timeout
    }

    /// Update the liveness timestamp.
    pub fn touch(&mut self) {
        self.last_liveness_at = Instant::now();
    }

    pub(crate) fn summary(&self) -> ConfidantSummary {
        ConfidantSummary {
            peer_id: self.peer_id.clone(),
            name: self.display_name.clone(),
            is_available: self.available,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(role: Role) -> Peer {
        Peer::new("p-1".into(), ConnectionId::from("conn-1"), role, None, 0)
    }

    #[test]
    fn test_new_peer_defaults() {
        let peer = peer(Role::Confidant);
        assert!(peer.is_confidant());
        assert!(!peer.available);
        assert!(!peer.in_call());
        assert!(!peer.is_detached());
        assert_eq!(peer.call_partner(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_staleness() {
        let mut peer = peer(Role::User);
        let timeout = Duration::from_secs(60);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(peer.is_stale(timeout, Instant::now()));

        peer.touch();
        assert!(!peer.is_stale(timeout, Instant::now()));
    }
}
