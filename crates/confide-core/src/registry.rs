//! Presence registry.
//!
//! Owns the mapping between peer identities, connections, roles,
//! availability and liveness. All state sits behind a single mutex so that
//! multi-peer transitions (call binding, replacement, eviction) are never
//! observable half-applied.

use crate::error::RelayError;
use crate::hub::ConnectionId;
use crate::peer::{Peer, PeerId};
use confide_protocol::{ConfidantSummary, Role};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Guarded registry state.
#[derive(Debug, Default)]
pub(crate) struct RegistryState {
    pub(crate) peers: HashMap<PeerId, Peer>,
    /// Attached connections only. A detached peer keeps its entry in `peers`.
    pub(crate) by_connection: HashMap<ConnectionId, PeerId>,
    next_seq: u64,
}

impl RegistryState {
    /// Remove a peer, releasing its call partner and its connection mapping.
    pub(crate) fn remove(&mut self, peer_id: &str) -> Option<Eviction> {
        let released_partner = self.end_call(peer_id);
        let peer = self.peers.remove(peer_id)?;

        if self
            .by_connection
            .get(&peer.connection_id)
            .is_some_and(|id| id == peer_id)
        {
            self.by_connection.remove(&peer.connection_id);
        }

        Some(Eviction {
            peer,
            released_partner,
        })
    }
}

/// A peer removed from the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eviction {
    /// The removed peer, with its call binding already cleared.
    pub peer: Peer,
    /// The partner whose call binding was released by the removal.
    pub released_partner: Option<PeerId>,
}

/// Outcome of a connection going away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Departure {
    /// The peer was not in a call and has been removed.
    Removed(Eviction),
    /// The peer is in a call; it stays registered until its grace window ends.
    Detached(Peer),
}

/// Registry statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Peers with a live connection.
    pub attached_peers: usize,
    /// Peers waiting out a grace window.
    pub detached_peers: usize,
    /// Confidants currently listed as available.
    pub available_confidants: usize,
}

/// The presence registry.
#[derive(Debug, Default)]
pub struct Registry {
    pub(crate) state: Mutex<RegistryState>,
    /// Freshness threshold. `None` disables staleness checks.
    liveness_timeout: Option<Duration>,
}

impl Registry {
    /// Create a registry without liveness filtering.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry that treats peers silent for longer than `timeout` as stale.
    #[must_use]
    pub fn with_liveness_timeout(timeout: Option<Duration>) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            liveness_timeout: timeout,
        }
    }

    /// The configured freshness threshold.
    #[must_use]
    pub fn liveness_timeout(&self) -> Option<Duration> {
        self.liveness_timeout
    }

    /// Register a peer on a connection.
    ///
    /// Any prior entry with the same `peer_id` is replaced; its connection is
    /// superseded but not closed. If the connection was already bound to a
    /// different peer, that peer is unregistered. Replaced peers release their
    /// call partners.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::InvalidRegistration`] if `peer_id` is empty or
    /// `role` is empty or unrecognized.
    pub fn register(
        &self,
        connection_id: &ConnectionId,
        peer_id: &str,
        role: &str,
        display_name: Option<String>,
    ) -> Result<Peer, RelayError> {
        let peer_id = peer_id.trim();
        if peer_id.is_empty() {
            return Err(RelayError::InvalidRegistration("peerId is required"));
        }
        if role.trim().is_empty() {
            return Err(RelayError::InvalidRegistration("role is required"));
        }
        let role =
            Role::parse(role).ok_or(RelayError::InvalidRegistration("unrecognized role"))?;
        let display_name = display_name
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty());

        let mut state = self.state.lock();

        if let Some(previous) = state.by_connection.get(connection_id).cloned() {
            if previous != peer_id {
                state.remove(&previous);
                debug!(
                    connection = %connection_id,
                    previous = %previous,
                    peer = %peer_id,
                    "Connection re-registered under a new identity"
                );
            }
        }

        if let Some(replaced) = state.remove(peer_id) {
            debug!(
                peer = %peer_id,
                old_connection = %replaced.peer.connection_id,
                new_connection = %connection_id,
                "Registration superseded"
            );
        }

        let seq = state.next_seq;
        state.next_seq += 1;

        let peer = Peer::new(
            peer_id.to_string(),
            connection_id.clone(),
            role,
            display_name,
            seq,
        );
        state
            .by_connection
            .insert(connection_id.clone(), peer.peer_id.clone());
        state.peers.insert(peer.peer_id.clone(), peer.clone());

        info!(peer = %peer_id, role = %role, connection = %connection_id, "Peer registered");

        Ok(peer)
    }

    /// Remove a peer and its connection mapping. No-op if absent.
    pub fn unregister(&self, peer_id: &str) -> Option<Eviction> {
        let eviction = self.state.lock().remove(peer_id);
        if eviction.is_some() {
            debug!(peer = %peer_id, "Peer unregistered");
        }
        eviction
    }

    /// Resolve the peer registered on a connection.
    #[must_use]
    pub fn lookup_by_connection(&self, connection_id: &ConnectionId) -> Option<Peer> {
        let state = self.state.lock();
        state
            .by_connection
            .get(connection_id)
            .and_then(|peer_id| state.peers.get(peer_id))
            .cloned()
    }

    /// Resolve a peer by identity.
    #[must_use]
    pub fn lookup_by_id(&self, peer_id: &str) -> Option<Peer> {
        self.state.lock().peers.get(peer_id).cloned()
    }

    /// Refresh the liveness of a peer. Returns `false` if the peer is absent.
    pub fn touch_liveness(&self, peer_id: &str) -> bool {
        match self.state.lock().peers.get_mut(peer_id) {
            Some(peer) => {
                peer.touch();
                true
            }
            None => false,
        }
    }

    /// Resolve the peer on a connection and refresh its liveness.
    pub fn touch_connection(&self, connection_id: &ConnectionId) -> Option<Peer> {
        let mut state = self.state.lock();
        let peer_id = state.by_connection.get(connection_id)?.clone();
        let peer = state.peers.get_mut(&peer_id)?;
        peer.touch();
        Some(peer.clone())
    }

    /// Set a confidant's availability.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::NotFound`] if the peer is absent and
    /// [`RelayError::NotAuthorized`] if it is not a confidant.
    pub fn set_availability(&self, peer_id: &str, available: bool) -> Result<Peer, RelayError> {
        let mut state = self.state.lock();
        let peer = state
            .peers
            .get_mut(peer_id)
            .ok_or_else(|| RelayError::NotFound(peer_id.to_string()))?;

        match peer.role {
            Role::User => Err(RelayError::NotAuthorized("update availability")),
            Role::Confidant => {
                peer.available = available;
                peer.touch();
                debug!(peer = %peer_id, available, "Availability updated");
                Ok(peer.clone())
            }
        }
    }

    /// Confidants that are available, attached and fresh, in registration order.
    #[must_use]
    pub fn list_available_confidants(&self) -> Vec<ConfidantSummary> {
        let now = Instant::now();
        let state = self.state.lock();

        let mut available: Vec<&Peer> = state
            .peers
            .values()
            .filter(|peer| self.is_listed(peer, now))
            .collect();
        available.sort_by_key(|peer| peer.seq);

        available.into_iter().map(Peer::summary).collect()
    }

    /// Connections of all attached peers.
    #[must_use]
    pub fn attached_connections(&self) -> Vec<ConnectionId> {
        self.state.lock().by_connection.keys().cloned().collect()
    }

    /// Record that a connection went away.
    ///
    /// A peer in a call is detached: it loses its connection mapping and
    /// availability but keeps its entry and call binding. Any other peer is
    /// removed. Returns `None` if no peer is registered on the connection.
    pub fn depart(&self, connection_id: &ConnectionId) -> Option<Departure> {
        let mut state = self.state.lock();
        let peer_id = state.by_connection.remove(connection_id)?;

        let peer = state.peers.get_mut(&peer_id)?;
        if peer.in_call() {
            peer.detached_at = Some(Instant::now());
            peer.available = false;
            debug!(peer = %peer_id, connection = %connection_id, "Peer detached mid-call");
            return Some(Departure::Detached(peer.clone()));
        }

        state.remove(&peer_id).map(Departure::Removed)
    }

    /// Evict a detached peer whose grace window has ended.
    ///
    /// Does nothing if the peer re-registered, was already removed, or showed
    /// activity after detaching.
    pub fn evict_detached(
        &self,
        peer_id: &str,
        connection_id: &ConnectionId,
        detached_at: Instant,
    ) -> Option<Eviction> {
        let mut state = self.state.lock();
        let peer = state.peers.get(peer_id)?;

        if peer.connection_id != *connection_id || peer.detached_at != Some(detached_at) {
            debug!(peer = %peer_id, "Grace eviction superseded");
            return None;
        }
        if peer.last_liveness_at > detached_at {
            debug!(peer = %peer_id, "Grace eviction skipped, peer showed activity");
            return None;
        }

        state.remove(peer_id)
    }

    /// Remove every stale peer that is not in a call.
    pub fn evict_stale(&self) -> Vec<Eviction> {
        let Some(timeout) = self.liveness_timeout else {
            return Vec::new();
        };
        let now = Instant::now();
        let mut state = self.state.lock();

        let stale: Vec<PeerId> = state
            .peers
            .values()
            .filter(|peer| !peer.in_call() && peer.is_stale(timeout, now))
            .map(|peer| peer.peer_id.clone())
            .collect();

        stale
            .iter()
            .filter_map(|peer_id| {
                debug!(peer = %peer_id, "Pruned stale peer");
                state.remove(peer_id)
            })
            .collect()
    }

    /// Number of registered peers, attached or detached.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().peers.len()
    }

    /// Check if the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().peers.is_empty()
    }

    /// Get registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let now = Instant::now();
        let state = self.state.lock();
        let attached_peers = state.by_connection.len();

        RegistryStats {
            attached_peers,
            detached_peers: state.peers.len() - attached_peers,
            available_confidants: state
                .peers
                .values()
                .filter(|peer| self.is_listed(peer, now))
                .count(),
        }
    }

    fn is_listed(&self, peer: &Peer, now: Instant) -> bool {
        peer.is_confidant()
            && peer.available
            && !peer.is_detached()
            && !self
                .liveness_timeout
                .is_some_and(|timeout| peer.is_stale(timeout, now))
    }
}
