//! Call session tracking.
//!
//! A call binds two peers to each other. Both sides are always written
//! under the registry lock, so a peer's partner points back at it whenever
//! either side is observed.

use crate::error::RelayError;
use crate::peer::PeerId;
use crate::registry::{Registry, RegistryState};
use tracing::debug;

impl RegistryState {
    /// Bind `a` and `b` to each other, releasing any previous partners.
    pub(crate) fn start_call(&mut self, a: &str, b: &str) -> Result<(), RelayError> {
        for id in [a, b] {
            if !self.peers.contains_key(id) {
                return Err(RelayError::NotFound(id.to_string()));
            }
        }

        for (id, next) in [(a, b), (b, a)] {
            let previous = self.peers.get(id).and_then(|peer| peer.call_partner.clone());
            if let Some(previous) = previous {
                if previous != next {
                    self.release(&previous, id);
                }
            }
        }

        if let Some(peer) = self.peers.get_mut(a) {
            peer.call_partner = Some(b.to_string());
        }
        if let Some(peer) = self.peers.get_mut(b) {
            peer.call_partner = Some(a.to_string());
        }

        Ok(())
    }

    /// Clear the call binding on `peer_id` and on its partner.
    ///
    /// Returns the released partner, or `None` if the peer was not in a call.
    pub(crate) fn end_call(&mut self, peer_id: &str) -> Option<PeerId> {
        let partner = self.peers.get_mut(peer_id)?.call_partner.take()?;
        self.release(&partner, peer_id);
        Some(partner)
    }

    /// Clear `peer_id`'s binding if it still points at `from`.
    fn release(&mut self, peer_id: &str, from: &str) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            if peer.call_partner.as_deref() == Some(from) {
                peer.call_partner = None;
            }
        }
    }
}

impl Registry {
    /// Bind two peers into a call, atomically.
    ///
    /// Re-entrant: starting a call for a peer already in one rebinds it.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::NotFound`] if either peer is absent, in which
    /// case neither side is modified.
    pub fn start_call(&self, a: &str, b: &str) -> Result<(), RelayError> {
        self.state.lock().start_call(a, b)?;
        debug!(caller = %a, callee = %b, "Call started");
        Ok(())
    }

    /// End the call `peer_id` is in, clearing both sides.
    ///
    /// No-op if the peer is absent or not in a call.
    pub fn end_call(&self, peer_id: &str) -> Option<PeerId> {
        let partner = self.state.lock().end_call(peer_id);
        if let Some(partner) = &partner {
            debug!(peer = %peer_id, partner = %partner, "Call ended");
        }
        partner
    }

    /// Whether `peer_id` is bound to a call.
    #[must_use]
    pub fn is_in_call(&self, peer_id: &str) -> bool {
        self.state
            .lock()
            .peers
            .get(peer_id)
            .is_some_and(|peer| peer.in_call())
    }

    /// The other side of `peer_id`'s call.
    #[must_use]
    pub fn call_partner(&self, peer_id: &str) -> Option<PeerId> {
        self.state
            .lock()
            .peers
            .get(peer_id)
            .and_then(|peer| peer.call_partner.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::ConnectionId;

    fn registry_with(peers: &[(&str, &str)]) -> Registry {
        let registry = Registry::new();
        for (i, (peer_id, role)) in peers.iter().enumerate() {
            registry
                .register(&ConnectionId::new(format!("conn-{}", i)), peer_id, role, None)
                .unwrap();
        }
        registry
    }

    fn assert_symmetric(registry: &Registry) {
        let state = registry.state.lock();
        for peer in state.peers.values() {
            assert_eq!(peer.in_call(), peer.call_partner.is_some());
            if let Some(partner) = &peer.call_partner {
                let other = state
                    .peers
                    .get(partner)
                    .unwrap_or_else(|| panic!("{} bound to missing {}", peer.peer_id, partner));
                assert_eq!(other.call_partner.as_deref(), Some(peer.peer_id.as_str()));
            }
        }
    }

    #[test]
    fn test_start_and_end_call() {
        let registry = registry_with(&[("alice", "user"), ("carol", "confident")]);

        registry.start_call("alice", "carol").unwrap();
        assert!(registry.is_in_call("alice"));
        assert!(registry.is_in_call("carol"));
        assert_eq!(registry.call_partner("alice").as_deref(), Some("carol"));
        assert_symmetric(&registry);

        assert_eq!(registry.end_call("carol").as_deref(), Some("alice"));
        assert!(!registry.is_in_call("alice"));
        assert!(!registry.is_in_call("carol"));
        assert_symmetric(&registry);
    }

    #[test]
    fn test_start_call_missing_peer_changes_nothing() {
        let registry = registry_with(&[("alice", "user")]);

        assert_eq!(
            registry.start_call("alice", "ghost"),
            Err(RelayError::NotFound("ghost".into()))
        );
        assert!(!registry.is_in_call("alice"));
    }

    #[test]
    fn test_start_call_rebinds() {
        let registry = registry_with(&[
            ("alice", "user"),
            ("bob", "user"),
            ("carol", "confident"),
        ]);

        registry.start_call("alice", "carol").unwrap();
        registry.start_call("bob", "carol").unwrap();

        assert_eq!(registry.call_partner("carol").as_deref(), Some("bob"));
        assert!(!registry.is_in_call("alice"));
        assert_symmetric(&registry);

        // Renegotiation on the same pair is a no-op rebinding.
        registry.start_call("carol", "bob").unwrap();
        assert_eq!(registry.call_partner("bob").as_deref(), Some("carol"));
        assert_symmetric(&registry);
    }

    #[test]
    fn test_end_call_is_idempotent() {
        let registry = registry_with(&[("alice", "user"), ("carol", "confident")]);

        assert_eq!(registry.end_call("alice"), None);
        assert_eq!(registry.end_call("nobody"), None);

        registry.start_call("alice", "carol").unwrap();
        assert!(registry.end_call("alice").is_some());
        assert_eq!(registry.end_call("alice"), None);
        assert_eq!(registry.end_call("carol"), None);
        assert_symmetric(&registry);
    }

    #[test]
    fn test_unregister_releases_partner() {
        let registry = registry_with(&[("alice", "user"), ("carol", "confident")]);
        registry.start_call("alice", "carol").unwrap();

        let eviction = registry.unregister("carol").unwrap();
        assert_eq!(eviction.released_partner.as_deref(), Some("alice"));
        assert!(!registry.is_in_call("alice"));
        assert_symmetric(&registry);
    }

    #[test]
    fn test_reregister_releases_partner() {
        let registry = registry_with(&[("alice", "user"), ("carol", "confident")]);
        registry.start_call("alice", "carol").unwrap();

        registry
            .register(&ConnectionId::from("conn-9"), "carol", "confident", None)
            .unwrap();

        assert!(!registry.is_in_call("alice"));
        assert!(!registry.is_in_call("carol"));
        assert_symmetric(&registry);
    }
}
