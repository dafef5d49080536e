//! Liveness supervision.
//!
//! A periodic sweep evicts peers that have gone silent, except peers bound
//! to a call. Peers that disconnect mid-call get a grace window instead: a
//! timer task per peer, cancelled if the peer registers again before it
//! fires.

use crate::peer::{Peer, PeerId};
use crate::registry::Eviction;
use crate::relay::Relay;
use confide_protocol::ServerEvent;
use dashmap::DashMap;
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Pending grace evictions keyed by peer.
///
/// Each entry carries the registration sequence of the peer it was scheduled
/// for. A registration detaches at most once, so the sequence identifies the
/// timer even after the peer re-registers under the same ID.
#[derive(Debug, Default)]
pub(crate) struct EvictionSchedule {
    pending: DashMap<PeerId, (u64, JoinHandle<()>)>,
}

impl EvictionSchedule {
    fn insert(&self, peer_id: PeerId, seq: u64, handle: JoinHandle<()>) {
        if let Some((_, previous)) = self.pending.insert(peer_id, (seq, handle)) {
            previous.abort();
        }
    }

    /// Abort a pending eviction. Returns `true` if one was pending.
    pub(crate) fn cancel(&self, peer_id: &str) -> bool {
        match self.pending.remove(peer_id) {
            Some((_, (_, handle))) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Abort the eviction scheduled for registration `seq`, leaving any
    /// newer one in place.
    fn cancel_for(&self, peer_id: &str, seq: u64) -> bool {
        match self.pending.remove_if(peer_id, |_, (current, _)| *current == seq) {
            Some((_, (_, handle))) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Forget a finished eviction, unless it was replaced in the meantime.
    fn complete(&self, peer_id: &str, seq: u64) {
        self.pending.remove_if(peer_id, |_, (current, _)| *current == seq);
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }
}

impl Relay {
    /// Run one liveness sweep.
    ///
    /// Stale peers outside a call are evicted as if they had disconnected.
    /// Returns the evictions performed.
    pub fn sweep(&self) -> Vec<Eviction> {
        let evicted = self.registry().evict_stale();

        for eviction in &evicted {
            let peer = &eviction.peer;
            if peer.is_detached() {
                self.evictions.cancel_for(&peer.peer_id, peer.seq);
            }

            // A detached confidant was already announced when it dropped.
            if peer.is_confidant() && !peer.is_detached() {
                self.broadcast(ServerEvent::ConfidentDisconnected {
                    confident_id: peer.peer_id.clone(),
                });
            }
            info!(peer = %peer.peer_id, role = %peer.role, "Evicted stale peer");
        }

        if !evicted.is_empty() {
            debug!(evicted = evicted.len(), "Liveness sweep complete");
        }
        evicted
    }

    /// Spawn the periodic liveness sweep.
    ///
    /// Returns `None` when liveness is disabled. The task stops on its own
    /// once the relay is dropped.
    pub fn spawn_supervisor(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if !self.config().liveness_enabled {
            info!("Liveness supervision disabled");
            return None;
        }

        let period = self.config().sweep_interval;
        let relay = Arc::downgrade(self);

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let Some(relay) = relay.upgrade() else {
                    debug!("Relay dropped, stopping liveness supervisor");
                    break;
                };
                relay.sweep();
            }
        }))
    }

    /// Number of grace evictions waiting to fire.
    #[must_use]
    pub fn pending_evictions(&self) -> usize {
        self.evictions.len()
    }

    /// Schedule eviction of a detached peer once its grace window ends.
    pub(crate) fn schedule_grace_eviction(self: &Arc<Self>, peer: &Peer) {
        let Some(detached_at) = peer.detached_at() else {
            warn!(peer = %peer.peer_id, "Grace eviction requested for attached peer");
            return;
        };

        let relay: Weak<Relay> = Arc::downgrade(self);
        let peer_id = peer.peer_id.clone();
        let connection_id = peer.connection_id.clone();
        let deadline = detached_at + self.config().grace_period;
        let seq = peer.seq;

        // The timer waits until its entry is in the schedule, so a window
        // that has already elapsed cannot complete before it is recorded.
        let (armed_tx, armed_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn({
            let peer_id = peer_id.clone();
            async move {
                if armed_rx.await.is_err() {
                    return;
                }
                tokio::time::sleep_until(deadline).await;
                let Some(relay) = relay.upgrade() else {
                    return;
                };
                relay.evictions.complete(&peer_id, seq);

                if let Some(eviction) =
                    relay
                        .registry()
                        .evict_detached(&peer_id, &connection_id, detached_at)
                {
                    relay.finish_grace_eviction(eviction);
                }
            }
        });

        self.evictions.insert(peer_id, seq, handle);
        let _ = armed_tx.send(());
    }

    fn finish_grace_eviction(&self, eviction: Eviction) {
        info!(peer = %eviction.peer.peer_id, "Grace window elapsed, peer evicted");

        if let Some(partner_id) = eviction.released_partner {
            if let Some(partner) = self.registry().lookup_by_id(&partner_id) {
                self.send(
                    &partner.connection_id,
                    ServerEvent::CallEnded {
                        from_id: eviction.peer.peer_id,
                    },
                );
            }
        }
    }
}
