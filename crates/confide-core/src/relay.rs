//! Relay dispatcher.
//!
//! Resolves the acting peer for every inbound event, applies the
//! registry/session transition and emits the resulting events. Failures are
//! reported to the sender as events and never escape into the transport.

use crate::error::RelayError;
use crate::hub::{ConnectionId, EventSink};
use crate::liveness::EvictionSchedule;
use crate::peer::Peer;
use crate::registry::{Departure, Registry, RegistryStats};
use confide_protocol::{ClientEvent, RegisterPayload, Role, ServerEvent};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, trace, warn};

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Whether stale peers are swept and hidden from availability listings.
    pub liveness_enabled: bool,
    /// Silence after which a peer is considered stale.
    pub liveness_timeout: Duration,
    /// How often the liveness sweep runs.
    pub sweep_interval: Duration,
    /// How long a peer that disconnected mid-call is kept before eviction.
    pub grace_period: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            liveness_enabled: true,
            liveness_timeout: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(30),
            grace_period: Duration::from_secs(30),
        }
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Registry counters.
    pub registry: RegistryStats,
    /// Grace evictions waiting to fire.
    pub pending_evictions: usize,
}

/// The signaling relay.
pub struct Relay {
    registry: Registry,
    sink: Arc<dyn EventSink>,
    pub(crate) evictions: EvictionSchedule,
    config: RelayConfig,
}

impl Relay {
    /// Create a relay with default configuration.
    #[must_use]
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self::with_config(sink, RelayConfig::default())
    }

    /// Create a relay with custom configuration.
    #[must_use]
    pub fn with_config(sink: Arc<dyn EventSink>, config: RelayConfig) -> Self {
        info!("Creating relay with config: {:?}", config);
        let timeout = config.liveness_enabled.then_some(config.liveness_timeout);
        Self {
            registry: Registry::with_liveness_timeout(timeout),
            sink,
            evictions: EvictionSchedule::default(),
            config,
        }
    }

    /// The presence registry.
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// The relay configuration.
    #[must_use]
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Get relay statistics.
    #[must_use]
    pub fn stats(&self) -> RelayStats {
        RelayStats {
            registry: self.registry.stats(),
            pending_evictions: self.evictions.len(),
        }
    }

    /// Handle an inbound event from a connection.
    ///
    /// Errors have already been reported to the sender when this returns;
    /// the result is only for instrumentation.
    pub fn handle(&self, connection_id: &ConnectionId, event: ClientEvent) -> Result<(), RelayError> {
        trace!(connection = %connection_id, event = event.name(), "Inbound event");

        let result = self.dispatch(connection_id, event);
        if let Err(e) = &result {
            match e {
                RelayError::Unavailable(_) => {
                    debug!(connection = %connection_id, error = %e, "Call request rejected")
                }
                _ => warn!(connection = %connection_id, error = %e, "Request failed"),
            }
            self.send(connection_id, e.to_event());
        }
        result
    }

    /// Refresh liveness for the peer on a connection, e.g. on a transport pong.
    pub fn touch(&self, connection_id: &ConnectionId) -> bool {
        self.registry.touch_connection(connection_id).is_some()
    }

    /// Handle a connection going away. Never fails.
    ///
    /// Confidants are announced as disconnected right away. A peer in a call
    /// stays registered until its grace window ends; anyone else is removed
    /// immediately.
    pub fn disconnect(self: &Arc<Self>, connection_id: &ConnectionId) {
        let Some(departure) = self.registry.depart(connection_id) else {
            debug!(connection = %connection_id, "Unregistered connection closed");
            return;
        };

        let peer = match &departure {
            Departure::Removed(eviction) => &eviction.peer,
            Departure::Detached(peer) => peer,
        };

        if peer.is_confidant() {
            self.broadcast(ServerEvent::ConfidentDisconnected {
                confident_id: peer.peer_id.clone(),
            });
        }

        match departure {
            Departure::Removed(eviction) => {
                info!(peer = %eviction.peer.peer_id, connection = %connection_id, "Peer disconnected");
            }
            Departure::Detached(peer) => {
                info!(
                    peer = %peer.peer_id,
                    connection = %connection_id,
                    grace_ms = self.config.grace_period.as_millis() as u64,
                    "Peer disconnected mid-call, deferring eviction"
                );
                self.schedule_grace_eviction(&peer);
            }
        }
    }

    fn dispatch(&self, connection_id: &ConnectionId, event: ClientEvent) -> Result<(), RelayError> {
        match event {
            ClientEvent::Register(payload) => self.register(connection_id, payload)?,

            ClientEvent::UpdateAvailability { available } => {
                let sender = self.sender(connection_id)?;
                let peer = self.registry.set_availability(&sender.peer_id, available)?;
                self.broadcast(status_update(&peer));
                self.send(
                    connection_id,
                    ServerEvent::AvailabilityUpdated {
                        is_available: peer.available,
                    },
                );
            }

            ClientEvent::CallRequest { target_confidant_id } => {
                let sender = self.sender(connection_id)?;
                let target = self
                    .registry
                    .lookup_by_id(&target_confidant_id)
                    .filter(|peer| peer.is_confidant() && peer.available && !peer.is_detached())
                    .ok_or(RelayError::Unavailable(target_confidant_id))?;

                debug!(caller = %sender.peer_id, callee = %target.peer_id, "Call requested");
                self.send(
                    &target.connection_id,
                    ServerEvent::IncomingCall {
                        caller_id: sender.peer_id,
                    },
                );
            }

            ClientEvent::CallResponse { caller_id, accepted } => {
                let sender = self.sender(connection_id)?;
                let target = self.resolve_target(&caller_id)?;
                debug!(caller = %caller_id, callee = %sender.peer_id, accepted, "Call answered");
                self.send(
                    &target.connection_id,
                    ServerEvent::CallAnswered {
                        accepted,
                        responder_id: sender.peer_id,
                    },
                );
            }

            ClientEvent::WebrtcOffer { target_id, offer } => {
                let sender = self.sender(connection_id)?;
                self.registry.start_call(&sender.peer_id, &target_id)?;
                self.forward(
                    &target_id,
                    ServerEvent::WebrtcOffer {
                        offer,
                        caller_id: sender.peer_id,
                    },
                )?;
            }

            ClientEvent::WebrtcAnswer { target_id, answer } => {
                let sender = self.sender(connection_id)?;
                self.forward(
                    &target_id,
                    ServerEvent::WebrtcAnswer {
                        answer,
                        responder_id: sender.peer_id,
                    },
                )?;
            }

            ClientEvent::IceCandidate {
                target_id,
                candidate,
            } => {
                let sender = self.sender(connection_id)?;
                self.forward(
                    &target_id,
                    ServerEvent::IceCandidate {
                        candidate,
                        from_id: sender.peer_id,
                    },
                )?;
            }

            ClientEvent::EndCall { target_id } => {
                let sender = self.sender(connection_id)?;
                let target = self.resolve_target(&target_id)?;
                self.registry.end_call(&sender.peer_id);
                self.registry.end_call(&target.peer_id);
                self.send(
                    &target.connection_id,
                    ServerEvent::CallEnded {
                        from_id: sender.peer_id,
                    },
                );
            }

            ClientEvent::Heartbeat { timestamp } => {
                self.sender(connection_id)?;
                self.send(
                    connection_id,
                    ServerEvent::HeartbeatAck {
                        timestamp: timestamp.unwrap_or_else(unix_millis),
                    },
                );
            }

            ClientEvent::GetAvailableConfidents {} => {
                self.sender(connection_id)?;
                self.send(connection_id, self.available_snapshot());
            }
        }

        Ok(())
    }

    /// Resolve the peer registered on `connection_id`, refreshing its liveness.
    fn sender(&self, connection_id: &ConnectionId) -> Result<Peer, RelayError> {
        self.registry
            .touch_connection(connection_id)
            .ok_or(RelayError::UnknownSender)
    }

    fn register(&self, connection_id: &ConnectionId, payload: RegisterPayload) -> Result<(), RelayError> {
        let peer = self
            .registry
            .register(connection_id, &payload.peer_id, &payload.role, payload.name)?;

        if self.evictions.cancel(&peer.peer_id) {
            info!(peer = %peer.peer_id, "Peer reconnected, pending eviction cancelled");
        }

        self.send(
            connection_id,
            ServerEvent::Registered {
                success: true,
                peer_id: peer.peer_id.clone(),
                role: peer.role,
            },
        );

        match peer.role {
            Role::Confidant => self.broadcast(status_update(&peer)),
            Role::User => self.send(connection_id, self.available_snapshot()),
        }

        Ok(())
    }

    fn resolve_target(&self, peer_id: &str) -> Result<Peer, RelayError> {
        self.registry
            .lookup_by_id(peer_id)
            .ok_or_else(|| RelayError::NotFound(peer_id.to_string()))
    }

    /// Resolve `target_id` and deliver `event` to it.
    fn forward(&self, target_id: &str, event: ServerEvent) -> Result<(), RelayError> {
        let target = self.resolve_target(target_id)?;
        trace!(target = %target_id, event = event.name(), "Forwarding");
        self.send(&target.connection_id, event);
        Ok(())
    }

    fn available_snapshot(&self) -> ServerEvent {
        ServerEvent::AvailableConfidents {
            confidents: self.registry.list_available_confidants(),
        }
    }

    /// Deliver an event to one connection, logging failures.
    pub(crate) fn send(&self, connection_id: &ConnectionId, event: ServerEvent) {
        let name = event.name();
        if let Err(e) = self.sink.deliver(connection_id, Arc::new(event)) {
            debug!(connection = %connection_id, event = name, error = %e, "Delivery failed");
        }
    }

    /// Deliver an event to every attached peer. One failed delivery never
    /// stops the others.
    pub(crate) fn broadcast(&self, event: ServerEvent) {
        let event = Arc::new(event);
        let recipients = self.registry.attached_connections();
        let mut delivered = 0usize;

        for connection_id in &recipients {
            match self.sink.deliver(connection_id, Arc::clone(&event)) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(connection = %connection_id, event = event.name(), error = %e, "Broadcast delivery failed")
                }
            }
        }

        debug!(
            event = event.name(),
            recipients = recipients.len(),
            delivered,
            "Broadcast"
        );
    }
}

fn status_update(peer: &Peer) -> ServerEvent {
    ServerEvent::ConfidentStatusUpdate {
        confident_id: peer.peer_id.clone(),
        is_available: peer.available,
        name: peer.display_name.clone(),
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::{ConnectionHub, EventReceiver};
    use confide_protocol::ConfidantSummary;
    use serde_json::json;

    struct Harness {
        hub: Arc<ConnectionHub>,
        relay: Arc<Relay>,
    }

    impl Harness {
        fn new() -> Self {
            let hub = Arc::new(ConnectionHub::new());
            let relay = Arc::new(Relay::new(hub.clone()));
            Self { hub, relay }
        }

        fn connect(&self, id: &str) -> (ConnectionId, EventReceiver) {
            let conn = ConnectionId::from(id);
            let rx = self.hub.attach(conn.clone());
            (conn, rx)
        }

        fn register(&self, id: &str, peer_id: &str, role: Role) -> (ConnectionId, EventReceiver) {
            let (conn, mut rx) = self.connect(id);
            self.relay
                .handle(&conn, ClientEvent::register(peer_id, role, None))
                .unwrap();
            drain(&mut rx);
            (conn, rx)
        }
    }

    fn drain(rx: &mut EventReceiver) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push((*event).clone());
        }
        events
    }

    #[test]
    fn test_register_confidant_broadcasts_status() {
        let h = Harness::new();
        let (_, mut user_rx) = h.register("conn-u", "alice", Role::User);
        let (conn_c, mut conf_rx) = h.connect("conn-c");

        h.relay
            .handle(&conn_c, ClientEvent::register("carol", Role::Confidant, Some("Carol".into())))
            .unwrap();

        let status = ServerEvent::ConfidentStatusUpdate {
            confident_id: "carol".into(),
            is_available: false,
            name: Some("Carol".into()),
        };
        assert_eq!(
            drain(&mut conf_rx),
            vec![
                ServerEvent::Registered {
                    success: true,
                    peer_id: "carol".into(),
                    role: Role::Confidant,
                },
                status.clone(),
            ]
        );
        assert_eq!(drain(&mut user_rx), vec![status]);
    }

    #[test]
    fn test_availability_then_user_snapshot() {
        let h = Harness::new();
        let (conn_c, mut conf_rx) = h.register("conn-c", "carol", Role::Confidant);
        let (_, mut bob_rx) = h.register("conn-b", "bob", Role::User);

        h.relay
            .handle(&conn_c, ClientEvent::UpdateAvailability { available: true })
            .unwrap();

        let update = ServerEvent::ConfidentStatusUpdate {
            confident_id: "carol".into(),
            is_available: true,
            name: None,
        };
        assert_eq!(
            drain(&mut conf_rx),
            vec![
                update.clone(),
                ServerEvent::AvailabilityUpdated { is_available: true }
            ]
        );
        assert_eq!(drain(&mut bob_rx), vec![update]);

        let (conn_u, mut user_rx) = h.connect("conn-u");
        h.relay
            .handle(&conn_u, ClientEvent::register("alice", Role::User, None))
            .unwrap();
        assert_eq!(
            drain(&mut user_rx),
            vec![
                ServerEvent::Registered {
                    success: true,
                    peer_id: "alice".into(),
                    role: Role::User,
                },
                ServerEvent::AvailableConfidents {
                    confidents: vec![ConfidantSummary {
                        peer_id: "carol".into(),
                        name: None,
                        is_available: true,
                    }],
                },
            ]
        );
    }

    #[test]
    fn test_invalid_registration_reports_error() {
        let h = Harness::new();
        let (conn, mut rx) = h.connect("conn-1");

        let result = h.relay.handle(
            &conn,
            ClientEvent::Register(RegisterPayload {
                peer_id: "".into(),
                role: "user".into(),
                name: None,
            }),
        );

        assert!(matches!(result, Err(RelayError::InvalidRegistration(_))));
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], ServerEvent::Error { kind, .. } if kind == "invalid-registration"));
        assert!(h.relay.registry().is_empty());
    }

    #[test]
    fn test_unknown_sender_has_no_side_effects() {
        let h = Harness::new();
        let (_, mut conf_rx) = h.register("conn-c", "carol", Role::Confidant);
        let (conn, mut rx) = h.connect("conn-x");

        let result = h.relay.handle(
            &conn,
            ClientEvent::CallRequest {
                target_confidant_id: "carol".into(),
            },
        );

        assert_eq!(result, Err(RelayError::UnknownSender));
        assert_eq!(
            drain(&mut rx),
            vec![ServerEvent::error("unknown-sender", "Connection is not registered")]
        );
        assert!(drain(&mut conf_rx).is_empty());
    }

    #[test]
    fn test_every_event_requires_registration() {
        let h = Harness::new();
        let (_, mut conf_rx) = h.register("conn-c", "carol", Role::Confidant);
        let (conn, mut rx) = h.connect("conn-x");

        let events = vec![
            ClientEvent::UpdateAvailability { available: true },
            ClientEvent::CallRequest {
                target_confidant_id: "carol".into(),
            },
            ClientEvent::CallResponse {
                caller_id: "carol".into(),
                accepted: true,
            },
            ClientEvent::WebrtcOffer {
                target_id: "carol".into(),
                offer: json!({"sdp": "v=0"}),
            },
            ClientEvent::WebrtcAnswer {
                target_id: "carol".into(),
                answer: json!({"sdp": "v=0"}),
            },
            ClientEvent::IceCandidate {
                target_id: "carol".into(),
                candidate: json!({"candidate": "c"}),
            },
            ClientEvent::EndCall {
                target_id: "carol".into(),
            },
            ClientEvent::Heartbeat { timestamp: Some(1) },
            ClientEvent::GetAvailableConfidents {},
        ];
        let count = events.len();

        for event in events {
            let name = event.name();
            assert_eq!(
                h.relay.handle(&conn, event),
                Err(RelayError::UnknownSender),
                "{} from an unregistered connection",
                name
            );
        }

        let replies = drain(&mut rx);
        assert_eq!(replies.len(), count);
        assert!(replies
            .iter()
            .all(|event| matches!(event, ServerEvent::Error { kind, .. } if kind == "unknown-sender")));
        assert!(drain(&mut conf_rx).is_empty());
        assert!(!h.relay.registry().is_in_call("carol"));
        assert_eq!(h.relay.registry().len(), 1);

        // Registration goes through the same dispatch and makes the connection usable.
        h.relay
            .handle(&conn, ClientEvent::register("xavier", Role::User, None))
            .unwrap();
        drain(&mut rx);
        h.relay
            .handle(&conn, ClientEvent::Heartbeat { timestamp: Some(9) })
            .unwrap();
        assert_eq!(drain(&mut rx), vec![ServerEvent::HeartbeatAck { timestamp: 9 }]);
    }

    #[test]
    fn test_user_cannot_update_availability() {
        let h = Harness::new();
        let (conn, mut rx) = h.register("conn-u", "alice", Role::User);

        let result = h
            .relay
            .handle(&conn, ClientEvent::UpdateAvailability { available: true });

        assert!(matches!(result, Err(RelayError::NotAuthorized(_))));
        let events = drain(&mut rx);
        assert!(matches!(&events[..], [ServerEvent::Error { kind, .. }] if kind == "not-authorized"));
    }

    #[test]
    fn test_call_request_to_unavailable_confidant() {
        let h = Harness::new();
        let (_, mut conf_rx) = h.register("conn-c", "carol", Role::Confidant);
        let (conn_u, mut user_rx) = h.register("conn-u", "alice", Role::User);

        let result = h.relay.handle(
            &conn_u,
            ClientEvent::CallRequest {
                target_confidant_id: "carol".into(),
            },
        );

        assert_eq!(result, Err(RelayError::Unavailable("carol".into())));
        assert_eq!(drain(&mut user_rx), vec![ServerEvent::call_unavailable()]);
        assert!(drain(&mut conf_rx).is_empty());

        h.relay
            .handle(
                &conn_u,
                ClientEvent::CallRequest {
                    target_confidant_id: "nobody".into(),
                },
            )
            .unwrap_err();
        assert_eq!(drain(&mut user_rx), vec![ServerEvent::call_unavailable()]);
    }

    #[test]
    fn test_call_request_and_response() {
        let h = Harness::new();
        let (conn_c, mut conf_rx) = h.register("conn-c", "carol", Role::Confidant);
        h.relay
            .handle(&conn_c, ClientEvent::UpdateAvailability { available: true })
            .unwrap();
        let (conn_u, mut user_rx) = h.register("conn-u", "alice", Role::User);
        drain(&mut conf_rx);

        h.relay
            .handle(
                &conn_u,
                ClientEvent::CallRequest {
                    target_confidant_id: "carol".into(),
                },
            )
            .unwrap();
        assert_eq!(
            drain(&mut conf_rx),
            vec![ServerEvent::IncomingCall {
                caller_id: "alice".into()
            }]
        );

        h.relay
            .handle(
                &conn_c,
                ClientEvent::CallResponse {
                    caller_id: "alice".into(),
                    accepted: true,
                },
            )
            .unwrap();
        assert_eq!(
            drain(&mut user_rx),
            vec![ServerEvent::CallAnswered {
                accepted: true,
                responder_id: "carol".into()
            }]
        );
        // Accepting does not bind a call by itself.
        assert!(!h.relay.registry().is_in_call("alice"));
    }

    #[test]
    fn test_offer_answer_ice_and_end_call() {
        let h = Harness::new();
        let (conn_c, mut conf_rx) = h.register("conn-c", "carol", Role::Confidant);
        let (conn_u, mut user_rx) = h.register("conn-u", "alice", Role::User);
        drain(&mut conf_rx);

        let offer = json!({"type": "offer", "sdp": "v=0"});
        h.relay
            .handle(
                &conn_u,
                ClientEvent::WebrtcOffer {
                    target_id: "carol".into(),
                    offer: offer.clone(),
                },
            )
            .unwrap();
        assert_eq!(
            drain(&mut conf_rx),
            vec![ServerEvent::WebrtcOffer {
                offer,
                caller_id: "alice".into()
            }]
        );
        assert_eq!(h.relay.registry().call_partner("alice").as_deref(), Some("carol"));
        assert_eq!(h.relay.registry().call_partner("carol").as_deref(), Some("alice"));

        let answer = json!({"type": "answer", "sdp": "v=0"});
        h.relay
            .handle(
                &conn_c,
                ClientEvent::WebrtcAnswer {
                    target_id: "alice".into(),
                    answer: answer.clone(),
                },
            )
            .unwrap();
        let candidate = json!({"candidate": "candidate:0 1 UDP 1 10.0.0.2 5000 typ host"});
        h.relay
            .handle(
                &conn_c,
                ClientEvent::IceCandidate {
                    target_id: "alice".into(),
                    candidate: candidate.clone(),
                },
            )
            .unwrap();
        assert_eq!(
            drain(&mut user_rx),
            vec![
                ServerEvent::WebrtcAnswer {
                    answer,
                    responder_id: "carol".into()
                },
                ServerEvent::IceCandidate {
                    candidate,
                    from_id: "carol".into()
                },
            ]
        );

        h.relay
            .handle(
                &conn_u,
                ClientEvent::EndCall {
                    target_id: "carol".into(),
                },
            )
            .unwrap();
        assert_eq!(
            drain(&mut conf_rx),
            vec![ServerEvent::CallEnded {
                from_id: "alice".into()
            }]
        );
        assert!(!h.relay.registry().is_in_call("alice"));
        assert!(!h.relay.registry().is_in_call("carol"));
    }

    #[test]
    fn test_forward_to_missing_target() {
        let h = Harness::new();
        let (conn_u, mut user_rx) = h.register("conn-u", "alice", Role::User);

        for event in [
            ClientEvent::WebrtcOffer {
                target_id: "ghost".into(),
                offer: json!({}),
            },
            ClientEvent::WebrtcAnswer {
                target_id: "ghost".into(),
                answer: json!({}),
            },
            ClientEvent::IceCandidate {
                target_id: "ghost".into(),
                candidate: json!({}),
            },
            ClientEvent::EndCall {
                target_id: "ghost".into(),
            },
            ClientEvent::CallResponse {
                caller_id: "ghost".into(),
                accepted: false,
            },
        ] {
            assert_eq!(
                h.relay.handle(&conn_u, event),
                Err(RelayError::NotFound("ghost".into()))
            );
            assert_eq!(
                drain(&mut user_rx),
                vec![ServerEvent::error("not-found", "Peer not found: ghost")]
            );
        }
        assert!(!h.relay.registry().is_in_call("alice"));
    }

    #[test]
    fn test_end_call_without_session_only_forwards() {
        let h = Harness::new();
        let (_, mut conf_rx) = h.register("conn-c", "carol", Role::Confidant);
        let (conn_u, mut user_rx) = h.register("conn-u", "alice", Role::User);
        drain(&mut conf_rx);

        h.relay
            .handle(
                &conn_u,
                ClientEvent::EndCall {
                    target_id: "carol".into(),
                },
            )
            .unwrap();

        assert_eq!(
            drain(&mut conf_rx),
            vec![ServerEvent::CallEnded {
                from_id: "alice".into()
            }]
        );
        assert!(drain(&mut user_rx).is_empty());
    }

    #[test]
    fn test_heartbeat_and_snapshot_requests() {
        let h = Harness::new();
        let (conn_u, mut user_rx) = h.register("conn-u", "alice", Role::User);

        h.relay
            .handle(&conn_u, ClientEvent::Heartbeat { timestamp: Some(42) })
            .unwrap();
        h.relay
            .handle(&conn_u, ClientEvent::GetAvailableConfidents {})
            .unwrap();

        assert_eq!(
            drain(&mut user_rx),
            vec![
                ServerEvent::HeartbeatAck { timestamp: 42 },
                ServerEvent::AvailableConfidents { confidents: vec![] },
            ]
        );
    }

    #[tokio::test]
    async fn test_disconnect_idle_confidant() {
        let h = Harness::new();
        let (conn_c, _conf_rx) = h.register("conn-c", "carol", Role::Confidant);
        let (_, mut user_rx) = h.register("conn-u", "alice", Role::User);

        h.hub.detach(&conn_c);
        h.relay.disconnect(&conn_c);

        assert_eq!(
            drain(&mut user_rx),
            vec![ServerEvent::ConfidentDisconnected {
                confident_id: "carol".into()
            }]
        );
        assert!(h.relay.registry().lookup_by_id("carol").is_none());
        assert_eq!(h.relay.stats().pending_evictions, 0);
    }

    #[tokio::test]
    async fn test_disconnect_unregistered_connection() {
        let h = Harness::new();
        let (_, mut user_rx) = h.register("conn-u", "alice", Role::User);
        let (conn_x, _rx) = h.connect("conn-x");

        h.relay.disconnect(&conn_x);

        assert!(drain(&mut user_rx).is_empty());
        assert_eq!(h.relay.registry().len(), 1);
    }

    #[test]
    fn test_broadcast_survives_dead_connection() {
        let h = Harness::new();
        let (_, dead_rx) = h.register("conn-d", "dave", Role::User);
        let (_, mut user_rx) = h.register("conn-u", "alice", Role::User);
        drop(dead_rx);

        let (conn_c, _conf_rx) = h.connect("conn-c");
        h.relay
            .handle(&conn_c, ClientEvent::register("carol", Role::Confidant, None))
            .unwrap();

        assert_eq!(drain(&mut user_rx).len(), 1);
    }

    #[test]
    fn test_superseded_connection_is_unknown_sender() {
        let h = Harness::new();
        let (old_conn, _old_rx) = h.register("conn-1", "alice", Role::User);
        let (_, mut new_rx) = h.register("conn-2", "alice", Role::User);

        assert_eq!(
            h.relay.handle(&old_conn, ClientEvent::GetAvailableConfidents {}),
            Err(RelayError::UnknownSender)
        );
        assert!(drain(&mut new_rx).is_empty());
        assert_eq!(
            h.relay.registry().lookup_by_id("alice").unwrap().connection_id,
            ConnectionId::from("conn-2")
        );
    }
}
