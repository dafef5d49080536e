//! Event types for the Confide protocol.
//!
//! Every event travels inside an envelope of the form
//! `{"event": "<name>", "data": {...}}`. Field names inside `data` are
//! camelCase.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Reason carried by `call-failed` when the target cannot take the call.
pub const REASON_UNAVAILABLE: &str = "unavailable";

/// The role a peer registers with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// A caller. Never listed as available.
    #[serde(rename = "user")]
    User,
    /// A peer that can be called and exposes an availability flag.
    #[serde(rename = "confident", alias = "confidant")]
    Confidant,
}

impl Role {
    /// Parse a role from its wire name.
    ///
    /// Matching is case-insensitive and accepts both spellings of the
    /// callable role.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "user" => Some(Role::User),
            "confident" | "confidant" => Some(Role::Confidant),
            _ => None,
        }
    }

    /// The wire name of this role.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Confidant => "confident",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of a `register` event.
///
/// Fields are left loosely typed so that a malformed registration reaches
/// the relay and is rejected there with a proper error event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterPayload {
    /// Stable peer identity chosen by the client.
    #[serde(default)]
    pub peer_id: String,
    /// Role wire name (`user` or `confident`).
    #[serde(default)]
    pub role: String,
    /// Optional display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Events sent from a peer to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    /// Register this connection as a peer.
    Register(RegisterPayload),

    /// Toggle a confidant's availability.
    UpdateAvailability {
        /// New availability.
        available: bool,
    },

    /// Ask a confidant to take a call.
    #[serde(rename_all = "camelCase")]
    CallRequest {
        /// The confidant being called.
        target_confidant_id: String,
    },

    /// Accept or decline an incoming call.
    #[serde(rename_all = "camelCase")]
    CallResponse {
        /// The peer that placed the call.
        caller_id: String,
        /// Whether the call was accepted.
        accepted: bool,
    },

    /// WebRTC session offer.
    #[serde(rename = "webrtc-offer", rename_all = "camelCase")]
    WebrtcOffer {
        /// Peer to deliver the offer to.
        target_id: String,
        /// Opaque SDP offer.
        offer: Value,
    },

    /// WebRTC session answer.
    #[serde(rename = "webrtc-answer", rename_all = "camelCase")]
    WebrtcAnswer {
        /// Peer to deliver the answer to.
        target_id: String,
        /// Opaque SDP answer.
        answer: Value,
    },

    /// Trickled ICE candidate.
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        /// Peer to deliver the candidate to.
        target_id: String,
        /// Opaque candidate.
        candidate: Value,
    },

    /// Hang up.
    #[serde(rename_all = "camelCase")]
    EndCall {
        /// The other side of the call.
        target_id: String,
    },

    /// Application-level keepalive.
    Heartbeat {
        /// Optional client timestamp, echoed back.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Ask for the current available-confidants snapshot.
    GetAvailableConfidents {},
}

impl ClientEvent {
    /// The wire name of this event.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::Register(_) => "register",
            ClientEvent::UpdateAvailability { .. } => "update-availability",
            ClientEvent::CallRequest { .. } => "call-request",
            ClientEvent::CallResponse { .. } => "call-response",
            ClientEvent::WebrtcOffer { .. } => "webrtc-offer",
            ClientEvent::WebrtcAnswer { .. } => "webrtc-answer",
            ClientEvent::IceCandidate { .. } => "ice-candidate",
            ClientEvent::EndCall { .. } => "end-call",
            ClientEvent::Heartbeat { .. } => "heartbeat",
            ClientEvent::GetAvailableConfidents {} => "get-available-confidents",
        }
    }

    /// Create a `register` event.
    #[must_use]
    pub fn register(peer_id: impl Into<String>, role: Role, name: Option<String>) -> Self {
        ClientEvent::Register(RegisterPayload {
            peer_id: peer_id.into(),
            role: role.as_str().to_string(),
            name,
        })
    }
}

/// One entry of an `available-confidents` snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfidantSummary {
    /// Confidant peer ID.
    pub peer_id: String,
    /// Display name, if one was given.
    pub name: Option<String>,
    /// Always `true` in a snapshot.
    pub is_available: bool,
}

/// Events sent from the relay to a peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    /// Sent once when the socket opens.
    #[serde(rename_all = "camelCase")]
    Connected {
        /// Server-assigned connection ID.
        connection_id: String,
        /// Recommended heartbeat interval in milliseconds.
        heartbeat: u32,
    },

    /// Registration result.
    #[serde(rename_all = "camelCase")]
    Registered {
        /// Always `true`; failures arrive as `error`.
        success: bool,
        /// Registered peer ID.
        peer_id: String,
        /// Registered role.
        role: Role,
    },

    /// Snapshot of the currently available confidants.
    AvailableConfidents {
        /// Available confidants in registration order.
        confidents: Vec<ConfidantSummary>,
    },

    /// A confidant's availability changed.
    #[serde(rename_all = "camelCase")]
    ConfidentStatusUpdate {
        /// Confidant peer ID.
        confident_id: String,
        /// New availability.
        is_available: bool,
        /// Display name, if one was given.
        name: Option<String>,
    },

    /// A confidant went away.
    #[serde(rename_all = "camelCase")]
    ConfidentDisconnected {
        /// Confidant peer ID.
        confident_id: String,
    },

    /// Someone is calling.
    #[serde(rename_all = "camelCase")]
    IncomingCall {
        /// The calling peer.
        caller_id: String,
    },

    /// The call request was rejected.
    CallFailed {
        /// Machine-readable reason.
        reason: String,
    },

    /// The callee answered a call request.
    #[serde(rename_all = "camelCase")]
    CallAnswered {
        /// Whether the call was accepted.
        accepted: bool,
        /// The answering peer.
        responder_id: String,
    },

    /// Forwarded WebRTC offer.
    #[serde(rename = "webrtc-offer", rename_all = "camelCase")]
    WebrtcOffer {
        /// Opaque SDP offer.
        offer: Value,
        /// Offering peer.
        caller_id: String,
    },

    /// Forwarded WebRTC answer.
    #[serde(rename = "webrtc-answer", rename_all = "camelCase")]
    WebrtcAnswer {
        /// Opaque SDP answer.
        answer: Value,
        /// Answering peer.
        responder_id: String,
    },

    /// Forwarded ICE candidate.
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        /// Opaque candidate.
        candidate: Value,
        /// Sending peer.
        from_id: String,
    },

    /// The other side hung up.
    #[serde(rename_all = "camelCase")]
    CallEnded {
        /// Peer that ended the call.
        from_id: String,
    },

    /// Acknowledges an availability change.
    #[serde(rename_all = "camelCase")]
    AvailabilityUpdated {
        /// Availability now in effect.
        is_available: bool,
    },

    /// Reply to an application-level heartbeat.
    HeartbeatAck {
        /// Client timestamp if one was sent, server time otherwise.
        timestamp: u64,
    },

    /// A request failed.
    Error {
        /// Machine-readable error type.
        #[serde(rename = "type")]
        kind: String,
        /// Human-readable description.
        message: String,
    },
}

impl ServerEvent {
    /// The wire name of this event.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Connected { .. } => "connected",
            ServerEvent::Registered { .. } => "registered",
            ServerEvent::AvailableConfidents { .. } => "available-confidents",
            ServerEvent::ConfidentStatusUpdate { .. } => "confident-status-update",
            ServerEvent::ConfidentDisconnected { .. } => "confident-disconnected",
            ServerEvent::IncomingCall { .. } => "incoming-call",
            ServerEvent::CallFailed { .. } => "call-failed",
            ServerEvent::CallAnswered { .. } => "call-answered",
            ServerEvent::WebrtcOffer { .. } => "webrtc-offer",
            ServerEvent::WebrtcAnswer { .. } => "webrtc-answer",
            ServerEvent::IceCandidate { .. } => "ice-candidate",
            ServerEvent::CallEnded { .. } => "call-ended",
            ServerEvent::AvailabilityUpdated { .. } => "availability-updated",
            ServerEvent::HeartbeatAck { .. } => "heartbeat-ack",
            ServerEvent::Error { .. } => "error",
        }
    }

    /// Create a new Connected event.
    #[must_use]
    pub fn connected(connection_id: impl Into<String>, heartbeat: u32) -> Self {
        ServerEvent::Connected {
            connection_id: connection_id.into(),
            heartbeat,
        }
    }

    /// Create a new Error event.
    #[must_use]
    pub fn error(kind: impl Into<String>, message: impl Into<String>) -> Self {
        ServerEvent::Error {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Create a `call-failed` event for an unavailable target.
    #[must_use]
    pub fn call_unavailable() -> Self {
        ServerEvent::CallFailed {
            reason: REASON_UNAVAILABLE.to_string(),
        }
    }
}
