//! # confide-protocol
//!
//! Wire protocol definitions for the Confide signaling relay.
//!
//! This crate defines the events exchanged between peers and the relay and
//! the codecs that carry them over a WebSocket.
//!
//! ## Event Types
//!
//! - `ClientEvent` - Registration, availability, call negotiation and
//!   WebRTC handshake messages sent by peers
//! - `ServerEvent` - Presence broadcasts, forwarded signaling and errors
//!   sent by the relay
//!
//! ## Example
//!
//! ```rust
//! use confide_protocol::{codec, ClientEvent, Role};
//!
//! let event = ClientEvent::register("alice", Role::User, None);
//!
//! let text = codec::encode_text(&event).unwrap();
//! let decoded: ClientEvent = codec::decode_text(&text).unwrap();
//! assert_eq!(event, decoded);
//! ```

pub mod codec;
pub mod events;

pub use codec::{decode_binary, decode_text, encode_binary, encode_text, ProtocolError};
pub use events::{ClientEvent, ConfidantSummary, RegisterPayload, Role, ServerEvent};
