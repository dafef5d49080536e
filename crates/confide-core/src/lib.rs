//! # confide-core
//!
//! Presence, call sessions and signaling relay for the Confide server.
//!
//! This crate provides the stateful core:
//!
//! - **Registry** - Peer identity, connection, role, availability and liveness
//! - **Sessions** - Symmetric call bindings between pairs of peers
//! - **Relay** - Validates inbound events and forwards signaling messages
//! - **Liveness** - Periodic stale-peer sweep and grace-window eviction
//! - **Hub** - Outbound delivery to connections
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Connection │────▶│    Relay    │────▶│     Hub     │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                            │
//!                            ▼
//!                     ┌─────────────┐     ┌─────────────┐
//!                     │  Registry   │◀────│  Liveness   │
//!                     └─────────────┘     └─────────────┘
//! ```

pub mod error;
pub mod hub;
pub mod liveness;
pub mod peer;
pub mod registry;
pub mod relay;
pub mod session;

pub use error::RelayError;
pub use hub::{ConnectionHub, ConnectionId, DeliveryError, EventReceiver, EventSink};
pub use peer::{Peer, PeerId};
pub use registry::{Departure, Eviction, Registry, RegistryStats};
pub use relay::{Relay, RelayConfig, RelayStats};
