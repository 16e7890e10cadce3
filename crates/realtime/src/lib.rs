//! Real-time fan-out plumbing shared by the canvas and duel channels.
//!
//! ## Architecture
//!
//! ```text
//! publisher (any process)
//!         ↓  BroadcastBus::publish(scope, event)
//! Broker topic (NATS subject per scope)
//!         ↓
//! Relay task (one per topic per process)
//!         ↓
//! ConnectionRegistry::deliver(scope)
//!         ↓
//! WebSocket connections
//! ```
//!
//! The registry never knows about game rules; it only maps scopes to live
//! connections. Everything that must reach more than one process goes
//! through the broker, including the local process's own connections.

pub mod broker;
pub mod bus;
pub mod error;
pub mod event;
pub mod nats;
pub mod registry;
pub mod scope;

pub use broker::{Broker, EventStream, MemoryBroker};
pub use bus::{BroadcastBus, TopicConfig};
pub use error::{BusError, Result};
pub use event::{BroadcastEvent, Envelope};
pub use nats::NatsBroker;
pub use registry::{Connection, ConnectionId, ConnectionRegistry, DeliveryReport};
pub use scope::Scope;

/// Identity of a user as issued by the identity collaborator.
pub type UserId = i64;

/// Numeric id of a duel session.
pub type SessionId = i64;
