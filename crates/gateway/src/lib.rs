//! Gateway service for the shared canvas and the duel mini-game.
//!
//! This service:
//! - Accepts canvas viewers on `/ws` and duel participants on `/ws/game/{id}`
//! - Relays every scope's events through a broker topic, so any instance can
//!   publish and every instance delivers to its own sockets
//! - Serves a thin JSON API over the canvas pipeline, the duel engine and
//!   matchmaking
//!
//! ## Architecture
//!
//! ```text
//! HTTP/WS handlers ──► CanvasService / DuelEngine / MatchmakingQueue
//!                                 │ publish
//!                                 ▼
//!            BroadcastBus ──► broker topic (NATS or in-memory)
//!                                 │ one relay per topic per instance
//!                                 ▼
//!                       ConnectionRegistry ──► sockets
//! ```

pub mod api;
pub mod config;
pub mod error;
pub mod protocol;
pub mod state;
pub mod ws_server;

pub use config::{BrokerBackend, GatewayConfig, StorageBackend};
pub use error::{ApiError, GatewayError, Result};
pub use protocol::DuelClientMessage;
pub use state::{AppState, Backends};
pub use ws_server::create_router;
