//! Duel mini-game: session state machine, solo progression, PvP pixel
//! placement and cross-process matchmaking.
//!
//! All session mutations go through [`DuelEngine`], which serialises them per
//! session and commits with an optimistic compare-and-swap on the
//! [`SessionStore`], so concurrent calls from both players (on any process)
//! decide a winner exactly once.
//!
//! # Example
//!
//! ```ignore
//! use game::{DuelEngine, MatchmakingQueue, MemoryQueueStore, MemorySessionStore};
//!
//! let engine = Arc::new(DuelEngine::new(Arc::new(MemorySessionStore::new()), bus));
//! let queue = MatchmakingQueue::new(Arc::new(MemoryQueueStore::new()), engine.clone());
//!
//! queue.join(1).await?;              // Waiting
//! let outcome = queue.join(2).await?; // Matched { game }
//! ```

pub mod code;
pub mod engine;
pub mod error;
pub mod matchmaking;
pub mod model;
pub mod redis_store;
pub mod solo;
pub mod store;

pub use engine::{
    AnswerOutcome, DuelConfig, DuelEngine, FinishReport, DEFAULT_LEADERBOARD_LIMIT,
    MAX_LEADERBOARD_LIMIT,
};
pub use error::{DuelError, Rejection, Result, StoreError};
pub use matchmaking::{JoinOutcome, MatchmakingQueue, DEFAULT_QUEUE_TTL};
pub use model::{
    Cell, DuelSession, GameMode, GameResult, GameStatus, LeaderboardEntry, PlacedPixel,
    PlacementOutcome, PVP_GRID_SIZE, PVP_PIXEL_QUOTA,
};
pub use redis_store::{RedisQueueStore, RedisSessionStore};
pub use store::{MemoryQueueStore, MemorySessionStore, QueueEntry, QueueStore, SessionStore};
