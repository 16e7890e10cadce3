//! Error types for the duel domain.

use crate::model::GameMode;
use realtime::{SessionId, UserId};
use thiserror::Error;

/// A game operation refused because it would break a session invariant.
///
/// Rejections never change stored state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("game is not in progress")]
    NotInProgress,

    #[error("game is not waiting for a second player")]
    NotWaiting,

    #[error("user {0} is not a participant of this game")]
    NotParticipant(UserId),

    #[error("cell ({x}, {y}) is outside the {grid_size}x{grid_size} grid")]
    OutOfBounds { x: u32, y: u32, grid_size: u32 },

    #[error("all {quota} pixels have already been placed")]
    QuotaExhausted { quota: u32 },

    #[error("cell ({x}, {y}) was already placed by this player")]
    CellTaken { x: u32, y: u32 },

    #[error("cannot join your own game")]
    OwnGame,

    #[error("operation requires a {0} game")]
    WrongMode(GameMode),

    #[error("only the creator can cancel this game")]
    NotCreator,

    #[error("game has no sequence to answer")]
    NoSequence,
}

/// Storage collaborator failures.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum DuelError {
    #[error("Game not found: {0}")]
    NotFound(String),

    #[error("Rejected: {0}")]
    Rejected(#[from] Rejection),

    #[error("Could not generate a unique game code after {0} attempts")]
    CodeGeneration(u32),

    #[error("Game {0} is under contention, retry later")]
    Contention(SessionId),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, DuelError>;
