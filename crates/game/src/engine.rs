//! DuelSessionEngine: the only writer of [`DuelSession`] state.
//!
//! Every mutation is a read-modify-write that is
//! 1. serialised in-process on a per-session async mutex, and
//! 2. committed with [`SessionStore::compare_and_swap`] against the version it
//!    read, retrying on conflict.
//!
//! The mutex removes local contention; the CAS is what makes the update safe
//! when both players of a duel are served by different processes.

use crate::code::{generate_game_code, normalize_code};
use crate::error::{DuelError, Rejection, Result};
use crate::model::{
    Cell, DuelSession, GameMode, GameResult, GameStatus, LeaderboardEntry, PlacementOutcome,
};
use crate::solo::validate_sequence;
use crate::store::SessionStore;
use chrono::Utc;
use dashmap::DashMap;
use metrics::counter;
use realtime::{BroadcastBus, BroadcastEvent, Scope, SessionId, UserId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct DuelConfig {
    /// Attempts at generating an unused game code.
    pub max_code_attempts: u32,
    /// Compare-and-swap attempts before giving up with `Contention`.
    pub max_update_attempts: u32,
}

impl Default for DuelConfig {
    fn default() -> Self {
        Self {
            max_code_attempts: 10,
            max_update_attempts: 8,
        }
    }
}

/// Leaderboard size when the caller does not ask for one.
pub const DEFAULT_LEADERBOARD_LIMIT: usize = 10;

/// Upper bound on a single leaderboard page.
pub const MAX_LEADERBOARD_LIMIT: usize = 100;

/// Answer to a solo level attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerOutcome {
    pub correct: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_level: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grid_size: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence: Option<Vec<Cell>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level_reached: Option<u32>,
}

/// Self-reported score submitted when a participant ends a game.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinishReport {
    pub level_reached: u32,
    #[serde(default)]
    pub correct_answers: u32,
    #[serde(default)]
    pub errors: u32,
    #[serde(default)]
    pub play_time_seconds: Option<u32>,
}

pub struct DuelEngine {
    store: Arc<dyn SessionStore>,
    bus: Arc<BroadcastBus>,
    locks: DashMap<SessionId, Arc<Mutex<()>>>,
    config: DuelConfig,
}

impl DuelEngine {
    pub fn new(store: Arc<dyn SessionStore>, bus: Arc<BroadcastBus>) -> Self {
        Self::with_config(store, bus, DuelConfig::default())
    }

    pub fn with_config(
        store: Arc<dyn SessionStore>,
        bus: Arc<BroadcastBus>,
        config: DuelConfig,
    ) -> Self {
        Self {
            store,
            bus,
            locks: DashMap::new(),
            config,
        }
    }

    // =========================================================================
    // Creation
    // =========================================================================

    pub async fn create_solo(&self, user_id: UserId) -> Result<DuelSession> {
        let session = self
            .insert_with_code(|code| {
                Ok(DuelSession::solo(code, user_id, &mut rand::thread_rng(), Utc::now()))
            })
            .await?;
        info!("User {} started solo game {}", user_id, session.id);
        Ok(session)
    }

    pub async fn create_pvp(&self, user_id: UserId) -> Result<DuelSession> {
        let session = self
            .insert_with_code(|code| Ok(DuelSession::pvp_waiting(code, user_id, Utc::now())))
            .await?;
        info!(
            "User {} created PvP game {} ({})",
            user_id, session.id, session.code
        );
        Ok(session)
    }

    /// Session for a queue pairing: `player1` waited, `player2` arrived.
    pub async fn create_matched(&self, player1: UserId, player2: UserId) -> Result<DuelSession> {
        let session = self
            .insert_with_code(|code| {
                Ok(DuelSession::pvp_matched(code, player1, player2, Utc::now())?)
            })
            .await?;
        info!(
            "Matched users {} and {} in game {}",
            player1, player2, session.id
        );
        Ok(session)
    }

    async fn insert_with_code<F>(&self, build: F) -> Result<DuelSession>
    where
        F: Fn(String) -> Result<DuelSession>,
    {
        for attempt in 1..=self.config.max_code_attempts {
            let code = generate_game_code(&mut rand::thread_rng());
            let session = build(code)?;
            if let Some(stored) = self.store.insert(session).await? {
                counter!("game_sessions_created_total").increment(1);
                return Ok(stored);
            }
            debug!("Game code collision on attempt {}", attempt);
        }
        warn!(
            "Gave up generating a game code after {} attempts",
            self.config.max_code_attempts
        );
        Err(DuelError::CodeGeneration(self.config.max_code_attempts))
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    pub async fn get(&self, id: SessionId) -> Result<DuelSession> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| DuelError::NotFound(id.to_string()))
    }

    /// Look up by invitation code; only participants may see the session.
    pub async fn get_by_code(&self, code: &str, user_id: UserId) -> Result<DuelSession> {
        let code = normalize_code(code);
        let session = self
            .store
            .get_by_code(&code)
            .await?
            .ok_or_else(|| DuelError::NotFound(code.clone()))?;
        if !session.is_participant(user_id) {
            return Err(Rejection::NotParticipant(user_id).into());
        }
        Ok(session)
    }

    /// Global ranking of every user's best reported level.
    pub async fn leaderboard(&self, limit: usize) -> Result<Vec<LeaderboardEntry>> {
        let limit = limit.min(MAX_LEADERBOARD_LIMIT);
        Ok(self.store.leaderboard(limit).await?)
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    pub async fn join_by_code(&self, code: &str, user_id: UserId) -> Result<DuelSession> {
        let code = normalize_code(code);
        let existing = self
            .store
            .get_by_code(&code)
            .await?
            .ok_or_else(|| DuelError::NotFound(code.clone()))?;

        let (session, ()) = self
            .update(existing.id, |session| {
                Ok(session.join_sequence_duel(user_id, &mut rand::thread_rng())?)
            })
            .await?;

        info!("User {} joined game {}", user_id, session.id);
        self.publish(
            session.id,
            BroadcastEvent::PlayerJoined {
                user_id,
                game_id: session.id,
            },
        )
        .await;
        Ok(session)
    }

    /// Check an answer against the session's current sequence, for solo
    /// games and code-joined duels alike. Correct answers advance the level;
    /// wrong ones leave the session untouched and report the last completed
    /// level.
    pub async fn submit_answer(
        &self,
        id: SessionId,
        user_id: UserId,
        submitted: &[Cell],
    ) -> Result<AnswerOutcome> {
        let (_, outcome) = self
            .update(id, |session| {
                if !session.is_participant(user_id) {
                    return Err(Rejection::NotParticipant(user_id).into());
                }
                if session.status != GameStatus::InProgress {
                    return Err(Rejection::NotInProgress.into());
                }
                if !session.has_sequence() {
                    return Err(Rejection::NoSequence.into());
                }
                if !validate_sequence(submitted, &session.sequence) {
                    return Ok(AnswerOutcome {
                        correct: false,
                        next_level: None,
                        grid_size: None,
                        sequence: None,
                        level_reached: Some(session.current_level.saturating_sub(1)),
                    });
                }
                session.advance_level(&mut rand::thread_rng())?;
                Ok(AnswerOutcome {
                    correct: true,
                    next_level: Some(session.current_level),
                    grid_size: Some(session.grid_size),
                    sequence: Some(session.sequence.clone()),
                    level_reached: None,
                })
            })
            .await?;

        counter!("game_answers_total", "correct" => outcome.correct.to_string()).increment(1);
        Ok(outcome)
    }

    /// Advance a sequence game to its next level unconditionally.
    pub async fn advance_level(&self, id: SessionId) -> Result<DuelSession> {
        let (session, ()) = self
            .update(id, |session| {
                session.advance_level(&mut rand::thread_rng())?;
                Ok(())
            })
            .await?;
        Ok(session)
    }

    /// Place one PvP pixel. Evaluated atomically per session, so exactly one
    /// call observes the completion and decides the winner.
    pub async fn place_pixel(
        &self,
        id: SessionId,
        actor: UserId,
        x: u32,
        y: u32,
        color: &str,
    ) -> Result<PlacementOutcome> {
        let result = self
            .update(id, |session| {
                Ok(session.place_pixel(actor, x, y, color, Utc::now())?)
            })
            .await;

        let (_, outcome) = match result {
            Ok(ok) => ok,
            Err(DuelError::Rejected(reason)) => {
                counter!("game_placement_rejections_total").increment(1);
                debug!("Placement by {} in game {} rejected: {}", actor, id, reason);
                return Err(DuelError::Rejected(reason));
            }
            Err(e) => return Err(e),
        };

        self.publish(
            id,
            BroadcastEvent::PixelPlaced {
                game_id: id,
                user_id: actor,
                x,
                y,
                color: color.to_string(),
                pixels_placed: outcome.pixels_placed,
                pixels_remaining: outcome.pixels_remaining,
            },
        )
        .await;

        if outcome.game_finished {
            info!(
                "Game {} finished, winner: {:?}",
                id, outcome.winner_id
            );
            counter!("game_finished_total", "mode" => "pvp").increment(1);
            self.publish(
                id,
                BroadcastEvent::GameFinished {
                    game_id: id,
                    winner_id: outcome.winner_id,
                },
            )
            .await;
        }
        Ok(outcome)
    }

    /// Record a participant's result. Solo sessions finish immediately;
    /// PvP sessions finish once both participants have reported.
    pub async fn finish(
        &self,
        id: SessionId,
        user_id: UserId,
        report: FinishReport,
    ) -> Result<GameResult> {
        let session = self.get(id).await?;
        if !session.is_participant(user_id) {
            return Err(Rejection::NotParticipant(user_id).into());
        }

        let result = GameResult {
            session_id: id,
            user_id,
            level_reached: report.level_reached,
            correct_answers: report.correct_answers,
            errors: report.errors,
            play_time_seconds: report.play_time_seconds,
            created_at: Utc::now(),
        };
        self.store.record_result(&result).await?;

        let reporters: HashSet<UserId> = self
            .store
            .results(id)
            .await?
            .into_iter()
            .map(|r| r.user_id)
            .collect();
        let everyone_reported = match session.mode {
            GameMode::Solo => true,
            GameMode::Pvp => reporters.len() >= 2,
        };

        if everyone_reported {
            let (session, finished) = self
                .update(id, |session| {
                    if session.status != GameStatus::InProgress {
                        return Ok(false);
                    }
                    session.transition(GameStatus::Finished, Utc::now())?;
                    Ok(true)
                })
                .await?;
            if finished {
                info!("Game {} finished after all results were reported", id);
                counter!("game_finished_total", "mode" => session.mode.to_string()).increment(1);
                self.publish(
                    id,
                    BroadcastEvent::GameFinished {
                        game_id: id,
                        winner_id: session.winner_id,
                    },
                )
                .await;
            }
        }
        Ok(result)
    }

    /// Creator-only cancellation of a session still waiting for an opponent.
    pub async fn cancel(&self, id: SessionId, user_id: UserId) -> Result<DuelSession> {
        let (session, ()) = self
            .update(id, |session| {
                if session.player1_id != user_id {
                    return Err(Rejection::NotCreator.into());
                }
                session.transition(GameStatus::Cancelled, Utc::now())?;
                Ok(())
            })
            .await?;
        info!("Game {} cancelled by {}", id, user_id);
        self.publish(id, BroadcastEvent::GameCancelled { game_id: id })
            .await;
        Ok(session)
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Load, mutate and commit one session.
    ///
    /// `mutate` may run more than once if another writer commits first; it
    /// must only depend on the session it is handed. An unchanged session is
    /// not written back.
    async fn update<T, F>(&self, id: SessionId, mut mutate: F) -> Result<(DuelSession, T)>
    where
        F: FnMut(&mut DuelSession) -> Result<T>,
    {
        let lock = self.session_lock(id);
        let result = {
            let _guard = lock.lock().await;
            self.update_locked(id, &mut mutate).await
        };
        drop(lock);
        self.release_lock(id);
        result
    }

    async fn update_locked<T, F>(&self, id: SessionId, mutate: &mut F) -> Result<(DuelSession, T)>
    where
        F: FnMut(&mut DuelSession) -> Result<T>,
    {
        for _ in 0..self.config.max_update_attempts {
            let current = self.get(id).await?;
            let mut next = current.clone();
            let out = mutate(&mut next)?;
            if next == current {
                return Ok((next, out));
            }
            next.version = current.version + 1;
            if self.store.compare_and_swap(&next, current.version).await? {
                return Ok((next, out));
            }
            counter!("game_cas_conflicts_total").increment(1);
            debug!("Version conflict on game {}, retrying", id);
        }
        warn!("Game {} still contended after retries", id);
        Err(DuelError::Contention(id))
    }

    fn session_lock(&self, id: SessionId) -> Arc<Mutex<()>> {
        self.locks.entry(id).or_default().clone()
    }

    /// Drop the lock entry once nobody else holds a handle to it.
    fn release_lock(&self, id: SessionId) {
        self.locks.remove_if(&id, |_, lock| Arc::strong_count(lock) == 1);
    }

    async fn publish(&self, id: SessionId, event: BroadcastEvent) {
        let kind = event.kind();
        if let Err(e) = self.bus.publish(Scope::Duel(id), event, None).await {
            warn!("Failed to publish {} for game {}: {}", kind, id, e);
        }
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }
}
