//! Duel session state and the pure rules that mutate it.
//!
//! Everything here is synchronous and side-effect free; persistence,
//! locking and event fan-out live in [`crate::engine`].

use crate::error::Rejection;
use crate::solo::{generate_sequence, grid_size_for_level};
use chrono::{DateTime, Utc};
use rand::Rng;
use realtime::{SessionId, UserId};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const PVP_GRID_SIZE: u32 = 10;
pub const PVP_PIXEL_QUOTA: u32 = 5;
pub const DEFAULT_SHOW_DELAY_MS: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameMode {
    Solo,
    Pvp,
}

impl fmt::Display for GameMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GameMode::Solo => write!(f, "solo"),
            GameMode::Pvp => write!(f, "pvp"),
        }
    }
}

/// Lifecycle: `waiting -> in_progress -> finished`, or `waiting -> cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameStatus {
    Waiting,
    InProgress,
    Finished,
    Cancelled,
}

impl GameStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, GameStatus::Finished | GameStatus::Cancelled)
    }

    fn can_become(self, next: GameStatus) -> bool {
        matches!(
            (self, next),
            (GameStatus::Waiting, GameStatus::InProgress)
                | (GameStatus::Waiting, GameStatus::Cancelled)
                | (GameStatus::InProgress, GameStatus::Finished)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cell {
    pub x: u32,
    pub y: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacedPixel {
    pub x: u32,
    pub y: u32,
    pub color: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuelSession {
    /// Assigned by the [`crate::store::SessionStore`] on insert.
    pub id: SessionId,
    pub code: String,
    pub mode: GameMode,
    pub status: GameStatus,
    pub player1_id: UserId,
    pub player2_id: Option<UserId>,
    pub current_level: u32,
    pub grid_size: u32,
    pub sequence: Vec<Cell>,
    pub show_delay_ms: u32,
    pub pixels_to_place: u32,
    pub player1_pixels: Vec<PlacedPixel>,
    pub player2_pixels: Vec<PlacedPixel>,
    pub winner_id: Option<UserId>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Bumped on every committed mutation; the compare-and-swap token.
    pub version: u64,
}

/// Result surface of a PvP placement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementOutcome {
    pub game_id: SessionId,
    pub pixels_placed: u32,
    pub pixels_remaining: u32,
    pub game_finished: bool,
    pub winner_id: Option<UserId>,
    pub player1_pixels_count: u32,
    pub player2_pixels_count: u32,
}

/// A participant's self-reported score for a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameResult {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub level_reached: u32,
    pub correct_answers: u32,
    pub errors: u32,
    pub play_time_seconds: Option<u32>,
    pub created_at: DateTime<Utc>,
}

/// A user's best level across every reported result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub user_id: UserId,
    pub max_level: u32,
    /// When `max_level` was first reached.
    pub first_achieved: DateTime<Utc>,
}

impl LeaderboardEntry {
    pub fn from_result(result: &GameResult) -> Self {
        Self {
            user_id: result.user_id,
            max_level: result.level_reached,
            first_achieved: result.created_at,
        }
    }

    /// Whether `result` replaces this entry. Equal levels keep the earlier
    /// achievement.
    pub fn is_beaten_by(&self, result: &GameResult) -> bool {
        result.level_reached > self.max_level
    }

    /// Ranking order: higher level first, then whoever got there first.
    pub fn rank_cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .max_level
            .cmp(&self.max_level)
            .then(self.first_achieved.cmp(&other.first_achieved))
            .then(self.user_id.cmp(&other.user_id))
    }
}

impl DuelSession {
    fn blank(code: String, mode: GameMode, player1_id: UserId, now: DateTime<Utc>) -> Self {
        Self {
            id: 0,
            code,
            mode,
            status: GameStatus::Waiting,
            player1_id,
            player2_id: None,
            current_level: 1,
            grid_size: grid_size_for_level(1),
            sequence: Vec::new(),
            show_delay_ms: DEFAULT_SHOW_DELAY_MS,
            pixels_to_place: PVP_PIXEL_QUOTA,
            player1_pixels: Vec::new(),
            player2_pixels: Vec::new(),
            winner_id: None,
            created_at: now,
            finished_at: None,
            version: 0,
        }
    }

    /// Solo session at level 1, already in progress.
    pub fn solo<R: Rng + ?Sized>(
        code: String,
        player: UserId,
        rng: &mut R,
        now: DateTime<Utc>,
    ) -> Self {
        let mut session = Self::blank(code, GameMode::Solo, player, now);
        session.status = GameStatus::InProgress;
        session.sequence = generate_sequence(1, rng);
        session
    }

    /// PvP session waiting for a second player to join by code.
    pub fn pvp_waiting(code: String, creator: UserId, now: DateTime<Utc>) -> Self {
        let mut session = Self::blank(code, GameMode::Pvp, creator, now);
        session.grid_size = PVP_GRID_SIZE;
        session
    }

    /// PvP session created by matchmaking: both players set, in progress,
    /// PvP grid and quota, empty pixel lists.
    pub fn pvp_matched(
        code: String,
        player1: UserId,
        player2: UserId,
        now: DateTime<Utc>,
    ) -> Result<Self, Rejection> {
        let mut session = Self::pvp_waiting(code, player1, now);
        session.start_pvp(player2)?;
        Ok(session)
    }

    pub fn is_participant(&self, user_id: UserId) -> bool {
        self.player1_id == user_id || self.player2_id == Some(user_id)
    }

    pub fn opponent_of(&self, user_id: UserId) -> Option<UserId> {
        if self.player1_id == user_id {
            self.player2_id
        } else if self.player2_id == Some(user_id) {
            Some(self.player1_id)
        } else {
            None
        }
    }

    pub fn pixels_of(&self, user_id: UserId) -> Option<&[PlacedPixel]> {
        if self.player1_id == user_id {
            Some(&self.player1_pixels)
        } else if self.player2_id == Some(user_id) {
            Some(&self.player2_pixels)
        } else {
            None
        }
    }

    /// Move to `next`, refusing any transition out of a terminal status.
    pub fn transition(&mut self, next: GameStatus, now: DateTime<Utc>) -> Result<(), Rejection> {
        if !self.status.can_become(next) {
            return Err(match self.status {
                GameStatus::Waiting => Rejection::NotInProgress,
                _ if next == GameStatus::InProgress || next == GameStatus::Cancelled => {
                    Rejection::NotWaiting
                }
                _ => Rejection::NotInProgress,
            });
        }
        self.status = next;
        if next.is_terminal() {
            self.finished_at = Some(now);
        }
        Ok(())
    }

    /// Seat the second player of a waiting PvP session.
    pub fn start_pvp(&mut self, player2: UserId) -> Result<(), Rejection> {
        if self.mode != GameMode::Pvp {
            return Err(Rejection::WrongMode(GameMode::Pvp));
        }
        if self.status != GameStatus::Waiting {
            return Err(Rejection::NotWaiting);
        }
        if player2 == self.player1_id {
            return Err(Rejection::OwnGame);
        }
        self.status = GameStatus::InProgress;
        self.player2_id = Some(player2);
        self.current_level = 1;
        self.grid_size = PVP_GRID_SIZE;
        self.pixels_to_place = PVP_PIXEL_QUOTA;
        self.player1_pixels.clear();
        self.player2_pixels.clear();
        Ok(())
    }

    /// Seat the second player of a code-joined PvP session, which is played
    /// as a sequence duel from level 1 on the level's grid.
    pub fn join_sequence_duel<R: Rng + ?Sized>(
        &mut self,
        player2: UserId,
        rng: &mut R,
    ) -> Result<(), Rejection> {
        self.start_pvp(player2)?;
        self.grid_size = grid_size_for_level(self.current_level);
        self.sequence = generate_sequence(self.current_level, rng);
        Ok(())
    }

    /// Whether answers can be checked against this session.
    pub fn has_sequence(&self) -> bool {
        !self.sequence.is_empty()
    }

    /// Next level: level + 1, grid size recomputed, fresh sequence.
    ///
    /// Only sequence games advance; a queue-matched pixel duel keeps its
    /// fixed grid.
    pub fn advance_level<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<(), Rejection> {
        if self.status != GameStatus::InProgress {
            return Err(Rejection::NotInProgress);
        }
        if !self.has_sequence() {
            return Err(Rejection::NoSequence);
        }
        self.current_level += 1;
        self.grid_size = grid_size_for_level(self.current_level);
        self.sequence = generate_sequence(self.current_level, rng);
        Ok(())
    }

    /// Place one PvP pixel for `actor`.
    ///
    /// Checks run in order: status and participation, bounds, quota, then the
    /// actor's own duplicate cell. The other player's list is never consulted
    /// for duplicates. When both lists reach the quota the session finishes
    /// and the winner is decided by [`DuelSession::decide_winner`].
    pub fn place_pixel(
        &mut self,
        actor: UserId,
        x: u32,
        y: u32,
        color: &str,
        at: DateTime<Utc>,
    ) -> Result<PlacementOutcome, Rejection> {
        if self.status != GameStatus::InProgress {
            return Err(Rejection::NotInProgress);
        }
        if self.mode != GameMode::Pvp {
            return Err(Rejection::WrongMode(GameMode::Pvp));
        }
        let quota = self.pixels_to_place;
        let grid_size = self.grid_size;
        let own = if self.player1_id == actor {
            &mut self.player1_pixels
        } else if self.player2_id == Some(actor) {
            &mut self.player2_pixels
        } else {
            return Err(Rejection::NotParticipant(actor));
        };

        if x >= grid_size || y >= grid_size {
            return Err(Rejection::OutOfBounds { x, y, grid_size });
        }
        if own.len() as u32 >= quota {
            return Err(Rejection::QuotaExhausted { quota });
        }
        if own.iter().any(|p| p.x == x && p.y == y) {
            return Err(Rejection::CellTaken { x, y });
        }

        own.push(PlacedPixel {
            x,
            y,
            color: color.to_string(),
            timestamp: at,
        });
        let pixels_placed = own.len() as u32;

        let complete = self.player1_pixels.len() as u32 >= quota
            && self.player2_pixels.len() as u32 >= quota;
        if complete {
            self.winner_id = self.decide_winner();
            self.transition(GameStatus::Finished, at)?;
        }

        Ok(PlacementOutcome {
            game_id: self.id,
            pixels_placed,
            pixels_remaining: quota.saturating_sub(pixels_placed),
            game_finished: complete,
            winner_id: self.winner_id,
            player1_pixels_count: self.player1_pixels.len() as u32,
            player2_pixels_count: self.player2_pixels.len() as u32,
        })
    }

    /// The player whose last placement is strictly earlier wins; ties draw.
    pub fn decide_winner(&self) -> Option<UserId> {
        let p1_last = self.player1_pixels.last()?.timestamp;
        let p2_last = self.player2_pixels.last()?.timestamp;
        match p1_last.cmp(&p2_last) {
            std::cmp::Ordering::Less => Some(self.player1_id),
            std::cmp::Ordering::Greater => self.player2_id,
            std::cmp::Ordering::Equal => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    const P1: UserId = 100;
    const P2: UserId = 200;

    fn matched() -> DuelSession {
        DuelSession::pvp_matched("ABCDEF".into(), P1, P2, Utc::now()).unwrap()
    }

    fn fill(session: &mut DuelSession, actor: UserId, start: DateTime<Utc>, step_ms: i64) {
        for i in 0..PVP_PIXEL_QUOTA {
            let at = start + Duration::milliseconds(step_ms * i as i64);
            session.place_pixel(actor, i, i, "#FF0000", at).unwrap();
        }
    }

    #[test]
    fn test_matched_defaults() {
        let s = matched();
        assert_eq!(s.status, GameStatus::InProgress);
        assert_eq!(s.player1_id, P1);
        assert_eq!(s.player2_id, Some(P2));
        assert_eq!(s.grid_size, PVP_GRID_SIZE);
        assert_eq!(s.pixels_to_place, PVP_PIXEL_QUOTA);
        assert!(s.player1_pixels.is_empty() && s.player2_pixels.is_empty());
    }

    #[test]
    fn test_cannot_match_self() {
        let err = DuelSession::pvp_matched("ABCDEF".into(), P1, P1, Utc::now()).unwrap_err();
        assert_eq!(err, Rejection::OwnGame);
    }

    #[test]
    fn test_same_cell_same_player_rejected_other_player_accepted() {
        let mut s = matched();
        let now = Utc::now();
        s.place_pixel(P1, 3, 4, "#000000", now).unwrap();
        assert_eq!(
            s.place_pixel(P1, 3, 4, "#FFFFFF", now).unwrap_err(),
            Rejection::CellTaken { x: 3, y: 4 }
        );
        let outcome = s.place_pixel(P2, 3, 4, "#FFFFFF", now).unwrap();
        assert_eq!(outcome.pixels_placed, 1);
        assert_eq!(s.player1_pixels.len(), 1);
    }

    #[test]
    fn test_bounds_checked_before_quota() {
        let mut s = matched();
        fill(&mut s, P1, Utc::now(), 1);
        assert_eq!(
            s.place_pixel(P1, 10, 0, "#000000", Utc::now()).unwrap_err(),
            Rejection::OutOfBounds { x: 10, y: 0, grid_size: 10 }
        );
        assert_eq!(
            s.place_pixel(P1, 9, 9, "#000000", Utc::now()).unwrap_err(),
            Rejection::QuotaExhausted { quota: 5 }
        );
    }

    #[test]
    fn test_non_participant_rejected() {
        let mut s = matched();
        let before = s.clone();
        assert_eq!(
            s.place_pixel(999, 0, 0, "#000000", Utc::now()).unwrap_err(),
            Rejection::NotParticipant(999)
        );
        assert_eq!(s, before);
    }

    #[test]
    fn test_waiting_session_rejects_placement() {
        let mut s = DuelSession::pvp_waiting("ABCDEF".into(), P1, Utc::now());
        assert_eq!(
            s.place_pixel(P1, 0, 0, "#000000", Utc::now()).unwrap_err(),
            Rejection::NotInProgress
        );
    }

    #[test]
    fn test_earlier_last_placement_wins() {
        let mut s = matched();
        let t0 = Utc::now();
        fill(&mut s, P1, t0, 10);
        fill(&mut s, P2, t0 + Duration::milliseconds(1), 10);
        assert_eq!(s.status, GameStatus::Finished);
        assert_eq!(s.winner_id, Some(P1));
        assert!(s.finished_at.is_some());
    }

    #[test]
    fn test_later_finisher_can_still_win_on_timestamp() {
        let mut s = matched();
        let t0 = Utc::now();
        // P2 finishes its list first in call order but with later timestamps.
        fill(&mut s, P2, t0 + Duration::seconds(5), 1);
        fill(&mut s, P1, t0, 1);
        assert_eq!(s.winner_id, Some(P1));
    }

    #[test]
    fn test_equal_last_timestamps_draw() {
        let mut s = matched();
        let t0 = Utc::now();
        fill(&mut s, P1, t0, 0);
        let outcome = {
            for i in 0..PVP_PIXEL_QUOTA - 1 {
                s.place_pixel(P2, i, i, "#00FF00", t0).unwrap();
            }
            s.place_pixel(P2, 9, 9, "#00FF00", t0).unwrap()
        };
        assert!(outcome.game_finished);
        assert_eq!(outcome.winner_id, None);
        assert_eq!(s.status, GameStatus::Finished);
    }

    #[test]
    fn test_finished_is_terminal() {
        let mut s = matched();
        let now = Utc::now();
        s.transition(GameStatus::Finished, now).unwrap();
        assert!(s.transition(GameStatus::InProgress, now).is_err());
        assert!(s.transition(GameStatus::Cancelled, now).is_err());
        assert!(s.transition(GameStatus::Finished, now).is_err());
        assert_eq!(s.status, GameStatus::Finished);
    }

    #[test]
    fn test_cancel_only_from_waiting() {
        let now = Utc::now();
        let mut waiting = DuelSession::pvp_waiting("ABCDEF".into(), P1, now);
        waiting.transition(GameStatus::Cancelled, now).unwrap();
        assert_eq!(waiting.status, GameStatus::Cancelled);

        let mut running = matched();
        assert_eq!(
            running.transition(GameStatus::Cancelled, now).unwrap_err(),
            Rejection::NotWaiting
        );
    }

    #[test]
    fn test_advance_level_regenerates_sequence() {
        let mut rng = rand::thread_rng();
        let mut s = DuelSession::solo("ABCDEF".into(), P1, &mut rng, Utc::now());
        assert_eq!(s.sequence.len(), 1);
        for _ in 0..10 {
            s.advance_level(&mut rng).unwrap();
        }
        assert_eq!(s.current_level, 11);
        assert_eq!(s.grid_size, 4);
        assert_eq!(s.sequence.len(), 11);
    }

    #[test]
    fn test_code_join_plays_on_level_grid() {
        let mut rng = rand::thread_rng();
        let mut s = DuelSession::pvp_waiting("ABCDEF".into(), P1, Utc::now());
        s.join_sequence_duel(P2, &mut rng).unwrap();
        assert_eq!(s.status, GameStatus::InProgress);
        assert_eq!(s.player2_id, Some(P2));
        assert_eq!(s.current_level, 1);
        assert_eq!(s.grid_size, grid_size_for_level(1));
        assert_eq!(s.sequence.len(), 1);
        assert!(s.sequence.iter().all(|c| c.x < s.grid_size && c.y < s.grid_size));

        s.advance_level(&mut rng).unwrap();
        assert_eq!(s.current_level, 2);
        assert_eq!(s.sequence.len(), 2);
    }

    #[test]
    fn test_matched_pixel_duel_does_not_advance() {
        let mut s = matched();
        let before = s.clone();
        assert_eq!(
            s.advance_level(&mut rand::thread_rng()).unwrap_err(),
            Rejection::NoSequence
        );
        assert_eq!(s, before);
    }

    #[test]
    fn test_outcome_serializes_with_expected_keys() {
        let mut s = matched();
        let outcome = s.place_pixel(P1, 0, 0, "#123456", Utc::now()).unwrap();
        let json = serde_json::to_value(&outcome).unwrap();
        for key in [
            "game_id",
            "pixels_placed",
            "pixels_remaining",
            "game_finished",
            "winner_id",
            "player1_pixels_count",
            "player2_pixels_count",
        ] {
            assert!(json.get(key).is_some(), "missing {key}");
        }
        assert_eq!(json["pixels_remaining"], 4);
    }
}
