//! Storage seams for sessions and the matchmaking queue.
//!
//! Both are the only state that must stay consistent across processes, so the
//! traits expose atomic primitives (code reservation, compare-and-swap,
//! pop-oldest) rather than plain get/put.

use crate::error::StoreError;
use crate::model::{DuelSession, GameResult, LeaderboardEntry};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use realtime::{SessionId, UserId};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Persist a new session under a fresh id. Returns `None` when
    /// `session.code` is already taken.
    async fn insert(&self, session: DuelSession) -> StoreResult<Option<DuelSession>>;

    async fn get(&self, id: SessionId) -> StoreResult<Option<DuelSession>>;

    /// Lookup by exact (already normalised) code.
    async fn get_by_code(&self, code: &str) -> StoreResult<Option<DuelSession>>;

    /// Replace the stored session only if its version still equals
    /// `expected_version`. Returns whether the write happened.
    async fn compare_and_swap(
        &self,
        session: &DuelSession,
        expected_version: u64,
    ) -> StoreResult<bool>;

    /// Append a result and raise the user's leaderboard entry if it is a
    /// new best.
    async fn record_result(&self, result: &GameResult) -> StoreResult<()>;

    async fn results(&self, session_id: SessionId) -> StoreResult<Vec<GameResult>>;

    /// Best entry per user, highest level first, earliest achievement
    /// breaking ties.
    async fn leaderboard(&self, limit: usize) -> StoreResult<Vec<LeaderboardEntry>>;
}

/// A user waiting to be paired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub user_id: UserId,
    pub enqueued_at: DateTime<Utc>,
}

impl QueueEntry {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            enqueued_at: Utc::now(),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        match chrono::Duration::from_std(ttl) {
            Ok(ttl) => now - self.enqueued_at > ttl,
            Err(_) => false,
        }
    }
}

#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Atomically remove and return the oldest entry.
    async fn pop_oldest(&self) -> StoreResult<Option<QueueEntry>>;

    /// Append `entry` after dropping any existing entry for the same user,
    /// and set the queue expiry to `ttl` if none is set.
    async fn enqueue(&self, entry: &QueueEntry, ttl: Duration) -> StoreResult<()>;

    /// Put a popped entry back at the head of the queue, replacing any newer
    /// entry for the same user.
    async fn requeue_front(&self, entry: &QueueEntry) -> StoreResult<()>;

    /// Remove the first entry for `user_id`. Returns whether one was found.
    async fn withdraw(&self, user_id: UserId) -> StoreResult<bool>;

    async fn len(&self) -> StoreResult<usize>;
}

/// Process-local session store.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: DashMap<SessionId, DuelSession>,
    codes: DashMap<String, SessionId>,
    results: DashMap<SessionId, Vec<GameResult>>,
    best: DashMap<UserId, LeaderboardEntry>,
    next_id: AtomicI64,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn insert(&self, mut session: DuelSession) -> StoreResult<Option<DuelSession>> {
        match self.codes.entry(session.code.clone()) {
            Entry::Occupied(_) => Ok(None),
            Entry::Vacant(slot) => {
                session.id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
                slot.insert(session.id);
                self.sessions.insert(session.id, session.clone());
                Ok(Some(session))
            }
        }
    }

    async fn get(&self, id: SessionId) -> StoreResult<Option<DuelSession>> {
        Ok(self.sessions.get(&id).map(|s| s.clone()))
    }

    async fn get_by_code(&self, code: &str) -> StoreResult<Option<DuelSession>> {
        let id = match self.codes.get(code) {
            Some(id) => *id,
            None => return Ok(None),
        };
        self.get(id).await
    }

    async fn compare_and_swap(
        &self,
        session: &DuelSession,
        expected_version: u64,
    ) -> StoreResult<bool> {
        match self.sessions.get_mut(&session.id) {
            Some(mut current) if current.version == expected_version => {
                *current = session.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_result(&self, result: &GameResult) -> StoreResult<()> {
        self.results
            .entry(result.session_id)
            .or_default()
            .push(result.clone());

        match self.best.entry(result.user_id) {
            Entry::Occupied(mut best) => {
                if best.get().is_beaten_by(result) {
                    best.insert(LeaderboardEntry::from_result(result));
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(LeaderboardEntry::from_result(result));
            }
        }
        Ok(())
    }

    async fn results(&self, session_id: SessionId) -> StoreResult<Vec<GameResult>> {
        Ok(self
            .results
            .get(&session_id)
            .map(|r| r.clone())
            .unwrap_or_default())
    }

    async fn leaderboard(&self, limit: usize) -> StoreResult<Vec<LeaderboardEntry>> {
        let mut entries: Vec<LeaderboardEntry> =
            self.best.iter().map(|e| e.value().clone()).collect();
        entries.sort_by(|a, b| a.rank_cmp(b));
        entries.truncate(limit);
        Ok(entries)
    }
}

#[derive(Default)]
struct QueueState {
    entries: VecDeque<QueueEntry>,
    expires_at: Option<Instant>,
}

impl QueueState {
    /// Whole-queue expiry, mirroring a key TTL.
    fn purge_if_expired(&mut self) {
        if let Some(deadline) = self.expires_at {
            if Instant::now() >= deadline {
                self.entries.clear();
                self.expires_at = None;
            }
        }
    }

    fn clear_expiry_if_empty(&mut self) {
        if self.entries.is_empty() {
            self.expires_at = None;
        }
    }
}

/// Process-local matchmaking queue.
#[derive(Default)]
pub struct MemoryQueueStore {
    state: Mutex<QueueState>,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut QueueState) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.purge_if_expired();
        let out = f(&mut state);
        state.clear_expiry_if_empty();
        out
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn pop_oldest(&self) -> StoreResult<Option<QueueEntry>> {
        Ok(self.with_state(|s| s.entries.pop_front()))
    }

    async fn enqueue(&self, entry: &QueueEntry, ttl: Duration) -> StoreResult<()> {
        self.with_state(|s| {
            s.entries.retain(|e| e.user_id != entry.user_id);
            s.entries.push_back(entry.clone());
            if s.expires_at.is_none() {
                s.expires_at = Some(Instant::now() + ttl);
            }
        });
        Ok(())
    }

    async fn requeue_front(&self, entry: &QueueEntry) -> StoreResult<()> {
        self.with_state(|s| {
            s.entries.retain(|e| e.user_id != entry.user_id);
            s.entries.push_front(entry.clone());
        });
        Ok(())
    }

    async fn withdraw(&self, user_id: UserId) -> StoreResult<bool> {
        Ok(self.with_state(|s| {
            match s.entries.iter().position(|e| e.user_id == user_id) {
                Some(index) => {
                    s.entries.remove(index);
                    true
                }
                None => false,
            }
        }))
    }

    async fn len(&self) -> StoreResult<usize> {
        Ok(self.with_state(|s| s.entries.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(code: &str) -> DuelSession {
        DuelSession::pvp_waiting(code.to_string(), 1, Utc::now())
    }

    #[tokio::test]
    async fn test_insert_assigns_ids_and_reserves_codes() {
        let store = MemorySessionStore::new();
        let a = store.insert(session("AAAAAA")).await.unwrap().unwrap();
        let b = store.insert(session("BBBBBB")).await.unwrap().unwrap();
        assert_ne!(a.id, b.id);
        assert!(store.insert(session("AAAAAA")).await.unwrap().is_none());
        assert_eq!(store.len(), 2);

        let found = store.get_by_code("BBBBBB").await.unwrap().unwrap();
        assert_eq!(found.id, b.id);
    }

    #[tokio::test]
    async fn test_compare_and_swap_rejects_stale_version() {
        let store = MemorySessionStore::new();
        let mut s = store.insert(session("AAAAAA")).await.unwrap().unwrap();

        s.version = 1;
        s.current_level = 2;
        assert!(store.compare_and_swap(&s, 0).await.unwrap());

        let mut stale = s.clone();
        stale.version = 2;
        stale.current_level = 99;
        assert!(!store.compare_and_swap(&stale, 0).await.unwrap());

        let stored = store.get(s.id).await.unwrap().unwrap();
        assert_eq!(stored.current_level, 2);
        assert_eq!(stored.version, 1);
    }

    fn result(user_id: UserId, level: u32, at_secs: i64) -> GameResult {
        GameResult {
            session_id: 1,
            user_id,
            level_reached: level,
            correct_answers: level,
            errors: 0,
            play_time_seconds: None,
            created_at: DateTime::from_timestamp(1_700_000_000 + at_secs, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_leaderboard_ranks_best_level_then_earliest() {
        let store = MemorySessionStore::new();
        store.record_result(&result(1, 5, 10)).await.unwrap();
        store.record_result(&result(2, 7, 30)).await.unwrap();
        store.record_result(&result(3, 7, 20)).await.unwrap();
        // Lower and equal levels never replace a best.
        store.record_result(&result(3, 2, 40)).await.unwrap();
        store.record_result(&result(2, 7, 50)).await.unwrap();
        store.record_result(&result(1, 6, 60)).await.unwrap();

        let board = store.leaderboard(10).await.unwrap();
        let ranked: Vec<_> = board.iter().map(|e| (e.user_id, e.max_level)).collect();
        assert_eq!(ranked, vec![(3, 7), (2, 7), (1, 6)]);
        assert_eq!(board[1].first_achieved, result(2, 7, 30).created_at);

        assert_eq!(store.leaderboard(2).await.unwrap().len(), 2);
        assert!(store.leaderboard(0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_queue_is_fifo() {
        let queue = MemoryQueueStore::new();
        let ttl = Duration::from_secs(300);
        queue.enqueue(&QueueEntry::new(1), ttl).await.unwrap();
        queue.enqueue(&QueueEntry::new(2), ttl).await.unwrap();
        assert_eq!(queue.pop_oldest().await.unwrap().unwrap().user_id, 1);
        assert_eq!(queue.pop_oldest().await.unwrap().unwrap().user_id, 2);
        assert!(queue.pop_oldest().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_enqueue_dedupes_per_user() {
        let queue = MemoryQueueStore::new();
        let ttl = Duration::from_secs(300);
        queue.enqueue(&QueueEntry::new(1), ttl).await.unwrap();
        queue.enqueue(&QueueEntry::new(2), ttl).await.unwrap();
        queue.enqueue(&QueueEntry::new(1), ttl).await.unwrap();
        assert_eq!(queue.len().await.unwrap(), 2);
        assert_eq!(queue.pop_oldest().await.unwrap().unwrap().user_id, 2);
    }

    #[tokio::test]
    async fn test_withdraw_is_idempotent() {
        let queue = MemoryQueueStore::new();
        queue
            .enqueue(&QueueEntry::new(7), Duration::from_secs(300))
            .await
            .unwrap();
        assert!(queue.withdraw(7).await.unwrap());
        assert!(!queue.withdraw(7).await.unwrap());
        assert_eq!(queue.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_queue_ttl_expires_whole_queue() {
        let queue = MemoryQueueStore::new();
        let ttl = Duration::from_millis(20);
        queue.enqueue(&QueueEntry::new(1), ttl).await.unwrap();
        queue.enqueue(&QueueEntry::new(2), ttl).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(queue.len().await.unwrap(), 0);
        assert!(queue.pop_oldest().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_requeue_front_goes_first() {
        let queue = MemoryQueueStore::new();
        let ttl = Duration::from_secs(300);
        queue.enqueue(&QueueEntry::new(1), ttl).await.unwrap();
        let popped = queue.pop_oldest().await.unwrap().unwrap();
        queue.enqueue(&QueueEntry::new(2), ttl).await.unwrap();
        queue.requeue_front(&popped).await.unwrap();
        assert_eq!(queue.pop_oldest().await.unwrap().unwrap().user_id, 1);
    }

    #[test]
    fn test_entry_expiry() {
        let mut entry = QueueEntry::new(1);
        let ttl = Duration::from_secs(300);
        assert!(!entry.is_expired(Utc::now(), ttl));
        entry.enqueued_at = Utc::now() - chrono::Duration::seconds(301);
        assert!(entry.is_expired(Utc::now(), ttl));
    }
}
