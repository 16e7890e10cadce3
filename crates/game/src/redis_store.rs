//! Redis-backed session and queue stores.
//!
//! Sessions live in a hash `duel:session:{id}` with two fields, `version` and
//! `data` (JSON), so compare-and-swap can be done by a Lua script without
//! decoding the payload. Codes are reserved with `SET NX` on
//! `duel:code:{code}`. The matchmaking queue is a single list of JSON entries.
//! The leaderboard is a sorted set ranked by [`leaderboard_score`] next to a
//! hash of the JSON entries it ranks.

use crate::model::{DuelSession, GameResult, LeaderboardEntry};
use crate::store::{QueueEntry, QueueStore, SessionStore, StoreResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use realtime::{SessionId, UserId};
use redis::AsyncCommands;
use redis::Script;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Redis key prefix for sessions: duel:session:{id}
pub const SESSION_KEY_PREFIX: &str = "duel:session:";

/// Redis key prefix for code reservations: duel:code:{code}
pub const CODE_KEY_PREFIX: &str = "duel:code:";

/// Monotonic session id counter.
pub const SESSION_ID_KEY: &str = "duel:session_id";

/// Redis key prefix for reported results: duel:results:{id}
pub const RESULTS_KEY_PREFIX: &str = "duel:results:";

/// Matchmaking list, oldest entry at the head.
pub const QUEUE_KEY: &str = "duel:queue";

/// Sorted set of user ids by best result.
pub const LEADERBOARD_KEY: &str = "duel:leaderboard";

/// Hash of user id → JSON [`LeaderboardEntry`].
pub const LEADERBOARD_ENTRIES_KEY: &str = "duel:leaderboard:entries";

/// Scores stay below 2^53 for levels under 900,000, so they survive the
/// sorted set's doubles exactly.
const LEVEL_WEIGHT: u64 = 10_000_000_000;

const COMPARE_AND_SWAP_SCRIPT: &str = r#"
local current = redis.call('HGET', KEYS[1], 'version')
if not current or current ~= ARGV[1] then
  return 0
end
redis.call('HSET', KEYS[1], 'version', ARGV[2], 'data', ARGV[3])
return 1
"#;

const ENQUEUE_SCRIPT: &str = r#"
local entries = redis.call('LRANGE', KEYS[1], 0, -1)
for _, raw in ipairs(entries) do
  if string.find(raw, ARGV[1], 1, true) then
    redis.call('LREM', KEYS[1], 1, raw)
  end
end
redis.call('RPUSH', KEYS[1], ARGV[2])
if redis.call('TTL', KEYS[1]) < 0 then
  redis.call('EXPIRE', KEYS[1], ARGV[3])
end
return redis.call('LLEN', KEYS[1])
"#;

const REQUEUE_SCRIPT: &str = r#"
local entries = redis.call('LRANGE', KEYS[1], 0, -1)
for _, raw in ipairs(entries) do
  if string.find(raw, ARGV[1], 1, true) then
    redis.call('LREM', KEYS[1], 1, raw)
  end
end
return redis.call('LPUSH', KEYS[1], ARGV[2])
"#;

const WITHDRAW_SCRIPT: &str = r#"
local entries = redis.call('LRANGE', KEYS[1], 0, -1)
for _, raw in ipairs(entries) do
  if string.find(raw, ARGV[1], 1, true) then
    redis.call('LREM', KEYS[1], 1, raw)
    return 1
  end
end
return 0
"#;

const RAISE_BEST_SCRIPT: &str = r#"
local current = redis.call('ZSCORE', KEYS[1], ARGV[1])
if current and tonumber(current) >= tonumber(ARGV[2]) then
  return 0
end
redis.call('ZADD', KEYS[1], ARGV[2], ARGV[1])
redis.call('HSET', KEYS[2], ARGV[1], ARGV[3])
return 1
"#;

/// Level in the high digits, inverted achievement second below it: a higher
/// level always ranks first, and at equal levels the earlier one does.
fn leaderboard_score(level: u32, achieved: DateTime<Utc>) -> u64 {
    let secs = achieved.timestamp().clamp(0, LEVEL_WEIGHT as i64 - 1) as u64;
    level as u64 * LEVEL_WEIGHT + (LEVEL_WEIGHT - 1 - secs)
}

fn session_key(id: SessionId) -> String {
    format!("{}{}", SESSION_KEY_PREFIX, id)
}

fn code_key(code: &str) -> String {
    format!("{}{}", CODE_KEY_PREFIX, code)
}

fn results_key(id: SessionId) -> String {
    format!("{}{}", RESULTS_KEY_PREFIX, id)
}

/// Substring that identifies a user's serialized [`QueueEntry`].
/// `user_id` is the first field, so it is always followed by a comma.
fn entry_needle(user_id: UserId) -> String {
    format!("\"user_id\":{},", user_id)
}

#[derive(Clone)]
pub struct RedisSessionStore {
    client: Arc<redis::Client>,
    cas_script: Arc<Script>,
    raise_best_script: Arc<Script>,
}

impl RedisSessionStore {
    pub fn new(redis_url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client: Arc::new(client),
            cas_script: Arc::new(Script::new(COMPARE_AND_SWAP_SCRIPT)),
            raise_best_script: Arc::new(Script::new(RAISE_BEST_SCRIPT)),
        })
    }

    async fn get_connection(&self) -> StoreResult<redis::aio::MultiplexedConnection> {
        let conn = self.client.get_multiplexed_async_connection().await?;
        Ok(conn)
    }
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    async fn insert(&self, mut session: DuelSession) -> StoreResult<Option<DuelSession>> {
        let mut conn = self.get_connection().await?;
        let id: SessionId = conn.incr(SESSION_ID_KEY, 1).await?;
        session.id = id;

        let reserved: bool = conn.set_nx(code_key(&session.code), id).await?;
        if !reserved {
            debug!("Game code {} already taken", session.code);
            return Ok(None);
        }

        let json = serde_json::to_string(&session)?;
        conn.hset_multiple::<_, _, _, ()>(
            session_key(id),
            &[("version", session.version.to_string()), ("data", json)],
        )
        .await?;
        debug!("Stored session {} with code {}", id, session.code);
        Ok(Some(session))
    }

    async fn get(&self, id: SessionId) -> StoreResult<Option<DuelSession>> {
        let mut conn = self.get_connection().await?;
        let json: Option<String> = conn.hget(session_key(id), "data").await?;
        match json {
            Some(j) => Ok(Some(serde_json::from_str(&j)?)),
            None => Ok(None),
        }
    }

    async fn get_by_code(&self, code: &str) -> StoreResult<Option<DuelSession>> {
        let mut conn = self.get_connection().await?;
        let id: Option<SessionId> = conn.get(code_key(code)).await?;
        match id {
            Some(id) => self.get(id).await,
            None => Ok(None),
        }
    }

    async fn compare_and_swap(
        &self,
        session: &DuelSession,
        expected_version: u64,
    ) -> StoreResult<bool> {
        let mut conn = self.get_connection().await?;
        let json = serde_json::to_string(session)?;
        let swapped: i32 = self
            .cas_script
            .key(session_key(session.id))
            .arg(expected_version.to_string())
            .arg(session.version.to_string())
            .arg(json)
            .invoke_async(&mut conn)
            .await?;
        Ok(swapped == 1)
    }

    async fn record_result(&self, result: &GameResult) -> StoreResult<()> {
        let mut conn = self.get_connection().await?;
        let json = serde_json::to_string(result)?;
        conn.rpush::<_, _, ()>(results_key(result.session_id), json)
            .await?;

        let entry = LeaderboardEntry::from_result(result);
        let raised: i32 = self
            .raise_best_script
            .key(LEADERBOARD_KEY)
            .key(LEADERBOARD_ENTRIES_KEY)
            .arg(result.user_id)
            .arg(leaderboard_score(entry.max_level, entry.first_achieved))
            .arg(serde_json::to_string(&entry)?)
            .invoke_async(&mut conn)
            .await?;
        if raised == 1 {
            debug!("User {} reached a new best of level {}", result.user_id, entry.max_level);
        }
        Ok(())
    }

    async fn results(&self, session_id: SessionId) -> StoreResult<Vec<GameResult>> {
        let mut conn = self.get_connection().await?;
        let raw: Vec<String> = conn.lrange(results_key(session_id), 0, -1).await?;
        let mut results = Vec::with_capacity(raw.len());
        for r in raw {
            results.push(serde_json::from_str(&r)?);
        }
        Ok(results)
    }

    async fn leaderboard(&self, limit: usize) -> StoreResult<Vec<LeaderboardEntry>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.get_connection().await?;
        let users: Vec<String> = conn
            .zrevrange(LEADERBOARD_KEY, 0, limit as isize - 1)
            .await?;
        if users.is_empty() {
            return Ok(Vec::new());
        }

        let raw: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(LEADERBOARD_ENTRIES_KEY)
            .arg(&users)
            .query_async(&mut conn)
            .await?;
        let mut entries = Vec::with_capacity(raw.len());
        for json in raw.into_iter().flatten() {
            match serde_json::from_str::<LeaderboardEntry>(&json) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!("Skipping malformed leaderboard entry: {}", e),
            }
        }
        // Equal scores come back in member order; settle them like the
        // in-memory store does.
        entries.sort_by(|a, b| a.rank_cmp(b));
        Ok(entries)
    }
}

#[derive(Clone)]
pub struct RedisQueueStore {
    client: Arc<redis::Client>,
    enqueue_script: Arc<Script>,
    requeue_script: Arc<Script>,
    withdraw_script: Arc<Script>,
}

impl RedisQueueStore {
    pub fn new(redis_url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client: Arc::new(client),
            enqueue_script: Arc::new(Script::new(ENQUEUE_SCRIPT)),
            requeue_script: Arc::new(Script::new(REQUEUE_SCRIPT)),
            withdraw_script: Arc::new(Script::new(WITHDRAW_SCRIPT)),
        })
    }

    async fn get_connection(&self) -> StoreResult<redis::aio::MultiplexedConnection> {
        let conn = self.client.get_multiplexed_async_connection().await?;
        Ok(conn)
    }
}

#[async_trait]
impl QueueStore for RedisQueueStore {
    async fn pop_oldest(&self) -> StoreResult<Option<QueueEntry>> {
        let mut conn = self.get_connection().await?;
        loop {
            let raw: Option<String> = conn.lpop(QUEUE_KEY, None).await?;
            let Some(raw) = raw else {
                return Ok(None);
            };
            match serde_json::from_str(&raw) {
                Ok(entry) => return Ok(Some(entry)),
                Err(e) => warn!("Dropping malformed queue entry {:?}: {}", raw, e),
            }
        }
    }

    async fn enqueue(&self, entry: &QueueEntry, ttl: Duration) -> StoreResult<()> {
        let mut conn = self.get_connection().await?;
        let json = serde_json::to_string(entry)?;
        let len: i64 = self
            .enqueue_script
            .key(QUEUE_KEY)
            .arg(entry_needle(entry.user_id))
            .arg(json)
            .arg(ttl.as_secs().max(1))
            .invoke_async(&mut conn)
            .await?;
        debug!("User {} queued, {} waiting", entry.user_id, len);
        Ok(())
    }

    async fn requeue_front(&self, entry: &QueueEntry) -> StoreResult<()> {
        let mut conn = self.get_connection().await?;
        let json = serde_json::to_string(entry)?;
        let _: i64 = self
            .requeue_script
            .key(QUEUE_KEY)
            .arg(entry_needle(entry.user_id))
            .arg(json)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn withdraw(&self, user_id: UserId) -> StoreResult<bool> {
        let mut conn = self.get_connection().await?;
        let removed: i32 = self
            .withdraw_script
            .key(QUEUE_KEY)
            .arg(entry_needle(user_id))
            .invoke_async(&mut conn)
            .await?;
        Ok(removed == 1)
    }

    async fn len(&self) -> StoreResult<usize> {
        let mut conn = self.get_connection().await?;
        let len: usize = conn.llen(QUEUE_KEY).await?;
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_formats() {
        assert_eq!(session_key(42), "duel:session:42");
        assert_eq!(code_key("ABCDEF"), "duel:code:ABCDEF");
        assert_eq!(results_key(7), "duel:results:7");
    }

    #[test]
    fn test_entry_needle_matches_serialized_entry() {
        let entry = QueueEntry::new(12345);
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains(&entry_needle(12345)));
        assert!(!json.contains(&entry_needle(1234)));
        assert!(!json.contains(&entry_needle(123456)));
    }

    #[test]
    fn test_leaderboard_score_orders_level_then_time() {
        let early = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let late = DateTime::from_timestamp(1_700_000_500, 0).unwrap();
        assert!(leaderboard_score(8, late) > leaderboard_score(7, early));
        assert!(leaderboard_score(7, early) > leaderboard_score(7, late));
        assert!(leaderboard_score(900_000, late) < 1 << 53);
    }

    #[test]
    fn test_client_open_rejects_bad_url() {
        assert!(RedisSessionStore::new("not a url").is_err());
        assert!(RedisQueueStore::new("redis://127.0.0.1:6379").is_ok());
    }
}
