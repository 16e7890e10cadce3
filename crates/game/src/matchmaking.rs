//! Cross-process FIFO pairing of PvP players.

use crate::engine::DuelEngine;
use crate::error::Result;
use crate::model::DuelSession;
use crate::store::{QueueEntry, QueueStore};
use chrono::Utc;
use metrics::{counter, gauge};
use realtime::UserId;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Queue and per-entry expiry.
pub const DEFAULT_QUEUE_TTL: Duration = Duration::from_secs(300);

/// Result surface of [`MatchmakingQueue::join`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JoinOutcome {
    Matched { game: DuelSession },
    Waiting,
}

pub struct MatchmakingQueue {
    queue: Arc<dyn QueueStore>,
    engine: Arc<DuelEngine>,
    ttl: Duration,
}

impl MatchmakingQueue {
    pub fn new(queue: Arc<dyn QueueStore>, engine: Arc<DuelEngine>) -> Self {
        Self::with_ttl(queue, engine, DEFAULT_QUEUE_TTL)
    }

    pub fn with_ttl(queue: Arc<dyn QueueStore>, engine: Arc<DuelEngine>, ttl: Duration) -> Self {
        Self { queue, engine, ttl }
    }

    /// Pair `user_id` with the oldest waiter, or queue it.
    ///
    /// The pop is atomic in the store, so two concurrent joiners never take
    /// the same waiter. Popping one's own entry puts it back instead of
    /// pairing. Entries older than the TTL are discarded.
    pub async fn join(&self, user_id: UserId) -> Result<JoinOutcome> {
        let opponent = loop {
            match self.queue.pop_oldest().await? {
                None => break None,
                Some(entry) if entry.is_expired(Utc::now(), self.ttl) => {
                    counter!("matchmaking_expired_total").increment(1);
                    debug!("Discarding stale queue entry for user {}", entry.user_id);
                }
                Some(entry) => break Some(entry),
            }
        };

        let Some(opponent) = opponent else {
            self.queue.enqueue(&QueueEntry::new(user_id), self.ttl).await?;
            counter!("matchmaking_joins_total", "outcome" => "waiting").increment(1);
            self.report_len().await;
            info!("User {} is waiting for an opponent", user_id);
            return Ok(JoinOutcome::Waiting);
        };

        if opponent.user_id == user_id {
            self.queue.requeue_front(&opponent).await?;
            counter!("matchmaking_joins_total", "outcome" => "self").increment(1);
            debug!("User {} popped its own entry, still waiting", user_id);
            return Ok(JoinOutcome::Waiting);
        }

        match self.engine.create_matched(opponent.user_id, user_id).await {
            Ok(game) => {
                counter!("matchmaking_joins_total", "outcome" => "matched").increment(1);
                self.report_len().await;
                Ok(JoinOutcome::Matched { game })
            }
            Err(e) => {
                // Don't lose the waiter because session creation failed.
                if let Err(requeue) = self.queue.requeue_front(&opponent).await {
                    warn!(
                        "Could not return user {} to the queue: {}",
                        opponent.user_id, requeue
                    );
                }
                Err(e)
            }
        }
    }

    /// Withdraw `user_id` from the queue. Idempotent.
    pub async fn leave(&self, user_id: UserId) -> Result<bool> {
        let removed = self.queue.withdraw(user_id).await?;
        if removed {
            info!("User {} left the queue", user_id);
            self.report_len().await;
        }
        Ok(removed)
    }

    pub async fn len(&self) -> Result<usize> {
        Ok(self.queue.len().await?)
    }

    async fn report_len(&self) {
        if let Ok(len) = self.queue.len().await {
            gauge!("matchmaking_waiting").set(len as f64);
        }
    }
}
