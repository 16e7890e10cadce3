//! Cross-process publish/subscribe seam.

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::broadcast;
use tracing::warn;

/// Stream of raw payloads published to one topic.
pub type EventStream = BoxStream<'static, Bytes>;

/// Best-effort, at-least-once message broker.
///
/// No persistence and no acknowledgments: a payload published while nobody
/// is subscribed to the topic is gone.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish a payload to every current subscriber of `topic`.
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()>;

    /// Subscribe to `topic`. The subscription is live once this returns.
    async fn subscribe(&self, topic: &str) -> Result<EventStream>;
}

/// Default per-topic buffer of the in-process broker.
pub const MEMORY_BROKER_CAPACITY: usize = 1024;

/// In-process broker for single-instance deployments and tests.
pub struct MemoryBroker {
    topics: DashMap<String, broadcast::Sender<Bytes>>,
    capacity: usize,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::with_capacity(MEMORY_BROKER_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            topics: DashMap::new(),
            capacity,
        }
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<Bytes> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        // Err only means there is no subscriber right now.
        let _ = self.sender(topic).send(payload);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<EventStream> {
        let rx = self.sender(topic).subscribe();
        let topic = topic.to_string();
        let stream = stream::unfold((rx, topic), |(mut rx, topic)| async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => return Some((payload, (rx, topic))),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Subscriber on '{}' lagged, skipped {} messages", topic, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }
}
