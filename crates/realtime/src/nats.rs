//! NATS Core broker (fire-and-forget, lowest latency).

use crate::broker::{Broker, EventStream};
use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tracing::info;

/// Broker backed by NATS Core subjects.
///
/// NATS delivers a process's own publications back to its subscriptions,
/// so local connections are served by the same relay as remote ones.
#[derive(Clone)]
pub struct NatsBroker {
    client: async_nats::Client,
}

impl NatsBroker {
    /// Connect to a NATS server.
    pub async fn connect(url: &str) -> Result<Self> {
        info!("Connecting to NATS at {}", url);
        let client = async_nats::connect(url).await?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Broker for NatsBroker {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        self.client.publish(topic.to_string(), payload).await?;
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<EventStream> {
        info!("Subscribing to subject: {}", topic);
        let subscriber = self.client.subscribe(topic.to_string()).await?;
        Ok(subscriber.map(|msg| msg.payload).boxed())
    }
}
