//! Broadcast bus: scope events → broker topics → local connections.
//!
//! Publishing never touches the local registry directly. Each process runs
//! at most one relay task per topic; the relay decodes envelopes in arrival
//! order and hands them to `ConnectionRegistry::deliver_event`.

use crate::broker::{Broker, EventStream};
use crate::error::Result;
use crate::event::{BroadcastEvent, Envelope};
use crate::registry::{ConnectionId, ConnectionRegistry};
use crate::scope::Scope;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::StreamExt;
use metrics::{counter, gauge};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Initial delay before a relay resubscribes.
const RELAY_INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Upper bound on the relay resubscribe delay.
const RELAY_MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Topic naming for scopes.
#[derive(Debug, Clone)]
pub struct TopicConfig {
    /// Topic carrying canvas events.
    pub canvas: String,
    /// Prefix of per-session duel topics (`{prefix}.{session_id}`).
    pub duel_prefix: String,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            canvas: "pixel_updates".to_string(),
            duel_prefix: "duel.session".to_string(),
        }
    }
}

impl TopicConfig {
    pub fn topic(&self, scope: Scope) -> String {
        match scope {
            Scope::Canvas => self.canvas.clone(),
            Scope::Duel(id) => format!("{}.{}", self.duel_prefix, id),
        }
    }
}

/// Running relay task. Dropping the handle stops the relay.
struct RelayHandle {
    task: JoinHandle<()>,
}

impl Drop for RelayHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Process-wide publish/subscribe relay.
pub struct BroadcastBus {
    broker: Arc<dyn Broker>,
    registry: Arc<ConnectionRegistry>,
    topics: TopicConfig,
    /// Topic → running relay.
    relays: DashMap<String, RelayHandle>,
}

impl BroadcastBus {
    pub fn new(
        broker: Arc<dyn Broker>,
        registry: Arc<ConnectionRegistry>,
        topics: TopicConfig,
    ) -> Self {
        Self {
            broker,
            registry,
            topics,
            relays: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn topic(&self, scope: Scope) -> String {
        self.topics.topic(scope)
    }

    /// Publish an event to every connection of `scope` on every process,
    /// skipping `exclude`.
    pub async fn publish(
        &self,
        scope: Scope,
        event: BroadcastEvent,
        exclude: Option<ConnectionId>,
    ) -> Result<()> {
        let kind = event.kind();
        let payload = serde_json::to_vec(&Envelope { exclude, event })?;
        self.broker
            .publish(&self.topic(scope), Bytes::from(payload))
            .await?;

        counter!("realtime_published_total", "event" => kind).increment(1);
        debug!("Published {} to {}", kind, scope);
        Ok(())
    }

    /// Make sure this process relays `scope`'s topic. Idempotent.
    ///
    /// When this returns Ok the subscription is live, so a publish issued
    /// afterwards reaches the local connections of the scope.
    pub async fn attach(&self, scope: Scope) -> Result<()> {
        let topic = self.topic(scope);
        if self.relays.contains_key(&topic) {
            return Ok(());
        }

        let stream = self.broker.subscribe(&topic).await?;
        let started = match self.relays.entry(topic.clone()) {
            // Lost the race to a concurrent attach; our stream is dropped here.
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                let task = tokio::spawn(run_relay(
                    scope,
                    topic.clone(),
                    stream,
                    self.broker.clone(),
                    self.registry.clone(),
                ));
                slot.insert(RelayHandle { task });
                true
            }
        };
        if started {
            gauge!("realtime_relays").set(self.relays.len() as f64);
            info!("Relay started for {} on '{}'", scope, topic);
        }
        Ok(())
    }

    /// Stop the relay of `scope` if the scope has no local connections left.
    ///
    /// The emptiness check runs under the relay table's shard lock, so a
    /// connection registered before a concurrent `attach` keeps its relay.
    pub fn detach(&self, scope: Scope) -> bool {
        let topic = self.topic(scope);
        let removed = self
            .relays
            .remove_if(&topic, |_, _| self.registry.scope_len(scope) == 0)
            .is_some();
        if removed {
            gauge!("realtime_relays").set(self.relays.len() as f64);
            info!("Relay stopped for {}", scope);
        }
        removed
    }

    /// Number of running relays in this process.
    pub fn relay_count(&self) -> usize {
        self.relays.len()
    }

    pub fn is_attached(&self, scope: Scope) -> bool {
        self.relays.contains_key(&self.topic(scope))
    }
}

/// Relay loop for one topic.
///
/// Decode failures drop the message; a finished subscription is replaced
/// with exponential backoff. Runs until aborted by `detach` or shutdown.
async fn run_relay(
    scope: Scope,
    topic: String,
    mut stream: EventStream,
    broker: Arc<dyn Broker>,
    registry: Arc<ConnectionRegistry>,
) {
    let mut backoff = RELAY_INITIAL_BACKOFF;

    loop {
        while let Some(payload) = stream.next().await {
            backoff = RELAY_INITIAL_BACKOFF;
            match serde_json::from_slice::<Envelope>(&payload) {
                Ok(envelope) => {
                    let report = registry
                        .deliver_event(scope, &envelope.event, envelope.exclude)
                        .await;
                    counter!("realtime_relayed_total").increment(1);
                    debug!(
                        "Relayed {} on '{}' to {} connections",
                        envelope.event.kind(),
                        topic,
                        report.delivered
                    );
                }
                Err(e) => {
                    warn!("Dropping malformed message on '{}': {}", topic, e);
                    counter!("realtime_relay_decode_errors_total").increment(1);
                }
            }
        }

        warn!("Subscription to '{}' ended, resubscribing", topic);
        loop {
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(RELAY_MAX_BACKOFF);
            match broker.subscribe(&topic).await {
                Ok(next) => {
                    stream = next;
                    break;
                }
                Err(e) => warn!("Resubscribe to '{}' failed: {:?}", topic, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::registry::Connection;
    use axum::extract::ws::Message;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(1);

    fn bus_with(broker: Arc<MemoryBroker>) -> BroadcastBus {
        BroadcastBus::new(
            broker,
            Arc::new(ConnectionRegistry::new()),
            TopicConfig::default(),
        )
    }

    async fn next_event(rx: &mut mpsc::Receiver<Message>) -> BroadcastEvent {
        match timeout(WAIT, rx.recv()).await.unwrap().unwrap() {
            Message::Text(t) => serde_json::from_str(t.as_str()).unwrap(),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_topic_names() {
        let topics = TopicConfig::default();
        assert_eq!(topics.topic(Scope::Canvas), "pixel_updates");
        assert_eq!(topics.topic(Scope::Duel(12)), "duel.session.12");
    }

    #[tokio::test]
    async fn test_publish_reaches_attached_scope() {
        let bus = bus_with(Arc::new(MemoryBroker::new()));
        let (conn, mut rx) = Connection::channel(Some(1));
        bus.registry().register(Scope::Canvas, conn);
        bus.attach(Scope::Canvas).await.unwrap();

        let event = BroadcastEvent::GameCancelled { game_id: 1 };
        bus.publish(Scope::Canvas, event.clone(), None).await.unwrap();

        assert_eq!(next_event(&mut rx).await, event);
    }

    #[tokio::test]
    async fn test_attach_twice_keeps_single_relay() {
        let bus = bus_with(Arc::new(MemoryBroker::new()));
        let (conn, mut rx) = Connection::channel(Some(1));
        bus.registry().register(Scope::Duel(5), conn);
        bus.attach(Scope::Duel(5)).await.unwrap();
        bus.attach(Scope::Duel(5)).await.unwrap();
        assert_eq!(bus.relay_count(), 1);

        bus.publish(Scope::Duel(5), BroadcastEvent::Pong, None)
            .await
            .unwrap();

        assert_eq!(next_event(&mut rx).await, BroadcastEvent::Pong);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_exclude_survives_the_broker_hop() {
        let bus = bus_with(Arc::new(MemoryBroker::new()));
        let (sender, mut rx_sender) = Connection::channel(Some(1));
        let (other, mut rx_other) = Connection::channel(Some(2));
        let sender_id = sender.id;
        bus.registry().register(Scope::Duel(9), sender);
        bus.registry().register(Scope::Duel(9), other);
        bus.attach(Scope::Duel(9)).await.unwrap();

        let event = BroadcastEvent::SequenceReady { user_id: 1 };
        bus.publish(Scope::Duel(9), event.clone(), Some(sender_id))
            .await
            .unwrap();

        assert_eq!(next_event(&mut rx_other).await, event);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx_sender.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_malformed_message_is_dropped_and_relay_survives() {
        let broker = Arc::new(MemoryBroker::new());
        let bus = bus_with(broker.clone());
        let (conn, mut rx) = Connection::channel(Some(1));
        bus.registry().register(Scope::Canvas, conn);
        bus.attach(Scope::Canvas).await.unwrap();

        broker
            .publish("pixel_updates", Bytes::from_static(b"{not json"))
            .await
            .unwrap();
        bus.publish(Scope::Canvas, BroadcastEvent::Pong, None)
            .await
            .unwrap();

        assert_eq!(next_event(&mut rx).await, BroadcastEvent::Pong);
    }

    #[tokio::test]
    async fn test_relay_preserves_publish_order() {
        let bus = bus_with(Arc::new(MemoryBroker::new()));
        let (conn, mut rx) = Connection::channel(Some(1));
        bus.registry().register(Scope::Duel(1), conn);
        bus.attach(Scope::Duel(1)).await.unwrap();

        for level in 0..50 {
            bus.publish(
                Scope::Duel(1),
                BroadcastEvent::LevelComplete {
                    user_id: 2,
                    level: Some(level),
                },
                None,
            )
            .await
            .unwrap();
        }

        for level in 0..50 {
            assert_eq!(
                next_event(&mut rx).await,
                BroadcastEvent::LevelComplete {
                    user_id: 2,
                    level: Some(level)
                }
            );
        }
    }

    #[tokio::test]
    async fn test_two_processes_share_a_topic() {
        let broker = Arc::new(MemoryBroker::new());
        let bus_a = bus_with(broker.clone());
        let bus_b = bus_with(broker);
        let (conn_a, mut rx_a) = Connection::channel(Some(1));
        let (conn_b, mut rx_b) = Connection::channel(Some(2));
        bus_a.registry().register(Scope::Duel(3), conn_a);
        bus_b.registry().register(Scope::Duel(3), conn_b);
        bus_a.attach(Scope::Duel(3)).await.unwrap();
        bus_b.attach(Scope::Duel(3)).await.unwrap();

        let event = BroadcastEvent::GameFinished {
            game_id: 3,
            winner_id: Some(2),
        };
        bus_a.publish(Scope::Duel(3), event.clone(), None).await.unwrap();

        assert_eq!(next_event(&mut rx_a).await, event);
        assert_eq!(next_event(&mut rx_b).await, event);
    }

    #[tokio::test]
    async fn test_detach_only_when_scope_is_empty() {
        let bus = bus_with(Arc::new(MemoryBroker::new()));
        let (conn, _rx) = Connection::channel(Some(1));
        let id = conn.id;
        bus.registry().register(Scope::Duel(4), conn);
        bus.attach(Scope::Duel(4)).await.unwrap();

        assert!(!bus.detach(Scope::Duel(4)));
        assert!(bus.is_attached(Scope::Duel(4)));

        bus.registry().unregister(Scope::Duel(4), &id);
        assert!(bus.detach(Scope::Duel(4)));
        assert_eq!(bus.relay_count(), 0);
    }
}
