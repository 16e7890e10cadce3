//! Connection registry keyed by scope.
//!
//! Uses a DashMap of per-scope DashMaps, so connects, disconnects and
//! deliveries on unrelated scopes never contend on a single lock.
//! An empty scope entry is removed in the same shard-locked step that
//! observes it empty.

use crate::event::BroadcastEvent;
use crate::scope::Scope;
use crate::UserId;
use axum::extract::ws::{Message, Utf8Bytes};
use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use metrics::{counter, gauge};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};
use uuid::Uuid;

/// Unique connection identifier.
pub type ConnectionId = Uuid;

/// Default buffer size for connection outbound channels.
pub const CONNECTION_CHANNEL_BUFFER_SIZE: usize = 256;

/// Default bound on a single send to a slow consumer.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(2);

/// One open duplex channel.
///
/// The socket task owns the receiving half of `tx`; the registry only ever
/// pushes into the bounded channel.
pub struct Connection {
    /// Unique connection identifier.
    pub id: ConnectionId,
    /// Authenticated user behind the connection, if known.
    pub user_id: Option<UserId>,
    /// Timestamp when the connection was opened (ms).
    pub connected_at: i64,
    tx: mpsc::Sender<Message>,
    evicted: AtomicBool,
    eviction: Notify,
}

impl Connection {
    /// Create a connection around an existing outbound sender.
    pub fn new(user_id: Option<UserId>, tx: mpsc::Sender<Message>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            connected_at: Utc::now().timestamp_millis(),
            tx,
            evicted: AtomicBool::new(false),
            eviction: Notify::new(),
        }
    }

    /// Create a connection together with the receiver its socket task drains.
    pub fn channel(user_id: Option<UserId>) -> (Arc<Self>, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(CONNECTION_CHANNEL_BUFFER_SIZE);
        (Arc::new(Self::new(user_id, tx)), rx)
    }

    /// Push a message, waiting at most `timeout` for buffer space.
    /// Returns false if the peer is gone or too slow.
    pub async fn send_timeout(&self, msg: Message, timeout: Duration) -> bool {
        if self.is_evicted() {
            return false;
        }
        self.tx.send_timeout(msg, timeout).await.is_ok()
    }

    /// Non-blocking push for direct replies (pong, errors).
    pub fn try_send(&self, msg: Message) -> bool {
        self.tx.try_send(msg).is_ok()
    }

    /// Serialize and push an event to this connection only.
    pub fn send_event(&self, event: &BroadcastEvent) -> bool {
        match serde_json::to_string(event) {
            Ok(json) => self.try_send(Message::Text(json.into())),
            Err(e) => {
                warn!("Failed to serialize event for {}: {}", self.id, e);
                false
            }
        }
    }

    /// Mark the connection dead and wake its socket task.
    pub fn evict(&self) {
        if !self.evicted.swap(true, Ordering::AcqRel) {
            self.eviction.notify_waiters();
        }
    }

    pub fn is_evicted(&self) -> bool {
        self.evicted.load(Ordering::Acquire)
    }

    /// Resolves once the registry has evicted this connection.
    pub async fn evicted(&self) {
        loop {
            let notified = self.eviction.notified();
            if self.is_evicted() {
                return;
            }
            notified.await;
        }
    }
}

/// Outcome of one fan-out.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Connections that accepted the message.
    pub delivered: usize,
    /// Connections removed because their send failed or timed out.
    pub evicted: Vec<ConnectionId>,
}

/// Registry of live connections grouped by scope.
pub struct ConnectionRegistry {
    /// Scope → (Connection ID → Connection).
    scopes: DashMap<Scope, DashMap<ConnectionId, Arc<Connection>>>,
    send_timeout: Duration,
}

impl ConnectionRegistry {
    /// Create an empty registry with the default send timeout.
    pub fn new() -> Self {
        Self::with_send_timeout(DEFAULT_SEND_TIMEOUT)
    }

    pub fn with_send_timeout(send_timeout: Duration) -> Self {
        Self {
            scopes: DashMap::new(),
            send_timeout,
        }
    }

    /// Add a connection under a scope.
    pub fn register(&self, scope: Scope, connection: Arc<Connection>) {
        let id = connection.id;
        self.scopes
            .entry(scope)
            .or_default()
            .insert(id, connection);

        counter!("realtime_registrations_total").increment(1);
        gauge!("realtime_active_connections").set(self.connection_count() as f64);
        debug!("Connection {} registered in {}", id, scope);
    }

    /// Remove a connection. Idempotent. Reclaims the scope entry once empty.
    pub fn unregister(&self, scope: Scope, connection_id: &ConnectionId) -> bool {
        // The inner Ref must be dropped before `remove_if` takes the shard lock.
        let removed = match self.scopes.get(&scope) {
            Some(members) => members.remove(connection_id).is_some(),
            None => false,
        };
        self.scopes.remove_if(&scope, |_, members| members.is_empty());

        if removed {
            gauge!("realtime_active_connections").set(self.connection_count() as f64);
            debug!("Connection {} unregistered from {}", connection_id, scope);
        }
        removed
    }

    /// Snapshot of the connections currently in a scope.
    pub fn members(&self, scope: Scope) -> Vec<Arc<Connection>> {
        self.scopes
            .get(&scope)
            .map(|members| members.iter().map(|e| e.value().clone()).collect())
            .unwrap_or_default()
    }

    /// Send a message to every connection in `scope` except `excluding`.
    ///
    /// Sends run concurrently, each bounded by the send timeout. A connection
    /// whose send fails is unregistered and evicted; delivery to the others
    /// carries on.
    pub async fn deliver(
        &self,
        scope: Scope,
        message: Message,
        excluding: Option<ConnectionId>,
    ) -> DeliveryReport {
        let targets: Vec<Arc<Connection>> = match self.scopes.get(&scope) {
            Some(members) => members
                .iter()
                .filter(|entry| Some(*entry.key()) != excluding)
                .map(|entry| entry.value().clone())
                .collect(),
            None => return DeliveryReport::default(),
        };

        let timeout = self.send_timeout;
        let results = join_all(targets.iter().map(|connection| {
            let msg = message.clone();
            async move { connection.send_timeout(msg, timeout).await }
        }))
        .await;

        let mut report = DeliveryReport::default();
        for (connection, sent) in targets.iter().zip(results) {
            if sent {
                report.delivered += 1;
            } else {
                warn!(
                    "Evicting connection {} from {}: send failed or timed out",
                    connection.id, scope
                );
                self.unregister(scope, &connection.id);
                connection.evict();
                report.evicted.push(connection.id);
            }
        }

        counter!("realtime_deliveries_total").increment(report.delivered as u64);
        if !report.evicted.is_empty() {
            counter!("realtime_evictions_total").increment(report.evicted.len() as u64);
        }
        report
    }

    /// Serialize an event once and deliver it to a scope.
    pub async fn deliver_event(
        &self,
        scope: Scope,
        event: &BroadcastEvent,
        excluding: Option<ConnectionId>,
    ) -> DeliveryReport {
        let json = match serde_json::to_string(event) {
            Ok(j) => j,
            Err(e) => {
                warn!("Failed to serialize {} event: {}", event.kind(), e);
                return DeliveryReport::default();
            }
        };
        self.deliver(scope, Message::Text(Utf8Bytes::from(json)), excluding)
            .await
    }

    /// Number of connections in one scope.
    pub fn scope_len(&self, scope: Scope) -> usize {
        self.scopes.get(&scope).map(|m| m.len()).unwrap_or(0)
    }

    /// Number of scopes with at least one connection.
    pub fn scope_count(&self) -> usize {
        self.scopes.len()
    }

    /// Total number of connections across scopes.
    pub fn connection_count(&self) -> usize {
        self.scopes.iter().map(|entry| entry.value().len()).sum()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(msg: Message) -> String {
        match msg {
            Message::Text(t) => t.as_str().to_string(),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_deliver_reaches_every_member_once() {
        let registry = ConnectionRegistry::new();
        let (a, mut rx_a) = Connection::channel(Some(1));
        let (b, mut rx_b) = Connection::channel(Some(2));
        registry.register(Scope::Canvas, a);
        registry.register(Scope::Canvas, b);

        let report = registry
            .deliver(Scope::Canvas, Message::Text("hello".into()), None)
            .await;

        assert_eq!(report.delivered, 2);
        assert!(report.evicted.is_empty());
        assert_eq!(text(rx_a.recv().await.unwrap()), "hello");
        assert_eq!(text(rx_b.recv().await.unwrap()), "hello");
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_deliver_skips_excluded_connection() {
        let registry = ConnectionRegistry::new();
        let (a, mut rx_a) = Connection::channel(Some(1));
        let (b, mut rx_b) = Connection::channel(Some(2));
        let a_id = a.id;
        registry.register(Scope::Duel(7), a);
        registry.register(Scope::Duel(7), b);

        let report = registry
            .deliver(Scope::Duel(7), Message::Text("move".into()), Some(a_id))
            .await;

        assert_eq!(report.delivered, 1);
        assert!(rx_a.try_recv().is_err());
        assert_eq!(text(rx_b.recv().await.unwrap()), "move");
    }

    #[tokio::test]
    async fn test_scopes_are_isolated() {
        let registry = ConnectionRegistry::new();
        let (a, mut rx_a) = Connection::channel(Some(1));
        let (b, mut rx_b) = Connection::channel(Some(2));
        registry.register(Scope::Duel(1), a);
        registry.register(Scope::Duel(2), b);

        registry
            .deliver(Scope::Duel(1), Message::Text("one".into()), None)
            .await;

        assert_eq!(text(rx_a.recv().await.unwrap()), "one");
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unregistered_connection_never_receives() {
        let registry = ConnectionRegistry::new();
        let (a, mut rx_a) = Connection::channel(Some(1));
        let a_id = a.id;
        registry.register(Scope::Canvas, a);
        assert!(registry.unregister(Scope::Canvas, &a_id));
        assert!(!registry.unregister(Scope::Canvas, &a_id));

        let report = registry
            .deliver(Scope::Canvas, Message::Text("late".into()), None)
            .await;

        assert_eq!(report.delivered, 0);
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_empty_scope_is_reclaimed() {
        let registry = ConnectionRegistry::new();
        let (a, _rx_a) = Connection::channel(Some(1));
        let a_id = a.id;
        registry.register(Scope::Duel(3), a);
        assert_eq!(registry.scope_count(), 1);

        registry.unregister(Scope::Duel(3), &a_id);
        assert_eq!(registry.scope_count(), 0);
        assert_eq!(registry.scope_len(Scope::Duel(3)), 0);
    }

    #[tokio::test]
    async fn test_failed_send_evicts_without_aborting_delivery() {
        let registry = ConnectionRegistry::new();
        let (dead, rx_dead) = Connection::channel(Some(1));
        let (alive, mut rx_alive) = Connection::channel(Some(2));
        let dead_id = dead.id;
        registry.register(Scope::Canvas, dead.clone());
        registry.register(Scope::Canvas, alive);
        drop(rx_dead);

        let report = registry
            .deliver(Scope::Canvas, Message::Text("x".into()), None)
            .await;

        assert_eq!(report.delivered, 1);
        assert_eq!(report.evicted, vec![dead_id]);
        assert!(dead.is_evicted());
        assert_eq!(registry.scope_len(Scope::Canvas), 1);
        assert_eq!(text(rx_alive.recv().await.unwrap()), "x");
    }

    #[tokio::test]
    async fn test_slow_consumer_is_bounded_by_timeout() {
        let registry = ConnectionRegistry::with_send_timeout(Duration::from_millis(20));
        let (tx, _rx) = mpsc::channel(1);
        let slow = Arc::new(Connection::new(Some(1), tx));
        assert!(slow.try_send(Message::Text("fill".into())));
        registry.register(Scope::Canvas, slow.clone());

        let report = registry
            .deliver(Scope::Canvas, Message::Text("x".into()), None)
            .await;

        assert_eq!(report.delivered, 0);
        assert_eq!(report.evicted, vec![slow.id]);
        // The socket task waiting on eviction wakes up immediately.
        tokio::time::timeout(Duration::from_millis(100), slow.evicted())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_register_and_unregister() {
        let registry = Arc::new(ConnectionRegistry::new());
        let mut handles = Vec::new();
        for i in 0..32 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                let (conn, _rx) = Connection::channel(Some(i));
                let id = conn.id;
                registry.register(Scope::Duel(i % 4), conn);
                registry
                    .deliver(Scope::Duel(i % 4), Message::Text("tick".into()), None)
                    .await;
                registry.unregister(Scope::Duel(i % 4), &id);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(registry.connection_count(), 0);
        assert_eq!(registry.scope_count(), 0);
    }
}
