use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::warn;
use uuid::Uuid;

use crate::protocol::{ConnectionId, ServerMessage};

/// Per-connection bookkeeping: the outbound queue plus ping freshness.
/// Participant binding lives in the registry, not here.
#[derive(Debug, Clone)]
pub(crate) struct ClientConnection {
    pub sender: mpsc::Sender<Arc<ServerMessage>>,
    pub last_ping: Instant,
}

/// Tracks live transport connections. A connection exists from transport
/// attach until detach; eviction simply drops the outbound sender, which
/// ends the socket's send task.
pub(crate) struct ConnectionManager {
    clients: DashMap<ConnectionId, ClientConnection>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
        }
    }

    pub fn register(&self, sender: mpsc::Sender<Arc<ServerMessage>>) -> ConnectionId {
        let connection_id = Uuid::new_v4();
        self.clients.insert(
            connection_id,
            ClientConnection {
                sender,
                last_ping: Instant::now(),
            },
        );
        connection_id
    }

    pub fn remove(&self, connection_id: &ConnectionId) -> bool {
        self.clients.remove(connection_id).is_some()
    }

    pub fn contains(&self, connection_id: &ConnectionId) -> bool {
        self.clients.contains_key(connection_id)
    }

    pub fn record_ping(&self, connection_id: &ConnectionId) {
        if let Some(mut client) = self.clients.get_mut(connection_id) {
            client.last_ping = Instant::now();
        }
    }

    /// Fire-and-forget enqueue onto the connection's outbound queue. A full
    /// queue drops the message with a warning; the socket task handles
    /// actual I/O.
    pub fn send(&self, connection_id: &ConnectionId, message: Arc<ServerMessage>) {
        let Some(client) = self.clients.get(connection_id) else {
            return;
        };
        if client.sender.try_send(message).is_err() {
            warn!(%connection_id, "outbound queue full or closed, dropping message");
        }
    }

    /// Connections with no ping activity inside `timeout`, candidates for
    /// reaping by the maintenance task.
    pub fn collect_stale(&self, timeout: Duration) -> Vec<ConnectionId> {
        let now = Instant::now();
        self.clients
            .iter()
            .filter(|entry| now.duration_since(entry.value().last_ping) > timeout)
            .map(|entry| *entry.key())
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.clients.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{advance, pause};

    #[tokio::test]
    async fn send_after_remove_is_a_noop() {
        let manager = ConnectionManager::new();
        let (tx, mut rx) = mpsc::channel(4);
        let id = manager.register(tx);

        manager.send(&id, Arc::new(ServerMessage::Pong));
        assert!(matches!(*rx.recv().await.unwrap(), ServerMessage::Pong));

        assert!(manager.remove(&id));
        manager.send(&id, Arc::new(ServerMessage::Pong));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn stale_connections_are_collected_after_timeout() {
        pause();
        let manager = ConnectionManager::new();
        let (tx, _rx) = mpsc::channel(4);
        let id = manager.register(tx);

        advance(Duration::from_secs(31)).await;
        let stale = manager.collect_stale(Duration::from_secs(30));
        assert_eq!(stale, vec![id]);

        manager.record_ping(&id);
        assert!(manager.collect_stale(Duration::from_secs(30)).is_empty());
    }
}
