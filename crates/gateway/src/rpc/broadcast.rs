//! Named-topic broadcast hub for `/v1/rpc` connections.
//!
//! Generalizes [`crate::runtime::runs::RunStore`]'s per-run
//! `HashMap<Uuid, broadcast::Sender<T>>` pattern to string topics shared
//! across every connected client (`chat.<sessionKey>`,
//! `exec.approval.requested`, `exec.approval.decided`, `session.state`,
//! `queue.lane.<lane>`) instead of one channel per run.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::RpcOutbound;

struct Connection {
    sink: mpsc::Sender<RpcOutbound>,
    topics: HashSet<String>,
}

/// Shared across all `/v1/rpc` connections via `AppState`.
#[derive(Default)]
pub struct BroadcastHub {
    connections: Mutex<HashMap<Uuid, Connection>>,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self, conn_id: Uuid, sink: mpsc::Sender<RpcOutbound>) {
        self.connections.lock().insert(
            conn_id,
            Connection {
                sink,
                topics: HashSet::new(),
            },
        );
    }

    pub fn disconnect(&self, conn_id: Uuid) {
        self.connections.lock().remove(&conn_id);
    }

    pub fn subscribe(&self, conn_id: Uuid, topic: &str) {
        if let Some(conn) = self.connections.lock().get_mut(&conn_id) {
            conn.topics.insert(topic.to_string());
        }
    }

    pub fn unsubscribe(&self, conn_id: Uuid, topic: &str) {
        if let Some(conn) = self.connections.lock().get_mut(&conn_id) {
            conn.topics.remove(topic);
        }
    }

    /// Push a notification to every connection subscribed to `topic`.
    /// Drops the message for any connection whose outbound channel is full
    /// or closed rather than blocking the publisher.
    pub fn publish(&self, topic: &str, params: Value) {
        let senders: Vec<_> = self
            .connections
            .lock()
            .values()
            .filter(|c| c.topics.contains(topic))
            .map(|c| c.sink.clone())
            .collect();
        for sink in senders {
            let _ = sink.try_send(RpcOutbound::notify(topic.to_string(), params.clone()));
        }
    }

    /// Number of connections currently subscribed to `topic` (diagnostics).
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.connections
            .lock()
            .values()
            .filter(|c| c.topics.contains(topic))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_subscribed_connections_only() {
        let hub = BroadcastHub::new();
        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        hub.connect(a, tx_a);
        hub.connect(b, tx_b);
        hub.subscribe(a, "chat.sk1");

        hub.publish("chat.sk1", serde_json::json!({"text": "hi"}));

        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn disconnect_removes_subscriber() {
        let hub = BroadcastHub::new();
        let (tx, _rx) = mpsc::channel(8);
        let id = Uuid::new_v4();
        hub.connect(id, tx);
        hub.subscribe(id, "topic");
        assert_eq!(hub.subscriber_count("topic"), 1);
        hub.disconnect(id);
        assert_eq!(hub.subscriber_count("topic"), 0);
    }
}
