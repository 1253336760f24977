use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::debug;
use serde::Serialize;
use tokio::sync::{mpsc, Notify, RwLock};
use uuid::Uuid;

use crate::types::{ConnectionId, ParticipantId, RoomId};

struct ConnectionEntry {
    sender: mpsc::UnboundedSender<String>,
    bindings: HashSet<(RoomId, ParticipantId)>,
    last_seen: Instant,
    close: Arc<Notify>,
}

/// The receiving half of a registered connection, owned by its socket tasks.
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub outbound: mpsc::UnboundedReceiver<String>,
    /// Notified when the coordinator wants the socket closed.
    pub close: Arc<Notify>,
}

#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, ConnectionEntry>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self) -> ConnectionHandle {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        let close = Arc::new(Notify::new());

        let mut connections = self.connections.write().await;
        connections.insert(
            id.clone(),
            ConnectionEntry {
                sender: tx,
                bindings: HashSet::new(),
                last_seen: Instant::now(),
                close: Arc::clone(&close),
            },
        );

        ConnectionHandle {
            id,
            outbound: rx,
            close,
        }
    }

    /// Removes the connection and returns every participant that was bound to it.
    pub async fn unregister(&self, connection_id: &str) -> Vec<(RoomId, ParticipantId)> {
        let mut connections = self.connections.write().await;
        connections
            .remove(connection_id)
            .map(|entry| entry.bindings.into_iter().collect())
            .unwrap_or_default()
    }

    /// Queues `text` on the connection. Returns false when the connection is gone.
    pub async fn send_text(&self, connection_id: &str, text: String) -> bool {
        let connections = self.connections.read().await;
        match connections.get(connection_id) {
            Some(entry) => entry.sender.send(text).is_ok(),
            None => {
                debug!("No open connection {}", connection_id);
                false
            }
        }
    }

    pub async fn send_json<T: Serialize>(&self, connection_id: &str, message: &T) -> bool {
        match serde_json::to_string(message) {
            Ok(text) => self.send_text(connection_id, text).await,
            Err(e) => {
                debug!("Failed to serialize outbound message: {}", e);
                false
            }
        }
    }

    pub async fn bind(&self, connection_id: &str, room_id: &str, participant_id: &str) {
        let mut connections = self.connections.write().await;
        if let Some(entry) = connections.get_mut(connection_id) {
            entry
                .bindings
                .insert((room_id.to_string(), participant_id.to_string()));
        }
    }

    pub async fn unbind(&self, connection_id: &str, room_id: &str, participant_id: &str) {
        let mut connections = self.connections.write().await;
        if let Some(entry) = connections.get_mut(connection_id) {
            entry
                .bindings
                .remove(&(room_id.to_string(), participant_id.to_string()));
        }
    }

    /// Records inbound activity on the connection.
    pub async fn touch(&self, connection_id: &str) {
        let mut connections = self.connections.write().await;
        if let Some(entry) = connections.get_mut(connection_id) {
            entry.last_seen = Instant::now();
        }
    }

    pub async fn idle_connections(&self, max_idle: Duration) -> Vec<ConnectionId> {
        let connections = self.connections.read().await;
        connections
            .iter()
            .filter(|(_, entry)| entry.last_seen.elapsed() > max_idle)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Asks the socket owning this connection to shut down.
    pub async fn close(&self, connection_id: &str) {
        let connections = self.connections.read().await;
        if let Some(entry) = connections.get(connection_id) {
            entry.close.notify_one();
        }
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }
}
