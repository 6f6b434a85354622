//! Event broadcaster.
//!
//! Holds one outbound channel per connected client and routes each event to
//! the single client associated with its execution. Delivery is best effort:
//! events for executions without a live subscriber are dropped, not queued.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, RwLock};

use crate::engine::state::NodeName;
use crate::registry::ExecutionRegistry;

use super::events::Event;

/// Outbound channel of one client.
pub type EventSender = mpsc::UnboundedSender<Event>;

/// Receiving end handed to the transport (WebSocket task, tests).
pub type EventReceiver = mpsc::UnboundedReceiver<Event>;

#[derive(Debug, Clone)]
struct ClientConnection {
    sender: EventSender,
    generation: u64,
    connected_at: DateTime<Utc>,
}

/// Handle returned by [`EventBroadcaster::connect`].
pub struct Subscription {
    pub client_id: String,
    pub generation: u64,
    pub receiver: EventReceiver,
}

/// Per-execution event fan-out.
pub struct EventBroadcaster {
    registry: Arc<ExecutionRegistry>,
    /// client_id -> connection
    connections: RwLock<HashMap<String, ClientConnection>>,
    generations: AtomicU64,
}

impl EventBroadcaster {
    pub fn new(registry: Arc<ExecutionRegistry>) -> Self {
        Self {
            registry,
            connections: RwLock::new(HashMap::new()),
            generations: AtomicU64::new(1),
        }
    }

    /// Register a client channel, replacing any previous connection of that client.
    pub async fn connect(&self, client_id: &str) -> Subscription {
        let (sender, receiver) = mpsc::unbounded_channel();
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let replaced = self
            .connections
            .write()
            .await
            .insert(
                client_id.to_string(),
                ClientConnection {
                    sender,
                    generation,
                    connected_at: Utc::now(),
                },
            )
            .is_some();

        tracing::info!(client_id = %client_id, replaced, "Subscriber connected");

        Subscription {
            client_id: client_id.to_string(),
            generation,
            receiver,
        }
    }

    /// Remove a client channel. A newer connection of the same client is kept.
    pub async fn disconnect(&self, client_id: &str, generation: u64) {
        let mut connections = self.connections.write().await;
        if connections
            .get(client_id)
            .is_some_and(|c| c.generation == generation)
        {
            if let Some(conn) = connections.remove(client_id) {
                tracing::info!(
                    client_id = %client_id,
                    connected_secs = (Utc::now() - conn.connected_at).num_seconds(),
                    "Subscriber disconnected"
                );
            }
        }
    }

    /// Deliver an event to the subscriber of `execution_id`.
    ///
    /// Returns `true` if the event reached a client channel.
    pub async fn broadcast(&self, execution_id: &str, event: Event) -> bool {
        debug_assert_eq!(event.execution_id, execution_id);

        let Some(client_id) = self.registry.client_for(execution_id).await else {
            tracing::warn!(
                execution_id = %execution_id,
                event_type = %event.event_type,
                "No subscriber associated with execution, dropping event"
            );
            return false;
        };
        self.send_to_client(&client_id, event).await
    }

    /// Deliver one incremental answer token. Tokens of one execution keep
    /// their emission order.
    pub async fn stream_token(&self, execution_id: &str, token: &str, node: NodeName, is_last: bool) -> bool {
        self.broadcast(execution_id, Event::token(execution_id, token, node, is_last))
            .await
    }

    /// Send directly to a client (replies to control messages).
    pub async fn send_to_client(&self, client_id: &str, event: Event) -> bool {
        let connections = self.connections.read().await;
        match connections.get(client_id) {
            Some(conn) => {
                if conn.sender.send(event).is_ok() {
                    true
                } else {
                    tracing::warn!(client_id = %client_id, "Subscriber channel closed, dropping event");
                    false
                }
            }
            None => {
                tracing::warn!(client_id = %client_id, "Subscriber not connected, dropping event");
                false
            }
        }
    }

    pub async fn is_connected(&self, client_id: &str) -> bool {
        self.connections.read().await.contains_key(client_id)
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }
}

/// Token sink handed to the synthesizer of one execution.
#[derive(Clone)]
pub struct TokenSink {
    broadcaster: Arc<EventBroadcaster>,
    execution_id: String,
    node: NodeName,
}

impl TokenSink {
    pub fn new(broadcaster: Arc<EventBroadcaster>, execution_id: impl Into<String>, node: NodeName) -> Self {
        Self {
            broadcaster,
            execution_id: execution_id.into(),
            node,
        }
    }

    /// Stream one token.
    pub async fn send(&self, token: &str) {
        self.broadcaster
            .stream_token(&self.execution_id, token, self.node, false)
            .await;
    }

    /// Close the stream with an empty, `stream_complete` token.
    pub async fn finish(&self) {
        self.broadcaster
            .stream_token(&self.execution_id, "", self.node, true)
            .await;
    }
}
