//! WebSocket event and control channel.
//!
//! Clients connect to `GET /ws?client_id=...`. Outbound frames are JSON
//! [`Event`](crate::broadcast::Event)s; inbound text frames are control
//! messages.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use uuid::Uuid;

use crate::broadcast::{ControlReply, Subscription};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct WsParams {
    /// Stable client id; a random one is assigned when missing
    pub client_id: Option<String>,
}

/// GET /ws?client_id=xxx
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
) -> Response {
    let client_id = params
        .client_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    ws.on_upgrade(move |socket| handle_socket(socket, state, client_id))
}

async fn handle_socket(socket: WebSocket, state: AppState, client_id: String) {
    let Subscription {
        generation,
        mut receiver,
        ..
    } = state.engine.broadcaster().connect(&client_id).await;
    let (mut sender, mut inbound) = socket.split();

    let mut send_task = tokio::spawn(async move {
        while let Some(event) = receiver.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to serialize event");
                    continue;
                }
            };
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let dispatcher = state.dispatcher.clone();
    let recv_client = client_id.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = inbound.next().await {
            match message {
                Message::Text(text) => {
                    if let ControlReply::Resumed(handle) = dispatcher.handle_text(&recv_client, text.as_str()).await {
                        // The resumed execution keeps running after the socket closes.
                        drop(handle);
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    state
        .engine
        .broadcaster()
        .disconnect(&client_id, generation)
        .await;
}
