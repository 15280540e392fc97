//! Session relay: exposes a `MemoryStore` to remote clients over WebSocket
//!
//! Each socket is one store connection. When the socket goes away, for any
//! reason, the relay applies the disconnect cleanups that connection
//! registered.

pub mod handlers;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures::{sink::SinkExt, stream::StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::protocol::{codes, ClientMessage, ServerMessage};
use crate::store::MemoryStore;
use crate::types::SESSIONS_PREFIX;

/// Shared state of the relay server
pub struct RelayState {
    pub store: MemoryStore,
    connections: AtomicUsize,
}

impl RelayState {
    pub fn new(store: MemoryStore) -> Self {
        Self {
            store,
            connections: AtomicUsize::new(0),
        }
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }
}

impl Default for RelayState {
    fn default() -> Self {
        Self::new(MemoryStore::new())
    }
}

/// Relay routes: `/ws` for store connections, `/health` for probes
pub fn router(state: Arc<RelayState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

#[derive(Debug, Serialize)]
pub struct Health {
    pub status: &'static str,
    pub sessions: usize,
    pub connections: usize,
}

pub async fn health_handler(State(state): State<Arc<RelayState>>) -> Json<Health> {
    Json(Health {
        status: "ok",
        sessions: state.store.list(SESSIONS_PREFIX).await.len(),
        connections: state.connections(),
    })
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<RelayState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn send_json(
    sender: &mut futures::stream::SplitSink<WebSocket, Message>,
    msg: &ServerMessage,
) -> bool {
    match serde_json::to_string(msg) {
        Ok(json) => sender.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            tracing::error!("Failed to encode relay message: {}", e);
            true
        }
    }
}

/// Handle individual WebSocket connection
async fn handle_socket(socket: WebSocket, state: Arc<RelayState>) {
    let (mut sender, mut receiver) = socket.split();
    let connection = state.store.connect();
    state.connections.fetch_add(1, Ordering::Relaxed);
    tracing::info!("Store connection {} opened", connection.id());

    // Subscription feeds push snapshots here; the loop below owns the socket
    let (outbound, mut pushes) = mpsc::unbounded_channel::<ServerMessage>();
    let mut subscriptions = HashMap::new();

    loop {
        tokio::select! {
            push = pushes.recv() => {
                if let Some(msg) = push {
                    if !send_json(&mut sender, &msg).await {
                        break;
                    }
                }
            }

            ws_msg = receiver.next() => {
                match ws_msg {
                    Some(Ok(Message::Text(text))) => {
                        tracing::trace!("Received message: {}", text);

                        let response = match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(client_msg) => {
                                handlers::handle_message(
                                    client_msg,
                                    &connection,
                                    &mut subscriptions,
                                    &outbound,
                                )
                                .await
                            }
                            Err(e) => {
                                tracing::warn!("Failed to parse client message: {}", e);
                                Some(ServerMessage::Error {
                                    req: 0,
                                    code: codes::PARSE_ERROR.to_string(),
                                    msg: format!("Invalid message format: {}", e),
                                })
                            }
                        };

                        if let Some(response) = response {
                            if !send_json(&mut sender, &response).await {
                                tracing::error!("Failed to send response");
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        tracing::debug!("WebSocket closed by client");
                        break;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!("WebSocket error: {}", e);
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    for (_, feed) in subscriptions.drain() {
        feed.abort();
    }
    connection.drop_connection().await;
    state.connections.fetch_sub(1, Ordering::Relaxed);
    tracing::info!("Store connection {} closed", connection.id());
}
