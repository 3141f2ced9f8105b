use std::sync::{atomic::Ordering, Arc};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::types::{AppState, EventEnvelopeIn};

pub const DEFAULT_HISTORY_LIMIT: usize = 50;

pub fn event_payload<T: Serialize>(event: &str, data: T) -> Option<String> {
    serde_json::to_string(&json!({ "event": event, "data": data })).ok()
}

pub async fn emit_to_client<T: Serialize>(state: &AppState, client_id: usize, event: &str, data: T) {
    let Some(payload) = event_payload(event, data) else {
        return;
    };

    let tx = {
        let rt = state.realtime.lock().await;
        rt.clients.get(&client_id).cloned()
    };

    if let Some(sender) = tx {
        let _ = sender.send(payload);
    }
}

/// Sends the event to every connected dashboard.
pub async fn emit_to_all<T: Serialize>(state: &AppState, event: &str, data: T) {
    let Some(payload) = event_payload(event, data) else {
        return;
    };

    let senders = {
        let rt = state.realtime.lock().await;
        rt.clients.values().cloned().collect::<Vec<_>>()
    };

    for sender in senders {
        let _ = sender.send(payload.clone());
    }
}

pub async fn connected_clients(state: &AppState) -> usize {
    state.realtime.lock().await.clients.len()
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let client_id = state.next_client_id.fetch_add(1, Ordering::Relaxed) + 1;
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    {
        let mut rt = state.realtime.lock().await;
        rt.clients.insert(client_id, tx);
    }
    debug!(client_id, "dashboard connected");

    let (mut ws_sender, mut ws_receiver) = socket.split();

    let send_task = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            if ws_sender.send(Message::Text(payload.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = ws_receiver.next().await {
        let text = match message {
            Message::Text(text) => text.to_string(),
            Message::Close(_) => break,
            _ => continue,
        };

        let Ok(envelope) = serde_json::from_str::<EventEnvelopeIn>(&text) else {
            continue;
        };

        handle_client_event(&state, client_id, envelope).await;
    }

    {
        let mut rt = state.realtime.lock().await;
        rt.clients.remove(&client_id);
    }
    debug!(client_id, "dashboard disconnected");

    send_task.abort();
}

async fn handle_client_event(state: &AppState, client_id: usize, envelope: EventEnvelopeIn) {
    match envelope.event.as_str() {
        "message" => emit_to_all(state, "message", envelope.data).await,
        "chat:history" => {
            let wa_id = envelope
                .data
                .get("waId")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            if wa_id.is_empty() {
                emit_to_client(state, client_id, "error", json!({ "message": "waId is required" }))
                    .await;
                return;
            }
            let limit = envelope
                .data
                .get("limit")
                .and_then(Value::as_u64)
                .and_then(|limit| usize::try_from(limit).ok())
                .unwrap_or(DEFAULT_HISTORY_LIMIT);

            let messages = match state.store.messages_for_contact(&wa_id, limit).await {
                Ok(messages) => messages,
                Err(err) => {
                    warn!(error = %err, wa_id = %wa_id, "failed to load chat history");
                    Vec::new()
                }
            };
            emit_to_client(
                state,
                client_id,
                "chat:history",
                json!({ "waId": wa_id, "messages": messages }),
            )
            .await;
        }
        other => debug!(client_id, event = other, "ignoring unknown client event"),
    }
}
