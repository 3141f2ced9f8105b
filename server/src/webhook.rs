use std::{collections::HashMap, sync::Arc};

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::{
    error::{AppError, AppResult},
    pipeline,
    realtime::emit_to_all,
    types::{AppState, Direction, InboundMessage, StoredMessage, TestMessageBody},
    util::{new_id, now_iso},
    whatsapp,
};

const TEST_WA_ID: &str = "15550000001";
const TEST_CONTACT_NAME: &str = "Test User";

pub async fn verify_webhook(
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let expected = state.whatsapp.read().await.verify_token.clone();
    match whatsapp::verify_subscription(&params, &expected) {
        Some(challenge) => {
            info!("webhook verified");
            (StatusCode::OK, challenge).into_response()
        }
        None => {
            warn!(mode = ?params.get("hub.mode"), "webhook verification failed");
            (StatusCode::FORBIDDEN, "Forbidden").into_response()
        }
    }
}

pub async fn receive_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Json<Value>> {
    let signature_header = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok());
    if !whatsapp::verify_signature(&state.app_secret, signature_header, &body) {
        return Err(AppError::InvalidSignature);
    }

    let payload = serde_json::from_slice::<Value>(&body)
        .map_err(|_| AppError::bad_request("Invalid webhook data"))?;
    let expected_phone_number_id = state.whatsapp.read().await.phone_number_id.clone();
    let inbound = whatsapp::extract_messages(&payload, &expected_phone_number_id);
    debug!(count = inbound.len(), "webhook delivery parsed");

    let mut processed = 0usize;
    for message in &inbound {
        let Some(stored) = pipeline::ingest(&state, message).await else {
            continue;
        };
        processed += 1;
        let state = state.clone();
        tokio::spawn(async move {
            pipeline::auto_reply(&state, &stored).await;
        });
    }

    Ok(Json(json!({ "received": true, "processed": processed })))
}

fn test_body(body: &Bytes) -> TestMessageBody {
    serde_json::from_slice(body).unwrap_or_default()
}

/// Runs a synthetic inbound message through ingestion without replying.
pub async fn test_webhook(State(state): State<Arc<AppState>>, body: Bytes) -> AppResult<Json<Value>> {
    let text = test_body(&body)
        .message
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| format!("Test message from {TEST_WA_ID}"));
    let phone_number_id = state.whatsapp.read().await.phone_number_id.clone();

    let inbound = InboundMessage {
        message_id: Some(format!("wamid.test-{}", new_id())),
        wa_id: TEST_WA_ID.to_string(),
        contact_name: TEST_CONTACT_NAME.to_string(),
        text,
        message_type: "text".to_string(),
        phone_number_id,
        timestamp: now_iso(),
    };
    let stored = pipeline::ingest(&state, &inbound).await;

    Ok(Json(json!({
        "success": true,
        "message": "Test webhook processed",
        "data": stored
    })))
}

/// Emits a synthetic `apiData` event without storing anything.
pub async fn test_socket(State(state): State<Arc<AppState>>, body: Bytes) -> Json<Value> {
    let text = test_body(&body)
        .message
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| "Test message from webhook server".to_string());

    let message = StoredMessage {
        id: new_id(),
        text,
        timestamp: now_iso(),
        wa_id: TEST_WA_ID.to_string(),
        contact_name: TEST_CONTACT_NAME.to_string(),
        message_type: "text".to_string(),
        direction: Direction::Inbound,
        phone_number_id: String::new(),
        original_message: None,
        source: None,
        broadcast_id: None,
    };
    emit_to_all(&state, "apiData", &message).await;

    Json(json!({
        "success": true,
        "message": "Test message sent to dashboards",
        "data": message
    }))
}
