use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde_json::{json, Value};
use tracing::info;

use crate::{
    ai,
    config::WhatsAppConfig,
    error::{AppError, AppResult},
    pipeline,
    realtime::{connected_clients, DEFAULT_HISTORY_LIMIT},
    resolver,
    store::load_settings,
    types::{
        AppState, Broadcast, BroadcastStatus, ChatPreviewBody, ConfigBody, CreateBroadcastBody,
        CreateFlowBody, CreateKeywordBody, Flow, HistoryQuery, Keyword, MatchMode,
        PatchBroadcastBody, PatchFlowBody, PatchKeywordBody, Recipient, SendBroadcastBody,
        SendMessageBody, Settings, SuggestFlowsBody, TestWhatsAppBody,
    },
    util::{new_id, now_iso},
    whatsapp,
};

type ApiResult = AppResult<Json<Value>>;

fn required(value: &str, message: &str) -> AppResult<String> {
    let value = value.trim();
    if value.is_empty() {
        Err(AppError::bad_request(message))
    } else {
        Ok(value.to_string())
    }
}

fn clean_triggers(triggers: &[String]) -> AppResult<Vec<String>> {
    let triggers = triggers
        .iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>();
    if triggers.is_empty() {
        return Err(AppError::bad_request("At least one trigger is required"));
    }
    Ok(triggers)
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    let config = state.whatsapp.read().await.clone();
    Json(json!({
        "status": "OK",
        "timestamp": now_iso(),
        "store": state.store.kind(),
        "clients": connected_clients(&state).await,
        "config": {
            "hasAccessToken": !config.access_token.is_empty(),
            "hasPhoneNumberId": !config.phone_number_id.is_empty(),
            "hasVerifyToken": !config.verify_token.is_empty(),
            "webhookUrl": config.webhook_url,
            "aiConfigured": state.openai.api_key.is_some()
        }
    }))
}

pub async fn get_config(State(state): State<Arc<AppState>>) -> Json<Value> {
    let config = state.whatsapp.read().await.clone();
    Json(json!({
        "config": {
            "hasAccessToken": !config.access_token.is_empty(),
            "phoneNumberId": config.phone_number_id,
            "verifyToken": config.verify_token,
            "webhookUrl": config.webhook_url
        },
        "hasConfig": config.can_send()
    }))
}

pub async fn update_config(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ConfigBody>,
) -> ApiResult {
    let missing = "Missing required configuration fields";
    let updated = WhatsAppConfig {
        access_token: required(&body.access_token, missing)?,
        phone_number_id: required(&body.phone_number_id, missing)?,
        verify_token: required(&body.verify_token, missing)?,
        webhook_url: required(&body.webhook_url, missing)?,
    };
    let masked = updated.masked();
    *state.whatsapp.write().await = updated;
    info!(
        phone_number_id = %masked.phone_number_id,
        access_token = %masked.access_token,
        "whatsapp configuration updated"
    );

    Ok(Json(json!({
        "message": "Configuration updated successfully",
        "config": masked
    })))
}

pub async fn send_message(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SendMessageBody>,
) -> ApiResult {
    let (message, receipt) = pipeline::send_manual(&state, &body.to, &body.message).await?;
    Ok(Json(json!({
        "success": true,
        "messageId": receipt.message_id,
        "message": message,
        "data": receipt.response
    })))
}

pub async fn list_contacts(State(state): State<Arc<AppState>>) -> ApiResult {
    let contacts = state.store.list_contacts().await?;
    Ok(Json(json!({
        "success": true,
        "count": contacts.len(),
        "contacts": contacts
    })))
}

pub async fn delete_contact(
    State(state): State<Arc<AppState>>,
    Path(wa_id): Path<String>,
) -> ApiResult {
    if !state.store.delete_contact(&wa_id).await? {
        return Err(AppError::NotFound("contact"));
    }
    Ok(Json(json!({ "success": true, "message": "Contact deleted successfully" })))
}

pub async fn chat_history(
    State(state): State<Arc<AppState>>,
    Path(wa_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult {
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    let contact = state.store.get_contact(&wa_id).await?;
    let messages = state.store.messages_for_contact(&wa_id, limit).await?;
    Ok(Json(json!({
        "success": true,
        "contact": contact,
        "count": messages.len(),
        "messages": messages
    })))
}

pub async fn list_flows(State(state): State<Arc<AppState>>) -> ApiResult {
    let flows = state.store.list_flows().await?;
    Ok(Json(json!({ "success": true, "flows": flows })))
}

pub async fn create_flow(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateFlowBody>,
) -> ApiResult {
    let name = required(&body.name, "Flow name is required")?;
    let triggers = clean_triggers(&body.triggers)?;
    let response = required(&body.response, "Flow response is required")?;
    let now = now_iso();
    let flow = Flow {
        id: new_id(),
        name,
        triggers,
        response,
        is_active: body.is_active,
        priority: body.priority,
        match_mode: body
            .match_mode
            .as_deref()
            .map(MatchMode::parse)
            .unwrap_or_default(),
        user_id: body
            .user_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| "default".to_string()),
        created_at: now.clone(),
        updated_at: now,
    };
    state.store.insert_flow(&flow).await?;
    info!(flow_id = %flow.id, name = %flow.name, "flow created");
    Ok(Json(json!({ "success": true, "flow": flow })))
}

pub async fn get_flow(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult {
    let flow = state
        .store
        .get_flow(&id)
        .await?
        .ok_or(AppError::NotFound("flow"))?;
    Ok(Json(json!({ "success": true, "flow": flow })))
}

pub async fn update_flow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(patch): Json<PatchFlowBody>,
) -> ApiResult {
    let mut flow = state
        .store
        .get_flow(&id)
        .await?
        .ok_or(AppError::NotFound("flow"))?;

    if let Some(name) = patch.name {
        flow.name = required(&name, "Flow name is required")?;
    }
    if let Some(triggers) = patch.triggers {
        flow.triggers = clean_triggers(&triggers)?;
    }
    if let Some(response) = patch.response {
        flow.response = required(&response, "Flow response is required")?;
    }
    if let Some(is_active) = patch.is_active {
        flow.is_active = is_active;
    }
    if let Some(priority) = patch.priority {
        flow.priority = priority;
    }
    if let Some(mode) = patch.match_mode {
        flow.match_mode = MatchMode::parse(&mode);
    }
    flow.updated_at = now_iso();

    if !state.store.update_flow(&flow).await? {
        return Err(AppError::NotFound("flow"));
    }
    Ok(Json(json!({
        "success": true,
        "message": "Flow updated successfully",
        "flow": flow
    })))
}

pub async fn delete_flow(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult {
    if !state.store.delete_flow(&id).await? {
        return Err(AppError::NotFound("flow"));
    }
    Ok(Json(json!({ "success": true, "message": "Flow deleted successfully" })))
}

pub async fn suggest_flows(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SuggestFlowsBody>,
) -> ApiResult {
    let business_type = required(&body.business_type, "Business type is required")?;
    let suggestions = ai::suggest_flows(&state.http, &state.openai, &business_type).await?;
    Ok(Json(json!({ "success": true, "suggestions": suggestions })))
}

pub async fn list_keywords(State(state): State<Arc<AppState>>) -> ApiResult {
    let keywords = state.store.list_keywords().await?;
    Ok(Json(json!({ "success": true, "keywords": keywords })))
}

pub async fn create_keyword(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateKeywordBody>,
) -> ApiResult {
    let keyword = required(&body.keyword, "Keyword is required")?.to_lowercase();
    let response = required(&body.response, "Response is required")?;
    let now = now_iso();
    let keyword = Keyword {
        id: new_id(),
        keyword,
        response,
        is_active: body.is_active.unwrap_or(true),
        created_at: now.clone(),
        updated_at: now,
    };
    state.store.insert_keyword(&keyword).await?;
    Ok(Json(json!({ "success": true, "keyword": keyword })))
}

pub async fn update_keyword(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(patch): Json<PatchKeywordBody>,
) -> ApiResult {
    let mut keyword = state
        .store
        .get_keyword(&id)
        .await?
        .ok_or(AppError::NotFound("keyword"))?;

    if let Some(word) = patch.keyword {
        keyword.keyword = required(&word, "Keyword is required")?.to_lowercase();
    }
    if let Some(response) = patch.response {
        keyword.response = required(&response, "Response is required")?;
    }
    if let Some(is_active) = patch.is_active {
        keyword.is_active = is_active;
    }
    keyword.updated_at = now_iso();

    if !state.store.update_keyword(&keyword).await? {
        return Err(AppError::NotFound("keyword"));
    }
    Ok(Json(json!({
        "success": true,
        "message": "Keyword updated successfully",
        "keyword": keyword
    })))
}

pub async fn delete_keyword(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult {
    if !state.store.delete_keyword(&id).await? {
        return Err(AppError::NotFound("keyword"));
    }
    Ok(Json(json!({ "success": true, "message": "Keyword deleted successfully" })))
}

pub async fn list_broadcasts(State(state): State<Arc<AppState>>) -> ApiResult {
    let broadcasts = state.store.list_broadcasts().await?;
    Ok(Json(json!({ "success": true, "broadcasts": broadcasts })))
}

pub async fn create_broadcast(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateBroadcastBody>,
) -> ApiResult {
    let name = required(&body.name, "Broadcast name is required")?;
    let message = required(&body.message, "Broadcast message is required")?;
    let scheduled_for = body.scheduled_for.filter(|at| !at.trim().is_empty());
    let now = now_iso();
    let broadcast = Broadcast {
        id: new_id(),
        name,
        message,
        recipients: body.recipients,
        status: if scheduled_for.is_some() {
            BroadcastStatus::Scheduled
        } else {
            BroadcastStatus::Draft
        },
        scheduled_for,
        sent_at: None,
        results: None,
        created_at: now.clone(),
        updated_at: now,
    };
    state.store.insert_broadcast(&broadcast).await?;
    Ok(Json(json!({ "success": true, "broadcast": broadcast })))
}

pub async fn get_broadcast(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult {
    let broadcast = state
        .store
        .get_broadcast(&id)
        .await?
        .ok_or(AppError::NotFound("broadcast"))?;
    Ok(Json(json!({ "success": true, "broadcast": broadcast })))
}

pub async fn update_broadcast(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(patch): Json<PatchBroadcastBody>,
) -> ApiResult {
    let mut broadcast = state
        .store
        .get_broadcast(&id)
        .await?
        .ok_or(AppError::NotFound("broadcast"))?;

    if let Some(name) = patch.name {
        broadcast.name = required(&name, "Broadcast name is required")?;
    }
    if let Some(message) = patch.message {
        broadcast.message = required(&message, "Broadcast message is required")?;
    }
    if let Some(recipients) = patch.recipients {
        broadcast.recipients = recipients;
    }
    if let Some(scheduled_for) = patch.scheduled_for {
        broadcast.scheduled_for = Some(scheduled_for).filter(|at| !at.trim().is_empty());
    }
    if let Some(status) = patch.status {
        broadcast.status = BroadcastStatus::parse(status.trim())
            .ok_or_else(|| AppError::bad_request(format!("Unknown broadcast status: {status}")))?;
    }
    broadcast.updated_at = now_iso();

    if !state.store.update_broadcast(&broadcast).await? {
        return Err(AppError::NotFound("broadcast"));
    }
    Ok(Json(json!({ "success": true, "broadcast": broadcast })))
}

pub async fn delete_broadcast(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult {
    if !state.store.delete_broadcast(&id).await? {
        return Err(AppError::NotFound("broadcast"));
    }
    Ok(Json(json!({ "success": true, "message": "Broadcast deleted successfully" })))
}

pub async fn send_broadcast(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SendBroadcastBody>,
) -> ApiResult {
    let broadcast_id = required(&body.broadcast_id, "Broadcast ID is required")?;
    let broadcast = state
        .store
        .get_broadcast(&broadcast_id)
        .await?
        .ok_or(AppError::NotFound("broadcast"))?;

    let recipients = if !body.recipients.is_empty() {
        body.recipients
    } else if !broadcast.recipients.is_empty() {
        broadcast.recipients.clone()
    } else {
        state
            .store
            .list_contacts()
            .await?
            .into_iter()
            .map(|contact| Recipient {
                phone_number: contact.wa_id,
                name: contact.contact_name,
            })
            .collect()
    };
    if recipients.is_empty() {
        return Err(AppError::bad_request("No recipients found"));
    }

    let broadcast = pipeline::send_broadcast(&state, broadcast, recipients).await?;
    let results = broadcast.results.clone().unwrap_or_default();
    Ok(Json(json!({
        "success": true,
        "message": format!(
            "Broadcast sent to {} out of {} recipients",
            results.sent, results.total
        ),
        "results": results,
        "broadcast": broadcast
    })))
}

pub async fn get_settings(State(state): State<Arc<AppState>>) -> Json<Value> {
    let settings = load_settings(state.store.as_ref()).await;
    Json(json!({ "success": true, "settings": settings }))
}

/// Merges the posted fields over the stored settings.
pub async fn save_settings(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> ApiResult {
    let Value::Object(fields) = body else {
        return Err(AppError::bad_request("Settings data is required"));
    };

    let current = load_settings(state.store.as_ref()).await;
    let mut merged = match serde_json::to_value(&current) {
        Ok(Value::Object(map)) => map,
        _ => serde_json::Map::new(),
    };
    merged.extend(fields);
    let mut settings = serde_json::from_value::<Settings>(Value::Object(merged))
        .map_err(|err| AppError::bad_request(format!("Invalid settings: {err}")))?;
    settings.updated_at = Some(now_iso());

    state.store.save_settings(&settings).await?;
    Ok(Json(json!({
        "success": true,
        "settings": settings,
        "message": "Settings saved successfully"
    })))
}

pub async fn test_whatsapp(
    State(state): State<Arc<AppState>>,
    Json(body): Json<TestWhatsAppBody>,
) -> ApiResult {
    let missing = "Access token and phone number ID are required";
    let access_token = required(&body.access_token, missing)?;
    let phone_number_id = required(&body.phone_number_id, missing)?;
    let details =
        whatsapp::phone_number_details(&state.http, &state.graph, &access_token, &phone_number_id)
            .await?;
    Ok(Json(json!({
        "success": true,
        "message": "WhatsApp API connection successful",
        "data": {
            "phoneNumber": details.display_phone_number,
            "verifiedName": details.verified_name,
            "status": details.code_verification_status,
            "qualityRating": details.quality_rating
        }
    })))
}

/// Shows which reply an inbound message would get, without sending it.
pub async fn chat_preview(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ChatPreviewBody>,
) -> ApiResult {
    let message = required(&body.message, "Message is required")?;
    let wa_id = body.wa_id.filter(|id| !id.trim().is_empty());
    let resolution = resolver::resolve(&state, &message, wa_id.as_deref(), None).await;
    Ok(Json(json!({
        "success": true,
        "response": resolution.text,
        "source": resolution.source,
        "matched": resolution.matched
    })))
}
