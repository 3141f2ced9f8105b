//! Message lifecycle: storing inbound deliveries, answering them, and the
//! operator and broadcast sends that share the same recording path.

use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::{
    error::{AppError, AppResult, WhatsAppError},
    realtime::emit_to_all,
    resolver,
    store::load_settings,
    types::{
        AppState, Broadcast, BroadcastFailure, BroadcastResults, BroadcastStatus, ContactUpdate,
        Direction, InboundMessage, MessageSource, Recipient, StoredMessage,
    },
    util::{new_id, normalize_phone, now_iso},
    whatsapp::{self, SendReceipt},
};

/// Stores an inbound message and notifies dashboards. Returns `None` when
/// the message id was already stored, meaning the provider redelivered it.
pub async fn ingest(state: &AppState, inbound: &InboundMessage) -> Option<StoredMessage> {
    let message = StoredMessage {
        id: inbound.message_id.clone().unwrap_or_else(new_id),
        text: inbound.text.clone(),
        timestamp: inbound.timestamp.clone(),
        wa_id: inbound.wa_id.clone(),
        contact_name: inbound.contact_name.clone(),
        message_type: inbound.message_type.clone(),
        direction: Direction::Inbound,
        phone_number_id: inbound.phone_number_id.clone(),
        original_message: None,
        source: None,
        broadcast_id: None,
    };

    if !record(state, &message).await {
        info!(message_id = %message.id, wa_id = %message.wa_id, "dropping redelivered message");
        return None;
    }
    info!(message_id = %message.id, wa_id = %message.wa_id, "inbound message stored");
    Some(message)
}

/// Resolves and sends the automatic reply for a stored inbound message.
/// Returns the recorded outbound message when one was sent.
pub async fn auto_reply(state: &AppState, inbound: &StoredMessage) -> Option<StoredMessage> {
    let settings = load_settings(state.store.as_ref()).await;
    if !settings.auto_reply_enabled {
        debug!(wa_id = %inbound.wa_id, "auto-reply disabled");
        return None;
    }
    if inbound.text.trim().is_empty() {
        debug!(message_id = %inbound.id, kind = %inbound.message_type, "no text to answer");
        return None;
    }

    let config = state.whatsapp.read().await.clone();
    if config.access_token.is_empty() {
        warn!(wa_id = %inbound.wa_id, "WHATSAPP_TOKEN not configured, reply not sent");
        return None;
    }

    let resolution = resolver::resolve(
        state,
        &inbound.text,
        Some(inbound.wa_id.as_str()),
        Some(inbound.id.as_str()),
    )
    .await;
    let phone_number_id = if inbound.phone_number_id.is_empty() {
        config.phone_number_id.as_str()
    } else {
        inbound.phone_number_id.as_str()
    };

    match whatsapp::send_text(
        &state.http,
        &state.graph,
        &config.access_token,
        phone_number_id,
        &inbound.wa_id,
        &resolution.text,
    )
    .await
    {
        Ok(receipt) => {
            info!(
                wa_id = %inbound.wa_id,
                source = resolution.source.as_str(),
                "auto-reply sent"
            );
            let message = outbound_message(
                &receipt,
                &inbound.wa_id,
                &inbound.contact_name,
                &resolution.text,
                phone_number_id,
                resolution.source,
            );
            let message = StoredMessage {
                original_message: Some(inbound.text.clone()),
                ..message
            };
            record(state, &message).await;
            Some(message)
        }
        Err(err) => {
            error!(
                error = %err,
                details = %provider_details(&err),
                wa_id = %inbound.wa_id,
                "auto-reply failed"
            );
            None
        }
    }
}

/// Operator-initiated send from the dashboard.
pub async fn send_manual(
    state: &AppState,
    to: &str,
    text: &str,
) -> AppResult<(StoredMessage, SendReceipt)> {
    let text = text.trim();
    let wa_id = normalize_phone(to).filter(|_| !text.is_empty()).ok_or_else(|| {
        AppError::bad_request("Missing required fields: to, message")
    })?;
    let config = state.whatsapp.read().await.clone();
    let receipt = whatsapp::send_text(
        &state.http,
        &state.graph,
        &config.access_token,
        &config.phone_number_id,
        &wa_id,
        text,
    )
    .await?;

    let contact_name = known_contact_name(state, &wa_id, "").await;
    let message = outbound_message(
        &receipt,
        &wa_id,
        &contact_name,
        text,
        &config.phone_number_id,
        MessageSource::Agent,
    );
    record(state, &message).await;
    info!(wa_id = %wa_id, "manual message sent");
    Ok((message, receipt))
}

/// Sends the broadcast to each recipient in turn, then marks it sent.
pub async fn send_broadcast(
    state: &AppState,
    mut broadcast: Broadcast,
    recipients: Vec<Recipient>,
) -> AppResult<Broadcast> {
    let config = state.whatsapp.read().await.clone();
    if !config.can_send() {
        return Err(WhatsAppError::NotConfigured("access token or phone number id").into());
    }

    let mut results = BroadcastResults {
        total: recipients.len(),
        ..BroadcastResults::default()
    };

    for (index, recipient) in recipients.iter().enumerate() {
        if index > 0 && !state.broadcast_delay.is_zero() {
            tokio::time::sleep(state.broadcast_delay).await;
        }

        let Some(wa_id) = normalize_phone(&recipient.phone_number) else {
            results.failed += 1;
            results.errors.push(BroadcastFailure {
                recipient: recipient.phone_number.clone(),
                error: json!("invalid phone number"),
            });
            continue;
        };

        match whatsapp::send_text(
            &state.http,
            &state.graph,
            &config.access_token,
            &config.phone_number_id,
            &wa_id,
            &broadcast.message,
        )
        .await
        {
            Ok(receipt) => {
                results.sent += 1;
                let contact_name = known_contact_name(state, &wa_id, &recipient.name).await;
                let message = StoredMessage {
                    broadcast_id: Some(broadcast.id.clone()),
                    ..outbound_message(
                        &receipt,
                        &wa_id,
                        &contact_name,
                        &broadcast.message,
                        &config.phone_number_id,
                        MessageSource::Broadcast,
                    )
                };
                record(state, &message).await;
            }
            Err(err) => {
                warn!(error = %err, wa_id = %wa_id, broadcast_id = %broadcast.id, "broadcast send failed");
                results.failed += 1;
                results.errors.push(BroadcastFailure {
                    recipient: recipient.phone_number.clone(),
                    error: provider_details(&err),
                });
            }
        }
    }

    let now = now_iso();
    broadcast.status = BroadcastStatus::Sent;
    broadcast.sent_at = Some(now.clone());
    broadcast.updated_at = now;
    broadcast.results = Some(results.clone());
    if let Err(err) = state.store.update_broadcast(&broadcast).await {
        error!(error = %err, broadcast_id = %broadcast.id, "failed to mark broadcast as sent");
    }

    info!(
        broadcast_id = %broadcast.id,
        sent = results.sent,
        failed = results.failed,
        "broadcast finished"
    );
    emit_to_all(
        state,
        "broadcast:sent",
        json!({ "broadcastId": broadcast.id, "results": results }),
    )
    .await;
    Ok(broadcast)
}

fn outbound_message(
    receipt: &SendReceipt,
    wa_id: &str,
    contact_name: &str,
    text: &str,
    phone_number_id: &str,
    source: MessageSource,
) -> StoredMessage {
    StoredMessage {
        id: receipt.message_id.clone().unwrap_or_else(new_id),
        text: text.to_string(),
        timestamp: now_iso(),
        wa_id: wa_id.to_string(),
        contact_name: contact_name.to_string(),
        message_type: "text".to_string(),
        direction: Direction::Outbound,
        phone_number_id: phone_number_id.to_string(),
        original_message: None,
        source: Some(source),
        broadcast_id: None,
    }
}

async fn known_contact_name(state: &AppState, wa_id: &str, fallback: &str) -> String {
    match state.store.get_contact(wa_id).await {
        Ok(Some(contact)) if !contact.contact_name.is_empty() => contact.contact_name,
        _ if !fallback.trim().is_empty() => fallback.trim().to_string(),
        _ => format!("User {wa_id}"),
    }
}

/// Provider JSON for API errors, the error text otherwise.
fn provider_details(err: &WhatsAppError) -> Value {
    match err {
        WhatsAppError::Api { body, .. } => body.clone(),
        other => json!(other.to_string()),
    }
}

/// Appends the message, refreshes its contact and emits both to the
/// dashboards. Returns `false` only for an already stored message id;
/// storage failures are logged and processing continues.
async fn record(state: &AppState, message: &StoredMessage) -> bool {
    match state.store.insert_message(message).await {
        Ok(true) => {}
        Ok(false) => return false,
        Err(err) => warn!(error = %err, message_id = %message.id, "failed to store message"),
    }

    let contact = match state
        .store
        .upsert_contact(&ContactUpdate::from_message(message))
        .await
    {
        Ok(contact) => Some(contact),
        Err(err) => {
            warn!(error = %err, wa_id = %message.wa_id, "failed to update contact");
            None
        }
    };

    emit_to_all(state, "apiData", message).await;
    if let Some(contact) = contact {
        emit_to_all(state, "contact:updated", &contact).await;
    }
    true
}
