//! WhatsApp Cloud API contract: webhook verification, signature checks,
//! inbound payload extraction and the Graph API calls.

use std::collections::HashMap;

use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;

use crate::{
    config::GraphApiConfig,
    error::WhatsAppError,
    types::InboundMessage,
    util::{normalize_phone, now_iso, unix_to_iso},
};

const BUSINESS_ACCOUNT_OBJECT: &str = "whatsapp_business_account";

/// Returns the challenge to echo back when the subscription request is valid.
pub fn verify_subscription(params: &HashMap<String, String>, expected_token: &str) -> Option<String> {
    let mode = params.get("hub.mode").map(String::as_str).unwrap_or("");
    let token = params.get("hub.verify_token").map(String::as_str).unwrap_or("");
    let challenge = params.get("hub.challenge").cloned().unwrap_or_default();

    if mode == "subscribe"
        && !challenge.is_empty()
        && !expected_token.is_empty()
        && token == expected_token
    {
        Some(challenge)
    } else {
        None
    }
}

/// Checks `x-hub-signature-256`. Always passes when no app secret is set.
pub fn verify_signature(app_secret: &str, signature_header: Option<&str>, body: &[u8]) -> bool {
    if app_secret.is_empty() {
        return true;
    }
    let signature = signature_header.unwrap_or("").trim();
    let signature = signature
        .strip_prefix("sha256=")
        .unwrap_or(signature)
        .trim();
    if signature.is_empty() {
        return false;
    }
    let Ok(signature_bytes) = hex::decode(signature) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(app_secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&signature_bytes).is_ok()
}

/// Pulls every inbound message out of a webhook delivery. Status updates
/// and changes addressed to another business number are skipped.
pub fn extract_messages(payload: &Value, expected_phone_number_id: &str) -> Vec<InboundMessage> {
    if payload.get("object").and_then(Value::as_str) != Some(BUSINESS_ACCOUNT_OBJECT) {
        return Vec::new();
    }

    let mut extracted = Vec::new();
    let entries = payload
        .get("entry")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    for entry in entries {
        let changes = entry
            .get("changes")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();

        for change in changes {
            match change.get("field").and_then(Value::as_str) {
                None | Some("messages") => {}
                Some(_) => continue,
            }
            let Some(value) = change.get("value") else {
                continue;
            };
            let metadata_phone_id = value
                .get("metadata")
                .and_then(|m| m.get("phone_number_id"))
                .and_then(Value::as_str)
                .unwrap_or("");
            if !expected_phone_number_id.is_empty()
                && !metadata_phone_id.is_empty()
                && expected_phone_number_id != metadata_phone_id
            {
                continue;
            }

            let contacts = value
                .get("contacts")
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default();
            let messages = value
                .get("messages")
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default();

            for message in messages {
                let from = message.get("from").and_then(Value::as_str).unwrap_or("");
                let Some(wa_id) = normalize_phone(from) else {
                    continue;
                };
                let timestamp = message
                    .get("timestamp")
                    .and_then(Value::as_str)
                    .and_then(unix_to_iso)
                    .unwrap_or_else(now_iso);

                extracted.push(InboundMessage {
                    message_id: message
                        .get("id")
                        .and_then(Value::as_str)
                        .filter(|id| !id.is_empty())
                        .map(str::to_string),
                    contact_name: contact_name(message, contacts, &wa_id),
                    text: message_text(message),
                    message_type: message
                        .get("type")
                        .and_then(Value::as_str)
                        .unwrap_or("text")
                        .to_string(),
                    phone_number_id: metadata_phone_id.to_string(),
                    timestamp,
                    wa_id,
                });
            }
        }
    }

    extracted
}

fn profile_name(value: &Value) -> Option<&str> {
    value
        .get("profile")
        .and_then(|p| p.get("name"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|name| !name.is_empty())
}

fn contact_name(message: &Value, contacts: &[Value], wa_id: &str) -> String {
    if let Some(name) = profile_name(message) {
        return name.to_string();
    }
    let matching = contacts.iter().find(|contact| {
        contact
            .get("wa_id")
            .and_then(Value::as_str)
            .and_then(normalize_phone)
            .as_deref()
            == Some(wa_id)
    });
    let sole = match contacts {
        [only] => Some(only),
        _ => None,
    };
    matching
        .or(sole)
        .and_then(profile_name)
        .map(str::to_string)
        .unwrap_or_else(|| format!("User {wa_id}"))
}

fn message_text(message: &Value) -> String {
    let lookup = |path: &[&str]| -> Option<String> {
        let mut node = message;
        for key in path {
            node = node.get(*key)?;
        }
        node.as_str()
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .map(str::to_string)
    };

    let msg_type = message.get("type").and_then(Value::as_str).unwrap_or("");

    lookup(&["text", "body"])
        .or_else(|| lookup(&["button", "text"]))
        .or_else(|| lookup(&["interactive", "button_reply", "title"]))
        .or_else(|| lookup(&["interactive", "list_reply", "title"]))
        .or_else(|| lookup(&[msg_type, "caption"]))
        .unwrap_or_default()
}

#[derive(Debug, Clone)]
pub struct SendReceipt {
    pub message_id: Option<String>,
    pub response: Value,
}

pub async fn send_text(
    http: &reqwest::Client,
    graph: &GraphApiConfig,
    access_token: &str,
    phone_number_id: &str,
    to: &str,
    body: &str,
) -> Result<SendReceipt, WhatsAppError> {
    if access_token.is_empty() {
        return Err(WhatsAppError::NotConfigured("access token"));
    }
    if phone_number_id.is_empty() {
        return Err(WhatsAppError::NotConfigured("phone number id"));
    }

    let payload = json!({
        "messaging_product": "whatsapp",
        "recipient_type": "individual",
        "to": to,
        "type": "text",
        "text": {
            "preview_url": false,
            "body": body
        }
    });

    let response = http
        .post(format!(
            "{}/{}/{}/messages",
            graph.base_url, graph.version, phone_number_id
        ))
        .bearer_auth(access_token)
        .json(&payload)
        .send()
        .await?;

    let response = read_json(response).await?;
    let message_id = response
        .get("messages")
        .and_then(Value::as_array)
        .and_then(|messages| messages.first())
        .and_then(|m| m.get("id"))
        .and_then(Value::as_str)
        .map(str::to_string);

    Ok(SendReceipt {
        message_id,
        response,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct PhoneNumberDetails {
    pub display_phone_number: String,
    pub verified_name: String,
    pub code_verification_status: String,
    pub quality_rating: String,
}

/// Fetches the business number profile; used to test credentials.
pub async fn phone_number_details(
    http: &reqwest::Client,
    graph: &GraphApiConfig,
    access_token: &str,
    phone_number_id: &str,
) -> Result<PhoneNumberDetails, WhatsAppError> {
    if access_token.is_empty() {
        return Err(WhatsAppError::NotConfigured("access token"));
    }
    if phone_number_id.is_empty() {
        return Err(WhatsAppError::NotConfigured("phone number id"));
    }

    let response = http
        .get(format!(
            "{}/{}/{}",
            graph.base_url, graph.version, phone_number_id
        ))
        .bearer_auth(access_token)
        .send()
        .await?;
    let body = read_json(response).await?;

    let field = |key: &str| {
        body.get(key)
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string()
    };
    Ok(PhoneNumberDetails {
        display_phone_number: field("display_phone_number"),
        verified_name: field("verified_name"),
        code_verification_status: field("code_verification_status"),
        quality_rating: field("quality_rating"),
    })
}

async fn read_json(response: reqwest::Response) -> Result<Value, WhatsAppError> {
    let status = response.status();
    let raw_body = response.text().await?;
    let body =
        serde_json::from_str::<Value>(&raw_body).unwrap_or_else(|_| json!({ "raw": raw_body }));
    if status.is_success() {
        Ok(body)
    } else {
        Err(WhatsAppError::Api {
            status: status.as_u16(),
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};

    fn delivery(value: Value) -> Value {
        json!({
            "object": "whatsapp_business_account",
            "entry": [{
                "id": "WABA",
                "changes": [{ "field": "messages", "value": value }]
            }]
        })
    }

    fn graph(base_url: String) -> GraphApiConfig {
        GraphApiConfig {
            base_url,
            version: "v20.0".to_string(),
        }
    }

    #[test]
    fn extracts_text_message_with_contact_name() {
        let payload = delivery(json!({
            "messaging_product": "whatsapp",
            "metadata": { "display_phone_number": "15550000000", "phone_number_id": "111" },
            "contacts": [{ "profile": { "name": "Ana" }, "wa_id": "15551234567" }],
            "messages": [{
                "from": "15551234567",
                "id": "wamid.ABC",
                "timestamp": "1700000000",
                "type": "text",
                "text": { "body": "  Hello there " }
            }]
        }));

        let messages = extract_messages(&payload, "");
        assert_eq!(
            messages,
            vec![InboundMessage {
                message_id: Some("wamid.ABC".to_string()),
                wa_id: "15551234567".to_string(),
                contact_name: "Ana".to_string(),
                text: "Hello there".to_string(),
                message_type: "text".to_string(),
                phone_number_id: "111".to_string(),
                timestamp: "2023-11-14T22:13:20+00:00".to_string(),
            }]
        );
    }

    #[test]
    fn contact_name_falls_back_in_order() {
        let payload = delivery(json!({
            "contacts": [
                { "profile": { "name": "Ana" }, "wa_id": "1" },
                { "profile": { "name": "Ben" }, "wa_id": "2" }
            ],
            "messages": [
                { "from": "2", "id": "a", "type": "text", "text": { "body": "x" } },
                { "from": "3", "id": "b", "type": "text", "text": { "body": "y" } },
                { "from": "4", "id": "c", "type": "text", "text": { "body": "z" },
                  "profile": { "name": "Inline" } }
            ]
        }));
        let names = extract_messages(&payload, "")
            .into_iter()
            .map(|m| m.contact_name)
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["Ben", "User 3", "Inline"]);

        let single = delivery(json!({
            "contacts": [{ "profile": { "name": "Solo" }, "wa_id": "999" }],
            "messages": [{ "from": "5", "id": "d", "type": "text", "text": { "body": "hi" } }]
        }));
        assert_eq!(extract_messages(&single, "")[0].contact_name, "Solo");
    }

    #[test]
    fn reads_text_from_buttons_interactive_and_captions() {
        let payload = delivery(json!({
            "messages": [
                { "from": "1", "id": "a", "type": "button", "button": { "text": "Yes", "payload": "Y" } },
                { "from": "1", "id": "b", "type": "interactive",
                  "interactive": { "type": "list_reply", "list_reply": { "id": "l1", "title": "Pricing" } } },
                { "from": "1", "id": "c", "type": "image", "image": { "id": "media", "caption": "my receipt" } },
                { "from": "1", "id": "d", "type": "sticker", "sticker": { "id": "media" } }
            ]
        }));
        let texts = extract_messages(&payload, "")
            .into_iter()
            .map(|m| m.text)
            .collect::<Vec<_>>();
        assert_eq!(texts, vec!["Yes", "Pricing", "my receipt", ""]);
    }

    #[test]
    fn ignores_statuses_foreign_objects_and_other_numbers() {
        let statuses = delivery(json!({
            "metadata": { "phone_number_id": "111" },
            "statuses": [{ "id": "wamid.X", "status": "delivered" }]
        }));
        assert!(extract_messages(&statuses, "").is_empty());

        let mut page = delivery(json!({
            "messages": [{ "from": "1", "id": "a", "type": "text", "text": { "body": "hi" } }]
        }));
        page["object"] = json!("page");
        assert!(extract_messages(&page, "").is_empty());

        let other_number = delivery(json!({
            "metadata": { "phone_number_id": "222" },
            "messages": [{ "from": "1", "id": "a", "type": "text", "text": { "body": "hi" } }]
        }));
        assert!(extract_messages(&other_number, "111").is_empty());
        assert_eq!(extract_messages(&other_number, "222").len(), 1);
    }

    #[test]
    fn subscription_requires_mode_token_and_challenge() {
        let params = |mode: &str, token: &str, challenge: &str| {
            HashMap::from([
                ("hub.mode".to_string(), mode.to_string()),
                ("hub.verify_token".to_string(), token.to_string()),
                ("hub.challenge".to_string(), challenge.to_string()),
            ])
        };
        assert_eq!(
            verify_subscription(&params("subscribe", "123456", "abc"), "123456"),
            Some("abc".to_string())
        );
        assert_eq!(verify_subscription(&params("subscribe", "nope", "abc"), "123456"), None);
        assert_eq!(verify_subscription(&params("unsubscribe", "123456", "abc"), "123456"), None);
        assert_eq!(verify_subscription(&params("subscribe", "123456", ""), "123456"), None);
        assert_eq!(verify_subscription(&params("subscribe", "", "abc"), ""), None);
    }

    #[test]
    fn signature_matches_hmac_of_body() {
        let body = br#"{"object":"whatsapp_business_account"}"#;
        let mut mac = Hmac::<Sha256>::new_from_slice(b"secret").unwrap();
        mac.update(body);
        let header = format!("sha256={}", hex::encode(mac.finalize().into_bytes()));

        assert!(verify_signature("secret", Some(&header), body));
        assert!(!verify_signature("other", Some(&header), body));
        assert!(!verify_signature("secret", None, body));
        assert!(verify_signature("", None, body));
    }

    #[tokio::test]
    async fn send_text_posts_graph_payload() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/v20.0/111/messages")
            .match_header("authorization", "Bearer token-1")
            .match_body(Matcher::PartialJson(json!({
                "messaging_product": "whatsapp",
                "recipient_type": "individual",
                "to": "15551234567",
                "type": "text",
                "text": { "preview_url": false, "body": "Hi!" }
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"messaging_product":"whatsapp","messages":[{"id":"wamid.OUT"}]}"#)
            .expect(1)
            .create_async()
            .await;

        let receipt = send_text(
            &reqwest::Client::new(),
            &graph(server.url()),
            "token-1",
            "111",
            "15551234567",
            "Hi!",
        )
        .await
        .unwrap();

        mock.assert_async().await;
        assert_eq!(receipt.message_id.as_deref(), Some("wamid.OUT"));
    }

    #[tokio::test]
    async fn send_text_surfaces_provider_errors() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/v20.0/111/messages")
            .with_status(401)
            .with_body(r#"{"error":{"message":"Invalid OAuth access token","code":190}}"#)
            .create_async()
            .await;

        let err = send_text(
            &reqwest::Client::new(),
            &graph(server.url()),
            "expired",
            "111",
            "1",
            "x",
        )
        .await
        .unwrap_err();

        match err {
            WhatsAppError::Api { status, body } => {
                assert_eq!(status, 401);
                assert_eq!(body["error"]["code"], 190);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn send_text_refuses_without_token() {
        let err = send_text(
            &reqwest::Client::new(),
            &GraphApiConfig::default(),
            "",
            "111",
            "1",
            "x",
        )
        .await
        .unwrap_err();
        assert!(matches!(err, WhatsAppError::NotConfigured("access token")));
    }

    #[tokio::test]
    async fn phone_number_details_reads_profile() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/v20.0/111")
            .match_header("authorization", "Bearer token-1")
            .with_status(200)
            .with_body(
                r#"{"display_phone_number":"+1 555-000-0000","verified_name":"Acme","code_verification_status":"VERIFIED","quality_rating":"GREEN","id":"111"}"#,
            )
            .create_async()
            .await;

        let details =
            phone_number_details(&reqwest::Client::new(), &graph(server.url()), "token-1", "111")
                .await
                .unwrap();
        assert_eq!(details.verified_name, "Acme");
        assert_eq!(details.quality_rating, "GREEN");
    }
}
