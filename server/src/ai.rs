use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::{config::OpenAiConfig, error::AiError};

const SUGGESTION_MAX_TOKENS: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowSuggestion {
    pub name: String,
    #[serde(default)]
    pub triggers: Vec<String>,
    pub response: String,
    #[serde(default = "active_by_default")]
    pub is_active: bool,
}

fn active_by_default() -> bool {
    true
}

pub async fn chat_completion(
    http: &reqwest::Client,
    config: &OpenAiConfig,
    messages: &[ChatMessage],
) -> Result<String, AiError> {
    complete(http, config, messages, config.max_tokens).await
}

/// Asks the model for five starter flows for the given kind of business.
pub async fn suggest_flows(
    http: &reqwest::Client,
    config: &OpenAiConfig,
    business_type: &str,
) -> Result<Vec<FlowSuggestion>, AiError> {
    let prompt = format!(
        "Generate 5 common customer service flows for a {business_type} business. Each flow should have:\n\
         1. A descriptive name\n\
         2. 3-5 trigger keywords/phrases\n\
         3. A helpful response message\n\n\
         Format as a JSON array of objects with: name, triggers (array), response, isActive (true). \
         Reply with the JSON only."
    );
    let messages = [
        ChatMessage::new(
            ChatRole::System,
            "You are a customer service expert. Generate practical chatbot flows.",
        ),
        ChatMessage::new(ChatRole::User, prompt),
    ];
    let text = complete(http, config, &messages, SUGGESTION_MAX_TOKENS).await?;
    parse_suggestions(&text)
}

async fn complete(
    http: &reqwest::Client,
    config: &OpenAiConfig,
    messages: &[ChatMessage],
    max_tokens: u32,
) -> Result<String, AiError> {
    let api_key = config
        .api_key
        .as_deref()
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .ok_or(AiError::MissingApiKey)?;

    debug!(model = %config.model, messages = messages.len(), "requesting chat completion");
    let response = http
        .post(format!("{}/chat/completions", config.base_url))
        .bearer_auth(api_key)
        .json(&json!({
            "model": config.model,
            "messages": messages,
            "max_tokens": max_tokens,
            "temperature": config.temperature
        }))
        .send()
        .await?;
    if !response.status().is_success() {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        return Err(AiError::Api { status, body });
    }
    let payload = serde_json::from_str::<Value>(&response.text().await?)?;
    let text = payload
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .and_then(|choice| choice.get("message"))
        .and_then(|msg| msg.get("content"))
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or("")
        .to_string();
    if text.is_empty() {
        return Err(AiError::EmptyResponse);
    }
    Ok(text)
}

fn parse_suggestions(text: &str) -> Result<Vec<FlowSuggestion>, AiError> {
    let trimmed = text.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.trim_end().strip_suffix("```"))
        .unwrap_or(trimmed);
    Ok(serde_json::from_str(body.trim())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};

    fn config(base_url: String) -> OpenAiConfig {
        OpenAiConfig {
            api_key: Some("sk-test".to_string()),
            base_url,
            ..OpenAiConfig::default()
        }
    }

    #[tokio::test]
    async fn returns_trimmed_completion() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/chat/completions")
            .match_header("authorization", "Bearer sk-test")
            .match_body(Matcher::PartialJson(json!({
                "model": "gpt-3.5-turbo",
                "max_tokens": 150,
                "messages": [
                    { "role": "system", "content": "be brief" },
                    { "role": "user", "content": "hi" }
                ]
            })))
            .with_status(200)
            .with_body(r#"{"choices":[{"message":{"role":"assistant","content":"  Hello!  "}}]}"#)
            .create_async()
            .await;

        let text = chat_completion(
            &reqwest::Client::new(),
            &config(server.url()),
            &[
                ChatMessage::new(ChatRole::System, "be brief"),
                ChatMessage::new(ChatRole::User, "hi"),
            ],
        )
        .await
        .unwrap();

        mock.assert_async().await;
        assert_eq!(text, "Hello!");
    }

    #[tokio::test]
    async fn missing_key_fails_before_any_request() {
        let config = OpenAiConfig {
            api_key: Some("  ".to_string()),
            ..OpenAiConfig::default()
        };
        let err = chat_completion(&reqwest::Client::new(), &config, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, AiError::MissingApiKey));
    }

    #[tokio::test]
    async fn upstream_errors_and_empty_content_are_errors() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/chat/completions")
            .with_status(429)
            .with_body("rate limited")
            .create_async()
            .await;
        let err = chat_completion(&reqwest::Client::new(), &config(server.url()), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, AiError::Api { status: 429, .. }));

        let mut server = Server::new_async().await;
        server
            .mock("POST", "/chat/completions")
            .with_status(200)
            .with_body(r#"{"choices":[{"message":{"content":""}}]}"#)
            .create_async()
            .await;
        let err = chat_completion(&reqwest::Client::new(), &config(server.url()), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, AiError::EmptyResponse));
    }

    #[test]
    fn suggestions_tolerate_code_fences() {
        let text = "```json\n[{\"name\":\"Hours\",\"triggers\":[\"hours\",\"open\"],\"response\":\"9-5\",\"isActive\":true}]\n```";
        let suggestions = parse_suggestions(text).unwrap();
        assert_eq!(suggestions.len(), 1);
        assert_eq!(suggestions[0].triggers, vec!["hours", "open"]);

        let bare = r#"[{"name":"Hi","triggers":["hello"],"response":"Hey"}]"#;
        assert!(parse_suggestions(bare).unwrap()[0].is_active);
        assert!(parse_suggestions("not json").is_err());
    }

    #[tokio::test]
    async fn suggest_flows_uses_larger_budget() {
        let mut server = Server::new_async().await;
        let content = r#"[{"name":"Pricing","triggers":["price"],"response":"See our menu"}]"#;
        let mock = server
            .mock("POST", "/chat/completions")
            .match_body(Matcher::PartialJson(json!({ "max_tokens": 1000 })))
            .with_status(200)
            .with_body(json!({ "choices": [{ "message": { "content": content } }] }).to_string())
            .create_async()
            .await;

        let flows = suggest_flows(&reqwest::Client::new(), &config(server.url()), "bakery")
            .await
            .unwrap();
        mock.assert_async().await;
        assert_eq!(flows[0].name, "Pricing");
    }
}
