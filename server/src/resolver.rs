//! Picks the reply for an inbound message: configured flows first, then
//! custom keywords, then an AI completion, then the default reply.

use regex::RegexBuilder;
use tracing::{debug, warn};

use crate::{
    ai::{self, ChatMessage, ChatRole},
    prompting::{render_system_prompt, SystemPromptContext},
    store::load_settings,
    types::{AppState, Direction, Flow, Keyword, MatchMode, MessageSource, Settings},
};

const AI_HISTORY_LIMIT: usize = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub text: String,
    pub source: MessageSource,
    /// Name of the matched flow or the matched keyword.
    pub matched: Option<String>,
}

pub fn trigger_matches(trigger: &str, text: &str, mode: MatchMode) -> bool {
    let trigger = trigger.trim();
    if trigger.is_empty() {
        return false;
    }
    match mode {
        MatchMode::Contains => text.to_lowercase().contains(&trigger.to_lowercase()),
        MatchMode::Exact => text.trim().to_lowercase() == trigger.to_lowercase(),
        // `\b` never matches beside punctuation, so triggers like `c++` need
        // explicit non-word neighbours.
        MatchMode::Word => {
            let pattern = format!(r"(?:^|\W){}(?:$|\W)", regex::escape(trigger));
            RegexBuilder::new(&pattern)
                .case_insensitive(true)
                .build()
                .map(|re| re.is_match(text))
                .unwrap_or(false)
        }
    }
}

/// Highest priority active flow whose triggers match; ties go to the most
/// recently updated.
pub fn match_flow<'a>(flows: &'a [Flow], text: &str) -> Option<&'a Flow> {
    let mut active = flows.iter().filter(|f| f.is_active).collect::<Vec<_>>();
    active.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| b.updated_at.cmp(&a.updated_at))
    });
    active.into_iter().find(|flow| {
        flow.triggers
            .iter()
            .any(|trigger| trigger_matches(trigger, text, flow.match_mode))
    })
}

pub fn match_keyword<'a>(keywords: &'a [Keyword], text: &str) -> Option<&'a Keyword> {
    keywords
        .iter()
        .filter(|k| k.is_active)
        .find(|k| trigger_matches(&k.keyword, text, MatchMode::Contains))
}

/// Resolves the reply for `text`. `wa_id` selects the conversation used as
/// AI context; `exclude_id` keeps the message being answered out of it.
pub async fn resolve(
    state: &AppState,
    text: &str,
    wa_id: Option<&str>,
    exclude_id: Option<&str>,
) -> Resolution {
    let flows = state.store.list_flows().await.unwrap_or_else(|err| {
        warn!(error = %err, "failed to load flows");
        Vec::new()
    });
    if let Some(flow) = match_flow(&flows, text) {
        debug!(flow = %flow.name, "flow matched");
        return Resolution {
            text: flow.response.clone(),
            source: MessageSource::Flow,
            matched: Some(flow.name.clone()),
        };
    }

    let keywords = state.store.list_keywords().await.unwrap_or_else(|err| {
        warn!(error = %err, "failed to load keywords");
        Vec::new()
    });
    if let Some(keyword) = match_keyword(&keywords, text) {
        debug!(keyword = %keyword.keyword, "keyword matched");
        return Resolution {
            text: keyword.response.clone(),
            source: MessageSource::Keyword,
            matched: Some(keyword.keyword.clone()),
        };
    }

    let settings = load_settings(state.store.as_ref()).await;
    if settings.ai_enabled && state.openai.api_key.is_some() {
        let messages = ai_messages(state, &settings, text, wa_id, exclude_id).await;
        match ai::chat_completion(&state.http, &state.openai, &messages).await {
            Ok(reply) => {
                return Resolution {
                    text: reply,
                    source: MessageSource::Ai,
                    matched: None,
                }
            }
            Err(err) => warn!(error = %err, "ai reply failed, using default reply"),
        }
    }

    Resolution {
        text: settings.default_reply,
        source: MessageSource::Fallback,
        matched: None,
    }
}

async fn ai_messages(
    state: &AppState,
    settings: &Settings,
    text: &str,
    wa_id: Option<&str>,
    exclude_id: Option<&str>,
) -> Vec<ChatMessage> {
    let system = render_system_prompt(&SystemPromptContext {
        business_name: &settings.business_name,
        instructions: &settings.ai_instructions,
    });
    let mut messages = vec![ChatMessage::new(ChatRole::System, system)];

    if let Some(wa_id) = wa_id {
        match state
            .store
            .messages_for_contact(wa_id, AI_HISTORY_LIMIT + 1)
            .await
        {
            Ok(history) => {
                let history = history
                    .into_iter()
                    .filter(|m| Some(m.id.as_str()) != exclude_id && !m.text.is_empty())
                    .collect::<Vec<_>>();
                let start = history.len().saturating_sub(AI_HISTORY_LIMIT);
                messages.extend(history.into_iter().skip(start).map(|m| {
                    let role = match m.direction {
                        Direction::Inbound => ChatRole::User,
                        Direction::Outbound => ChatRole::Assistant,
                    };
                    ChatMessage::new(role, m.text)
                }));
            }
            Err(err) => warn!(error = %err, wa_id, "failed to load conversation history"),
        }
    }

    messages.push(ChatMessage::new(ChatRole::User, text));
    messages
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use mockito::{Matcher, Server};

    use super::*;
    use crate::{
        config::Config,
        store::{MemoryStore, Store},
        types::{StoredMessage, DEFAULT_REPLY},
    };

    fn flow(name: &str, triggers: &[&str], priority: i32, updated_at: &str) -> Flow {
        Flow {
            id: name.to_string(),
            name: name.to_string(),
            triggers: triggers.iter().map(|t| t.to_string()).collect(),
            response: format!("{name} reply"),
            is_active: true,
            priority,
            match_mode: MatchMode::Contains,
            user_id: "default".to_string(),
            created_at: "2024-01-01T00:00:00+00:00".to_string(),
            updated_at: updated_at.to_string(),
        }
    }

    fn keyword(word: &str, response: &str) -> Keyword {
        Keyword {
            id: word.to_string(),
            keyword: word.to_string(),
            response: response.to_string(),
            is_active: true,
            created_at: "2024-01-01T00:00:00+00:00".to_string(),
            updated_at: "2024-01-01T00:00:00+00:00".to_string(),
        }
    }

    fn state_with(config: Config) -> (Arc<AppState>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (AppState::new(&config, store.clone()), store)
    }

    #[test]
    fn match_modes() {
        assert!(trigger_matches("Price", "what is the PRICE?", MatchMode::Contains));
        assert!(trigger_matches(" hello ", "Hello", MatchMode::Exact));
        assert!(!trigger_matches("hello", "hello there", MatchMode::Exact));
        assert!(trigger_matches("hi", "oh HI there", MatchMode::Word));
        assert!(!trigger_matches("hi", "this is it", MatchMode::Word));
        assert!(trigger_matches("c++", "I like c++ a lot", MatchMode::Contains));
        assert!(!trigger_matches("  ", "anything", MatchMode::Contains));
    }

    #[test]
    fn word_mode_accepts_punctuated_triggers() {
        assert!(trigger_matches("c++", "I like C++ a lot", MatchMode::Word));
        assert!(trigger_matches("hi!", "oh hi! there", MatchMode::Word));
        assert!(trigger_matches("$5", "$5 deal?", MatchMode::Word));
        assert!(trigger_matches("hi!", "hi!", MatchMode::Word));
        assert!(!trigger_matches("c++", "c++x", MatchMode::Word));
        assert!(!trigger_matches("$5", "$50 deal", MatchMode::Word));
    }

    #[test]
    fn higher_priority_flow_wins_then_recency() {
        let flows = vec![
            flow("old", &["order"], 1, "2024-01-01T00:00:00+00:00"),
            flow("new", &["order"], 1, "2024-02-01T00:00:00+00:00"),
            flow("low", &["order"], 0, "2024-03-01T00:00:00+00:00"),
        ];
        assert_eq!(match_flow(&flows, "my order").map(|f| f.name.as_str()), Some("new"));

        let mut flows = flows;
        flows[2].priority = 5;
        assert_eq!(match_flow(&flows, "my order").map(|f| f.name.as_str()), Some("low"));
    }

    #[test]
    fn inactive_flows_and_keywords_are_skipped() {
        let mut paused = flow("paused", &["help"], 9, "2024-01-01T00:00:00+00:00");
        paused.is_active = false;
        assert!(match_flow(&[paused], "help").is_none());

        let mut kw = keyword("help", "Here to help");
        kw.is_active = false;
        assert!(match_keyword(&[kw], "help").is_none());
    }

    #[tokio::test]
    async fn resolves_flow_before_keyword() {
        let (state, store) = state_with(Config::default());
        store
            .insert_flow(&flow("greeting", &["hello"], 0, "2024-01-01T00:00:00+00:00"))
            .await
            .unwrap();
        store.insert_keyword(&keyword("hello", "keyword hello")).await.unwrap();
        store.insert_keyword(&keyword("price", "Prices start at $5")).await.unwrap();

        let by_flow = resolve(&state, "Hello!", None, None).await;
        assert_eq!(by_flow.source, MessageSource::Flow);
        assert_eq!(by_flow.text, "greeting reply");

        let by_keyword = resolve(&state, "what PRICE?", None, None).await;
        assert_eq!(by_keyword.source, MessageSource::Keyword);
        assert_eq!(by_keyword.text, "Prices start at $5");
        assert_eq!(by_keyword.matched.as_deref(), Some("price"));
    }

    #[tokio::test]
    async fn falls_back_to_default_reply_without_ai_key() {
        let (state, _) = state_with(Config::default());
        let resolution = resolve(&state, "random question", None, None).await;
        assert_eq!(resolution.source, MessageSource::Fallback);
        assert_eq!(resolution.text, DEFAULT_REPLY);
    }

    #[tokio::test]
    async fn ai_gets_history_without_current_message() {
        let mut server = Server::new_async().await;
        let mut config = Config::default();
        config.openai.api_key = Some("sk-test".to_string());
        config.openai.base_url = server.url();
        let (state, store) = state_with(config);

        for (id, text, direction, ts) in [
            ("m1", "do you deliver?", Direction::Inbound, "2024-01-01T00:00:01+00:00"),
            ("m2", "Yes, citywide.", Direction::Outbound, "2024-01-01T00:00:02+00:00"),
            ("m3", "how long does it take?", Direction::Inbound, "2024-01-01T00:00:03+00:00"),
        ] {
            store
                .insert_message(&StoredMessage {
                    id: id.to_string(),
                    text: text.to_string(),
                    timestamp: ts.to_string(),
                    wa_id: "1555".to_string(),
                    contact_name: "Ana".to_string(),
                    message_type: "text".to_string(),
                    direction,
                    phone_number_id: "111".to_string(),
                    original_message: None,
                    source: None,
                    broadcast_id: None,
                })
                .await
                .unwrap();
        }

        let mock = server
            .mock("POST", "/chat/completions")
            .match_body(Matcher::Regex(
                r#"\{"role":"user","content":"do you deliver\?"\},\{"role":"assistant","content":"Yes, citywide\."\},\{"role":"user","content":"how long does it take\?"\}\]"#
                    .to_string(),
            ))
            .with_status(200)
            .with_body(r#"{"choices":[{"message":{"content":"About an hour."}}]}"#)
            .create_async()
            .await;

        let resolution = resolve(&state, "how long does it take?", Some("1555"), Some("m3")).await;
        mock.assert_async().await;
        assert_eq!(resolution.source, MessageSource::Ai);
        assert_eq!(resolution.text, "About an hour.");
    }

    #[tokio::test]
    async fn ai_failure_falls_through_to_default() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/chat/completions")
            .with_status(500)
            .create_async()
            .await;
        let mut config = Config::default();
        config.openai.api_key = Some("sk-test".to_string());
        config.openai.base_url = server.url();
        let (state, store) = state_with(config);
        store
            .save_settings(&Settings {
                default_reply: "We will call you back.".to_string(),
                ..Settings::default()
            })
            .await
            .unwrap();

        let resolution = resolve(&state, "anything", Some("1555"), None).await;
        assert_eq!(resolution.source, MessageSource::Fallback);
        assert_eq!(resolution.text, "We will call you back.");
    }
}
