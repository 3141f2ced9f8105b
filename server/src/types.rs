use std::{
    collections::HashMap,
    sync::{atomic::AtomicUsize, Arc},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{mpsc, Mutex, RwLock};

use crate::{
    config::{Config, GraphApiConfig, OpenAiConfig, WhatsAppConfig},
    store::Store,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

/// What produced an outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageSource {
    Flow,
    Keyword,
    Ai,
    Fallback,
    Agent,
    Broadcast,
}

impl MessageSource {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageSource::Flow => "flow",
            MessageSource::Keyword => "keyword",
            MessageSource::Ai => "ai",
            MessageSource::Fallback => "fallback",
            MessageSource::Agent => "agent",
            MessageSource::Broadcast => "broadcast",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    pub id: String,
    pub text: String,
    pub timestamp: String,
    /// Conversation partner, for both directions.
    #[serde(rename = "from")]
    pub wa_id: String,
    pub contact_name: String,
    #[serde(rename = "type")]
    pub message_type: String,
    pub direction: Direction,
    pub phone_number_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<MessageSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broadcast_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub wa_id: String,
    pub contact_name: String,
    pub profile_name: String,
    pub last_message: String,
    pub last_message_at: String,
    pub message_count: i64,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone)]
pub struct ContactUpdate {
    pub wa_id: String,
    pub contact_name: String,
    pub last_message: String,
    pub last_message_at: String,
}

impl ContactUpdate {
    pub fn from_message(message: &StoredMessage) -> Self {
        Self {
            wa_id: message.wa_id.clone(),
            contact_name: message.contact_name.clone(),
            last_message: message.text.clone(),
            last_message_at: message.timestamp.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    #[default]
    Contains,
    Exact,
    Word,
}

impl MatchMode {
    pub fn as_str(self) -> &'static str {
        match self {
            MatchMode::Contains => "contains",
            MatchMode::Exact => "exact",
            MatchMode::Word => "word",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "exact" => MatchMode::Exact,
            "word" => MatchMode::Word,
            _ => MatchMode::Contains,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Flow {
    pub id: String,
    pub name: String,
    pub triggers: Vec<String>,
    pub response: String,
    pub is_active: bool,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub match_mode: MatchMode,
    #[serde(default)]
    pub user_id: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Keyword {
    pub id: String,
    pub keyword: String,
    pub response: String,
    pub is_active: bool,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BroadcastStatus {
    Draft,
    Scheduled,
    Sent,
}

impl BroadcastStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BroadcastStatus::Draft => "draft",
            BroadcastStatus::Scheduled => "scheduled",
            BroadcastStatus::Sent => "sent",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "draft" => Some(BroadcastStatus::Draft),
            "scheduled" => Some(BroadcastStatus::Scheduled),
            "sent" => Some(BroadcastStatus::Sent),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recipient {
    pub phone_number: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastResults {
    pub total: usize,
    pub sent: usize,
    pub failed: usize,
    pub errors: Vec<BroadcastFailure>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastFailure {
    pub recipient: String,
    pub error: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Broadcast {
    pub id: String,
    pub name: String,
    pub message: String,
    #[serde(default)]
    pub recipients: Vec<Recipient>,
    pub status: BroadcastStatus,
    #[serde(default)]
    pub scheduled_for: Option<String>,
    #[serde(default)]
    pub sent_at: Option<String>,
    #[serde(default)]
    pub results: Option<BroadcastResults>,
    pub created_at: String,
    pub updated_at: String,
}

pub const DEFAULT_REPLY: &str = "Thanks for your message! 😊 We have received it and will get back to you shortly.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub business_name: String,
    pub auto_reply_enabled: bool,
    pub ai_enabled: bool,
    pub ai_instructions: String,
    pub default_reply: String,
    pub updated_at: Option<String>,
    /// Dashboard-only sections (profile, notifications) kept as sent.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            business_name: String::new(),
            auto_reply_enabled: true,
            ai_enabled: true,
            ai_instructions: String::new(),
            default_reply: DEFAULT_REPLY.to_string(),
            updated_at: None,
            extra: Map::new(),
        }
    }
}

/// One inbound message pulled out of a webhook delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub message_id: Option<String>,
    pub wa_id: String,
    pub contact_name: String,
    pub text: String,
    pub message_type: String,
    pub phone_number_id: String,
    pub timestamp: String,
}

#[derive(Default)]
pub struct RealtimeState {
    pub clients: HashMap<usize, mpsc::UnboundedSender<String>>,
}

pub struct AppState {
    pub store: Arc<dyn Store>,
    pub realtime: Mutex<RealtimeState>,
    pub next_client_id: AtomicUsize,
    pub http: reqwest::Client,
    pub whatsapp: RwLock<WhatsAppConfig>,
    pub app_secret: String,
    pub graph: GraphApiConfig,
    pub openai: OpenAiConfig,
    pub broadcast_delay: Duration,
}

impl AppState {
    pub fn new(config: &Config, store: Arc<dyn Store>) -> Arc<Self> {
        Arc::new(Self {
            store,
            realtime: Mutex::new(RealtimeState::default()),
            next_client_id: AtomicUsize::new(0),
            http: reqwest::Client::new(),
            whatsapp: RwLock::new(config.whatsapp.clone()),
            app_secret: config.app_secret.clone(),
            graph: config.graph.clone(),
            openai: config.openai.clone(),
            broadcast_delay: config.broadcast_delay,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct EventEnvelopeIn {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigBody {
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub phone_number_id: String,
    #[serde(default)]
    pub verify_token: String,
    #[serde(default)]
    pub webhook_url: String,
}

#[derive(Debug, Deserialize)]
pub struct SendMessageBody {
    #[serde(default)]
    pub to: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct TestMessageBody {
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateFlowBody {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub triggers: Vec<String>,
    #[serde(default)]
    pub response: String,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub match_mode: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchFlowBody {
    pub name: Option<String>,
    pub triggers: Option<Vec<String>>,
    pub response: Option<String>,
    pub is_active: Option<bool>,
    pub priority: Option<i32>,
    pub match_mode: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuggestFlowsBody {
    #[serde(default)]
    pub business_type: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateKeywordBody {
    #[serde(default)]
    pub keyword: String,
    #[serde(default)]
    pub response: String,
    #[serde(default)]
    pub is_active: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchKeywordBody {
    pub keyword: Option<String>,
    pub response: Option<String>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateBroadcastBody {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub recipients: Vec<Recipient>,
    #[serde(default)]
    pub scheduled_for: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchBroadcastBody {
    pub name: Option<String>,
    pub message: Option<String>,
    pub recipients: Option<Vec<Recipient>>,
    pub status: Option<String>,
    pub scheduled_for: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendBroadcastBody {
    #[serde(default)]
    pub broadcast_id: String,
    #[serde(default)]
    pub recipients: Vec<Recipient>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestWhatsAppBody {
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub phone_number_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatPreviewBody {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub wa_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}
