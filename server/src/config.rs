use std::{env, fmt::Display, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};
use tracing::warn;

pub const DEFAULT_VERIFY_TOKEN: &str = "123456";

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_url: Option<String>,
    pub whatsapp: WhatsAppConfig,
    pub app_secret: String,
    pub graph: GraphApiConfig,
    pub openai: OpenAiConfig,
    pub broadcast_delay: Duration,
}

/// Credentials the dashboard can replace at runtime through `POST /config`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WhatsAppConfig {
    pub access_token: String,
    pub phone_number_id: String,
    pub verify_token: String,
    pub webhook_url: String,
}

#[derive(Debug, Clone)]
pub struct GraphApiConfig {
    pub base_url: String,
    pub version: String,
}

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3001,
            database_url: None,
            whatsapp: WhatsAppConfig {
                verify_token: DEFAULT_VERIFY_TOKEN.to_string(),
                ..WhatsAppConfig::default()
            },
            app_secret: String::new(),
            graph: GraphApiConfig::default(),
            openai: OpenAiConfig::default(),
            broadcast_delay: Duration::from_millis(100),
        }
    }
}

impl Default for GraphApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://graph.facebook.com".to_string(),
            version: "v20.0".to_string(),
        }
    }
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-3.5-turbo".to_string(),
            max_tokens: 150,
            temperature: 0.7,
        }
    }
}

impl Config {
    /// Reads the environment. Call [`load_dotenv`] and install the tracing
    /// subscriber first so parse warnings are not lost.
    pub fn from_env() -> Self {
        let defaults = Config::default();

        let port = match non_empty("PORT").or_else(|| non_empty("WEBHOOK_PORT")) {
            Some(raw) => parse_or("PORT", &raw, defaults.port),
            None => defaults.port,
        };

        Self {
            port,
            database_url: non_empty("DATABASE_URL"),
            whatsapp: WhatsAppConfig {
                access_token: non_empty("WHATSAPP_TOKEN").unwrap_or_default(),
                phone_number_id: non_empty("PHONE_NUMBER_ID").unwrap_or_default(),
                verify_token: non_empty("VERIFY_TOKEN")
                    .unwrap_or_else(|| DEFAULT_VERIFY_TOKEN.to_string()),
                webhook_url: non_empty("WEBHOOK_URL").unwrap_or_default(),
            },
            app_secret: non_empty("WHATSAPP_APP_SECRET").unwrap_or_default(),
            graph: GraphApiConfig {
                base_url: non_empty("GRAPH_API_BASE")
                    .map(|url| url.trim_end_matches('/').to_string())
                    .unwrap_or(defaults.graph.base_url),
                version: non_empty("GRAPH_API_VERSION").unwrap_or(defaults.graph.version),
            },
            openai: OpenAiConfig {
                api_key: non_empty("OPENAI_API_KEY"),
                base_url: non_empty("OPENAI_BASE_URL")
                    .map(|url| url.trim_end_matches('/').to_string())
                    .unwrap_or(defaults.openai.base_url),
                model: non_empty("OPENAI_MODEL").unwrap_or(defaults.openai.model),
                max_tokens: load_or("OPENAI_MAX_TOKENS", defaults.openai.max_tokens),
                temperature: load_or("OPENAI_TEMPERATURE", defaults.openai.temperature),
            },
            broadcast_delay: Duration::from_millis(load_or("BROADCAST_DELAY_MS", 100u64)),
        }
    }
}

pub fn load_dotenv() {
    let _ = dotenvy::dotenv();
}

/// `LOG_FORMAT=json` selects JSON log lines. Read on its own because it is
/// needed before logging is set up.
pub fn json_logs_from_env() -> bool {
    is_json_format(non_empty("LOG_FORMAT").as_deref())
}

fn is_json_format(raw: Option<&str>) -> bool {
    raw.is_some_and(|v| v.eq_ignore_ascii_case("json"))
}

impl WhatsAppConfig {
    pub fn can_send(&self) -> bool {
        !self.access_token.is_empty() && !self.phone_number_id.is_empty()
    }

    /// Shape returned to the dashboard; the access token is never echoed in full.
    pub fn masked(&self) -> WhatsAppConfig {
        WhatsAppConfig {
            access_token: mask_token(&self.access_token),
            ..self.clone()
        }
    }
}

pub fn mask_token(token: &str) -> String {
    if token.is_empty() {
        return String::new();
    }
    let prefix = token.chars().take(10).collect::<String>();
    format!("{prefix}...")
}

fn non_empty(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn load_or<T: FromStr>(key: &str, default: T) -> T
where
    T::Err: Display,
{
    match non_empty(key) {
        Some(raw) => parse_or(key, &raw, default),
        None => default,
    }
}

fn parse_or<T: FromStr>(key: &str, raw: &str, default: T) -> T
where
    T::Err: Display,
{
    raw.parse().unwrap_or_else(|e| {
        warn!("Invalid {key} value {raw:?}: {e}, using default");
        default
    })
}
