use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("corrupt stored document: {0}")]
    Corrupt(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum WhatsAppError {
    #[error("whatsapp is not configured: missing {0}")]
    NotConfigured(&'static str),

    #[error("whatsapp request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("whatsapp api returned {status}")]
    Api { status: u16, body: Value },
}

#[derive(Debug, Error)]
pub enum AiError {
    #[error("OPENAI_API_KEY not configured")]
    MissingApiKey,

    #[error("openai request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("openai returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("openai response had empty content")]
    EmptyResponse,

    #[error("openai response could not be parsed: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("invalid webhook signature")]
    InvalidSignature,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    WhatsApp(#[from] WhatsAppError),

    #[error(transparent)]
    Ai(#[from] AiError),
}

impl AppError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        AppError::BadRequest(message.into())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, json!({ "error": self.to_string() })),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, json!({ "error": self.to_string() })),
            AppError::InvalidSignature => {
                (StatusCode::UNAUTHORIZED, json!({ "error": self.to_string() }))
            }
            AppError::WhatsApp(WhatsAppError::NotConfigured(_)) => (
                StatusCode::BAD_REQUEST,
                json!({ "error": "WhatsApp configuration missing" }),
            ),
            AppError::WhatsApp(WhatsAppError::Api { status, body }) => (
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY),
                json!({ "error": "WhatsApp API request failed", "details": body }),
            ),
            AppError::WhatsApp(WhatsAppError::Request(_)) | AppError::Ai(_) => {
                tracing::error!(error = %self, "upstream request failed");
                (StatusCode::BAD_GATEWAY, json!({ "error": self.to_string() }))
            }
            AppError::Store(_) => {
                tracing::error!(error = %self, "store operation failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": "Internal server error" }),
                )
            }
        };

        (status, Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_status_passes_through() {
        let err = AppError::WhatsApp(WhatsAppError::Api {
            status: 401,
            body: json!({ "error": { "message": "bad token" } }),
        });
        assert_eq!(err.into_response().status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn missing_whatsapp_config_is_bad_request() {
        let err = AppError::WhatsApp(WhatsAppError::NotConfigured("access token"));
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }
}
