use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Failures surfaced to the caller before the response stream starts.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("Chatbot not found")]
    ChatbotNotFound { chatbot_id: String },
    #[error("Invalid request")]
    BadRequest(String),
    #[error("Failed to process chat request")]
    Internal(String),
}

impl From<StoreError> for ChatError {
    fn from(err: StoreError) -> Self {
        ChatError::Internal(err.to_string())
    }
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        let error = self.to_string();
        match self {
            ChatError::ChatbotNotFound { chatbot_id } => (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": error, "chatbotId": chatbot_id })),
            )
                .into_response(),
            ChatError::BadRequest(details) => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": error, "details": details })),
            )
                .into_response(),
            ChatError::Internal(details) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": error, "details": details })),
            )
                .into_response(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("conversation {0} does not exist")]
    MissingConversation(String),
    #[error("chatbot {0} does not exist")]
    MissingChatbot(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("model API key not configured")]
    MissingApiKey,
    #[error("model request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("model returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("model stream read failed: {0}")]
    Stream(#[from] std::io::Error),
    #[error("model response could not be parsed: {0}")]
    Parse(String),
}

#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    #[error("query embedding failed: {0}")]
    Embedding(#[from] ModelError),
    #[error("similarity search failed: {0}")]
    Search(#[from] sqlx::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("invalid input for {tool}: {reason}")]
    InvalidInput { tool: &'static str, reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum EmailError {
    #[error("email delivery not configured")]
    NotConfigured,
    #[error("email request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("email provider returned {status}: {body}")]
    Status { status: u16, body: String },
}

#[derive(Debug, thiserror::Error)]
pub enum CrmError {
    #[error("CRM delivery not configured")]
    NotConfigured,
    #[error("CRM request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("CRM returned {status}: {body}")]
    Status { status: u16, body: String },
}

#[derive(Debug, thiserror::Error)]
pub enum PreviewError {
    #[error("preview request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("preview target returned {0}")]
    Status(u16),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read chat policy {path}: {source}")]
    PolicyRead {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse chat policy {path}: {source}")]
    PolicyParse {
        path: String,
        source: toml::de::Error,
    },
}
