//! Error type for the session core

use reqwest::StatusCode;
use thiserror::Error;

/// エラー型
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Login failed: {0}")]
    LoginFailed(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Session expired")]
    SessionExpired,

    #[error("Refresh rejected ({status}): {message}")]
    RefreshRejected { status: u16, message: String },

    #[error("Rate limited (retry after {retry_after:?}s): {message}")]
    RateLimited {
        retry_after: Option<u64>,
        message: String,
    },

    #[error("Missing session")]
    MissingSession,

    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AuthError {
    /// Build an error from a non-success response body.
    pub(crate) fn api(status: StatusCode, body: &str) -> Self {
        AuthError::Api {
            status: status.as_u16(),
            message: extract_message(status, body),
        }
    }

    /// Text suitable for showing to the signed-in user.
    pub fn user_message(&self) -> String {
        match self {
            AuthError::Api { message, .. }
            | AuthError::LoginFailed(message)
            | AuthError::Unauthorized(message)
            | AuthError::RateLimited { message, .. } => message.clone(),
            AuthError::SessionExpired | AuthError::RefreshRejected { .. } => {
                "Your session has expired. Please sign in again.".to_string()
            }
            AuthError::MissingSession => "You are not signed in.".to_string(),
            AuthError::NetworkError(_) => {
                "Could not reach the server. Check your connection.".to_string()
            }
            other => other.to_string(),
        }
    }

    /// Whether the session was torn down as part of producing this error.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            AuthError::SessionExpired | AuthError::RefreshRejected { .. }
        )
    }

    /// Seconds the server asked us to wait, for rate-limit errors.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            AuthError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Pull a human readable message out of an error body.
///
/// Servers answer with `{"detail": ...}`, `{"message": ...}` or
/// `{"error": ...}`; anything else falls back to the raw text or the
/// status reason.
pub(crate) fn extract_message(status: StatusCode, body: &str) -> String {
    if let Some(message) = message_field(body) {
        return message;
    }

    let trimmed = body.trim();
    if !trimmed.is_empty() && trimmed.len() <= 200 {
        return trimmed.to_string();
    }

    status
        .canonical_reason()
        .unwrap_or("Request failed")
        .to_string()
}

/// The `detail`, `message` or `error` string of a JSON body, if any.
pub(crate) fn message_field(body: &str) -> Option<String> {
    let value = serde_json::from_str::<serde_json::Value>(body).ok()?;
    ["detail", "message", "error"]
        .iter()
        .find_map(|field| value.get(*field).and_then(|v| v.as_str()))
        .map(str::to_string)
}
