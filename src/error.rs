//! Error handling for the TenderDesk client

use std::fmt;
use tenderdesk_auth::AuthError;
use thiserror::Error;

/// Unified error type for the TenderDesk client
#[derive(Error, Debug)]
pub enum Error {
    /// Session and authorization errors
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// Network or HTTP related errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization or deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// URL parsing errors
    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    /// Session file errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// General errors
    #[error("{0}")]
    General(String),
}

impl Error {
    /// Create a new general error
    pub fn general<T: fmt::Display>(msg: T) -> Self {
        Error::General(msg.to_string())
    }

    /// Text suitable for showing to the signed-in user.
    pub fn user_message(&self) -> String {
        match self {
            Error::Auth(e) => e.user_message(),
            other => other.to_string(),
        }
    }

    /// Whether the session ended while producing this error.
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, Error::Auth(e) if e.is_session_fatal())
    }
}
