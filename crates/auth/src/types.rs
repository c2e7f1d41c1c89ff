//! Wire types and session state

use serde::{Deserialize, Deserializer, Serialize};

use crate::domain::DomainKind;

/// サインイン認証情報
#[derive(Debug, Clone, Serialize)]
pub struct LoginCredentials {
    pub email: String,
    pub password: String,
}

/// Response of the login endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct LoginResponse {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub is_password_temporary: bool,
    #[serde(default, deserialize_with = "string_or_number")]
    pub client_id: Option<String>,
}

fn default_token_type() -> String {
    "bearer".to_string()
}

/// Response of the refresh endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct RefreshResponse {
    pub access_token: String,
    /// Present only when the server rotates refresh credentials.
    #[serde(default)]
    pub refresh_token: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChangePasswordRequest {
    pub old_password: String,
    pub new_password: String,
}

/// Access and refresh credentials, always stored and cleared together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialPair {
    pub access: String,
    pub refresh: String,
}

/// Minimal user-facing identity of the signed-in account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub email: String,
    #[serde(
        default,
        alias = "client_id",
        alias = "writer_id",
        deserialize_with = "string_or_number"
    )]
    pub account_id: Option<String>,
    #[serde(default)]
    pub is_password_temporary: bool,
}

/// Lifecycle state of one session domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Loading,
    Unauthenticated,
    Authenticated(Identity),
    PasswordChangeRequired(Identity),
}

impl SessionState {
    pub fn identity(&self) -> Option<&Identity> {
        match self {
            Self::Authenticated(identity) | Self::PasswordChangeRequired(identity) => {
                Some(identity)
            }
            _ => None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.identity().is_some()
    }
}

/// Why a session was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownReason {
    Logout,
    RefreshFailed,
    IdentityRejected,
}

/// Notifications emitted by a session domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    SignedIn { domain: DomainKind },
    TokenRefreshed { domain: DomainKind },
    PasswordChangeRequired { domain: DomainKind },
    /// The UI should navigate to `redirect_to`.
    SignedOut {
        domain: DomainKind,
        reason: TeardownReason,
        redirect_to: String,
    },
}

fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}
