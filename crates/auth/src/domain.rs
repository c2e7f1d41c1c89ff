//! Session domains
//!
//! Client and writer users share one session contract. A [`SessionDomain`]
//! carries everything that differs between them: endpoints, storage key
//! namespace, login route and a few feature switches.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The two isolated user populations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DomainKind {
    Client,
    Writer,
}

impl fmt::Display for DomainKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Client => write!(f, "client"),
            Self::Writer => write!(f, "writer"),
        }
    }
}

/// API paths of one domain, relative to the base URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub login: String,
    pub refresh: String,
    pub profile: String,
    pub change_password: String,
}

impl Endpoints {
    /// Endpoints under a path prefix, e.g. `""` or `"/writer"`.
    pub fn with_prefix(prefix: &str) -> Self {
        Self {
            login: format!("{}/auth/login", prefix),
            refresh: format!("{}/auth/refresh", prefix),
            profile: format!("{}/profile/me", prefix),
            change_password: format!("{}/auth/change-password", prefix),
        }
    }
}

/// Name and path of the cookie mirroring the access credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CookieSettings {
    pub name: String,
    pub path: String,
}

/// Bindings for one session domain.
#[derive(Debug, Clone)]
pub struct SessionDomain {
    pub kind: DomainKind,
    pub endpoints: Endpoints,
    /// Prefix of every persisted key; must differ between domains.
    pub key_prefix: String,
    /// Where the UI goes after teardown.
    pub login_route: String,
    /// Whether the login response's temporary-password flag gates the session.
    pub tracks_temporary_password: bool,
    pub cookie: Option<CookieSettings>,
}

impl SessionDomain {
    pub fn client() -> Self {
        Self {
            kind: DomainKind::Client,
            endpoints: Endpoints::with_prefix(""),
            key_prefix: "client_".to_string(),
            login_route: "/login".to_string(),
            tracks_temporary_password: true,
            cookie: None,
        }
    }

    pub fn writer() -> Self {
        Self {
            kind: DomainKind::Writer,
            endpoints: Endpoints::with_prefix("/writer"),
            key_prefix: "writer_".to_string(),
            login_route: "/writer/login".to_string(),
            tracks_temporary_password: false,
            cookie: Some(CookieSettings {
                name: "writer_access_token".to_string(),
                path: "/writer".to_string(),
            }),
        }
    }

    pub fn for_kind(kind: DomainKind) -> Self {
        match kind {
            DomainKind::Client => Self::client(),
            DomainKind::Writer => Self::writer(),
        }
    }

    /// Namespaced storage key.
    pub fn key(&self, name: &str) -> String {
        format!("{}{}", self.key_prefix, name)
    }

    /// Set the cookie path for the writer mirror.
    pub fn with_cookie_path(mut self, path: &str) -> Self {
        if let Some(cookie) = self.cookie.as_mut() {
            cookie.path = path.to_string();
        }
        self
    }
}

/// Join a base URL and an endpoint path without doubling slashes.
pub(crate) fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}
