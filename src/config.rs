//! Configuration options for the TenderDesk client

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use log::warn;
use tenderdesk_auth::{unix_now, AuthOptions, Clock, RefreshPolicy};

/// Configuration options for the TenderDesk client
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Whether to refresh credentials ahead of expiry
    pub auto_refresh_token: bool,

    /// Whether sessions survive a restart (needs `storage_path`)
    pub persist_session: bool,

    /// Session file used when `persist_session` is set
    pub storage_path: Option<PathBuf>,

    /// The request timeout
    pub request_timeout: Option<Duration>,

    /// Timing of proactive refresh
    pub refresh_policy: RefreshPolicy,

    /// Path the writer cookie is scoped to
    pub writer_cookie_path: String,

    /// Unix-seconds clock for expiry decisions
    pub clock: Clock,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            auto_refresh_token: true,
            persist_session: true,
            storage_path: None,
            request_timeout: Some(Duration::from_secs(30)),
            refresh_policy: RefreshPolicy::default(),
            writer_cookie_path: "/writer".to_string(),
            clock: unix_now,
        }
    }
}

impl ClientOptions {
    /// Set whether to automatically refresh the token
    pub fn with_auto_refresh_token(mut self, value: bool) -> Self {
        self.auto_refresh_token = value;
        self
    }

    /// Set whether to persist the session
    pub fn with_persist_session(mut self, value: bool) -> Self {
        self.persist_session = value;
        self
    }

    /// Set the session file
    pub fn with_storage_path(mut self, value: impl Into<PathBuf>) -> Self {
        self.storage_path = Some(value.into());
        self
    }

    /// Set the request timeout
    pub fn with_request_timeout(mut self, value: Option<Duration>) -> Self {
        self.request_timeout = value;
        self
    }

    pub fn with_refresh_policy(mut self, value: RefreshPolicy) -> Self {
        self.refresh_policy = value;
        self
    }

    pub fn with_writer_cookie_path(mut self, value: &str) -> Self {
        self.writer_cookie_path = value.to_string();
        self
    }

    pub fn with_clock(mut self, value: Clock) -> Self {
        self.clock = value;
        self
    }

    /// 環境変数から設定を読み込む
    ///
    /// Reads `TENDERDESK_STORAGE_PATH`, `TENDERDESK_REQUEST_TIMEOUT_SECS`,
    /// `TENDERDESK_AUTO_REFRESH` and `TENDERDESK_PERSIST_SESSION`. Unset or
    /// unparsable variables keep their defaults.
    pub fn from_env() -> Self {
        let mut options = Self::default();

        if let Ok(path) = env::var("TENDERDESK_STORAGE_PATH") {
            if !path.trim().is_empty() {
                options.storage_path = Some(PathBuf::from(path));
            }
        }
        if let Some(secs) = read_var::<u64>("TENDERDESK_REQUEST_TIMEOUT_SECS") {
            options.request_timeout = if secs == 0 {
                None
            } else {
                Some(Duration::from_secs(secs))
            };
        }
        if let Some(value) = read_flag("TENDERDESK_AUTO_REFRESH") {
            options.auto_refresh_token = value;
        }
        if let Some(value) = read_flag("TENDERDESK_PERSIST_SESSION") {
            options.persist_session = value;
        }

        options
    }

    /// Options for the session core of one domain.
    pub fn auth_options(&self) -> AuthOptions {
        AuthOptions::default()
            .with_auto_refresh_token(self.auto_refresh_token)
            .with_refresh_policy(self.refresh_policy)
            .with_clock(self.clock)
    }
}

fn read_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring unparsable {}={:?}", name, raw);
            None
        }
    }
}

fn read_flag(name: &str) -> Option<bool> {
    let raw = env::var(name).ok()?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            warn!("Ignoring unparsable {}={:?}", name, raw);
            None
        }
    }
}
