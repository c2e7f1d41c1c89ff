//! Options for a session domain

use crate::scheduler::{unix_now, Clock, RefreshPolicy};

/// クライアントオプション
#[derive(Debug, Clone)]
pub struct AuthOptions {
    /// Arm the proactive refresh timer after login, load and refresh.
    pub auto_refresh_token: bool,
    pub refresh_policy: RefreshPolicy,
    /// Unix-seconds clock used for expiry decisions.
    pub clock: Clock,
}

impl Default for AuthOptions {
    fn default() -> Self {
        Self {
            auto_refresh_token: true,
            refresh_policy: RefreshPolicy::default(),
            clock: unix_now,
        }
    }
}

impl AuthOptions {
    pub fn with_auto_refresh_token(mut self, value: bool) -> Self {
        self.auto_refresh_token = value;
        self
    }

    pub fn with_refresh_policy(mut self, value: RefreshPolicy) -> Self {
        self.refresh_policy = value;
        self
    }

    pub fn with_clock(mut self, value: Clock) -> Self {
        self.clock = value;
        self
    }
}
