//! TenderDesk session core
//!
//! This crate keeps an authentication session alive for the TenderDesk
//! dashboard: it reads the expiration claim of the access credential,
//! schedules proactive refresh, refreshes reactively when an API call is
//! rejected, and tears the session down when refresh is no longer possible.
//!
//! Client and writer users are two [`SessionDomain`]s of the same
//! implementation; each gets its own [`SessionContext`] with its own storage
//! namespace, timer and in-flight guard.
//!
//! ```no_run
//! use std::sync::Arc;
//! use tenderdesk_auth::{AuthOptions, MemoryBackend, SessionContext, SessionDomain, SessionStore};
//!
//! # async fn run() -> Result<(), tenderdesk_auth::AuthError> {
//! let store = SessionStore::new(SessionDomain::client(), Arc::new(MemoryBackend::new()));
//! let session = SessionContext::new(
//!     "https://api.example.com",
//!     store,
//!     reqwest::Client::new(),
//!     AuthOptions::default(),
//! );
//!
//! session.mount().await;
//! session.login("buyer@example.com", "password123").await?;
//! let profile = session.api().send(session.api().get("/profile/me")).await?;
//! # let _ = profile;
//! session.logout();
//! # Ok(())
//! # }
//! ```

pub mod claims;
pub mod config;
pub mod context;
pub mod domain;
pub mod error;
pub mod interceptor;
pub mod refresh;
pub mod scheduler;
pub mod store;
pub mod types;

use std::sync::{Mutex, MutexGuard};

pub use claims::{decode_expiration, Expiration};
pub use config::AuthOptions;
pub use context::SessionContext;
pub use domain::{CookieSettings, DomainKind, Endpoints, SessionDomain};
pub use error::AuthError;
pub use interceptor::Interceptor;
pub use refresh::{RefreshCoordinator, RefreshOutcome};
pub use scheduler::{
    unix_now, Clock, RefreshPolicy, RefreshScheduler, ScheduleDecision, SkipReason,
    MAX_TIMER_DELAY,
};
pub use store::{CookieMirror, FileBackend, MemoryBackend, SessionStore, StorageBackend};
pub use types::{
    CredentialPair, Identity, LoginResponse, SessionEvent, SessionState, TeardownReason,
};

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
