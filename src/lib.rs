//! TenderDesk Client Library
//!
//! Keeps the client and writer sessions of the TenderDesk procurement
//! dashboard alive: restores them on start, refreshes credentials before
//! they expire and when the API rejects them, and signs the user out when
//! that is no longer possible.
//!
//! The session machinery lives in [`tenderdesk_auth`], re-exported here as
//! [`auth`]. This crate wires both domains to one HTTP client, one cookie
//! jar and one storage backend.

pub mod config;
pub mod error;
pub mod fetch;

pub use tenderdesk_auth as auth;

use std::fs;
use std::sync::Arc;

use log::{debug, info};
use reqwest::cookie::Jar;
use reqwest::Client;
use url::Url;

use crate::auth::{
    CookieMirror, DomainKind, FileBackend, MemoryBackend, SessionContext, SessionDomain,
    SessionState, SessionStore, StorageBackend,
};
use crate::config::ClientOptions;
use crate::error::Error;
use crate::fetch::Fetch;

/// The main entry point for the TenderDesk client
pub struct TenderDesk {
    /// The base URL of the dashboard API
    pub url: String,
    /// HTTP client shared by both domains
    pub http_client: Client,
    /// Client options
    pub options: ClientOptions,
    jar: Arc<Jar>,
    client: SessionContext,
    writer: SessionContext,
}

impl TenderDesk {
    /// Create a new TenderDesk client
    ///
    /// # Example
    ///
    /// ```
    /// use tenderdesk::TenderDesk;
    ///
    /// let desk = TenderDesk::new("https://api.tenderdesk.example").unwrap();
    /// assert!(desk.client().is_loading());
    /// ```
    pub fn new(url: &str) -> Result<Self, Error> {
        Self::new_with_options(url, ClientOptions::default())
    }

    /// Create a new TenderDesk client with custom options
    ///
    /// # Example
    ///
    /// ```
    /// use tenderdesk::{TenderDesk, config::ClientOptions};
    ///
    /// let options = ClientOptions::default().with_auto_refresh_token(false);
    /// let desk = TenderDesk::new_with_options("https://api.tenderdesk.example", options).unwrap();
    /// ```
    pub fn new_with_options(url: &str, options: ClientOptions) -> Result<Self, Error> {
        let base = Url::parse(url)?;
        let jar = Arc::new(Jar::default());

        let mut builder = Client::builder().cookie_provider(jar.clone());
        if let Some(timeout) = options.request_timeout {
            builder = builder.timeout(timeout);
        }
        let http_client = builder.build()?;

        let backend = open_backend(&options)?;
        let auth_options = options.auth_options();

        let client = SessionContext::new(
            url,
            SessionStore::new(SessionDomain::client(), backend.clone()),
            http_client.clone(),
            auth_options.clone(),
        );

        let writer_domain = SessionDomain::writer().with_cookie_path(&options.writer_cookie_path);
        let mut writer_store = SessionStore::new(writer_domain.clone(), backend);
        if let Some(cookie) = writer_domain.cookie {
            writer_store = writer_store.with_cookie_mirror(CookieMirror::new(
                jar.clone(),
                base,
                cookie,
                options.clock,
            ));
        }
        let writer = SessionContext::new(url, writer_store, http_client.clone(), auth_options);

        Ok(Self {
            url: url.to_string(),
            http_client,
            options,
            jar,
            client,
            writer,
        })
    }

    /// Session of procurement clients
    pub fn client(&self) -> &SessionContext {
        &self.client
    }

    /// Session of proposal writers
    pub fn writer(&self) -> &SessionContext {
        &self.writer
    }

    pub fn context(&self, kind: DomainKind) -> &SessionContext {
        match kind {
            DomainKind::Client => &self.client,
            DomainKind::Writer => &self.writer,
        }
    }

    /// Cookie jar holding the writer credential mirror.
    pub fn cookie_jar(&self) -> &Arc<Jar> {
        &self.jar
    }

    /// Restore both sessions from storage.
    pub async fn mount_all(&self) -> (SessionState, SessionState) {
        let (client, writer) = tokio::join!(self.client.mount(), self.writer.mount());
        info!(
            "Sessions restored (client: {}, writer: {})",
            client.is_authenticated(),
            writer.is_authenticated()
        );
        (client, writer)
    }

    /// Cancel both refresh timers.
    pub fn unmount_all(&self) {
        self.client.unmount();
        self.writer.unmount();
    }

    /// Build API requests for one domain.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use tenderdesk::{TenderDesk, auth::DomainKind};
    ///
    /// # async fn run() -> Result<(), tenderdesk::error::Error> {
    /// let desk = TenderDesk::new("https://api.tenderdesk.example")?;
    /// let drafts: serde_json::Value = desk
    ///     .fetch(DomainKind::Writer)
    ///     .get("/writer/drafts")
    ///     .query("status", "open")
    ///     .execute()
    ///     .await?;
    /// # let _ = drafts;
    /// # Ok(())
    /// # }
    /// ```
    pub fn fetch(&self, kind: DomainKind) -> Fetch<'_> {
        Fetch::new(self.context(kind).api())
    }
}

fn open_backend(options: &ClientOptions) -> Result<Arc<dyn StorageBackend>, Error> {
    match (&options.storage_path, options.persist_session) {
        (Some(path), true) => {
            // 保存先ディレクトリは起動時に用意する
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
            debug!("Persisting sessions to {}", path.display());
            Ok(Arc::new(FileBackend::open(path.clone())?))
        }
        _ => Ok(Arc::new(MemoryBackend::new())),
    }
}

/// A convenience module for common imports
pub mod prelude {
    pub use crate::auth::{DomainKind, SessionEvent, SessionState};
    pub use crate::config::ClientOptions;
    pub use crate::error::Error;
    pub use crate::TenderDesk;
}
