//! Session context
//!
//! Owns one session domain: its store, its refresh timer, its in-flight
//! guard and its state machine. Two contexts (client and writer) never
//! share any of these.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, error, info, warn};
use reqwest::Client;
use tokio::sync::{broadcast, watch};

use crate::claims::{decode_expiration, Expiration};
use crate::config::AuthOptions;
use crate::domain::{join_url, SessionDomain};
use crate::error::{extract_message, AuthError};
use crate::interceptor::Interceptor;
use crate::lock;
use crate::refresh::RefreshCoordinator;
use crate::scheduler::RefreshScheduler;
use crate::store::SessionStore;
use crate::types::{
    ChangePasswordRequest, CredentialPair, Identity, LoginCredentials, LoginResponse,
    SessionEvent, SessionState, TeardownReason,
};

const EVENT_CAPACITY: usize = 32;

/// State shared by the context, the coordinator and the interceptor.
pub(crate) struct SessionCore {
    pub(crate) domain: SessionDomain,
    pub(crate) store: SessionStore,
    pub(crate) scheduler: RefreshScheduler,
    pub(crate) options: AuthOptions,
    state: watch::Sender<SessionState>,
    events: broadcast::Sender<SessionEvent>,
    /// Bumped on every login and teardown; stale writers compare against it.
    generation: AtomicU64,
    write_lock: Mutex<()>,
}

impl SessionCore {
    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Run `f` under the write lock, only if no login or teardown happened
    /// since `generation`.
    pub(crate) fn if_current<R, F>(&self, generation: u64, f: F) -> Option<R>
    where
        F: FnOnce(&SessionCore) -> R,
    {
        let _guard = lock(&self.write_lock);
        if self.generation() != generation {
            return None;
        }
        Some(f(self))
    }

    /// Apply `write` only if no login or teardown happened since `generation`.
    pub(crate) fn commit_if_current<F>(&self, generation: u64, write: F) -> Result<bool, AuthError>
    where
        F: FnOnce(&SessionCore) -> Result<(), AuthError>,
    {
        match self.if_current(generation, write) {
            Some(result) => result.map(|_| true),
            None => Ok(false),
        }
    }

    /// Start a new generation and apply `write` in the same critical section.
    fn start_session<F>(&self, write: F) -> Result<u64, AuthError>
    where
        F: FnOnce(&SessionCore) -> Result<(), AuthError>,
    {
        let _guard = lock(&self.write_lock);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        write(self)?;
        Ok(generation)
    }

    /// Cancel the timer, clear storage and identity, and send the UI to login.
    pub(crate) fn teardown(&self, reason: TeardownReason) {
        self.end_session(None, reason);
    }

    /// Tear down only the session started as `generation`.
    pub(crate) fn teardown_if_current(&self, generation: u64, reason: TeardownReason) -> bool {
        self.end_session(Some(generation), reason)
    }

    fn end_session(&self, expected: Option<u64>, reason: TeardownReason) -> bool {
        {
            let _guard = lock(&self.write_lock);
            if expected.map_or(false, |generation| generation != self.generation()) {
                return false;
            }
            // Timers are only armed under the write lock, so none can appear after this.
            self.generation.fetch_add(1, Ordering::SeqCst);
            self.scheduler.cancel();
            if let Err(e) = self.store.clear() {
                error!("Failed to clear {} session storage: {}", self.domain.kind, e);
            }
            self.set_state(SessionState::Unauthenticated);
        }

        info!("{} session ended ({:?})", self.domain.kind, reason);
        self.emit(SessionEvent::SignedOut {
            domain: self.domain.kind,
            reason,
            redirect_to: self.domain.login_route.clone(),
        });
        true
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        self.state.send_replace(state);
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        // No receivers is fine: nobody is listening yet.
        if self.events.send(event).is_err() {
            debug!("No {} session event listeners", self.domain.kind);
        }
    }

    fn state_for(&self, identity: &Identity) -> SessionState {
        if self.domain.tracks_temporary_password && identity.is_password_temporary {
            SessionState::PasswordChangeRequired(identity.clone())
        } else {
            SessionState::Authenticated(identity.clone())
        }
    }
}

/// Session operations for one domain.
pub struct SessionContext {
    core: Arc<SessionCore>,
    coordinator: Arc<RefreshCoordinator>,
    interceptor: Interceptor,
    http: Client,
    base_url: String,
}

impl SessionContext {
    /// Create a context in the `Loading` state. Call [`mount`](Self::mount) next.
    pub fn new(base_url: &str, store: SessionStore, http_client: Client, options: AuthOptions) -> Self {
        let (state, _) = watch::channel(SessionState::Loading);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let core = Arc::new(SessionCore {
            domain: store.domain().clone(),
            scheduler: RefreshScheduler::new(options.refresh_policy, options.clock),
            store,
            options,
            state,
            events,
            generation: AtomicU64::new(0),
            write_lock: Mutex::new(()),
        });
        let coordinator = RefreshCoordinator::new(core.clone(), http_client.clone(), base_url);
        let interceptor = Interceptor::new(
            http_client.clone(),
            base_url,
            core.clone(),
            coordinator.clone(),
        );

        Self {
            core,
            coordinator,
            interceptor,
            http: http_client,
            base_url: base_url.to_string(),
        }
    }

    pub fn domain(&self) -> &SessionDomain {
        &self.core.domain
    }

    pub fn state(&self) -> SessionState {
        self.core.state.borrow().clone()
    }

    pub fn is_loading(&self) -> bool {
        matches!(*self.core.state.borrow(), SessionState::Loading)
    }

    pub fn current_user(&self) -> Option<Identity> {
        self.core.state.borrow().identity().cloned()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.core.state.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.core.events.subscribe()
    }

    /// Interceptor for this domain's API calls.
    pub fn api(&self) -> &Interceptor {
        &self.interceptor
    }

    pub fn store(&self) -> &SessionStore {
        &self.core.store
    }

    pub fn scheduler(&self) -> &RefreshScheduler {
        &self.core.scheduler
    }

    pub fn coordinator(&self) -> &Arc<RefreshCoordinator> {
        &self.coordinator
    }

    /// Restore the session from storage.
    ///
    /// An expired credential is refreshed first; otherwise the identity is
    /// fetched and the refresh timer armed. Loading always ends, even for a
    /// credential whose expiration cannot be read.
    pub async fn mount(&self) -> SessionState {
        let domain = self.core.domain.kind;
        self.core.set_state(SessionState::Loading);
        let generation = self.core.generation();

        let stored = match self.core.store.access_token() {
            Ok(token) => token,
            Err(e) => {
                warn!("Could not read stored {} credential: {}", domain, e);
                None
            }
        };

        if let Some(access) = stored {
            let now = self.core.scheduler.now();
            let expiration = decode_expiration(&access);
            let mut refreshed = false;

            match expiration {
                Expiration::At(exp) if expiration.is_expired(now) => {
                    info!("Stored {} credential expired at {}, refreshing", domain, exp);
                    match self.coordinator.refresh_or_wait().await {
                        Ok(Some(_)) => refreshed = true,
                        Ok(None) => debug!("{} credential could not be refreshed on load", domain),
                        Err(e) => debug!("{} refresh on load ended the session: {}", domain, e),
                    }
                }
                Expiration::At(_) => {}
                Expiration::Unknown => {
                    debug!("Stored {} credential expiration unreadable, treating as valid", domain);
                }
            }

            // The interceptor may have rotated the credential while the
            // identity loaded; arm from whatever is stored now.
            if self.core.generation() == generation
                && self.load_identity(generation).await.is_ok()
                && !refreshed
            {
                self.coordinator.arm_current(generation);
            }
        } else {
            debug!("No stored {} credential", domain);
        }

        self.core.state.send_if_modified(|state| {
            if matches!(state, SessionState::Loading) {
                *state = SessionState::Unauthenticated;
                true
            } else {
                false
            }
        });
        self.state()
    }

    async fn load_identity(&self, generation: u64) -> Result<Identity, AuthError> {
        let fetched = match self.fetch_identity().await {
            Ok(identity) => identity,
            Err(e) => {
                warn!("Failed to load {} identity: {}", self.core.domain.kind, e);
                self.core
                    .teardown_if_current(generation, TeardownReason::IdentityRejected);
                return Err(e);
            }
        };

        let stored_temporary = self.core.store.password_temporary().unwrap_or(false);
        let identity = Identity {
            is_password_temporary: self.core.domain.tracks_temporary_password
                && (fetched.is_password_temporary || stored_temporary),
            ..fetched
        };

        let committed = self.core.commit_if_current(generation, |core| {
            core.store.set_identity(&identity)?;
            core.set_state(core.state_for(&identity));
            Ok(())
        })?;
        if !committed {
            debug!("{} session changed while loading identity", self.core.domain.kind);
        }
        Ok(identity)
    }

    /// Fetch the identity of the signed-in account from the server.
    pub async fn fetch_identity(&self) -> Result<Identity, AuthError> {
        let profile = self.core.domain.endpoints.profile.clone();
        let response = self.interceptor.send(self.interceptor.get(&profile)).await?;
        Ok(response.json::<Identity>().await?)
    }

    /// メール・パスワードでログイン
    pub async fn login(&self, email: &str, password: &str) -> Result<SessionState, AuthError> {
        let domain = self.core.domain.kind;
        let url = join_url(&self.base_url, &self.core.domain.endpoints.login);
        let credentials = LoginCredentials {
            email: email.to_string(),
            password: password.to_string(),
        };

        let response = self.http.post(&url).json(&credentials).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            warn!("{} login rejected with status {}", domain, status);
            return Err(AuthError::LoginFailed(extract_message(status, &text)));
        }

        let body: LoginResponse = response.json().await?;
        if !body.token_type.eq_ignore_ascii_case("bearer") {
            warn!("Unexpected {} token type {:?}", domain, body.token_type);
        }

        let identity = Identity {
            email: email.to_string(),
            account_id: body.client_id,
            is_password_temporary: self.core.domain.tracks_temporary_password
                && body.is_password_temporary,
        };
        let pair = CredentialPair {
            access: body.access_token,
            refresh: body.refresh_token,
        };
        let state = self.core.state_for(&identity);

        let generation = self.core.start_session(|core| {
            core.store.begin(&pair, &identity)?;
            core.set_state(state.clone());
            Ok(())
        })?;
        self.coordinator.arm(generation, &pair.access);

        info!("{} session started", domain);
        self.core.emit(SessionEvent::SignedIn { domain });
        if matches!(state, SessionState::PasswordChangeRequired(_)) {
            self.core.emit(SessionEvent::PasswordChangeRequired { domain });
        }
        Ok(state)
    }

    /// サインアウト
    pub fn logout(&self) {
        self.core.teardown(TeardownReason::Logout);
    }

    /// Change the password; clears the temporary-password requirement.
    pub async fn change_password(&self, old_password: &str, new_password: &str) -> Result<(), AuthError> {
        if self.core.store.access_token()?.is_none() {
            return Err(AuthError::MissingSession);
        }
        let generation = self.core.generation();

        let request = ChangePasswordRequest {
            old_password: old_password.to_string(),
            new_password: new_password.to_string(),
        };
        let path = self.core.domain.endpoints.change_password.clone();
        if let Err(e) = self
            .interceptor
            .send(self.interceptor.post(&path).json(&request))
            .await
        {
            warn!("{} password change failed: {}", self.core.domain.kind, e);
            return Err(e);
        }

        let identity = match self.current_user() {
            Some(identity) => Some(identity),
            None => self.core.store.identity()?,
        };
        self.core.commit_if_current(generation, |core| {
            core.store.set_password_temporary(false)?;
            if let Some(mut identity) = identity {
                identity.is_password_temporary = false;
                core.store.set_identity(&identity)?;
                core.set_state(SessionState::Authenticated(identity));
            }
            Ok(())
        })?;

        info!("{} password changed", self.core.domain.kind);
        Ok(())
    }

    /// Cancel the refresh timer; the owning view is going away.
    pub fn unmount(&self) {
        if self.core.scheduler.cancel() {
            debug!("{} refresh timer cancelled on unmount", self.core.domain.kind);
        }
    }
}

impl Drop for SessionContext {
    fn drop(&mut self) {
        self.core.scheduler.cancel();
    }
}
