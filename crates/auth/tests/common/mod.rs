#![allow(dead_code)]

use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use reqwest::cookie::Jar;
use tenderdesk_auth::{
    AuthOptions, CookieMirror, CredentialPair, MemoryBackend, SessionContext, SessionDomain,
    SessionEvent, SessionStore, StorageBackend,
};
use tokio::sync::broadcast;
use url::Url;
use wiremock::MockServer;

pub const NOW: i64 = 1_750_000_000;
pub const DAY: i64 = 86_400;

pub fn fixed_now() -> i64 {
    NOW
}

/// Unsigned three-segment token carrying `exp`.
pub fn token(exp: i64) -> String {
    format!(
        "{}.{}.signature",
        URL_SAFE_NO_PAD.encode(r#"{"alg":"HS256","typ":"JWT"}"#),
        URL_SAFE_NO_PAD.encode(format!(r#"{{"sub":"user","exp":{}}}"#, exp))
    )
}

pub fn bearer(token: &str) -> String {
    format!("Bearer {}", token)
}

pub fn options() -> AuthOptions {
    AuthOptions::default().with_clock(fixed_now)
}

pub fn session(server: &MockServer, domain: SessionDomain, backend: Arc<dyn StorageBackend>) -> SessionContext {
    let store = SessionStore::new(domain, backend);
    SessionContext::new(&server.uri(), store, reqwest::Client::new(), options())
}

pub fn client_session(server: &MockServer) -> (SessionContext, Arc<MemoryBackend>) {
    let backend = Arc::new(MemoryBackend::new());
    (
        session(server, SessionDomain::client(), backend.clone()),
        backend,
    )
}

/// Writer session whose access credential is mirrored into `jar`.
pub fn writer_session(server: &MockServer, jar: Arc<Jar>) -> SessionContext {
    let domain = SessionDomain::writer();
    let mirror = CookieMirror::new(
        jar.clone(),
        Url::parse(&server.uri()).unwrap(),
        domain.cookie.clone().unwrap(),
        fixed_now,
    );
    let store = SessionStore::new(domain, Arc::new(MemoryBackend::new())).with_cookie_mirror(mirror);
    let http = reqwest::Client::builder()
        .cookie_provider(jar)
        .build()
        .unwrap();
    SessionContext::new(&server.uri(), store, http, options())
}

pub fn seed(session: &SessionContext, access: &str, refresh: &str) {
    session
        .store()
        .set_credentials(&CredentialPair {
            access: access.to_string(),
            refresh: refresh.to_string(),
        })
        .unwrap();
}

/// Drain events received so far.
pub fn drain(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
