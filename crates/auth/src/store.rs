//! Durable session storage
//!
//! A [`StorageBackend`] is a small synchronous key-value store. A
//! [`SessionStore`] scopes it to one session domain, so client and writer
//! keys never collide, and optionally mirrors the access credential into a
//! cookie for server-side route guarding.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use log::{debug, warn};
use reqwest::cookie::Jar;
use url::Url;

use crate::claims::{decode_expiration, Expiration};
use crate::domain::{CookieSettings, SessionDomain};
use crate::error::AuthError;
use crate::types::{CredentialPair, Identity};
use crate::{lock, scheduler::Clock};

const ACCESS_TOKEN: &str = "access_token";
const REFRESH_TOKEN: &str = "refresh_token";
const IDENTITY: &str = "identity";
const PASSWORD_TEMPORARY: &str = "password_temporary";

/// Synchronous key-value persistence.
///
/// `set_many` and `remove_many` must apply all entries or none.
pub trait StorageBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, AuthError>;
    fn set_many(&self, entries: &[(String, String)]) -> Result<(), AuthError>;
    fn remove_many(&self, keys: &[String]) -> Result<(), AuthError>;
}

/// In-process backend; does not survive a restart.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StorageBackend for MemoryBackend {
    fn get(&self, key: &str) -> Result<Option<String>, AuthError> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        Ok(entries.get(key).cloned())
    }

    fn set_many(&self, entries: &[(String, String)]) -> Result<(), AuthError> {
        let mut map = self.entries.write().unwrap_or_else(|e| e.into_inner());
        for (key, value) in entries {
            map.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    fn remove_many(&self, keys: &[String]) -> Result<(), AuthError> {
        let mut map = self.entries.write().unwrap_or_else(|e| e.into_inner());
        for key in keys {
            map.remove(key);
        }
        Ok(())
    }
}

/// JSON file backend that survives restarts.
///
/// Every mutation rewrites the file through a temporary sibling and a
/// rename, so readers never see a half-written map.
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    entries: Mutex<HashMap<String, String>>,
}

impl FileBackend {
    /// Open (or lazily create) the store at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, AuthError> {
        let path = path.into();
        let entries = match fs::read_to_string(&path) {
            Ok(text) if text.trim().is_empty() => HashMap::new(),
            Ok(text) => serde_json::from_str(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                return Err(AuthError::Storage(format!(
                    "Failed to read {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        debug!("Opened session file {} ({} keys)", path.display(), entries.len());

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, entries: &HashMap<String, String>) -> Result<(), AuthError> {
        let storage_err =
            |e: std::io::Error| AuthError::Storage(format!("{}: {}", self.path.display(), e));

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(storage_err)?;
            }
        }

        let tmp = self.path.with_extension("tmp");
        let json = serde_json::to_vec_pretty(entries)?;
        {
            let mut file = fs::File::create(&tmp).map_err(storage_err)?;
            file.write_all(&json).map_err(storage_err)?;
            file.sync_all().map_err(storage_err)?;
        }
        fs::rename(&tmp, &self.path).map_err(storage_err)
    }
}

impl StorageBackend for FileBackend {
    fn get(&self, key: &str) -> Result<Option<String>, AuthError> {
        Ok(lock(&self.entries).get(key).cloned())
    }

    fn set_many(&self, entries: &[(String, String)]) -> Result<(), AuthError> {
        let mut map = lock(&self.entries);
        let mut next = map.clone();
        for (key, value) in entries {
            next.insert(key.clone(), value.clone());
        }
        self.persist(&next)?;
        *map = next;
        Ok(())
    }

    fn remove_many(&self, keys: &[String]) -> Result<(), AuthError> {
        let mut map = lock(&self.entries);
        let mut next = map.clone();
        for key in keys {
            next.remove(key);
        }
        self.persist(&next)?;
        *map = next;
        Ok(())
    }
}

/// Mirrors the access credential into a short-lived, path-scoped cookie.
#[derive(Clone)]
pub struct CookieMirror {
    jar: Arc<Jar>,
    url: Url,
    settings: CookieSettings,
    clock: Clock,
}

impl CookieMirror {
    /// Fallback cookie lifetime when the credential has no usable `exp`.
    pub const DEFAULT_MAX_AGE: i64 = 60 * 60;

    pub fn new(jar: Arc<Jar>, url: Url, settings: CookieSettings, clock: Clock) -> Self {
        Self {
            jar,
            url,
            settings,
            clock,
        }
    }

    pub fn jar(&self) -> &Arc<Jar> {
        &self.jar
    }

    pub fn settings(&self) -> &CookieSettings {
        &self.settings
    }

    pub fn mirror(&self, access_token: &str) {
        let max_age = match decode_expiration(access_token) {
            Expiration::At(exp) => (exp - (self.clock)()).max(0),
            Expiration::Unknown => Self::DEFAULT_MAX_AGE,
        };
        self.write(access_token, max_age);
    }

    pub fn clear(&self) {
        self.write("", 0);
    }

    fn write(&self, value: &str, max_age: i64) {
        let cookie = format!(
            "{}={}; Path={}; Max-Age={}; SameSite=Strict",
            self.settings.name, value, self.settings.path, max_age
        );
        self.jar.add_cookie_str(&cookie, &self.url);
    }
}

/// Session persistence scoped to one domain.
#[derive(Clone)]
pub struct SessionStore {
    domain: SessionDomain,
    backend: Arc<dyn StorageBackend>,
    cookie: Option<CookieMirror>,
}

impl SessionStore {
    pub fn new(domain: SessionDomain, backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            domain,
            backend,
            cookie: None,
        }
    }

    pub fn with_cookie_mirror(mut self, mirror: CookieMirror) -> Self {
        self.cookie = Some(mirror);
        self
    }

    pub fn domain(&self) -> &SessionDomain {
        &self.domain
    }

    pub fn cookie_mirror(&self) -> Option<&CookieMirror> {
        self.cookie.as_ref()
    }

    fn key(&self, name: &str) -> String {
        self.domain.key(name)
    }

    pub fn set_credentials(&self, pair: &CredentialPair) -> Result<(), AuthError> {
        self.backend.set_many(&[
            (self.key(ACCESS_TOKEN), pair.access.clone()),
            (self.key(REFRESH_TOKEN), pair.refresh.clone()),
        ])?;
        self.mirror(&pair.access);
        Ok(())
    }

    /// Both credentials, or `None` if either is missing.
    pub fn credentials(&self) -> Result<Option<CredentialPair>, AuthError> {
        match (self.access_token()?, self.refresh_token()?) {
            (Some(access), Some(refresh)) => Ok(Some(CredentialPair { access, refresh })),
            _ => Ok(None),
        }
    }

    pub fn access_token(&self) -> Result<Option<String>, AuthError> {
        self.backend.get(&self.key(ACCESS_TOKEN))
    }

    pub fn refresh_token(&self) -> Result<Option<String>, AuthError> {
        self.backend.get(&self.key(REFRESH_TOKEN))
    }

    /// Replace the access credential, and the refresh credential if rotated.
    pub fn replace_access(&self, access: &str, refresh: Option<&str>) -> Result<(), AuthError> {
        let mut entries = vec![(self.key(ACCESS_TOKEN), access.to_string())];
        if let Some(refresh) = refresh {
            entries.push((self.key(REFRESH_TOKEN), refresh.to_string()));
        }
        self.backend.set_many(&entries)?;
        self.mirror(access);
        Ok(())
    }

    pub fn set_identity(&self, identity: &Identity) -> Result<(), AuthError> {
        let json = serde_json::to_string(identity)?;
        self.backend.set_many(&[(self.key(IDENTITY), json)])
    }

    /// Last identity snapshot; stale until re-fetched from the server.
    pub fn identity(&self) -> Result<Option<Identity>, AuthError> {
        match self.backend.get(&self.key(IDENTITY))? {
            Some(json) => match serde_json::from_str(&json) {
                Ok(identity) => Ok(Some(identity)),
                Err(e) => {
                    warn!("Discarding unreadable {} identity snapshot: {}", self.domain.kind, e);
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    pub fn set_password_temporary(&self, temporary: bool) -> Result<(), AuthError> {
        self.backend
            .set_many(&[(self.key(PASSWORD_TEMPORARY), temporary.to_string())])
    }

    pub fn password_temporary(&self) -> Result<bool, AuthError> {
        Ok(self
            .backend
            .get(&self.key(PASSWORD_TEMPORARY))?
            .map(|v| v == "true")
            .unwrap_or(false))
    }

    /// Store a whole new session in one write.
    pub(crate) fn begin(&self, pair: &CredentialPair, identity: &Identity) -> Result<(), AuthError> {
        let identity_json = serde_json::to_string(identity)?;
        self.backend.set_many(&[
            (self.key(ACCESS_TOKEN), pair.access.clone()),
            (self.key(REFRESH_TOKEN), pair.refresh.clone()),
            (self.key(IDENTITY), identity_json),
            (
                self.key(PASSWORD_TEMPORARY),
                identity.is_password_temporary.to_string(),
            ),
        ])?;
        self.mirror(&pair.access);
        Ok(())
    }

    /// Remove every key of this domain in one operation.
    pub fn clear(&self) -> Result<(), AuthError> {
        let keys: Vec<String> = [ACCESS_TOKEN, REFRESH_TOKEN, IDENTITY, PASSWORD_TEMPORARY]
            .iter()
            .map(|name| self.key(name))
            .collect();
        let result = self.backend.remove_many(&keys);
        if let Some(cookie) = &self.cookie {
            cookie.clear();
        }
        result
    }

    fn mirror(&self, access: &str) {
        if let Some(cookie) = &self.cookie {
            cookie.mirror(access);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::cookie::CookieStore;

    fn pair(access: &str, refresh: &str) -> CredentialPair {
        CredentialPair {
            access: access.to_string(),
            refresh: refresh.to_string(),
        }
    }

    fn identity() -> Identity {
        Identity {
            email: "buyer@example.com".to_string(),
            account_id: Some("c-1".to_string()),
            is_password_temporary: true,
        }
    }

    #[test]
    fn test_domains_never_share_keys() {
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let client = SessionStore::new(SessionDomain::client(), backend.clone());
        let writer = SessionStore::new(SessionDomain::writer(), backend.clone());

        client.set_credentials(&pair("client-a", "client-r")).unwrap();
        assert_eq!(writer.credentials().unwrap(), None);

        writer.set_credentials(&pair("writer-a", "writer-r")).unwrap();
        client.clear().unwrap();

        assert_eq!(client.credentials().unwrap(), None);
        assert_eq!(
            writer.credentials().unwrap(),
            Some(pair("writer-a", "writer-r"))
        );
    }

    #[test]
    fn test_clear_removes_everything() {
        let backend = Arc::new(MemoryBackend::new());
        let store = SessionStore::new(SessionDomain::client(), backend.clone());

        store.begin(&pair("a", "r"), &identity()).unwrap();
        assert!(store.password_temporary().unwrap());
        assert_eq!(store.identity().unwrap(), Some(identity()));

        store.clear().unwrap();
        assert!(backend.is_empty());
        assert_eq!(store.access_token().unwrap(), None);
        assert_eq!(store.refresh_token().unwrap(), None);
        assert!(!store.password_temporary().unwrap());
    }

    #[test]
    fn test_replace_access_keeps_refresh() {
        let store = SessionStore::new(SessionDomain::client(), Arc::new(MemoryBackend::new()));
        store.set_credentials(&pair("a1", "r1")).unwrap();

        store.replace_access("a2", None).unwrap();
        assert_eq!(store.credentials().unwrap(), Some(pair("a2", "r1")));

        store.replace_access("a3", Some("r2")).unwrap();
        assert_eq!(store.credentials().unwrap(), Some(pair("a3", "r2")));
    }

    #[test]
    fn test_file_backend_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");

        {
            let backend = Arc::new(FileBackend::open(&path).unwrap());
            let store = SessionStore::new(SessionDomain::writer(), backend);
            store.set_credentials(&pair("a", "r")).unwrap();
        }

        let backend = Arc::new(FileBackend::open(&path).unwrap());
        let store = SessionStore::new(SessionDomain::writer(), backend);
        assert_eq!(store.credentials().unwrap(), Some(pair("a", "r")));

        store.clear().unwrap();
        let reopened = FileBackend::open(&path).unwrap();
        assert_eq!(reopened.get("writer_access_token").unwrap(), None);
    }

    #[test]
    fn test_cookie_mirror_is_path_scoped() {
        fn now() -> i64 {
            1_750_000_000
        }

        let jar = Arc::new(Jar::default());
        let base = Url::parse("https://app.example.com").unwrap();
        let domain = SessionDomain::writer();
        let mirror = CookieMirror::new(
            jar.clone(),
            base,
            domain.cookie.clone().unwrap(),
            now,
        );
        let store = SessionStore::new(domain, Arc::new(MemoryBackend::new()))
            .with_cookie_mirror(mirror);

        store.set_credentials(&pair("opaque-writer-token", "r")).unwrap();

        let inside = Url::parse("https://app.example.com/writer/dashboard").unwrap();
        let outside = Url::parse("https://app.example.com/opportunities").unwrap();
        let header = jar.cookies(&inside).expect("cookie under /writer");
        assert_eq!(
            header.to_str().unwrap(),
            "writer_access_token=opaque-writer-token"
        );
        assert!(jar.cookies(&outside).is_none());
    }
}
