//! Reactive interceptor for outbound API calls
//!
//! Attaches the access credential to every request. An authorization
//! failure triggers one refresh and one replay of the request; a second
//! failure is final.

use std::sync::Arc;

use log::{debug, warn};
use reqwest::header::{HeaderValue, AUTHORIZATION, RETRY_AFTER};
use reqwest::{Client, Method, Request, RequestBuilder, Response, StatusCode};

use crate::context::SessionCore;
use crate::domain::join_url;
use crate::error::{extract_message, message_field, AuthError};
use crate::refresh::RefreshCoordinator;

/// Sends requests on behalf of one session domain.
#[derive(Clone)]
pub struct Interceptor {
    http: Client,
    base_url: String,
    core: Arc<SessionCore>,
    coordinator: Arc<RefreshCoordinator>,
}

impl Interceptor {
    pub(crate) fn new(
        http: Client,
        base_url: &str,
        core: Arc<SessionCore>,
        coordinator: Arc<RefreshCoordinator>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.to_string(),
            core,
            coordinator,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Absolute URL for an API path.
    pub fn url(&self, path: &str) -> String {
        join_url(&self.base_url, path)
    }

    pub fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http.request(method, self.url(path))
    }

    pub fn get(&self, path: &str) -> RequestBuilder {
        self.request(Method::GET, path)
    }

    pub fn post(&self, path: &str) -> RequestBuilder {
        self.request(Method::POST, path)
    }

    pub async fn send(&self, builder: RequestBuilder) -> Result<Response, AuthError> {
        let request = builder.build()?;
        self.execute(request).await
    }

    /// Send `request` with the current access credential.
    ///
    /// Responses below 400 are returned unchanged. A 401 is answered by at
    /// most one refresh-and-replay; 429 becomes [`AuthError::RateLimited`]
    /// without touching the session.
    pub async fn execute(&self, request: Request) -> Result<Response, AuthError> {
        let domain = self.core.domain.kind;
        let replay = request.try_clone();
        let path = request.url().path().to_string();

        let token = self.core.store.access_token()?;
        let response = self.dispatch(request, token.as_deref()).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return settle(response).await;
        }

        let replay = match replay {
            Some(replay) => replay,
            None => {
                warn!("{} request to {} cannot be replayed after 401", domain, path);
                return Err(unauthorized(response).await);
            }
        };

        debug!("{} request to {} unauthorized, refreshing", domain, path);
        let fresh = match self.coordinator.refresh_or_wait().await {
            Ok(Some(token)) => token,
            Ok(None) => {
                debug!("No fresh {} credential available, rejecting {}", domain, path);
                return Err(unauthorized(response).await);
            }
            Err(e) => {
                debug!("Refresh for {} failed: {}", path, e);
                return Err(AuthError::SessionExpired);
            }
        };

        let response = self.dispatch(replay, Some(&fresh)).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            warn!("{} request to {} still unauthorized after refresh", domain, path);
            return Err(unauthorized(response).await);
        }
        settle(response).await
    }

    async fn dispatch(&self, mut request: Request, token: Option<&str>) -> Result<Response, AuthError> {
        if let Some(token) = token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| AuthError::InvalidToken(e.to_string()))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }
        Ok(self.http.execute(request).await?)
    }
}

async fn settle(response: Response) -> Result<Response, AuthError> {
    let status = response.status();
    if status.as_u16() < 400 {
        return Ok(response);
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(rate_limited(response).await);
    }

    let text = response.text().await.unwrap_or_default();
    Err(AuthError::api(status, &text))
}

async fn unauthorized(response: Response) -> AuthError {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    AuthError::Unauthorized(extract_message(status, &text))
}

async fn rate_limited(response: Response) -> AuthError {
    let header = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());
    let text = response.text().await.unwrap_or_default();

    let from_body = serde_json::from_str::<serde_json::Value>(&text)
        .ok()
        .and_then(|body| body.get("retry_after").cloned())
        .and_then(|value| {
            value
                .as_u64()
                .or_else(|| value.as_f64().map(|f| f.ceil() as u64))
                .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
        });
    let retry_after = from_body.or(header);

    let message = message_field(&text).unwrap_or_else(|| match retry_after {
        Some(secs) => format!("Too many requests. Try again in {} seconds.", secs),
        None => "Too many requests. Try again later.".to_string(),
    });

    AuthError::RateLimited {
        retry_after,
        message,
    }
}
