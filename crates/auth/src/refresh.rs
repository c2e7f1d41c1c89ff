//! Refresh coordination
//!
//! Exchanges the refresh credential for a new access credential. At most one
//! exchange runs per domain; the guard is taken synchronously before the
//! first await, so the scheduler, the interceptor and the load path can all
//! race for it safely.

use std::sync::Arc;

use log::{debug, info, warn};
use reqwest::Client;
use tokio::sync::watch;

use crate::claims::{decode_expiration, Expiration};
use crate::context::SessionCore;
use crate::domain::join_url;
use crate::error::{extract_message, AuthError};
use crate::scheduler::ScheduleDecision;
use crate::types::{RefreshResponse, SessionEvent, TeardownReason};

/// Result of a refresh attempt that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    Refreshed { access_token: String },
    /// Another refresh was already in flight.
    Skipped,
    /// Nothing to refresh with; the caller keeps its current credential.
    NoRefreshToken,
    /// The session ended while the exchange was running; result dropped.
    Discarded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Settled {
    Refreshed(String),
    NoRefreshToken,
    Discarded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum RefreshPhase {
    Idle,
    InFlight,
    Finished(Settled),
}

/// Releases the in-flight flag even if the exchange task panics.
struct InFlight {
    coordinator: Arc<RefreshCoordinator>,
    settled: Settled,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let settled = std::mem::replace(&mut self.settled, Settled::Failed);
        self.coordinator
            .phase
            .send_replace(RefreshPhase::Finished(settled));
    }
}

/// Runs credential refreshes for one session domain.
pub struct RefreshCoordinator {
    core: Arc<SessionCore>,
    http: Client,
    base_url: String,
    phase: watch::Sender<RefreshPhase>,
}

impl RefreshCoordinator {
    pub(crate) fn new(core: Arc<SessionCore>, http: Client, base_url: &str) -> Arc<Self> {
        let (phase, _) = watch::channel(RefreshPhase::Idle);
        Arc::new(Self {
            core,
            http,
            base_url: base_url.to_string(),
            phase,
        })
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(*self.phase.borrow(), RefreshPhase::InFlight)
    }

    fn try_begin(&self) -> bool {
        self.phase.send_if_modified(|phase| {
            if matches!(phase, RefreshPhase::InFlight) {
                false
            } else {
                *phase = RefreshPhase::InFlight;
                true
            }
        })
    }

    /// Refresh now, unless a refresh is already in flight.
    ///
    /// On failure the session has already been torn down when this returns.
    pub async fn refresh(self: &Arc<Self>) -> Result<RefreshOutcome, AuthError> {
        if !self.try_begin() {
            debug!(
                "{} refresh already in flight, skipping",
                self.core.domain.kind
            );
            return Ok(RefreshOutcome::Skipped);
        }
        self.run().await
    }

    /// Refresh, or wait for the refresh already in flight.
    ///
    /// Returns the access credential the refresh produced, if any.
    pub async fn refresh_or_wait(self: &Arc<Self>) -> Result<Option<String>, AuthError> {
        let outcome = if self.try_begin() {
            self.run().await?
        } else {
            self.wait().await?
        };

        match outcome {
            RefreshOutcome::Refreshed { access_token } => Ok(Some(access_token)),
            _ => Ok(None),
        }
    }

    async fn wait(&self) -> Result<RefreshOutcome, AuthError> {
        debug!(
            "Waiting for in-flight {} refresh",
            self.core.domain.kind
        );
        let mut rx = self.phase.subscribe();
        let phase = rx
            .wait_for(|phase| !matches!(phase, RefreshPhase::InFlight))
            .await
            .map_err(|e| AuthError::Internal(e.to_string()))?
            .clone();

        match phase {
            RefreshPhase::Finished(Settled::Refreshed(access_token)) => {
                Ok(RefreshOutcome::Refreshed { access_token })
            }
            RefreshPhase::Finished(Settled::Discarded) => Ok(RefreshOutcome::Discarded),
            RefreshPhase::Finished(Settled::Failed) => Err(AuthError::SessionExpired),
            RefreshPhase::Finished(Settled::NoRefreshToken) | RefreshPhase::Idle => {
                Ok(RefreshOutcome::NoRefreshToken)
            }
            RefreshPhase::InFlight => Ok(RefreshOutcome::Skipped),
        }
    }

    /// Run the exchange on its own task so it completes even if the caller
    /// goes away.
    async fn run(self: &Arc<Self>) -> Result<RefreshOutcome, AuthError> {
        let mut guard = InFlight {
            coordinator: Arc::clone(self),
            settled: Settled::Failed,
        };
        let this = Arc::clone(self);

        let task = tokio::spawn(async move {
            let result = this.exchange().await;
            guard.settled = match &result {
                Ok(RefreshOutcome::Refreshed { access_token }) => {
                    Settled::Refreshed(access_token.clone())
                }
                Ok(RefreshOutcome::NoRefreshToken) => Settled::NoRefreshToken,
                Ok(RefreshOutcome::Discarded) => Settled::Discarded,
                Ok(RefreshOutcome::Skipped) | Err(_) => Settled::Failed,
            };
            drop(guard);
            result
        });

        task.await
            .map_err(|e| AuthError::Internal(format!("refresh task failed: {}", e)))?
    }

    async fn exchange(self: &Arc<Self>) -> Result<RefreshOutcome, AuthError> {
        let domain = self.core.domain.kind;
        let generation = self.core.generation();

        let refresh_token = match self.core.store.refresh_token() {
            Ok(Some(token)) => token,
            Ok(None) => {
                debug!("No {} refresh credential stored, cannot refresh", domain);
                return Ok(RefreshOutcome::NoRefreshToken);
            }
            Err(e) => return Err(self.fail(generation, e)),
        };

        let url = join_url(&self.base_url, &self.core.domain.endpoints.refresh);
        debug!("Refreshing {} access credential", domain);

        let response = match self.http.post(&url).bearer_auth(&refresh_token).send().await {
            Ok(response) => response,
            Err(e) => return Err(self.fail(generation, e.into())),
        };

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(self.fail(
                generation,
                AuthError::RefreshRejected {
                    status: status.as_u16(),
                    message: extract_message(status, &text),
                },
            ));
        }

        let body: RefreshResponse = match response.json().await {
            Ok(body) => body,
            Err(e) => return Err(self.fail(generation, e.into())),
        };

        // Store and re-arm under one lock; teardown cannot land in between.
        let committed = self.core.commit_if_current(generation, |core| {
            core.store
                .replace_access(&body.access_token, body.refresh_token.as_deref())?;
            self.rearm_after_refresh(&body.access_token);
            Ok(())
        });
        match committed {
            Ok(true) => {}
            Ok(false) => {
                info!(
                    "Discarding {} refresh that completed after the session ended",
                    domain
                );
                return Ok(RefreshOutcome::Discarded);
            }
            Err(e) => return Err(self.fail(generation, e)),
        }

        info!("{} access credential refreshed", domain);
        self.core.emit(SessionEvent::TokenRefreshed { domain });

        Ok(RefreshOutcome::Refreshed {
            access_token: body.access_token,
        })
    }

    /// Tear the session down, unless it already changed under us.
    fn fail(&self, generation: u64, error: AuthError) -> AuthError {
        if self
            .core
            .teardown_if_current(generation, TeardownReason::RefreshFailed)
        {
            warn!(
                "{} refresh failed, session ended: {}",
                self.core.domain.kind, error
            );
        } else {
            debug!("Ignoring failure of a stale refresh: {}", error);
        }
        error
    }

    /// Arm the proactive timer from `access_token`, unless the session
    /// changed since `generation`.
    pub(crate) fn arm(self: &Arc<Self>, generation: u64, access_token: &str) -> Option<ScheduleDecision> {
        self.core
            .if_current(generation, |_| self.schedule_from(access_token))
            .flatten()
    }

    /// Arm the proactive timer from the credential stored right now.
    pub(crate) fn arm_current(self: &Arc<Self>, generation: u64) -> Option<ScheduleDecision> {
        self.core
            .if_current(generation, |core| match core.store.access_token() {
                Ok(Some(access)) => self.schedule_from(&access),
                Ok(None) => None,
                Err(e) => {
                    warn!("Could not read {} credential to arm refresh: {}", core.domain.kind, e);
                    None
                }
            })
            .flatten()
    }

    /// Act on the expiration claim of `access_token`. Callers hold the
    /// session write lock.
    fn schedule_from(self: &Arc<Self>, access_token: &str) -> Option<ScheduleDecision> {
        if !self.core.options.auto_refresh_token {
            return None;
        }

        match decode_expiration(access_token) {
            Expiration::At(expires_at) => {
                let weak = Arc::downgrade(self);
                let decision = self.core.scheduler.schedule(expires_at, move || async move {
                    if let Some(coordinator) = weak.upgrade() {
                        if let Err(e) = coordinator.refresh().await {
                            debug!("Scheduled refresh ended the session: {}", e);
                        }
                    }
                });
                Some(decision)
            }
            Expiration::Unknown => {
                debug!(
                    "{} credential has no readable expiration, relying on reactive refresh",
                    self.core.domain.kind
                );
                self.core.scheduler.cancel();
                None
            }
        }
    }

    fn rearm_after_refresh(self: &Arc<Self>, access_token: &str) {
        if let Expiration::At(expires_at) = decode_expiration(access_token) {
            if self.core.scheduler.decide(expires_at) == ScheduleDecision::RefreshNow {
                warn!(
                    "Fresh {} credential is already due for refresh, not scheduling another",
                    self.core.domain.kind
                );
                self.core.scheduler.cancel();
                return;
            }
        }
        self.schedule_from(access_token);
    }
}
