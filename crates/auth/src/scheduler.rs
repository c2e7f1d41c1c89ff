//! Proactive refresh scheduling
//!
//! Given the expiration claim of the current access credential, decide
//! whether to refresh now, arm a timer, or leave it to the next load.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, warn};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::lock;

/// Largest delay a platform timer can represent (2^31 - 1 ms, ~24.8 days).
pub const MAX_TIMER_DELAY: Duration = Duration::from_millis(i32::MAX as u64);

/// Source of "now" in unix seconds.
pub type Clock = fn() -> i64;

/// Wall clock in unix seconds.
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Thresholds used to decide when a credential is refreshed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshPolicy {
    /// Credentials with this much life or less are refreshed immediately.
    pub immediate_threshold: Duration,
    /// How long before expiry the timer fires.
    pub lead_time: Duration,
    /// Credentials living longer than this are not tracked at all.
    pub tracking_window: Duration,
    /// Timers longer than this cannot be armed.
    pub max_timer_delay: Duration,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            immediate_threshold: Duration::from_secs(120),
            lead_time: Duration::from_secs(10 * 60),
            tracking_window: Duration::from_secs(7 * 24 * 60 * 60),
            max_timer_delay: MAX_TIMER_DELAY,
        }
    }
}

/// Why no timer was armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Remaining life exceeds the tracking window; the next load decides.
    BeyondTrackingWindow,
    /// The delay does not fit in a platform timer.
    ExceedsTimerLimit,
}

/// What the scheduler did with an expiration claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleDecision {
    RefreshNow,
    RefreshIn(Duration),
    Skip(SkipReason),
}

impl RefreshPolicy {
    pub fn decide(&self, now: i64, expires_at: i64) -> ScheduleDecision {
        let remaining = expires_at.saturating_sub(now);

        if remaining <= secs(self.immediate_threshold) {
            return ScheduleDecision::RefreshNow;
        }
        if remaining > secs(self.tracking_window) {
            return ScheduleDecision::Skip(SkipReason::BeyondTrackingWindow);
        }

        // Inside the lead time already: fire as soon as possible, never before exp - lead.
        let delay = Duration::from_secs(remaining.saturating_sub(secs(self.lead_time)).max(0) as u64);
        if delay > self.max_timer_delay {
            return ScheduleDecision::Skip(SkipReason::ExceedsTimerLimit);
        }
        ScheduleDecision::RefreshIn(delay)
    }
}

fn secs(d: Duration) -> i64 {
    i64::try_from(d.as_secs()).unwrap_or(i64::MAX)
}

struct ArmedTimer {
    id: u64,
    fires_at: i64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Slot {
    timer: Option<ArmedTimer>,
    /// Refresh spawned for a `RefreshNow` decision that may not have started yet.
    immediate: Option<JoinHandle<()>>,
}

impl Slot {
    /// Abort whatever is pending. Returns whether anything was.
    fn clear(&mut self) -> bool {
        let mut cleared = false;
        if let Some(timer) = self.timer.take() {
            debug!("Refresh timer #{} cancelled", timer.id);
            timer.handle.abort();
            cleared = true;
        }
        if let Some(handle) = self.immediate.take() {
            if !handle.is_finished() {
                debug!("Pending immediate refresh cancelled");
                handle.abort();
                cleared = true;
            }
        }
        cleared
    }
}

/// Owns the single refresh timer of one session domain.
pub struct RefreshScheduler {
    policy: RefreshPolicy,
    clock: Clock,
    next_id: AtomicU64,
    slot: Arc<Mutex<Slot>>,
}

impl RefreshScheduler {
    pub fn new(policy: RefreshPolicy, clock: Clock) -> Self {
        Self {
            policy,
            clock,
            next_id: AtomicU64::new(1),
            slot: Arc::new(Mutex::new(Slot::default())),
        }
    }

    pub fn policy(&self) -> &RefreshPolicy {
        &self.policy
    }

    pub fn now(&self) -> i64 {
        (self.clock)()
    }

    /// Decide without arming anything.
    pub fn decide(&self, expires_at: i64) -> ScheduleDecision {
        self.policy.decide(self.now(), expires_at)
    }

    /// Cancel anything pending, then act on the decision for `expires_at`.
    ///
    /// `RefreshNow` spawns `on_fire` right away, `RefreshIn` arms a timer,
    /// `Skip` leaves nothing armed.
    pub fn schedule<F, Fut>(&self, expires_at: i64, on_fire: F) -> ScheduleDecision
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let now = self.now();
        let decision = self.policy.decide(now, expires_at);

        let mut slot = lock(&self.slot);
        if slot.clear() {
            debug!("Replaced pending refresh before re-arming");
        }

        let runtime = match Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                warn!("No async runtime available, refresh not scheduled");
                return decision;
            }
        };

        match decision {
            ScheduleDecision::RefreshNow => {
                debug!("Credential expires at {}, refreshing immediately", expires_at);
                slot.immediate = Some(runtime.spawn(on_fire()));
            }
            ScheduleDecision::RefreshIn(delay) => {
                let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                let deadline = Instant::now() + delay;
                let timer_slot = Arc::clone(&self.slot);

                let handle = runtime.spawn(async move {
                    tokio::time::sleep_until(deadline).await;
                    {
                        let mut current = lock(&timer_slot);
                        match current.timer.as_ref() {
                            Some(timer) if timer.id == id => current.timer = None,
                            _ => return,
                        }
                    }
                    debug!("Refresh timer #{} fired", id);
                    on_fire().await;
                });

                let fires_at = now + delay.as_secs() as i64;
                debug!("Refresh timer #{} armed for {} ({}s)", id, fires_at, delay.as_secs());
                slot.timer = Some(ArmedTimer {
                    id,
                    fires_at,
                    handle,
                });
            }
            ScheduleDecision::Skip(reason) => {
                debug!(
                    "Credential expires at {}, no refresh scheduled ({:?})",
                    expires_at, reason
                );
            }
        }

        decision
    }

    /// Abort the armed timer and any immediate refresh not yet started.
    /// Returns whether anything was pending.
    pub fn cancel(&self) -> bool {
        lock(&self.slot).clear()
    }

    pub fn is_armed(&self) -> bool {
        lock(&self.slot)
            .timer
            .as_ref()
            .map(|timer| !timer.handle.is_finished())
            .unwrap_or(false)
    }

    /// Unix time the armed timer fires at.
    pub fn fires_at(&self) -> Option<i64> {
        lock(&self.slot).timer.as_ref().map(|timer| timer.fires_at)
    }
}

impl Drop for RefreshScheduler {
    fn drop(&mut self) {
        self.cancel();
    }
}
