// File: src/scheduler.rs
// Timer deadlines owned by the sync actor, plus the wall clock they are derived from.
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::time::Instant;

/// Maps wall-clock timestamps onto tokio instants.
///
/// Anchored once per session. Under a paused tokio clock the mapping is exact,
/// which keeps renewal timing deterministic in tests.
#[derive(Debug, Clone, Copy)]
pub struct SessionClock {
    anchor_utc: DateTime<Utc>,
    anchor_instant: Instant,
}

impl SessionClock {
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    pub fn starting_at(anchor_utc: DateTime<Utc>) -> Self {
        Self {
            anchor_utc,
            anchor_instant: Instant::now(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        let elapsed = Instant::now().saturating_duration_since(self.anchor_instant);
        self.anchor_utc + chrono::Duration::from_std(elapsed).unwrap_or(chrono::Duration::zero())
    }

    /// Instant at which the wall clock reads `at`. Past timestamps map to the anchor.
    pub fn instant_at(&self, at: DateTime<Utc>) -> Instant {
        match (at - self.anchor_utc).to_std() {
            Ok(offset) => self.anchor_instant + offset,
            Err(_) => self.anchor_instant,
        }
    }
}

impl Default for SessionClock {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Timer {
    Renewal,
    TokenRefresh,
    AutoRefresh,
}

/// Deadlines for the renewal, token refresh and periodic refresh timers.
///
/// The scheduler never sleeps on its own: the actor polls
/// [`Scheduler::next_timer`] inside its `select!`, so a firing timer is
/// serialized with everything else in the inbox.
#[derive(Debug)]
pub struct Scheduler {
    running: bool,
    token_interval: Duration,
    refresh_interval: Option<Duration>,
    renewal_at: Option<Instant>,
    token_at: Option<Instant>,
    refresh_at: Option<Instant>,
}

impl Scheduler {
    pub fn new(token_interval: Duration, refresh_interval: Option<Duration>) -> Self {
        Self {
            running: false,
            token_interval,
            refresh_interval,
            renewal_at: None,
            token_at: None,
            refresh_at: None,
        }
    }

    /// Arms the periodic timers relative to `now`. Restarting re-arms them.
    pub fn start(&mut self, now: Instant) {
        self.running = true;
        self.token_at = Some(now + self.token_interval);
        self.refresh_at = self.refresh_interval.map(|d| now + d);
    }

    pub fn stop(&mut self) {
        self.running = false;
        self.renewal_at = None;
        self.token_at = None;
        self.refresh_at = None;
    }

    /// Sets (or clears) the single renewal deadline.
    pub fn arm_renewal(&mut self, at: Option<Instant>) {
        if self.running {
            self.renewal_at = at;
        }
    }

    /// Earliest armed deadline. Ties go to renewal first.
    pub fn next_deadline(&self) -> Option<(Timer, Instant)> {
        if !self.running {
            return None;
        }
        [
            (Timer::Renewal, self.renewal_at),
            (Timer::TokenRefresh, self.token_at),
            (Timer::AutoRefresh, self.refresh_at),
        ]
        .into_iter()
        .filter_map(|(t, at)| at.map(|at| (t, at)))
        .min_by_key(|(_, at)| *at)
    }

    /// Waits for the next deadline. Pends forever when nothing is armed.
    ///
    /// Cancel safe: the deadline is recomputed on every call.
    pub async fn next_timer(&self) -> Timer {
        match self.next_deadline() {
            Some((timer, at)) => {
                tokio::time::sleep_until(at).await;
                timer
            }
            None => std::future::pending().await,
        }
    }

    /// Records that `timer` fired at `now` and re-arms the periodic ones.
    ///
    /// The renewal deadline is cleared; the actor re-arms it from the
    /// subscription table after handling the tick.
    pub fn fired(&mut self, timer: Timer, now: Instant) {
        match timer {
            Timer::Renewal => self.renewal_at = None,
            Timer::TokenRefresh => self.token_at = Some(now + self.token_interval),
            Timer::AutoRefresh => self.refresh_at = self.refresh_interval.map(|d| now + d),
        }
    }
}
