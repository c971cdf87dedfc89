//! Per-feed refresh scheduling.
//!
//! After a successful fetch the next refresh is due at `last_updated + ttl`, as
//! published by the server. After a failed fetch the feed backs off exponentially
//! (1s, 2s, 4s, ... capped at one hour), minus a random jitter of up to 5% so that
//! many feeds failing together do not retry in lockstep.

use chrono::Utc;

/// Upper bound for the failure backoff.
pub const MAX_BACKOFF_SECS: i64 = 3600;

/// Fraction of the backoff that may be subtracted as jitter.
const JITTER_FRACTION: f64 = 0.05;

/// Current wall-clock time in epoch seconds.
pub(crate) fn now_secs() -> i64 {
    Utc::now().timestamp()
}

/// Backoff for the given number of consecutive failures, before jitter.
///
/// `2^(failures - 1)` seconds, capped at [`MAX_BACKOFF_SECS`]. Zero failures
/// means no backoff.
pub fn backoff_secs(failures: u32) -> i64 {
    if failures == 0 {
        return 0;
    }
    1i64.checked_shl(failures - 1)
        .filter(|secs| *secs > 0)
        .map_or(MAX_BACKOFF_SECS, |secs| secs.min(MAX_BACKOFF_SECS))
}

/// Scheduling state for a single feed.
///
/// A fresh strategy is due immediately. Only a successful
/// [`schedule_next_update`](Self::schedule_next_update) resets the failure count.
#[derive(Debug, Clone, Default)]
pub struct UpdateStrategy {
    failed_attempts: u32,
    next_update: i64,
    minimum_ttl: i64,
}

impl UpdateStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Strategy that never schedules a successful refresh sooner than
    /// `minimum_ttl` seconds after `last_updated`.
    pub fn with_minimum_ttl(minimum_ttl: i64) -> Self {
        Self {
            minimum_ttl: minimum_ttl.max(0),
            ..Self::default()
        }
    }

    pub fn should_update(&self) -> bool {
        self.should_update_at(now_secs())
    }

    pub fn should_update_at(&self, now: i64) -> bool {
        now >= self.next_update
    }

    /// Schedule after a successful refresh.
    ///
    /// If either value is missing the feed is treated as immediately stale.
    pub fn schedule_next_update(&mut self, last_updated: Option<i64>, ttl: Option<i64>) {
        self.schedule_next_update_at(now_secs(), last_updated, ttl);
    }

    pub fn schedule_next_update_at(
        &mut self,
        now: i64,
        last_updated: Option<i64>,
        ttl: Option<i64>,
    ) {
        self.failed_attempts = 0;
        self.next_update = match (last_updated, ttl) {
            (Some(last_updated), Some(ttl)) => {
                last_updated.saturating_add(ttl.max(self.minimum_ttl))
            }
            _ => now,
        };
    }

    /// Schedule after a failed refresh. Returns the new next-update time.
    pub fn reschedule_after_failure(&mut self) -> i64 {
        self.reschedule_after_failure_at(now_secs())
    }

    pub fn reschedule_after_failure_at(&mut self, now: i64) -> i64 {
        self.failed_attempts = self.failed_attempts.saturating_add(1);
        let backoff = backoff_secs(self.failed_attempts);
        let jitter = (rand::random::<f64>() * JITTER_FRACTION * backoff as f64) as i64;
        self.next_update = now.saturating_add(backoff - jitter);

        tracing::debug!(
            failures = self.failed_attempts,
            backoff_secs = backoff,
            next_update = self.next_update,
            "Rescheduled refresh after failure"
        );
        self.next_update
    }

    /// Epoch second at which the feed next becomes due.
    pub fn next_update(&self) -> i64 {
        self.next_update
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failed_attempts
    }
}
