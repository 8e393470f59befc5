//! Restart bookkeeping for a capture session.
//!
//! Crashes inside the failure window back off exponentially:
//! `base * 2^(n - 1)` for the n-th crash, capped at `max_backoff`. One crash
//! more than `max_restarts` inside the window is a persistent fault.
//! A session that stays up for `stable_after` starts over from the base delay.

use std::time::{Duration, Instant};

use tracing::debug;

/// Default base backoff duration (1 second).
pub const DEFAULT_BASE_BACKOFF: Duration = Duration::from_secs(1);

/// Default maximum backoff duration (1 minute).
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Default failure window (60 seconds).
pub const DEFAULT_FAILURE_WINDOW: Duration = Duration::from_secs(60);

/// Default number of restarts allowed inside the window.
pub const DEFAULT_MAX_RESTARTS: usize = 3;

/// Default uptime after which the failure history is forgotten (5 minutes).
pub const DEFAULT_STABLE_AFTER: Duration = Duration::from_secs(300);

/// Maximum exponent to prevent overflow.
const MAX_EXPONENT: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartSettings {
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub failure_window: Duration,
    pub max_restarts: usize,
    pub stable_after: Duration,
}

impl Default for RestartSettings {
    fn default() -> Self {
        Self {
            base_backoff: DEFAULT_BASE_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            failure_window: DEFAULT_FAILURE_WINDOW,
            max_restarts: DEFAULT_MAX_RESTARTS,
            stable_after: DEFAULT_STABLE_AFTER,
        }
    }
}

/// What to do after a crash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Restart after the given delay.
    Restart(Duration),
    /// Too many crashes inside the window; give up.
    Fault { crashes: usize },
}

#[derive(Debug, Clone)]
pub struct RestartTracker {
    settings: RestartSettings,
    /// Timestamps of recent crashes.
    failures: Vec<Instant>,
    total_restarts: u64,
}

impl RestartTracker {
    pub fn new(settings: RestartSettings) -> Self {
        Self {
            settings,
            failures: Vec::new(),
            total_restarts: 0,
        }
    }

    pub fn settings(&self) -> &RestartSettings {
        &self.settings
    }

    /// Record a crash at `now` and decide whether to restart.
    pub fn record_crash(&mut self, now: Instant) -> RestartDecision {
        let window = self.settings.failure_window;
        self.failures.retain(|&t| now.duration_since(t) < window);
        self.failures.push(now);

        let crashes = self.failures.len();
        if crashes > self.settings.max_restarts {
            return RestartDecision::Fault { crashes };
        }

        self.total_restarts += 1;
        RestartDecision::Restart(self.backoff(crashes))
    }

    /// Delay before restarting after the n-th crash in the window.
    pub fn backoff(&self, crashes: usize) -> Duration {
        if crashes == 0 {
            return Duration::ZERO;
        }
        let exponent = ((crashes - 1) as u32).min(MAX_EXPONENT);
        let multiplier = 2u32.saturating_pow(exponent);
        self.settings
            .base_backoff
            .saturating_mul(multiplier)
            .min(self.settings.max_backoff)
    }

    pub fn total_restarts(&self) -> u64 {
        self.total_restarts
    }

    /// Forget the crash history after a sustained healthy run.
    pub fn clear_failures(&mut self) {
        if !self.failures.is_empty() {
            debug!(cleared = self.failures.len(), "Clearing crash history");
        }
        self.failures.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_then_faults() {
        let mut tracker = RestartTracker::new(RestartSettings::default());
        let start = Instant::now();
        let at = |secs| start + Duration::from_secs(secs);

        assert_eq!(
            tracker.record_crash(at(0)),
            RestartDecision::Restart(Duration::from_secs(1))
        );
        assert_eq!(
            tracker.record_crash(at(2)),
            RestartDecision::Restart(Duration::from_secs(2))
        );
        assert_eq!(
            tracker.record_crash(at(5)),
            RestartDecision::Restart(Duration::from_secs(4))
        );
        assert_eq!(
            tracker.record_crash(at(10)),
            RestartDecision::Fault { crashes: 4 }
        );
        assert_eq!(tracker.total_restarts(), 3);
    }

    #[test]
    fn test_backoff_is_capped() {
        let tracker = RestartTracker::new(RestartSettings {
            max_restarts: 100,
            ..Default::default()
        });
        assert_eq!(tracker.backoff(7), Duration::from_secs(60));
        assert_eq!(tracker.backoff(64), Duration::from_secs(60));
    }

    #[test]
    fn test_crashes_outside_window_are_forgotten() {
        let mut tracker = RestartTracker::new(RestartSettings::default());
        let start = Instant::now();
        for i in 0..3 {
            tracker.record_crash(start + Duration::from_secs(i));
        }
        // Well past the 60s window: back to the base delay.
        assert_eq!(
            tracker.record_crash(start + Duration::from_secs(120)),
            RestartDecision::Restart(Duration::from_secs(1))
        );
    }

    #[test]
    fn test_clear_failures_resets_backoff() {
        let mut tracker = RestartTracker::new(RestartSettings::default());
        let now = Instant::now();
        tracker.record_crash(now);
        tracker.record_crash(now);
        tracker.clear_failures();
        assert_eq!(
            tracker.record_crash(now),
            RestartDecision::Restart(Duration::from_secs(1))
        );
    }
}
