//! Failure backoff for repository fetch attempts.
//!
//! A failed attempt pushes the next due time out exponentially:
//! the k-th consecutive failure waits `base * 2^k`, capped at `max`.
//! A success resets the failure count and waits one base interval.

use std::time::{Duration, Instant};

use crate::scheduler::schedule::ScheduleEntry;

/// Largest exponent applied before the cap takes over anyway.
const MAX_EXPONENT: u32 = 31;

/// Computes next due times from attempt outcomes.
#[derive(Debug, Clone)]
pub struct BackoffTracker {
    base_interval: Duration,
    max_interval: Duration,
}

impl BackoffTracker {
    pub fn new(base_interval: Duration, max_interval: Duration) -> Self {
        Self {
            base_interval,
            max_interval: max_interval.max(base_interval),
        }
    }

    pub fn base_interval(&self) -> Duration {
        self.base_interval
    }

    pub fn max_interval(&self) -> Duration {
        self.max_interval
    }

    /// Delay applied after `consecutive_failures` failures in a row.
    pub fn failure_delay(&self, consecutive_failures: u32) -> Duration {
        let exponent = consecutive_failures.min(MAX_EXPONENT);
        let factor = 1u32 << exponent;
        self.base_interval
            .checked_mul(factor)
            .map_or(self.max_interval, |delay| delay.min(self.max_interval))
    }

    /// Record a successful attempt. Returns the next due time.
    pub fn on_success(&self, entry: &mut ScheduleEntry, now: Instant) -> Instant {
        entry.consecutive_failures = 0;
        entry.last_attempt_at = Some(now);
        now + self.base_interval
    }

    /// Record a failed attempt. Returns the next due time.
    pub fn on_failure(&self, entry: &mut ScheduleEntry, now: Instant) -> Instant {
        entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
        entry.last_attempt_at = Some(now);
        let delay = self.failure_delay(entry.consecutive_failures);

        tracing::warn!(
            repo_id = %entry.repo_id,
            consecutive_failures = entry.consecutive_failures,
            delay_secs = delay.as_secs_f64(),
            "Fetch failed, backing off"
        );

        now + delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{HostId, PriorityClass, RepoId};

    fn entry() -> ScheduleEntry {
        ScheduleEntry::new(RepoId(1), HostId::new("github.com"), PriorityClass::Normal, Instant::now())
    }

    #[test]
    fn test_success_resets_failures() {
        let tracker = BackoffTracker::new(Duration::from_secs(10), Duration::from_secs(100));
        let mut e = entry();
        e.consecutive_failures = 4;
        let now = Instant::now();

        let next = tracker.on_success(&mut e, now);

        assert_eq!(e.consecutive_failures, 0);
        assert_eq!(next - now, Duration::from_secs(10));
        assert_eq!(e.last_attempt_at, Some(now));
    }

    #[test]
    fn test_exponential_failures() {
        let tracker = BackoffTracker::new(Duration::from_secs(1), Duration::from_secs(30));
        let mut e = entry();
        let now = Instant::now();

        let deltas: Vec<Duration> = (0..6).map(|_| tracker.on_failure(&mut e, now) - now).collect();

        assert_eq!(
            deltas,
            vec![
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
                Duration::from_secs(16),
                Duration::from_secs(30),
                Duration::from_secs(30),
            ]
        );
        assert_eq!(e.consecutive_failures, 6);
    }

    #[test]
    fn test_failure_delay_lower_bound() {
        let tracker = BackoffTracker::new(Duration::from_secs(3), Duration::from_secs(3600));
        for failures in 1..10u32 {
            let delay = tracker.failure_delay(failures);
            let floor = Duration::from_secs(3) * 2u32.pow(failures - 1);
            assert!(delay >= floor.min(Duration::from_secs(3600)), "failures={}", failures);
        }
    }

    #[test]
    fn test_failure_delay_never_overflows() {
        let tracker = BackoffTracker::new(Duration::from_secs(60), Duration::from_secs(8 * 3600));
        assert_eq!(tracker.failure_delay(u32::MAX), Duration::from_secs(8 * 3600));
        assert_eq!(tracker.failure_delay(200), Duration::from_secs(8 * 3600));
    }

    #[test]
    fn test_max_below_base_is_clamped() {
        let tracker = BackoffTracker::new(Duration::from_secs(10), Duration::from_secs(1));
        assert_eq!(tracker.max_interval(), Duration::from_secs(10));
        assert_eq!(tracker.failure_delay(3), Duration::from_secs(10));
    }
}
