//! Single entry point for update requests.

use std::sync::Arc;
use std::time::Instant;

use crate::domain::{PriorityClass, RepoRecord};
use crate::scheduler::Shared;
use crate::scheduler::schedule::UpsertOutcome;

/// Folds update requests into the schedule.
///
/// However many requests arrive for a repository, it keeps one entry with the
/// highest requested class and the earliest requested due time. Requests for
/// an entry that is being fetched are kept and applied when the attempt ends.
#[derive(Debug, Clone)]
pub struct Coalescer {
    shared: Arc<Shared>,
}

impl Coalescer {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Request an update due now.
    pub fn enqueue(&self, repo: &RepoRecord, priority: PriorityClass, reason: &str) -> UpsertOutcome {
        let now = self.shared.clock.now();
        self.enqueue_at(repo, priority, now, reason)
    }

    /// Request an update due at `due_at`.
    pub fn enqueue_at(&self, repo: &RepoRecord, priority: PriorityClass, due_at: Instant, reason: &str) -> UpsertOutcome {
        let outcome = self
            .shared
            .schedule_mut()
            .upsert(repo.id, repo.host.clone(), priority, due_at);

        tracing::debug!(
            repo_id = %repo.id,
            priority = %priority,
            reason,
            outcome = ?outcome,
            "Coalesced update request"
        );

        if outcome.needs_wake() {
            self.shared.wake.notify_waiters();
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{ManualClock, Scheduler, SchedulerConfig};
    use std::time::Duration;

    fn coalescer() -> (Scheduler, Coalescer) {
        let scheduler = Scheduler::new(SchedulerConfig::default(), Arc::new(ManualClock::new())).unwrap();
        let coalescer = scheduler.coalescer();
        (scheduler, coalescer)
    }

    #[test]
    fn test_many_requests_one_entry() {
        let (scheduler, coalescer) = coalescer();
        let repo = RepoRecord::new(1, "github.com/a/b", "github.com");

        for _ in 0..50 {
            coalescer.enqueue(&repo, PriorityClass::Low, "poll");
        }

        assert_eq!(scheduler.stats().tracked, 1);
        assert_eq!(scheduler.stats().queued, 1);
    }

    #[test]
    fn test_max_class_min_due() {
        let (scheduler, coalescer) = coalescer();
        let repo = RepoRecord::new(1, "github.com/a/b", "github.com");
        let now = scheduler.now();

        coalescer.enqueue_at(&repo, PriorityClass::Manual, now + Duration::from_secs(30), "user");
        coalescer.enqueue_at(&repo, PriorityClass::Low, now + Duration::from_secs(10), "poll");

        let info = scheduler.info(repo.id);
        assert_eq!(info.priority_class, Some(PriorityClass::Manual));
        assert_eq!(info.due_at, Some(now + Duration::from_secs(10)));
    }
}
