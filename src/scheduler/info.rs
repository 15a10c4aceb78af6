//! Read-only introspection of a repository's schedule entry.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::domain::{EntryState, PriorityClass, RepoId};
use crate::scheduler::Shared;

/// What the scheduler knows about one repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerInfo {
    pub repo_id: RepoId,
    pub in_schedule: bool,
    pub priority_class: Option<PriorityClass>,
    pub due_at: Option<Instant>,
    /// Time left until due; zero once overdue.
    pub due_in: Option<Duration>,
    pub consecutive_failures: u32,
    pub state: Option<EntryState>,
    pub reclone_pending: bool,
    /// Zero-based dispatch position among waiting entries.
    pub position: Option<usize>,
    /// Number of waiting entries.
    pub total: usize,
    pub since_last_attempt: Option<Duration>,
    pub last_error: Option<String>,
}

impl SchedulerInfo {
    fn absent(repo_id: RepoId, total: usize) -> Self {
        Self {
            repo_id,
            in_schedule: false,
            priority_class: None,
            due_at: None,
            due_in: None,
            consecutive_failures: 0,
            state: None,
            reclone_pending: false,
            position: None,
            total,
            since_last_attempt: None,
            last_error: None,
        }
    }

    pub fn is_updating(&self) -> bool {
        self.state.is_some_and(|state| state.is_in_flight())
    }
}

/// Answers info queries under the schedule's read lock.
#[derive(Debug, Clone)]
pub struct InfoReader {
    shared: Arc<Shared>,
}

impl InfoReader {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    pub fn info(&self, repo_id: RepoId) -> SchedulerInfo {
        let now = self.shared.clock.now();
        let schedule = self.shared.schedule();
        let position = schedule.position(repo_id);
        let total = schedule.queued_len();

        let Some(entry) = schedule.get(repo_id) else {
            return SchedulerInfo::absent(repo_id, total);
        };

        SchedulerInfo {
            repo_id,
            in_schedule: true,
            priority_class: Some(entry.priority),
            due_at: Some(entry.due_at),
            due_in: Some(entry.due_at.saturating_duration_since(now)),
            consecutive_failures: entry.consecutive_failures,
            state: Some(entry.state),
            reclone_pending: entry.reclone_pending,
            position: position.map(|(index, _)| index),
            total,
            since_last_attempt: entry.last_attempt_at.map(|at| now.saturating_duration_since(at)),
            last_error: entry.last_error.clone(),
        }
    }
}
