//! Reclone requests.
//!
//! A reclone discards a repository's working copy and clones it again. It is
//! served ahead of every priority class and ignores the entry's due time, but
//! still takes a slot from the code host's fairness bucket.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::{PriorityClass, RepoId, RepoRecord};
use crate::error::Result;
use crate::scheduler::Shared;

/// An accepted reclone request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecloneRequest {
    pub repo_id: RepoId,
    pub reason: String,
    pub requested_at: DateTime<Utc>,
}

/// Accepts reclone requests into the reclone lane.
#[derive(Debug, Clone)]
pub struct Recloner {
    shared: Arc<Shared>,
}

impl Recloner {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Queue a reclone for `repo`.
    ///
    /// Fails with `Conflict` if the repository is being fetched, already has a
    /// reclone pending, or is disabled. A repository without a schedule entry
    /// gets one at normal class.
    pub fn request(&self, repo: &RepoRecord, reason: &str) -> Result<RecloneRequest> {
        let now = self.shared.clock.now();
        {
            let mut schedule = self.shared.schedule_mut();
            if !schedule.contains(repo.id) {
                schedule.upsert(repo.id, repo.host.clone(), PriorityClass::Normal, now);
            }
            schedule.request_reclone(repo.id)?;
        }

        tracing::info!(repo_id = %repo.id, reason, "Reclone requested");
        self.shared.wake.notify_waiters();

        Ok(RecloneRequest {
            repo_id: repo.id,
            reason: reason.to_string(),
            requested_at: Utc::now(),
        })
    }
}
