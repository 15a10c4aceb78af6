//! The repo-updater service: RPC operations as plain request/response records.
//!
//! Only request validation errors and reclone conflicts are returned to the
//! caller. Fetch failures never surface here; they show up in
//! `repo_update_scheduler_info` as accumulated failures and a later due time.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{BatchId, ChangesetId, EntryState, PriorityClass, RepoId, RepoName, RepoRecord, RepoRef};
use crate::error::{Result, UpdaterError};
use crate::scheduler::{Scheduler, SchedulerStats, UpsertOutcome};
use crate::store::RepoStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerInfoRequest {
    pub repo_id: RepoId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerInfoResponse {
    pub repo_id: RepoId,
    pub in_schedule: bool,
    pub priority_class: Option<PriorityClass>,
    pub seconds_until_due: Option<u64>,
    pub consecutive_failures: u32,
    pub updating: bool,
    pub state: Option<EntryState>,
    pub reclone_pending: bool,
    pub position: Option<usize>,
    pub total: usize,
    pub seconds_since_last_attempt: Option<u64>,
    pub last_error: Option<String>,
}

fn manual() -> PriorityClass {
    PriorityClass::Manual
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueRepoUpdateRequest {
    pub repo: RepoRef,
    #[serde(default = "manual")]
    pub priority: PriorityClass,
}

impl EnqueueRepoUpdateRequest {
    pub fn new(repo: RepoRef) -> Self {
        Self {
            repo,
            priority: PriorityClass::Manual,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueRepoUpdateResponse {
    pub id: RepoId,
    pub name: RepoName,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecloneRepositoryRequest {
    pub repo_id: RepoId,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecloneRepositoryResponse {
    pub repo_id: RepoId,
    pub requested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueChangesetSyncRequest {
    pub ids: Vec<ChangesetId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueChangesetSyncResponse {
    pub batch_id: BatchId,
    /// Batches folded into `batch_id`.
    #[serde(default)]
    pub merged: Vec<BatchId>,
}

/// Front door for RPC callers. Cheap to share behind an `Arc`.
pub struct RepoUpdaterService {
    scheduler: Scheduler,
    store: Arc<dyn RepoStore>,
}

impl RepoUpdaterService {
    pub fn new(scheduler: Scheduler, store: Arc<dyn RepoStore>) -> Self {
        Self { scheduler, store }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn store(&self) -> &Arc<dyn RepoStore> {
        &self.store
    }

    fn lookup(&self, repo: &RepoRef) -> Result<RepoRecord> {
        match repo {
            RepoRef::Id(id) if id.0 == 0 => {
                return Err(UpdaterError::InvalidRequest("repository id must be positive".to_string()));
            }
            RepoRef::Name(name) if name.as_str().trim().is_empty() => {
                return Err(UpdaterError::InvalidRequest("repository name must not be empty".to_string()));
            }
            _ => {}
        }
        self.store
            .resolve(repo)?
            .ok_or_else(|| UpdaterError::NotFound(format!("repository {}", repo)))
    }

    /// Where a repository stands in the schedule.
    pub fn repo_update_scheduler_info(&self, request: &SchedulerInfoRequest) -> Result<SchedulerInfoResponse> {
        let record = self.lookup(&RepoRef::Id(request.repo_id))?;
        let info = self.scheduler.info(record.id);

        Ok(SchedulerInfoResponse {
            repo_id: record.id,
            in_schedule: info.in_schedule,
            priority_class: info.priority_class,
            seconds_until_due: info.due_in.map(|d| d.as_secs()),
            consecutive_failures: info.consecutive_failures,
            updating: info.is_updating(),
            state: info.state,
            reclone_pending: info.reclone_pending,
            position: info.position,
            total: info.total,
            seconds_since_last_attempt: info.since_last_attempt.map(|d| d.as_secs()),
            last_error: info.last_error,
        })
    }

    /// Ask for an update as soon as possible. Returns once the request is recorded.
    pub fn enqueue_repo_update(&self, request: &EnqueueRepoUpdateRequest) -> Result<EnqueueRepoUpdateResponse> {
        let record = self.lookup(&request.repo)?;
        self.scheduler.enqueue(&record, request.priority, "rpc enqueue");

        Ok(EnqueueRepoUpdateResponse {
            id: record.id,
            name: record.name,
        })
    }

    /// Accept a reclone, or report a conflict if one cannot start.
    pub fn reclone_repository(&self, request: &RecloneRepositoryRequest) -> Result<RecloneRepositoryResponse> {
        let record = self.lookup(&RepoRef::Id(request.repo_id))?;
        let reason = request.reason.as_deref().unwrap_or("rpc reclone");
        let accepted = self.scheduler.reclone(&record, reason)?;

        Ok(RecloneRepositoryResponse {
            repo_id: accepted.repo_id,
            requested_at: accepted.requested_at,
        })
    }

    pub fn enqueue_changeset_sync(&self, request: &EnqueueChangesetSyncRequest) -> Result<EnqueueChangesetSyncResponse> {
        if request.ids.is_empty() {
            return Err(UpdaterError::InvalidRequest("no changeset ids given".to_string()));
        }
        if let Some(bad) = request.ids.iter().find(|id| id.0 <= 0) {
            return Err(UpdaterError::InvalidRequest(format!(
                "changeset id {} must be positive",
                bad
            )));
        }

        let result = self
            .scheduler
            .enqueue_changeset_sync(&request.ids, PriorityClass::Manual);

        Ok(EnqueueChangesetSyncResponse {
            batch_id: result.batch_id,
            merged: result.merged,
        })
    }

    /// Register a repository and schedule its first routine update.
    pub fn track(&self, record: RepoRecord) -> Result<UpsertOutcome> {
        record.validate()?;

        self.store.upsert(&record)?;
        Ok(self.scheduler.enqueue(&record, PriorityClass::Normal, "tracked"))
    }

    /// Forget a repository. Returns false if it was not tracked.
    pub fn untrack(&self, repo_id: RepoId) -> Result<bool> {
        let removed = self.store.remove(repo_id)?;
        let unscheduled = self.scheduler.remove(repo_id);
        Ok(removed || unscheduled)
    }

    /// Schedule every repository already in the store.
    pub fn schedule_known(&self) -> Result<usize> {
        let records = self.store.list()?;
        for record in &records {
            self.scheduler.enqueue(record, PriorityClass::Normal, "startup");
        }
        Ok(records.len())
    }

    pub fn list(&self) -> Result<Vec<RepoRecord>> {
        self.store.list()
    }

    pub fn stats(&self) -> SchedulerStats {
        self.scheduler.stats()
    }
}
