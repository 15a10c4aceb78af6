//! Repository update scheduling.
//!
//! This module provides:
//! - **Schedule**: one entry per repository, ordered by class, due time, then id.
//! - **Coalescer**: the single entry point for update requests; duplicates merge.
//! - **Fairness**: per-codehost ceilings on concurrent fetches.
//! - **Backoff**: exponential delay after consecutive failures.
//! - **Dispatcher**: a worker pool that claims due entries and runs them.
//! - **Recloner** and **changeset sync queue**: the two side lanes.
//!
//! # Architecture
//!
//! All mutable state sits behind one [`Scheduler`] handle. Request paths take
//! the schedule lock briefly and return; they never wait on a fetch. Workers
//! sleep until the earliest due time, a poll tick, or a wake-up from a request
//! or a completed attempt.
//!
//! Lock order is schedule, then changeset queue, then fairness buckets.
//!
//! # Example
//!
//! ```ignore
//! use repo_updater::scheduler::{Scheduler, SchedulerConfig, LogSyncTracker};
//!
//! let scheduler = Scheduler::with_system_clock(SchedulerConfig::default())?;
//! let dispatcher = scheduler.start(backend, Arc::new(LogSyncTracker));
//! scheduler.enqueue(&repo, PriorityClass::Manual, "user request");
//! ```

mod backoff;
mod changeset;
mod clock;
mod coalesce;
mod dispatcher;
mod fairness;
mod info;
mod reclone;
mod schedule;

pub use backoff::BackoffTracker;
pub use changeset::{BatchState, ChangesetSyncQueue, LogSyncTracker, SyncBatch, SyncEnqueue, SyncReport, SyncTracker};
pub use clock::{Clock, ManualClock, SystemClock};
pub use coalesce::Coalescer;
pub use dispatcher::DispatcherHandle;
pub use fairness::{BucketSnapshot, CodehostBucket, FairnessConfig, FairnessController, FairnessPermit};
pub use info::{InfoReader, SchedulerInfo};
pub use reclone::{RecloneRequest, Recloner};
pub use schedule::{Claimed, Eviction, PendingRequest, Schedule, ScheduleEntry, UpsertOutcome};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::backend::ExecutionBackend;
use crate::domain::{ChangesetId, PriorityClass, RepoId, RepoRecord};
use crate::error::{Result, UpdaterError};

/// Tunables for the scheduler and its worker pool.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Interval between routine updates, and the unit of backoff.
    pub base_interval: Duration,
    /// Upper bound on any backoff delay.
    pub max_interval: Duration,
    /// Number of dispatcher workers.
    pub worker_pool_size: usize,
    /// Entries kept before evicting.
    pub max_schedule_size: usize,
    /// Longest a worker sleeps before re-checking the schedule.
    pub poll_interval: Duration,
    /// Attempts running longer than this count as failures.
    pub fetch_timeout: Duration,
    /// Per-host concurrency limits.
    pub fairness: FairnessConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_secs(60),
            max_interval: Duration::from_secs(8 * 60 * 60),
            worker_pool_size: 8,
            max_schedule_size: 100_000,
            poll_interval: Duration::from_secs(1),
            fetch_timeout: Duration::from_secs(600),
            fairness: FairnessConfig::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn with_base_interval(mut self, interval: Duration) -> Self {
        self.base_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.worker_pool_size = workers;
        self
    }

    pub fn with_max_schedule_size(mut self, size: usize) -> Self {
        self.max_schedule_size = size;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn with_fairness(mut self, fairness: FairnessConfig) -> Self {
        self.fairness = fairness;
        self
    }

    /// Reject settings the scheduler cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.base_interval.is_zero() {
            return Err(UpdaterError::InvalidRequest("base interval must be positive".to_string()));
        }
        if self.max_interval < self.base_interval {
            return Err(UpdaterError::InvalidRequest(
                "max interval must not be shorter than base interval".to_string(),
            ));
        }
        if self.worker_pool_size == 0 {
            return Err(UpdaterError::InvalidRequest("worker pool size must be at least 1".to_string()));
        }
        if self.max_schedule_size == 0 {
            return Err(UpdaterError::InvalidRequest("max schedule size must be at least 1".to_string()));
        }
        if self.poll_interval.is_zero() {
            return Err(UpdaterError::InvalidRequest("poll interval must be positive".to_string()));
        }
        if self.fetch_timeout.is_zero() {
            return Err(UpdaterError::InvalidRequest("fetch timeout must be positive".to_string()));
        }
        if self.fairness.default_limit == 0 || self.fairness.limits.values().any(|limit| *limit == 0) {
            return Err(UpdaterError::InvalidRequest("codehost limits must be at least 1".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) dispatched: AtomicU64,
    pub(crate) succeeded: AtomicU64,
    pub(crate) failed: AtomicU64,
    pub(crate) reclones: AtomicU64,
    pub(crate) syncs_succeeded: AtomicU64,
    pub(crate) syncs_failed: AtomicU64,
}

/// Point-in-time view of scheduler activity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub tracked: usize,
    pub queued: usize,
    pub in_flight: usize,
    pub dispatched: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub reclones: u64,
    pub evicted: u64,
    pub syncs_queued: usize,
    pub syncs_in_flight: usize,
    pub syncs_succeeded: u64,
    pub syncs_failed: u64,
}

/// State shared by the request paths and the dispatcher workers.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) config: SchedulerConfig,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) fairness: FairnessController,
    pub(crate) wake: Notify,
    pub(crate) counters: Counters,
    schedule: RwLock<Schedule>,
    changesets: Mutex<ChangesetSyncQueue>,
}

impl Shared {
    pub(crate) fn schedule(&self) -> RwLockReadGuard<'_, Schedule> {
        self.schedule.read().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn schedule_mut(&self) -> RwLockWriteGuard<'_, Schedule> {
        self.schedule.write().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn changesets(&self) -> MutexGuard<'_, ChangesetSyncQueue> {
        self.changesets.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Handle to the scheduler. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let backoff = BackoffTracker::new(config.base_interval, config.max_interval);
        let schedule = Schedule::new(config.max_schedule_size, backoff);
        let fairness = FairnessController::new(config.fairness.clone());

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                clock,
                fairness,
                wake: Notify::new(),
                counters: Counters::default(),
                schedule: RwLock::new(schedule),
                changesets: Mutex::new(ChangesetSyncQueue::new()),
            }),
        })
    }

    pub fn with_system_clock(config: SchedulerConfig) -> Result<Self> {
        Self::new(config, Arc::new(SystemClock))
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    pub fn now(&self) -> Instant {
        self.shared.clock.now()
    }

    pub fn coalescer(&self) -> Coalescer {
        Coalescer::new(self.shared.clone())
    }

    pub fn recloner(&self) -> Recloner {
        Recloner::new(self.shared.clone())
    }

    pub fn reader(&self) -> InfoReader {
        InfoReader::new(self.shared.clone())
    }

    /// Request an update due now.
    pub fn enqueue(&self, repo: &RepoRecord, priority: PriorityClass, reason: &str) -> UpsertOutcome {
        self.coalescer().enqueue(repo, priority, reason)
    }

    /// Request an update due at `due_at`.
    pub fn enqueue_at(&self, repo: &RepoRecord, priority: PriorityClass, due_at: Instant, reason: &str) -> UpsertOutcome {
        self.coalescer().enqueue_at(repo, priority, due_at, reason)
    }

    pub fn reclone(&self, repo: &RepoRecord, reason: &str) -> Result<RecloneRequest> {
        self.recloner().request(repo, reason)
    }

    pub fn info(&self, repo_id: RepoId) -> SchedulerInfo {
        self.reader().info(repo_id)
    }

    /// Queue a sync for a set of changesets. Caller validates ids.
    pub fn enqueue_changeset_sync(&self, ids: &[ChangesetId], priority: PriorityClass) -> SyncEnqueue {
        let now = self.shared.clock.now();
        let result = self.shared.changesets().enqueue(ids.iter().copied(), priority, now);
        tracing::info!(
            batch_id = %result.batch_id,
            changesets = ids.len(),
            created = result.created,
            merged = result.merged.len(),
            "Queued changeset sync"
        );
        self.shared.wake.notify_waiters();
        result
    }

    pub fn set_disabled(&self, repo_id: RepoId, disabled: bool) -> Result<()> {
        let now = self.shared.clock.now();
        self.shared.schedule_mut().set_disabled(repo_id, disabled, now)?;
        tracing::info!(repo_id = %repo_id, disabled, "Changed repository rotation");
        if !disabled {
            self.shared.wake.notify_waiters();
        }
        Ok(())
    }

    /// Drop a repository from the schedule. Returns false if it was not scheduled.
    pub fn remove(&self, repo_id: RepoId) -> bool {
        let removed = self.shared.schedule_mut().remove(repo_id).is_some();
        if removed {
            tracing::info!(repo_id = %repo_id, "Removed repository from schedule");
        }
        removed
    }

    pub fn evictions(&self) -> Vec<Eviction> {
        self.shared.schedule().evictions()
    }

    pub fn fairness(&self) -> Vec<BucketSnapshot> {
        self.shared.fairness.snapshot()
    }

    pub fn stats(&self) -> SchedulerStats {
        let (tracked, queued, in_flight, evicted) = {
            let schedule = self.shared.schedule();
            (
                schedule.len(),
                schedule.queued_len(),
                schedule.in_flight_len(),
                schedule.evicted_total(),
            )
        };
        let (syncs_queued, syncs_in_flight) = {
            let changesets = self.shared.changesets();
            (changesets.queued_len(), changesets.in_flight_len())
        };
        let counters = &self.shared.counters;

        SchedulerStats {
            tracked,
            queued,
            in_flight,
            dispatched: counters.dispatched.load(Ordering::Relaxed),
            succeeded: counters.succeeded.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            reclones: counters.reclones.load(Ordering::Relaxed),
            evicted,
            syncs_queued,
            syncs_in_flight,
            syncs_succeeded: counters.syncs_succeeded.load(Ordering::Relaxed),
            syncs_failed: counters.syncs_failed.load(Ordering::Relaxed),
        }
    }

    /// Wake idle workers so they re-check the schedule.
    pub fn wake(&self) {
        self.shared.wake.notify_waiters();
    }

    /// Spawn the dispatcher worker pool. Must be called inside a tokio runtime.
    pub fn start(&self, backend: Arc<dyn ExecutionBackend>, tracker: Arc<dyn SyncTracker>) -> DispatcherHandle {
        dispatcher::Dispatcher::new(self.shared.clone(), backend, tracker).spawn()
    }
}
