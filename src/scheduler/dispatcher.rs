//! Dispatcher worker pool.
//!
//! Each worker repeatedly claims the best dispatchable job, runs it on the
//! execution backend, and reports the outcome back to the schedule. Idle
//! workers sleep until the earliest due time, a poll tick, a wake-up, or
//! shutdown.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::backend::ExecutionBackend;
use crate::domain::{FetchResult, OperationKind};
use crate::scheduler::Shared;
use crate::scheduler::changeset::{SyncBatch, SyncReport, SyncTracker};
use crate::scheduler::fairness::FairnessPermit;
use crate::scheduler::schedule::Claimed;

/// Work claimed by a worker.
#[derive(Debug)]
enum Job {
    Repo(Claimed<FairnessPermit>),
    Sync(SyncBatch),
}

pub(crate) struct Dispatcher {
    shared: Arc<Shared>,
    backend: Arc<dyn ExecutionBackend>,
    tracker: Arc<dyn SyncTracker>,
}

impl Dispatcher {
    pub(crate) fn new(shared: Arc<Shared>, backend: Arc<dyn ExecutionBackend>, tracker: Arc<dyn SyncTracker>) -> Self {
        Self {
            shared,
            backend,
            tracker,
        }
    }

    /// Spawn the configured number of workers.
    pub(crate) fn spawn(self) -> DispatcherHandle {
        let workers = self.shared.config.worker_pool_size;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let dispatcher = Arc::new(self);

        let handles = (0..workers)
            .map(|worker_id| {
                let dispatcher = dispatcher.clone();
                let shutdown_rx = shutdown_rx.clone();
                tokio::spawn(async move { dispatcher.run_worker(worker_id, shutdown_rx).await })
            })
            .collect();

        tracing::info!(workers, "Dispatcher started");

        DispatcherHandle {
            shared: dispatcher.shared.clone(),
            shutdown_tx,
            workers: handles,
        }
    }

    async fn run_worker(&self, worker_id: usize, mut shutdown_rx: watch::Receiver<bool>) {
        tracing::debug!(worker_id, "Worker started");

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            // Register for wake-ups before looking, so none are missed in between.
            let notified = self.shared.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(job) = self.claim() {
                self.execute(worker_id, job).await;
                continue;
            }

            let wait = self.idle_wait();
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(wait) => {}
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        tracing::debug!(worker_id, "Worker stopped");
    }

    /// Pick the next job, or `None` if nothing is dispatchable right now.
    ///
    /// Reclones go first. Then the best repository update and the best due sync
    /// batch compete on class; a tie goes to the repository update.
    fn claim(&self) -> Option<Job> {
        let now = self.shared.clock.now();
        let mut schedule = self.shared.schedule_mut();
        let mut changesets = self.shared.changesets();
        let fairness = &self.shared.fairness;

        let sync_floor = changesets.peek_due(now);
        if let Some(claimed) = schedule.claim_next(now, sync_floor, |host| fairness.try_acquire_permit(host)) {
            return Some(Job::Repo(claimed));
        }

        if sync_floor.is_none() {
            return None;
        }
        changesets.claim_due(now).map(Job::Sync)
    }

    fn idle_wait(&self) -> Duration {
        let now = self.shared.clock.now();
        let poll = self.shared.config.poll_interval;

        let schedule_due = self.shared.schedule().next_due_at(now);
        let sync_due = self.shared.changesets().next_due_at();
        let next_due = match (schedule_due, sync_due) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        match next_due {
            // Due work exists but every candidate host is at its limit;
            // a completing attempt will wake us.
            Some(due) if due <= now => poll,
            Some(due) => (due - now).min(poll),
            None => poll,
        }
    }

    async fn execute(&self, worker_id: usize, job: Job) {
        match job {
            Job::Repo(claimed) => self.run_fetch(worker_id, claimed).await,
            Job::Sync(batch) => self.run_sync(worker_id, batch).await,
        }
        self.shared.wake.notify_waiters();
    }

    async fn run_fetch(&self, worker_id: usize, claimed: Claimed<FairnessPermit>) {
        let Claimed {
            repo_id,
            host,
            kind,
            permit,
        } = claimed;
        let counters = &self.shared.counters;
        counters.dispatched.fetch_add(1, Ordering::Relaxed);
        if kind == OperationKind::Reclone {
            counters.reclones.fetch_add(1, Ordering::Relaxed);
        }

        tracing::info!(worker_id, repo_id = %repo_id, host = %host, kind = %kind, "Dispatching fetch");

        let backend = self.backend.clone();
        let result = self
            .await_attempt(tokio::spawn(async move { backend.fetch(repo_id, kind).await }))
            .await;

        let now = self.shared.clock.now();
        let next_due = self
            .shared
            .schedule_mut()
            .complete(repo_id, kind, result.success, result.error_detail.clone(), now);
        drop(permit);

        if result.success {
            counters.succeeded.fetch_add(1, Ordering::Relaxed);
            tracing::info!(worker_id, repo_id = %repo_id, kind = %kind, "Fetch succeeded");
        } else {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                worker_id,
                repo_id = %repo_id,
                kind = %kind,
                error = result.error_detail.as_deref().unwrap_or("unknown"),
                "Fetch failed"
            );
        }

        if let Some(due) = next_due {
            tracing::debug!(
                repo_id = %repo_id,
                next_in_secs = due.saturating_duration_since(now).as_secs(),
                "Rescheduled"
            );
        } else {
            tracing::debug!(repo_id = %repo_id, "Entry removed while in flight");
        }
    }

    async fn run_sync(&self, worker_id: usize, batch: SyncBatch) {
        let ids = batch.ids();
        tracing::info!(worker_id, batch_id = %batch.id, changesets = ids.len(), "Dispatching changeset sync");

        let backend = self.backend.clone();
        let sync_ids = ids.clone();
        let result = self
            .await_attempt(tokio::spawn(async move { backend.sync_changesets(&sync_ids).await }))
            .await;

        self.shared.changesets().complete(batch.id);

        let counter = if result.success {
            &self.shared.counters.syncs_succeeded
        } else {
            &self.shared.counters.syncs_failed
        };
        counter.fetch_add(1, Ordering::Relaxed);

        self.tracker
            .record(SyncReport {
                batch_id: batch.id,
                changesets: ids,
                success: result.success,
                error_detail: result.error_detail,
            })
            .await;
    }

    /// Await a backend attempt, turning panics and timeouts into failures.
    async fn await_attempt(&self, mut task: JoinHandle<FetchResult>) -> FetchResult {
        let timeout = self.shared.config.fetch_timeout;
        match tokio::time::timeout(timeout, &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => FetchResult::failed(format!("backend task failed: {}", e)),
            Err(_) => {
                task.abort();
                FetchResult::failed(format!("timed out after {}s", timeout.as_secs()))
            }
        }
    }
}

/// Owns the running workers.
#[derive(Debug)]
pub struct DispatcherHandle {
    shared: Arc<Shared>,
    shutdown_tx: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl DispatcherHandle {
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Stop claiming new work and wait for attempts in progress to finish.
    pub async fn shutdown(self) {
        tracing::info!("Dispatcher shutting down");
        let _ = self.shutdown_tx.send(true);
        self.shared.wake.notify_waiters();

        for result in futures::future::join_all(self.workers).await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Worker task ended abnormally");
            }
        }
        tracing::info!("Dispatcher stopped");
    }
}
