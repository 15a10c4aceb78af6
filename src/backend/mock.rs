//! Scriptable in-process backend.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use crate::backend::ExecutionBackend;
use crate::domain::{ChangesetId, FetchResult, OperationKind, RepoId};

/// Backend for tests and dry runs.
///
/// Every call succeeds unless a result was scripted for the repository. With
/// a gate, each call waits for one semaphore permit before returning, so a
/// test can hold attempts in flight and release them one at a time.
#[derive(Debug, Default)]
pub struct MockBackend {
    calls: Mutex<Vec<(RepoId, OperationKind)>>,
    sync_calls: Mutex<Vec<Vec<ChangesetId>>>,
    scripted: Mutex<HashMap<RepoId, VecDeque<bool>>>,
    fail_syncs: AtomicBool,
    delay: Duration,
    gate: Option<Arc<Semaphore>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long in every call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Block every call until a permit is added to `gate`.
    pub fn with_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Queue outcomes for the next attempts on `repo_id`.
    pub fn script(&self, repo_id: RepoId, outcomes: impl IntoIterator<Item = bool>) {
        let mut scripted = self.scripted.lock().unwrap_or_else(|e| e.into_inner());
        scripted.entry(repo_id).or_default().extend(outcomes);
    }

    pub fn set_fail_syncs(&self, fail: bool) {
        self.fail_syncs.store(fail, Ordering::SeqCst);
    }

    /// Repository calls in the order they started.
    pub fn calls(&self) -> Vec<(RepoId, OperationKind)> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn call_count(&self, repo_id: RepoId) -> usize {
        self.calls().iter().filter(|(id, _)| *id == repo_id).count()
    }

    pub fn sync_calls(&self) -> Vec<Vec<ChangesetId>> {
        self.sync_calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Calls currently running.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Highest number of calls ever running at once.
    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    async fn hold(&self) {
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);

        if let Some(gate) = &self.gate
            && let Ok(permit) = gate.acquire().await
        {
            permit.forget();
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ExecutionBackend for MockBackend {
    async fn fetch(&self, repo_id: RepoId, kind: OperationKind) -> FetchResult {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((repo_id, kind));

        self.hold().await;

        let success = self
            .scripted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(&repo_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or(true);

        if success {
            FetchResult::ok()
        } else {
            FetchResult::failed(format!("scripted failure for repo {}", repo_id))
        }
    }

    async fn sync_changesets(&self, ids: &[ChangesetId]) -> FetchResult {
        self.sync_calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(ids.to_vec());

        self.hold().await;

        if self.fail_syncs.load(Ordering::SeqCst) {
            FetchResult::failed("scripted sync failure")
        } else {
            FetchResult::ok()
        }
    }
}
