//! Changeset sync batching.
//!
//! Sync requests for sets of changesets are queued as batches. A changeset id
//! is in at most one queued batch: a request that overlaps queued batches is
//! merged into the oldest of them. Ids whose batch is already in flight do not
//! block a new request; they land in a follow-up batch, which is not claimed
//! until the running sync of those ids has finished.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Instant;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::domain::{BatchId, ChangesetId, PriorityClass};

/// Whether a batch is waiting or being synced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Queued,
    InFlight,
}

/// A set of changesets synced together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncBatch {
    pub id: BatchId,
    pub changesets: BTreeSet<ChangesetId>,
    pub priority: PriorityClass,
    pub due_at: Instant,
    pub state: BatchState,
}

impl SyncBatch {
    fn order_key(&self) -> (std::cmp::Reverse<PriorityClass>, Instant, BatchId) {
        (std::cmp::Reverse(self.priority), self.due_at, self.id)
    }

    pub fn ids(&self) -> Vec<ChangesetId> {
        self.changesets.iter().copied().collect()
    }
}

/// Result of enqueueing a sync request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncEnqueue {
    /// Batch now holding the requested ids.
    pub batch_id: BatchId,
    /// Batches folded into `batch_id` and no longer present.
    pub merged: Vec<BatchId>,
    /// Whether `batch_id` was created by this request.
    pub created: bool,
}

/// Queue of pending changeset sync batches.
#[derive(Debug, Default)]
pub struct ChangesetSyncQueue {
    next_id: u64,
    batches: HashMap<BatchId, SyncBatch>,
    order: BTreeSet<(std::cmp::Reverse<PriorityClass>, Instant, BatchId)>,
    queued_by_changeset: HashMap<ChangesetId, BatchId>,
    syncing: HashSet<ChangesetId>,
}

impl ChangesetSyncQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, batch_id: BatchId) -> Option<&SyncBatch> {
        self.batches.get(&batch_id)
    }

    /// Queued batch currently holding `changeset`, if any.
    pub fn batch_for(&self, changeset: ChangesetId) -> Option<BatchId> {
        self.queued_by_changeset.get(&changeset).copied()
    }

    pub fn queued_len(&self) -> usize {
        self.order.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.batches.len() - self.order.len()
    }

    /// Queue a sync for `ids`, merging with any queued batch that shares an id.
    pub fn enqueue(
        &mut self,
        ids: impl IntoIterator<Item = ChangesetId>,
        priority: PriorityClass,
        due_at: Instant,
    ) -> SyncEnqueue {
        let ids: BTreeSet<ChangesetId> = ids.into_iter().collect();

        let overlapping: BTreeSet<BatchId> = ids
            .iter()
            .filter_map(|id| self.queued_by_changeset.get(id).copied())
            .collect();

        let mut overlapping = overlapping.into_iter();
        let Some(target) = overlapping.next() else {
            let id = self.allocate_id();
            let batch = SyncBatch {
                id,
                changesets: ids,
                priority,
                due_at,
                state: BatchState::Queued,
            };
            self.insert_queued(batch);
            return SyncEnqueue {
                batch_id: id,
                merged: Vec::new(),
                created: true,
            };
        };

        let Some(mut batch) = self.take_queued(target) else {
            return SyncEnqueue {
                batch_id: target,
                merged: Vec::new(),
                created: false,
            };
        };

        let mut merged = Vec::new();
        for other_id in overlapping {
            if let Some(other) = self.take_queued(other_id) {
                batch.changesets.extend(other.changesets);
                batch.priority = batch.priority.max(other.priority);
                batch.due_at = batch.due_at.min(other.due_at);
                merged.push(other_id);
            }
        }
        batch.changesets.extend(ids);
        batch.priority = batch.priority.max(priority);
        batch.due_at = batch.due_at.min(due_at);

        if !merged.is_empty() {
            tracing::debug!(batch_id = %target, merged = ?merged, "Merged overlapping sync batches");
        }
        self.insert_queued(batch);

        SyncEnqueue {
            batch_id: target,
            merged,
            created: false,
        }
    }

    /// Whether `changeset` is part of a batch in flight.
    pub fn is_syncing(&self, changeset: ChangesetId) -> bool {
        self.syncing.contains(&changeset)
    }

    /// Highest class among claimable batches due at `now`.
    pub fn peek_due(&self, now: Instant) -> Option<PriorityClass> {
        self.first_claimable(now)
            .map(|(std::cmp::Reverse(priority), _, _)| priority)
    }

    /// Earliest due time among queued batches.
    pub fn next_due_at(&self) -> Option<Instant> {
        self.order.iter().map(|(_, due_at, _)| *due_at).min()
    }

    /// Take the best due batch and mark it in flight.
    ///
    /// Batches sharing an id with a batch in flight are skipped.
    pub fn claim_due(&mut self, now: Instant) -> Option<SyncBatch> {
        let key = self.first_claimable(now)?;
        self.order.remove(&key);

        let batch = self.batches.get_mut(&key.2)?;
        for id in &batch.changesets {
            self.queued_by_changeset.remove(id);
            self.syncing.insert(*id);
        }
        batch.state = BatchState::InFlight;
        Some(batch.clone())
    }

    /// Forget a finished batch.
    pub fn complete(&mut self, batch_id: BatchId) -> Option<SyncBatch> {
        match self.batches.get(&batch_id) {
            Some(batch) if batch.state == BatchState::InFlight => {
                let batch = self.batches.remove(&batch_id)?;
                for id in &batch.changesets {
                    self.syncing.remove(id);
                }
                Some(batch)
            }
            _ => None,
        }
    }

    fn first_claimable(&self, now: Instant) -> Option<(std::cmp::Reverse<PriorityClass>, Instant, BatchId)> {
        self.order
            .iter()
            .filter(|(_, due_at, _)| *due_at <= now)
            .find(|(_, _, batch_id)| {
                self.batches
                    .get(batch_id)
                    .is_some_and(|batch| batch.changesets.iter().all(|id| !self.syncing.contains(id)))
            })
            .copied()
    }

    fn allocate_id(&mut self) -> BatchId {
        self.next_id += 1;
        BatchId(self.next_id)
    }

    fn insert_queued(&mut self, batch: SyncBatch) {
        for id in &batch.changesets {
            self.queued_by_changeset.insert(*id, batch.id);
        }
        self.order.insert(batch.order_key());
        self.batches.insert(batch.id, batch);
    }

    fn take_queued(&mut self, batch_id: BatchId) -> Option<SyncBatch> {
        match self.batches.get(&batch_id) {
            Some(batch) if batch.state == BatchState::Queued => {}
            _ => return None,
        }
        let batch = self.batches.remove(&batch_id)?;
        self.order.remove(&batch.order_key());
        for id in &batch.changesets {
            self.queued_by_changeset.remove(id);
        }
        Some(batch)
    }
}

/// Outcome of one batch sync, handed to the [`SyncTracker`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub batch_id: BatchId,
    pub changesets: Vec<ChangesetId>,
    pub success: bool,
    pub error_detail: Option<String>,
}

/// Receives sync outcomes. Failed batches are not retried by the scheduler.
#[async_trait]
pub trait SyncTracker: Send + Sync {
    async fn record(&self, report: SyncReport);
}

/// Tracker that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSyncTracker;

#[async_trait]
impl SyncTracker for LogSyncTracker {
    async fn record(&self, report: SyncReport) {
        if report.success {
            tracing::info!(batch_id = %report.batch_id, changesets = report.changesets.len(), "Changeset sync succeeded");
        } else {
            tracing::warn!(
                batch_id = %report.batch_id,
                changesets = report.changesets.len(),
                error = report.error_detail.as_deref().unwrap_or("unknown"),
                "Changeset sync failed"
            );
        }
    }
}

#[async_trait]
impl SyncTracker for mpsc::UnboundedSender<SyncReport> {
    async fn record(&self, report: SyncReport) {
        if self.send(report).is_err() {
            tracing::debug!("Sync report receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn ids(raw: &[i64]) -> Vec<ChangesetId> {
        raw.iter().map(|id| ChangesetId(*id)).collect()
    }

    #[test]
    fn test_enqueue_creates_batch() {
        let mut q = ChangesetSyncQueue::new();
        let now = Instant::now();
        let result = q.enqueue(ids(&[1, 2]), PriorityClass::Normal, now);

        assert!(result.created);
        assert_eq!(result.batch_id, BatchId(1));
        assert_eq!(q.queued_len(), 1);
        assert_eq!(q.batch_for(ChangesetId(2)), Some(BatchId(1)));
    }

    #[test]
    fn test_disjoint_requests_get_separate_batches() {
        let mut q = ChangesetSyncQueue::new();
        let now = Instant::now();
        let a = q.enqueue(ids(&[1]), PriorityClass::Normal, now);
        let b = q.enqueue(ids(&[2]), PriorityClass::Normal, now);
        assert_ne!(a.batch_id, b.batch_id);
        assert_eq!(q.queued_len(), 2);
    }

    #[test]
    fn test_overlap_merges_into_oldest_batch() {
        let mut q = ChangesetSyncQueue::new();
        let now = Instant::now();
        q.enqueue(ids(&[1, 2]), PriorityClass::Low, now + Duration::from_secs(5));
        q.enqueue(ids(&[3]), PriorityClass::Normal, now + Duration::from_secs(9));

        let result = q.enqueue(ids(&[2, 3, 4]), PriorityClass::Manual, now + Duration::from_secs(7));

        assert!(!result.created);
        assert_eq!(result.batch_id, BatchId(1));
        assert_eq!(result.merged, vec![BatchId(2)]);
        assert_eq!(q.queued_len(), 1);

        let batch = q.get(BatchId(1)).unwrap();
        assert_eq!(batch.ids(), ids(&[1, 2, 3, 4]));
        assert_eq!(batch.priority, PriorityClass::Manual);
        assert_eq!(batch.due_at, now + Duration::from_secs(5));
        assert!(q.get(BatchId(2)).is_none());
    }

    #[test]
    fn test_in_flight_ids_go_to_follow_up_batch() {
        let mut q = ChangesetSyncQueue::new();
        let now = Instant::now();
        q.enqueue(ids(&[1, 2]), PriorityClass::Normal, now);
        let claimed = q.claim_due(now).unwrap();
        assert_eq!(claimed.state, BatchState::InFlight);

        let follow_up = q.enqueue(ids(&[2]), PriorityClass::Normal, now);
        assert!(follow_up.created);
        assert_ne!(follow_up.batch_id, claimed.id);
        assert_eq!(q.in_flight_len(), 1);
        assert_eq!(q.queued_len(), 1);
    }

    #[test]
    fn test_follow_up_waits_for_running_sync() {
        let mut q = ChangesetSyncQueue::new();
        let now = Instant::now();
        q.enqueue(ids(&[7]), PriorityClass::Normal, now);
        let running = q.claim_due(now).unwrap();
        assert!(q.is_syncing(ChangesetId(7)));

        q.enqueue(ids(&[7, 8]), PriorityClass::Manual, now);
        q.enqueue(ids(&[9]), PriorityClass::Low, now);

        // The batch holding 7 is skipped, the unrelated one is not
        assert_eq!(q.peek_due(now), Some(PriorityClass::Low));
        assert_eq!(q.claim_due(now).unwrap().ids(), ids(&[9]));
        assert!(q.claim_due(now).is_none());
        assert_eq!(q.peek_due(now), None);

        q.complete(running.id);
        assert!(!q.is_syncing(ChangesetId(7)));
        assert_eq!(q.peek_due(now), Some(PriorityClass::Manual));
        assert_eq!(q.claim_due(now).unwrap().ids(), ids(&[7, 8]));
    }

    #[test]
    fn test_claim_order_and_due_time() {
        let mut q = ChangesetSyncQueue::new();
        let now = Instant::now();
        q.enqueue(ids(&[1]), PriorityClass::Low, now);
        q.enqueue(ids(&[2]), PriorityClass::Manual, now + Duration::from_secs(60));
        q.enqueue(ids(&[3]), PriorityClass::Normal, now);

        assert_eq!(q.peek_due(now), Some(PriorityClass::Normal));
        assert_eq!(q.claim_due(now).unwrap().ids(), ids(&[3]));
        assert_eq!(q.claim_due(now).unwrap().ids(), ids(&[1]));
        assert!(q.claim_due(now).is_none());
        assert_eq!(q.next_due_at(), Some(now + Duration::from_secs(60)));
    }

    #[test]
    fn test_complete_only_removes_in_flight() {
        let mut q = ChangesetSyncQueue::new();
        let now = Instant::now();
        let queued = q.enqueue(ids(&[1]), PriorityClass::Normal, now);
        assert!(q.complete(queued.batch_id).is_none());

        let claimed = q.claim_due(now).unwrap();
        assert!(q.complete(claimed.id).is_some());
        assert_eq!(q.in_flight_len(), 0);
    }

    #[tokio::test]
    async fn test_channel_tracker_forwards_reports() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.record(SyncReport {
            batch_id: BatchId(1),
            changesets: ids(&[5]),
            success: true,
            error_detail: None,
        })
        .await;

        let report = rx.recv().await.unwrap();
        assert_eq!(report.batch_id, BatchId(1));
        assert!(report.success);
    }
}
