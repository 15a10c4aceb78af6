//! End-to-end scheduling scenarios
//!
//! Drives the dispatcher against the mock backend with a manual clock so
//! backoff and due times are deterministic.

use std::sync::Arc;
use std::time::Duration;

use repo_updater::backend::MockBackend;
use repo_updater::domain::{ChangesetId, OperationKind, PriorityClass, RepoId, RepoRecord};
use repo_updater::scheduler::{
    FairnessConfig, LogSyncTracker, ManualClock, Scheduler, SchedulerConfig, SyncReport, SyncTracker,
};
use tokio::sync::{Semaphore, mpsc};

fn config(workers: usize) -> SchedulerConfig {
    SchedulerConfig::default()
        .with_workers(workers)
        .with_poll_interval(Duration::from_millis(10))
}

/// Forwards every sync report to a channel.
struct ChannelTracker(mpsc::UnboundedSender<SyncReport>);

#[async_trait::async_trait]
impl SyncTracker for ChannelTracker {
    async fn record(&self, report: SyncReport) {
        let _ = self.0.send(report);
    }
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_enqueues_coalesce_to_one_entry() {
    let clock = Arc::new(ManualClock::new());
    let scheduler = Scheduler::new(config(1), clock.clone()).unwrap();
    let repo = RepoRecord::new(9, "github.com/org/busy", "github.com");
    let start = scheduler.now();

    let mut tasks = Vec::new();
    for i in 0..32u64 {
        let scheduler = scheduler.clone();
        let repo = repo.clone();
        tasks.push(tokio::spawn(async move {
            let priority = match i % 3 {
                0 => PriorityClass::Low,
                1 => PriorityClass::Normal,
                _ => PriorityClass::Manual,
            };
            scheduler.enqueue_at(&repo, priority, start + Duration::from_secs(10 + i), "burst");
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let stats = scheduler.stats();
    assert_eq!(stats.tracked, 1);
    assert_eq!(stats.queued, 1);

    let info = scheduler.info(repo.id);
    assert_eq!(info.priority_class, Some(PriorityClass::Manual));
    assert_eq!(info.due_in, Some(Duration::from_secs(10)));
}

#[tokio::test]
async fn test_failures_back_off_exponentially_up_to_max() {
    let clock = Arc::new(ManualClock::new());
    let config = config(1)
        .with_base_interval(Duration::from_secs(1))
        .with_max_interval(Duration::from_secs(30));
    let scheduler = Scheduler::new(config, clock.clone()).unwrap();
    let backend = Arc::new(MockBackend::new());
    let repo = RepoRecord::new(1, "github.com/org/flaky", "github.com");
    backend.script(repo.id, [false, false, false, false, false]);

    let handle = scheduler.start(backend.clone(), Arc::new(LogSyncTracker));
    scheduler.enqueue(&repo, PriorityClass::Manual, "test");

    let expected = [2, 4, 8, 16, 30];
    for (attempt, delay) in expected.iter().enumerate() {
        let failures = attempt as u64 + 1;
        wait_for(|| scheduler.stats().failed == failures).await;

        let info = scheduler.info(repo.id);
        assert_eq!(info.consecutive_failures, failures as u32);
        assert_eq!(info.due_in, Some(Duration::from_secs(*delay)));
        assert!(info.last_error.is_some());

        // Not retried before the delay elapses
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(backend.call_count(repo.id), attempt + 1);

        clock.advance(Duration::from_secs(*delay));
        scheduler.wake();
    }

    wait_for(|| scheduler.stats().succeeded == 1).await;
    let info = scheduler.info(repo.id);
    assert_eq!(info.consecutive_failures, 0);
    assert!(info.last_error.is_none());
    assert_eq!(info.due_in, Some(Duration::from_secs(1)));

    handle.shutdown().await;
}

#[tokio::test]
async fn test_host_limit_caps_concurrent_fetches() {
    let clock = Arc::new(ManualClock::new());
    let config = config(4).with_fairness(FairnessConfig::new(1).with_host_limit("gitlab.com", 2));
    let scheduler = Scheduler::new(config, clock).unwrap();
    let gate = Arc::new(Semaphore::new(0));
    let backend = Arc::new(MockBackend::new().with_gate(gate.clone()));

    for id in 1..=3 {
        scheduler.enqueue(
            &RepoRecord::new(id, format!("github.com/org/r{}", id), "github.com"),
            PriorityClass::Normal,
            "test",
        );
    }
    scheduler.enqueue(&RepoRecord::new(4, "gitlab.com/org/r4", "gitlab.com"), PriorityClass::Normal, "test");

    let handle = scheduler.start(backend.clone(), Arc::new(LogSyncTracker));

    wait_for(|| backend.active() == 2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(backend.active(), 2);
    let github_calls = backend.calls().iter().filter(|(id, _)| id.0 <= 3).count();
    assert_eq!(github_calls, 1);
    assert_eq!(scheduler.stats().in_flight, 2);

    gate.add_permits(10);
    wait_for(|| scheduler.stats().succeeded == 4).await;
    assert_eq!(backend.max_active(), 2);

    handle.shutdown().await;
    assert!(scheduler.fairness().iter().all(|bucket| bucket.in_flight == 0));
}

#[tokio::test]
async fn test_single_worker_dispatches_by_priority_class() {
    let clock = Arc::new(ManualClock::new());
    let scheduler = Scheduler::new(config(1), clock).unwrap();
    let backend = Arc::new(MockBackend::new());

    scheduler.enqueue(&RepoRecord::new(1, "low", "h1"), PriorityClass::Low, "test");
    scheduler.enqueue(&RepoRecord::new(2, "normal", "h2"), PriorityClass::Normal, "test");
    scheduler.enqueue(&RepoRecord::new(3, "manual", "h3"), PriorityClass::Manual, "test");

    let handle = scheduler.start(backend.clone(), Arc::new(LogSyncTracker));
    wait_for(|| scheduler.stats().succeeded == 3).await;

    let order: Vec<RepoId> = backend.calls().into_iter().map(|(id, _)| id).collect();
    assert_eq!(order, vec![RepoId(3), RepoId(2), RepoId(1)]);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_reclone_runs_once_and_rejects_duplicates() {
    let clock = Arc::new(ManualClock::new());
    let scheduler = Scheduler::new(config(2), clock).unwrap();
    let gate = Arc::new(Semaphore::new(0));
    let backend = Arc::new(MockBackend::new().with_gate(gate.clone()));
    let repo = RepoRecord::new(5, "github.com/org/broken", "github.com");

    let handle = scheduler.start(backend.clone(), Arc::new(LogSyncTracker));
    scheduler.enqueue(&repo, PriorityClass::Manual, "test");
    wait_for(|| backend.active() == 1).await;

    // In flight: reclone must wait
    let err = scheduler.reclone(&repo, "corrupt").unwrap_err();
    assert!(err.is_conflict());

    gate.add_permits(1);
    wait_for(|| scheduler.stats().succeeded == 1).await;

    scheduler.reclone(&repo, "corrupt").unwrap();
    let err = scheduler.reclone(&repo, "corrupt again").unwrap_err();
    assert!(err.is_conflict());

    gate.add_permits(1);
    wait_for(|| scheduler.stats().succeeded == 2).await;
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert_eq!(
        backend.calls(),
        vec![(repo.id, OperationKind::Update), (repo.id, OperationKind::Reclone)]
    );
    assert_eq!(scheduler.stats().reclones, 1);
    assert!(!scheduler.info(repo.id).reclone_pending);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_info_reflects_enqueue_immediately() {
    let clock = Arc::new(ManualClock::new());
    let scheduler = Scheduler::new(config(1), clock).unwrap();
    let repo = RepoRecord::new(11, "github.com/org/fresh", "github.com");

    assert!(!scheduler.info(repo.id).in_schedule);

    scheduler.enqueue_at(&repo, PriorityClass::Low, scheduler.now() + Duration::from_secs(90), "routine");
    let info = scheduler.info(repo.id);
    assert!(info.in_schedule);
    assert_eq!(info.priority_class, Some(PriorityClass::Low));
    assert_eq!(info.due_in, Some(Duration::from_secs(90)));

    scheduler.enqueue(&repo, PriorityClass::Manual, "user");
    let info = scheduler.info(repo.id);
    assert_eq!(info.priority_class, Some(PriorityClass::Manual));
    assert_eq!(info.due_in, Some(Duration::ZERO));
    assert_eq!(info.position, Some(0));
}

#[tokio::test]
async fn test_changeset_syncs_share_the_worker_pool() {
    let clock = Arc::new(ManualClock::new());
    let scheduler = Scheduler::new(config(2), clock).unwrap();
    let backend = Arc::new(MockBackend::new());
    let handle = scheduler.start(backend.clone(), Arc::new(LogSyncTracker));

    let first = scheduler.enqueue_changeset_sync(&[ChangesetId(1), ChangesetId(2)], PriorityClass::Manual);
    scheduler.enqueue(&RepoRecord::new(1, "r", "h"), PriorityClass::Normal, "test");

    wait_for(|| scheduler.stats().syncs_succeeded >= 1 && scheduler.stats().succeeded == 1).await;
    let synced: Vec<ChangesetId> = backend.sync_calls().concat();
    assert!(synced.contains(&ChangesetId(1)));
    assert!(synced.contains(&ChangesetId(2)));
    assert!(first.created);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_remove_then_reenqueue_during_attempt_never_overlaps() {
    let clock = Arc::new(ManualClock::new());
    let scheduler = Scheduler::new(config(2), clock).unwrap();
    let gate = Arc::new(Semaphore::new(0));
    let backend = Arc::new(MockBackend::new().with_gate(gate.clone()));
    let repo = RepoRecord::new(12, "github.com/org/moving", "github.com");

    let handle = scheduler.start(backend.clone(), Arc::new(LogSyncTracker));
    scheduler.enqueue(&repo, PriorityClass::Manual, "test");
    wait_for(|| backend.active() == 1).await;

    assert!(scheduler.remove(repo.id));
    assert!(!scheduler.info(repo.id).in_schedule);
    scheduler.enqueue(&repo, PriorityClass::Manual, "re-added");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(backend.call_count(repo.id), 1);
    assert_eq!(backend.active(), 1);

    gate.add_permits(2);
    wait_for(|| scheduler.stats().succeeded == 2).await;
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert_eq!(backend.call_count(repo.id), 2);
    assert_eq!(backend.max_active(), 1);
    assert!(scheduler.info(repo.id).in_schedule);
    assert_eq!(scheduler.stats().tracked, 1);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_follow_up_sync_waits_for_running_sync_of_same_changeset() {
    let clock = Arc::new(ManualClock::new());
    let scheduler = Scheduler::new(config(2), clock).unwrap();
    let gate = Arc::new(Semaphore::new(0));
    let backend = Arc::new(MockBackend::new().with_gate(gate.clone()));
    let handle = scheduler.start(backend.clone(), Arc::new(LogSyncTracker));

    scheduler.enqueue_changeset_sync(&[ChangesetId(7)], PriorityClass::Manual);
    wait_for(|| backend.active() == 1).await;

    let follow_up = scheduler.enqueue_changeset_sync(&[ChangesetId(7)], PriorityClass::Manual);
    assert!(follow_up.created);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(backend.sync_calls().len(), 1);
    assert_eq!(scheduler.stats().syncs_queued, 1);

    gate.add_permits(2);
    wait_for(|| scheduler.stats().syncs_succeeded == 2).await;

    assert_eq!(backend.sync_calls(), vec![vec![ChangesetId(7)], vec![ChangesetId(7)]]);
    assert_eq!(backend.max_active(), 1);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_reclone_waits_for_host_capacity() {
    let clock = Arc::new(ManualClock::new());
    let config = config(2).with_fairness(FairnessConfig::new(1));
    let scheduler = Scheduler::new(config, clock).unwrap();
    let gate = Arc::new(Semaphore::new(0));
    let backend = Arc::new(MockBackend::new().with_gate(gate.clone()));
    let busy = RepoRecord::new(1, "github.com/org/busy", "github.com");
    let broken = RepoRecord::new(2, "github.com/org/broken", "github.com");

    let handle = scheduler.start(backend.clone(), Arc::new(LogSyncTracker));
    scheduler.enqueue(&busy, PriorityClass::Manual, "test");
    wait_for(|| backend.active() == 1).await;

    scheduler.reclone(&broken, "corrupt").unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(backend.active(), 1);
    assert_eq!(backend.call_count(broken.id), 0);
    assert!(scheduler.info(broken.id).reclone_pending);
    assert_eq!(scheduler.stats().reclones, 0);

    gate.add_permits(2);
    wait_for(|| scheduler.stats().succeeded == 2).await;

    assert_eq!(
        backend.calls(),
        vec![(busy.id, OperationKind::Update), (broken.id, OperationKind::Reclone)]
    );
    assert_eq!(backend.max_active(), 1);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_failed_sync_is_reported_once_and_dropped() {
    let clock = Arc::new(ManualClock::new());
    let scheduler = Scheduler::new(config(1), clock).unwrap();
    let backend = Arc::new(MockBackend::new());
    backend.set_fail_syncs(true);
    let (tx, mut rx) = mpsc::unbounded_channel();

    let handle = scheduler.start(backend.clone(), Arc::new(ChannelTracker(tx)));
    let queued = scheduler.enqueue_changeset_sync(&[ChangesetId(3), ChangesetId(4)], PriorityClass::Normal);

    let report = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.batch_id, queued.batch_id);
    assert_eq!(report.changesets, vec![ChangesetId(3), ChangesetId(4)]);
    assert!(!report.success);
    assert!(report.error_detail.is_some());

    tokio::time::sleep(Duration::from_millis(50)).await;
    let stats = scheduler.stats();
    assert_eq!(stats.syncs_failed, 1);
    assert_eq!(stats.syncs_queued, 0);
    assert_eq!(stats.syncs_in_flight, 0);
    assert_eq!(backend.sync_calls().len(), 1);
    assert!(rx.try_recv().is_err());

    handle.shutdown().await;
}
