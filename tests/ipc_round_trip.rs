//! Daemon surface over a real Unix socket
//!
//! Service + router + server + client wired the way `repo-updater serve`
//! wires them, with the mock backend in place of git.

use std::sync::Arc;
use std::time::Duration;

use repo_updater::backend::MockBackend;
use repo_updater::domain::{ChangesetId, PriorityClass, RepoId, RepoName, RepoRecord, RepoRef};
use repo_updater::ipc::{IpcClient, IpcServer, IpcServerConfig, ServiceRouter};
use repo_updater::scheduler::{LogSyncTracker, ManualClock, Scheduler, SchedulerConfig};
use repo_updater::service::RepoUpdaterService;
use repo_updater::store::{MemoryRepoStore, RepoStore};
use tempfile::tempdir;
use tokio::sync::oneshot;

fn seeded_store() -> Arc<dyn RepoStore> {
    Arc::new(MemoryRepoStore::with_records([
        RepoRecord::new(1, "github.com/org/alpha", "github.com"),
        RepoRecord::new(2, "github.com/org/beta", "github.com"),
    ]))
}

async fn connect(client: &IpcClient) {
    for _ in 0..100 {
        if client.connect().await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("daemon socket never came up");
}

#[tokio::test]
async fn test_rpc_operations_end_to_end() {
    let dir = tempdir().unwrap();
    let socket_path = dir.path().join("repo-updater.sock");

    let config = SchedulerConfig::default()
        .with_workers(2)
        .with_poll_interval(Duration::from_millis(10));
    let scheduler = Scheduler::new(config, Arc::new(ManualClock::new())).unwrap();
    let service = Arc::new(RepoUpdaterService::new(scheduler.clone(), seeded_store()));
    let backend = Arc::new(MockBackend::new());
    let dispatcher = scheduler.start(backend.clone(), Arc::new(LogSyncTracker));

    let server = Arc::new(IpcServer::with_config(
        IpcServerConfig::default().with_socket_path(&socket_path),
    ));
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server_task = {
        let server = server.clone();
        let router = Arc::new(ServiceRouter::new(service.clone()));
        tokio::spawn(async move {
            server
                .run(router, async {
                    let _ = stop_rx.await;
                })
                .await
        })
    };

    let client = IpcClient::with_socket(&socket_path);
    connect(&client).await;
    assert!(client.ping().await.unwrap());

    // Known to the store, not yet scheduled
    let info = client.scheduler_info(RepoId(1)).await.unwrap();
    assert!(!info.in_schedule);

    let enqueued = client
        .enqueue_update(RepoRef::Name(RepoName::new("github.com/org/alpha")), PriorityClass::Manual)
        .await
        .unwrap();
    assert_eq!(enqueued.id, RepoId(1));

    for _ in 0..200 {
        if backend.call_count(RepoId(1)) == 1 && client.stats().await.unwrap().succeeded == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let info = client.scheduler_info(RepoId(1)).await.unwrap();
    assert!(info.in_schedule);
    assert!(!info.updating);
    assert_eq!(info.priority_class, Some(PriorityClass::Normal));
    assert_eq!(info.seconds_until_due, Some(60));

    // Unknown repositories surface as not found
    let err = client.scheduler_info(RepoId(99)).await.unwrap_err();
    assert!(err.is_not_found());
    let err = client.reclone(RepoId(99), None).await.unwrap_err();
    assert!(err.is_not_found());

    let reclone = client.reclone(RepoId(2), Some("corrupt pack".to_string())).await.unwrap();
    assert_eq!(reclone.repo_id, RepoId(2));

    let sync = client
        .enqueue_changeset_sync(vec![ChangesetId(10), ChangesetId(11)])
        .await
        .unwrap();
    assert!(sync.merged.is_empty());

    let err = client.enqueue_changeset_sync(vec![]).await.unwrap_err();
    assert!(!err.is_not_found());
    assert!(!err.is_conflict());

    for _ in 0..200 {
        let stats = client.stats().await.unwrap();
        if stats.reclones == 1 && stats.syncs_succeeded == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let stats = client.stats().await.unwrap();
    assert_eq!(stats.reclones, 1);
    assert_eq!(stats.syncs_succeeded, 1);
    assert_eq!(stats.tracked, 2);

    client.disconnect().await;
    stop_tx.send(()).unwrap();
    server_task.await.unwrap().unwrap();
    dispatcher.shutdown().await;
    assert!(!socket_path.exists());
}

#[tokio::test]
async fn test_sqlite_store_survives_restart() {
    use repo_updater::store::SqliteRepoStore;

    let dir = tempdir().unwrap();
    let db_path = dir.path().join("state").join("repos.db");

    {
        let store: Arc<dyn RepoStore> = Arc::new(SqliteRepoStore::open(&db_path).unwrap());
        let scheduler = Scheduler::new(SchedulerConfig::default(), Arc::new(ManualClock::new())).unwrap();
        let service = RepoUpdaterService::new(scheduler, store);
        service
            .track(RepoRecord::new(7, "gitlab.com/org/kept", "gitlab.com").with_url("https://gitlab.com/org/kept"))
            .unwrap();
    }

    let store: Arc<dyn RepoStore> = Arc::new(SqliteRepoStore::open(&db_path).unwrap());
    let scheduler = Scheduler::new(SchedulerConfig::default(), Arc::new(ManualClock::new())).unwrap();
    let service = RepoUpdaterService::new(scheduler.clone(), store);
    assert_eq!(service.schedule_known().unwrap(), 1);

    let info = scheduler.info(RepoId(7));
    assert!(info.in_schedule);
    assert_eq!(service.list().unwrap()[0].url, "https://gitlab.com/org/kept");
}
