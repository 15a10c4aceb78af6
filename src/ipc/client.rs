//! IPC client used by the CLI to talk to a running daemon.
//!
//! Requests are written as JSON lines; a reader task matches responses to
//! pending requests by id, so one connection can carry concurrent requests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::{Mutex, oneshot};

use crate::domain::{ChangesetId, PriorityClass, RepoId, RepoRef};
use crate::error::{Result, UpdaterError};
use crate::ipc::messages::{DaemonRequest, DaemonResponse, Methods};
use crate::scheduler::SchedulerStats;
use crate::service::{
    EnqueueChangesetSyncRequest, EnqueueChangesetSyncResponse, EnqueueRepoUpdateRequest, EnqueueRepoUpdateResponse,
    RecloneRepositoryRequest, RecloneRepositoryResponse, SchedulerInfoRequest, SchedulerInfoResponse,
};

/// Configuration for IPC client.
#[derive(Debug, Clone)]
pub struct IpcClientConfig {
    /// Path to daemon Unix socket.
    pub socket_path: PathBuf,
    /// Request timeout in milliseconds.
    pub request_timeout_ms: u64,
}

impl Default for IpcClientConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/tmp/repo-updater.sock"),
            request_timeout_ms: 30000,
        }
    }
}

impl IpcClientConfig {
    pub fn with_socket(path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: path.into(),
            ..Default::default()
        }
    }
}

type PendingMap = HashMap<u64, oneshot::Sender<DaemonResponse>>;

/// IPC client for communicating with the daemon.
pub struct IpcClient {
    config: IpcClientConfig,
    writer: Mutex<Option<tokio::io::WriteHalf<UnixStream>>>,
    pending: Arc<Mutex<PendingMap>>,
    next_id: AtomicU64,
    connected: Arc<AtomicBool>,
}

impl IpcClient {
    pub fn new(config: IpcClientConfig) -> Self {
        Self {
            config,
            writer: Mutex::new(None),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_socket(path: impl Into<PathBuf>) -> Self {
        Self::new(IpcClientConfig::with_socket(path))
    }

    /// Connect to the daemon and start the response reader.
    pub async fn connect(&self) -> Result<()> {
        let stream = UnixStream::connect(&self.config.socket_path)
            .await
            .map_err(|e| UpdaterError::Ipc(format!("Failed to connect to {}: {}", self.config.socket_path.display(), e)))?;

        let (reader, writer) = tokio::io::split(stream);
        *self.writer.lock().await = Some(writer);
        self.connected.store(true, Ordering::SeqCst);

        let pending = Arc::clone(&self.pending);
        let connected = Arc::clone(&self.connected);

        tokio::spawn(async move {
            let mut reader = BufReader::new(reader);
            let mut line = String::new();

            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<DaemonResponse>(line) {
                            Ok(response) => {
                                if let Some(sender) = pending.lock().await.remove(&response.id) {
                                    let _ = sender.send(response);
                                }
                            }
                            Err(e) => tracing::debug!(error = %e, "Ignoring unparseable daemon message"),
                        }
                    }
                }
            }

            connected.store(false, Ordering::SeqCst);
            // Dropping the senders wakes every waiter with a closed-channel error
            pending.lock().await.clear();
        });

        Ok(())
    }

    pub async fn disconnect(&self) {
        *self.writer.lock().await = None;
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn socket_path(&self) -> &Path {
        &self.config.socket_path
    }

    /// Send a request and wait for its response.
    pub async fn request(&self, method: &str, params: serde_json::Value) -> Result<DaemonResponse> {
        if !self.is_connected() {
            return Err(UpdaterError::Ipc("Not connected".into()));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = DaemonRequest::new(id, method, params);

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let mut json = serde_json::to_string(&request)?;
        json.push('\n');
        {
            let mut writer = self.writer.lock().await;
            let Some(w) = writer.as_mut() else {
                self.pending.lock().await.remove(&id);
                return Err(UpdaterError::Ipc("Writer not available".into()));
            };
            w.write_all(json.as_bytes())
                .await
                .map_err(|e| UpdaterError::Ipc(format!("Failed to write: {}", e)))?;
            w.flush()
                .await
                .map_err(|e| UpdaterError::Ipc(format!("Failed to flush: {}", e)))?;
        }

        let timeout = tokio::time::Duration::from_millis(self.config.request_timeout_ms);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(UpdaterError::Ipc("Connection closed before response".into())),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(UpdaterError::Ipc("Request timeout".into()))
            }
        }
    }

    /// Send a request and decode the result, mapping error codes back to library errors.
    pub async fn call<P: Serialize, R: DeserializeOwned>(&self, method: &str, params: &P) -> Result<R> {
        let response = self.request(method, serde_json::to_value(params)?).await?;
        if let Some(error) = response.error {
            return Err(error.into_updater_error());
        }
        let result = response.result.unwrap_or(serde_json::Value::Null);
        Ok(serde_json::from_value(result)?)
    }

    pub async fn ping(&self) -> Result<bool> {
        let response = self.request(Methods::PING, serde_json::json!({})).await?;
        Ok(response.is_success())
    }

    pub async fn scheduler_info(&self, repo_id: RepoId) -> Result<SchedulerInfoResponse> {
        self.call(Methods::SCHEDULER_INFO, &SchedulerInfoRequest { repo_id }).await
    }

    pub async fn enqueue_update(&self, repo: RepoRef, priority: PriorityClass) -> Result<EnqueueRepoUpdateResponse> {
        self.call(Methods::ENQUEUE_UPDATE, &EnqueueRepoUpdateRequest { repo, priority })
            .await
    }

    pub async fn reclone(&self, repo_id: RepoId, reason: Option<String>) -> Result<RecloneRepositoryResponse> {
        self.call(Methods::RECLONE, &RecloneRepositoryRequest { repo_id, reason })
            .await
    }

    pub async fn enqueue_changeset_sync(&self, ids: Vec<ChangesetId>) -> Result<EnqueueChangesetSyncResponse> {
        self.call(Methods::ENQUEUE_CHANGESET_SYNC, &EnqueueChangesetSyncRequest { ids })
            .await
    }

    pub async fn stats(&self) -> Result<SchedulerStats> {
        self.call(Methods::STATS, &serde_json::json!({})).await
    }
}
