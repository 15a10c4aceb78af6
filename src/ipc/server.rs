//! IPC Server - Unix socket server for the repo-updater daemon
//!
//! Provides:
//! - Unix stream socket listener
//! - Per-connection request loop (one JSON object per line)
//! - Client cap and clean socket removal on shutdown

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

use crate::error::{Result, UpdaterError};
use crate::ipc::messages::{DaemonError, DaemonRequest, DaemonResponse};

/// Configuration for the IPC server
#[derive(Debug, Clone)]
pub struct IpcServerConfig {
    /// Path to the Unix socket
    pub socket_path: PathBuf,
    /// Maximum number of concurrent clients
    pub max_clients: usize,
}

impl Default for IpcServerConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/tmp/repo-updater.sock"),
            max_clients: 16,
        }
    }
}

impl IpcServerConfig {
    pub fn with_socket_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.socket_path = path.as_ref().to_path_buf();
        self
    }

    pub fn with_max_clients(mut self, max: usize) -> Self {
        self.max_clients = max;
        self
    }
}

/// Handler trait for processing requests
pub trait RequestHandler: Send + Sync {
    fn handle(&self, request: DaemonRequest) -> impl Future<Output = DaemonResponse> + Send;
}

/// IPC Server for daemon communication
pub struct IpcServer {
    config: IpcServerConfig,
    clients: Arc<AtomicUsize>,
}

impl IpcServer {
    pub fn new() -> Self {
        Self::with_config(IpcServerConfig::default())
    }

    pub fn with_config(config: IpcServerConfig) -> Self {
        Self {
            config,
            clients: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.config.socket_path
    }

    /// Number of connected clients
    pub fn client_count(&self) -> usize {
        self.clients.load(Ordering::SeqCst)
    }

    /// Bind the socket and serve until `shutdown` completes.
    pub async fn run<H, S>(&self, handler: Arc<H>, shutdown: S) -> Result<()>
    where
        H: RequestHandler + 'static,
        S: Future<Output = ()> + Send,
    {
        // Remove a stale socket left by a previous run
        if self.config.socket_path.exists() {
            std::fs::remove_file(&self.config.socket_path)?;
        }
        if let Some(parent) = self.config.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&self.config.socket_path)
            .map_err(|e| UpdaterError::Ipc(format!("Failed to bind socket: {}", e)))?;
        tracing::info!(socket = %self.config.socket_path.display(), "IPC server listening");

        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, _addr)) => {
                            if self.client_count() >= self.config.max_clients {
                                tracing::warn!(max_clients = self.config.max_clients, "Rejecting client, at capacity");
                                continue;
                            }

                            self.clients.fetch_add(1, Ordering::SeqCst);
                            let handler = Arc::clone(&handler);
                            let clients = Arc::clone(&self.clients);

                            tokio::spawn(async move {
                                if let Err(e) = handle_client(stream, handler).await {
                                    tracing::debug!(error = %e, "Client connection ended with error");
                                }
                                clients.fetch_sub(1, Ordering::SeqCst);
                            });
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "Accept error");
                        }
                    }
                }
                _ = &mut shutdown => {
                    break;
                }
            }
        }

        let _ = std::fs::remove_file(&self.config.socket_path);
        tracing::info!("IPC server stopped");
        Ok(())
    }
}

impl Default for IpcServer {
    fn default() -> Self {
        Self::new()
    }
}

/// Serve one connection until EOF
async fn handle_client<H: RequestHandler>(stream: UnixStream, handler: Arc<H>) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<DaemonRequest>(trimmed) {
            Ok(request) => handler.handle(request).await,
            Err(e) => DaemonResponse::error(0, DaemonError::parse_error(format!("Parse error: {}", e))),
        };

        let mut json = serde_json::to_string(&response)?;
        json.push('\n');
        writer.write_all(json.as_bytes()).await?;
        writer.flush().await?;
    }

    Ok(())
}
