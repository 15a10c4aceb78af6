//! IPC Layer - Unix socket transport for the repo-updater daemon
//!
//! This module provides:
//! - Message types for requests and responses
//! - Unix socket server run by `repo-updater serve`
//! - Client used by the CLI subcommands
//! - Router mapping method names onto the service

pub mod client;
pub mod messages;
pub mod router;
pub mod server;

pub use client::{IpcClient, IpcClientConfig};
pub use messages::{DaemonError, DaemonRequest, DaemonResponse, ErrorCode, Methods};
pub use router::ServiceRouter;
pub use server::{IpcServer, IpcServerConfig, RequestHandler};
