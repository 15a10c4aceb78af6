//! repo-updater - keeps mirrored repositories fresh
//!
//! Repositories are refetched on a routine cadence, on demand, or recloned
//! from scratch. The scheduler coalesces duplicate requests, orders work by
//! priority class and due time, backs off failing repositories and caps
//! concurrent fetches per code host. Changeset syncs share the same worker
//! pool.

pub mod backend;
pub mod config;
pub mod domain;
pub mod error;
pub mod ipc;
pub mod scheduler;
pub mod service;
pub mod store;

pub use error::{Result, UpdaterError};
