//! Domain types for repo-updater
//!
//! - repo: repository identity, priority classes and schedule entry states
//! - fetch: execution backend operation kinds and results
//! - changeset: changeset and sync batch identifiers

pub mod changeset;
pub mod fetch;
pub mod repo;

pub use changeset::{BatchId, ChangesetId};
pub use fetch::{FetchResult, OperationKind};
pub use repo::{EntryState, HostId, PriorityClass, RepoId, RepoName, RepoRecord, RepoRef};
