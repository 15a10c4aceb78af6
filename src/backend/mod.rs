//! Execution backend boundary.
//!
//! The scheduler decides *when* a repository is fetched; the backend does
//! the fetching. Every git or network operation happens behind this trait.

mod command;
mod mock;

pub use command::{CommandBackend, CommandBackendConfig};
pub use mock::MockBackend;

use async_trait::async_trait;

use crate::domain::{ChangesetId, FetchResult, OperationKind, RepoId};

/// Runs fetch, reclone and changeset sync operations.
///
/// Implementations report failure through [`FetchResult`] rather than an
/// error; the dispatcher treats every unsuccessful result the same way.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    async fn fetch(&self, repo_id: RepoId, kind: OperationKind) -> FetchResult;

    async fn sync_changesets(&self, ids: &[ChangesetId]) -> FetchResult;
}
