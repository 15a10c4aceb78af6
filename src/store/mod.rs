//! Repository registry.
//!
//! The scheduler only knows repository ids and hosts. Resolving the names and
//! ids supplied by RPC callers, and the clone URL handed to the execution
//! backend, goes through a [`RepoStore`].

mod sqlite;

pub use sqlite::SqliteRepoStore;

use std::collections::HashMap;
use std::sync::RwLock;

use crate::domain::{RepoId, RepoName, RepoRecord, RepoRef};
use crate::error::{Result, UpdaterError};

/// Lookup and registration of tracked repositories.
pub trait RepoStore: Send + Sync {
    fn get(&self, id: RepoId) -> Result<Option<RepoRecord>>;

    fn get_by_name(&self, name: &RepoName) -> Result<Option<RepoRecord>>;

    /// Insert or replace a record. Fails with [`UpdaterError::Store`] when the
    /// name already belongs to another id.
    fn upsert(&self, record: &RepoRecord) -> Result<()>;

    /// Returns true if a record was removed.
    fn remove(&self, id: RepoId) -> Result<bool>;

    /// All records ordered by id.
    fn list(&self) -> Result<Vec<RepoRecord>>;

    fn resolve(&self, repo: &RepoRef) -> Result<Option<RepoRecord>> {
        match repo {
            RepoRef::Id(id) => self.get(*id),
            RepoRef::Name(name) => self.get_by_name(name),
        }
    }
}

#[derive(Debug, Default)]
struct MemoryInner {
    by_id: HashMap<RepoId, RepoRecord>,
    by_name: HashMap<RepoName, RepoId>,
}

/// In-process store, used when no database path is configured.
#[derive(Debug, Default)]
pub struct MemoryRepoStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryRepoStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with `records`.
    pub fn with_records(records: impl IntoIterator<Item = RepoRecord>) -> Self {
        let store = Self::new();
        {
            let mut inner = store.inner.write().unwrap_or_else(|e| e.into_inner());
            for record in records {
                inner.by_name.insert(record.name.clone(), record.id);
                inner.by_id.insert(record.id, record);
            }
        }
        store
    }
}

impl RepoStore for MemoryRepoStore {
    fn get(&self, id: RepoId) -> Result<Option<RepoRecord>> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        Ok(inner.by_id.get(&id).cloned())
    }

    fn get_by_name(&self, name: &RepoName) -> Result<Option<RepoRecord>> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        Ok(inner.by_name.get(name).and_then(|id| inner.by_id.get(id)).cloned())
    }

    fn upsert(&self, record: &RepoRecord) -> Result<()> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if let Some(owner) = inner.by_name.get(&record.name)
            && *owner != record.id
        {
            return Err(UpdaterError::Store(format!(
                "name {} already belongs to repo {}",
                record.name, owner
            )));
        }
        if let Some(previous) = inner.by_id.insert(record.id, record.clone())
            && previous.name != record.name
        {
            inner.by_name.remove(&previous.name);
        }
        inner.by_name.insert(record.name.clone(), record.id);
        Ok(())
    }

    fn remove(&self, id: RepoId) -> Result<bool> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        match inner.by_id.remove(&id) {
            Some(record) => {
                inner.by_name.remove(&record.name);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn list(&self) -> Result<Vec<RepoRecord>> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let mut records: Vec<RepoRecord> = inner.by_id.values().cloned().collect();
        records.sort_by_key(|r| r.id);
        Ok(records)
    }
}
