//! Durable repository registry on SQLite.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::domain::{HostId, RepoId, RepoName, RepoRecord};
use crate::error::{Result, UpdaterError};
use crate::store::RepoStore;

/// [`RepoStore`] backed by a single SQLite file.
pub struct SqliteRepoStore {
    db: Mutex<Connection>,
}

impl SqliteRepoStore {
    /// Open or create the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let db = Connection::open(path)?;
        Self::init_schema(&db)?;
        tracing::debug!(path = %path.display(), "Opened repo store");
        Ok(Self { db: Mutex::new(db) })
    }

    /// In-memory database, mostly for tests.
    pub fn open_in_memory() -> Result<Self> {
        let db = Connection::open_in_memory()?;
        Self::init_schema(&db)?;
        Ok(Self { db: Mutex::new(db) })
    }

    fn init_schema(db: &Connection) -> Result<()> {
        db.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS repos (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                host TEXT NOT NULL,
                url TEXT NOT NULL DEFAULT ''
            );

            CREATE INDEX IF NOT EXISTS idx_repos_host ON repos(host);
            "#,
        )
        .map_err(|e| UpdaterError::Store(format!("failed to initialize schema: {}", e)))
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.db.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record_from_row(row: &Row<'_>) -> rusqlite::Result<RepoRecord> {
        Ok(RepoRecord {
            id: RepoId(row.get(0)?),
            name: RepoName(row.get(1)?),
            host: HostId(row.get(2)?),
            url: row.get(3)?,
        })
    }
}

impl RepoStore for SqliteRepoStore {
    fn get(&self, id: RepoId) -> Result<Option<RepoRecord>> {
        let record = self
            .conn()
            .query_row(
                "SELECT id, name, host, url FROM repos WHERE id = ?1",
                params![id.0],
                Self::record_from_row,
            )
            .optional()?;
        Ok(record)
    }

    fn get_by_name(&self, name: &RepoName) -> Result<Option<RepoRecord>> {
        let record = self
            .conn()
            .query_row(
                "SELECT id, name, host, url FROM repos WHERE name = ?1",
                params![name.as_str()],
                Self::record_from_row,
            )
            .optional()?;
        Ok(record)
    }

    fn upsert(&self, record: &RepoRecord) -> Result<()> {
        let conn = self.conn();
        let owner: Option<u32> = conn
            .query_row(
                "SELECT id FROM repos WHERE name = ?1",
                params![record.name.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(owner) = owner
            && owner != record.id.0
        {
            return Err(UpdaterError::Store(format!(
                "name {} already belongs to repo {}",
                record.name, owner
            )));
        }
        conn.execute(
            r#"
            INSERT INTO repos (id, name, host, url) VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(id) DO UPDATE SET name = excluded.name, host = excluded.host, url = excluded.url
            "#,
            params![record.id.0, record.name.as_str(), record.host.as_str(), record.url],
        )?;
        Ok(())
    }

    fn remove(&self, id: RepoId) -> Result<bool> {
        let removed = self.conn().execute("DELETE FROM repos WHERE id = ?1", params![id.0])?;
        Ok(removed > 0)
    }

    fn list(&self) -> Result<Vec<RepoRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT id, name, host, url FROM repos ORDER BY id")?;
        let records = stmt
            .query_map([], Self::record_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RepoRef;
    use tempfile::TempDir;

    #[test]
    fn test_sqlite_store_persists_across_open() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("state").join("repos.db");

        {
            let store = SqliteRepoStore::open(&path).unwrap();
            store
                .upsert(&RepoRecord::new(7, "github.com/a/b", "github.com").with_url("https://github.com/a/b"))
                .unwrap();
        }

        let store = SqliteRepoStore::open(&path).unwrap();
        let record = store.get(RepoId(7)).unwrap().unwrap();
        assert_eq!(record.name.as_str(), "github.com/a/b");
        assert_eq!(record.url, "https://github.com/a/b");
    }

    #[test]
    fn test_sqlite_store_resolve_and_remove() {
        let store = SqliteRepoStore::open_in_memory().unwrap();
        store.upsert(&RepoRecord::new(1, "a", "h1")).unwrap();
        store.upsert(&RepoRecord::new(2, "b", "h2")).unwrap();

        let record = store.resolve(&RepoRef::Name(RepoName::new("b"))).unwrap().unwrap();
        assert_eq!(record.id, RepoId(2));

        assert!(store.remove(RepoId(1)).unwrap());
        assert!(!store.remove(RepoId(1)).unwrap());
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn test_sqlite_store_upsert_replaces() {
        let store = SqliteRepoStore::open_in_memory().unwrap();
        store.upsert(&RepoRecord::new(1, "a", "h1")).unwrap();
        store.upsert(&RepoRecord::new(1, "a", "h2")).unwrap();

        assert_eq!(store.get(RepoId(1)).unwrap().unwrap().host.as_str(), "h2");
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn test_sqlite_store_rejects_name_owned_by_other_id() {
        let store = SqliteRepoStore::open_in_memory().unwrap();
        store.upsert(&RepoRecord::new(1, "a", "h")).unwrap();

        let err = store.upsert(&RepoRecord::new(2, "a", "h")).unwrap_err();
        assert!(matches!(err, UpdaterError::Store(_)));
        assert!(store.get(RepoId(2)).unwrap().is_none());
    }
}
