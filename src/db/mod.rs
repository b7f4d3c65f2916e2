use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use tokio::sync::watch;

use crate::errors::{AgentError, Result};

pub mod queries;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Table {
    Settings,
    Downloads,
    Applications,
}

/// Per-table revision counters; every committed write bumps the matching one.
struct ChangeFeed {
    settings: watch::Sender<u64>,
    downloads: watch::Sender<u64>,
    applications: watch::Sender<u64>,
}

impl ChangeFeed {
    fn new() -> Self {
        Self {
            settings: watch::channel(0).0,
            downloads: watch::channel(0).0,
            applications: watch::channel(0).0,
        }
    }

    fn sender(&self, table: Table) -> &watch::Sender<u64> {
        match table {
            Table::Settings => &self.settings,
            Table::Downloads => &self.downloads,
            Table::Applications => &self.applications,
        }
    }
}

#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
    changes: Arc<ChangeFeed>,
}

impl Database {
    pub fn new(path: PathBuf) -> Result<Self> {
        let conn = Connection::open(&path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA temp_store = MEMORY;",
        )?;
        Ok(Self::from_connection(conn, path))
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self::from_connection(conn, PathBuf::from(":memory:"));
        db.run_migrations()?;
        Ok(db)
    }

    fn from_connection(conn: Connection, path: PathBuf) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
            changes: Arc::new(ChangeFeed::new()),
        }
    }

    pub fn run_migrations(&self) -> Result<()> {
        let conn = self.connection()?;
        conn.execute_batch(include_str!("../../migrations/001_initial.sql"))?;
        conn.execute_batch(include_str!("../../migrations/002_downloads.sql"))?;
        Ok(())
    }

    pub fn connection(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AgentError::lock_poisoned("database"))
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Subscribe to write notifications for one table.
    pub fn watch(&self, table: Table) -> watch::Receiver<u64> {
        self.changes.sender(table).subscribe()
    }

    pub(crate) fn notify(&self, table: Table) {
        self.changes
            .sender(table)
            .send_modify(|revision| *revision = revision.wrapping_add(1));
    }
}

pub fn init(root: &Path) -> Result<Database> {
    std::fs::create_dir_all(root)?;
    let db = Database::new(root.join("agent.db"))?;
    db.run_migrations()?;
    Ok(db)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn notify_wakes_only_the_matching_table() {
        let db = Database::in_memory().expect("open db");
        let mut downloads = db.watch(Table::Downloads);
        let applications = db.watch(Table::Applications);

        db.notify(Table::Downloads);

        downloads.changed().await.expect("download revision");
        assert_eq!(*downloads.borrow_and_update(), 1);
        assert!(!applications.has_changed().expect("sender alive"));
    }

    #[test]
    fn migrations_are_idempotent() {
        let db = Database::in_memory().expect("open db");
        db.run_migrations().expect("second migration pass");
        let conn = db.connection().expect("conn");
        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('settings', 'download', 'application')",
                [],
                |row| row.get(0),
            )
            .expect("count tables");
        assert_eq!(tables, 3);
    }
}
