//! libSQL store with serialized access.
//!
//! All DB access is serialized through one connection behind an async mutex.
//! A `StoreTx` holds that mutex for its whole lifetime, so a transaction is
//! never interleaved with another transaction or with a read, and readers
//! never observe a half-applied state change.

use std::ops::Deref;
use std::path::Path;
use std::sync::Arc;

use libsql::{Connection, Database as LibSqlDatabase, Transaction};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::store::migrations;

/// Shared handle to the coordination database.
pub struct Store {
    // Keeps the database alive for the lifetime of the connection.
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    DatabaseError::Pool(format!("Failed to create database directory: {e}"))
                })?;
            }
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let store = Self::from_database(db).await?;
        info!(path = %path.display(), "Database opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        conn.execute("PRAGMA foreign_keys = ON", ())
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to enable foreign keys: {e}")))?;
        migrations::run_migrations(&conn).await?;

        Ok(Self {
            db: Arc::new(db),
            conn: Mutex::new(conn),
        })
    }

    /// Exclusive access for reads.
    pub async fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().await
    }

    /// Begin a transaction. Nothing else touches the database until it is
    /// committed, rolled back or dropped.
    pub async fn begin(&self) -> Result<StoreTx<'_>, DatabaseError> {
        let guard = self.conn.lock().await;
        let tx = guard
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("begin transaction: {e}")))?;
        Ok(StoreTx { _guard: guard, tx })
    }

    /// Cheap liveness probe for the health endpoint.
    pub async fn ping(&self) -> Result<(), DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query("SELECT 1", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("ping: {e}")))?;
        rows.next()
            .await
            .map_err(|e| DatabaseError::Query(format!("ping row: {e}")))?;
        Ok(())
    }
}

/// An open transaction holding the store's access gate.
pub struct StoreTx<'a> {
    _guard: MutexGuard<'a, Connection>,
    tx: Transaction,
}

impl StoreTx<'_> {
    pub async fn commit(self) -> Result<(), DatabaseError> {
        self.tx
            .commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("commit: {e}")))?;
        debug!("Transaction committed");
        Ok(())
    }

    pub async fn rollback(self) -> Result<(), DatabaseError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| DatabaseError::Query(format!("rollback: {e}")))?;
        debug!("Transaction rolled back");
        Ok(())
    }
}

impl Deref for StoreTx<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.tx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn count_tasks(conn: &Connection) -> i64 {
        let mut rows = conn.query("SELECT COUNT(*) FROM tasks", ()).await.unwrap();
        rows.next().await.unwrap().unwrap().get(0).unwrap()
    }

    const INSERT: &str = "INSERT INTO tasks (id, title, created_at, updated_at)
                          VALUES ('t1', 'x', '2026-01-01T00:00:00.000Z', '2026-01-01T00:00:00.000Z')";

    #[tokio::test]
    async fn commit_persists() {
        let store = Store::new_memory().await.unwrap();
        let tx = store.begin().await.unwrap();
        tx.execute(INSERT, ()).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(count_tasks(&*store.conn().await).await, 1);
    }

    #[tokio::test]
    async fn rollback_discards() {
        let store = Store::new_memory().await.unwrap();
        let tx = store.begin().await.unwrap();
        tx.execute(INSERT, ()).await.unwrap();
        tx.rollback().await.unwrap();

        assert_eq!(count_tasks(&*store.conn().await).await, 0);
    }

    #[tokio::test]
    async fn local_file_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("neona.db");
        {
            let store = Store::new_local(&path).await.unwrap();
            store.conn().await.execute(INSERT, ()).await.unwrap();
        }
        let store = Store::new_local(&path).await.unwrap();
        assert_eq!(count_tasks(&*store.conn().await).await, 1);
        store.ping().await.unwrap();
    }
}
