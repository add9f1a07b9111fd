//! Version-tracked database migrations.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "coordination_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                task_type TEXT NOT NULL DEFAULT 'single',
                status TEXT NOT NULL DEFAULT 'queued',
                priority INTEGER NOT NULL DEFAULT 0,
                project TEXT,
                needs_secrets INTEGER NOT NULL DEFAULT 0,
                lock_paths TEXT NOT NULL DEFAULT '[]',
                claimed_by TEXT,
                claimed_at TEXT,
                claim_ttl_secs INTEGER,
                last_heartbeat TEXT,
                policy_ref TEXT,
                evidence TEXT,
                attempts INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 0,
                retry_at TEXT,
                last_error TEXT,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
            CREATE INDEX IF NOT EXISTS idx_tasks_schedule ON tasks(status, priority DESC, created_at);

            CREATE TABLE IF NOT EXISTS task_dependencies (
                task_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                depends_on TEXT NOT NULL,
                PRIMARY KEY (task_id, depends_on)
            );
            CREATE INDEX IF NOT EXISTS idx_task_dependencies_depends_on
                ON task_dependencies(depends_on);

            CREATE TABLE IF NOT EXISTS task_locks (
                task_id TEXT PRIMARY KEY,
                holder TEXT NOT NULL,
                acquired_at TEXT NOT NULL,
                expires_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS path_locks (
                pattern TEXT PRIMARY KEY,
                task_id TEXT NOT NULL,
                holder TEXT NOT NULL,
                acquired_at TEXT NOT NULL,
                expires_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_path_locks_task ON path_locks(task_id);
            CREATE INDEX IF NOT EXISTS idx_path_locks_expires ON path_locks(expires_at);
        "#,
    },
    Migration {
        version: 2,
        name: "decision_ledger",
        sql: r#"
            CREATE TABLE IF NOT EXISTS policy_decisions (
                id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL,
                worker_id TEXT NOT NULL,
                point TEXT NOT NULL,
                decision TEXT NOT NULL,
                policy TEXT NOT NULL,
                reason TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_policy_decisions_task ON policy_decisions(task_id);
            CREATE INDEX IF NOT EXISTS idx_policy_decisions_created ON policy_decisions(created_at);

            CREATE TRIGGER IF NOT EXISTS policy_decisions_no_update
            BEFORE UPDATE ON policy_decisions
            BEGIN
                SELECT RAISE(ABORT, 'policy_decisions is append-only');
            END;
            CREATE TRIGGER IF NOT EXISTS policy_decisions_no_delete
            BEFORE DELETE ON policy_decisions
            BEGIN
                SELECT RAISE(ABORT, 'policy_decisions is append-only');
            END;

            CREATE TABLE IF NOT EXISTS task_transitions (
                id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL,
                from_status TEXT,
                to_status TEXT NOT NULL,
                actor TEXT NOT NULL,
                cause TEXT NOT NULL,
                detail TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_task_transitions_task ON task_transitions(task_id);

            CREATE TRIGGER IF NOT EXISTS task_transitions_no_update
            BEFORE UPDATE ON task_transitions
            BEGIN
                SELECT RAISE(ABORT, 'task_transitions is append-only');
            END;
            CREATE TRIGGER IF NOT EXISTS task_transitions_no_delete
            BEFORE DELETE ON task_transitions
            BEGIN
                SELECT RAISE(ABORT, 'task_transitions is append-only');
            END;
        "#,
    },
    Migration {
        version: 3,
        name: "workers_runs_memory",
        sql: r#"
            CREATE TABLE IF NOT EXISTS worker_instances (
                id TEXT PRIMARY KEY,
                worker_type TEXT NOT NULL DEFAULT 'local',
                labels TEXT NOT NULL DEFAULT '{}',
                capabilities TEXT NOT NULL DEFAULT '[]',
                status TEXT NOT NULL DEFAULT 'online',
                registered_at TEXT NOT NULL,
                last_seen TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS task_runs (
                id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                worker_id TEXT NOT NULL,
                command TEXT NOT NULL,
                args TEXT NOT NULL DEFAULT '[]',
                exit_code INTEGER NOT NULL,
                stdout TEXT NOT NULL DEFAULT '',
                stderr TEXT NOT NULL DEFAULT '',
                started_at TEXT NOT NULL,
                finished_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_task_runs_task ON task_runs(task_id);

            CREATE TABLE IF NOT EXISTS memory_items (
                id TEXT PRIMARY KEY,
                task_id TEXT,
                content TEXT NOT NULL,
                tags TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_memory_items_task ON memory_items(task_id);
        "#,
    },
];

/// Run all pending migrations against the given connection.
///
/// Creates the `_migrations` table if it doesn't exist.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    tracing::debug!(
        version = get_current_version(conn).await?,
        "Database migrations complete"
    );
    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => row.get::<i64>(0).map_err(|e| {
            DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
        }),
        None => Ok(0),
    }
}

/// Record a migration version as applied.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_conn() -> Connection {
        let db = libsql::Builder::new_local(":memory:").build().await.unwrap();
        db.connect().unwrap()
    }

    #[tokio::test]
    async fn applies_all_versions() {
        let conn = memory_conn().await;
        run_migrations(&conn).await.unwrap();
        let last = MIGRATIONS.last().map(|m| m.version).unwrap();
        assert_eq!(get_current_version(&conn).await.unwrap(), last);
    }

    #[tokio::test]
    async fn rerun_is_noop() {
        let conn = memory_conn().await;
        run_migrations(&conn).await.unwrap();
        run_migrations(&conn).await.unwrap();

        let mut rows = conn.query("SELECT COUNT(*) FROM _migrations", ()).await.unwrap();
        let count: i64 = rows.next().await.unwrap().unwrap().get(0).unwrap();
        assert_eq!(count, MIGRATIONS.len() as i64);
    }

    #[tokio::test]
    async fn ledger_rejects_updates_and_deletes() {
        let conn = memory_conn().await;
        run_migrations(&conn).await.unwrap();
        conn.execute(
            "INSERT INTO policy_decisions (id, task_id, worker_id, point, decision, policy, reason, created_at)
             VALUES ('d1', 't1', 'w1', 'pre_claim', 'ALLOW', '{}', 'ok', '2026-01-01T00:00:00.000Z')",
            (),
        )
        .await
        .unwrap();

        assert!(
            conn.execute("UPDATE policy_decisions SET decision = 'BLOCK'", ())
                .await
                .is_err()
        );
        assert!(conn.execute("DELETE FROM policy_decisions", ()).await.is_err());
    }
}
