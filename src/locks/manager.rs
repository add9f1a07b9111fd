//! Task and path locks.
//!
//! Locks live in the same database as tasks and are only ever touched inside
//! the caller's transaction, so acquisition is all-or-nothing: on conflict
//! the caller rolls back and nothing was taken. Every lock carries an expiry;
//! a lock is live while `now <= expires_at`.

use chrono::{DateTime, Utc};
use libsql::{Connection, params};
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{CoordinationError, DatabaseError};
use crate::locks::pattern::PathPattern;
use crate::store::rows::{fmt_ts, parse_datetime, parse_uuid};

/// A lock as reported by `GET /locks`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockInfo {
    /// `task` or `path`.
    pub kind: &'static str,
    /// Task id for task locks, the pattern for path locks.
    pub resource: String,
    pub task_id: Uuid,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

struct HeldPath {
    pattern: String,
    task_id: Uuid,
    holder: String,
}

/// Acquire the task lock plus every path lock for `task_id`, or none of them.
pub async fn acquire_all(
    conn: &Connection,
    task_id: Uuid,
    holder: &str,
    paths: &[PathPattern],
    now: DateTime<Utc>,
    expires_at: DateTime<Utc>,
) -> Result<(), CoordinationError> {
    purge_expired(conn, now).await?;

    if let Some(current) = task_lock_holder(conn, task_id).await? {
        if current != holder {
            return Err(CoordinationError::LockConflict {
                resource: format!("task {task_id}"),
                holder: current,
            });
        }
    }

    let held = held_paths(conn, task_id).await?;
    for wanted in paths {
        for existing in &held {
            let overlaps = match PathPattern::parse(&existing.pattern) {
                Ok(existing_pattern) => wanted.conflicts_with(&existing_pattern),
                Err(e) => {
                    // Unparsable rows can only come from outside the daemon.
                    warn!(pattern = %existing.pattern, error = %e, "Treating unparsable path lock as conflicting");
                    true
                }
            };
            if overlaps {
                return Err(CoordinationError::LockConflict {
                    resource: format!("path {wanted} (overlaps {} held for task {})", existing.pattern, existing.task_id),
                    holder: existing.holder.clone(),
                });
            }
        }
    }

    conn.execute(
        "INSERT OR REPLACE INTO task_locks (task_id, holder, acquired_at, expires_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![task_id.to_string(), holder, fmt_ts(now), fmt_ts(expires_at)],
    )
    .await
    .map_err(|e| DatabaseError::Query(format!("acquire task lock: {e}")))?;

    for pattern in paths {
        conn.execute(
            "INSERT OR REPLACE INTO path_locks (pattern, task_id, holder, acquired_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                pattern.as_str(),
                task_id.to_string(),
                holder,
                fmt_ts(now),
                fmt_ts(expires_at)
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("acquire path lock: {e}")))?;
    }

    debug!(task_id = %task_id, holder, paths = paths.len(), "Locks acquired");
    Ok(())
}

/// Drop every lock held for a task. Returns how many rows were removed.
pub async fn release_all(conn: &Connection, task_id: Uuid) -> Result<u64, DatabaseError> {
    let id = task_id.to_string();
    let tasks = conn
        .execute("DELETE FROM task_locks WHERE task_id = ?1", params![id.as_str()])
        .await
        .map_err(|e| DatabaseError::Query(format!("release task lock: {e}")))?;
    let paths = conn
        .execute("DELETE FROM path_locks WHERE task_id = ?1", params![id.as_str()])
        .await
        .map_err(|e| DatabaseError::Query(format!("release path locks: {e}")))?;
    debug!(task_id = %task_id, released = tasks + paths, "Locks released");
    Ok(tasks + paths)
}

/// Move the expiry of every lock held for a task (heartbeat).
pub async fn extend(
    conn: &Connection,
    task_id: Uuid,
    expires_at: DateTime<Utc>,
) -> Result<(), DatabaseError> {
    let id = task_id.to_string();
    let at = fmt_ts(expires_at);
    conn.execute(
        "UPDATE task_locks SET expires_at = ?2 WHERE task_id = ?1",
        params![id.as_str(), at.as_str()],
    )
    .await
    .map_err(|e| DatabaseError::Query(format!("extend task lock: {e}")))?;
    conn.execute(
        "UPDATE path_locks SET expires_at = ?2 WHERE task_id = ?1",
        params![id.as_str(), at.as_str()],
    )
    .await
    .map_err(|e| DatabaseError::Query(format!("extend path locks: {e}")))?;
    Ok(())
}

/// Every lock that is still live at `now`.
pub async fn live_locks(conn: &Connection, now: DateTime<Utc>) -> Result<Vec<LockInfo>, DatabaseError> {
    let mut rows = conn
        .query(
            "SELECT 'task', task_id, task_id, holder, acquired_at, expires_at
               FROM task_locks WHERE expires_at >= ?1
             UNION ALL
             SELECT 'path', pattern, task_id, holder, acquired_at, expires_at
               FROM path_locks WHERE expires_at >= ?1
             ORDER BY 5",
            params![fmt_ts(now)],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("live_locks: {e}")))?;

    let get_err = |e: libsql::Error| DatabaseError::Query(format!("live_locks row: {e}"));
    let mut locks = Vec::new();
    while let Some(row) = rows.next().await.map_err(get_err)? {
        let kind: String = row.get(0).map_err(get_err)?;
        let task_id: String = row.get(2).map_err(get_err)?;
        let acquired: String = row.get(4).map_err(get_err)?;
        let expires: String = row.get(5).map_err(get_err)?;
        locks.push(LockInfo {
            kind: if kind == "task" { "task" } else { "path" },
            resource: row.get(1).map_err(get_err)?,
            task_id: parse_uuid(&task_id)?,
            holder: row.get(3).map_err(get_err)?,
            acquired_at: parse_datetime(&acquired)?,
            expires_at: parse_datetime(&expires)?,
        });
    }
    Ok(locks)
}

async fn purge_expired(conn: &Connection, now: DateTime<Utc>) -> Result<(), DatabaseError> {
    let now = fmt_ts(now);
    conn.execute("DELETE FROM task_locks WHERE expires_at < ?1", params![now.as_str()])
        .await
        .map_err(|e| DatabaseError::Query(format!("purge task locks: {e}")))?;
    conn.execute("DELETE FROM path_locks WHERE expires_at < ?1", params![now.as_str()])
        .await
        .map_err(|e| DatabaseError::Query(format!("purge path locks: {e}")))?;
    Ok(())
}

async fn task_lock_holder(conn: &Connection, task_id: Uuid) -> Result<Option<String>, DatabaseError> {
    let mut rows = conn
        .query(
            "SELECT holder FROM task_locks WHERE task_id = ?1",
            params![task_id.to_string()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("task_lock_holder: {e}")))?;
    let get_err = |e: libsql::Error| DatabaseError::Query(format!("task_lock_holder row: {e}"));
    match rows.next().await.map_err(get_err)? {
        Some(row) => Ok(Some(row.get(0).map_err(get_err)?)),
        None => Ok(None),
    }
}

/// Path locks held by tasks other than `task_id`.
async fn held_paths(conn: &Connection, task_id: Uuid) -> Result<Vec<HeldPath>, DatabaseError> {
    let mut rows = conn
        .query(
            "SELECT pattern, task_id, holder FROM path_locks WHERE task_id != ?1",
            params![task_id.to_string()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("held_paths: {e}")))?;

    let get_err = |e: libsql::Error| DatabaseError::Query(format!("held_paths row: {e}"));
    let mut held = Vec::new();
    while let Some(row) = rows.next().await.map_err(get_err)? {
        let owner: String = row.get(1).map_err(get_err)?;
        held.push(HeldPath {
            pattern: row.get(0).map_err(get_err)?,
            task_id: parse_uuid(&owner)?,
            holder: row.get(2).map_err(get_err)?,
        });
    }
    Ok(held)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use chrono::Duration;

    fn pats(list: &[&str]) -> Vec<PathPattern> {
        list.iter().map(|p| PathPattern::parse(p).unwrap()).collect()
    }

    #[tokio::test]
    async fn overlapping_paths_conflict_across_tasks() {
        let store = Store::new_memory().await.unwrap();
        let conn = store.conn().await;
        let now = Utc::now();
        let later = now + Duration::seconds(30);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        acquire_all(&conn, a, "w1", &pats(&["src/**"]), now, later).await.unwrap();
        let err = acquire_all(&conn, b, "w1", &pats(&["src/lib.rs"]), now, later)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinationError::LockConflict { ref holder, .. } if holder == "w1"));

        acquire_all(&conn, b, "w2", &pats(&["docs/**"]), now, later).await.unwrap();
        assert_eq!(live_locks(&conn, now).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn expired_locks_do_not_conflict() {
        let store = Store::new_memory().await.unwrap();
        let conn = store.conn().await;
        let now = Utc::now();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        acquire_all(&conn, a, "w1", &pats(&["src/**"]), now, now + Duration::seconds(30))
            .await
            .unwrap();

        let later = now + Duration::seconds(31);
        acquire_all(&conn, b, "w2", &pats(&["src/**"]), later, later + Duration::seconds(30))
            .await
            .unwrap();
        let live = live_locks(&conn, later).await.unwrap();
        assert!(live.iter().all(|l| l.task_id == b));
    }

    #[tokio::test]
    async fn task_lock_conflicts_with_other_holder() {
        let store = Store::new_memory().await.unwrap();
        let conn = store.conn().await;
        let now = Utc::now();
        let later = now + Duration::seconds(30);
        let task = Uuid::new_v4();

        acquire_all(&conn, task, "w1", &[], now, later).await.unwrap();
        let err = acquire_all(&conn, task, "w2", &[], now, later).await.unwrap_err();
        assert!(matches!(err, CoordinationError::LockConflict { .. }));
    }

    #[tokio::test]
    async fn release_and_extend() {
        let store = Store::new_memory().await.unwrap();
        let conn = store.conn().await;
        let now = Utc::now();
        let task = Uuid::new_v4();

        acquire_all(&conn, task, "w1", &pats(&["a/**", "b/**"]), now, now + Duration::seconds(10))
            .await
            .unwrap();
        extend(&conn, task, now + Duration::seconds(60)).await.unwrap();
        assert_eq!(live_locks(&conn, now + Duration::seconds(30)).await.unwrap().len(), 3);

        assert_eq!(release_all(&conn, task).await.unwrap(), 3);
        assert!(live_locks(&conn, now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unreadable_lock_rows_are_errors() {
        let store = Store::new_memory().await.unwrap();
        let conn = store.conn().await;
        let now = Utc::now();
        let task = Uuid::new_v4();

        // A blob holder can't be read back as text.
        conn.execute(
            "INSERT INTO task_locks (task_id, holder, acquired_at, expires_at) VALUES (?1, X'FF', ?2, ?3)",
            params![task.to_string(), fmt_ts(now), fmt_ts(now + Duration::seconds(60))],
        )
        .await
        .unwrap();
        let err = acquire_all(&conn, task, "w1", &[], now, now + Duration::seconds(30))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinationError::Database(_)));
        conn.execute("DELETE FROM task_locks", ()).await.unwrap();

        // A corrupt expiry is reported, not read as long expired.
        conn.execute(
            "INSERT INTO path_locks (pattern, task_id, holder, acquired_at, expires_at)
             VALUES ('docs/**', ?1, 'w2', ?2, 'not-a-time')",
            params![Uuid::new_v4().to_string(), fmt_ts(now)],
        )
        .await
        .unwrap();
        assert!(matches!(
            live_locks(&conn, now).await,
            Err(DatabaseError::Serialization(_))
        ));
    }
}
