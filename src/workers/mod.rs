//! Worker instance registry.
//!
//! Workers register explicitly (`POST /workers`) or implicitly on their
//! first claim. Liveness is derived from `last_seen` on read.

use std::collections::BTreeMap;
use std::sync::LazyLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use libsql::{Connection, params};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::rows::{fmt_ts, from_json, parse_datetime, to_json};
use crate::tasks::model::Task;

/// Worker ids and policy scope names: printable, no whitespace.
static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._:@/-]{0,127}$").unwrap());

pub fn is_valid_identifier(s: &str) -> bool {
    IDENTIFIER.is_match(s)
}

/// Default worker type for workers that never registered.
pub const DEFAULT_WORKER_TYPE: &str = "local";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Online,
    Offline,
    Error,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Error => "error",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "offline" => Self::Offline,
            "error" => Self::Error,
            _ => Self::Online,
        }
    }
}

/// A registered worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerInstance {
    pub id: String,
    /// Connector kind, e.g. `local`, `claude`, `ci`.
    pub worker_type: String,
    pub labels: BTreeMap<String, String>,
    pub capabilities: Vec<String>,
    pub status: WorkerStatus,
    pub registered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Registration request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerRegistration {
    #[serde(alias = "workerID")]
    pub id: String,
    pub worker_type: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub capabilities: Vec<String>,
}

/// A worker plus the tasks it currently holds.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerView {
    #[serde(flatten)]
    pub worker: WorkerInstance,
    pub active_tasks: Vec<Uuid>,
}

/// Response body of `GET /workers`.
#[derive(Debug, Clone, Serialize)]
pub struct WorkersSnapshot {
    pub active_workers: usize,
    pub global_max: usize,
    pub connector_counts: BTreeMap<String, usize>,
    pub workers: Vec<WorkerView>,
}

const WORKER_COLUMNS: &str = "id, worker_type, labels, capabilities, status, registered_at, last_seen";

fn row_to_worker(row: &libsql::Row) -> Result<WorkerInstance, DatabaseError> {
    let get_err = |e: libsql::Error| DatabaseError::Query(format!("worker row: {e}"));
    let labels: String = row.get(2).map_err(get_err)?;
    let capabilities: String = row.get(3).map_err(get_err)?;
    let status: String = row.get(4).map_err(get_err)?;
    let registered_at: String = row.get(5).map_err(get_err)?;
    let last_seen: String = row.get(6).map_err(get_err)?;
    Ok(WorkerInstance {
        id: row.get(0).map_err(get_err)?,
        worker_type: row.get(1).map_err(get_err)?,
        labels: from_json(&labels)?,
        capabilities: from_json(&capabilities)?,
        status: WorkerStatus::parse(&status),
        registered_at: parse_datetime(&registered_at)?,
        last_seen: parse_datetime(&last_seen)?,
    })
}

/// Register or re-register a worker.
pub async fn register(
    conn: &Connection,
    registration: &WorkerRegistration,
    now: DateTime<Utc>,
) -> Result<(), DatabaseError> {
    let worker_type = registration
        .worker_type
        .as_deref()
        .unwrap_or(DEFAULT_WORKER_TYPE);
    conn.execute(
        "INSERT INTO worker_instances (id, worker_type, labels, capabilities, status, registered_at, last_seen)
         VALUES (?1, ?2, ?3, ?4, 'online', ?5, ?5)
         ON CONFLICT(id) DO UPDATE SET
            worker_type = excluded.worker_type,
            labels = excluded.labels,
            capabilities = excluded.capabilities,
            status = 'online',
            last_seen = excluded.last_seen",
        params![
            registration.id.as_str(),
            worker_type,
            to_json(&registration.labels)?,
            to_json(&registration.capabilities)?,
            fmt_ts(now),
        ],
    )
    .await
    .map_err(|e| DatabaseError::Query(format!("register_worker: {e}")))?;
    Ok(())
}

/// Record that a worker was seen, registering it with defaults if unknown.
pub async fn touch(conn: &Connection, worker_id: &str, now: DateTime<Utc>) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO worker_instances (id, worker_type, status, registered_at, last_seen)
         VALUES (?1, ?2, 'online', ?3, ?3)
         ON CONFLICT(id) DO UPDATE SET status = 'online', last_seen = excluded.last_seen",
        params![worker_id, DEFAULT_WORKER_TYPE, fmt_ts(now)],
    )
    .await
    .map_err(|e| DatabaseError::Query(format!("touch_worker: {e}")))?;
    Ok(())
}

pub async fn get(conn: &Connection, worker_id: &str) -> Result<Option<WorkerInstance>, DatabaseError> {
    let mut rows = conn
        .query(
            &format!("SELECT {WORKER_COLUMNS} FROM worker_instances WHERE id = ?1"),
            params![worker_id],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("get_worker: {e}")))?;
    match rows.next().await {
        Ok(Some(row)) => Ok(Some(row_to_worker(&row)?)),
        Ok(None) => Ok(None),
        Err(e) => Err(DatabaseError::Query(format!("get_worker row: {e}"))),
    }
}

/// All workers, with stale ones reported offline.
pub async fn list(
    conn: &Connection,
    now: DateTime<Utc>,
    offline_after: Duration,
) -> Result<Vec<WorkerInstance>, DatabaseError> {
    let mut rows = conn
        .query(
            &format!("SELECT {WORKER_COLUMNS} FROM worker_instances ORDER BY id ASC"),
            (),
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("list_workers: {e}")))?;

    let cutoff = chrono::Duration::from_std(offline_after).unwrap_or(chrono::Duration::MAX);
    let mut workers = Vec::new();
    while let Some(row) = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Query(format!("list_workers row: {e}")))?
    {
        let mut worker = row_to_worker(&row)?;
        if worker.status == WorkerStatus::Online && now - worker.last_seen > cutoff {
            worker.status = WorkerStatus::Offline;
        }
        workers.push(worker);
    }
    Ok(workers)
}

/// Combine the registry with the tasks currently under lease.
pub fn snapshot(workers: Vec<WorkerInstance>, leased: &[Task], global_max: usize) -> WorkersSnapshot {
    let mut by_worker: BTreeMap<&str, Vec<Uuid>> = BTreeMap::new();
    for task in leased {
        if let Some(holder) = task.claimed_by.as_deref() {
            by_worker.entry(holder).or_default().push(task.id);
        }
    }

    let mut connector_counts = BTreeMap::new();
    let mut active_workers = 0;
    let views = workers
        .into_iter()
        .map(|worker| {
            let active_tasks = by_worker.get(worker.id.as_str()).cloned().unwrap_or_default();
            if !active_tasks.is_empty() {
                active_workers += 1;
                *connector_counts.entry(worker.worker_type.clone()).or_insert(0) += 1;
            }
            WorkerView {
                worker,
                active_tasks,
            }
        })
        .collect();

    WorkersSnapshot {
        active_workers,
        global_max,
        connector_counts,
        workers: views,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use crate::store::rows::truncate_ts;
    use crate::tasks::model::{NewTask, TaskStatus};

    #[test]
    fn identifiers() {
        assert!(is_valid_identifier("worker-1"));
        assert!(is_valid_identifier("claude@host:7"));
        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier("has space"));
        assert!(!is_valid_identifier("-leading"));
    }

    #[tokio::test]
    async fn register_then_touch_keeps_type() {
        let store = Store::new_memory().await.unwrap();
        let conn = store.conn().await;
        let now = truncate_ts(Utc::now());

        let reg = WorkerRegistration {
            id: "w1".into(),
            worker_type: Some("claude".into()),
            capabilities: vec!["rust".into()],
            ..Default::default()
        };
        register(&conn, &reg, now).await.unwrap();
        touch(&conn, "w1", now + chrono::Duration::seconds(5)).await.unwrap();

        let w = get(&conn, "w1").await.unwrap().unwrap();
        assert_eq!(w.worker_type, "claude");
        assert_eq!(w.capabilities, vec!["rust".to_string()]);
        assert_eq!(w.last_seen, now + chrono::Duration::seconds(5));
    }

    #[tokio::test]
    async fn stale_workers_read_offline() {
        let store = Store::new_memory().await.unwrap();
        let conn = store.conn().await;
        let now = Utc::now();
        touch(&conn, "old", now - chrono::Duration::seconds(600)).await.unwrap();
        touch(&conn, "fresh", now).await.unwrap();

        let workers = list(&conn, now, Duration::from_secs(120)).await.unwrap();
        let status: BTreeMap<_, _> = workers.iter().map(|w| (w.id.as_str(), w.status)).collect();
        assert_eq!(status["old"], WorkerStatus::Offline);
        assert_eq!(status["fresh"], WorkerStatus::Online);
    }

    #[test]
    fn snapshot_counts_active_workers_by_type() {
        let now = Utc::now();
        let worker = |id: &str, kind: &str| WorkerInstance {
            id: id.into(),
            worker_type: kind.into(),
            labels: BTreeMap::new(),
            capabilities: vec![],
            status: WorkerStatus::Online,
            registered_at: now,
            last_seen: now,
        };
        let mut t = Task::from_new(NewTask::new("t"), 0, now);
        t.status = TaskStatus::Claimed;
        t.claimed_by = Some("a".into());

        let snap = snapshot(vec![worker("a", "local"), worker("b", "claude")], &[t.clone()], 10);
        assert_eq!(snap.active_workers, 1);
        assert_eq!(snap.global_max, 10);
        assert_eq!(snap.connector_counts.get("local"), Some(&1));
        assert_eq!(snap.workers[0].active_tasks, vec![t.id]);
        assert!(snap.workers[1].active_tasks.is_empty());
    }
}
