//! Task rows and dependency edges.
//!
//! Every function takes a `&Connection` so it can run either on a read
//! guard or inside a `StoreTx`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use libsql::{Connection, params};
use tracing::debug;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::rows::{
    fmt_opt_ts, fmt_ts, from_json, parse_datetime, parse_optional_datetime, parse_uuid, to_json,
};
use crate::tasks::model::{Evidence, Task, TaskStatus};

const TASK_COLUMNS: &str = "t.id, t.title, t.description, t.task_type, t.status, t.priority, \
    t.project, t.needs_secrets, t.lock_paths, t.claimed_by, t.claimed_at, t.claim_ttl_secs, \
    t.last_heartbeat, t.policy_ref, t.evidence, t.attempts, t.max_retries, t.retry_at, \
    t.last_error, t.created_at, t.started_at, t.completed_at, t.updated_at";

/// 1 when some dependency of `t` is missing or not done.
const UNMET_DEPS: &str = "EXISTS (SELECT 1 FROM task_dependencies d \
    LEFT JOIN tasks dep ON dep.id = d.depends_on \
    WHERE d.task_id = t.id AND (dep.status IS NULL OR dep.status != 'done'))";

fn select_tasks(filter: &str) -> String {
    format!("SELECT {TASK_COLUMNS}, {UNMET_DEPS} FROM tasks t {filter}")
}

fn row_to_task(row: &libsql::Row) -> Result<Task, DatabaseError> {
    let get_err = |e: libsql::Error| DatabaseError::Query(format!("task row: {e}"));

    let id: String = row.get(0).map_err(get_err)?;
    let task_type: String = row.get(3).map_err(get_err)?;
    let status: String = row.get(4).map_err(get_err)?;
    let lock_paths: String = row.get(8).map_err(get_err)?;
    let evidence: Option<String> = row.get(14).ok();
    let policy_ref: Option<String> = row.get(13).ok();
    let created_at: String = row.get(19).map_err(get_err)?;
    let updated_at: String = row.get(22).map_err(get_err)?;

    let status: TaskStatus = status.parse().map_err(DatabaseError::Serialization)?;
    let unmet: i64 = row.get(23).map_err(get_err)?;

    Ok(Task {
        id: parse_uuid(&id)?,
        title: row.get(1).map_err(get_err)?,
        description: row.get::<String>(2).unwrap_or_default(),
        task_type: task_type.parse().map_err(DatabaseError::Serialization)?,
        status,
        priority: row.get::<i64>(5).map_err(get_err)? as i32,
        project: row.get(6).ok(),
        needs_secrets: row.get::<i64>(7).unwrap_or(0) != 0,
        lock_paths: from_json(&lock_paths)?,
        claimed_by: row.get(9).ok(),
        claimed_at: parse_optional_datetime(&row.get(10).ok())?,
        claim_ttl_secs: row.get::<i64>(11).ok().map(|v| v as u64),
        last_heartbeat: parse_optional_datetime(&row.get(12).ok())?,
        policy_ref: policy_ref.as_deref().map(parse_uuid).transpose()?,
        evidence: evidence.as_deref().map(from_json::<Evidence>).transpose()?,
        attempts: row.get::<i64>(15).unwrap_or(0) as u32,
        max_retries: row.get::<i64>(16).unwrap_or(0) as u32,
        retry_at: parse_optional_datetime(&row.get(17).ok())?,
        last_error: row.get(18).ok(),
        created_at: parse_datetime(&created_at)?,
        started_at: parse_optional_datetime(&row.get(20).ok())?,
        completed_at: parse_optional_datetime(&row.get(21).ok())?,
        updated_at: parse_datetime(&updated_at)?,
        dependencies: Vec::new(),
        blocked: status == TaskStatus::Queued && unmet != 0,
    })
}

async fn collect_tasks(conn: &Connection, mut rows: libsql::Rows) -> Result<Vec<Task>, DatabaseError> {
    let mut tasks = Vec::new();
    while let Some(row) = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Query(format!("task rows: {e}")))?
    {
        tasks.push(row_to_task(&row)?);
    }
    attach_dependencies(conn, &mut tasks).await?;
    Ok(tasks)
}

async fn attach_dependencies(conn: &Connection, tasks: &mut [Task]) -> Result<(), DatabaseError> {
    if tasks.is_empty() {
        return Ok(());
    }
    let mut deps: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
    for (task, depends_on) in dependency_edges(conn).await? {
        deps.entry(task).or_default().push(depends_on);
    }
    for task in tasks.iter_mut() {
        let mut list = deps.remove(&task.id).unwrap_or_default();
        list.sort();
        task.dependencies = list;
    }
    Ok(())
}

/// Insert a new task and its dependency edges.
pub async fn insert_task(conn: &Connection, task: &Task) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO tasks (id, title, description, task_type, status, priority, project,
            needs_secrets, lock_paths, attempts, max_retries, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            task.id.to_string(),
            task.title.as_str(),
            task.description.as_str(),
            task.task_type.as_str(),
            task.status.as_str(),
            task.priority as i64,
            task.project.as_deref(),
            task.needs_secrets as i64,
            to_json(&task.lock_paths)?,
            task.attempts as i64,
            task.max_retries as i64,
            fmt_ts(task.created_at),
            fmt_ts(task.updated_at),
        ],
    )
    .await
    .map_err(|e| match e.to_string() {
        msg if msg.contains("UNIQUE") => {
            DatabaseError::Constraint(format!("task {} already exists", task.id))
        }
        msg => DatabaseError::Query(format!("insert_task: {msg}")),
    })?;

    for dep in &task.dependencies {
        conn.execute(
            "INSERT INTO task_dependencies (task_id, depends_on) VALUES (?1, ?2)",
            params![task.id.to_string(), dep.to_string()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("insert_dependency: {e}")))?;
    }
    debug!(id = %task.id, "Task inserted");
    Ok(())
}

/// Persist every mutable field of a task.
pub async fn update_task(conn: &Connection, task: &Task) -> Result<(), DatabaseError> {
    let evidence = task.evidence.as_ref().map(to_json).transpose()?;
    let changed = conn
        .execute(
            "UPDATE tasks SET status = ?2, claimed_by = ?3, claimed_at = ?4, claim_ttl_secs = ?5,
                last_heartbeat = ?6, policy_ref = ?7, evidence = ?8, attempts = ?9,
                retry_at = ?10, last_error = ?11, started_at = ?12, completed_at = ?13,
                updated_at = ?14
             WHERE id = ?1",
            params![
                task.id.to_string(),
                task.status.as_str(),
                task.claimed_by.as_deref(),
                fmt_opt_ts(task.claimed_at),
                task.claim_ttl_secs.map(|v| v as i64),
                fmt_opt_ts(task.last_heartbeat),
                task.policy_ref.map(|id| id.to_string()),
                evidence,
                task.attempts as i64,
                fmt_opt_ts(task.retry_at),
                task.last_error.as_deref(),
                fmt_opt_ts(task.started_at),
                fmt_opt_ts(task.completed_at),
                fmt_ts(task.updated_at),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("update_task: {e}")))?;

    if changed == 0 {
        return Err(DatabaseError::NotFound {
            entity: "task".into(),
            id: task.id.to_string(),
        });
    }
    Ok(())
}

pub async fn get_task(conn: &Connection, id: Uuid) -> Result<Option<Task>, DatabaseError> {
    let rows = conn
        .query(&select_tasks("WHERE t.id = ?1"), params![id.to_string()])
        .await
        .map_err(|e| DatabaseError::Query(format!("get_task: {e}")))?;
    Ok(collect_tasks(conn, rows).await?.into_iter().next())
}

/// All tasks, oldest first, optionally filtered by status.
pub async fn list_tasks(
    conn: &Connection,
    status: Option<TaskStatus>,
) -> Result<Vec<Task>, DatabaseError> {
    let rows = match status {
        Some(status) => conn
            .query(
                &select_tasks("WHERE t.status = ?1 ORDER BY t.created_at ASC, t.rowid ASC"),
                params![status.as_str()],
            )
            .await,
        None => conn
            .query(&select_tasks("ORDER BY t.created_at ASC, t.rowid ASC"), ())
            .await,
    }
    .map_err(|e| DatabaseError::Query(format!("list_tasks: {e}")))?;
    collect_tasks(conn, rows).await
}

/// Queued tasks whose dependencies are all done, in scheduling order:
/// priority descending, then creation time ascending.
pub async fn schedulable_tasks(conn: &Connection) -> Result<Vec<Task>, DatabaseError> {
    let rows = conn
        .query(
            &select_tasks(&format!(
                "WHERE t.status = 'queued' AND NOT {UNMET_DEPS}
                 ORDER BY t.priority DESC, t.created_at ASC, t.rowid ASC"
            )),
            (),
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("schedulable_tasks: {e}")))?;
    collect_tasks(conn, rows).await
}

/// Tasks currently holding a lease (claimed or running).
pub async fn leased_tasks(conn: &Connection) -> Result<Vec<Task>, DatabaseError> {
    let rows = conn
        .query(
            &select_tasks("WHERE t.status IN ('claimed', 'running') ORDER BY t.created_at ASC"),
            (),
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("leased_tasks: {e}")))?;
    collect_tasks(conn, rows).await
}

/// Failed tasks whose retry backoff has elapsed.
pub async fn due_retries(conn: &Connection, now: DateTime<Utc>) -> Result<Vec<Task>, DatabaseError> {
    let rows = conn
        .query(
            &select_tasks(
                "WHERE t.status = 'failed' AND t.retry_at IS NOT NULL AND t.retry_at <= ?1
                 ORDER BY t.retry_at ASC",
            ),
            params![fmt_ts(now)],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("due_retries: {e}")))?;
    collect_tasks(conn, rows).await
}

/// Every `(task, depends_on)` edge in the store.
pub async fn dependency_edges(conn: &Connection) -> Result<Vec<(Uuid, Uuid)>, DatabaseError> {
    let mut rows = conn
        .query("SELECT task_id, depends_on FROM task_dependencies", ())
        .await
        .map_err(|e| DatabaseError::Query(format!("dependency_edges: {e}")))?;

    let mut edges = Vec::new();
    while let Some(row) = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Query(format!("dependency_edges row: {e}")))?
    {
        let task: String = row.get(0).map_err(|e| DatabaseError::Query(e.to_string()))?;
        let dep: String = row.get(1).map_err(|e| DatabaseError::Query(e.to_string()))?;
        edges.push((parse_uuid(&task)?, parse_uuid(&dep)?));
    }
    Ok(edges)
}

/// Tasks that name `id` as a dependency.
pub async fn dependents_of(conn: &Connection, id: Uuid) -> Result<Vec<Task>, DatabaseError> {
    let rows = conn
        .query(
            &select_tasks(
                "WHERE t.id IN (SELECT task_id FROM task_dependencies WHERE depends_on = ?1)
                 ORDER BY t.created_at ASC, t.rowid ASC",
            ),
            params![id.to_string()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("dependents_of: {e}")))?;
    collect_tasks(conn, rows).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use crate::store::rows::truncate_ts;
    use crate::tasks::model::NewTask;

    fn task(new: NewTask) -> Task {
        Task::from_new(new, 3, truncate_ts(Utc::now()))
    }

    #[tokio::test]
    async fn insert_and_get() {
        let store = Store::new_memory().await.unwrap();
        let conn = store.conn().await;
        let t = task(NewTask::new("build").lock_path("src/**").in_project("core"));
        insert_task(&conn, &t).await.unwrap();

        let fetched = get_task(&conn, t.id).await.unwrap().unwrap();
        assert_eq!(fetched, t);
        assert!(get_task(&conn, Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_id_is_constraint_error() {
        let store = Store::new_memory().await.unwrap();
        let conn = store.conn().await;
        let t = task(NewTask::new("a"));
        insert_task(&conn, &t).await.unwrap();
        let err = insert_task(&conn, &t).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Constraint(_)));
    }

    #[tokio::test]
    async fn blocked_is_derived_from_dependency_status() {
        let store = Store::new_memory().await.unwrap();
        let conn = store.conn().await;
        let a = task(NewTask::new("a"));
        let b = task(NewTask::new("b").depends_on(a.id));
        insert_task(&conn, &a).await.unwrap();
        insert_task(&conn, &b).await.unwrap();

        let b_read = get_task(&conn, b.id).await.unwrap().unwrap();
        assert!(b_read.blocked);
        assert_eq!(b_read.dependencies, vec![a.id]);

        let mut a_done = a.clone();
        a_done.status = TaskStatus::Done;
        update_task(&conn, &a_done).await.unwrap();
        assert!(!get_task(&conn, b.id).await.unwrap().unwrap().blocked);
    }

    #[tokio::test]
    async fn unknown_dependency_stays_blocked() {
        let store = Store::new_memory().await.unwrap();
        let conn = store.conn().await;
        let t = task(NewTask::new("waits").depends_on(Uuid::new_v4()));
        insert_task(&conn, &t).await.unwrap();
        assert!(get_task(&conn, t.id).await.unwrap().unwrap().blocked);
        assert!(schedulable_tasks(&conn).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn schedulable_orders_by_priority_then_age() {
        let store = Store::new_memory().await.unwrap();
        let conn = store.conn().await;
        let low = task(NewTask::new("low").with_priority(1));
        let high = task(NewTask::new("high").with_priority(5));
        let low2 = task(NewTask::new("low2").with_priority(1));
        for t in [&low, &high, &low2] {
            insert_task(&conn, t).await.unwrap();
        }

        let order: Vec<String> = schedulable_tasks(&conn)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.title)
            .collect();
        assert_eq!(order, vec!["high", "low", "low2"]);
    }

    #[tokio::test]
    async fn update_missing_task_is_not_found() {
        let store = Store::new_memory().await.unwrap();
        let conn = store.conn().await;
        let t = task(NewTask::new("ghost"));
        assert!(matches!(
            update_task(&conn, &t).await,
            Err(DatabaseError::NotFound { .. })
        ));
    }
}
