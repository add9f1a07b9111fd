//! Ancillary per-task records: connector runs and memory items.

use chrono::{DateTime, Utc};
use libsql::{Connection, params};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::rows::{fmt_ts, from_json, parse_datetime, parse_uuid, to_json};

/// Output of one connector invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRun {
    pub id: Uuid,
    pub task_id: Uuid,
    pub worker_id: String,
    pub command: String,
    pub args: Vec<String>,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// A note kept for later tasks to find.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryItem {
    pub id: Uuid,
    pub task_id: Option<Uuid>,
    pub content: String,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Request body for adding a memory item.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NewMemory {
    pub task_id: Option<Uuid>,
    pub content: String,
    pub tags: Vec<String>,
}

const RUN_COLUMNS: &str =
    "id, task_id, worker_id, command, args, exit_code, stdout, stderr, started_at, finished_at";

const MEMORY_COLUMNS: &str = "id, task_id, content, tags, created_at";

pub async fn insert_run(conn: &Connection, run: &TaskRun) -> Result<(), DatabaseError> {
    conn.execute(
        &format!("INSERT INTO task_runs ({RUN_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"),
        params![
            run.id.to_string(),
            run.task_id.to_string(),
            run.worker_id.as_str(),
            run.command.as_str(),
            to_json(&run.args)?,
            run.exit_code as i64,
            run.stdout.as_str(),
            run.stderr.as_str(),
            fmt_ts(run.started_at),
            fmt_ts(run.finished_at),
        ],
    )
    .await
    .map_err(|e| DatabaseError::Query(format!("insert_run: {e}")))?;
    Ok(())
}

/// Runs for one task, oldest first.
pub async fn runs_for_task(conn: &Connection, task_id: Uuid) -> Result<Vec<TaskRun>, DatabaseError> {
    let mut rows = conn
        .query(
            &format!(
                "SELECT {RUN_COLUMNS} FROM task_runs WHERE task_id = ?1 ORDER BY started_at ASC, rowid ASC"
            ),
            params![task_id.to_string()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("runs_for_task: {e}")))?;

    let get_err = |e: libsql::Error| DatabaseError::Query(format!("run row: {e}"));
    let mut runs = Vec::new();
    while let Some(row) = rows.next().await.map_err(get_err)? {
        let id: String = row.get(0).map_err(get_err)?;
        let task: String = row.get(1).map_err(get_err)?;
        let args: String = row.get(4).map_err(get_err)?;
        let started: String = row.get(8).map_err(get_err)?;
        let finished: String = row.get(9).map_err(get_err)?;
        runs.push(TaskRun {
            id: parse_uuid(&id)?,
            task_id: parse_uuid(&task)?,
            worker_id: row.get(2).map_err(get_err)?,
            command: row.get(3).map_err(get_err)?,
            args: from_json(&args)?,
            exit_code: row.get::<i64>(5).map_err(get_err)? as i32,
            stdout: row.get(6).map_err(get_err)?,
            stderr: row.get(7).map_err(get_err)?,
            started_at: parse_datetime(&started)?,
            finished_at: parse_datetime(&finished)?,
        });
    }
    Ok(runs)
}

// Tags are stored comma-joined so a plain LIKE finds them.
fn join_tags(tags: &[String]) -> String {
    tags.iter()
        .map(|t| t.trim().replace(',', " "))
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(",")
}

fn split_tags(raw: &str) -> Vec<String> {
    raw.split(',')
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

pub async fn insert_memory(conn: &Connection, item: &MemoryItem) -> Result<(), DatabaseError> {
    conn.execute(
        &format!("INSERT INTO memory_items ({MEMORY_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5)"),
        params![
            item.id.to_string(),
            item.task_id.map(|id| id.to_string()),
            item.content.as_str(),
            join_tags(&item.tags),
            fmt_ts(item.created_at),
        ],
    )
    .await
    .map_err(|e| DatabaseError::Query(format!("insert_memory: {e}")))?;
    Ok(())
}

async fn collect_memory(mut rows: libsql::Rows) -> Result<Vec<MemoryItem>, DatabaseError> {
    let get_err = |e: libsql::Error| DatabaseError::Query(format!("memory row: {e}"));
    let mut items = Vec::new();
    while let Some(row) = rows.next().await.map_err(get_err)? {
        let id: String = row.get(0).map_err(get_err)?;
        let task_id: Option<String> = row.get(1).ok();
        let tags: String = row.get(3).map_err(get_err)?;
        let created: String = row.get(4).map_err(get_err)?;
        items.push(MemoryItem {
            id: parse_uuid(&id)?,
            task_id: task_id.as_deref().map(parse_uuid).transpose()?,
            content: row.get(2).map_err(get_err)?,
            tags: split_tags(&tags),
            created_at: parse_datetime(&created)?,
        });
    }
    Ok(items)
}

pub async fn memory_for_task(conn: &Connection, task_id: Uuid) -> Result<Vec<MemoryItem>, DatabaseError> {
    let rows = conn
        .query(
            &format!(
                "SELECT {MEMORY_COLUMNS} FROM memory_items WHERE task_id = ?1
                 ORDER BY created_at ASC, rowid ASC"
            ),
            params![task_id.to_string()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("memory_for_task: {e}")))?;
    collect_memory(rows).await
}

/// Substring search over content and tags, newest first. An empty query
/// returns the latest items.
pub async fn search_memory(
    conn: &Connection,
    query: &str,
    limit: u32,
) -> Result<Vec<MemoryItem>, DatabaseError> {
    let escaped = query.trim().replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_");
    let pattern = format!("%{escaped}%");
    let rows = conn
        .query(
            &format!(
                "SELECT {MEMORY_COLUMNS} FROM memory_items
                 WHERE content LIKE ?1 ESCAPE '\\' OR tags LIKE ?1 ESCAPE '\\'
                 ORDER BY created_at DESC, rowid DESC LIMIT ?2"
            ),
            params![pattern, limit as i64],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("search_memory: {e}")))?;
    collect_memory(rows).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use crate::store::rows::truncate_ts;
    use crate::store::tasks::insert_task;
    use crate::tasks::model::{NewTask, Task};

    #[tokio::test]
    async fn runs_round_trip_in_order() {
        let store = Store::new_memory().await.unwrap();
        let conn = store.conn().await;
        let now = truncate_ts(Utc::now());
        let task = Task::from_new(NewTask::new("t"), 0, now);
        insert_task(&conn, &task).await.unwrap();

        let run = TaskRun {
            id: Uuid::new_v4(),
            task_id: task.id,
            worker_id: "w1".into(),
            command: "echo".into(),
            args: vec!["hi".into()],
            exit_code: 0,
            stdout: "hi\n".into(),
            stderr: String::new(),
            started_at: now,
            finished_at: now,
        };
        insert_run(&conn, &run).await.unwrap();
        assert_eq!(runs_for_task(&conn, task.id).await.unwrap(), vec![run]);
    }

    #[tokio::test]
    async fn memory_search_matches_content_and_tags() {
        let store = Store::new_memory().await.unwrap();
        let conn = store.conn().await;
        let now = truncate_ts(Utc::now());
        let item = |content: &str, tags: &[&str]| MemoryItem {
            id: Uuid::new_v4(),
            task_id: None,
            content: content.into(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            created_at: now,
        };
        insert_memory(&conn, &item("migrations need a lock", &["db"])).await.unwrap();
        insert_memory(&conn, &item("flaky test in api", &["ci", "flaky"])).await.unwrap();
        insert_memory(&conn, &item("100% coverage", &[])).await.unwrap();

        assert_eq!(search_memory(&conn, "lock", 10).await.unwrap().len(), 1);
        let by_tag = search_memory(&conn, "ci", 10).await.unwrap();
        assert_eq!(by_tag.len(), 1);
        assert_eq!(by_tag[0].tags, vec!["ci".to_string(), "flaky".to_string()]);
        assert_eq!(search_memory(&conn, "0%", 10).await.unwrap().len(), 1);
        assert_eq!(search_memory(&conn, "", 2).await.unwrap().len(), 2);
    }
}
