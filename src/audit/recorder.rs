//! Decision recorder: insert and read only.
//!
//! Writes happen on the caller's transaction so a record commits or rolls
//! back together with the state change it describes. The tables reject
//! UPDATE and DELETE at the schema level.

use libsql::{Connection, params};
use tracing::debug;
use uuid::Uuid;

use crate::audit::model::{PolicyDecisionRecord, TransitionRecord};
use crate::error::{CoordinationError, DatabaseError};
use crate::store::rows::{fmt_ts, from_json, parse_datetime, parse_uuid, to_json};

const DECISION_COLUMNS: &str =
    "id, task_id, worker_id, point, decision, policy, reason, created_at";

const TRANSITION_COLUMNS: &str =
    "id, task_id, from_status, to_status, actor, cause, detail, created_at";

fn audit_err(what: &str, e: impl std::fmt::Display) -> CoordinationError {
    CoordinationError::Audit(format!("{what}: {e}"))
}

/// Append a policy decision record.
pub async fn record_decision(
    conn: &Connection,
    record: &PolicyDecisionRecord,
) -> Result<(), CoordinationError> {
    let policy = to_json(&record.policy).map_err(|e| audit_err("encode policy snapshot", e))?;
    conn.execute(
        "INSERT INTO policy_decisions (id, task_id, worker_id, point, decision, policy, reason, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            record.id.to_string(),
            record.task_id.to_string(),
            record.worker_id.as_str(),
            record.point.as_str(),
            record.decision.as_str(),
            policy,
            record.reason.as_str(),
            fmt_ts(record.created_at),
        ],
    )
    .await
    .map_err(|e| audit_err("record_decision", e))?;

    debug!(
        id = %record.id,
        task_id = %record.task_id,
        point = record.point.as_str(),
        decision = record.decision.as_str(),
        "Decision recorded"
    );
    Ok(())
}

/// Append a status transition record.
pub async fn record_transition(
    conn: &Connection,
    record: &TransitionRecord,
) -> Result<(), CoordinationError> {
    conn.execute(
        "INSERT INTO task_transitions (id, task_id, from_status, to_status, actor, cause, detail, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            record.id.to_string(),
            record.task_id.to_string(),
            record.from_status.map(|s| s.as_str()),
            record.to_status.as_str(),
            record.actor.as_str(),
            record.cause.as_str(),
            record.detail.as_deref(),
            fmt_ts(record.created_at),
        ],
    )
    .await
    .map_err(|e| audit_err("record_transition", e))?;
    Ok(())
}

fn row_to_decision(row: &libsql::Row) -> Result<PolicyDecisionRecord, DatabaseError> {
    let get_err = |e: libsql::Error| DatabaseError::Query(format!("decision row: {e}"));
    let id: String = row.get(0).map_err(get_err)?;
    let task_id: String = row.get(1).map_err(get_err)?;
    let point: String = row.get(3).map_err(get_err)?;
    let decision: String = row.get(4).map_err(get_err)?;
    let policy: String = row.get(5).map_err(get_err)?;
    let created_at: String = row.get(7).map_err(get_err)?;

    Ok(PolicyDecisionRecord {
        id: parse_uuid(&id)?,
        task_id: parse_uuid(&task_id)?,
        worker_id: row.get(2).map_err(get_err)?,
        point: point.parse().map_err(DatabaseError::Serialization)?,
        decision: decision.parse().map_err(DatabaseError::Serialization)?,
        policy: from_json(&policy)?,
        reason: row.get(6).map_err(get_err)?,
        created_at: parse_datetime(&created_at)?,
    })
}

fn row_to_transition(row: &libsql::Row) -> Result<TransitionRecord, DatabaseError> {
    let get_err = |e: libsql::Error| DatabaseError::Query(format!("transition row: {e}"));
    let id: String = row.get(0).map_err(get_err)?;
    let task_id: String = row.get(1).map_err(get_err)?;
    let from_status: Option<String> = row.get(2).ok();
    let to_status: String = row.get(3).map_err(get_err)?;
    let cause: String = row.get(5).map_err(get_err)?;
    let created_at: String = row.get(7).map_err(get_err)?;

    Ok(TransitionRecord {
        id: parse_uuid(&id)?,
        task_id: parse_uuid(&task_id)?,
        from_status: from_status
            .as_deref()
            .map(str::parse)
            .transpose()
            .map_err(DatabaseError::Serialization)?,
        to_status: to_status.parse().map_err(DatabaseError::Serialization)?,
        actor: row.get(4).map_err(get_err)?,
        cause: cause.parse().map_err(DatabaseError::Serialization)?,
        detail: row.get(6).ok(),
        created_at: parse_datetime(&created_at)?,
    })
}

/// Decisions for one task, oldest first.
pub async fn decisions_for_task(
    conn: &Connection,
    task_id: Uuid,
) -> Result<Vec<PolicyDecisionRecord>, DatabaseError> {
    let mut rows = conn
        .query(
            &format!(
                "SELECT {DECISION_COLUMNS} FROM policy_decisions WHERE task_id = ?1
                 ORDER BY created_at ASC, rowid ASC"
            ),
            params![task_id.to_string()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("decisions_for_task: {e}")))?;

    let mut out = Vec::new();
    while let Some(row) = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Query(format!("decisions_for_task row: {e}")))?
    {
        out.push(row_to_decision(&row)?);
    }
    Ok(out)
}

/// Most recent decisions across all tasks, newest first.
pub async fn recent_decisions(
    conn: &Connection,
    limit: u32,
) -> Result<Vec<PolicyDecisionRecord>, DatabaseError> {
    let mut rows = conn
        .query(
            &format!(
                "SELECT {DECISION_COLUMNS} FROM policy_decisions
                 ORDER BY created_at DESC, rowid DESC LIMIT ?1"
            ),
            params![limit as i64],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("recent_decisions: {e}")))?;

    let mut out = Vec::new();
    while let Some(row) = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Query(format!("recent_decisions row: {e}")))?
    {
        out.push(row_to_decision(&row)?);
    }
    Ok(out)
}

/// Transitions for one task, oldest first.
pub async fn transitions_for_task(
    conn: &Connection,
    task_id: Uuid,
) -> Result<Vec<TransitionRecord>, DatabaseError> {
    let mut rows = conn
        .query(
            &format!(
                "SELECT {TRANSITION_COLUMNS} FROM task_transitions WHERE task_id = ?1
                 ORDER BY created_at ASC, rowid ASC"
            ),
            params![task_id.to_string()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("transitions_for_task: {e}")))?;

    let mut out = Vec::new();
    while let Some(row) = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Query(format!("transitions_for_task row: {e}")))?
    {
        out.push(row_to_transition(&row)?);
    }
    Ok(out)
}

/// The latest transition on a task made by `actor` or affecting `actor`'s claim.
///
/// Used to tell a late heartbeat from a stranger's: lease expiry is recorded
/// with the expired holder as its actor.
pub async fn last_transition_involving(
    conn: &Connection,
    task_id: Uuid,
    actor: &str,
) -> Result<Option<TransitionRecord>, DatabaseError> {
    let mut rows = conn
        .query(
            &format!(
                "SELECT {TRANSITION_COLUMNS} FROM task_transitions
                 WHERE task_id = ?1 AND actor = ?2
                 ORDER BY created_at DESC, rowid DESC LIMIT 1"
            ),
            params![task_id.to_string(), actor],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("last_transition_involving: {e}")))?;

    match rows.next().await {
        Ok(Some(row)) => Ok(Some(row_to_transition(&row)?)),
        Ok(None) => Ok(None),
        Err(e) => Err(DatabaseError::Query(format!("last_transition_involving row: {e}"))),
    }
}
