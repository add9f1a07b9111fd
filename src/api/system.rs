//! Health, workers, locks, the decision ledger, memory and policy.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Deserialize;
use tracing::warn;

use super::AppState;
use super::error::{ApiError, ApiJson};
use crate::policy::{PolicyDocument, PolicyScope, UpdateMode};
use crate::store::artifacts::NewMemory;
use crate::workers::WorkerRegistration;

type ApiResult<T> = Result<T, ApiError>;

const DEFAULT_LIMIT: u32 = 50;
const MAX_LIMIT: u32 = 1000;

// ── Health ──────────────────────────────────────────────────────────────

pub(super) async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let db = state.manager.store().ping().await;
    let status = if db.is_ok() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    if let Err(e) = &db {
        warn!(error = %e, "Health check: database unavailable");
    }
    (
        status,
        Json(serde_json::json!({
            "ok": db.is_ok(),
            "db": match &db {
                Ok(()) => "ok".to_string(),
                Err(e) => e.to_string(),
            },
            "version": env!("CARGO_PKG_VERSION"),
            "time": state.manager.now(),
        })),
    )
}

// ── Workers and locks ───────────────────────────────────────────────────

pub(super) async fn list_workers(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let snapshot = state
        .manager
        .workers_snapshot(state.worker_offline_after, state.global_max_workers)
        .await?;
    Ok(Json(snapshot))
}

pub(super) async fn register_worker(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<WorkerRegistration>,
) -> ApiResult<impl IntoResponse> {
    let worker = state.manager.register_worker(&body).await?;
    Ok((StatusCode::CREATED, Json(worker)))
}

pub(super) async fn list_locks(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.manager.live_locks().await?))
}

// ── Ledger ──────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub(super) struct LimitQuery {
    limit: Option<u32>,
}

pub(super) async fn recent_decisions(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<impl IntoResponse> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    Ok(Json(state.manager.recent_decisions(limit).await?))
}

// ── Memory ──────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub(super) struct MemoryQuery {
    #[serde(default)]
    q: String,
    limit: Option<u32>,
}

pub(super) async fn search_memory(
    State(state): State<AppState>,
    Query(query): Query<MemoryQuery>,
) -> ApiResult<impl IntoResponse> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    Ok(Json(state.manager.search_memory(&query.q, limit).await?))
}

pub(super) async fn add_memory(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<NewMemory>,
) -> ApiResult<impl IntoResponse> {
    let item = state.manager.add_memory(body).await?;
    Ok((StatusCode::CREATED, Json(item)))
}

// ── Policy ──────────────────────────────────────────────────────────────

pub(super) async fn policy_snapshot(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.manager.policy().snapshot())
}

#[derive(Deserialize)]
pub(super) struct EffectiveQuery {
    worker: Option<String>,
    project: Option<String>,
}

/// GET /policy/effective?worker=&project=
pub(super) async fn effective_policy(
    State(state): State<AppState>,
    Query(query): Query<EffectiveQuery>,
) -> impl IntoResponse {
    let policy = state.manager.policy().effective(
        query.worker.as_deref().unwrap_or_default(),
        query.project.as_deref().filter(|p| !p.is_empty()),
    );
    Json(policy)
}

#[derive(Deserialize)]
pub(super) struct UpdateQuery {
    #[serde(default)]
    mode: Option<String>,
}

fn update_mode(query: &UpdateQuery) -> ApiResult<UpdateMode> {
    match query.mode.as_deref() {
        None | Some("replace") => Ok(UpdateMode::Replace),
        Some("merge") => Ok(UpdateMode::Merge),
        Some(other) => Err(ApiError::bad_request(format!(
            "unknown update mode {other:?} (expected replace or merge)"
        ))),
    }
}

// Parsed by hand so unknown keys come back in the standard error body.
fn parse_document(body: serde_json::Value) -> ApiResult<PolicyDocument> {
    serde_json::from_value(body).map_err(|e| ApiError::bad_request(format!("policy document: {e}")))
}

fn apply_update(
    state: &AppState,
    scope: PolicyScope,
    body: serde_json::Value,
    query: &UpdateQuery,
) -> ApiResult<PolicyDocument> {
    let mode = update_mode(query)?;
    let doc = parse_document(body)?;
    Ok(state.manager.policy().update(scope, doc, mode)?)
}

pub(super) async fn put_global_policy(
    State(state): State<AppState>,
    Query(query): Query<UpdateQuery>,
    ApiJson(body): ApiJson<serde_json::Value>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(apply_update(&state, PolicyScope::Global, body, &query)?))
}

pub(super) async fn put_project_policy(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<UpdateQuery>,
    ApiJson(body): ApiJson<serde_json::Value>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(apply_update(&state, PolicyScope::Project(name), body, &query)?))
}

pub(super) async fn put_worker_policy(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<UpdateQuery>,
    ApiJson(body): ApiJson<serde_json::Value>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(apply_update(&state, PolicyScope::Worker(id), body, &query)?))
}
