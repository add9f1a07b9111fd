//! Task endpoints: creation, scheduling view, claim lifecycle, runs.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use super::AppState;
use super::error::{ApiError, ApiJson};
use crate::connector::RunRequest;
use crate::store::artifacts::TaskRun;
use crate::tasks::model::{Evidence, NewTask, TaskStatus};

type ApiResult<T> = Result<T, ApiError>;

fn parse_id(id: &str) -> ApiResult<Uuid> {
    Uuid::parse_str(id).map_err(|_| ApiError::bad_request(format!("invalid task id {id:?}")))
}

#[derive(Deserialize)]
pub(super) struct ListQuery {
    status: Option<String>,
}

/// GET /tasks?status=
///
/// `status=blocked` lists queued tasks with unmet dependencies.
pub(super) async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<impl IntoResponse> {
    let tasks = match query.status.as_deref() {
        None | Some("") => state.manager.list_tasks(None).await?,
        Some("blocked") => state
            .manager
            .list_tasks(Some(TaskStatus::Queued))
            .await?
            .into_iter()
            .filter(|t| t.blocked)
            .collect(),
        Some(raw) => {
            let status = raw.parse::<TaskStatus>().map_err(ApiError::bad_request)?;
            state.manager.list_tasks(Some(status)).await?
        }
    };
    Ok(Json(tasks))
}

pub(super) async fn create_task(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<NewTask>,
) -> ApiResult<impl IntoResponse> {
    let task = state.manager.create_task(body).await?;
    Ok((StatusCode::CREATED, Json(task)))
}

#[derive(Deserialize)]
pub(super) struct BatchRequest {
    tasks: Vec<NewTask>,
}

pub(super) async fn create_batch(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<BatchRequest>,
) -> ApiResult<impl IntoResponse> {
    let tasks = state.manager.create_batch(body.tasks).await?;
    Ok((StatusCode::CREATED, Json(tasks)))
}

pub(super) async fn schedulable(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.manager.schedulable().await?))
}

/// GET /tasks/next
///
/// Advisory: the claim call re-validates. 204 when nothing is schedulable.
pub(super) async fn next_task(State(state): State<AppState>) -> ApiResult<axum::response::Response> {
    Ok(match state.manager.next_task().await? {
        Some(task) => Json(task).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    })
}

pub(super) async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.manager.get_task(parse_id(&id)?).await?))
}

#[derive(Deserialize)]
pub(super) struct ClaimRequest {
    #[serde(alias = "workerID", alias = "workerId", alias = "holder_id")]
    worker_id: String,
    #[serde(default, alias = "ttlSeconds", alias = "ttl_sec")]
    ttl_seconds: Option<u64>,
}

pub(super) async fn claim(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ApiJson(body): ApiJson<ClaimRequest>,
) -> ApiResult<impl IntoResponse> {
    let task = state
        .manager
        .claim(parse_id(&id)?, &body.worker_id, body.ttl_seconds)
        .await?;
    Ok(Json(task))
}

#[derive(Deserialize)]
pub(super) struct WorkerRequest {
    #[serde(alias = "workerID", alias = "workerId", alias = "holder_id")]
    worker_id: String,
}

pub(super) async fn heartbeat(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ApiJson(body): ApiJson<WorkerRequest>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.manager.heartbeat(parse_id(&id)?, &body.worker_id).await?))
}

pub(super) async fn start(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ApiJson(body): ApiJson<WorkerRequest>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.manager.start(parse_id(&id)?, &body.worker_id).await?))
}

pub(super) async fn release(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ApiJson(body): ApiJson<WorkerRequest>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.manager.release(parse_id(&id)?, &body.worker_id).await?))
}

#[derive(Deserialize)]
pub(super) struct CompleteRequest {
    #[serde(alias = "workerID", alias = "workerId", alias = "holder_id")]
    worker_id: String,
    #[serde(default)]
    evidence: Evidence,
}

pub(super) async fn complete(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ApiJson(body): ApiJson<CompleteRequest>,
) -> ApiResult<impl IntoResponse> {
    let completion = state
        .manager
        .complete(parse_id(&id)?, &body.worker_id, body.evidence)
        .await?;
    Ok(Json(completion))
}

#[derive(Deserialize)]
pub(super) struct FailRequest {
    #[serde(alias = "workerID", alias = "workerId", alias = "holder_id")]
    worker_id: String,
    #[serde(default)]
    error: String,
}

pub(super) async fn fail(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ApiJson(body): ApiJson<FailRequest>,
) -> ApiResult<impl IntoResponse> {
    let error = if body.error.trim().is_empty() {
        "worker reported failure"
    } else {
        body.error.as_str()
    };
    Ok(Json(state.manager.fail(parse_id(&id)?, &body.worker_id, error).await?))
}

pub(super) async fn retry(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.manager.retry(parse_id(&id)?).await?))
}

#[derive(Deserialize)]
pub(super) struct RunBody {
    #[serde(alias = "workerID", alias = "workerId", alias = "holder_id")]
    worker_id: String,
    command: String,
    #[serde(default)]
    args: Vec<String>,
}

/// POST /tasks/{id}/run
///
/// Pre-run policy check, then the connector, then the run record.
pub(super) async fn run(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ApiJson(body): ApiJson<RunBody>,
) -> ApiResult<impl IntoResponse> {
    let task_id = parse_id(&id)?;
    let decision = state.manager.authorize_run(task_id, &body.worker_id).await?;

    let request = RunRequest {
        command: body.command,
        args: body.args,
    };
    let started_at = state.manager.now();
    let output = state.connector.run(&request).await?;
    let run = TaskRun {
        id: Uuid::new_v4(),
        task_id,
        worker_id: body.worker_id,
        command: request.command,
        args: request.args,
        exit_code: output.exit_code,
        stdout: output.stdout,
        stderr: output.stderr,
        started_at,
        finished_at: state.manager.now(),
    };
    state.manager.record_run(&run).await?;
    info!(
        task_id = %task_id,
        worker = %run.worker_id,
        command = %run.command,
        exit_code = run.exit_code,
        connector = state.connector.name(),
        "Run finished"
    );

    Ok(Json(serde_json::json!({
        "decision_id": decision.id,
        "run": run,
    })))
}

pub(super) async fn logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.manager.runs(parse_id(&id)?).await?))
}

pub(super) async fn memory(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.manager.task_memory(parse_id(&id)?).await?))
}

pub(super) async fn decisions(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.manager.decisions(parse_id(&id)?).await?))
}

pub(super) async fn transitions(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.manager.transitions(parse_id(&id)?).await?))
}
