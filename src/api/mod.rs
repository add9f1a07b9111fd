//! HTTP API for the coordination daemon.
//!
//! Handlers are thin: they parse the request, call `TaskManager` and map
//! `CoordinationError` onto a status code. No coordination rule lives here.

mod error;
mod system;
mod tasks;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::{get, post, put};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;

pub use error::ApiError;

use crate::connector::Connector;
use crate::tasks::TaskManager;

/// Shared state for the API handlers.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<TaskManager>,
    pub connector: Arc<dyn Connector>,
    pub global_max_workers: usize,
    pub worker_offline_after: Duration,
}

/// Build the daemon router.
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(system::health))
        // Tasks
        .route("/tasks", get(tasks::list_tasks).post(tasks::create_task))
        .route("/tasks/batch", post(tasks::create_batch))
        .route("/tasks/schedulable", get(tasks::schedulable))
        .route("/tasks/next", get(tasks::next_task))
        .route("/tasks/{id}", get(tasks::get_task))
        .route("/tasks/{id}/claim", post(tasks::claim))
        .route("/tasks/{id}/heartbeat", post(tasks::heartbeat))
        .route("/tasks/{id}/start", post(tasks::start))
        .route("/tasks/{id}/release", post(tasks::release))
        .route("/tasks/{id}/complete", post(tasks::complete))
        .route("/tasks/{id}/fail", post(tasks::fail))
        .route("/tasks/{id}/retry", post(tasks::retry))
        .route("/tasks/{id}/run", post(tasks::run))
        .route("/tasks/{id}/logs", get(tasks::logs))
        .route("/tasks/{id}/memory", get(tasks::memory))
        .route("/tasks/{id}/decisions", get(tasks::decisions))
        .route("/tasks/{id}/transitions", get(tasks::transitions))
        // Ledger, memory, workers, locks
        .route("/decisions", get(system::recent_decisions))
        .route("/memory", get(system::search_memory).post(system::add_memory))
        .route("/workers", get(system::list_workers).post(system::register_worker))
        .route("/locks", get(system::list_locks))
        // Policy
        .route("/policy", get(system::policy_snapshot))
        .route("/policy/effective", get(system::effective_policy))
        .route("/policy/global", put(system::put_global_policy))
        .route("/policy/projects/{name}", put(system::put_project_policy))
        .route("/policy/workers/{id}", put(system::put_worker_policy))
        .layer(ServiceBuilder::new().layer(CorsLayer::permissive()))
        .with_state(state)
}
