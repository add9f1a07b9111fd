//! Dependency-aware selection.
//!
//! Selection is advisory: a pick can race with claims, and the claim call
//! re-validates eligibility itself.

use std::collections::HashSet;
use std::sync::Arc;

use libsql::Connection;
use tracing::debug;
use uuid::Uuid;

use crate::error::CoordinationError;
use crate::store::Store;
use crate::store::tasks as task_rows;
use crate::tasks::graph::DependencyGraph;
use crate::tasks::model::{Task, TaskStatus};

/// Read-side view of the queue.
pub struct Scheduler {
    store: Arc<Store>,
}

impl Scheduler {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Queued tasks whose dependencies are all done, best first.
    pub async fn schedulable(&self) -> Result<Vec<Task>, CoordinationError> {
        let conn = self.store.conn().await;
        Ok(task_rows::schedulable_tasks(&conn).await?)
    }

    /// Highest priority schedulable task, oldest first among equals.
    pub async fn next(&self) -> Result<Option<Task>, CoordinationError> {
        Ok(self.schedulable().await?.into_iter().next())
    }

    /// Reject a batch that would introduce a dependency cycle, given the
    /// edges already stored. Runs on the creating transaction.
    pub async fn check_cycles(conn: &Connection, batch: &[Task]) -> Result<(), CoordinationError> {
        let mut ids = HashSet::new();
        for task in batch {
            if !ids.insert(task.id) {
                return Err(CoordinationError::Validation(format!(
                    "task id {} appears twice in the batch",
                    task.id
                )));
            }
        }

        let mut graph = DependencyGraph::from_edges(task_rows::dependency_edges(conn).await?);
        for task in batch {
            for dep in &task.dependencies {
                graph.add_dependency(task.id, *dep);
            }
        }

        match graph.find_cycle_from(batch.iter().map(|t| t.id)) {
            Some(cycle) => {
                debug!(len = cycle.len(), "Dependency cycle rejected");
                Err(CoordinationError::CyclicDependency { cycle })
            }
            None => Ok(()),
        }
    }

    /// Dependents of `done_id` that became schedulable. Called on the
    /// completing transaction after the task was marked done.
    pub async fn unblocked_dependents(
        conn: &Connection,
        done_id: Uuid,
    ) -> Result<Vec<Task>, CoordinationError> {
        Ok(task_rows::dependents_of(conn, done_id)
            .await?
            .into_iter()
            .filter(|t| t.status == TaskStatus::Queued && !t.blocked)
            .collect())
    }
}
