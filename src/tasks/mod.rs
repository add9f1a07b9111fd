//! Tasks: lifecycle model, dependency graph, scheduling, retries and the
//! manager that orchestrates claims.

pub mod graph;
pub mod manager;
pub mod model;
pub mod reaper;
pub mod retry;
pub mod scheduler;

pub use manager::{Completion, TaskManager};
pub use model::{Evidence, NewTask, Task, TaskStatus, TaskType, TestResults};
pub use retry::RetryPolicy;
pub use scheduler::Scheduler;
