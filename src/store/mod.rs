//! Persistence layer: libSQL-backed storage for tasks, locks, the decision
//! ledger, workers and run artifacts.

pub mod artifacts;
pub mod db;
pub mod migrations;
pub mod rows;
pub mod tasks;

pub use db::{Store, StoreTx};
