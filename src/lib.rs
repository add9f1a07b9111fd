//! Neona: a task coordination control plane for AI coding workers.

pub mod api;
pub mod audit;
pub mod clock;
pub mod config;
pub mod connector;
pub mod error;
pub mod locks;
pub mod policy;
pub mod store;
pub mod tasks;
pub mod workers;
