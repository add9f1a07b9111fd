//! Lock manager: per-task locks and path-glob locks with expiry.

pub mod manager;
pub mod pattern;

pub use manager::LockInfo;
pub use pattern::{PathPattern, PatternError};
