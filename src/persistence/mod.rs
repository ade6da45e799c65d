//! Persistence layer modules.
//!
//! One `*Repo` per entity described in `spec.md` §3, each wrapping a shared
//! `Arc<SqlitePool>`, following the repository pattern this codebase has
//! always used for state-store access.

pub mod approval_repo;
pub mod checkpoint_repo;
pub mod db;
pub mod processed_repo;
pub mod schema;
pub mod session_repo;
pub mod task_repo;

/// Re-export the database pool type for convenience.
pub use sqlx::SqlitePool;
