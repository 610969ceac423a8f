//! Postgres-backed persistence (SPEC_FULL.md §11).
//!
//! Replaces the teacher's `rusqlite`-backed `storage::database` module with
//! an `sqlx::PgPool`, natively async so no `spawn_blocking` bridge is
//! needed. Keeps the teacher's shape: a typed `StorageError`, an ordered
//! migrations list, and one query module per entity family.

pub mod pool;
pub mod queries;
pub mod schema;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(String),
    #[error("row not found")]
    NotFound,
}

pub type Result<T> = std::result::Result<T, StorageError>;

pub use pool::Storage;
