//! Error types for store operations.

use thiserror::Error;

/// Errors that can occur during store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Underlying database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The referenced item does not exist.
    #[error("item not found: {0}")]
    ItemNotFound(i64),

    /// The referenced task does not exist.
    #[error("task not found: {0}")]
    TaskNotFound(i64),
}
