//! SQLite store bootstrap.
//!
//! The whole engine persists into one SQLite file. Opening it configures
//! the connection for this workload: write-ahead logging so readers never
//! block the single writer, foreign-key enforcement (history, candidates,
//! queue entries and tasks all reference `items`), a busy timeout instead
//! of immediate `SQLITE_BUSY` failures, and the embedded migrations.
//!
//! Tests use [`Database::in_memory`], which skips WAL (meaningless for a
//! memory store) and pins the pool to one connection so every query sees
//! the same database.

use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use thiserror::Error;
use tracing::{debug, instrument};

/// Pool size for file-backed stores. SQLite serializes writers anyway, so
/// a handful of connections covers the scheduler, workers, and reconciler
/// without lock churn.
const POOL_SIZE: u32 = 5;

/// How long a connection waits on a locked database before giving up.
const BUSY_WAIT: Duration = Duration::from_secs(5);

/// Errors raised while opening or migrating the store.
#[derive(Debug, Error)]
pub enum DbError {
    /// The store could not be opened at the given location.
    #[error("could not open store at {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: sqlx::Error,
    },

    /// The schema could not be brought up to date.
    #[error("schema migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Handle to the engine's SQLite store.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Opens (creating if needed) the store at `path` and applies pending
    /// migrations.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Open`] when the file cannot be opened and
    /// [`DbError::Migrate`] when the schema cannot be updated.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub async fn open(path: &Path) -> Result<Self, DbError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_WAIT)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(POOL_SIZE)
            .connect_with(options)
            .await
            .map_err(|source| DbError::Open {
                path: path.display().to_string(),
                source,
            })?;

        debug!("store opened");
        Self::migrate(pool).await
    }

    /// Opens a throwaway in-memory store for tests.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Open`] or [`DbError::Migrate`] on failure.
    pub async fn in_memory() -> Result<Self, DbError> {
        let options = SqliteConnectOptions::new()
            .in_memory(true)
            .foreign_keys(true);

        // One connection only: each in-memory connection is its own
        // database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|source| DbError::Open {
                path: ":memory:".to_string(),
                source,
            })?;

        Self::migrate(pool).await
    }

    async fn migrate(pool: SqlitePool) -> Result<Self, DbError> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    /// The underlying connection pool, for executing queries.
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Closes every pooled connection. The handle is unusable afterwards.
    pub async fn close(self) {
        self.pool.close().await;
    }
}
