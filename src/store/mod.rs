//! Durable store for items, history, search results, the download queue,
//! download records, and processing tasks.
//!
//! All persistent rows are owned by this module. Writes that must land
//! atomically with other writes (item status + history, domain rows within
//! a stage execution) are exposed as `*_in` variants taking a
//! `&mut SqliteConnection`, so callers can compose them inside one
//! transaction. Transactions come from [`Store::begin`] and follow sqlx
//! semantics: commit on success, rollback on drop, so release is guaranteed
//! on every exit path.
//!
//! # Example
//!
//! ```ignore
//! use bookflow_core::store::{Store, NewItem};
//! use bookflow_core::Database;
//!
//! let db = Database::in_memory().await?;
//! let store = Store::new(db);
//! let id = store.insert_item(&NewItem {
//!     title: "Dune".into(),
//!     ..NewItem::default()
//! }).await?;
//! ```

mod error;
mod item;
mod rows;
mod task;

pub use error::StoreError;
pub use item::{Item, ItemDetail, ItemStatus, NewItem, Stage};
pub use rows::{
    DownloadRecord, NewDownloadRecord, NewSearchResult, QueueEntry, QueueEntryStatus, QuotaStateRow,
    SearchResult, StageFlag, StatusHistoryEntry,
};
pub use task::{TaskRow, TaskStatus};

use sqlx::sqlite::SqliteConnection;
use sqlx::{Row, Sqlite, Transaction};
use tracing::instrument;

use crate::db::Database;

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Builds a quoted SQL list from static status strings.
///
/// The inputs are `as_str()` constants, never user data.
fn quoted_list(values: &[&'static str]) -> String {
    values
        .iter()
        .map(|s| format!("'{s}'"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn item_status_list(statuses: &[ItemStatus]) -> String {
    quoted_list(&statuses.iter().map(ItemStatus::as_str).collect::<Vec<_>>())
}

fn task_status_list(statuses: &[TaskStatus]) -> String {
    quoted_list(&statuses.iter().map(TaskStatus::as_str).collect::<Vec<_>>())
}

const ITEM_COLUMNS: &str = "id, title, subtitle, author, publisher, publish_date, isbn, \
     external_id, source_url, description, status, error_message, created_at, updated_at";

const TASK_COLUMNS: &str = "id, item_id, stage, status, priority, retry_count, max_retries, \
     error_message, error_kind, task_data, next_retry_at, started_at, completed_at, \
     created_at, updated_at";

/// Typed row access over the engine's SQLite schema.
#[derive(Debug, Clone)]
pub struct Store {
    db: Database,
}

impl Store {
    /// Creates a new store over the given database.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Returns the underlying database handle.
    #[must_use]
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Begins a transaction.
    ///
    /// The transaction commits via `.commit()` and rolls back when dropped
    /// uncommitted.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if a connection cannot be acquired.
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.db.pool().begin().await?)
    }

    // ==================== Items ====================

    /// Inserts a freshly discovered item with status `NEW` and writes the
    /// initial history row.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on insert failure, including unique
    /// violations on `external_id`.
    #[instrument(skip(self, new), fields(title = %new.title))]
    pub async fn insert_item(&self, new: &NewItem) -> Result<i64> {
        let mut tx = self.begin().await?;
        let result = sqlx::query(
            r"INSERT INTO items (title, author, external_id, source_url, status)
              VALUES (?, ?, ?, ?, 'new')",
        )
        .bind(&new.title)
        .bind(&new.author)
        .bind(&new.external_id)
        .bind(&new.source_url)
        .execute(&mut *tx)
        .await?;
        let id = result.last_insert_rowid();

        Self::insert_history_in(
            &mut tx,
            id,
            None,
            ItemStatus::New,
            Some("discovered on source list"),
            None,
            None,
            0,
        )
        .await?;
        tx.commit().await?;
        Ok(id)
    }

    /// Fetches an item by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on query failure.
    pub async fn get_item(&self, id: i64) -> Result<Option<Item>> {
        let item =
            sqlx::query_as::<_, Item>(&format!("SELECT {ITEM_COLUMNS} FROM items WHERE id = ?"))
                .bind(id)
                .fetch_optional(self.db.pool())
                .await?;
        Ok(item)
    }

    /// Fetches an item by id inside an open session.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on query failure.
    pub async fn get_item_in(conn: &mut SqliteConnection, id: i64) -> Result<Option<Item>> {
        let item =
            sqlx::query_as::<_, Item>(&format!("SELECT {ITEM_COLUMNS} FROM items WHERE id = ?"))
                .bind(id)
                .fetch_optional(conn)
                .await?;
        Ok(item)
    }

    /// Fetches an item by its source-list identifier.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on query failure.
    pub async fn get_item_by_external_id(&self, external_id: &str) -> Result<Option<Item>> {
        let item = sqlx::query_as::<_, Item>(&format!(
            "SELECT {ITEM_COLUMNS} FROM items WHERE external_id = ?"
        ))
        .bind(external_id)
        .fetch_optional(self.db.pool())
        .await?;
        Ok(item)
    }

    /// Updates an item's status (and optionally its last error) inside an
    /// open session.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ItemNotFound`] when the row does not exist.
    pub async fn update_item_status_in(
        conn: &mut SqliteConnection,
        id: i64,
        status: ItemStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query(
            r"UPDATE items
              SET status = ?,
                  error_message = COALESCE(?, error_message),
                  updated_at = datetime('now')
              WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(error_message)
        .bind(id)
        .execute(conn)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::ItemNotFound(id));
        }
        Ok(())
    }

    /// Merges detail metadata into an item row, filling only missing fields
    /// unless the incoming value is present.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ItemNotFound`] when the row does not exist.
    pub async fn apply_item_detail_in(
        conn: &mut SqliteConnection,
        id: i64,
        detail: &ItemDetail,
    ) -> Result<()> {
        let result = sqlx::query(
            r"UPDATE items
              SET subtitle = COALESCE(?, subtitle),
                  author = COALESCE(?, author),
                  publisher = COALESCE(?, publisher),
                  publish_date = COALESCE(?, publish_date),
                  isbn = COALESCE(?, isbn),
                  description = COALESCE(?, description),
                  updated_at = datetime('now')
              WHERE id = ?",
        )
        .bind(&detail.subtitle)
        .bind(&detail.author)
        .bind(&detail.publisher)
        .bind(&detail.publish_date)
        .bind(&detail.isbn)
        .bind(&detail.description)
        .bind(id)
        .execute(conn)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::ItemNotFound(id));
        }
        Ok(())
    }

    /// Lists items in a single status, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on query failure.
    pub async fn items_by_status(
        &self,
        status: ItemStatus,
        limit: Option<i64>,
    ) -> Result<Vec<Item>> {
        self.items_with_status_in(&[status], limit).await
    }

    /// Lists items whose status is in the given set, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on query failure.
    pub async fn items_with_status_in(
        &self,
        statuses: &[ItemStatus],
        limit: Option<i64>,
    ) -> Result<Vec<Item>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let mut sql = format!(
            "SELECT {ITEM_COLUMNS} FROM items WHERE status IN ({}) ORDER BY updated_at ASC",
            item_status_list(statuses)
        );
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        let items = sqlx::query_as::<_, Item>(&sql)
            .fetch_all(self.db.pool())
            .await?;
        Ok(items)
    }

    /// Lists items in the given statuses whose last update is older than the
    /// cutoff.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on query failure.
    pub async fn items_stuck_since(
        &self,
        statuses: &[ItemStatus],
        older_than_minutes: i64,
    ) -> Result<Vec<Item>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM items
             WHERE status IN ({}) AND updated_at < datetime('now', ?)",
            item_status_list(statuses)
        );
        let items = sqlx::query_as::<_, Item>(&sql)
            .bind(format!("-{older_than_minutes} minutes"))
            .fetch_all(self.db.pool())
            .await?;
        Ok(items)
    }

    /// Returns `(status, count)` pairs for all items.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on query failure.
    pub async fn status_histogram(&self) -> Result<Vec<(String, i64)>> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM items GROUP BY status")
            .fetch_all(self.db.pool())
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get::<String, _>("status"), row.get::<i64, _>("n")))
            .collect())
    }

    // ==================== Status history ====================

    /// Appends a status history row inside an open session.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on insert failure.
    #[allow(clippy::too_many_arguments)]
    pub async fn insert_history_in(
        conn: &mut SqliteConnection,
        item_id: i64,
        old_status: Option<ItemStatus>,
        new_status: ItemStatus,
        change_reason: Option<&str>,
        error_message: Option<&str>,
        processing_time: Option<f64>,
        retry_count: i64,
    ) -> Result<()> {
        sqlx::query(
            r"INSERT INTO status_history
              (item_id, old_status, new_status, change_reason, error_message,
               processing_time, retry_count)
              VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(item_id)
        .bind(old_status.map(|s| s.as_str()))
        .bind(new_status.as_str())
        .bind(change_reason)
        .bind(error_message)
        .bind(processing_time)
        .bind(retry_count)
        .execute(conn)
        .await?;
        Ok(())
    }

    /// Most recent history rows, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on query failure.
    pub async fn recent_history(&self, limit: i64) -> Result<Vec<StatusHistoryEntry>> {
        let rows = sqlx::query_as::<_, StatusHistoryEntry>(
            r"SELECT id, item_id, old_status, new_status, change_reason, error_message,
                     processing_time, retry_count, created_at
              FROM status_history ORDER BY id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(self.db.pool())
        .await?;
        Ok(rows)
    }

    /// Full history for one item in insertion order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on query failure.
    pub async fn history_for_item(&self, item_id: i64) -> Result<Vec<StatusHistoryEntry>> {
        let rows = sqlx::query_as::<_, StatusHistoryEntry>(
            r"SELECT id, item_id, old_status, new_status, change_reason, error_message,
                     processing_time, retry_count, created_at
              FROM status_history WHERE item_id = ? ORDER BY id ASC",
        )
        .bind(item_id)
        .fetch_all(self.db.pool())
        .await?;
        Ok(rows)
    }

    // ==================== Search results ====================

    /// Inserts a search candidate, deduplicating against existing rows.
    ///
    /// Dedup key is `(item_id, external_id)` when the candidate carries an
    /// external id, else the composite `(item_id, title, authors[, isbn])`.
    /// A duplicate refreshes the stored external id (when previously missing)
    /// and the timestamp instead of inserting.
    ///
    /// Returns `true` when a new row was inserted.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on query failure.
    pub async fn upsert_search_result_in(
        conn: &mut SqliteConnection,
        result: &NewSearchResult<'_>,
    ) -> Result<bool> {
        let external_id = result.external_id.filter(|id| !id.trim().is_empty());

        let mut existing: Option<i64> = None;
        if let Some(ext) = external_id {
            existing = sqlx::query_scalar::<_, i64>(
                "SELECT id FROM search_results WHERE item_id = ? AND external_id = ?",
            )
            .bind(result.item_id)
            .bind(ext)
            .fetch_optional(&mut *conn)
            .await?;
        }

        if existing.is_none() && !result.title.trim().is_empty() {
            let isbn = result.isbn.filter(|v| !v.trim().is_empty());
            let mut sql = String::from(
                "SELECT id FROM search_results
                 WHERE item_id = ? AND title = ? AND COALESCE(authors, '') = ?",
            );
            if isbn.is_some() {
                sql.push_str(" AND COALESCE(isbn, '') = ?");
            }
            let mut query = sqlx::query_scalar::<_, i64>(&sql)
                .bind(result.item_id)
                .bind(result.title)
                .bind(result.authors.unwrap_or(""));
            if let Some(isbn) = isbn {
                query = query.bind(isbn);
            }
            existing = query.fetch_optional(&mut *conn).await?;
        }

        if let Some(id) = existing {
            sqlx::query(
                r"UPDATE search_results
                  SET external_id = CASE
                          WHEN external_id IS NULL OR external_id = '' THEN COALESCE(?, external_id)
                          ELSE external_id
                      END,
                      updated_at = datetime('now')
                  WHERE id = ?",
            )
            .bind(external_id)
            .bind(id)
            .execute(conn)
            .await?;
            return Ok(false);
        }

        sqlx::query(
            r"INSERT INTO search_results
              (item_id, external_id, title, authors, publisher, year, language, isbn,
               extension, size_bytes, url, download_url, match_score, raw_json)
              VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(result.item_id)
        .bind(external_id)
        .bind(result.title)
        .bind(result.authors)
        .bind(result.publisher)
        .bind(result.year)
        .bind(result.language)
        .bind(result.isbn)
        .bind(result.extension)
        .bind(result.size_bytes)
        .bind(result.url)
        .bind(result.download_url)
        .bind(result.match_score)
        .bind(result.raw_json)
        .execute(conn)
        .await?;
        Ok(true)
    }

    /// All available candidates for an item, best score first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on query failure.
    pub async fn search_results_for_item_in(
        conn: &mut SqliteConnection,
        item_id: i64,
    ) -> Result<Vec<SearchResult>> {
        let rows = sqlx::query_as::<_, SearchResult>(
            r"SELECT id, item_id, external_id, title, authors, publisher, year, language,
                     isbn, extension, size_bytes, url, download_url, match_score,
                     is_available, raw_json, created_at, updated_at
              FROM search_results
              WHERE item_id = ? AND is_available = 1
              ORDER BY match_score DESC, id ASC",
        )
        .bind(item_id)
        .fetch_all(conn)
        .await?;
        Ok(rows)
    }

    /// Fetches one candidate row by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on query failure.
    pub async fn search_result_by_id_in(
        conn: &mut SqliteConnection,
        id: i64,
    ) -> Result<Option<SearchResult>> {
        let row = sqlx::query_as::<_, SearchResult>(
            r"SELECT id, item_id, external_id, title, authors, publisher, year, language,
                     isbn, extension, size_bytes, url, download_url, match_score,
                     is_available, raw_json, created_at, updated_at
              FROM search_results WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(conn)
        .await?;
        Ok(row)
    }

    /// Number of persisted candidates for an item.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on query failure.
    pub async fn count_search_results_in(
        conn: &mut SqliteConnection,
        item_id: i64,
    ) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM search_results WHERE item_id = ?")
                .bind(item_id)
                .fetch_one(conn)
                .await?;
        Ok(count)
    }

    // ==================== Download queue ====================

    /// The chosen-best-match entry for an item, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on query failure.
    pub async fn queue_entry_for_item_in(
        conn: &mut SqliteConnection,
        item_id: i64,
    ) -> Result<Option<QueueEntry>> {
        let row = sqlx::query_as::<_, QueueEntry>(
            r"SELECT id, item_id, search_result_id, download_url, priority, status,
                     error_message, retry_count, created_at, updated_at
              FROM download_queue WHERE item_id = ?",
        )
        .bind(item_id)
        .fetch_optional(conn)
        .await?;
        Ok(row)
    }

    /// Inserts the chosen best match for an item.
    ///
    /// The unique index on `item_id` makes this a no-op when an entry
    /// already exists. Returns `true` when a row was inserted.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on insert failure.
    pub async fn insert_queue_entry_in(
        conn: &mut SqliteConnection,
        item_id: i64,
        search_result_id: i64,
        download_url: &str,
        priority: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r"INSERT INTO download_queue (item_id, search_result_id, download_url, priority)
              VALUES (?, ?, ?, ?)
              ON CONFLICT(item_id) DO NOTHING",
        )
        .bind(item_id)
        .bind(search_result_id)
        .bind(download_url)
        .bind(priority)
        .execute(conn)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Flips a queue entry's status, optionally recording an error and
    /// bumping the retry counter.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on update failure.
    pub async fn update_queue_entry_in(
        conn: &mut SqliteConnection,
        entry_id: i64,
        status: QueueEntryStatus,
        error_message: Option<&str>,
        bump_retry: bool,
    ) -> Result<()> {
        sqlx::query(
            r"UPDATE download_queue
              SET status = ?,
                  error_message = COALESCE(?, error_message),
                  retry_count = retry_count + ?,
                  updated_at = datetime('now')
              WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(error_message)
        .bind(i64::from(bump_retry))
        .bind(entry_id)
        .execute(conn)
        .await?;
        Ok(())
    }

    // ==================== Download records ====================

    /// Persists the outcome of a download attempt.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on insert failure.
    pub async fn insert_download_record_in(
        conn: &mut SqliteConnection,
        record: &NewDownloadRecord<'_>,
    ) -> Result<i64> {
        let result = sqlx::query(
            r"INSERT INTO download_records
              (item_id, external_id, file_format, file_size, file_path, download_url,
               status, error_message)
              VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.item_id)
        .bind(record.external_id)
        .bind(record.file_format)
        .bind(record.file_size)
        .bind(record.file_path)
        .bind(record.download_url)
        .bind(record.status)
        .bind(record.error_message)
        .execute(conn)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// The latest successful download record for an item, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on query failure.
    pub async fn successful_record_for_item_in(
        conn: &mut SqliteConnection,
        item_id: i64,
    ) -> Result<Option<DownloadRecord>> {
        let row = sqlx::query_as::<_, DownloadRecord>(
            r"SELECT id, item_id, external_id, file_format, file_size, file_path,
                     download_url, library_id, status, error_message, created_at, updated_at
              FROM download_records
              WHERE item_id = ? AND status = 'success'
              ORDER BY id DESC LIMIT 1",
        )
        .bind(item_id)
        .fetch_optional(conn)
        .await?;
        Ok(row)
    }

    /// Back-fills the library id once the upload stage has ingested the file.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on update failure.
    pub async fn set_record_library_id_in(
        conn: &mut SqliteConnection,
        record_id: i64,
        library_id: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE download_records SET library_id = ?, updated_at = datetime('now') WHERE id = ?",
        )
        .bind(library_id)
        .bind(record_id)
        .execute(conn)
        .await?;
        Ok(())
    }

    // ==================== Engine flags ====================

    /// Records a stage's pause state for the status surface.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on write failure.
    pub async fn set_stage_flag(
        &self,
        stage: Stage,
        paused: bool,
        reason: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r"INSERT INTO stage_flags (stage, paused, pause_reason, updated_at)
              VALUES (?, ?, ?, datetime('now'))
              ON CONFLICT(stage) DO UPDATE SET
                  paused = excluded.paused,
                  pause_reason = excluded.pause_reason,
                  updated_at = datetime('now')",
        )
        .bind(stage.as_str())
        .bind(paused)
        .bind(reason)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// All recorded stage flags.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on query failure.
    pub async fn stage_flags(&self) -> Result<Vec<StageFlag>> {
        let rows = sqlx::query_as::<_, StageFlag>(
            "SELECT stage, paused, pause_reason, updated_at FROM stage_flags ORDER BY stage",
        )
        .fetch_all(self.db.pool())
        .await?;
        Ok(rows)
    }

    /// Drops every stage flag; run once at engine startup since pauses do
    /// not outlive the process that set them.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on delete failure.
    pub async fn clear_stage_flags(&self) -> Result<()> {
        sqlx::query("DELETE FROM stage_flags")
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    /// Mirrors the latest quota reading into the store.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on write failure.
    pub async fn save_quota_state(
        &self,
        remaining: i64,
        daily_limit: i64,
        next_reset: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r"INSERT INTO quota_state (id, remaining, daily_limit, next_reset, checked_at)
              VALUES (1, ?, ?, ?, datetime('now'))
              ON CONFLICT(id) DO UPDATE SET
                  remaining = excluded.remaining,
                  daily_limit = excluded.daily_limit,
                  next_reset = excluded.next_reset,
                  checked_at = datetime('now')",
        )
        .bind(remaining)
        .bind(daily_limit)
        .bind(next_reset)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// The last mirrored quota reading, if any engine ever recorded one.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on query failure.
    pub async fn quota_state(&self) -> Result<Option<QuotaStateRow>> {
        let row = sqlx::query_as::<_, QuotaStateRow>(
            "SELECT remaining, daily_limit, next_reset, checked_at FROM quota_state WHERE id = 1",
        )
        .fetch_optional(self.db.pool())
        .await?;
        Ok(row)
    }

    // ==================== Processing tasks ====================

    /// Finds an open (queued or active) task for an (item, stage) pair.
    ///
    /// The scheduler uses this to keep the single-flight invariant: at most
    /// one non-terminal task per (item, stage).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on query failure.
    pub async fn find_open_task(&self, item_id: i64, stage: Stage) -> Result<Option<i64>> {
        let id = sqlx::query_scalar::<_, i64>(
            r"SELECT id FROM processing_tasks
              WHERE item_id = ? AND stage = ? AND status IN ('queued', 'active')
              LIMIT 1",
        )
        .bind(item_id)
        .bind(stage.as_str())
        .fetch_optional(self.db.pool())
        .await?;
        Ok(id)
    }

    /// Inserts a queued task row.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on insert failure.
    #[instrument(skip(self, task_data))]
    pub async fn insert_task(
        &self,
        item_id: i64,
        stage: Stage,
        priority: i64,
        max_retries: i64,
        delay_seconds: u64,
        task_data: Option<&str>,
    ) -> Result<i64> {
        let result = sqlx::query(
            r"INSERT INTO processing_tasks
              (item_id, stage, status, priority, max_retries, task_data, next_retry_at)
              VALUES (?, ?, 'queued', ?, ?, ?, datetime('now', ?))",
        )
        .bind(item_id)
        .bind(stage.as_str())
        .bind(priority)
        .bind(max_retries)
        .bind(task_data)
        .bind(format!("+{delay_seconds} seconds"))
        .execute(self.db.pool())
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Marks a task active and stamps `started_at`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::TaskNotFound`] when the row does not exist.
    pub async fn mark_task_active(&self, task_id: i64) -> Result<()> {
        let result = sqlx::query(
            r"UPDATE processing_tasks
              SET status = 'active', started_at = datetime('now'), updated_at = datetime('now')
              WHERE id = ?",
        )
        .bind(task_id)
        .execute(self.db.pool())
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::TaskNotFound(task_id));
        }
        Ok(())
    }

    /// Moves a task to a terminal status and stamps `completed_at`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::TaskNotFound`] when the row does not exist.
    pub async fn mark_task_terminal(
        &self,
        task_id: i64,
        status: TaskStatus,
        error_message: Option<&str>,
        error_kind: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query(
            r"UPDATE processing_tasks
              SET status = ?,
                  error_message = COALESCE(?, error_message),
                  error_kind = COALESCE(?, error_kind),
                  completed_at = datetime('now'),
                  updated_at = datetime('now')
              WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(error_message)
        .bind(error_kind)
        .bind(task_id)
        .execute(self.db.pool())
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::TaskNotFound(task_id));
        }
        Ok(())
    }

    /// Pushes a task back to queued with an updated retry counter and the
    /// next eligible run time.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::TaskNotFound`] when the row does not exist.
    pub async fn requeue_task(
        &self,
        task_id: i64,
        retry_count: i64,
        delay_seconds: u64,
        error_message: Option<&str>,
        error_kind: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query(
            r"UPDATE processing_tasks
              SET status = 'queued',
                  retry_count = ?,
                  next_retry_at = datetime('now', ?),
                  error_message = COALESCE(?, error_message),
                  error_kind = COALESCE(?, error_kind),
                  updated_at = datetime('now')
              WHERE id = ?",
        )
        .bind(retry_count)
        .bind(format!("+{delay_seconds} seconds"))
        .bind(error_message)
        .bind(error_kind)
        .bind(task_id)
        .execute(self.db.pool())
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::TaskNotFound(task_id));
        }
        Ok(())
    }

    /// All tasks whose status is in the given set.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on query failure.
    pub async fn tasks_with_status_in(&self, statuses: &[TaskStatus]) -> Result<Vec<TaskRow>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM processing_tasks WHERE status IN ({}) ORDER BY id ASC",
            task_status_list(statuses)
        );
        let rows = sqlx::query_as::<_, TaskRow>(&sql)
            .fetch_all(self.db.pool())
            .await?;
        Ok(rows)
    }

    /// Queued task rows with the seconds remaining until each is due.
    ///
    /// Used to rebuild the in-memory heap after a restart; a negative
    /// remainder means the task is already due.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on query failure.
    pub async fn queued_tasks_with_remaining_delay(&self) -> Result<Vec<(TaskRow, i64)>> {
        let rows = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {TASK_COLUMNS} FROM processing_tasks WHERE status = 'queued' ORDER BY id ASC"
        ))
        .fetch_all(self.db.pool())
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let remaining: Option<i64> = sqlx::query_scalar(
                r"SELECT CAST((julianday(next_retry_at) - julianday('now')) * 86400 AS INTEGER)
                  FROM processing_tasks WHERE id = ?",
            )
            .bind(row.id)
            .fetch_one(self.db.pool())
            .await?;
            out.push((row, remaining.unwrap_or(0)));
        }
        Ok(out)
    }

    /// Fetches a single task row.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on query failure.
    pub async fn get_task(&self, task_id: i64) -> Result<Option<TaskRow>> {
        let row = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {TASK_COLUMNS} FROM processing_tasks WHERE id = ?"
        ))
        .bind(task_id)
        .fetch_optional(self.db.pool())
        .await?;
        Ok(row)
    }

    /// Cancels the given task rows.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on update failure.
    pub async fn cancel_tasks(&self, task_ids: &[i64], reason: &str) -> Result<u64> {
        if task_ids.is_empty() {
            return Ok(0);
        }
        let ids = task_ids
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        let result = sqlx::query(&format!(
            r"UPDATE processing_tasks
              SET status = 'cancelled', error_message = ?, completed_at = datetime('now'),
                  updated_at = datetime('now')
              WHERE id IN ({ids})"
        ))
        .bind(reason)
        .execute(self.db.pool())
        .await?;
        Ok(result.rows_affected())
    }

    /// Garbage-collects terminal task rows.
    ///
    /// Deletes completed/cancelled rows older than `completed_hours` and
    /// failed rows older than `failed_hours` whose retries are exhausted.
    /// Returns the number of rows removed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on delete failure.
    #[instrument(skip(self))]
    pub async fn delete_expired_tasks(
        &self,
        completed_hours: i64,
        failed_hours: i64,
    ) -> Result<u64> {
        let completed = sqlx::query(
            r"DELETE FROM processing_tasks
              WHERE status IN ('completed', 'cancelled', 'skipped')
                AND updated_at < datetime('now', ?)",
        )
        .bind(format!("-{completed_hours} hours"))
        .execute(self.db.pool())
        .await?;

        let failed = sqlx::query(
            r"DELETE FROM processing_tasks
              WHERE status = 'failed'
                AND updated_at < datetime('now', ?)
                AND retry_count >= max_retries",
        )
        .bind(format!("-{failed_hours} hours"))
        .execute(self.db.pool())
        .await?;

        Ok(completed.rows_affected() + failed.rows_affected())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    async fn test_store() -> Store {
        let db = Database::in_memory().await.unwrap();
        Store::new(db)
    }

    fn new_item(title: &str, external_id: &str) -> NewItem {
        NewItem {
            title: title.to_string(),
            author: Some("Frank Herbert".to_string()),
            external_id: Some(external_id.to_string()),
            source_url: None,
        }
    }

    // ==================== Item Tests ====================

    #[tokio::test]
    async fn test_insert_item_starts_new_with_history() {
        let store = test_store().await;
        let id = store.insert_item(&new_item("Dune", "x1")).await.unwrap();

        let item = store.get_item(id).await.unwrap().unwrap();
        assert_eq!(item.status(), ItemStatus::New);

        let history = store.history_for_item(id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].old_status(), None);
        assert_eq!(history[0].new_status(), Some(ItemStatus::New));
    }

    #[tokio::test]
    async fn test_get_item_by_external_id() {
        let store = test_store().await;
        let id = store.insert_item(&new_item("Dune", "x1")).await.unwrap();

        let found = store.get_item_by_external_id("x1").await.unwrap().unwrap();
        assert_eq!(found.id, id);
        assert!(store.get_item_by_external_id("x2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_item_status_in_missing_item_errors() {
        let store = test_store().await;
        let mut tx = store.begin().await.unwrap();
        let result =
            Store::update_item_status_in(&mut tx, 999, ItemStatus::DetailComplete, None).await;
        assert!(matches!(result, Err(StoreError::ItemNotFound(999))));
    }

    #[tokio::test]
    async fn test_apply_item_detail_fills_fields() {
        let store = test_store().await;
        let id = store.insert_item(&new_item("Dune", "x1")).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        Store::apply_item_detail_in(
            &mut tx,
            id,
            &ItemDetail {
                publisher: Some("Chilton".to_string()),
                publish_date: Some("1965".to_string()),
                isbn: Some("9780441013593".to_string()),
                ..ItemDetail::default()
            },
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();

        let item = store.get_item(id).await.unwrap().unwrap();
        assert_eq!(item.publisher.as_deref(), Some("Chilton"));
        assert_eq!(item.isbn.as_deref(), Some("9780441013593"));
        // Existing author survives the COALESCE merge
        assert_eq!(item.author.as_deref(), Some("Frank Herbert"));
    }

    #[tokio::test]
    async fn test_status_histogram_groups_by_status() {
        let store = test_store().await;
        store.insert_item(&new_item("A", "a")).await.unwrap();
        store.insert_item(&new_item("B", "b")).await.unwrap();

        let histogram = store.status_histogram().await.unwrap();
        assert_eq!(histogram, vec![("new".to_string(), 2)]);
    }

    #[tokio::test]
    async fn test_items_stuck_since_filters_by_age() {
        let store = test_store().await;
        let id = store.insert_item(&new_item("Dune", "x1")).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        Store::update_item_status_in(&mut tx, id, ItemStatus::DetailFetching, None)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        // Fresh rows are not stuck
        let stuck = store
            .items_stuck_since(&[ItemStatus::DetailFetching], 30)
            .await
            .unwrap();
        assert!(stuck.is_empty());

        // Age the row artificially
        sqlx::query("UPDATE items SET updated_at = datetime('now', '-2 hours') WHERE id = ?")
            .bind(id)
            .execute(store.database().pool())
            .await
            .unwrap();

        let stuck = store
            .items_stuck_since(&[ItemStatus::DetailFetching], 30)
            .await
            .unwrap();
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].id, id);
    }

    // ==================== Search Result Tests ====================

    fn candidate<'a>(item_id: i64, external_id: Option<&'a str>, title: &'a str) -> NewSearchResult<'a> {
        NewSearchResult {
            item_id,
            external_id,
            title,
            authors: Some("Frank Herbert"),
            extension: Some("epub"),
            match_score: 0.9,
            ..NewSearchResult::default()
        }
    }

    #[tokio::test]
    async fn test_upsert_search_result_dedupes_by_external_id() {
        let store = test_store().await;
        let id = store.insert_item(&new_item("Dune", "x1")).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        assert!(
            Store::upsert_search_result_in(&mut tx, &candidate(id, Some("z9"), "Dune"))
                .await
                .unwrap()
        );
        assert!(
            !Store::upsert_search_result_in(&mut tx, &candidate(id, Some("z9"), "Dune (reissue)"))
                .await
                .unwrap()
        );
        let rows = Store::search_results_for_item_in(&mut tx, id).await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_upsert_search_result_composite_key_backfills_external_id() {
        let store = test_store().await;
        let id = store.insert_item(&new_item("Dune", "x1")).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        // First seen without an external id
        assert!(
            Store::upsert_search_result_in(&mut tx, &candidate(id, None, "Dune"))
                .await
                .unwrap()
        );
        // Same title/authors arrives with an id: refresh, don't insert
        assert!(
            !Store::upsert_search_result_in(&mut tx, &candidate(id, Some("z9"), "Dune"))
                .await
                .unwrap()
        );
        let rows = Store::search_results_for_item_in(&mut tx, id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].external_id.as_deref(), Some("z9"));
    }

    #[tokio::test]
    async fn test_search_results_ordered_by_score() {
        let store = test_store().await;
        let id = store.insert_item(&new_item("Dune", "x1")).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let mut low = candidate(id, Some("a"), "Dune-ish");
        low.match_score = 0.4;
        let mut high = candidate(id, Some("b"), "Dune");
        high.match_score = 0.95;
        Store::upsert_search_result_in(&mut tx, &low).await.unwrap();
        Store::upsert_search_result_in(&mut tx, &high).await.unwrap();

        let rows = Store::search_results_for_item_in(&mut tx, id).await.unwrap();
        assert_eq!(rows[0].external_id.as_deref(), Some("b"));
    }

    // ==================== Download Queue Tests ====================

    #[tokio::test]
    async fn test_queue_entry_unique_per_item() {
        let store = test_store().await;
        let id = store.insert_item(&new_item("Dune", "x1")).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        Store::upsert_search_result_in(&mut tx, &candidate(id, Some("z9"), "Dune"))
            .await
            .unwrap();
        let result_id = Store::search_results_for_item_in(&mut tx, id).await.unwrap()[0].id;

        assert!(
            Store::insert_queue_entry_in(&mut tx, id, result_id, "https://repo/dl/z9", 90)
                .await
                .unwrap()
        );
        assert!(
            !Store::insert_queue_entry_in(&mut tx, id, result_id, "https://repo/dl/z9", 95)
                .await
                .unwrap()
        );

        let entry = Store::queue_entry_for_item_in(&mut tx, id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.priority, 90);
        assert_eq!(entry.status(), QueueEntryStatus::Queued);
    }

    #[tokio::test]
    async fn test_queue_entry_status_transitions_and_retry_bump() {
        let store = test_store().await;
        let id = store.insert_item(&new_item("Dune", "x1")).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        Store::upsert_search_result_in(&mut tx, &candidate(id, Some("z9"), "Dune"))
            .await
            .unwrap();
        let result_id = Store::search_results_for_item_in(&mut tx, id).await.unwrap()[0].id;
        Store::insert_queue_entry_in(&mut tx, id, result_id, "https://repo/dl/z9", 90)
            .await
            .unwrap();
        let entry = Store::queue_entry_for_item_in(&mut tx, id)
            .await
            .unwrap()
            .unwrap();

        Store::update_queue_entry_in(&mut tx, entry.id, QueueEntryStatus::Downloading, None, false)
            .await
            .unwrap();
        Store::update_queue_entry_in(
            &mut tx,
            entry.id,
            QueueEntryStatus::Failed,
            Some("timeout"),
            true,
        )
        .await
        .unwrap();

        let entry = Store::queue_entry_for_item_in(&mut tx, id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.status(), QueueEntryStatus::Failed);
        assert_eq!(entry.retry_count, 1);
        assert_eq!(entry.error_message.as_deref(), Some("timeout"));
    }

    // ==================== Download Record Tests ====================

    #[tokio::test]
    async fn test_download_record_roundtrip_and_library_backfill() {
        let store = test_store().await;
        let id = store.insert_item(&new_item("Dune", "x1")).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let record_id = Store::insert_download_record_in(
            &mut tx,
            &NewDownloadRecord {
                item_id: id,
                external_id: Some("z9"),
                file_format: Some("epub"),
                file_size: Some(10 * 1024 * 1024),
                file_path: Some("/data/dune.epub"),
                status: "success",
                ..NewDownloadRecord::default()
            },
        )
        .await
        .unwrap();
        Store::set_record_library_id_in(&mut tx, record_id, 77)
            .await
            .unwrap();

        let record = Store::successful_record_for_item_in(&mut tx, id)
            .await
            .unwrap()
            .unwrap();
        assert!(record.is_success());
        assert_eq!(record.library_id, Some(77));
        assert_eq!(record.file_path.as_deref(), Some("/data/dune.epub"));
    }

    // ==================== Engine Flag Tests ====================

    #[tokio::test]
    async fn test_stage_flags_roundtrip_and_clear() {
        let store = test_store().await;

        store
            .set_stage_flag(Stage::Download, true, Some("quota exhausted"))
            .await
            .unwrap();
        // Upsert replaces instead of duplicating
        store
            .set_stage_flag(Stage::Download, true, Some("auth error: HTTP 403"))
            .await
            .unwrap();
        store.set_stage_flag(Stage::Detail, false, None).await.unwrap();

        let flags = store.stage_flags().await.unwrap();
        assert_eq!(flags.len(), 2);
        let download = flags.iter().find(|f| f.stage == "download").unwrap();
        assert!(download.paused);
        assert_eq!(download.pause_reason.as_deref(), Some("auth error: HTTP 403"));

        store.clear_stage_flags().await.unwrap();
        assert!(store.stage_flags().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_quota_state_single_row_upsert() {
        let store = test_store().await;
        assert!(store.quota_state().await.unwrap().is_none());

        store.save_quota_state(3, 10, None).await.unwrap();
        store
            .save_quota_state(0, 10, Some("2026-08-02T00:00:00Z"))
            .await
            .unwrap();

        let state = store.quota_state().await.unwrap().unwrap();
        assert_eq!(state.remaining, 0);
        assert_eq!(state.daily_limit, 10);
        assert_eq!(state.next_reset.as_deref(), Some("2026-08-02T00:00:00Z"));
    }

    // ==================== Task Tests ====================

    #[tokio::test]
    async fn test_task_lifecycle_mirrors_to_row() {
        let store = test_store().await;
        let id = store.insert_item(&new_item("Dune", "x1")).await.unwrap();

        let task_id = store
            .insert_task(id, Stage::Detail, 5, 3, 0, None)
            .await
            .unwrap();
        assert_eq!(store.find_open_task(id, Stage::Detail).await.unwrap(), Some(task_id));

        store.mark_task_active(task_id).await.unwrap();
        let task = store.get_task(task_id).await.unwrap().unwrap();
        assert_eq!(task.status(), TaskStatus::Active);
        assert!(task.started_at.is_some());

        store
            .mark_task_terminal(task_id, TaskStatus::Completed, None, None)
            .await
            .unwrap();
        let task = store.get_task(task_id).await.unwrap().unwrap();
        assert_eq!(task.status(), TaskStatus::Completed);
        assert!(task.completed_at.is_some());
        assert_eq!(store.find_open_task(id, Stage::Detail).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_requeue_task_updates_retry_count() {
        let store = test_store().await;
        let id = store.insert_item(&new_item("Dune", "x1")).await.unwrap();
        let task_id = store
            .insert_task(id, Stage::Search, 5, 3, 0, None)
            .await
            .unwrap();

        store
            .requeue_task(task_id, 2, 60, Some("timeout"), Some("network_timeout"))
            .await
            .unwrap();

        let task = store.get_task(task_id).await.unwrap().unwrap();
        assert_eq!(task.status(), TaskStatus::Queued);
        assert_eq!(task.retry_count, 2);
        assert_eq!(task.error_kind.as_deref(), Some("network_timeout"));
        assert!(task.next_retry_at.is_some());
    }

    #[tokio::test]
    async fn test_cancel_tasks_bulk() {
        let store = test_store().await;
        let id = store.insert_item(&new_item("Dune", "x1")).await.unwrap();
        let t1 = store.insert_task(id, Stage::Detail, 5, 3, 0, None).await.unwrap();
        let t2 = store.insert_task(id, Stage::Search, 5, 3, 0, None).await.unwrap();

        let cancelled = store
            .cancel_tasks(&[t1, t2], "engine shutting down")
            .await
            .unwrap();
        assert_eq!(cancelled, 2);

        let open = store
            .tasks_with_status_in(&[TaskStatus::Queued, TaskStatus::Active])
            .await
            .unwrap();
        assert!(open.is_empty());
    }

    #[tokio::test]
    async fn test_delete_expired_tasks_respects_cutoffs() {
        let store = test_store().await;
        let id = store.insert_item(&new_item("Dune", "x1")).await.unwrap();
        let done = store.insert_task(id, Stage::Detail, 5, 3, 0, None).await.unwrap();
        let failed = store.insert_task(id, Stage::Search, 5, 3, 0, None).await.unwrap();

        store
            .mark_task_terminal(done, TaskStatus::Completed, None, None)
            .await
            .unwrap();
        store
            .requeue_task(failed, 3, 0, Some("boom"), None)
            .await
            .unwrap();
        store
            .mark_task_terminal(failed, TaskStatus::Failed, Some("boom"), None)
            .await
            .unwrap();

        // Nothing old enough yet
        assert_eq!(store.delete_expired_tasks(2, 24).await.unwrap(), 0);

        sqlx::query("UPDATE processing_tasks SET updated_at = datetime('now', '-3 hours')")
            .execute(store.database().pool())
            .await
            .unwrap();

        // Completed passes the 2h cutoff; failed still inside 24h
        assert_eq!(store.delete_expired_tasks(2, 24).await.unwrap(), 1);

        sqlx::query("UPDATE processing_tasks SET updated_at = datetime('now', '-25 hours')")
            .execute(store.database().pool())
            .await
            .unwrap();

        // Failed row with exhausted retries now collected too
        assert_eq!(store.delete_expired_tasks(2, 24).await.unwrap(), 1);
    }
}
