//! Domain row types: status history, search results, the download queue,
//! and download records.

use std::fmt;

use sqlx::FromRow;

use super::item::ItemStatus;

/// Append-only record of one status transition.
#[derive(Debug, Clone, FromRow)]
pub struct StatusHistoryEntry {
    pub id: i64,
    pub item_id: i64,
    /// Previous status; `None` for the initial insert.
    pub old_status: Option<String>,
    pub new_status: String,
    pub change_reason: Option<String>,
    pub error_message: Option<String>,
    /// Handler wall time in seconds, when the transition closed a stage run.
    pub processing_time: Option<f64>,
    pub retry_count: i64,
    pub created_at: String,
}

impl StatusHistoryEntry {
    /// Parsed old status, if present and recognized.
    #[must_use]
    pub fn old_status(&self) -> Option<ItemStatus> {
        self.old_status.as_deref().and_then(|s| s.parse().ok())
    }

    /// Parsed new status, if recognized.
    #[must_use]
    pub fn new_status(&self) -> Option<ItemStatus> {
        self.new_status.parse().ok()
    }
}

/// One candidate hit from the remote repository search.
#[derive(Debug, Clone, FromRow)]
pub struct SearchResult {
    pub id: i64,
    pub item_id: i64,
    /// Identifier on the remote repository; may be back-filled later.
    pub external_id: Option<String>,
    pub title: String,
    /// Author list joined with `;;`.
    pub authors: Option<String>,
    pub publisher: Option<String>,
    pub year: Option<String>,
    pub language: Option<String>,
    pub isbn: Option<String>,
    /// File extension, lowercased (epub, mobi, ...).
    pub extension: Option<String>,
    pub size_bytes: Option<i64>,
    /// Candidate page URL.
    pub url: Option<String>,
    /// Short-lived direct download URL.
    pub download_url: Option<String>,
    /// Match score against the source record, in [0, 1].
    pub match_score: f64,
    pub is_available: bool,
    /// Raw candidate payload as returned by the repository.
    pub raw_json: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Fields for persisting one search candidate.
#[derive(Debug, Clone, Default)]
pub struct NewSearchResult<'a> {
    pub item_id: i64,
    pub external_id: Option<&'a str>,
    pub title: &'a str,
    pub authors: Option<&'a str>,
    pub publisher: Option<&'a str>,
    pub year: Option<&'a str>,
    pub language: Option<&'a str>,
    pub isbn: Option<&'a str>,
    pub extension: Option<&'a str>,
    pub size_bytes: Option<i64>,
    pub url: Option<&'a str>,
    pub download_url: Option<&'a str>,
    pub match_score: f64,
    pub raw_json: Option<&'a str>,
}

/// Status of a download queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueEntryStatus {
    Queued,
    Downloading,
    Completed,
    Failed,
}

impl QueueEntryStatus {
    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Downloading => "downloading",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for QueueEntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for QueueEntryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "downloading" => Ok(Self::Downloading),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("invalid queue entry status: {s}")),
        }
    }
}

/// The chosen best match for an item, ready to be downloaded.
///
/// At most one row exists per item (unique index on `item_id`).
#[derive(Debug, Clone, FromRow)]
pub struct QueueEntry {
    pub id: i64,
    pub item_id: i64,
    pub search_result_id: i64,
    pub download_url: String,
    /// Higher downloads first; derived from the match score.
    pub priority: i64,
    #[sqlx(rename = "status")]
    pub status_str: String,
    pub error_message: Option<String>,
    pub retry_count: i64,
    pub created_at: String,
    pub updated_at: String,
}

impl QueueEntry {
    /// Returns the parsed status enum.
    ///
    /// Falls back to `Queued` if the status string is invalid.
    #[must_use]
    pub fn status(&self) -> QueueEntryStatus {
        self.status_str.parse().unwrap_or(QueueEntryStatus::Queued)
    }
}

/// Persisted outcome of one download attempt.
///
/// Successful records are immutable once written, except for the library id
/// back-filled by the upload stage.
#[derive(Debug, Clone, FromRow)]
pub struct DownloadRecord {
    pub id: i64,
    pub item_id: i64,
    pub external_id: Option<String>,
    pub file_format: Option<String>,
    pub file_size: Option<i64>,
    pub file_path: Option<String>,
    pub download_url: Option<String>,
    /// Library id returned by the ingest service after upload.
    pub library_id: Option<i64>,
    #[sqlx(rename = "status")]
    pub status_str: String,
    pub error_message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl DownloadRecord {
    /// `true` when this record represents a successful transfer.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status_str == "success"
    }
}

/// Persisted pause state for one stage.
///
/// Written by the pipeline whenever a stage is paused or resumed, so
/// one-shot commands can report gating state without a running engine.
#[derive(Debug, Clone, FromRow)]
pub struct StageFlag {
    pub stage: String,
    pub paused: bool,
    pub pause_reason: Option<String>,
    pub updated_at: String,
}

/// Last quota reading mirrored into the store by the quota watcher.
#[derive(Debug, Clone, FromRow)]
pub struct QuotaStateRow {
    pub remaining: i64,
    pub daily_limit: i64,
    pub next_reset: Option<String>,
    pub checked_at: String,
}

/// Fields for persisting one download attempt outcome.
#[derive(Debug, Clone, Default)]
pub struct NewDownloadRecord<'a> {
    pub item_id: i64,
    pub external_id: Option<&'a str>,
    pub file_format: Option<&'a str>,
    pub file_size: Option<i64>,
    pub file_path: Option<&'a str>,
    pub download_url: Option<&'a str>,
    /// "success" or "failed".
    pub status: &'a str,
    pub error_message: Option<&'a str>,
}
