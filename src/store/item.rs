//! Item row types, lifecycle states, and pipeline stages.

use std::fmt;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Lifecycle status of an item as it moves through the pipeline.
///
/// Statuses are grouped per stage: collection, search, download, upload,
/// and the terminal set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    /// Freshly discovered from the want-to-read list.
    New,
    /// Detail fetch in progress.
    DetailFetching,
    /// Detail fetch finished.
    DetailComplete,
    /// Waiting for the search stage.
    SearchQueued,
    /// Remote search in progress.
    SearchActive,
    /// Search finished with a queued best match.
    SearchComplete,
    /// Search finished but the daily quota was exhausted.
    SearchCompleteQuotaExhausted,
    /// No candidate cleared the match threshold.
    SearchNoResults,
    /// Waiting for the download stage.
    DownloadQueued,
    /// Transfer in progress.
    DownloadActive,
    /// File on disk, ready for upload.
    DownloadComplete,
    /// Download attempt failed.
    DownloadFailed,
    /// Waiting for the upload stage.
    UploadQueued,
    /// Library ingest in progress.
    UploadActive,
    /// Ingest finished.
    UploadComplete,
    /// Ingest attempt failed.
    UploadFailed,
    /// Fully processed.
    Completed,
    /// Already present in the library; nothing to do.
    SkippedExists,
    /// Gave up; requires an explicit reset to re-enter the pipeline.
    FailedPermanent,
}

impl ItemStatus {
    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::DetailFetching => "detail_fetching",
            Self::DetailComplete => "detail_complete",
            Self::SearchQueued => "search_queued",
            Self::SearchActive => "search_active",
            Self::SearchComplete => "search_complete",
            Self::SearchCompleteQuotaExhausted => "search_complete_quota_exhausted",
            Self::SearchNoResults => "search_no_results",
            Self::DownloadQueued => "download_queued",
            Self::DownloadActive => "download_active",
            Self::DownloadComplete => "download_complete",
            Self::DownloadFailed => "download_failed",
            Self::UploadQueued => "upload_queued",
            Self::UploadActive => "upload_active",
            Self::UploadComplete => "upload_complete",
            Self::UploadFailed => "upload_failed",
            Self::Completed => "completed",
            Self::SkippedExists => "skipped_exists",
            Self::FailedPermanent => "failed_permanent",
        }
    }

    /// Returns `true` for the strictly terminal statuses.
    ///
    /// `FAILED_PERMANENT` counts as terminal even though it has an explicit
    /// re-open path.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::SkippedExists | Self::FailedPermanent
        )
    }

    /// Returns `true` for in-flight statuses that indicate a worker owned
    /// the item when it was last written.
    #[must_use]
    pub fn is_active_family(&self) -> bool {
        matches!(
            self,
            Self::DetailFetching | Self::SearchActive | Self::DownloadActive | Self::UploadActive
        )
    }

    /// Returns `true` for `*_queued` statuses (including `NEW`, the queued
    /// form of the detail stage).
    #[must_use]
    pub fn is_queued_family(&self) -> bool {
        matches!(
            self,
            Self::New | Self::SearchQueued | Self::DownloadQueued | Self::UploadQueued
        )
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ItemStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(Self::New),
            "detail_fetching" => Ok(Self::DetailFetching),
            "detail_complete" => Ok(Self::DetailComplete),
            "search_queued" => Ok(Self::SearchQueued),
            "search_active" => Ok(Self::SearchActive),
            "search_complete" => Ok(Self::SearchComplete),
            "search_complete_quota_exhausted" => Ok(Self::SearchCompleteQuotaExhausted),
            "search_no_results" => Ok(Self::SearchNoResults),
            "download_queued" => Ok(Self::DownloadQueued),
            "download_active" => Ok(Self::DownloadActive),
            "download_complete" => Ok(Self::DownloadComplete),
            "download_failed" => Ok(Self::DownloadFailed),
            "upload_queued" => Ok(Self::UploadQueued),
            "upload_active" => Ok(Self::UploadActive),
            "upload_complete" => Ok(Self::UploadComplete),
            "upload_failed" => Ok(Self::UploadFailed),
            "completed" => Ok(Self::Completed),
            "skipped_exists" => Ok(Self::SkippedExists),
            "failed_permanent" => Ok(Self::FailedPermanent),
            _ => Err(format!("invalid item status: {s}")),
        }
    }
}

/// One of the four processing stages an item passes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Detail,
    Search,
    Download,
    Upload,
}

impl Stage {
    /// All stages in pipeline order.
    pub const ALL: [Stage; 4] = [Self::Detail, Self::Search, Self::Download, Self::Upload];

    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Detail => "detail",
            Self::Search => "search",
            Self::Download => "download",
            Self::Upload => "upload",
        }
    }

    /// Item statuses for which a task of this stage may legally run.
    ///
    /// Active statuses are included so a re-dispatched task can pick up an
    /// item that was mid-flight when the process died.
    #[must_use]
    pub fn acceptable_states(&self) -> &'static [ItemStatus] {
        match self {
            Self::Detail => &[ItemStatus::New, ItemStatus::DetailFetching],
            Self::Search => &[
                ItemStatus::DetailComplete,
                ItemStatus::SearchQueued,
                ItemStatus::SearchActive,
            ],
            Self::Download => &[
                ItemStatus::SearchComplete,
                ItemStatus::SearchCompleteQuotaExhausted,
                ItemStatus::DownloadQueued,
                ItemStatus::DownloadActive,
            ],
            Self::Upload => &[
                ItemStatus::DownloadComplete,
                ItemStatus::UploadQueued,
                ItemStatus::UploadActive,
            ],
        }
    }

    /// The in-flight status a worker moves the item to while processing.
    #[must_use]
    pub fn active_state(&self) -> ItemStatus {
        match self {
            Self::Detail => ItemStatus::DetailFetching,
            Self::Search => ItemStatus::SearchActive,
            Self::Download => ItemStatus::DownloadActive,
            Self::Upload => ItemStatus::UploadActive,
        }
    }

    /// The queued status an item returns to when a recoverable failure or a
    /// crash interrupts this stage.
    #[must_use]
    pub fn retry_state(&self) -> ItemStatus {
        match self {
            Self::Detail => ItemStatus::New,
            Self::Search => ItemStatus::SearchQueued,
            Self::Download => ItemStatus::DownloadQueued,
            Self::Upload => ItemStatus::UploadQueued,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "detail" => Ok(Self::Detail),
            "search" => Ok(Self::Search),
            "download" => Ok(Self::Download),
            "upload" => Ok(Self::Upload),
            _ => Err(format!("invalid stage: {s}")),
        }
    }
}

/// A single item (one e-book) moving through the pipeline.
#[derive(Debug, Clone, FromRow)]
pub struct Item {
    /// Unique identifier.
    pub id: i64,
    /// Title as discovered on the want-to-read list.
    pub title: String,
    /// Subtitle back-filled by the detail stage.
    pub subtitle: Option<String>,
    /// Author name.
    pub author: Option<String>,
    /// Publisher back-filled by the detail stage.
    pub publisher: Option<String>,
    /// Publish date string (free form, year is extracted for scoring).
    pub publish_date: Option<String>,
    /// ISBN back-filled by the detail stage or the ingest response.
    pub isbn: Option<String>,
    /// Stable identifier on the source list.
    pub external_id: Option<String>,
    /// Page URL on the source list.
    pub source_url: Option<String>,
    /// Long description back-filled by the detail stage.
    pub description: Option<String>,
    /// Current lifecycle status (stored as text, parsed via `status()`).
    #[sqlx(rename = "status")]
    pub status_str: String,
    /// Last error message recorded against this item.
    pub error_message: Option<String>,
    /// When the item was created.
    pub created_at: String,
    /// When the item was last updated.
    pub updated_at: String,
}

impl Item {
    /// Returns the parsed status enum.
    ///
    /// Falls back to `New` if the status string is invalid.
    #[must_use]
    pub fn status(&self) -> ItemStatus {
        self.status_str.parse().unwrap_or(ItemStatus::New)
    }
}

impl fmt::Display for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Item {{ id: {}, title: {}, status: {} }}",
            self.id,
            self.title,
            self.status()
        )
    }
}

/// Fields for inserting a freshly discovered item.
#[derive(Debug, Clone, Default)]
pub struct NewItem {
    pub title: String,
    pub author: Option<String>,
    pub external_id: Option<String>,
    pub source_url: Option<String>,
}

/// Metadata merged into an item row by the detail stage.
#[derive(Debug, Clone, Default)]
pub struct ItemDetail {
    pub subtitle: Option<String>,
    pub author: Option<String>,
    pub publisher: Option<String>,
    pub publish_date: Option<String>,
    pub isbn: Option<String>,
    pub description: Option<String>,
}
