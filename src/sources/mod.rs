//! External collaborator contracts and the default client implementations.
//!
//! The engine core only depends on the traits defined here; the submodules
//! provide the shipped wiring: a JSON-file feed for the want-to-read list,
//! an HTTP client for the remote e-book repository (search, quota,
//! download), an HTTP client for the library ingest service, and a webhook
//! notifier. Tests substitute mock implementations.

pub mod feed;
pub mod filename;
pub mod http;
pub mod library;
pub mod notify;
pub mod repo;

pub use feed::JsonFeedSource;
pub use http::HttpTransfer;
pub use library::HttpLibraryClient;
pub use notify::WebhookNotifier;
pub use repo::HttpRepoClient;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::store::ItemDetail;

/// One entry on the external want-to-read list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListedBook {
    /// Stable identifier on the source list.
    pub external_id: String,
    pub title: String,
    #[serde(default)]
    pub author: Option<String>,
    /// Page URL on the source list, if any.
    #[serde(default)]
    pub url: Option<String>,
}

/// Parameters for one remote search call.
#[derive(Debug, Clone, Default)]
pub struct SearchQuery {
    pub title: Option<String>,
    pub author: Option<String>,
    pub isbn: Option<String>,
    pub publisher: Option<String>,
}

/// One candidate record returned by the remote repository.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CandidateBook {
    #[serde(default)]
    pub external_id: Option<String>,
    pub title: String,
    /// Author list joined with `;;`.
    #[serde(default)]
    pub authors: Option<String>,
    #[serde(default)]
    pub publisher: Option<String>,
    #[serde(default)]
    pub year: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub isbn: Option<String>,
    #[serde(default)]
    pub extension: Option<String>,
    #[serde(default)]
    pub size_bytes: Option<i64>,
    #[serde(default)]
    pub url: Option<String>,
    /// Short-lived direct download URL.
    #[serde(default)]
    pub download_url: Option<String>,
}

/// What the download stage hands to the downloader.
#[derive(Debug, Clone)]
pub struct DownloadCandidate {
    pub external_id: Option<String>,
    pub title: String,
    pub authors: Option<String>,
    pub extension: Option<String>,
    pub download_url: String,
}

/// A completed transfer.
#[derive(Debug, Clone)]
pub struct DownloadedFile {
    pub path: PathBuf,
    pub file_size: i64,
}

/// Remote allowance as reported by the quota source.
#[derive(Debug, Clone, Deserialize)]
pub struct QuotaSnapshot {
    pub remaining: i64,
    pub daily_limit: i64,
    #[serde(default)]
    pub next_reset: Option<String>,
}

/// Parameters for probing the library for an existing copy.
#[derive(Debug, Clone, Default)]
pub struct LibraryQuery {
    pub title: String,
    pub author: Option<String>,
    pub isbn: Option<String>,
}

/// An existing library entry matched against a query.
#[derive(Debug, Clone, Deserialize)]
pub struct LibraryMatch {
    pub library_id: i64,
    pub title: String,
    /// Match confidence in [0, 1] as judged by the ingest service.
    pub score: f64,
}

/// Metadata sent along with an upload.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UploadMetadata {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub isbn: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
}

/// The ingest service's answer to an upload.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadReceipt {
    pub library_id: i64,
    /// Identifier the ingest service extracted from the file, used to
    /// back-fill missing item metadata.
    #[serde(default)]
    pub isbn: Option<String>,
}

/// Source of list entries and per-entry detail records.
///
/// `fetch_list` returns a finite snapshot of the list; it is not
/// restartable within one fetch. May fail with [`EngineError::Auth`]
/// (treated as auth-family by the pipeline).
#[async_trait]
pub trait ListSource: Send + Sync {
    async fn fetch_list(&self) -> Result<Vec<ListedBook>, EngineError>;

    async fn fetch_detail(&self, external_id: &str) -> Result<ItemDetail, EngineError>;
}

/// Remote e-book repository search.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, query: &SearchQuery) -> Result<Vec<CandidateBook>, EngineError>;
}

/// Remote e-book repository download.
///
/// May fail with [`EngineError::DownloadLimitExhausted`] carrying the
/// remote reset time.
#[async_trait]
pub trait BookDownloader: Send + Sync {
    async fn download(
        &self,
        candidate: &DownloadCandidate,
        dest_dir: &Path,
    ) -> Result<DownloadedFile, EngineError>;
}

/// Library ingest service: existence probe and upload.
#[async_trait]
pub trait LibraryIngest: Send + Sync {
    async fn find_best_match(
        &self,
        query: &LibraryQuery,
    ) -> Result<Option<LibraryMatch>, EngineError>;

    async fn upload(
        &self,
        file: &Path,
        metadata: &UploadMetadata,
    ) -> Result<UploadReceipt, EngineError>;
}

/// Remote daily allowance source.
#[async_trait]
pub trait QuotaSource: Send + Sync {
    async fn get_quota(&self) -> Result<QuotaSnapshot, EngineError>;
}

/// Best-effort, fire-and-forget message sink.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, message: &str);
}

/// A notifier that drops every message; used when no webhook is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn notify(&self, _message: &str) {}
}
