//! HTTP client for the remote e-book repository.
//!
//! Implements the search, download, and quota contracts against a REST
//! surface: `GET /api/search`, `GET /api/limits`, and the per-candidate
//! download URL. The download path reuses [`HttpTransfer`] for streaming
//! and filename handling.

use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, instrument};

use super::filename::template_filename;
use super::{
    BookDownloader, CandidateBook, DownloadCandidate, DownloadedFile, HttpTransfer, QuotaSnapshot,
    QuotaSource, SearchProvider, SearchQuery,
};
use crate::error::EngineError;

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<CandidateBook>,
}

/// Remote repository client over a configured base URL.
#[derive(Debug, Clone)]
pub struct HttpRepoClient {
    base_url: String,
    transfer: HttpTransfer,
}

impl HttpRepoClient {
    /// Creates a client for the repository at `base_url`.
    #[must_use]
    pub fn new(base_url: &str, transfer: HttpTransfer) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            transfer,
        }
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        params: &[(&str, &str)],
    ) -> Result<T, EngineError> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .transfer
            .client()
            .get(&url)
            .query(params)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    EngineError::network(format!("timeout calling {url}"))
                } else {
                    EngineError::network(format!("connection error calling {url}: {e}"))
                }
            })?;

        let status = response.status().as_u16();
        match status {
            200 => response
                .json::<T>()
                .await
                .map_err(|e| EngineError::data("data_invalid", format!("bad payload from {url}: {e}"))),
            401 | 403 => Err(EngineError::auth(format!("HTTP {status} calling {url}"))),
            404 => Err(EngineError::not_found(format!("HTTP 404 calling {url}"))),
            _ => Err(EngineError::network(format!("HTTP {status} calling {url}"))),
        }
    }
}

#[async_trait]
impl SearchProvider for HttpRepoClient {
    #[instrument(skip(self, query), fields(title = query.title.as_deref().unwrap_or("")))]
    async fn search(&self, query: &SearchQuery) -> Result<Vec<CandidateBook>, EngineError> {
        let mut params: Vec<(&str, &str)> = Vec::new();
        if let Some(title) = query.title.as_deref() {
            params.push(("title", title));
        }
        if let Some(author) = query.author.as_deref() {
            params.push(("author", author));
        }
        if let Some(isbn) = query.isbn.as_deref() {
            params.push(("isbn", isbn));
        }
        if let Some(publisher) = query.publisher.as_deref() {
            params.push(("publisher", publisher));
        }

        let response: SearchResponse = self.get_json("/api/search", &params).await?;
        debug!(count = response.results.len(), "search returned");
        Ok(response.results)
    }
}

#[async_trait]
impl QuotaSource for HttpRepoClient {
    async fn get_quota(&self) -> Result<QuotaSnapshot, EngineError> {
        self.get_json("/api/limits", &[]).await
    }
}

#[async_trait]
impl BookDownloader for HttpRepoClient {
    #[instrument(skip(self, candidate, dest_dir), fields(title = %candidate.title))]
    async fn download(
        &self,
        candidate: &DownloadCandidate,
        dest_dir: &Path,
    ) -> Result<DownloadedFile, EngineError> {
        let template = template_filename(
            &candidate.title,
            candidate.authors.as_deref(),
            candidate.extension.as_deref(),
        );
        self.transfer
            .download_to_file(&candidate.download_url, dest_dir, Some(&template))
            .await
    }
}
