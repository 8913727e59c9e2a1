//! HTTP client for the library ingest service.
//!
//! `find_best_match` probes for an existing copy before any remote search
//! happens; `upload` ships a downloaded file plus metadata and returns the
//! new library id (with any identifiers the service extracted, used for
//! back-fill).

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, instrument};

use super::{LibraryIngest, LibraryMatch, LibraryQuery, UploadMetadata, UploadReceipt};
use crate::error::EngineError;

#[derive(Debug, Deserialize)]
struct MatchResponse {
    #[serde(rename = "match")]
    best: Option<LibraryMatch>,
}

/// Library ingest client over a configured base URL.
#[derive(Debug, Clone)]
pub struct HttpLibraryClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpLibraryClient {
    /// Creates a client for the ingest service at `base_url`.
    #[must_use]
    pub fn new(base_url: &str, timeout_secs: u64) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(timeout_secs))
            .timeout(Duration::from_secs(timeout_secs.max(1) * 10))
            .build()
            .unwrap_or_default();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    fn map_transport(url: &str, error: &reqwest::Error) -> EngineError {
        if error.is_timeout() {
            EngineError::network(format!("timeout calling {url}"))
        } else {
            EngineError::network(format!("connection error calling {url}: {error}"))
        }
    }
}

#[async_trait]
impl LibraryIngest for HttpLibraryClient {
    #[instrument(skip(self, query), fields(title = %query.title))]
    async fn find_best_match(
        &self,
        query: &LibraryQuery,
    ) -> Result<Option<LibraryMatch>, EngineError> {
        let url = format!("{}/api/match", self.base_url);
        let mut params: Vec<(&str, &str)> = vec![("title", query.title.as_str())];
        if let Some(author) = query.author.as_deref() {
            params.push(("author", author));
        }
        if let Some(isbn) = query.isbn.as_deref() {
            params.push(("isbn", isbn));
        }

        let response = self
            .client
            .get(&url)
            .query(&params)
            .send()
            .await
            .map_err(|e| Self::map_transport(&url, &e))?;

        match response.status().as_u16() {
            200 => {
                let parsed: MatchResponse = response.json().await.map_err(|e| {
                    EngineError::data("data_invalid", format!("bad payload from {url}: {e}"))
                })?;
                debug!(matched = parsed.best.is_some(), "library probe finished");
                Ok(parsed.best)
            }
            404 => Ok(None),
            401 | 403 => Err(EngineError::auth(format!("HTTP 403 calling {url}"))),
            status => Err(EngineError::network(format!("HTTP {status} calling {url}"))),
        }
    }

    #[instrument(skip(self, file, metadata), fields(title = %metadata.title))]
    async fn upload(
        &self,
        file: &Path,
        metadata: &UploadMetadata,
    ) -> Result<UploadReceipt, EngineError> {
        let url = format!("{}/api/books", self.base_url);
        let body = tokio::fs::read(file).await?;

        let filename = file
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("upload.bin")
            .to_string();

        let mut params: Vec<(&str, &str)> =
            vec![("title", metadata.title.as_str()), ("filename", &filename)];
        if let Some(author) = metadata.author.as_deref() {
            params.push(("author", author));
        }
        if let Some(isbn) = metadata.isbn.as_deref() {
            params.push(("isbn", isbn));
        }
        if let Some(external_id) = metadata.external_id.as_deref() {
            params.push(("external_id", external_id));
        }

        let response = self
            .client
            .put(&url)
            .query(&params)
            .body(body)
            .send()
            .await
            .map_err(|e| Self::map_transport(&url, &e))?;

        match response.status().as_u16() {
            200 | 201 => response.json::<UploadReceipt>().await.map_err(|e| {
                EngineError::data("data_invalid", format!("bad payload from {url}: {e}"))
            }),
            401 | 403 => Err(EngineError::auth(format!("HTTP 403 calling {url}"))),
            413 => Err(EngineError::data(
                "data_invalid",
                format!("upload rejected as too large by {url}"),
            )),
            status => Err(EngineError::network(format!("HTTP {status} calling {url}"))),
        }
    }
}
