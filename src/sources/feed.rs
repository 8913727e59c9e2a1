//! JSON-file want-to-read feed.
//!
//! Site-specific scrapers live outside the engine; what they produce is a
//! JSON export of the want-to-read list, which this source reads. Each
//! entry carries the list fields plus an optional inline detail record.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, instrument};

use super::{ListSource, ListedBook};
use crate::error::EngineError;
use crate::store::ItemDetail;

#[derive(Debug, Clone, Deserialize)]
struct FeedEntry {
    #[serde(flatten)]
    listed: ListedBook,
    #[serde(default)]
    detail: Option<FeedDetail>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FeedDetail {
    #[serde(default)]
    subtitle: Option<String>,
    #[serde(default)]
    author: Option<String>,
    #[serde(default)]
    publisher: Option<String>,
    #[serde(default)]
    publish_date: Option<String>,
    #[serde(default)]
    isbn: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

impl From<FeedDetail> for ItemDetail {
    fn from(detail: FeedDetail) -> Self {
        Self {
            subtitle: detail.subtitle,
            author: detail.author,
            publisher: detail.publisher,
            publish_date: detail.publish_date,
            isbn: detail.isbn,
            description: detail.description,
        }
    }
}

/// Want-to-read list backed by a JSON export file.
///
/// The file is re-read on every fetch so a daemon picks up list changes
/// without a restart.
#[derive(Debug, Clone)]
pub struct JsonFeedSource {
    path: PathBuf,
}

impl JsonFeedSource {
    /// Creates a feed source over the given JSON file.
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    async fn read_entries(&self) -> Result<Vec<FeedEntry>, EngineError> {
        let raw = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            EngineError::network(format!("feed read failed for {}: {e}", self.path.display()))
        })?;
        serde_json::from_str(&raw)
            .map_err(|e| EngineError::data("data_invalid", format!("feed parse failed: {e}")))
    }
}

#[async_trait]
impl ListSource for JsonFeedSource {
    #[instrument(skip(self), fields(path = %self.path.display()))]
    async fn fetch_list(&self) -> Result<Vec<ListedBook>, EngineError> {
        let entries = self.read_entries().await?;
        debug!(count = entries.len(), "feed loaded");
        Ok(entries.into_iter().map(|e| e.listed).collect())
    }

    async fn fetch_detail(&self, external_id: &str) -> Result<ItemDetail, EngineError> {
        let entries = self.read_entries().await?;
        let entry = entries
            .into_iter()
            .find(|e| e.listed.external_id == external_id)
            .ok_or_else(|| {
                EngineError::not_found(format!("feed entry not found: {external_id}"))
            })?;
        // A list-only entry still advances; the detail record is optional.
        Ok(entry.detail.map(ItemDetail::from).unwrap_or_default())
    }
}
