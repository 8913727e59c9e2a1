//! Detail stage: fetches the per-item detail record from the list source
//! and merges it into the item row.

use async_trait::async_trait;
use sqlx::sqlite::SqliteConnection;
use std::sync::Arc;
use tracing::{debug, instrument};

use super::{StageHandler, StageOutcome};
use crate::error::EngineError;
use crate::sources::ListSource;
use crate::store::{Item, ItemStatus, Stage, Store};

/// Fetches detail metadata for freshly discovered items.
pub struct DetailStage {
    source: Arc<dyn ListSource>,
}

impl DetailStage {
    /// Creates the detail stage over the given list source.
    #[must_use]
    pub fn new(source: Arc<dyn ListSource>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl StageHandler for DetailStage {
    fn stage(&self) -> Stage {
        Stage::Detail
    }

    #[instrument(skip(self, item, conn), fields(item_id = item.id, title = %item.title))]
    async fn process(
        &self,
        item: &mut Item,
        conn: &mut SqliteConnection,
    ) -> Result<StageOutcome, EngineError> {
        let Some(external_id) = item.external_id.clone() else {
            return Err(EngineError::data(
                "data_missing",
                format!("item {} has no external id to fetch detail for", item.id),
            ));
        };

        let detail = self.source.fetch_detail(&external_id).await?;
        Store::apply_item_detail_in(conn, item.id, &detail).await?;

        // Keep the in-memory copy aligned for later stages in this run
        if let Some(author) = detail.author {
            item.author = Some(author);
        }
        if let Some(publisher) = detail.publisher {
            item.publisher = Some(publisher);
        }
        if let Some(publish_date) = detail.publish_date {
            item.publish_date = Some(publish_date);
        }
        if let Some(isbn) = detail.isbn {
            item.isbn = Some(isbn);
        }

        debug!(item_id = item.id, "detail merged");
        Ok(StageOutcome::Advanced)
    }

    fn next_state(&self, outcome: StageOutcome) -> ItemStatus {
        match outcome {
            StageOutcome::Advanced => ItemStatus::DetailComplete,
            StageOutcome::SkippedExists => ItemStatus::SkippedExists,
            // The detail stage produces no other outcomes
            StageOutcome::NoMatch | StageOutcome::QuotaDeferred => ItemStatus::New,
        }
    }
}
