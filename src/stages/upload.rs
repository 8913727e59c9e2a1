//! Upload stage: ships the downloaded artifact to the library ingest and
//! back-fills identifiers from the ingest response.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::sqlite::SqliteConnection;
use tracing::{info, instrument};

use super::{StageHandler, StageOutcome};
use crate::error::EngineError;
use crate::sources::{LibraryIngest, UploadMetadata};
use crate::store::{Item, ItemDetail, ItemStatus, Stage, Store};

/// Ingests downloaded files into the personal library.
pub struct UploadStage {
    library: Arc<dyn LibraryIngest>,
}

impl UploadStage {
    /// Creates the upload stage.
    #[must_use]
    pub fn new(library: Arc<dyn LibraryIngest>) -> Self {
        Self { library }
    }
}

#[async_trait]
impl StageHandler for UploadStage {
    fn stage(&self) -> Stage {
        Stage::Upload
    }

    #[instrument(skip(self, item, conn), fields(item_id = item.id, title = %item.title))]
    async fn process(
        &self,
        item: &mut Item,
        conn: &mut SqliteConnection,
    ) -> Result<StageOutcome, EngineError> {
        let Some(record) = Store::successful_record_for_item_in(conn, item.id).await? else {
            return Err(EngineError::data(
                "data_missing",
                format!("item {} has no successful download to upload", item.id),
            ));
        };
        let Some(path) = record.file_path.clone() else {
            return Err(EngineError::data(
                "data_missing",
                format!("download record {} has no file path", record.id),
            ));
        };
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(EngineError::data(
                "data_missing",
                format!("downloaded file is gone: {path}"),
            ));
        }

        let metadata = UploadMetadata {
            title: item.title.clone(),
            author: item.author.clone(),
            isbn: item.isbn.clone(),
            external_id: item.external_id.clone(),
        };
        let receipt = self.library.upload(Path::new(&path), &metadata).await?;

        Store::set_record_library_id_in(conn, record.id, receipt.library_id).await?;

        // Back-fill identifiers the ingest service extracted from the file
        if item.isbn.is_none()
            && let Some(isbn) = receipt.isbn.clone()
        {
            Store::apply_item_detail_in(
                conn,
                item.id,
                &ItemDetail {
                    isbn: Some(isbn.clone()),
                    ..ItemDetail::default()
                },
            )
            .await?;
            item.isbn = Some(isbn);
        }

        info!(
            item_id = item.id,
            library_id = receipt.library_id,
            "uploaded to library"
        );
        Ok(StageOutcome::Advanced)
    }

    fn next_state(&self, outcome: StageOutcome) -> ItemStatus {
        match outcome {
            StageOutcome::Advanced => ItemStatus::UploadComplete,
            StageOutcome::SkippedExists => ItemStatus::SkippedExists,
            StageOutcome::NoMatch | StageOutcome::QuotaDeferred => ItemStatus::UploadFailed,
        }
    }
}
