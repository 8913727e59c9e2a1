//! Download stage: quota-aware transfer of the chosen best match.
//!
//! Before acting the stage asks the quota manager; with no allowance the
//! item defers to `SEARCH_COMPLETE_QUOTA_EXHAUSTED` without consuming
//! quota or a slot. With quota, one unit is consumed, the queue entry
//! walks queued -> downloading -> completed, and a download record is
//! written.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::sqlite::SqliteConnection;
use tracing::{debug, info, instrument, warn};

use super::{StageHandler, StageOutcome};
use crate::error::EngineError;
use crate::quota::QuotaManager;
use crate::sources::{BookDownloader, DownloadCandidate};
use crate::store::{
    Item, ItemStatus, NewDownloadRecord, QueueEntryStatus, Stage, Store,
};

/// Transfers the chosen candidate under the daily quota.
pub struct DownloadStage {
    downloader: Arc<dyn BookDownloader>,
    quota: Arc<QuotaManager>,
    download_dir: PathBuf,
}

impl DownloadStage {
    /// Creates the download stage.
    #[must_use]
    pub fn new(
        downloader: Arc<dyn BookDownloader>,
        quota: Arc<QuotaManager>,
        download_dir: PathBuf,
    ) -> Self {
        Self {
            downloader,
            quota,
            download_dir,
        }
    }

    /// Quota gate: `Ok(true)` means proceed, `Ok(false)` means defer.
    ///
    /// A cold or expired cache triggers a refresh; a failed refresh is
    /// treated as "assume ok" so the engine never stalls on the quota
    /// service being down.
    async fn quota_allows(&self) -> bool {
        if self.quota.has_quota_available() {
            return true;
        }
        if !self.quota.cache_is_stale() {
            return false;
        }
        match self.quota.get_current_quota(false).await {
            Ok(quota) => quota.has_quota_available(),
            Err(e) => {
                warn!(error = %e, "quota refresh failed, assuming allowance");
                true
            }
        }
    }
}

#[async_trait]
impl StageHandler for DownloadStage {
    fn stage(&self) -> Stage {
        Stage::Download
    }

    #[instrument(skip(self, item, conn), fields(item_id = item.id, title = %item.title))]
    async fn process(
        &self,
        item: &mut Item,
        conn: &mut SqliteConnection,
    ) -> Result<StageOutcome, EngineError> {
        if !self.quota_allows().await {
            info!(item_id = item.id, "no quota, deferring download");
            return Ok(StageOutcome::QuotaDeferred);
        }

        // Re-runs after a crash may find the file already on disk
        if let Some(record) = Store::successful_record_for_item_in(conn, item.id).await?
            && let Some(path) = record.file_path.as_deref()
            && tokio::fs::try_exists(path).await.unwrap_or(false)
        {
            info!(item_id = item.id, path, "file already downloaded");
            return Ok(StageOutcome::Advanced);
        }

        let Some(entry) = Store::queue_entry_for_item_in(conn, item.id).await? else {
            return Err(EngineError::not_found(format!(
                "no download queue entry for item {}",
                item.id
            )));
        };
        if matches!(
            entry.status(),
            QueueEntryStatus::Completed | QueueEntryStatus::Failed
        ) {
            debug!(item_id = item.id, status = %entry.status(), "resetting finished queue entry");
        }

        let chosen = Store::search_result_by_id_in(conn, entry.search_result_id)
            .await?
            .ok_or_else(|| {
                EngineError::data(
                    "data_missing",
                    format!("queue entry {} references a missing candidate", entry.id),
                )
            })?;

        // Local decrement; the remote service remains the source of truth
        if !self.quota.consume_quota(1) {
            info!(item_id = item.id, "quota consumed elsewhere, deferring download");
            return Ok(StageOutcome::QuotaDeferred);
        }

        Store::update_queue_entry_in(conn, entry.id, QueueEntryStatus::Downloading, None, false)
            .await?;

        let candidate = DownloadCandidate {
            external_id: chosen.external_id.clone(),
            title: chosen.title.clone(),
            authors: chosen.authors.clone(),
            extension: chosen.extension.clone(),
            download_url: entry.download_url.clone(),
        };

        match self.downloader.download(&candidate, &self.download_dir).await {
            Ok(file) => {
                let path = file.path.to_string_lossy().into_owned();
                Store::insert_download_record_in(
                    conn,
                    &NewDownloadRecord {
                        item_id: item.id,
                        external_id: chosen.external_id.as_deref(),
                        file_format: chosen.extension.as_deref(),
                        file_size: Some(file.file_size),
                        file_path: Some(&path),
                        download_url: Some(&entry.download_url),
                        status: "success",
                        error_message: None,
                    },
                )
                .await?;
                Store::update_queue_entry_in(
                    conn,
                    entry.id,
                    QueueEntryStatus::Completed,
                    None,
                    false,
                )
                .await?;
                info!(
                    item_id = item.id,
                    path,
                    bytes = file.file_size,
                    "download finished"
                );
                Ok(StageOutcome::Advanced)
            }
            Err(e) => {
                let message = e.to_string();
                Store::insert_download_record_in(
                    conn,
                    &NewDownloadRecord {
                        item_id: item.id,
                        external_id: chosen.external_id.as_deref(),
                        file_format: chosen.extension.as_deref(),
                        download_url: Some(&entry.download_url),
                        status: "failed",
                        error_message: Some(&message),
                        ..NewDownloadRecord::default()
                    },
                )
                .await?;
                Store::update_queue_entry_in(
                    conn,
                    entry.id,
                    QueueEntryStatus::Failed,
                    Some(&message),
                    true,
                )
                .await?;
                Err(e)
            }
        }
    }

    fn next_state(&self, outcome: StageOutcome) -> ItemStatus {
        match outcome {
            StageOutcome::Advanced => ItemStatus::DownloadComplete,
            StageOutcome::QuotaDeferred => ItemStatus::SearchCompleteQuotaExhausted,
            StageOutcome::NoMatch => ItemStatus::DownloadFailed,
            StageOutcome::SkippedExists => ItemStatus::SkippedExists,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::sources::{DownloadedFile, QuotaSnapshot, QuotaSource};
    use crate::store::{NewItem, NewSearchResult};
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Mutex;

    struct FakeQuotaSource {
        remaining: AtomicI64,
    }

    #[async_trait]
    impl QuotaSource for FakeQuotaSource {
        async fn get_quota(&self) -> Result<QuotaSnapshot, EngineError> {
            Ok(QuotaSnapshot {
                remaining: self.remaining.load(Ordering::SeqCst),
                daily_limit: 10,
                next_reset: None,
            })
        }
    }

    struct FakeDownloader {
        results: Mutex<Vec<Result<(), EngineError>>>,
        dir: tempfile::TempDir,
    }

    impl FakeDownloader {
        fn ok() -> Arc<Self> {
            Self::with(vec![Ok(())])
        }
        fn with(results: Vec<Result<(), EngineError>>) -> Arc<Self> {
            Arc::new(Self {
                results: Mutex::new(results),
                dir: tempfile::tempdir().unwrap(),
            })
        }
    }

    #[async_trait]
    impl BookDownloader for FakeDownloader {
        async fn download(
            &self,
            candidate: &DownloadCandidate,
            _dest_dir: &std::path::Path,
        ) -> Result<DownloadedFile, EngineError> {
            let mut results = self.results.lock().unwrap();
            let next = if results.is_empty() {
                Ok(())
            } else {
                results.remove(0)
            };
            next?;
            let path = self.dir.path().join(format!("{}.epub", candidate.title));
            std::fs::write(&path, vec![0u8; 1024]).unwrap();
            Ok(DownloadedFile {
                path,
                file_size: 1024,
            })
        }
    }

    struct Fixture {
        store: Store,
        item_id: i64,
        quota_source: Arc<FakeQuotaSource>,
        quota: Arc<QuotaManager>,
    }

    async fn fixture(remaining: i64) -> Fixture {
        let db = Database::in_memory().await.unwrap();
        let store = Store::new(db);
        let item_id = store
            .insert_item(&NewItem {
                title: "Dune".to_string(),
                external_id: Some("src-1".to_string()),
                ..NewItem::default()
            })
            .await
            .unwrap();

        // Seed a chosen candidate + queue entry
        let mut tx = store.begin().await.unwrap();
        Store::upsert_search_result_in(
            &mut tx,
            &NewSearchResult {
                item_id,
                external_id: Some("z9"),
                title: "Dune",
                authors: Some("Frank Herbert"),
                extension: Some("epub"),
                match_score: 0.92,
                download_url: Some("https://repo.example/dl/z9"),
                ..NewSearchResult::default()
            },
        )
        .await
        .unwrap();
        let result_id = Store::search_results_for_item_in(&mut tx, item_id).await.unwrap()[0].id;
        Store::insert_queue_entry_in(&mut tx, item_id, result_id, "https://repo.example/dl/z9", 92)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let quota_source = Arc::new(FakeQuotaSource {
            remaining: AtomicI64::new(remaining),
        });
        let quota = Arc::new(QuotaManager::new(quota_source.clone(), 5));
        Fixture {
            store,
            item_id,
            quota_source,
            quota,
        }
    }

    async fn run(
        stage: &DownloadStage,
        store: &Store,
        id: i64,
    ) -> Result<StageOutcome, EngineError> {
        let mut tx = store.begin().await.unwrap();
        let mut item = Store::get_item_in(&mut tx, id).await.unwrap().unwrap();
        let outcome = stage.process(&mut item, &mut tx).await;
        tx.commit().await.unwrap();
        outcome
    }

    #[tokio::test]
    async fn test_download_happy_path_writes_record_and_completes_queue() {
        let f = fixture(5).await;
        let stage = DownloadStage::new(FakeDownloader::ok(), f.quota.clone(), PathBuf::from("."));

        let outcome = run(&stage, &f.store, f.item_id).await.unwrap();
        assert_eq!(outcome, StageOutcome::Advanced);

        let mut tx = f.store.begin().await.unwrap();
        let record = Store::successful_record_for_item_in(&mut tx, f.item_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.file_size, Some(1024));
        assert_eq!(record.external_id.as_deref(), Some("z9"));

        let entry = Store::queue_entry_for_item_in(&mut tx, f.item_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.status(), QueueEntryStatus::Completed);

        // One unit consumed locally
        assert_eq!(f.quota.snapshot().unwrap().remaining, 4);
    }

    #[tokio::test]
    async fn test_no_quota_defers_without_consuming() {
        let f = fixture(0).await;
        let stage = DownloadStage::new(FakeDownloader::ok(), f.quota.clone(), PathBuf::from("."));

        let outcome = run(&stage, &f.store, f.item_id).await.unwrap();
        assert_eq!(outcome, StageOutcome::QuotaDeferred);
        assert_eq!(
            stage.next_state(outcome),
            ItemStatus::SearchCompleteQuotaExhausted
        );

        // Queue entry untouched, no record written
        let mut tx = f.store.begin().await.unwrap();
        let entry = Store::queue_entry_for_item_in(&mut tx, f.item_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.status(), QueueEntryStatus::Queued);
        assert!(
            Store::successful_record_for_item_in(&mut tx, f.item_id)
                .await
                .unwrap()
                .is_none()
        );
        assert_eq!(f.quota.snapshot().unwrap().remaining, 0);
    }

    #[tokio::test]
    async fn test_quota_recovery_allows_download() {
        let f = fixture(0).await;
        let stage = DownloadStage::new(FakeDownloader::ok(), f.quota.clone(), PathBuf::from("."));

        assert_eq!(
            run(&stage, &f.store, f.item_id).await.unwrap(),
            StageOutcome::QuotaDeferred
        );

        // Remote allowance recovers; force the cache to notice
        f.quota_source.remaining.store(5, Ordering::SeqCst);
        f.quota.reset_cache();

        assert_eq!(
            run(&stage, &f.store, f.item_id).await.unwrap(),
            StageOutcome::Advanced
        );
    }

    #[tokio::test]
    async fn test_failed_transfer_records_failure_and_errors() {
        let f = fixture(5).await;
        let stage = DownloadStage::new(
            FakeDownloader::with(vec![Err(EngineError::network("timeout downloading"))]),
            f.quota.clone(),
            PathBuf::from("."),
        );

        let error = run(&stage, &f.store, f.item_id).await.unwrap_err();
        assert!(matches!(error, EngineError::Network(_)));

        let mut tx = f.store.begin().await.unwrap();
        let entry = Store::queue_entry_for_item_in(&mut tx, f.item_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.status(), QueueEntryStatus::Failed);
        assert_eq!(entry.retry_count, 1);
        assert!(entry.error_message.unwrap().contains("timeout"));
    }

    #[tokio::test]
    async fn test_limit_exhausted_propagates() {
        let f = fixture(5).await;
        let stage = DownloadStage::new(
            FakeDownloader::with(vec![Err(EngineError::DownloadLimitExhausted {
                message: "HTTP 429".to_string(),
                reset_time: Some("3600".to_string()),
            })]),
            f.quota.clone(),
            PathBuf::from("."),
        );

        let error = run(&stage, &f.store, f.item_id).await.unwrap_err();
        assert!(error.is_download_limit());
    }

    #[tokio::test]
    async fn test_missing_queue_entry_is_not_found() {
        let db = Database::in_memory().await.unwrap();
        let store = Store::new(db);
        let item_id = store
            .insert_item(&NewItem {
                title: "No queue".to_string(),
                external_id: Some("src-2".to_string()),
                ..NewItem::default()
            })
            .await
            .unwrap();

        let quota = Arc::new(QuotaManager::new(
            Arc::new(FakeQuotaSource {
                remaining: AtomicI64::new(5),
            }),
            5,
        ));
        let stage = DownloadStage::new(FakeDownloader::ok(), quota, PathBuf::from("."));

        let error = run(&stage, &store, item_id).await.unwrap_err();
        assert!(matches!(error, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_existing_file_short_circuits() {
        let f = fixture(5).await;
        let downloader = FakeDownloader::ok();
        let stage = DownloadStage::new(downloader, f.quota.clone(), PathBuf::from("."));

        assert_eq!(
            run(&stage, &f.store, f.item_id).await.unwrap(),
            StageOutcome::Advanced
        );
        let consumed_after_first = f.quota.snapshot().unwrap().remaining;

        // Second run finds the file and spends nothing
        assert_eq!(
            run(&stage, &f.store, f.item_id).await.unwrap(),
            StageOutcome::Advanced
        );
        assert_eq!(f.quota.snapshot().unwrap().remaining, consumed_after_first);
    }
}
