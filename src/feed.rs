//! Feeder: pulls the external want-to-read list into the store.
//!
//! Unseen entries (deduplicated by external id) are inserted as `NEW`
//! items and an initial detail task is scheduled for each. Invoked once
//! by `run-once` and periodically by the daemon.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::error::EngineError;
use crate::scheduler::{ScheduleRequest, TaskPriority};
use crate::sources::ListSource;
use crate::store::{NewItem, Stage, Store};

/// Summary of one feed pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FeedSummary {
    /// Entries on the list.
    pub discovered: usize,
    /// New items inserted and scheduled.
    pub inserted: usize,
    /// Entries already known.
    pub already_known: usize,
}

/// Inserts list entries and schedules their first stage.
pub struct Feeder {
    store: Store,
    source: Arc<dyn ListSource>,
    schedule_tx: mpsc::UnboundedSender<ScheduleRequest>,
}

impl std::fmt::Debug for Feeder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Feeder").finish_non_exhaustive()
    }
}

impl Feeder {
    /// Creates a feeder.
    #[must_use]
    pub fn new(
        store: Store,
        source: Arc<dyn ListSource>,
        schedule_tx: mpsc::UnboundedSender<ScheduleRequest>,
    ) -> Self {
        Self {
            store,
            source,
            schedule_tx,
        }
    }

    /// Fetches the list once and inserts everything unseen.
    ///
    /// # Errors
    ///
    /// Returns the list source's error when the fetch fails, or
    /// [`EngineError::Store`] when inserts fail.
    #[instrument(skip(self))]
    pub async fn feed_once(&self) -> Result<FeedSummary, EngineError> {
        let entries = self.source.fetch_list().await?;
        let mut summary = FeedSummary {
            discovered: entries.len(),
            ..FeedSummary::default()
        };

        for entry in entries {
            if self
                .store
                .get_item_by_external_id(&entry.external_id)
                .await?
                .is_some()
            {
                summary.already_known += 1;
                continue;
            }

            let item_id = self
                .store
                .insert_item(&NewItem {
                    title: entry.title.clone(),
                    author: entry.author.clone(),
                    external_id: Some(entry.external_id.clone()),
                    source_url: entry.url.clone(),
                })
                .await?;
            debug!(item_id, external_id = %entry.external_id, "item discovered");

            if self
                .schedule_tx
                .send(ScheduleRequest {
                    item_id,
                    stage: Stage::Detail,
                    priority: TaskPriority::Normal,
                    delay_seconds: 0,
                })
                .is_err()
            {
                warn!(item_id, "scheduler channel closed, detail task not scheduled");
            }
            summary.inserted += 1;
        }

        info!(
            discovered = summary.discovered,
            inserted = summary.inserted,
            already_known = summary.already_known,
            "feed pass finished"
        );
        Ok(summary)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::sources::ListedBook;
    use crate::store::ItemDetail;
    use async_trait::async_trait;

    struct FakeListSource {
        entries: Vec<ListedBook>,
    }

    #[async_trait]
    impl ListSource for FakeListSource {
        async fn fetch_list(&self) -> Result<Vec<ListedBook>, EngineError> {
            Ok(self.entries.clone())
        }

        async fn fetch_detail(&self, _external_id: &str) -> Result<ItemDetail, EngineError> {
            Ok(ItemDetail::default())
        }
    }

    fn entry(id: &str, title: &str) -> ListedBook {
        ListedBook {
            external_id: id.to_string(),
            title: title.to_string(),
            author: Some("Frank Herbert".to_string()),
            url: None,
        }
    }

    #[tokio::test]
    async fn test_feed_inserts_and_schedules_unseen_entries() {
        let db = Database::in_memory().await.unwrap();
        let store = Store::new(db);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let feeder = Feeder::new(
            store.clone(),
            Arc::new(FakeListSource {
                entries: vec![entry("src-1", "Dune"), entry("src-2", "Solaris")],
            }),
            tx,
        );

        let summary = feeder.feed_once().await.unwrap();
        assert_eq!(summary.discovered, 2);
        assert_eq!(summary.inserted, 2);
        assert_eq!(summary.already_known, 0);

        // Both items exist as NEW and got a detail task request
        assert!(store.get_item_by_external_id("src-1").await.unwrap().is_some());
        assert!(store.get_item_by_external_id("src-2").await.unwrap().is_some());
        let first = rx.try_recv().unwrap();
        assert_eq!(first.stage, Stage::Detail);
        assert_eq!(first.delay_seconds, 0);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_feed_dedupes_known_entries() {
        let db = Database::in_memory().await.unwrap();
        let store = Store::new(db);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let feeder = Feeder::new(
            store.clone(),
            Arc::new(FakeListSource {
                entries: vec![entry("src-1", "Dune")],
            }),
            tx,
        );

        feeder.feed_once().await.unwrap();
        // Drain the first request
        rx.try_recv().unwrap();

        let summary = feeder.feed_once().await.unwrap();
        assert_eq!(summary.inserted, 0);
        assert_eq!(summary.already_known, 1);
        assert!(rx.try_recv().is_err(), "known entries schedule nothing");
    }

    #[tokio::test]
    async fn test_feed_propagates_source_errors() {
        struct BrokenSource;

        #[async_trait]
        impl ListSource for BrokenSource {
            async fn fetch_list(&self) -> Result<Vec<ListedBook>, EngineError> {
                Err(EngineError::auth("HTTP 403 from list source"))
            }
            async fn fetch_detail(&self, _id: &str) -> Result<ItemDetail, EngineError> {
                Ok(ItemDetail::default())
            }
        }

        let db = Database::in_memory().await.unwrap();
        let store = Store::new(db);
        let (tx, _rx) = mpsc::unbounded_channel();
        let feeder = Feeder::new(store, Arc::new(BrokenSource), tx);

        let error = feeder.feed_once().await.unwrap_err();
        assert!(error.is_auth());
    }
}
