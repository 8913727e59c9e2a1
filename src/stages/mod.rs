//! Stage handlers: detail, search, download, upload.
//!
//! Each stage implements the common [`StageHandler`] contract the
//! pipeline and scheduler are built against: a pure acceptance check, the
//! work itself inside the session the pipeline provides, and the mapping
//! from outcome to the item's next state.

mod detail;
mod download;
mod score;
mod search;
mod upload;

pub use detail::DetailStage;
pub use download::DownloadStage;
pub use score::{match_score, FormatRanker};
pub use search::SearchStage;
pub use upload::UploadStage;

use async_trait::async_trait;
use sqlx::sqlite::SqliteConnection;

use crate::error::EngineError;
use crate::store::{Item, ItemStatus, Stage};

/// How a stage execution ended, when it did not error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    /// The stage did its work; the item advances.
    Advanced,
    /// The library already holds this book; nothing left to do.
    SkippedExists,
    /// No usable candidate or artifact; the item parks in the stage's
    /// no-result state.
    NoMatch,
    /// The daily quota is used up; the item waits for the next window.
    QuotaDeferred,
}

/// The contract every stage implements.
#[async_trait]
pub trait StageHandler: Send + Sync {
    /// Which stage this handler implements.
    fn stage(&self) -> Stage;

    /// Pure check against the freshly-read item state.
    fn can_process(&self, item: &Item) -> bool {
        self.stage().acceptable_states().contains(&item.status())
    }

    /// Does the work. Domain side effects go through `conn`, which the
    /// pipeline commits; state transitions are the pipeline's business.
    async fn process(
        &self,
        item: &mut Item,
        conn: &mut SqliteConnection,
    ) -> Result<StageOutcome, EngineError>;

    /// The post-transition target for an outcome.
    fn next_state(&self, outcome: StageOutcome) -> ItemStatus;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Probe;

    #[async_trait]
    impl StageHandler for Probe {
        fn stage(&self) -> Stage {
            Stage::Search
        }
        async fn process(
            &self,
            _item: &mut Item,
            _conn: &mut SqliteConnection,
        ) -> Result<StageOutcome, EngineError> {
            Ok(StageOutcome::Advanced)
        }
        fn next_state(&self, _outcome: StageOutcome) -> ItemStatus {
            ItemStatus::SearchComplete
        }
    }

    fn item_with_status(status: &str) -> Item {
        Item {
            id: 1,
            title: "Dune".to_string(),
            subtitle: None,
            author: None,
            publisher: None,
            publish_date: None,
            isbn: None,
            external_id: None,
            source_url: None,
            description: None,
            status_str: status.to_string(),
            error_message: None,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    #[test]
    fn test_default_can_process_uses_acceptable_states() {
        let probe = Probe;
        assert!(probe.can_process(&item_with_status("search_queued")));
        assert!(probe.can_process(&item_with_status("detail_complete")));
        assert!(probe.can_process(&item_with_status("search_active")));
        assert!(!probe.can_process(&item_with_status("new")));
        assert!(!probe.can_process(&item_with_status("completed")));
    }
}
